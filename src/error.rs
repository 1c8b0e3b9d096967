//! Error types for the OADP Operator

use std::fmt;

use thiserror::Error;

use crate::reconcilers::validator::ValidationError;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error that does not fit a narrower variant
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The DataProtectionApplication (or another CR) failed validation
    #[error("{}", format_validation(.0))]
    InvalidSpec(Vec<ValidationError>),

    /// A referenced object (secret, CloudStorage, BSL) does not exist yet
    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    /// An object we want to own is owned by someone else
    #[error("ownership conflict: {0}")]
    OwnershipConflict(String),

    /// Optimistic concurrency failure (resourceVersion mismatch or create race)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Object not found where one was required
    #[error("not found: {0}")]
    NotFound(String),

    /// Retryable API failure (timeouts, throttling, server errors)
    #[error("transient API error: {0}")]
    Transient(String),

    /// Remote object storage or probe failure
    #[error("provider error: {0}")]
    Provider(String),

    /// Deletion blocked until references clear
    #[error("blocked: {0}")]
    Blocked(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Secret key not found
    #[error("Secret key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Process bootstrap failure
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),

    /// Reconcile aborted by shutdown
    #[error("reconcile cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

/// Machine-readable error classification surfaced in `status.conditions[].reason`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidSpec,
    DependencyMissing,
    OwnershipConflict,
    TransientAPIError,
    ProviderError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSpec => "InvalidSpec",
            ErrorKind::DependencyMissing => "DependencyMissing",
            ErrorKind::OwnershipConflict => "OwnershipConflict",
            ErrorKind::TransientAPIError => "TransientAPIError",
            ErrorKind::ProviderError => "ProviderError",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create a dependency-missing error
    pub fn dependency(msg: impl Into<String>) -> Self {
        Error::DependencyMissing(msg.into())
    }

    /// Create an invalid-spec error carrying a single validation failure
    pub fn invalid(err: ValidationError) -> Self {
        Error::InvalidSpec(vec![err])
    }

    /// Classify the error for status reporting and requeue policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSpec(_) | Error::Config(_) => ErrorKind::InvalidSpec,
            Error::DependencyMissing(_)
            | Error::SecretNotFound(_)
            | Error::SecretKeyNotFound { .. }
            | Error::Blocked(_) => ErrorKind::DependencyMissing,
            Error::OwnershipConflict(_) => ErrorKind::OwnershipConflict,
            Error::Conflict(_) | Error::Transient(_) | Error::Cancelled => {
                ErrorKind::TransientAPIError
            }
            Error::Provider(_) => ErrorKind::ProviderError,
            Error::Kube(e) => classify_kube_error(e),
            Error::Finalizer(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(inner)
                | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner.kind(),
                kube::runtime::finalizer::Error::AddFinalizer(e)
                | kube::runtime::finalizer::Error::RemoveFinalizer(e) => classify_kube_error(e),
                _ => ErrorKind::Internal,
            },
            Error::NotFound(_)
            | Error::Bootstrap(_)
            | Error::Internal(_)
            | Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}

fn classify_kube_error(e: &kube::Error) -> ErrorKind {
    match e {
        kube::Error::Api(resp) if resp.code == 409 || resp.code == 429 || resp.code >= 500 => {
            ErrorKind::TransientAPIError
        }
        kube::Error::Api(resp) if resp.code == 403 || resp.code == 422 => ErrorKind::Internal,
        kube::Error::Api(_) => ErrorKind::Internal,
        _ => ErrorKind::TransientAPIError,
    }
}

fn format_validation(errors: &[ValidationError]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("invalid spec: {}", parts.join("; "))
}
