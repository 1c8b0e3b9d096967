//! Static and cross-field validation of a DataProtectionApplication

use std::collections::BTreeSet;
use std::fmt;

use kube::ResourceExt;

use crate::crd::{
    BackupLocation, CloudStorageProvider, DataProtectionApplication, DefaultPlugin,
    SnapshotLocation,
};

use super::images::{ImageKey, OPERATOR_TYPE_KEY, OPERATOR_TYPE_MTC};
use super::resolver::{location_name, ObservedInputs};

/// Providers with a built-in plugin
pub const KNOWN_PROVIDERS: &[&str] = &["aws", "gcp", "azure"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warning", "error", "fatal", "panic"];
const PULL_POLICIES: &[&str] = &["Always", "IfNotPresent", "Never"];
const LOG_FORMATS: &[&str] = &["text", "json"];

/// Machine-readable sub-kind of an `InvalidSpec` failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvalidSpecKind {
    MissingVeleroConfig,
    MissingBackupLocation,
    MultipleDefaultLocations,
    NoDefaultLocation,
    MissingRegion,
    InvalidLocation,
    UnresolvedCloudStorage,
    PluginNameCollision,
    UnknownSnapshotProvider,
    InvalidProvider,
    MissingProviderConfig,
    MissingPlugin,
    ConflictingPlugins,
    UnsupportedPlugin,
    UnsupportedOverride,
    DuplicateDpa,
    InvalidValue,
}

/// One rejected field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: InvalidSpecKind,
    /// Path of the offending field, e.g. `spec.backupLocations[0].velero.config.region`
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: InvalidSpecKind, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a DPA against its own invariants and the objects it references.
///
/// Returns every violation found, in field order; an empty vector means valid.
pub fn validate(dpa: &DataProtectionApplication, observed: &ObservedInputs) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let spec = &dpa.spec;

    if let Some(other) = &observed.older_dpa {
        errors.push(ValidationError::new(
            InvalidSpecKind::DuplicateDpa,
            "metadata.name",
            format!("only one DataProtectionApplication is allowed per namespace; {other} already exists"),
        ));
    }

    let Some(velero) = spec.velero() else {
        errors.push(ValidationError::new(
            InvalidSpecKind::MissingVeleroConfig,
            "spec.configuration.velero",
            "velero configuration is required",
        ));
        return errors;
    };

    validate_overrides(dpa, &mut errors);
    validate_plugins(dpa, &mut errors);

    if let Some(level) = &velero.log_level {
        if !LOG_LEVELS.contains(&level.as_str()) {
            errors.push(ValidationError::new(
                InvalidSpecKind::InvalidValue,
                "spec.configuration.velero.logLevel",
                format!("invalid log level {level:?}, must be one of {}", LOG_LEVELS.join(", ")),
            ));
        }
    }
    if let Some(policy) = &spec.image_pull_policy {
        if !PULL_POLICIES.contains(&policy.as_str()) {
            errors.push(ValidationError::new(
                InvalidSpecKind::InvalidValue,
                "spec.imagePullPolicy",
                format!("invalid image pull policy {policy:?}"),
            ));
        }
    }
    if let Some(format) = &spec.log_format {
        if !LOG_FORMATS.contains(&format.as_str()) {
            errors.push(ValidationError::new(
                InvalidSpecKind::InvalidValue,
                "spec.logFormat",
                format!("invalid log format {format:?}, must be text or json"),
            ));
        }
    }

    if velero.no_default_backup_location {
        if !spec.backup_locations.is_empty() {
            errors.push(ValidationError::new(
                InvalidSpecKind::InvalidLocation,
                "spec.backupLocations",
                "backupLocations must be empty when noDefaultBackupLocation is set",
            ));
        }
        if spec.backup_images() {
            errors.push(ValidationError::new(
                InvalidSpecKind::InvalidValue,
                "spec.backupImages",
                "backupImages must be false when noDefaultBackupLocation is set",
            ));
        }
    } else if spec.backup_locations.is_empty() {
        errors.push(ValidationError::new(
            InvalidSpecKind::MissingBackupLocation,
            "spec.backupLocations",
            "no backupLocations configured, set noDefaultBackupLocation to run without one",
        ));
    }

    let custom_providers: BTreeSet<&str> =
        velero.custom_plugins.iter().map(|p| p.name.as_str()).collect();

    // explicit names share a namespace with the generated `<dpa>-N` ones
    let dpa_name = dpa.name_any();
    let mut names = BTreeSet::new();
    for (i, location) in spec.backup_locations.iter().enumerate() {
        let name = location_name(&dpa_name, i, location.name.as_ref());
        if !names.insert(name.clone()) {
            errors.push(ValidationError::new(
                InvalidSpecKind::InvalidLocation,
                format!("spec.backupLocations[{i}].name"),
                format!("duplicate backup location name {name:?}"),
            ));
        }
        validate_backup_location(dpa, i, location, &custom_providers, observed, &mut errors);
    }

    let defaults = spec.backup_locations.iter().filter(|l| l.is_default()).count();
    if defaults > 1 {
        errors.push(ValidationError::new(
            InvalidSpecKind::MultipleDefaultLocations,
            "spec.backupLocations",
            format!("only one backup location may be default, found {defaults}"),
        ));
    } else if defaults == 0 && !spec.backup_locations.is_empty() {
        errors.push(ValidationError::new(
            InvalidSpecKind::NoDefaultLocation,
            "spec.backupLocations",
            "no default backupstoragelocations configured, mark one location as default",
        ));
    }

    let mut snapshot_names = BTreeSet::new();
    for (i, location) in spec.snapshot_locations.iter().enumerate() {
        let name = location_name(&dpa_name, i, location.name.as_ref());
        if !snapshot_names.insert(name.clone()) {
            errors.push(ValidationError::new(
                InvalidSpecKind::InvalidLocation,
                format!("spec.snapshotLocations[{i}].name"),
                format!("duplicate snapshot location name {name:?}"),
            ));
        }
        validate_snapshot_location(dpa, i, location, &mut errors);
    }

    errors
}

fn validate_overrides(dpa: &DataProtectionApplication, errors: &mut Vec<ValidationError>) {
    for (key, value) in &dpa.spec.unsupported_overrides {
        let field = format!("spec.unsupportedOverrides.{key}");
        if key == OPERATOR_TYPE_KEY {
            if value != OPERATOR_TYPE_MTC {
                errors.push(ValidationError::new(
                    InvalidSpecKind::UnsupportedOverride,
                    field,
                    format!("only {OPERATOR_TYPE_MTC:?} is supported as operator-type, got {value:?}"),
                ));
            }
        } else if !ImageKey::ALL.iter().any(|k| k.override_key() == key) {
            errors.push(ValidationError::new(
                InvalidSpecKind::UnsupportedOverride,
                field,
                "unknown override key",
            ));
        }
    }
}

fn validate_plugins(dpa: &DataProtectionApplication, errors: &mut Vec<ValidationError>) {
    let Some(velero) = dpa.spec.velero() else {
        return;
    };
    let plugins: BTreeSet<DefaultPlugin> = velero.default_plugins.iter().copied().collect();

    if plugins.contains(&DefaultPlugin::Vsm) {
        errors.push(ValidationError::new(
            InvalidSpecKind::UnsupportedPlugin,
            "spec.configuration.velero.defaultPlugins",
            "the vsm plugin has been removed, use the built-in data mover instead",
        ));
    }
    if plugins.contains(&DefaultPlugin::Aws) && plugins.contains(&DefaultPlugin::LegacyAws) {
        errors.push(ValidationError::new(
            InvalidSpecKind::ConflictingPlugins,
            "spec.configuration.velero.defaultPlugins",
            "aws and legacy-aws plugins cannot both be installed",
        ));
    }
    for (i, custom) in velero.custom_plugins.iter().enumerate() {
        if plugins.iter().any(|p| p.as_str() == custom.name) {
            errors.push(ValidationError::new(
                InvalidSpecKind::PluginNameCollision,
                format!("spec.configuration.velero.customPlugins[{i}].name"),
                format!("custom plugin name {:?} collides with a default plugin", custom.name),
            ));
        }
    }
}

fn validate_backup_location(
    dpa: &DataProtectionApplication,
    i: usize,
    location: &BackupLocation,
    custom_providers: &BTreeSet<&str>,
    observed: &ObservedInputs,
    errors: &mut Vec<ValidationError>,
) {
    let base = format!("spec.backupLocations[{i}]");
    let backup_images = dpa.spec.backup_images();

    match (&location.velero, &location.bucket) {
        (Some(_), Some(_)) | (None, None) => {
            errors.push(ValidationError::new(
                InvalidSpecKind::InvalidLocation,
                base,
                "exactly one of velero or bucket must be set",
            ));
        }
        (Some(bsl), None) => {
            let provider = bsl.provider.as_str();
            if provider.is_empty() {
                errors.push(ValidationError::new(
                    InvalidSpecKind::InvalidProvider,
                    format!("{base}.velero.provider"),
                    "provider is required",
                ));
                return;
            }
            if !KNOWN_PROVIDERS.contains(&provider) && !custom_providers.contains(provider) {
                errors.push(ValidationError::new(
                    InvalidSpecKind::InvalidProvider,
                    format!("{base}.velero.provider"),
                    format!("unknown provider {provider:?}, add a custom plugin to use it"),
                ));
                return;
            }
            let config = |k: &str| bsl.config.get(k).map(String::as_str).unwrap_or("");
            let bucket_field = format!("{base}.velero.objectStorage.bucket");
            match provider {
                "aws" => {
                    if bsl.object_storage.bucket.is_empty() {
                        errors.push(ValidationError::new(
                            InvalidSpecKind::MissingProviderConfig,
                            bucket_field,
                            "bucket name for AWS backupstoragelocation cannot be empty",
                        ));
                    }
                    let prefix_empty =
                        bsl.object_storage.prefix.as_deref().unwrap_or("").is_empty();
                    if backup_images && prefix_empty {
                        errors.push(ValidationError::new(
                            InvalidSpecKind::MissingProviderConfig,
                            format!("{base}.velero.objectStorage.prefix"),
                            "prefix for AWS backupstoragelocation cannot be empty when backing up images",
                        ));
                    }
                    let path_style = parse_bool(config("s3ForcePathStyle")).unwrap_or(false);
                    if backup_images && path_style && config("region").is_empty() {
                        errors.push(ValidationError::new(
                            InvalidSpecKind::MissingRegion,
                            format!("{base}.velero.config.region"),
                            "region for AWS backupstoragelocation cannot be empty when s3ForcePathStyle is true or when backing up images",
                        ));
                    }
                    if !config("s3ForcePathStyle").is_empty()
                        && parse_bool(config("s3ForcePathStyle")).is_none()
                    {
                        errors.push(ValidationError::new(
                            InvalidSpecKind::InvalidValue,
                            format!("{base}.velero.config.s3ForcePathStyle"),
                            "s3ForcePathStyle must be a boolean",
                        ));
                    }
                }
                "azure" => {
                    if bsl.object_storage.bucket.is_empty() {
                        errors.push(ValidationError::new(
                            InvalidSpecKind::MissingProviderConfig,
                            bucket_field,
                            "container name for Azure backupstoragelocation cannot be empty",
                        ));
                    }
                    for key in ["resourceGroup", "storageAccount"] {
                        if config(key).is_empty() {
                            errors.push(ValidationError::new(
                                InvalidSpecKind::MissingProviderConfig,
                                format!("{base}.velero.config.{key}"),
                                format!("{key} for Azure backupstoragelocation cannot be empty"),
                            ));
                        }
                    }
                }
                "gcp" => {
                    if bsl.object_storage.bucket.is_empty() {
                        errors.push(ValidationError::new(
                            InvalidSpecKind::MissingProviderConfig,
                            bucket_field,
                            "bucket name for GCP backupstoragelocation cannot be empty",
                        ));
                    }
                }
                _ => {}
            }
        }
        (None, Some(bucket)) => {
            let name = &bucket.cloud_storage_ref.name;
            match observed.cloud_storages.get(name) {
                None => errors.push(ValidationError::new(
                    InvalidSpecKind::UnresolvedCloudStorage,
                    format!("{base}.bucket.cloudStorageRef.name"),
                    format!("CloudStorage {name:?} not found in namespace"),
                )),
                Some(cs) if cs.spec.provider != CloudStorageProvider::Aws => {
                    errors.push(ValidationError::new(
                        InvalidSpecKind::InvalidProvider,
                        format!("{base}.bucket.cloudStorageRef.name"),
                        format!(
                            "CloudStorage provider {} not yet supported",
                            cs.spec.provider.as_str()
                        ),
                    ))
                }
                Some(_) => {}
            }
            if backup_images && bucket.prefix.as_deref().unwrap_or("").is_empty() {
                errors.push(ValidationError::new(
                    InvalidSpecKind::MissingProviderConfig,
                    format!("{base}.bucket.prefix"),
                    "prefix cannot be empty when backing up images",
                ));
            }
        }
    }
}

fn validate_snapshot_location(
    dpa: &DataProtectionApplication,
    i: usize,
    location: &SnapshotLocation,
    errors: &mut Vec<ValidationError>,
) {
    let base = format!("spec.snapshotLocations[{i}].velero");
    let provider = location.velero.provider.as_str();
    if !KNOWN_PROVIDERS.contains(&provider) {
        errors.push(ValidationError::new(
            InvalidSpecKind::UnknownSnapshotProvider,
            format!("{base}.provider"),
            format!("snapshot provider {provider:?} is not one of aws, gcp, azure"),
        ));
        return;
    }
    if provider == "aws"
        && location.velero.config.get("region").map(String::is_empty).unwrap_or(true)
    {
        errors.push(ValidationError::new(
            InvalidSpecKind::MissingRegion,
            format!("{base}.config.region"),
            "region for AWS volumesnapshotlocation cannot be empty",
        ));
    }
    let has_plugin = match provider {
        "aws" => dpa.spec.has_plugin(DefaultPlugin::Aws) || dpa.spec.has_plugin(DefaultPlugin::LegacyAws),
        other => DefaultPlugin::for_provider(other)
            .map(|p| dpa.spec.has_plugin(p))
            .unwrap_or(false),
    };
    if !has_plugin {
        errors.push(ValidationError::new(
            InvalidSpecKind::MissingPlugin,
            format!("{base}.provider"),
            format!("the {provider} plugin must be listed in defaultPlugins to use this snapshot location"),
        ));
    }
}

/// Parse a boolean the way Go's strconv.ParseBool does
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
