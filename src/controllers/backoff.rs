//! Per-key requeue policy after failed reconciles

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;

use crate::error::{Error, ErrorKind};

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(300);
/// Retry delay for optimistic-concurrency conflicts; not counted
pub const CONFLICT_DELAY: Duration = Duration::from_secs(1);
pub const OWNERSHIP_CONFLICT_DELAY: Duration = Duration::from_secs(300);

/// Consecutive failure counts keyed by `kind/namespace/name`
#[derive(Debug, Default)]
pub struct Backoff {
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Forget the failure history of a key after a successful pass
    pub fn reset(&self, key: &str) {
        self.failures().remove(key);
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures().get(key).copied().unwrap_or(0)
    }

    /// Next action for a key whose reconcile failed with `err`
    pub fn on_error(&self, key: &str, err: &Error) -> Action {
        if matches!(err, Error::Cancelled) {
            return Action::await_change();
        }
        match err.kind() {
            // a spec change is the only thing that can fix it
            ErrorKind::InvalidSpec => Action::await_change(),
            ErrorKind::OwnershipConflict => Action::requeue(OWNERSHIP_CONFLICT_DELAY),
            _ if err.is_conflict() => Action::requeue(CONFLICT_DELAY),
            _ => {
                let mut failures = self.failures();
                let count = failures.entry(key.to_string()).or_insert(0);
                let delay = exponential_delay(*count);
                *count = count.saturating_add(1);
                Action::requeue(delay)
            }
        }
    }
}

/// `min(base * 2^n, cap)`
pub fn exponential_delay(failures: u32) -> Duration {
    BASE_DELAY
        .checked_mul(2u32.saturating_pow(failures.min(31)))
        .map(|d| d.min(MAX_DELAY))
        .unwrap_or(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_the_cap() {
        assert_eq!(exponential_delay(0), Duration::from_secs(1));
        assert_eq!(exponential_delay(3), Duration::from_secs(8));
        assert_eq!(exponential_delay(8), Duration::from_secs(256));
        assert_eq!(exponential_delay(9), MAX_DELAY);
        assert_eq!(exponential_delay(40), MAX_DELAY);
    }

    #[test]
    fn conflicts_do_not_count_against_backoff() {
        let backoff = Backoff::new();
        let action = backoff.on_error("dpa/ns/a", &Error::Conflict("velero".into()));
        assert_eq!(action, Action::requeue(CONFLICT_DELAY));
        assert_eq!(backoff.failure_count("dpa/ns/a"), 0);
    }

    #[test]
    fn throttling_backs_off_like_other_failures() {
        let backoff = Backoff::new();
        let err = Error::Transient("429 Too Many Requests".into());
        assert_eq!(backoff.on_error("k", &err), Action::requeue(Duration::from_secs(1)));
        assert_eq!(backoff.on_error("k", &err), Action::requeue(Duration::from_secs(2)));
        assert_eq!(backoff.on_error("k", &err), Action::requeue(Duration::from_secs(4)));
        assert_eq!(backoff.failure_count("k"), 3);
    }

    #[test]
    fn failures_grow_until_reset() {
        let backoff = Backoff::new();
        let err = Error::dependency("secret cloud-credentials missing");
        assert_eq!(backoff.on_error("k", &err), Action::requeue(Duration::from_secs(1)));
        assert_eq!(backoff.on_error("k", &err), Action::requeue(Duration::from_secs(2)));
        assert_eq!(backoff.on_error("k", &err), Action::requeue(Duration::from_secs(4)));
        backoff.reset("k");
        assert_eq!(backoff.on_error("k", &err), Action::requeue(Duration::from_secs(1)));
    }

    #[test]
    fn invalid_spec_waits_for_a_change() {
        let backoff = Backoff::new();
        assert_eq!(
            backoff.on_error("k", &Error::config("bad")),
            Action::await_change()
        );
    }
}
