use std::sync::atomic::{AtomicBool, Ordering};

/// Pluggable pre-commit abort decision.
///
/// Consulted once per commit attempt, before validation. Production use keeps
/// the default [`KeepPolicy`]; [`AlternatePolicy`] exists to exercise the
/// abort-and-retry machinery deterministically in tests.
pub trait AbortPolicy: Send + Sync {
    /// Whether this commit attempt is forced to abort.
    fn abort_before_commit(&self) -> bool;
}

/// Never forces an abort.
pub struct KeepPolicy;

impl AbortPolicy for KeepPolicy {
    fn abort_before_commit(&self) -> bool {
        false
    }
}

/// Forces every other commit to abort, starting with the first.
pub struct AlternatePolicy {
    even: AtomicBool,
}

impl AlternatePolicy {
    pub fn new() -> Self {
        Self {
            even: AtomicBool::new(true),
        }
    }
}

impl Default for AlternatePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortPolicy for AlternatePolicy {
    fn abort_before_commit(&self) -> bool {
        self.even.fetch_xor(true, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_never_aborts() {
        let p = KeepPolicy;
        assert!(!p.abort_before_commit());
        assert!(!p.abort_before_commit());
    }

    #[test]
    fn alternate_aborts_every_other_starting_first() {
        let p = AlternatePolicy::new();
        assert!(p.abort_before_commit());
        assert!(!p.abort_before_commit());
        assert!(p.abort_before_commit());
        assert!(!p.abort_before_commit());
    }
}
