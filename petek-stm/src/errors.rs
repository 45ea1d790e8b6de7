use core::fmt;

/// Cooperative-termination signal returned by the redirection entry points.
///
/// Receiving this means a peer aborted the current transaction (or its shadow
/// allocation failed); the caller must unwind without further heap mutation
/// and let the commit attempt report failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated;

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction terminated, unwind required")
    }
}

impl std::error::Error for Terminated {}
