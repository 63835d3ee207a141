//! Error handling for the thread-coordination kernel.

use std::sync::PoisonError;

/// Result type for this crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors reported by kernel operations.
///
/// Locking and migration failures are reported through this type rather than by sentinel return
/// values -- a binding layer translating this into a host-specific "fail" sentinel is out of
/// scope here. Channel operations never fail for semantic reasons, only for argument errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument was out of range or of the wrong shape.
    #[error("Argument error: {0}")]
    ArgumentError(String),
    /// A migration or lock operation failed because the caller does not hold the required
    /// ownership of the target region.
    #[error("Access denied: {0}")]
    AccessDenied(String),
    /// A write-once value (a `SyncVar`, a thread being joined) was used a second time.
    #[error("Already used: {0}")]
    AlreadyUsed(String),
    /// A `Barrier::wait` observed its phase change while suspended, meaning `start` was called
    /// again before this call returned.
    #[error("Barrier was reset while waiting")]
    BarrierReset,
    /// An identifier (thread id, interrupt code, channel index) was outside its valid range.
    #[error("Out of range: {0}")]
    OutOfRange(String),
    /// A lock guarding kernel state was poisoned by a panicking holder.
    #[error("Lock error: {0}")]
    LockError(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(error: PoisonError<T>) -> Self {
        Error::LockError(format!("poisoned lock: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_poison_error() {
        let poison_error: PoisonError<()> = PoisonError::new(());
        let error: Error = poison_error.into();
        assert!(matches!(error, Error::LockError(_)));
    }
}
