//! Error handling for the garbage-collector collaborator surface.

use std::sync::PoisonError;

/// Result type for this crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur while registering roots, objects, or finalizers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lock guarding the root or object registry was poisoned by a panicking holder.
    #[error("Failed to acquire lock: {0}")]
    LockError(String),
    /// A root could not be registered or resolved.
    #[error("Failed to manage GC roots: {0}")]
    RootError(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(error: PoisonError<T>) -> Self {
        Error::LockError(format!("Poisoned lock: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_poison_error() {
        let poison_error: PoisonError<()> = PoisonError::new(());
        let error: Error = poison_error.into();
        assert!(matches!(error, Error::LockError(_)));
    }
}
