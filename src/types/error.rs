//! Error types for elohim-stash

use std::sync::PoisonError;

/// Main error type for buffering and cache operations
#[derive(Debug, thiserror::Error)]
pub enum StashError {
    /// The component was shut down; the argument names the component.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No tokio runtime available to drive the flush timer")]
    NoRuntime,

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// Error returned by a flush sink.
    #[error("Sink error: {0}")]
    Sink(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StashError {
    /// Whether the error came from the sink rather than from the buffer itself
    pub fn is_sink(&self) -> bool {
        matches!(self, Self::Sink(_))
    }

    /// Whether retrying the operation can never succeed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disposed(_) | Self::NoRuntime)
    }
}

impl<T> From<PoisonError<T>> for StashError {
    fn from(err: PoisonError<T>) -> Self {
        Self::LockPoisoned(err.to_string())
    }
}

impl From<tokio::runtime::TryCurrentError> for StashError {
    fn from(_: tokio::runtime::TryCurrentError) -> Self {
        Self::NoRuntime
    }
}

/// Result type alias for stash operations
pub type Result<T> = std::result::Result<T, StashError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_sink_error_from_anyhow() {
        let err: StashError = anyhow::anyhow!("database unavailable").into();
        assert!(err.is_sink());
        assert!(!err.is_terminal());
        assert_eq!(err.to_string(), "Sink error: database unavailable");
    }

    #[test]
    fn test_poisoned_lock_maps_to_error() {
        let lock = Arc::new(Mutex::new(0u32));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err: StashError = lock.lock().unwrap_err().into();
        assert!(matches!(err, StashError::LockPoisoned(_)));
    }

    #[test]
    fn test_disposed_is_terminal() {
        let err = StashError::Disposed("BatchBuffer");
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "BatchBuffer has been disposed");
    }
}
