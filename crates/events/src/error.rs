//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Event store operation failed.
    #[error("event store operation '{operation}' failed: {reason}")]
    StoreFailed { operation: String, reason: String },

    /// Channel closed.
    #[error("event channel closed")]
    ChannelClosed,

    /// The subscriber fell behind and missed events.
    #[error("subscriber lagged, {skipped} events dropped")]
    Lagged { skipped: u64 },

    /// No event available right now.
    #[error("no event available")]
    Empty,
}

impl Error {
    /// Create a store failed error.
    pub fn store_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::store_failed("append", "disk full");
        assert!(err.to_string().contains("append"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_lagged_display() {
        let err = Error::Lagged { skipped: 7 };
        assert!(err.to_string().contains('7'));
    }
}
