//! Cooperative cancellation for long-running storage operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, StorageError};

/// Cancellation signal checked between discrete steps of persist and
/// compaction.
///
/// Clones share the same flag. Work already renamed into place stays
/// committed when an operation stops.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation for every clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return [`StorageErrorKind::Cancelled`](crate::StorageErrorKind::Cancelled)
    /// if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StorageError::cancelled());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageErrorKind;

    #[test]
    fn test_new_token_is_not_cancelled() {
        let token = CancelToken::new();

        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_shared_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();

        clone.cancel();

        assert!(token.is_cancelled());
        assert_eq!(token.check().unwrap_err().kind, StorageErrorKind::Cancelled);
    }

    #[test]
    fn test_token_is_send() {
        fn assert_send<T: Send + Sync>() {}
        assert_send::<CancelToken>();
    }
}
