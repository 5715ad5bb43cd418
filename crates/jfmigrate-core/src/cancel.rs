//! Cooperative cancellation for a migration run.
//!
//! The pipeline polls the token between files and between tables, so an
//! interrupted run always stops on a unit-of-work boundary: every row-store
//! transaction is either committed or rolled back, and the ledger only holds
//! completed entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::MigrateError;

/// A cancellation token shared between the engine and whoever may stop it
/// (typically a Ctrl-C handler).
///
/// # Example
///
/// ```
/// use jfmigrate_core::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handler_side = token.clone();
///
/// handler_side.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(MigrateError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), MigrateError> {
        if self.is_cancelled() {
            Err(MigrateError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token2.is_cancelled());
        assert!(matches!(token2.check(), Err(MigrateError::Cancelled)));
    }
}
