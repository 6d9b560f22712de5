//! Cooperative cancellation for long-running operations.
//!
//! Bulk index builds check the token between documents; a cancelled
//! build stops at a document boundary, so the index is left with either
//! a fully committed insert or nothing from the aborted document.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shareable cancellation signal. Cloning is cheap; all clones observe
/// the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear_and_propagates() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
