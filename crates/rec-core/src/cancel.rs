//! Cancellation plumbing shared by every public operation
//!
//! A thin wrapper over [`tokio_util::sync::CancellationToken`]: it adds
//! the grace-period semantics a cancel needs (SIGTERM, wait, SIGKILL)
//! without callers needing to know the token's internals.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Grace period between SIGTERM and the stream being torn down on
/// cancellation.
pub const REMOTE_KILL_GRACE: Duration = Duration::from_secs(2);

/// A cancellation scope. Cloning shares the same underlying signal;
/// cancelling any clone cancels every descendant operation.
#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
}

impl CancelScope {
    /// A fresh, unlinked scope
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A child scope: cancelling the parent cancels the child, but not
    /// vice versa.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Cancel this scope and every descendant
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this scope is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_is_cancelled_by_parent() {
        let parent = CancelScope::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_child_does_not_cancel_parent() {
        let parent = CancelScope::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
