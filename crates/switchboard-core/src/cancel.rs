//! Composable cancellation scopes.
//!
//! A scope is cancelled when: it is cancelled explicitly, its parent is
//! cancelled, or its deadline expires. Every long-running operation in a
//! call (LLM completion, synthesis, tool dispatch, save) takes a scope and
//! must stop within one network round-trip of cancellation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
}

impl CancelScope {
    /// A root scope, cancelled only explicitly.
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A child scope: cancelled with its parent, or on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// A child scope that additionally cancels itself after `deadline`.
    /// The timer task exits early if the scope is cancelled first.
    pub fn child_with_deadline(&self, deadline: Duration) -> Self {
        let child = self.child();
        let timer = child.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        child
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the scope is cancelled. Use inside `tokio::select!`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `fut` until it resolves or the scope is cancelled.
    /// Returns `None` on cancellation.
    pub async fn run<F, T>(&self, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            out = fut => Some(out),
            _ = self.token.cancelled() => None,
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_cancelled_with_parent() {
        let parent = CancelScope::root();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn child_cancel_does_not_touch_parent() {
        let parent = CancelScope::root();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires() {
        let parent = CancelScope::root();
        let scoped = parent.child_with_deadline(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(scoped.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn run_returns_none_when_cancelled() {
        let scope = CancelScope::root();
        scope.cancel();
        let out = scope.run(std::future::pending::<u32>()).await;
        assert!(out.is_none());
    }
}
