use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::queuecontext::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Call context handed to producers, consumers and batch processors.
///
/// Carries a cancellation signal, an optional deadline and optional record
/// metadata. Contexts are cheap to clone and derived contexts never affect
/// their parent: cancelling a parent cancels its children, not the reverse.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    metadata: Option<Arc<Metadata>>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that is cancelled when the returned token is
    /// cancelled, or when this context is.
    pub fn with_cancel(&self) -> (Context, CancellationToken) {
        let token = self.token.child_token();
        let ctx = Context {
            token: token.clone(),
            deadline: self.deadline,
            metadata: self.metadata.clone(),
        };
        (ctx, token)
    }

    /// Derives a context whose deadline is `timeout` from now, or this
    /// context's deadline if that comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Context {
            token: self.token.clone(),
            deadline: Some(deadline),
            metadata: self.metadata.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context is done, if it is.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    pub(crate) fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_deref()
    }

    pub(crate) fn with_metadata(&self, metadata: Metadata) -> Context {
        Context {
            token: self.token.clone(),
            deadline: self.deadline,
            metadata: Some(Arc::new(metadata)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_never_done() {
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), ctx.done())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children_only() {
        let (parent, cancel_parent) = Context::background().with_cancel();
        let (child, cancel_child) = parent.with_cancel();

        cancel_child.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert_eq!(parent.err(), None);

        let (other_child, _) = parent.with_cancel();
        cancel_parent.cancel();
        assert_eq!(other_child.done().await, ContextError::Cancelled);
    }

    #[tokio::test]
    async fn test_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));

        let expired = Context::background().with_timeout(Duration::ZERO);
        assert!(expired.is_done());
    }

    #[tokio::test]
    async fn test_earlier_deadline_wins() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let later = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(later.deadline(), ctx.deadline());
    }
}
