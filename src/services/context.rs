//! Per-call cancellation and deadline handling.
//!
//! Relational steps that run before a commit are raced against the context;
//! losing the race drops the in-flight future, and with it the open
//! transaction, which rolls back. Commits are never raced. Once a commit has
//! succeeded the follow-up index write is issued regardless of cancellation;
//! if the caller drops the whole future at that point the index write may not
//! happen and the reconciler picks the product up on its next sweep.

use crate::errors::{CatalogError, CatalogResult};
use std::{future::Future, time::Duration};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast when the caller already gave up.
    pub fn ensure_active(&self) -> CatalogResult<()> {
        if self.is_done() {
            Err(CatalogError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` unless the context is cancelled or its deadline passes first.
    pub async fn guard<F, T>(&self, fut: F) -> CatalogResult<T>
    where
        F: Future<Output = CatalogResult<T>>,
    {
        self.ensure_active()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CatalogError::Cancelled),
            _ = deadline => Err(CatalogError::Cancelled),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn guard_passes_through_when_active() {
        let ctx = OpContext::background();
        let value = ctx.guard(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = OpContext::background();
        ctx.cancel();
        let err = ctx.guard(async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn deadline_interrupts_a_slow_step() {
        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        let err = ctx.guard(slow).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(ctx.is_done());
    }
}
