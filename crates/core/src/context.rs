//! Per-request context: namespace scope, cancellation and deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone, Default)]
pub struct Context {
    namespace: Option<String>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        self.namespace = if ns.is_empty() { None } else { Some(ns) };
        self
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.deadline = Some(Instant::now() + d);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` to completion unless the context is cancelled or its deadline
    /// passes first; in both cases `fut` is dropped before returning.
    pub async fn run<F, T>(&self, fut: F) -> ApiResult<T>
    where
        F: Future<Output = ApiResult<T>>,
    {
        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
                res = fut => res,
            }
        };
        match self.deadline {
            Some(at) => match tokio::time::timeout_at(at, guarded).await {
                Ok(res) => res,
                Err(_) => Err(ApiError::Timeout("request deadline exceeded".to_string())),
            },
            None => guarded.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through() {
        let ctx = Context::new();
        assert_eq!(ctx.run(async { Ok::<_, ApiError>(3) }).await, Ok(3));
    }

    #[tokio::test]
    async fn cancelled_before_completion() {
        let token = CancellationToken::new();
        let ctx = Context::new().with_cancel(token.clone());
        token.cancel();
        let res = ctx.run(std::future::pending::<ApiResult<()>>()).await;
        assert_eq!(res, Err(ApiError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = Context::new().with_timeout(Duration::from_millis(50));
        let res = ctx.run(std::future::pending::<ApiResult<()>>()).await;
        assert!(matches!(res, Err(ApiError::Timeout(_))));
    }

    #[test]
    fn empty_namespace_is_none() {
        assert_eq!(Context::new().with_namespace("").namespace(), None);
        assert_eq!(Context::new().with_namespace("ns").namespace(), Some("ns"));
    }
}
