//! Per-request cancellation and deadline
//!
//! A [`RequestContext`] travels with one `extract` call. The only suspension
//! point on the request path is the first fetch of a remote keyset, which is
//! raced against the context so a cancelled or expired request returns
//! promptly with [`AuxDataError::Cancelled`] or
//! [`AuxDataError::DeadlineExceeded`] instead of waiting on the network.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AuxDataError, Result};

/// Cancellation scope of a single extraction
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context that is never cancelled and has no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context from an existing cancellation token
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            deadline: None,
        }
    }

    /// Set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every clone of it
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Error describing why this context is finished, if it is
    pub fn err(&self) -> Option<AuxDataError> {
        if self.cancellation.is_cancelled() {
            return Some(AuxDataError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(AuxDataError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drive `fut` to completion unless the context finishes first
    ///
    /// The future is dropped on cancellation, which aborts any in-flight I/O it owns.
    ///
    /// # Errors
    ///
    /// Returns [`AuxDataError::Cancelled`] or [`AuxDataError::DeadlineExceeded`]
    /// when the context ends before `fut` completes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(AuxDataError::Cancelled),
            _ = deadline => Err(AuxDataError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_run_completes() {
        let cx = RequestContext::new();
        let out = cx.run(async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let cx = RequestContext::new();
        let handle = cx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let result = cx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(AuxDataError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_exceeded() {
        let cx = RequestContext::new().with_timeout(Duration::from_secs(5));
        let result = cx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(AuxDataError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_poll() {
        let cx = RequestContext::new();
        cx.cancel();
        let polled = AtomicBool::new(false);
        let result = cx.run(async { polled.store(true, Ordering::SeqCst) }).await;
        assert!(matches!(result, Err(AuxDataError::Cancelled)));
        assert!(!polled.load(Ordering::SeqCst));
        assert!(matches!(cx.err(), Some(AuxDataError::Cancelled)));
    }
}
