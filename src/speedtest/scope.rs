//! Cooperative cancellation scope shared by every task of a probing session.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::ProbeError;

/// A cancel token plus an optional deadline. Clones share the same token.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child scope that is cancelled with its parent and expires at the
    /// earlier of the parent's deadline and `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Why the scope is finished, if it is. A passed deadline reports as a
    /// timeout even if the token was also cancelled afterwards.
    pub fn err(&self) -> Option<ProbeError> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(ProbeError::TimedOut)
        } else if self.token.is_cancelled() {
            Some(ProbeError::Cancelled)
        } else {
            None
        }
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Runs `fut` unless the scope finishes first, in which case `fut` is
    /// dropped and the scope's error is returned.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, ProbeError>
    where
        F: Future<Output = Result<T, ProbeError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            _ = self.done() => Err(self.err().unwrap_or(ProbeError::Cancelled)),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_timed_out() {
        let scope = Scope::new().child_with_timeout(Duration::from_millis(20));
        assert!(scope.err().is_none());

        scope.done().await;
        assert!(matches!(scope.err(), Some(ProbeError::TimedOut)));
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let scope = Scope::new();
        let clone = scope.clone();
        clone.cancel();

        assert!(scope.is_done());
        assert!(matches!(scope.err(), Some(ProbeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_follows_parent_cancel() {
        let parent = Scope::new();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        parent.cancel();

        assert!(matches!(child.err(), Some(ProbeError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_drops_slow_future() {
        let scope = Scope::new().child_with_timeout(Duration::from_millis(20));
        let started = Instant::now();

        let res: Result<(), _> = scope
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert!(matches!(res, Err(ProbeError::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
