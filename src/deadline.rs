//! Structured fan-out with a hard deadline and bounded cleanup.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum ScopeEvent<T> {
    Completed(T),
    /// The task panicked or was aborted.
    TaskFailed(String),
    /// No tasks left.
    Exhausted,
    DeadlineExpired,
    Cancelled,
}

#[derive(Debug)]
pub struct Cleanup<T> {
    /// Results of tasks that finished during the grace period.
    pub settled: Vec<T>,
    pub failed: usize,
    /// Tasks aborted and detached after the grace period ran out.
    pub forced: usize,
}

/// Owns every task spawned for one request.
pub struct DeadlineScope<T> {
    tasks: JoinSet<T>,
    parent: CancellationToken,
    token: CancellationToken,
    deadline: Instant,
    grace: Duration,
}

impl<T: Send + 'static> DeadlineScope<T> {
    pub fn new(parent: &CancellationToken, deadline: Instant, grace: Duration) -> Self {
        Self {
            tasks: JoinSet::new(),
            parent: parent.clone(),
            token: parent.child_token(),
            deadline,
            grace,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawns `task` with a token that fires on deadline, caller cancel or shutdown.
    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.tasks.spawn(task(self.token.clone()));
    }

    pub async fn next(&mut self) -> ScopeEvent<T> {
        if self.tasks.is_empty() {
            return ScopeEvent::Exhausted;
        }

        tokio::select! {
            biased;
            _ = self.parent.cancelled() => ScopeEvent::Cancelled,
            _ = sleep_until(self.deadline) => ScopeEvent::DeadlineExpired,
            joined = self.tasks.join_next() => match joined {
                None => ScopeEvent::Exhausted,
                Some(Ok(value)) => ScopeEvent::Completed(value),
                Some(Err(err)) => ScopeEvent::TaskFailed(err.to_string()),
            },
        }
    }

    /// Cancels remaining tasks, waits up to the grace period for them to
    /// unwind, then aborts whatever is left.
    pub async fn shutdown(mut self) -> Cleanup<T> {
        self.token.cancel();
        let grace_end = Instant::now() + self.grace;
        let mut settled = Vec::new();
        let mut failed = 0;

        while !self.tasks.is_empty() {
            match timeout_at(grace_end, self.tasks.join_next()).await {
                Ok(Some(Ok(value))) => settled.push(value),
                Ok(Some(Err(_))) => failed += 1,
                Ok(None) | Err(_) => break,
            }
        }

        let forced = self.tasks.len();
        if forced > 0 {
            warn!(
                component = "deadline",
                event = "dsm.deadline.forced_release",
                forced,
                grace_ms = self.grace.as_millis() as u64
            );
            self.tasks.abort_all();
            self.tasks.detach_all();
        } else {
            debug!(
                component = "deadline",
                event = "dsm.deadline.clean_shutdown",
                settled = settled.len(),
                failed
            );
        }

        Cleanup {
            settled,
            failed,
            forced,
        }
    }
}
