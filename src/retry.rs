//! Per-attempt retry bookkeeping and the shared rate-limit gate.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::sources::SourceErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per chunk, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Exponential delay before retry number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Lives for one chunk fetch; dropped on success or terminal failure.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempt: u32,
    last_error: Option<SourceErrorKind>,
    next_allowed_at: Option<Instant>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn last_error(&self) -> Option<&SourceErrorKind> {
        self.last_error.as_ref()
    }

    pub fn next_allowed_at(&self) -> Option<Instant> {
        self.next_allowed_at
    }

    pub fn record_failure(&mut self, kind: &SourceErrorKind, cfg: &RetryConfig) -> RetryDecision {
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(kind.clone());

        if !kind.is_transient() || self.attempt >= cfg.max_attempts {
            self.next_allowed_at = None;
            return RetryDecision::GiveUp;
        }

        let backoff = cfg.backoff(self.attempt);
        // A server hint wins over our own schedule when it asks for longer.
        let delay = match kind {
            SourceErrorKind::RateLimited {
                retry_after: Some(hint),
            } => backoff.max(*hint),
            _ => backoff,
        };
        self.next_allowed_at = Some(Instant::now() + delay);
        debug!(
            component = "retry",
            event = "dsm.retry.scheduled",
            attempt = self.attempt,
            error_kind = kind.as_str(),
            delay_ms = delay.as_millis() as u64
        );
        RetryDecision::RetryAfter(delay)
    }
}

/// Pauses every caller of one source after it signals a rate limit.
#[derive(Debug, Default)]
pub struct RateGate {
    resume_at: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause_until(&self, at: Instant) {
        let mut resume_at = self
            .resume_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if resume_at.map_or(true, |current| current < at) {
            *resume_at = Some(at);
        }
    }

    pub fn resume_at(&self) -> Option<Instant> {
        *self
            .resume_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn wait(&self) {
        loop {
            match self.resume_at() {
                Some(at) if at > Instant::now() => tokio::time::sleep_until(at).await,
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = cfg();
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(250));
        assert_eq!(cfg.backoff(40), Duration::from_millis(250));
    }

    #[test]
    fn transient_errors_retry_until_attempts_exhausted() {
        let cfg = cfg();
        let mut state = RetryState::new();
        for _ in 0..3 {
            assert!(matches!(
                state.record_failure(&SourceErrorKind::Transient, &cfg),
                RetryDecision::RetryAfter(_)
            ));
            assert!(state.next_allowed_at().is_some());
        }
        assert_eq!(
            state.record_failure(&SourceErrorKind::Transient, &cfg),
            RetryDecision::GiveUp
        );
        assert_eq!(state.attempts(), 4);
        assert_eq!(state.last_error(), Some(&SourceErrorKind::Transient));
    }

    #[test]
    fn permanent_errors_give_up_immediately() {
        let mut state = RetryState::new();
        assert_eq!(
            state.record_failure(&SourceErrorKind::ChecksumMismatch, &cfg()),
            RetryDecision::GiveUp
        );
        assert_eq!(state.attempts(), 1);
    }

    #[test]
    fn retry_after_hint_extends_backoff() {
        let mut state = RetryState::new();
        let decision = state.record_failure(
            &SourceErrorKind::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            },
            &cfg(),
        );
        assert_eq!(decision, RetryDecision::RetryAfter(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn gate_keeps_latest_resume_instant() {
        let gate = RateGate::new();
        let later = Instant::now() + Duration::from_millis(30);
        gate.pause_until(later);
        gate.pause_until(Instant::now());
        assert_eq!(gate.resume_at(), Some(later));

        gate.wait().await;
        assert!(Instant::now() >= later);
    }
}
