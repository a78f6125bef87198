//! Bounded polling for waits that depend on GitHub catching up.
//!
//! A `RetryPolicy` is built fresh for every wait, normalized with `init`,
//! then driven with `start`/`exceeded`/`increment` or with [`RetryPolicy::run`].
//! It never fails by itself: running out of attempts or time is reported to
//! the caller, who decides what that means.

use anyhow::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_PAUSE_TIME: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_secs(10 * 60);

/// Result of a single polling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    Retry,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub name: String,
    pub pause_time: Option<Duration>,
    pub max_wait_time: Option<Duration>,
    /// `None` means no attempt ceiling; only the wait time bounds the loop.
    pub max_attempts: Option<u32>,
    attempts: u32,
    started_at: Option<Instant>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unbounded attempts, limited only by `max_wait_time`.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause_time = Some(pause);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_time = Some(max_wait);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn init(&mut self) {
        self.pause_time.get_or_insert(DEFAULT_PAUSE_TIME);
        self.max_wait_time.get_or_insert(DEFAULT_MAX_WAIT_TIME);
    }

    pub fn start(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.attempts = 0;
        self.started_at = Some(Instant::now());
    }

    pub fn increment(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    pub fn pause(&self) -> Duration {
        self.pause_time.unwrap_or(DEFAULT_PAUSE_TIME)
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait_time.unwrap_or(DEFAULT_MAX_WAIT_TIME)
    }

    pub fn exceeded(&self) -> bool {
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return true;
            }
        }
        self.elapsed() >= self.max_wait()
    }

    /// Poll `action` until it reports `Done`, pausing between attempts.
    ///
    /// Returns `Ok(None)` once the policy is exhausted. Errors from `action`
    /// end the loop immediately.
    pub async fn run<T, F, Fut>(&mut self, name: &str, mut action: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        self.init();
        self.start(name);

        loop {
            if self.exceeded() {
                break;
            }
            if let Attempt::Done(value) = action().await? {
                return Ok(Some(value));
            }
            self.increment();
            if self.exceeded() {
                break;
            }
            debug!(
                "{}: attempt {} not done, retrying in {:?}",
                self.name,
                self.attempts,
                self.pause()
            );
            tokio::time::sleep(self.pause()).await;
        }

        debug!(
            "{}: giving up after {} attempts ({:?})",
            self.name,
            self.attempts,
            self.elapsed()
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_init_applies_defaults() {
        let mut retry = RetryPolicy::new();
        retry.init();
        assert_eq!(retry.pause_time, Some(DEFAULT_PAUSE_TIME));
        assert_eq!(retry.max_wait_time, Some(DEFAULT_MAX_WAIT_TIME));
        assert_eq!(retry.max_attempts, None);
    }

    #[test]
    fn test_init_keeps_explicit_values() {
        let mut retry = RetryPolicy::new()
            .with_pause(Duration::ZERO)
            .with_max_wait(Duration::from_secs(5))
            .with_max_attempts(3);
        retry.init();
        assert_eq!(retry.pause(), Duration::ZERO);
        assert_eq!(retry.max_wait(), Duration::from_secs(5));
        assert_eq!(retry.max_attempts, Some(3));
    }

    #[test]
    fn test_exceeded_by_attempts() {
        let mut retry = RetryPolicy::new().with_max_attempts(2);
        retry.init();
        retry.start("attempts");
        assert!(!retry.exceeded());
        retry.increment();
        assert!(!retry.exceeded());
        retry.increment();
        assert!(retry.exceeded());
    }

    #[test]
    fn test_zero_ceilings_are_exceeded_immediately() {
        let mut retry = RetryPolicy::new()
            .with_max_wait(Duration::ZERO)
            .with_max_attempts(0);
        retry.init();
        retry.start("zero");
        assert!(retry.exceeded());
    }

    #[tokio::test]
    async fn test_run_stops_at_attempt_ceiling() {
        let mut retry = RetryPolicy::new()
            .with_pause(Duration::from_millis(1))
            .with_max_attempts(5);
        let mut calls = 0;
        let result: Option<()> = retry
            .run("ceiling", || {
                calls += 1;
                async { Ok(Attempt::Retry) }
            })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(calls, 5);
        assert_eq!(retry.attempts(), 5);
    }

    #[tokio::test]
    async fn test_run_stops_at_wait_ceiling() {
        let mut retry = RetryPolicy::unbounded()
            .with_pause(Duration::from_millis(50))
            .with_max_wait(Duration::from_millis(20));
        let result: Option<()> = retry
            .run("wait", || async { Ok(Attempt::Retry) })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(retry.attempts(), 1);
    }

    #[tokio::test]
    async fn test_run_returns_value_when_done() {
        let mut retry = RetryPolicy::new()
            .with_pause(Duration::from_millis(1))
            .with_max_attempts(10);
        let mut calls = 0u32;
        let result = retry
            .run("done", || {
                calls += 1;
                let n = calls;
                async move {
                    if n == 3 {
                        Ok(Attempt::Done("sha-2"))
                    } else {
                        Ok(Attempt::Retry)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, Some("sha-2"));
        assert_eq!(retry.attempts(), 2);
    }

    #[tokio::test]
    async fn test_run_with_zero_attempts_never_calls_action() {
        let mut retry = RetryPolicy::new().with_max_attempts(0);
        let mut calls = 0;
        let result: Option<()> = retry
            .run("never", || {
                calls += 1;
                async { Ok(Attempt::Retry) }
            })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_run_propagates_action_errors() {
        let mut retry = RetryPolicy::new().with_pause(Duration::from_millis(1));
        let result: Result<Option<()>> = retry
            .run("error", || async { Err(anyhow!("GitHub API error: 502")) })
            .await;
        assert!(result.unwrap_err().to_string().contains("502"));
    }
}
