//! Retry with exponential backoff and jitter.
//!
//! Wrapped operations run with at-least-once semantics: nothing here
//! deduplicates a remote call that failed after partially completing, so
//! callers only wrap operations that are safe to repeat.

use crate::config::RetrySettings;
use crate::error::GenerationError;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Lowercased message fragments that mark an error as worth retrying.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "resource_exhausted",
    "rate limit",
    "quota",
    "429",
    "503",
    "temporarily unavailable",
    "timeout",
    "timed out",
    "connection reset",
    "connection",
];

pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Decides whether a failed attempt may be repeated.
pub trait Classify {
    fn is_transient(&self) -> bool;
}

impl Classify for GenerationError {
    fn is_transient(&self) -> bool {
        match self {
            GenerationError::Backend(msg) => is_transient_message(msg),
            GenerationError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || matches!(err.status().map(|s| s.as_u16()), Some(429 | 503))
                    || is_transient_message(&err.to_string())
            }
            _ => false,
        }
    }
}

impl Classify for anyhow::Error {
    fn is_transient(&self) -> bool {
        is_transient_message(&format!("{:#}", self))
    }
}

impl Classify for String {
    fn is_transient(&self) -> bool {
        is_transient_message(self)
    }
}

impl Classify for &'static str {
    fn is_transient(&self) -> bool {
        is_transient_message(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_secs_f64(settings.base_delay_secs.max(0.0)),
            max_delay: Duration::from_secs_f64(settings.max_delay_secs.max(0.0)),
        }
    }
}

#[derive(Debug, Default)]
struct RetryContext {
    attempt: u32,
    last_error: Option<String>,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// `min(base * 2^attempt + jitter, max)`, jitter in seconds from `[0, 1)`.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let backoff = self.base_delay.checked_mul(factor).unwrap_or(self.max_delay);
        let jitter = Duration::from_secs_f64(jitter.clamp(0.0, 1.0));
        backoff.saturating_add(jitter).min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// or `max_retries + 1` attempts have been made.
    pub async fn run<T, E, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut ctx = RetryContext::default();

        loop {
            match operation().await {
                Ok(value) => {
                    if ctx.attempt > 0 {
                        debug!(
                            "{} succeeded after {} retries (last error: {})",
                            operation_name,
                            ctx.attempt,
                            ctx.last_error.as_deref().unwrap_or("-")
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !err.is_transient() {
                        debug!("{} failed with a fatal error: {}", operation_name, err);
                        return Err(err);
                    }
                    if ctx.attempt >= self.max_retries {
                        warn!(
                            "{} still failing after {} attempts: {}",
                            operation_name,
                            ctx.attempt + 1,
                            err
                        );
                        return Err(err);
                    }

                    let jitter: f64 = rand::thread_rng().r#gen();
                    ctx.delay = self.delay_for_attempt(ctx.attempt, jitter);
                    ctx.last_error = Some(err.to_string());
                    ctx.attempt += 1;
                    warn!(
                        "[RETRY] {} attempt {}/{} failed: {}; waiting {:.1}s",
                        operation_name,
                        ctx.attempt,
                        self.max_retries,
                        err,
                        ctx.delay.as_secs_f64()
                    );
                    tokio::time::sleep(ctx.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_secs(2), Duration::from_secs(10))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for_attempt(0, 0.0), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(1, 0.0), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(2, 0.5), Duration::from_millis(8500));
        assert_eq!(p.delay_for_attempt(3, 0.0), Duration::from_secs(10));
        assert_eq!(p.delay_for_attempt(40, 0.99), Duration::from_secs(10));
    }

    #[test]
    fn classifies_messages() {
        assert!(is_transient_message("HTTP 429 Too Many Requests"));
        assert!(is_transient_message("Service temporarily unavailable"));
        assert!(is_transient_message("RESOURCE_EXHAUSTED: quota exceeded"));
        assert!(is_transient_message("connection reset by peer"));
        assert!(!is_transient_message("invalid argument: prompt rejected"));
    }

    #[test]
    fn typed_errors_override_wording() {
        assert!(GenerationError::backend("503 backend overloaded").is_transient());
        assert!(!GenerationError::backend("prompt violates policy").is_transient());
        assert!(!GenerationError::session("connection to account lost").is_transient());
        assert!(!GenerationError::submit("timeout waiting for submit").is_transient());
        assert!(!GenerationError::download("connection reset").is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_runs_max_retries_plus_one() {
        let p = policy(3);
        let calls = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let result: Result<(), String> = p
            .run("always-429", || {
                calls.fetch_add(1, Ordering::SeqCst);
                stamps.lock().unwrap().push(Instant::now());
                async { Err("429 rate limit".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stamps = stamps.lock().unwrap();
        for pair in stamps.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap <= p.max_delay, "slept {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_short_circuits() {
        let p = policy(5);
        let calls = AtomicU32::new(0);

        let result: Result<(), GenerationError> = p
            .run("fatal", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GenerationError::input("missing prompt")) }
            })
            .await;

        assert!(matches!(result, Err(GenerationError::Input(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let p = policy(3);
        let calls = AtomicU32::new(0);

        let result = p
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("503 temporarily unavailable")
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::none()
            .run("once", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
