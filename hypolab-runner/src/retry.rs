//! Retry and per-call timeout plumbing for collaborator calls.
//!
//! A call that exceeds its timeout is abandoned: the helper thread is left to
//! finish on its own and its result is discarded, so a hung collaborator
//! never blocks sibling runs.

use std::fmt::Display;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-call retry and timeout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure (default 2).
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each further retry (default 250ms).
    pub base_delay_ms: u64,
    /// Per-call timeout in seconds. `None` waits indefinitely.
    pub call_timeout_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 250,
            call_timeout_secs: None,
        }
    }
}

impl RetryPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }

    fn delay_for_retry(&self, retry: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << retry.min(16)))
    }
}

/// Why a timed call produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    TimedOut(Duration),
    /// The call panicked on its helper thread.
    Panicked,
}

/// Run `f`, giving up after `timeout`.
pub fn call_with_timeout<T, F>(timeout: Option<Duration>, f: F) -> Result<T, CallFailure>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let Some(limit) = timeout else {
        return Ok(f());
    };
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // Receiver may be gone after a timeout.
        let _ = tx.send(f());
    });
    match rx.recv_timeout(limit) {
        Ok(value) => Ok(value),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(CallFailure::TimedOut(limit)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(CallFailure::Panicked),
    }
}

/// Retry `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are spent. `op` receives the zero-based attempt number.
pub fn with_retry<T, E, F>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                let delay = policy.delay_for_retry(attempt);
                warn!(
                    call = label,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    error = %e,
                    ?delay,
                    "collaborator call failed, retrying"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
