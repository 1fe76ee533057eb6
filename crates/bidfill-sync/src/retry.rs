//! Bounded attempt loop with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use bidfill_storage::BackoffPolicy;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Longest error text carried into logs and progress events.
pub const MAX_ERROR_CHARS: usize = 180;

/// Result of a single attempt, decided by the attempt itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome<T> {
    Success(T),
    Transient(String),
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retried<T> {
    Done(T),
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, error: String },
    /// An attempt failed in a way no retry can fix; remaining attempts were skipped.
    Fatal { attempts: u32, error: String },
    Cancelled,
}

impl<T> Retried<T> {
    pub fn failure(&self) -> Option<(u32, &str, bool)> {
        match self {
            Self::Exhausted { attempts, error } => Some((*attempts, error.as_str(), false)),
            Self::Fatal { attempts, error } => Some((*attempts, error.as_str(), true)),
            Self::Done(_) | Self::Cancelled => None,
        }
    }
}

pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

/// Sleeps for `duration` unless `cancel` fires first; returns `false` when cancelled.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Runs `attempt` up to `policy.max_attempts` times. No sleep follows the final attempt, and an
/// in-flight attempt is always allowed to finish before cancellation is observed.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut attempt: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut index = 0;
    loop {
        if cancel.is_cancelled() {
            return Retried::Cancelled;
        }
        let attempt_no = index + 1;
        match attempt().await {
            AttemptOutcome::Success(value) => return Retried::Done(value),
            AttemptOutcome::Fatal(error) => {
                let error = truncate_message(&error, MAX_ERROR_CHARS);
                warn!(label, attempt = attempt_no, max_attempts, %error, "fatal failure; not retrying");
                return Retried::Fatal {
                    attempts: attempt_no,
                    error,
                };
            }
            AttemptOutcome::Transient(error) => {
                let error = truncate_message(&error, MAX_ERROR_CHARS);
                if attempt_no >= max_attempts {
                    warn!(label, attempt = attempt_no, max_attempts, %error, "attempts exhausted");
                    return Retried::Exhausted {
                        attempts: attempt_no,
                        error,
                    };
                }
                let wait = policy.delay_for_attempt(index);
                warn!(
                    label,
                    attempt = attempt_no,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    %error,
                    "attempt failed; backing off"
                );
                if !pause(wait, cancel).await {
                    return Retried::Cancelled;
                }
                index += 1;
            }
        }
    }
}
