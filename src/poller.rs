use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ConfigError, DEFAULT_RETRY_DELAY_MS, DEFAULT_RETRY_TIMES};
use crate::mailbox::MailboxError;

/// Observer told about each attempt that came back empty or failed:
/// `(attempt, max_attempts, delay before the next one)`.
pub type ProgressCallback = Arc<dyn Fn(u32, u32, Duration) + Send + Sync>;

#[derive(Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IMAP retrieval failed after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: MailboxError },
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// No attempt starts once this much time has passed since the first one.
    pub deadline: Option<Duration>,
    on_attempt: Option<ProgressCallback>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_TIMES, Duration::from_millis(DEFAULT_RETRY_DELAY_MS))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("deadline", &self.deadline)
            .field("on_attempt", &self.on_attempt.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            deadline: None,
            on_attempt: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_attempt = Some(callback);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// At least one attempt is always made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether the deadline leaves no room for another attempt after the next sleep.
    fn out_of_time(&self, started: Instant) -> bool {
        match self.deadline {
            Some(limit) => limit.saturating_sub(started.elapsed()) <= self.delay,
            None => false,
        }
    }

    fn notify(&self, attempt: u32, max_attempts: u32) {
        if let Some(callback) = &self.on_attempt {
            callback(attempt, max_attempts, self.delay);
        }
    }
}

/// Repeat `attempt` until it yields something or the policy runs out.
///
/// The policy runs out when the attempt budget is spent or the deadline would
/// pass before the next attempt could start. Either way the last attempt
/// decides the outcome: empty is `Ok(vec![])`, an error is
/// [`PollError::Exhausted`]. An attempt in flight is always awaited, so a
/// deadline never discards mail that was already fetched. The progress
/// callback fires before every sleep, so never for the final attempt.
pub async fn poll_with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<Vec<T>, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>, MailboxError>>,
{
    let max_attempts = policy.attempts();
    let started = Instant::now();
    let mut n = 1;

    loop {
        let outcome = attempt(n).await;
        let last = n == max_attempts || policy.out_of_time(started);

        match outcome {
            Ok(found) if !found.is_empty() => {
                log::info!("Attempt {}/{}: found {} messages", n, max_attempts, found.len());
                return Ok(found);
            }
            Ok(_) => {
                log::debug!("Attempt {}/{}: no messages yet", n, max_attempts);
            }
            Err(e) if last => {
                log::warn!("Attempt {}/{} failed, giving up: {}", n, max_attempts, e);
                return Err(PollError::Exhausted { attempts: n, source: e });
            }
            Err(e) => {
                log::warn!("Attempt {}/{} failed: {}", n, max_attempts, e);
            }
        }

        if last {
            if n < max_attempts {
                log::info!("Deadline reached, stopping after {} of {} attempts", n, max_attempts);
            } else {
                log::info!("No messages after {} attempts", max_attempts);
            }
            return Ok(Vec::new());
        }

        policy.notify(n, max_attempts);
        tokio::time::sleep(policy.delay).await;
        n += 1;
    }
}
