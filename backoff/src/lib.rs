//! Bounded exponential backoff for retrying fallible async operations.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

use std::{fmt, future::Future, time::Duration};

use tracing::warn;

/// Backoff configuration: doubling delays between `init_backoff` and
/// `max_backoff`, giving up after `max_retries` failed attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub init_backoff: Duration,
    /// Cap on the delay between retries.
    pub max_backoff: Duration,
    /// Total attempt budget: the operation is invoked at most this many
    /// times.
    pub max_retries: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

/// Tracks retry state for one logical operation.
///
/// Can be driven manually (`ongoing` / `wait`) or through
/// [`retry_all_errors`](Self::retry_all_errors), which retries a closure on
/// every error until the retry budget is exhausted.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    retries: usize,
}

impl Backoff {
    /// Create a backoff tracker starting at `config.init_backoff`.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            next: config.init_backoff,
            retries: 0,
        }
    }

    /// Number of waits performed so far.
    pub fn num_retries(&self) -> usize {
        self.retries
    }

    /// Whether the retry budget still allows another attempt.
    pub fn ongoing(&self) -> bool {
        self.retries < self.config.max_retries
    }

    /// Reset to the initial state, e.g. between independent operations that
    /// share one tracker.
    pub fn reset(&mut self) {
        self.next = self.config.init_backoff;
        self.retries = 0;
    }

    /// Sleep for the current delay and advance to the next one.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next).await;
        self.retries += 1;
        self.next = (self.next * 2).min(self.config.max_backoff);
    }

    /// Invoke `f` until it succeeds or the attempt budget is exhausted:
    /// `f` is called at most `max_retries` times in total. Every error is
    /// treated as retryable.
    pub async fn retry_all_errors<F, Fut, T, E>(
        &mut self,
        task: &'static str,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(source) => {
                    // This call consumed one attempt; only wait and go
                    // around again if the budget allows another one.
                    let attempts = self.retries + 1;
                    if attempts >= self.config.max_retries {
                        return Err(RetryError {
                            task,
                            attempts,
                            source,
                        });
                    }
                    warn!(task, error = %source, attempt = attempts, "operation failed, will retry");
                    self.wait().await;
                }
            }
        }
    }
}

/// The attempt budget was exhausted; carries the last error observed.
#[derive(Debug)]
pub struct RetryError<E> {
    /// Name of the operation that kept failing.
    pub task: &'static str,
    /// Number of times the operation was attempted before giving up.
    pub attempts: usize,
    /// The final error.
    pub source: E,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' failed after {} attempts: {}",
            self.task, self.attempts, self.source
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
