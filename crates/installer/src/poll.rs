//! Bounded retry of readiness checks.
//!
//! A [`Poller`] runs a check up to `max_attempts` times, sleeping between
//! attempts but never after the last one. A check that returns `Ok(false)`
//! and a check that returns an error are both "not ready yet"; the error of
//! the final attempt is kept so the timeout can explain itself.

use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Attempt budget for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    /// Maximum number of checks.
    pub max_attempts: u32,
    /// Sleep between consecutive checks.
    pub delay: Duration,
}

impl PollSpec {
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Longest time the poll can spend sleeping.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

/// Position of a check within its poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Attempt budget.
    pub max: u32,
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.max)
    }
}

/// A poll ran out of attempts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "timed out waiting for {description} after {attempts}/{max_attempts} attempts ({}s elapsed){}",
    .elapsed.as_secs(),
    .last_error.as_ref().map(|e| format!("; last error: {e}")).unwrap_or_default()
)]
pub struct PollTimeoutError {
    /// What was being waited for.
    pub description: String,
    /// Checks performed.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Wall time spent polling.
    pub elapsed: Duration,
    /// Error raised by the final check, `None` if it returned `false`.
    pub last_error: Option<String>,
}

/// Why a poll did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error(transparent)]
    Timeout(#[from] PollTimeoutError),
    #[error("interrupted while waiting")]
    Interrupted,
}

/// Bounded, cancellable retry loop.
pub struct Poller<'a> {
    description: String,
    spec: PollSpec,
    cancel: CancellationToken,
    spinner: bool,
    observer: Option<Box<dyn FnMut(Attempt) + Send + 'a>>,
}

impl<'a> Poller<'a> {
    /// Create a poller for `description` with the given budget.
    pub fn new(description: impl Into<String>, spec: PollSpec) -> Self {
        Self {
            description: description.into(),
            spec,
            cancel: CancellationToken::new(),
            spinner: false,
            observer: None,
        }
    }

    /// Abort between attempts once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: &CancellationToken) -> Self {
        self.cancel = cancel.clone();
        self
    }

    /// Show a terminal spinner with the current attempt.
    #[must_use]
    pub fn with_spinner(mut self) -> Self {
        self.spinner = true;
        self
    }

    /// Call `observer` before every check.
    #[must_use]
    pub fn on_attempt(mut self, observer: impl FnMut(Attempt) + Send + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Run `check` until it reports ready or the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Timeout`] after `max_attempts` unsuccessful checks
    /// and [`PollError::Interrupted`] if cancellation is observed.
    pub async fn run<F, Fut>(mut self, mut check: F) -> Result<Attempt, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let started = Instant::now();
        let max = self.spec.max_attempts;
        let progress = self.spinner.then(|| self.spinner_bar());
        let mut last_error = None;

        for number in 1..=max {
            if self.cancel.is_cancelled() {
                finish(progress.as_ref());
                return Err(PollError::Interrupted);
            }

            let attempt = Attempt { number, max };
            if let Some(observer) = self.observer.as_mut() {
                observer(attempt);
            }
            if let Some(bar) = &progress {
                bar.set_message(format!("{} (attempt {attempt})", self.description));
            }

            match check().await {
                Ok(true) => {
                    debug!(attempt = number, "{} ready", self.description);
                    finish(progress.as_ref());
                    return Ok(attempt);
                }
                Ok(false) => {
                    debug!(attempt = number, "{} not ready", self.description);
                    last_error = None;
                }
                Err(e) => {
                    debug!(attempt = number, error = %e, "{} check failed", self.description);
                    last_error = Some(format!("{e:#}"));
                }
            }

            if number < max {
                tokio::select! {
                    () = tokio::time::sleep(self.spec.delay) => {}
                    () = self.cancel.cancelled() => {
                        finish(progress.as_ref());
                        return Err(PollError::Interrupted);
                    }
                }
            }
        }

        finish(progress.as_ref());
        Err(PollError::Timeout(PollTimeoutError {
            description: self.description,
            attempts: max,
            max_attempts: max,
            elapsed: started.elapsed(),
            last_error,
        }))
    }

    fn spinner_bar(&self) -> ProgressBar {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("  {spinner:.cyan} {msg} [{elapsed}]") {
            bar.set_style(style);
        }
        bar.set_message(self.description.clone());
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    }
}

fn finish(progress: Option<&ProgressBar>) {
    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
}
