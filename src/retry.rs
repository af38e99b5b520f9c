//! Run a recognition job, retrying failures with a fixed delay.
//!
//! The retry loop is an explicit state machine:
//!
//! ```text
//! Idle -> Attempting -> Succeeded
//!             |  ^
//!             v  |
//!           Waiting
//!             |
//!             v
//!           Failed   (only reachable from Attempting, on the last attempt)
//! ```
//!
//! Waiting goes through an injected [`Delay`], so tests never sleep.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use schemars::JsonSchema;

use crate::{engine::Scheduler, error::OcrError, log_sink::LogSink, pages::Page, prelude::*};

/// Default number of attempts per recognition job.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Something which can wait. Lets tests observe delays without sleeping.
#[async_trait]
pub trait Delay: Send + Sync + 'static {
    /// Wait for `duration`.
    async fn delay(&self, duration: Duration);
}

/// A [`Delay`] which uses the Tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn delay(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How often, and how patiently, to retry a recognition job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: NonZeroU32,
    delay: Duration,
}

impl RetryPolicy {
    /// Create a new policy. `max_attempts` counts the first try, and must be at
    /// least 1.
    pub fn new(max_attempts: i64, delay: Duration) -> Result<Self, OcrError> {
        u32::try_from(max_attempts)
            .ok()
            .and_then(NonZeroU32::new)
            .map(|max_attempts| Self {
                max_attempts,
                delay,
            })
            .ok_or_else(|| {
                OcrError::Configuration(format!(
                    "max attempts must be between 1 and {}, got {}",
                    u32::MAX,
                    max_attempts
                ))
            })
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.get()
    }

    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// A failed recognition attempt.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
pub struct Attempt {
    /// Which attempt this was, starting from 1.
    pub number: u32,

    /// Why it failed.
    pub error: String,
}

/// Result of [`run_job`].
#[derive(Debug)]
pub struct JobReport {
    /// The recognized text, or the final attempt's error.
    pub result: Result<String, OcrError>,

    /// Every failed attempt, including the final one if we gave up.
    pub failed_attempts: Vec<Attempt>,
}

/// States of our retry loop.
enum JobState {
    /// Nothing has happened yet.
    Idle,
    /// About to submit attempt number `attempt`.
    Attempting { attempt: u32 },
    /// Attempt `attempt` failed, and another attempt will follow.
    Waiting { attempt: u32 },
    /// We have text.
    Succeeded { text: String },
    /// Attempt `attempt` failed, and it was the last one.
    Failed { attempt: u32, error: anyhow::Error },
}

/// Submit `page` to `scheduler` until it succeeds or we run out of attempts.
#[instrument(level = "debug", skip_all, fields(max_attempts = policy.max_attempts()))]
pub async fn run_job(
    scheduler: &Scheduler,
    page: &Page,
    policy: &RetryPolicy,
    delay: &Arc<dyn Delay>,
    log: &Arc<dyn LogSink>,
) -> JobReport {
    let max_attempts = policy.max_attempts();
    let mut failed_attempts = vec![];
    let mut state = JobState::Idle;
    loop {
        state = match state {
            JobState::Idle => JobState::Attempting { attempt: 1 },
            JobState::Attempting { attempt } => match scheduler.add_job(page).await {
                Ok(text) => {
                    if attempt > 1 {
                        debug!(attempt, "Recognition succeeded after retrying");
                    }
                    JobState::Succeeded { text }
                }
                Err(error) => {
                    log.log(&format!(
                        "OCR attempt {attempt}/{max_attempts} failed: {error:#}"
                    ));
                    failed_attempts.push(Attempt {
                        number: attempt,
                        error: format!("{error:#}"),
                    });
                    if attempt < max_attempts {
                        JobState::Waiting { attempt }
                    } else {
                        JobState::Failed { attempt, error }
                    }
                }
            },
            JobState::Waiting { attempt } => {
                delay.delay(policy.delay()).await;
                JobState::Attempting {
                    attempt: attempt + 1,
                }
            }
            JobState::Succeeded { text } => {
                return JobReport {
                    result: Ok(text),
                    failed_attempts,
                };
            }
            JobState::Failed { attempt, error } => {
                warn!(attempts = attempt, "Giving up on recognition job: {:#}", error);
                return JobReport {
                    result: Err(OcrError::Recognition {
                        attempts: attempt,
                        source: error,
                    }),
                    failed_attempts,
                };
            }
        };
    }
}

/// A [`Delay`] which just counts calls, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct CountingDelay {
    calls: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl CountingDelay {
    /// How many times have we been asked to wait?
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Every duration we were asked to wait.
    pub fn durations(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Delay for CountingDelay {
    async fn delay(&self, duration: Duration) {
        self.calls.lock().unwrap().push(duration);
    }
}
