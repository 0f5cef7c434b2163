//! Replay retry policy with exponential backoff and dead-lettering.

use std::time::Duration;

use harbor_common::{Error, RetrySettings};

/// What to do with a mutation whose replay just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureAction {
    /// Keep it queued; do not replay again before `after` has elapsed.
    Retry { after: Duration },
    /// Give up and move it to the dead-letter table.
    DeadLetter { reason: String },
}

/// Configuration for replay retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts after which a mutation is dead-lettered. `None` never gives up.
    pub max_attempts: Option<u32>,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
    /// Whether a permanent client error dead-letters immediately.
    pub dead_letter_client_errors: bool,
}

impl RetryPolicy {
    /// Create a policy giving up after `max_attempts` failures.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::from_settings(&RetrySettings::default())
        }
    }

    /// Retry every failure on the next pass, forever.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
            dead_letter_client_errors: false,
        }
    }

    /// Build a policy from configuration.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter: settings.jitter,
            dead_letter_client_errors: settings.dead_letter_client_errors,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay after the given number of failed attempts.
    ///
    /// Attempt `0` is the first failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Decide the fate of a mutation after its `attempts`-th failure.
    pub fn on_failure(&self, attempts: u32, error: &Error) -> FailureAction {
        if self.dead_letter_client_errors && !error.is_transient() {
            return FailureAction::DeadLetter {
                reason: format!("Rejected: {}", error),
            };
        }

        if let Some(max) = self.max_attempts {
            if attempts >= max {
                return FailureAction::DeadLetter {
                    reason: format!("Gave up after {} attempts: {}", attempts, error),
                };
            }
        }

        FailureAction::Retry {
            after: self.delay_for_attempt(attempts.saturating_sub(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
