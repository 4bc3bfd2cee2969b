// pgsnapshot/src/backup/retry.rs
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, Result};

/// Result of one polling attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Ready(T),
    /// Not there yet; carries the observed condition for diagnostics.
    Pending(String),
}

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            factor: 5.0,
            jitter: 0.1,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no waiting between attempts.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::ZERO,
            factor: 1.0,
            jitter: 0.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(self.factor >= 1.0) {
            return Err(AppError::Config(format!(
                "retry.factor must be >= 1.0, got {}",
                self.factor
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(AppError::Config(format!(
                "retry.jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Delay to wait after the failed attempt number `attempt` (0 based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let spread = if self.jitter > 0.0 {
            rand::rng().random_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::try_from_secs_f64(capped * (1.0 + spread)).unwrap_or(self.max_delay)
    }

    /// Calls `attempt` until it is ready, at most `max_attempts` times.
    ///
    /// Errors from `attempt` abort immediately. Running out of attempts turns
    /// the last pending condition into an error through `exhausted`.
    pub async fn retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
        exhausted: impl FnOnce(String) -> AppError,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let mut last_condition = String::new();
        for n in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled("retry loop".into()));
            }
            match attempt(n).await? {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Pending(condition) => last_condition = condition,
            }

            if n + 1 < self.max_attempts {
                let delay = self.delay_for(n);
                tracing::trace!(attempt = n + 1, ?delay, condition = %last_condition, "Retrying");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(AppError::Cancelled("retry backoff".into()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        Err(exhausted(last_condition))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
