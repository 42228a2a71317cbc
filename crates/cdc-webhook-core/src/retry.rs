//! Retry policies and backoff delay arithmetic.
//!
//! A policy allows `max_retries + 1` attempts in total. The delay before
//! retry `i` (0-based, so the first retry is index 0) is
//! `base_interval_seconds` for linear backoff and
//! `base_interval_seconds * 2^i` for exponential backoff. The synchronous
//! coordinator sleeps for this delay; the dispatcher worker adds it to the
//! current time to schedule the next attempt.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Largest shift applied to the exponential multiplier before saturating.
const MAX_EXPONENT: u32 = 32;

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Linear,
    /// Delay doubles with every retry.
    Exponential,
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "LINEAR"),
            Self::Exponential => write!(f, "EXPONENTIAL"),
        }
    }
}

impl FromStr for Backoff {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LINEAR" => Ok(Self::Linear),
            "EXPONENTIAL" => Ok(Self::Exponential),
            _ => Err(CoreError::invalid_input(format!(
                "retry_backoff must be LINEAR or EXPONENTIAL, got '{s}'"
            ))),
        }
    }
}

/// Attempt budget and inter-attempt spacing for one delivery sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    max_retries: u32,
    base_interval_seconds: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a validated retry policy.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if `base_interval_seconds` is zero.
    pub fn new(max_retries: u32, base_interval_seconds: u32, backoff: Backoff) -> Result<Self> {
        if base_interval_seconds == 0 {
            return Err(CoreError::invalid_input("retry_interval must be greater than 0"));
        }
        Ok(Self { max_retries, base_interval_seconds, backoff })
    }

    /// Policy that makes a single attempt and never retries.
    pub fn no_retries() -> Self {
        Self { max_retries: 0, base_interval_seconds: 1, backoff: Backoff::Linear }
    }

    /// Number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Base interval in seconds.
    pub fn base_interval_seconds(&self) -> u32 {
        self.base_interval_seconds
    }

    /// Backoff strategy.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Total attempts this policy allows.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `attempt_index` (0-based).
    pub fn delay(&self, attempt_index: u32) -> Duration {
        let base = u64::from(self.base_interval_seconds);
        let seconds = match self.backoff {
            Backoff::Linear => base,
            Backoff::Exponential => {
                let exponent = attempt_index.min(MAX_EXPONENT);
                base.saturating_mul(1_u64 << exponent)
            },
        };
        Duration::from_secs(seconds)
    }

    /// Every delay in the sequence, one per retry.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|index| self.delay(index)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retries()
    }
}
