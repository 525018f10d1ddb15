//! Claim polling with exponential backoff
//!
//! Used by backends that cannot block on an empty queue natively.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often an empty queue is re-checked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Interval after a claim attempt found nothing for the first time
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Upper bound for the backoff
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier applied after each empty attempt
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    /// 50 ms growing by 1.5x up to 1 s
    pub fn new() -> Self {
        Self::default()
    }

    /// First sleep after an empty claim
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Cap on the sleep between claims
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Growth per empty claim, never below 1.0
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Backoff state for one blocking claim
#[derive(Debug)]
pub struct ClaimPoller {
    config: PollerConfig,
    delay: Duration,
}

impl ClaimPoller {
    /// Start at the minimum interval
    pub fn new(config: PollerConfig) -> Self {
        Self {
            delay: config.min_interval,
            config,
        }
    }

    /// Interval to sleep now; the following one grows by the multiplier
    pub fn next_interval(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = self
            .delay
            .mul_f64(self.config.backoff_multiplier)
            .min(self.config.max_interval);
        delay
    }

    /// Back to the minimum interval
    pub fn reset(&mut self) {
        self.delay = self.config.min_interval;
    }
}

/// Durations in config files are integer milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
