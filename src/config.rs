//! Gate construction: a builder for programmatic setup, and a serializable [GateConfig] for
//! loading the numbers from a file or the environment.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    gate::{PauseFn, ResumeFn},
    Balance, ConfigError, Gate,
};

/// How long [Gate::acquire] waits between attempts when all slots are taken.
pub const DEFAULT_ACQUIRE_BUFFER: Duration = Duration::from_millis(200);
/// Margin added to every estimated refill time when pausing.
pub const DEFAULT_PAUSE_BUFFER: Duration = Duration::from_secs(1);

/// Builds a [Gate]. Created by [Gate::builder].
pub struct GateBuilder {
    pub(crate) capacity: u32,
    pub(crate) balance: Balance,
    pub(crate) acquire_buffer: Duration,
    pub(crate) pause_buffer: Duration,
    pub(crate) on_pause: Option<PauseFn>,
    pub(crate) on_resume: Option<ResumeFn>,
}

impl GateBuilder {
    pub(crate) fn new(capacity: u32, balance: Balance) -> Self {
        Self {
            capacity,
            balance,
            acquire_buffer: DEFAULT_ACQUIRE_BUFFER,
            pause_buffer: DEFAULT_PAUSE_BUFFER,
            on_pause: None,
            on_resume: None,
        }
    }

    /// Time to wait between attempts to take a slot when all are held.
    ///
    /// Zero falls back to [DEFAULT_ACQUIRE_BUFFER].
    pub fn with_acquire_buffer(mut self, buffer: Duration) -> Self {
        self.acquire_buffer = if buffer.is_zero() {
            DEFAULT_ACQUIRE_BUFFER
        } else {
            buffer
        };
        self
    }

    /// Extra time added to each pause, on top of the estimated refill time.
    pub fn with_pause_buffer(mut self, buffer: Duration) -> Self {
        self.pause_buffer = buffer;
        self
    }

    /// Called with the reported points and the pause duration whenever a pause starts.
    pub fn on_pause(mut self, f: impl Fn(i32, Duration) + Send + Sync + 'static) -> Self {
        self.on_pause = Some(Box::new(f));
        self
    }

    /// Called whenever a pause ends.
    pub fn on_resume(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_resume = Some(Box::new(f));
        self
    }

    /// Create the [Gate], rejecting a zero capacity.
    pub fn build(self) -> Result<Gate, ConfigError> {
        Gate::from_builder(self)
    }
}

/// Gate configuration, loadable with serde or from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Maximum concurrent holders.
    pub capacity: u32,

    /// Points remaining at or below which admissions pause.
    pub threshold: i32,

    /// Maximum points the upstream holds.
    pub limit: i32,

    /// Points restored per second.
    pub refill_rate: i32,

    /// Poll interval while all slots are held, in milliseconds.
    #[serde(default = "default_acquire_buffer_ms")]
    pub acquire_buffer_ms: u64,

    /// Margin added to each pause, in milliseconds.
    #[serde(default = "default_pause_buffer_ms")]
    pub pause_buffer_ms: u64,
}

fn default_acquire_buffer_ms() -> u64 {
    DEFAULT_ACQUIRE_BUFFER.as_millis() as u64
}

fn default_pause_buffer_ms() -> u64 {
    DEFAULT_PAUSE_BUFFER.as_millis() as u64
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            threshold: 0,
            limit: 1,
            refill_rate: 1,
            acquire_buffer_ms: default_acquire_buffer_ms(),
            pause_buffer_ms: default_pause_buffer_ms(),
        }
    }
}

impl GateConfig {
    pub fn new(capacity: u32, threshold: i32, limit: i32, refill_rate: i32) -> Self {
        Self {
            capacity,
            threshold,
            limit,
            refill_rate,
            ..Self::default()
        }
    }

    /// Load configuration from `QUOTA_GATE_*` environment variables, on top of the defaults.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(capacity) = env_var("QUOTA_GATE_CAPACITY") {
            config.capacity = capacity;
        }
        if let Some(threshold) = env_var("QUOTA_GATE_THRESHOLD") {
            config.threshold = threshold;
        }
        if let Some(limit) = env_var("QUOTA_GATE_LIMIT") {
            config.limit = limit;
        }
        if let Some(rate) = env_var("QUOTA_GATE_REFILL_RATE") {
            config.refill_rate = rate;
        }
        if let Some(ms) = env_var("QUOTA_GATE_ACQUIRE_BUFFER_MS") {
            config.acquire_buffer_ms = ms;
        }
        if let Some(ms) = env_var("QUOTA_GATE_PAUSE_BUFFER_MS") {
            config.pause_buffer_ms = ms;
        }

        config
    }

    pub fn acquire_buffer(&self) -> Duration {
        Duration::from_millis(self.acquire_buffer_ms)
    }

    pub fn pause_buffer(&self) -> Duration {
        Duration::from_millis(self.pause_buffer_ms)
    }

    /// Validate the numbers and start a [GateBuilder] from them, ready for callbacks.
    pub fn builder(&self) -> Result<GateBuilder, ConfigError> {
        let balance = Balance::new(self.threshold, self.limit, self.refill_rate)?;
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        Ok(Gate::builder(self.capacity, balance)
            .with_acquire_buffer(self.acquire_buffer())
            .with_pause_buffer(self.pause_buffer()))
    }
}

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(name, value = %value, "ignoring unparsable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::new(4, 100, 1000, 100);
        assert_eq!(config.acquire_buffer(), DEFAULT_ACQUIRE_BUFFER);
        assert_eq!(config.pause_buffer(), DEFAULT_PAUSE_BUFFER);
    }

    #[test]
    fn test_builds_gate() {
        let gate = GateConfig::new(4, 100, 1000, 100)
            .builder()
            .unwrap()
            .build()
            .unwrap();

        let state = gate.state();
        assert_eq!(state.capacity(), 4);
        assert_eq!(state.remaining(), 1000);
        assert_eq!(gate.balance().threshold(), 100);
    }

    #[test]
    fn test_rejects_invalid() {
        assert_eq!(
            GateConfig::new(0, 100, 1000, 100).builder().err(),
            Some(ConfigError::ZeroCapacity)
        );
        assert_eq!(
            GateConfig::new(1, 100, 1000, 0).builder().err(),
            Some(ConfigError::NonPositiveRefillRate(0))
        );
        assert_eq!(
            GateConfig::new(1, 2000, 1000, 10).builder().err(),
            Some(ConfigError::ThresholdAboveLimit {
                threshold: 2000,
                limit: 1000
            })
        );
    }

    #[test]
    fn test_zero_acquire_buffer_uses_default() {
        let balance = Balance::new(0, 10, 1).unwrap();
        let builder = Gate::builder(1, balance).with_acquire_buffer(Duration::ZERO);
        assert_eq!(builder.acquire_buffer, DEFAULT_ACQUIRE_BUFFER);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{"capacity": 8, "threshold": 50, "limit": 1000, "refill_rate": 50}"#;
        let config: GateConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, GateConfig::new(8, 50, 1000, 50));

        let json = r#"{"capacity": 8, "threshold": 50, "limit": 1000, "refill_rate": 50,
                       "acquire_buffer_ms": 10, "pause_buffer_ms": 0}"#;
        let config: GateConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.acquire_buffer(), Duration::from_millis(10));
        assert_eq!(config.pause_buffer(), Duration::ZERO);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("QUOTA_GATE_CAPACITY", "3");
        std::env::set_var("QUOTA_GATE_THRESHOLD", "100");
        std::env::set_var("QUOTA_GATE_LIMIT", "1000");
        std::env::set_var("QUOTA_GATE_REFILL_RATE", "not-a-number");

        let config = GateConfig::from_env();
        assert_eq!(config.capacity, 3);
        assert_eq!(config.threshold, 100);
        assert_eq!(config.limit, 1000);
        assert_eq!(config.refill_rate, 1);
        assert_eq!(config.pause_buffer(), DEFAULT_PAUSE_BUFFER);
    }
}
