use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::err_config;
use crate::utils::Json;
use crate::Result;

pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 64;

/// Throttle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    /// num_tokens is the budget the bucket starts with.
    /// Clamped to `capacity` when the throttle is built.
    pub num_tokens: f64,

    /// delay_ms is the tick delay in milliseconds: the shortest time the
    /// admission worker sleeps before checking the bucket again.
    /// Must be greater than 0.
    pub delay_ms: u64,

    /// refill_rate is the number of tokens added per second until the first
    /// request brings its own rate. 0 means unlimited.
    pub refill_rate: f64,

    /// default_cost is charged for requests that do not name a cost.
    pub default_cost: f64,

    /// capacity is the maximum number of tokens the bucket can hold.
    /// 0 disables throttling entirely.
    pub capacity: f64,

    /// max_queue_depth bounds the number of requests waiting to be served.
    /// Submitters wait when the queue is full. 0 is treated as 1.
    pub max_queue_depth: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            num_tokens: 0.0,
            delay_ms: 1,
            refill_rate: 0.001,
            default_cost: 1.0,
            capacity: 1.0,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

impl<'a> Json<'a> for ThrottleConfig {
    type Item = ThrottleConfig;
}

impl ThrottleConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let numbers = [
            ("num_tokens", self.num_tokens),
            ("refill_rate", self.refill_rate),
            ("default_cost", self.default_cost),
            ("capacity", self.capacity),
        ];
        for (name, value) in numbers {
            if !value.is_finite() || value < 0.0 {
                return Err(err_config!(
                    "{name} must be finite and non-negative, got {value}"
                ));
            }
        }

        if self.delay_ms == 0 {
            return Err(err_config!("delay_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Read a JSON config file. Missing fields take their default values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ThrottleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delay(), Duration::from_millis(1));
        assert_eq!(config.max_queue_depth, DEFAULT_MAX_QUEUE_DEPTH);
    }

    #[test]
    fn test_zero_queue_depth_is_valid() {
        let config = ThrottleConfig::from_json(r#"{ "max_queue_depth": 0 }"#).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = ThrottleConfig::from_json(r#"{ "capacity": 10.0, "delay_ms": 5 }"#).unwrap();
        assert_eq!(config.capacity, 10.0);
        assert_eq!(config.delay_ms, 5);
        assert_eq!(config.default_cost, 1.0);
        assert_eq!(config.refill_rate, 0.001);
    }

    #[test]
    fn test_json_export() {
        let config = ThrottleConfig {
            capacity: 3.0,
            refill_rate: 2.0,
            ..Default::default()
        };
        let s = config.to_json().unwrap();
        let back = ThrottleConfig::from_json(&s).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_reject_bad_numbers() {
        let bad = [
            ThrottleConfig {
                capacity: -1.0,
                ..Default::default()
            },
            ThrottleConfig {
                refill_rate: f64::NAN,
                ..Default::default()
            },
            ThrottleConfig {
                num_tokens: f64::INFINITY,
                ..Default::default()
            },
            ThrottleConfig {
                delay_ms: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
        }
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join("throttle_config_test.json");
        std::fs::write(&path, r#"{ "num_tokens": 2.0, "capacity": 4.0 }"#).unwrap();
        let config = ThrottleConfig::from_file(&path).unwrap();
        assert_eq!(config.num_tokens, 2.0);
        assert_eq!(config.capacity, 4.0);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            ThrottleConfig::from_file(&path),
            Err(crate::Error::Io(_))
        ));
    }

    #[test]
    fn test_from_file_bad_json() {
        let path = std::env::temp_dir().join("throttle_config_bad_test.json");
        std::fs::write(&path, "{ capacity: }").unwrap();
        assert!(matches!(
            ThrottleConfig::from_file(&path),
            Err(crate::Error::Decode(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
