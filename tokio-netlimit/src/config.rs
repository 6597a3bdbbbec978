//! Deserializable bandwidth settings.
//!
//! ```
//! use tokio_netlimit::config::BandwidthConfig;
//!
//! let cfg: BandwidthConfig = serde_json::from_str(
//!     r#"{ "read": { "bytes_per_sec": 65536, "burst": 8192 } }"#,
//! ).unwrap();
//! cfg.validate().unwrap();
//!
//! let (read, write) = cfg.limiters();
//! assert!(read.is_some());
//! assert!(write.is_none());
//! ```
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::{SharedLimiter, TokenBucket};

/// One direction's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimit {
    /// Sustained rate. `0` disables limiting.
    pub bytes_per_sec: usize,

    /// Largest single charge, defaults to `bytes_per_sec`.
    #[serde(default)]
    pub burst: Option<usize>,
}

impl RateLimit {
    pub fn new(bytes_per_sec: usize) -> Self {
        Self {
            bytes_per_sec,
            burst: None,
        }
    }

    #[must_use]
    pub fn with_burst(mut self, burst: usize) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn burst(&self) -> usize {
        self.burst.unwrap_or(self.bytes_per_sec)
    }

    pub fn to_limiter(&self) -> SharedLimiter {
        TokenBucket::new(self.bytes_per_sec, self.burst())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{direction} burst must be greater than 0 when a rate of {rate} bytes/s is set")]
    ZeroBurst {
        direction: &'static str,
        rate: usize,
    },
}

/// Read and write budgets of a connection (or of every connection built from it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BandwidthConfig {
    #[serde(default)]
    pub read: Option<RateLimit>,

    #[serde(default)]
    pub write: Option<RateLimit>,
}

impl BandwidthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (direction, limit) in [("read", &self.read), ("write", &self.write)] {
            match limit {
                Some(limit) if limit.bytes_per_sec > 0 && limit.burst() == 0 => {
                    return Err(ConfigError::ZeroBurst {
                        direction,
                        rate: limit.bytes_per_sec,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fresh limiters for the read and write directions. Unset directions stay unlimited.
    ///
    /// Each call builds new buckets; clone the returned handles to share a budget.
    pub fn limiters(&self) -> (Option<SharedLimiter>, Option<SharedLimiter>) {
        (
            self.read.as_ref().map(RateLimit::to_limiter),
            self.write.as_ref().map(RateLimit::to_limiter),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::Limiter;

    #[test]
    fn burst_defaults_to_rate() {
        let cfg: BandwidthConfig =
            serde_json::from_str(r#"{ "write": { "bytes_per_sec": 1024 } }"#).unwrap();

        assert_eq!(cfg.read, None);
        assert_eq!(cfg.write, Some(RateLimit::new(1024)));
        assert_eq!(cfg.write.unwrap().burst(), 1024);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<BandwidthConfig>(
            r#"{ "read": { "bytes_per_sec": 1, "rate": 2 } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");

        assert!(serde_json::from_str::<BandwidthConfig>(r#"{ "both": null }"#).is_err());
    }

    #[test]
    fn zero_burst_with_rate_is_invalid() {
        let cfg = BandwidthConfig {
            read: Some(RateLimit::new(10)),
            write: Some(RateLimit::new(10).with_burst(0)),
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroBurst {
                direction: "write",
                rate: 10
            })
        );

        // Zero rate means unlimited, the burst is irrelevant then.
        let cfg = BandwidthConfig {
            read: Some(RateLimit::new(0)),
            write: None,
        };
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn limiters_follow_the_config() {
        let cfg = BandwidthConfig {
            read: Some(RateLimit::new(4096).with_burst(512)),
            write: None,
        };

        let (read, write) = cfg.limiters();
        assert_eq!(read.unwrap().limit(), 512);
        assert!(write.is_none());

        let (again, _) = cfg.limiters();
        let (other, _) = cfg.limiters();
        assert!(!std::sync::Arc::ptr_eq(&again.unwrap(), &other.unwrap()));
    }
}
