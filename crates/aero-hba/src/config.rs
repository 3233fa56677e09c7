use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{HbaError, Result};

/// Operator-tunable inputs for an [`Adapter`](crate::Adapter).
///
/// Durations are (de)serialized as integer milliseconds so the struct can be loaded from
/// simple JSON config files:
///
/// ```json
/// { "slots": 64, "tick": 500, "qfull_retries": 4 }
/// ```
///
/// Missing fields fall back to [`AdapterConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    /// Hardware concurrency limit (number of I/O slots).
    pub slots: u16,
    /// Number of addressable targets.
    pub targets: u16,
    /// Per-target concurrency when the throttle is at `Max`.
    pub max_throttle: u16,
    /// Watchdog period.
    #[serde(with = "duration_ms")]
    pub tick: Duration,
    /// Timeout applied to commands that do not request one.
    #[serde(with = "duration_ms")]
    pub default_command_timeout: Duration,
    /// Cooldown after a target or bus reset during which the target admits nothing.
    #[serde(with = "duration_ms")]
    pub reset_delay: Duration,
    /// Default number of queue-full/busy retries per command.
    pub qfull_retries: u8,
    /// Default delay before a target throttled to zero by queue-full is reopened.
    #[serde(with = "duration_ms")]
    pub qfull_retry_interval: Duration,
    /// Window between "device not responding" and the offline transition.
    #[serde(with = "duration_ms")]
    pub offline_delay: Duration,
    /// Completion delivery threads. Zero delivers on the completing thread.
    pub delivery_workers: usize,
    /// A worker whose queue is shorter than this is picked without looking further.
    pub delivery_threshold: usize,
    /// Batches up to this size are delivered synchronously even when workers exist.
    pub delivery_sync_limit: usize,
    /// Spin interval used by polled submission and quiesce.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Overall deadline for polled submission.
    #[serde(with = "duration_ms")]
    pub poll_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            slots: 128,
            targets: 16,
            max_throttle: 32,
            tick: Duration::from_secs(1),
            default_command_timeout: Duration::from_secs(60),
            reset_delay: Duration::from_secs(3),
            qfull_retries: 10,
            qfull_retry_interval: Duration::from_millis(100),
            offline_delay: Duration::from_secs(20),
            delivery_workers: 0,
            delivery_threshold: 8,
            delivery_sync_limit: 4,
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_secs(60),
        }
    }
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slots == 0 {
            return Err(HbaError::InvalidConfig("slots must be > 0"));
        }
        if self.slots == u16::MAX {
            // One slot index past the I/O range is reserved for task management.
            return Err(HbaError::InvalidConfig("slots must be < 65535"));
        }
        if self.targets == 0 {
            return Err(HbaError::InvalidConfig("targets must be > 0"));
        }
        if self.max_throttle == 0 {
            return Err(HbaError::InvalidConfig("max_throttle must be > 0"));
        }
        if millis(self.tick) == 0 {
            return Err(HbaError::InvalidConfig("tick must be at least 1ms"));
        }
        if self.delivery_workers > 0 && self.delivery_threshold == 0 {
            return Err(HbaError::InvalidConfig(
                "delivery_threshold must be > 0 when delivery workers are enabled",
            ));
        }
        Ok(())
    }

    pub(crate) fn tick_ms(&self) -> i64 {
        millis(self.tick)
    }
}

/// Whole milliseconds in `d`, saturating at `i64::MAX`.
pub(crate) fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
