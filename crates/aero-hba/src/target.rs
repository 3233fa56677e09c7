//! Per-target admission state.
//!
//! One [`TargetState`] exists for every target id the adapter was configured with. Entries
//! are created at attach time and never destroyed; device arrival and departure only change
//! their presence fields (see [`crate::presence`]).

use serde::Serialize;

use crate::command::{Command, CommandFlags, TargetId};
use crate::config::{millis, AdapterConfig};
use crate::presence::{DeviceMetadata, PresenceState};
use crate::throttle::Throttle;
use crate::{HbaError, Result};

/// Per-target tunables and negotiated parameters exposed through
/// [`Adapter::get_capability`](crate::Adapter::get_capability).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    /// Tagged (concurrent) queueing. When disabled every command is treated as untagged.
    TaggedQueueing,
    /// Always 1: the adapter can run untagged commands. Read-only.
    UntaggedQueueing,
    AutoRequestSense,
    /// Queue-full/busy retries per command. Zero surfaces the first queue-full.
    QfullRetries,
    /// Milliseconds before a target throttled to zero by queue-full is reopened.
    QfullRetryInterval,
    LunReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TargetCaps {
    pub(crate) tagged: bool,
    pub(crate) auto_request_sense: bool,
    pub(crate) lun_reset: bool,
}

impl Default for TargetCaps {
    fn default() -> Self {
        Self {
            tagged: true,
            auto_request_sense: true,
            lun_reset: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TargetState {
    pub(crate) id: TargetId,
    pub(crate) in_flight: u32,
    /// Commands for this target sitting in the wait queue.
    pub(crate) waiting: u32,
    pub(crate) throttle: Throttle,
    pub(crate) max_throttle: u16,
    pub(crate) reset_delay_ms: i64,
    pub(crate) qfull_retries: u8,
    pub(crate) qfull_retry_interval_ms: i64,
    pub(crate) qfull_restart_ms: i64,
    /// Longest timeout among the commands of the current outstanding batch.
    pub(crate) timebase_ms: i64,
    /// Countdown shared by the whole batch; refreshed to `timebase_ms` on progress.
    pub(crate) timeout_ms: i64,
    /// 0 = no recovery attempted; 1 = a target reset was issued and not yet cleared.
    pub(crate) escalation: u8,
    pub(crate) untagged_active: bool,
    pub(crate) presence: PresenceState,
    pub(crate) offline_delay_ms: i64,
    pub(crate) offline_deferred: bool,
    pub(crate) online_pending: u32,
    pub(crate) offline_pending: u32,
    pub(crate) gone: bool,
    pub(crate) device: Option<DeviceMetadata>,
    pub(crate) caps: TargetCaps,
}

impl TargetState {
    pub(crate) fn new(id: TargetId, config: &AdapterConfig) -> Self {
        Self {
            id,
            in_flight: 0,
            waiting: 0,
            throttle: Throttle::Max,
            max_throttle: config.max_throttle,
            reset_delay_ms: 0,
            qfull_retries: config.qfull_retries,
            qfull_retry_interval_ms: millis(config.qfull_retry_interval),
            qfull_restart_ms: 0,
            timebase_ms: 0,
            timeout_ms: 0,
            escalation: 0,
            untagged_active: false,
            presence: PresenceState::Inactive,
            offline_delay_ms: 0,
            offline_deferred: false,
            online_pending: 0,
            offline_pending: 0,
            gone: false,
            device: None,
            caps: TargetCaps::default(),
        }
    }

    /// Whether `cmd` needs the target to itself.
    pub(crate) fn requires_exclusive(&self, cmd: &Command) -> bool {
        cmd.flags.contains(CommandFlags::UNTAGGED) || !self.caps.tagged
    }

    /// Records a new command of `timeout_ms` joining the outstanding batch.
    pub(crate) fn note_started(&mut self, timeout_ms: i64) {
        self.in_flight += 1;
        if timeout_ms > self.timebase_ms {
            self.timebase_ms = timeout_ms;
            self.timeout_ms = timeout_ms;
        }
    }

    /// Records a command leaving the slot pool.
    pub(crate) fn note_released(&mut self, exclusive: bool, quiesced: bool) {
        debug_assert!(self.in_flight > 0, "target {} in-flight underflow", self.id);
        self.in_flight = self.in_flight.saturating_sub(1);

        if exclusive && self.untagged_active {
            self.untagged_active = false;
            self.restore_max(quiesced);
        }

        if self.in_flight == 0 {
            self.timebase_ms = 0;
            self.timeout_ms = 0;
            if self.throttle == Throttle::Drain {
                self.restore_max(quiesced);
            }
        } else {
            self.timeout_ms = self.timebase_ms;
        }
    }

    pub(crate) fn capability(&self, cap: Capability) -> u32 {
        match cap {
            Capability::TaggedQueueing => u32::from(self.caps.tagged),
            Capability::UntaggedQueueing => 1,
            Capability::AutoRequestSense => u32::from(self.caps.auto_request_sense),
            Capability::QfullRetries => u32::from(self.qfull_retries),
            Capability::QfullRetryInterval => {
                u32::try_from(self.qfull_retry_interval_ms).unwrap_or(u32::MAX)
            }
            Capability::LunReset => u32::from(self.caps.lun_reset),
        }
    }

    pub(crate) fn set_capability(&mut self, cap: Capability, value: u32) -> Result<()> {
        match cap {
            Capability::TaggedQueueing => self.caps.tagged = value != 0,
            Capability::UntaggedQueueing => return Err(HbaError::ReadOnlyCapability(cap)),
            Capability::AutoRequestSense => self.caps.auto_request_sense = value != 0,
            Capability::QfullRetries => {
                self.qfull_retries = u8::try_from(value).unwrap_or(u8::MAX);
            }
            Capability::QfullRetryInterval => self.qfull_retry_interval_ms = i64::from(value),
            Capability::LunReset => self.caps.lun_reset = value != 0,
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            target: self.id,
            in_flight: self.in_flight,
            waiting: self.waiting,
            throttle: self.throttle,
            reset_delay_ms: self.reset_delay_ms.max(0) as u64,
            qfull_retries: self.qfull_retries,
            qfull_retry_interval_ms: self.qfull_retry_interval_ms.max(0) as u64,
            escalation: self.escalation,
            presence: self.presence,
            offline_delay_ms: self.offline_delay_ms.max(0) as u64,
            gone: self.gone,
            device: self.device,
        }
    }
}

/// Diagnostic view of a target returned by
/// [`Adapter::get_target_state`](crate::Adapter::get_target_state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSnapshot {
    pub target: TargetId,
    pub in_flight: u32,
    pub waiting: u32,
    pub throttle: Throttle,
    pub reset_delay_ms: u64,
    pub qfull_retries: u8,
    pub qfull_retry_interval_ms: u64,
    pub escalation: u8,
    pub presence: PresenceState,
    pub offline_delay_ms: u64,
    pub gone: bool,
    pub device: Option<DeviceMetadata>,
}

#[derive(Debug)]
pub(crate) struct TargetTable {
    targets: Vec<TargetState>,
}

impl TargetTable {
    pub(crate) fn new(config: &AdapterConfig) -> Self {
        Self {
            targets: (0..config.targets)
                .map(|id| TargetState::new(id, config))
                .collect(),
        }
    }

    pub(crate) fn len(&self) -> u16 {
        self.targets.len() as u16
    }

    pub(crate) fn get(&self, target: TargetId) -> Result<&TargetState> {
        let targets = self.len();
        self.targets
            .get(usize::from(target))
            .ok_or(HbaError::InvalidTarget { target, targets })
    }

    pub(crate) fn get_mut(&mut self, target: TargetId) -> Result<&mut TargetState> {
        let targets = self.len();
        self.targets
            .get_mut(usize::from(target))
            .ok_or(HbaError::InvalidTarget { target, targets })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TargetState> {
        self.targets.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut TargetState> {
        self.targets.iter_mut()
    }
}
