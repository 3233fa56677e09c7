//! Device presence (hot-plug) tracking.
//!
//! ```text
//!                 not responding                     delay expires
//!   Inactive ───────────────────────► PreOffline ────────────────────► OfflineInProgress
//!      ▲  │ added                         │ added                            │ added
//!      │  ▼                               ▼                                  ▼
//!      └── OnlineInProgress ◄─────────────┴──────────────────────────────────┘
//!              │ not responding
//!              ▼
//!          PreOfflineNoCancel ── online work done ──► PreOffline (or OfflineInProgress
//!                                                      when the delay already expired)
//! ```
//!
//! Online/offline work runs outside the adapter lock on a [`PresenceRunner`]; its completion
//! re-enters through [`Adapter::presence_work_done`]. Duplicate events each queue their own
//! work item, and a target only returns to `Inactive` once every queued item has finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::adapter::Adapter;
use crate::command::TargetId;
use crate::target::TargetState;
use crate::throttle::Throttle;
use crate::watchdog::BackgroundHandle;
use crate::{HbaError, Result};

const RUNNER_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PresenceState {
    Inactive,
    /// Device stopped responding; offline is scheduled unless it comes back.
    PreOfflineTimeout,
    /// As above, but an online transition is in flight and must finish first.
    PreOfflineTimeoutNoCancel,
    OfflineInProgress,
    OnlineInProgress,
}

impl PresenceState {
    /// States in which the throttle stays at `Hold` regardless of other recovery.
    pub(crate) fn holds_throttle(self) -> bool {
        matches!(
            self,
            PresenceState::PreOfflineTimeout | PresenceState::OfflineInProgress
        )
    }

    pub(crate) fn is_pre_offline(self) -> bool {
        matches!(
            self,
            PresenceState::PreOfflineTimeout | PresenceState::PreOfflineTimeoutNoCancel
        )
    }
}

/// What the transport learned about a newly arrived device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceMetadata {
    pub wwn: u64,
    pub max_luns: u16,
}

/// Background work scheduled by a presence transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceWork {
    Online {
        target: TargetId,
        device: DeviceMetadata,
    },
    Offline {
        target: TargetId,
    },
}

impl PresenceWork {
    pub fn target(&self) -> TargetId {
        match *self {
            PresenceWork::Online { target, .. } | PresenceWork::Offline { target } => target,
        }
    }
}

/// Upper-layer reconfiguration invoked by the [`PresenceRunner`]. May block.
pub trait PresenceHandler: Send + Sync {
    /// Brings the device online. Returns `false` if it could not be configured.
    fn online(&self, target: TargetId, device: &DeviceMetadata) -> bool;

    fn offline(&self, target: TargetId);
}

impl TargetState {
    pub(crate) fn device_not_responding(&mut self, offline_delay_ms: i64, quiesced: bool) {
        match self.presence {
            PresenceState::Inactive => {
                self.presence = PresenceState::PreOfflineTimeout;
                self.offline_delay_ms = offline_delay_ms;
                self.set_throttle(Throttle::Hold, quiesced);
            }
            PresenceState::OnlineInProgress => {
                // Leave the throttle alone so the online work can finish.
                self.presence = PresenceState::PreOfflineTimeoutNoCancel;
                self.offline_delay_ms = offline_delay_ms;
            }
            state => {
                tracing::debug!(target_id = self.id, ?state, "duplicate not-responding event");
                return;
            }
        }
        tracing::info!(target_id = self.id, presence = ?self.presence, "device not responding");
    }

    /// Returns the online work to schedule.
    pub(crate) fn device_added(&mut self, device: DeviceMetadata, quiesced: bool) -> PresenceWork {
        if self.presence != PresenceState::OnlineInProgress {
            tracing::info!(target_id = self.id, from = ?self.presence, wwn = device.wwn, "device added");
        }
        self.presence = PresenceState::OnlineInProgress;
        self.offline_delay_ms = 0;
        self.offline_deferred = false;
        self.online_pending += 1;
        self.device = Some(device);
        self.restore_max(quiesced);
        PresenceWork::Online {
            target: self.id,
            device,
        }
    }

    /// Counts down a pending offline. Returns `true` when offline work must begin now.
    pub(crate) fn tick_presence(&mut self, tick_ms: i64) -> bool {
        if !self.presence.is_pre_offline() || self.offline_delay_ms <= 0 {
            return false;
        }
        self.offline_delay_ms -= tick_ms;
        if self.offline_delay_ms > 0 {
            return false;
        }
        self.offline_delay_ms = 0;
        if self.presence == PresenceState::PreOfflineTimeoutNoCancel && self.online_pending > 0 {
            self.offline_deferred = true;
            return false;
        }
        true
    }

    /// Moves to `OfflineInProgress`. The caller flushes queued work and schedules the
    /// returned item.
    pub(crate) fn begin_offline(&mut self, quiesced: bool) -> PresenceWork {
        tracing::info!(target_id = self.id, "device going offline");
        self.presence = PresenceState::OfflineInProgress;
        self.offline_deferred = false;
        self.offline_delay_ms = 0;
        self.offline_pending += 1;
        self.gone = true;
        self.set_throttle(Throttle::Hold, quiesced);
        PresenceWork::Offline { target: self.id }
    }

    /// Records finished background work. Returns `true` when a deferred offline must begin.
    pub(crate) fn work_done(&mut self, work: &PresenceWork, success: bool, quiesced: bool) -> bool {
        match work {
            PresenceWork::Online { .. } => {
                self.online_pending = self.online_pending.saturating_sub(1);
                self.gone = !success;
                if !success {
                    tracing::warn!(target_id = self.id, "device online failed");
                }
                if self.presence == PresenceState::PreOfflineTimeoutNoCancel
                    && self.online_pending == 0
                {
                    if self.offline_deferred {
                        return true;
                    }
                    self.presence = PresenceState::PreOfflineTimeout;
                    self.set_throttle(Throttle::Hold, quiesced);
                }
            }
            PresenceWork::Offline { .. } => {
                self.offline_pending = self.offline_pending.saturating_sub(1);
            }
        }

        let settling = matches!(
            self.presence,
            PresenceState::OnlineInProgress | PresenceState::OfflineInProgress
        );
        if settling && self.online_pending == 0 && self.offline_pending == 0 {
            tracing::info!(target_id = self.id, from = ?self.presence, gone = self.gone, "presence settled");
            self.presence = PresenceState::Inactive;
            self.restore_max(quiesced);
        }
        false
    }
}

/// Consumer side of the presence work channel.
pub struct PresenceRunner {
    rx: Receiver<PresenceWork>,
    handler: Arc<dyn PresenceHandler>,
}

impl PresenceRunner {
    pub(crate) fn new(rx: Receiver<PresenceWork>, handler: Arc<dyn PresenceHandler>) -> Self {
        Self { rx, handler }
    }

    /// Runs every work item queued so far on the calling thread.
    pub fn run_pending(&self, adapter: &Adapter) -> usize {
        let mut ran = 0;
        while let Ok(work) = self.rx.try_recv() {
            self.run(adapter, work);
            ran += 1;
        }
        ran
    }

    /// Moves the runner onto a dedicated thread. Dropping the handle stops it.
    pub fn spawn(self, adapter: Arc<Adapter>) -> Result<BackgroundHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("aero-hba-presence".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    match self.rx.recv_timeout(RUNNER_POLL) {
                        Ok(work) => self.run(&adapter, work),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|source| HbaError::Spawn {
                what: "presence",
                source,
            })?;
        Ok(BackgroundHandle::new(stop, thread))
    }

    fn run(&self, adapter: &Adapter, work: PresenceWork) {
        let success = match work {
            PresenceWork::Online { target, device } => self.handler.online(target, &device),
            PresenceWork::Offline { target } => {
                self.handler.offline(target);
                true
            }
        };
        if let Err(err) = adapter.presence_work_done(&work, success) {
            tracing::warn!(%err, ?work, "dropping presence completion");
        }
    }
}

pub(crate) fn channel() -> (mpsc::Sender<PresenceWork>, Receiver<PresenceWork>) {
    mpsc::channel()
}
