//! Admission control.
//!
//! [`AdapterState`] is everything guarded by the adapter-wide lock: the slot pool, the
//! target table and the wait queue. Every method here runs with that lock held and never
//! invokes a caller callback; finished commands collect in `done` and are delivered after
//! the lock is released.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use serde::Serialize;

use crate::command::{
    Command, CommandFlags, CompletionReason, Finished, RejectReason, Rejection, Submission,
};
use crate::command::{CommandId, TargetId};
use crate::config::{millis, AdapterConfig};
use crate::error::TransportError;
use crate::presence::PresenceWork;
use crate::queue::CommandQueue;
use crate::slots::{SlotId, SlotPool};
use crate::target::{TargetState, TargetTable};
use crate::throttle::Throttle;
use crate::transport::{SubmitRequest, Transport};
use crate::{HbaError, Result};

/// Counters returned by [`Adapter::stats`](crate::Adapter::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    /// Queue-full/busy resubmissions.
    pub retries: u64,
    pub aborts: u64,
    /// Commands whose own timer expired while in flight.
    pub timeouts: u64,
    pub target_resets: u64,
    pub bus_resets: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub pending_acks: usize,
    pub quiesced: bool,
    pub failed: bool,
}

/// Result of [`Adapter::abort`](crate::Adapter::abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The command was still queued and has been completed with `Aborted`.
    Removed,
    /// The transport was asked to abort the in-flight command; it completes with `Aborted`
    /// once the transport reports back.
    Requested,
}

pub(crate) struct AdapterState {
    pub(crate) slots: SlotPool,
    pub(crate) targets: TargetTable,
    pub(crate) waitq: CommandQueue,
    pub(crate) quiesced: bool,
    pub(crate) failed: bool,
    pub(crate) bus_reset_pending: bool,
    pub(crate) pending_acks: VecDeque<Command>,
    pub(crate) done: Vec<Finished>,
    pub(crate) stats: AdapterStats,
    pub(crate) presence_tx: Sender<PresenceWork>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) tick_ms: i64,
    pub(crate) default_timeout_ms: i64,
    pub(crate) reset_delay_ms: i64,
    pub(crate) offline_delay_ms: i64,
}

impl AdapterState {
    pub(crate) fn new(
        config: &AdapterConfig,
        transport: Arc<dyn Transport>,
        presence_tx: Sender<PresenceWork>,
    ) -> Self {
        Self {
            slots: SlotPool::new(config.slots),
            targets: TargetTable::new(config),
            waitq: CommandQueue::new(),
            quiesced: false,
            failed: false,
            bus_reset_pending: false,
            pending_acks: VecDeque::new(),
            done: Vec::new(),
            stats: AdapterStats::default(),
            presence_tx,
            transport,
            tick_ms: config.tick_ms(),
            default_timeout_ms: millis(config.default_command_timeout),
            reset_delay_ms: millis(config.reset_delay),
            offline_delay_ms: millis(config.offline_delay),
        }
    }

    /// Admits, queues, rejects or terminates a caller command.
    pub(crate) fn accept(&mut self, cmd: Command) -> Submission {
        self.stats.submitted += 1;
        let id = cmd.id();

        let Ok(t) = self.targets.get(cmd.target()) else {
            self.finish(cmd, CompletionReason::Terminated, 0);
            return Submission::Accepted;
        };
        if self.failed || t.throttle == Throttle::Choke {
            tracing::debug!(%id, "adapter failed; terminating");
            self.finish(cmd, CompletionReason::Terminated, 0);
            return Submission::Accepted;
        }
        if t.gone {
            tracing::debug!(%id, target_id = t.id, "device gone");
            self.finish(cmd, CompletionReason::DeviceGone, 0);
            return Submission::Accepted;
        }
        let presence_transition = t.presence.is_pre_offline();

        if cmd.flags.contains(CommandFlags::NO_QUEUE) {
            if presence_transition {
                return self.reject(cmd, RejectReason::PresenceTransition);
            }
            if t.waiting > 0 || !self.can_admit(&cmd) {
                return self.reject(cmd, RejectReason::Busy);
            }
            self.start(cmd);
            return Submission::Accepted;
        }

        if !self.waitq.is_empty() {
            self.enqueue(cmd);
            self.restart();
            return if self.waitq.contains(id) {
                Submission::Queued
            } else {
                Submission::Accepted
            };
        }

        if self.can_admit(&cmd) {
            self.start(cmd);
            Submission::Accepted
        } else {
            tracing::debug!(%id, target_id = cmd.target(), "queued");
            self.enqueue(cmd);
            Submission::Queued
        }
    }

    fn reject(&mut self, cmd: Command, reason: RejectReason) -> Submission {
        tracing::debug!(id = %cmd.id(), %reason, "rejected");
        self.stats.rejected += 1;
        Submission::Rejected(Rejection::new(reason, cmd))
    }

    /// Whether `cmd` may take a slot right now. An exclusive command arriving while its
    /// target is busy puts the target into `Drain`.
    pub(crate) fn can_admit(&mut self, cmd: &Command) -> bool {
        let quiesced = self.quiesced;
        if !self.slots.has_free() {
            return false;
        }
        let Ok(t) = self.targets.get_mut(cmd.target()) else {
            return false;
        };
        target_admits(t, cmd, quiesced)
    }

    /// Links `cmd` into the wait queue (front if flagged `HEAD`).
    pub(crate) fn enqueue(&mut self, cmd: Command) {
        if let Ok(t) = self.targets.get_mut(cmd.target()) {
            t.waiting += 1;
        }
        self.waitq.push(cmd);
    }

    fn note_dequeued(&mut self, target: TargetId, n: usize) {
        if let Ok(t) = self.targets.get_mut(target) {
            t.waiting = t.waiting.saturating_sub(n as u32);
        }
    }

    /// Occupies a slot and hands `cmd` to the transport. The caller has checked admission.
    pub(crate) fn start(&mut self, mut cmd: Command) {
        let Some(slot) = self.slots.find_free() else {
            self.enqueue(cmd);
            return;
        };
        let quiesced = self.quiesced;
        let tick_ms = self.tick_ms;
        let timeout_ms = if cmd.timeout().is_zero() {
            self.default_timeout_ms
        } else {
            millis(cmd.timeout())
        };
        // Never let a command expire before the first tick has had a chance to see it.
        cmd.active_timeout_ms = if timeout_ms <= tick_ms {
            timeout_ms + tick_ms
        } else {
            timeout_ms
        };

        let exclusive = match self.targets.get(cmd.target()) {
            Ok(t) => t.requires_exclusive(&cmd),
            Err(_) => {
                self.finish(cmd, CompletionReason::Terminated, 0);
                return;
            }
        };
        if exclusive {
            cmd.flags.insert(CommandFlags::UNTAGGED);
        }
        cmd.flags.insert(CommandFlags::IN_TRANSPORT);

        let (id, target) = (cmd.id(), cmd.target());
        if let Err(mut cmd) = self.slots.occupy(slot, cmd) {
            // `find_free` just returned this slot.
            tracing::error!(%slot, id = %cmd.id(), "slot unexpectedly occupied");
            cmd.flags.remove(CommandFlags::IN_TRANSPORT);
            self.enqueue(cmd);
            return;
        }
        if let Ok(t) = self.targets.get_mut(target) {
            if exclusive {
                t.untagged_active = true;
                t.set_throttle(Throttle::Limit(1), quiesced);
            }
            t.note_started(timeout_ms);
        }
        tracing::debug!(%id, %slot, exclusive, "started");
        self.submit_slot(slot);
    }

    fn submit_slot(&mut self, slot: SlotId) {
        let transport = Arc::clone(&self.transport);
        let Some(cmd) = self.slots.get(slot) else {
            return;
        };
        let request = SubmitRequest {
            target: cmd.target(),
            lun: cmd.lun(),
            payload: cmd.payload(),
            tagged: !cmd.flags.contains(CommandFlags::UNTAGGED),
            control: cmd.is_control(),
            context: cmd.context(),
        };
        if let Err(err) = transport.submit(slot, &request) {
            tracing::warn!(%slot, %err, "transport refused submission");
            if let Some(cmd) = self.release(slot) {
                if !cmd.is_control() {
                    self.finish(cmd, CompletionReason::TransportError, 0);
                }
            }
        }
    }

    /// Vacates `slot` and unwinds the per-target accounting. `None` if it was already free.
    pub(crate) fn release(&mut self, slot: SlotId) -> Option<Command> {
        let mut cmd = self.slots.vacate(slot)?;
        cmd.flags.remove(CommandFlags::IN_TRANSPORT);
        if cmd.is_control() {
            return Some(cmd);
        }
        let quiesced = self.quiesced;
        if let Ok(t) = self.targets.get_mut(cmd.target()) {
            t.note_released(cmd.flags.contains(CommandFlags::UNTAGGED), quiesced);
        }
        Some(cmd)
    }

    pub(crate) fn finish(&mut self, cmd: Command, reason: CompletionReason, residual: u64) {
        if !cmd.is_control() {
            self.stats.completed += 1;
        }
        self.done.push(cmd.finish(reason, residual));
    }

    /// Walks the wait queue in order, starting every command whose target now admits it.
    /// Once a command for a target is left waiting, later commands for that target are
    /// skipped so per-target order holds.
    pub(crate) fn restart(&mut self) {
        self.send_pending_acks();
        if self.failed {
            return;
        }

        let quiesced = self.quiesced;
        let mut blocked: Vec<TargetId> = Vec::new();
        let mut cur = self.waitq.first();
        while let Some(idx) = cur {
            cur = self.waitq.next(idx);
            let Some(cmd) = self.waitq.get(idx) else {
                continue;
            };
            let target = cmd.target();
            if blocked.contains(&target) {
                continue;
            }

            let Ok(t) = self.targets.get_mut(target) else {
                continue;
            };
            if t.gone {
                if let Some(cmd) = self.waitq.take(idx) {
                    self.note_dequeued(target, 1);
                    self.finish(cmd, CompletionReason::DeviceGone, 0);
                }
                continue;
            }
            if !self.slots.has_free() {
                break;
            }
            if !target_admits(t, cmd, quiesced) {
                blocked.push(target);
                continue;
            }

            if let Some(cmd) = self.waitq.take(idx) {
                self.note_dequeued(target, 1);
                self.start(cmd);
            }
        }
    }

    /// Removes every queued command for `target` (or all targets) and completes it with
    /// `reason`.
    pub(crate) fn flush_queued(&mut self, target: Option<TargetId>, reason: CompletionReason) {
        let flushed = self
            .waitq
            .drain_where(|c| target.map_or(true, |t| c.target() == t));
        for cmd in flushed {
            self.note_dequeued(cmd.target(), 1);
            self.finish(cmd, reason, 0);
        }
    }

    /// Terminates every in-flight command for `target` (or all targets). Commands whose
    /// own timer already fired are reported as `TimeoutReset` when `reason` is `Reset`.
    pub(crate) fn flush_in_flight(&mut self, target: Option<TargetId>, reason: CompletionReason) {
        let slots = self.slots.find_all(|c| match target {
            Some(t) => !c.is_control() && c.target() == t,
            None => true,
        });
        for slot in slots {
            let Some(cmd) = self.release(slot) else {
                continue;
            };
            if cmd.is_control() {
                tracing::debug!(%slot, "dropping event acknowledgement");
                continue;
            }
            let reason = if cmd.flags.contains(CommandFlags::ABORT_REQUESTED) {
                CompletionReason::Aborted
            } else if reason == CompletionReason::Reset
                && cmd.flags.contains(CommandFlags::TIMED_OUT)
            {
                CompletionReason::TimeoutReset
            } else {
                reason
            };
            self.finish(cmd, reason, 0);
        }
    }

    /// Parks an event acknowledgement until a slot is free.
    pub(crate) fn submit_ack(&mut self, ack: Command) {
        self.pending_acks.push_back(ack);
        self.send_pending_acks();
    }

    pub(crate) fn send_pending_acks(&mut self) {
        if self.failed {
            return;
        }
        while self.slots.has_free() {
            let Some(ack) = self.pending_acks.pop_front() else {
                break;
            };
            let Some(slot) = self.slots.find_free() else {
                self.pending_acks.push_front(ack);
                break;
            };
            if let Err(ack) = self.slots.occupy(slot, ack) {
                self.pending_acks.push_front(ack);
                break;
            }
            self.submit_slot(slot);
        }
    }

    pub(crate) fn abort(&mut self, id: CommandId) -> Result<AbortOutcome> {
        if let Some(cmd) = self.waitq.remove(id) {
            self.note_dequeued(cmd.target(), 1);
            self.stats.aborts += 1;
            tracing::debug!(%id, "aborted while queued");
            self.finish(cmd, CompletionReason::Aborted, 0);
            self.restart();
            return Ok(AbortOutcome::Removed);
        }

        let slot = self
            .slots
            .find_all(|c| c.id() == id)
            .first()
            .copied()
            .ok_or(HbaError::CommandNotFound(id))?;
        if self
            .slots
            .get(slot)
            .is_some_and(|c| c.flags.contains(CommandFlags::ABORT_REQUESTED))
        {
            return Ok(AbortOutcome::Requested);
        }

        self.task_management(|transport| transport.abort(slot))?;
        if let Some(cmd) = self.slots.get_mut(slot) {
            cmd.flags.insert(CommandFlags::ABORT_REQUESTED);
        }
        self.stats.aborts += 1;
        tracing::debug!(%id, %slot, "abort requested");
        Ok(AbortOutcome::Requested)
    }

    /// Runs a synchronous task-management request on the proxy slot.
    pub(crate) fn task_management<F>(&mut self, request: F) -> Result<()>
    where
        F: FnOnce(&dyn Transport) -> std::result::Result<(), TransportError>,
    {
        let transport = Arc::clone(&self.transport);
        tracing::trace!(slot = %self.slots.proxy_slot(), "task management request");
        let Some(_claim) = self.slots.claim_proxy() else {
            return Err(HbaError::TaskManagementBusy);
        };
        request(transport.as_ref()).map_err(HbaError::from)
    }

    pub(crate) fn send_presence_work(&self, work: PresenceWork) {
        if self.presence_tx.send(work).is_err() {
            tracing::warn!(?work, "presence runner is gone; work dropped");
        }
    }

    pub(crate) fn stats(&self) -> AdapterStats {
        AdapterStats {
            in_flight: self.slots.occupied(),
            queued: self.waitq.len(),
            pending_acks: self.pending_acks.len(),
            quiesced: self.quiesced,
            failed: self.failed,
            ..self.stats.clone()
        }
    }
}

fn target_admits(t: &mut TargetState, cmd: &Command, quiesced: bool) -> bool {
    if t.reset_delay_ms > 0 {
        return false;
    }
    if t.requires_exclusive(cmd) {
        if t.in_flight > 0 {
            if matches!(t.throttle, Throttle::Max | Throttle::Limit(_)) {
                t.set_throttle(Throttle::Drain, quiesced);
            }
            return false;
        }
        return t.throttle.admits(0, t.max_throttle);
    }
    t.throttle.admits(t.in_flight, t.max_throttle)
}
