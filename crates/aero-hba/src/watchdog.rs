//! Periodic timeout handling and escalating recovery.
//!
//! Each tick, in order:
//!
//! 1. a bus reset requested by the previous tick runs;
//! 2. every in-flight command's own timer is aged; an expiry drains its target;
//! 3. per-target reset delays, queue-full windows and presence timers count down;
//! 4. each target's batch timeout is aged; an underflow starts recovery;
//! 5. dispatch restarts.
//!
//! Recovery escalates per target: a target reset first, then (on failure, or if the target
//! times out again before any command on it succeeds) a bus reset on the next tick, then
//! adapter failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crate::adapter::Adapter;
use crate::command::{CommandFlags, CompletionReason, TargetId};
use crate::dispatch::AdapterState;
use crate::throttle::Throttle;
use crate::transport::ResetScope;
use crate::{HbaError, Result};

impl AdapterState {
    pub(crate) fn watch(&mut self) {
        if self.failed {
            return;
        }
        if std::mem::take(&mut self.bus_reset_pending) {
            self.reset_bus();
            if self.failed {
                return;
            }
        }

        let tick_ms = self.tick_ms;
        let quiesced = self.quiesced;

        let mut expired: Vec<TargetId> = Vec::new();
        for (slot, cmd) in self.slots.iter_mut() {
            if cmd.is_control() || cmd.flags.contains(CommandFlags::TIMED_OUT) {
                continue;
            }
            cmd.active_timeout_ms -= tick_ms;
            if cmd.active_timeout_ms <= 0 {
                tracing::warn!(id = %cmd.id(), %slot, target_id = cmd.target(), "command timed out");
                cmd.flags.insert(CommandFlags::TIMED_OUT);
                expired.push(cmd.target());
            }
        }
        self.stats.timeouts += expired.len() as u64;
        for target in expired {
            if let Ok(t) = self.targets.get_mut(target) {
                if !t.presence.holds_throttle() {
                    t.set_throttle(Throttle::Drain, quiesced);
                }
            }
        }

        let mut offline_due = Vec::new();
        let mut timed_out = Vec::new();
        for t in self.targets.iter_mut() {
            t.tick_throttle(tick_ms, quiesced);
            if t.tick_presence(tick_ms) {
                offline_due.push(t.id);
            }
            if t.in_flight > 0 && t.timebase_ms > 0 {
                t.timeout_ms -= tick_ms;
                if t.timeout_ms <= 0 {
                    timed_out.push(t.id);
                }
            }
        }

        for target in offline_due {
            self.begin_offline(target);
        }
        for target in timed_out {
            self.recover_target(target);
            if self.failed {
                return;
            }
        }

        self.restart();
    }

    /// First-level recovery for a target whose outstanding batch stopped making progress.
    pub(crate) fn recover_target(&mut self, target: TargetId) {
        let Ok(t) = self.targets.get_mut(target) else {
            return;
        };
        // Re-arm so a pending escalation does not fire again every tick.
        t.timeout_ms = t.timebase_ms;
        if t.escalation > 0 {
            tracing::warn!(target_id = target, "timeout persists after target reset; escalating");
            self.bus_reset_pending = true;
            return;
        }
        t.escalation = 1;

        tracing::warn!(target_id = target, in_flight = t.in_flight, "resetting target");
        self.stats.target_resets += 1;
        match self.task_management(|transport| transport.reset(ResetScope::Target(target))) {
            Ok(()) => {
                self.flush_in_flight(Some(target), CompletionReason::Reset);
                let (delay, quiesced) = (self.reset_delay_ms, self.quiesced);
                if let Ok(t) = self.targets.get_mut(target) {
                    t.hold_for_reset(delay, quiesced);
                }
            }
            Err(err) => {
                tracing::warn!(target_id = target, %err, "target reset failed; bus reset next tick");
                self.bus_reset_pending = true;
            }
        }
    }

    pub(crate) fn reset_bus(&mut self) {
        tracing::warn!(in_flight = self.slots.occupied(), "resetting bus");
        self.stats.bus_resets += 1;
        match self.task_management(|transport| transport.reset(ResetScope::Bus)) {
            Ok(()) => {
                self.flush_in_flight(None, CompletionReason::Reset);
                let (delay, quiesced) = (self.reset_delay_ms, self.quiesced);
                for t in self.targets.iter_mut() {
                    t.hold_for_reset(delay, quiesced);
                    t.escalation = 1;
                }
            }
            Err(err) => {
                tracing::error!(%err, "bus reset failed");
                self.fail_adapter();
            }
        }
    }

    /// Chokes every target and terminates all outstanding work. Irreversible.
    pub(crate) fn fail_adapter(&mut self) {
        tracing::error!(
            in_flight = self.slots.occupied(),
            queued = self.waitq.len(),
            "adapter failed; terminating all commands"
        );
        self.failed = true;
        self.bus_reset_pending = false;
        let quiesced = self.quiesced;
        for t in self.targets.iter_mut() {
            t.set_throttle(Throttle::Choke, quiesced);
        }
        self.flush_in_flight(None, CompletionReason::Terminated);
        self.flush_queued(None, CompletionReason::Terminated);
        self.pending_acks.clear();
    }

    pub(crate) fn begin_offline(&mut self, target: TargetId) {
        let quiesced = self.quiesced;
        let Ok(t) = self.targets.get_mut(target) else {
            return;
        };
        let work = t.begin_offline(quiesced);
        self.flush_queued(Some(target), CompletionReason::DeviceGone);
        self.send_presence_work(work);
    }
}

/// A background thread owned by the adapter's caller. Dropping the handle stops the thread
/// and waits for it to exit.
#[derive(Debug)]
pub struct BackgroundHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundHandle {
    pub(crate) fn new(stop: Arc<AtomicBool>, thread: JoinHandle<()>) -> Self {
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return;
        };
        thread.thread().unpark();
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!("background thread panicked");
        }
    }
}

impl Drop for BackgroundHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn spawn(adapter: Weak<Adapter>, tick: std::time::Duration) -> Result<BackgroundHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let thread = thread::Builder::new()
        .name("aero-hba-watchdog".into())
        .spawn(move || loop {
            thread::park_timeout(tick);
            if flag.load(Ordering::Acquire) {
                return;
            }
            let Some(adapter) = adapter.upgrade() else {
                return;
            };
            adapter.tick();
        })
        .map_err(|source| HbaError::Spawn {
            what: "watchdog",
            source,
        })?;
    Ok(BackgroundHandle::new(stop, thread))
}
