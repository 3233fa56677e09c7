use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::command::{Command, CommandFlags, CommandId, Completion, Submission, TargetId};
use crate::config::AdapterConfig;
use crate::delivery::Delivery;
use crate::dispatch::{AbortOutcome, AdapterState, AdapterStats};
use crate::presence::{self, DeviceMetadata, PresenceHandler, PresenceRunner, PresenceWork};
use crate::target::{Capability, TargetSnapshot};
use crate::throttle::Throttle;
use crate::transport::{RawCompletion, Transport};
use crate::watchdog::{self, BackgroundHandle};
use crate::{lock, HbaError, Result};

/// The scheduling core of one host bus adapter.
///
/// All entry points take `&self` and may be called from any thread. Slot, target and queue
/// state sit behind one adapter-wide lock; submissions that find it busy are parked on a
/// separate intake queue which every locked entry point drains first, in order.
///
/// Completion callbacks never run with either lock held.
pub struct Adapter {
    state: Mutex<AdapterState>,
    intake: Mutex<VecDeque<Command>>,
    delivery: Delivery,
    transport: Arc<dyn Transport>,
    config: AdapterConfig,
}

impl Adapter {
    /// Builds an adapter and the runner for its presence work.
    ///
    /// The runner must be driven ([`PresenceRunner::spawn`] or
    /// [`PresenceRunner::run_pending`]) for hot-plug transitions to complete.
    pub fn new(
        config: AdapterConfig,
        transport: Arc<dyn Transport>,
        presence_handler: Arc<dyn PresenceHandler>,
    ) -> Result<(Self, PresenceRunner)> {
        config.validate()?;
        let (tx, rx) = presence::channel();
        let delivery = Delivery::new(&config)?;
        let state = AdapterState::new(&config, Arc::clone(&transport), tx);
        tracing::info!(
            slots = config.slots,
            targets = config.targets,
            workers = config.delivery_workers,
            "adapter attached"
        );
        let adapter = Self {
            state: Mutex::new(state),
            intake: Mutex::new(VecDeque::new()),
            delivery,
            transport,
            config,
        };
        Ok((adapter, PresenceRunner::new(rx, presence_handler)))
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn check_target(&self, target: TargetId) -> Result<()> {
        if target >= self.config.targets {
            return Err(HbaError::InvalidTarget {
                target,
                targets: self.config.targets,
            });
        }
        Ok(())
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut AdapterState) -> R) -> R {
        self.run_locked(lock(&self.state), f)
    }

    /// Runs `f` under the adapter lock, then delivers whatever finished once it is released.
    fn run_locked<R>(
        &self,
        mut state: MutexGuard<'_, AdapterState>,
        f: impl FnOnce(&mut AdapterState) -> R,
    ) -> R {
        self.drain_intake(&mut state);
        let out = f(&mut state);
        self.drain_intake(&mut state);
        let mut done = std::mem::take(&mut state.done);
        drop(state);

        // A submitter may have parked work after the final drain and then lost the race for
        // the lock to us. Whoever holds the lock next repeats this check after releasing it.
        while !lock(&self.intake).is_empty() {
            let mut state = match self.state.try_lock() {
                Ok(state) => state,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => break,
            };
            self.drain_intake(&mut state);
            done.append(&mut state.done);
        }

        self.delivery.dispatch(done);
        out
    }

    fn drain_intake(&self, state: &mut AdapterState) {
        loop {
            let next = lock(&self.intake).pop_front();
            let Some(cmd) = next else {
                return;
            };
            state.accept(cmd);
        }
    }

    /// Submits `cmd` for execution.
    ///
    /// `Accepted` means the command occupies a slot or has already been terminated (its
    /// completion says why). `Queued` commands start as capacity frees up. Only commands
    /// flagged [`CommandFlags::NO_QUEUE`] are ever `Rejected`; the rejection hands the
    /// command back and its completion never runs.
    pub fn submit(&self, cmd: Command) -> Result<Submission> {
        self.check_target(cmd.target())?;

        if cmd.flags.contains(CommandFlags::NO_QUEUE) {
            return Ok(self.with_state(|s| s.accept(cmd)));
        }

        match self.state.try_lock() {
            Ok(state) => Ok(self.run_locked(state, |s| s.accept(cmd))),
            Err(TryLockError::Poisoned(poisoned)) => {
                Ok(self.run_locked(poisoned.into_inner(), |s| s.accept(cmd)))
            }
            Err(TryLockError::WouldBlock) => {
                tracing::trace!(id = %cmd.id(), "adapter busy; parking on intake");
                lock(&self.intake).push_back(cmd);
                // The holder may have finished its final drain already.
                if let Ok(state) = self.state.try_lock() {
                    self.run_locked(state, |_| ());
                }
                Ok(Submission::Queued)
            }
        }
    }

    /// Submits `cmd` and spins until it completes or `poll_timeout` elapses.
    ///
    /// Completions are pulled through [`Transport::poll_completions`] between spins, so this
    /// works without an interrupt context. On timeout an abort is requested and the
    /// command's eventual completion is discarded.
    pub fn submit_polled(&self, mut cmd: Command) -> Result<Completion> {
        cmd.flags.insert(CommandFlags::NO_INTR);
        let id = cmd.id();
        if let Submission::Rejected(rejection) = self.submit(cmd)? {
            return Err(HbaError::Rejected(rejection.reason()));
        }

        let deadline = Instant::now() + self.config.poll_timeout;
        loop {
            if let Some(completion) = self.delivery.take_polled(id) {
                return Ok(completion);
            }
            if Instant::now() >= deadline {
                tracing::warn!(%id, "polled command timed out");
                self.delivery.abandon(id);
                if let Err(err) = self.abort(id) {
                    tracing::warn!(%id, %err, "abort after poll timeout failed");
                }
                return Err(HbaError::PollTimeout(id));
            }
            self.poll_transport();
            if let Some(completion) = self.delivery.take_polled(id) {
                return Ok(completion);
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn poll_transport(&self) {
        let raws = self.transport.poll_completions();
        if !raws.is_empty() {
            self.on_completions(raws);
        }
    }

    /// Cancels a command. Queued commands are removed and completed with `Aborted`
    /// immediately; in-flight commands complete with `Aborted` when the transport reports
    /// back.
    pub fn abort(&self, id: CommandId) -> Result<AbortOutcome> {
        self.with_state(|s| s.abort(id))
    }

    pub fn on_completion(&self, raw: RawCompletion) {
        self.with_state(|s| {
            s.complete_raw(raw);
            s.restart();
        });
    }

    pub fn on_completions(&self, raws: impl IntoIterator<Item = RawCompletion>) {
        self.with_state(|s| {
            for raw in raws {
                s.complete_raw(raw);
            }
            s.restart();
        });
    }

    pub fn on_device_added(&self, target: TargetId, device: DeviceMetadata) -> Result<()> {
        self.with_state(|s| -> Result<()> {
            let quiesced = s.quiesced;
            let work = s.targets.get_mut(target)?.device_added(device, quiesced);
            s.send_presence_work(work);
            s.restart();
            Ok(())
        })
    }

    /// The transport lost contact with `target`. Queued and in-flight commands are left
    /// alone until the offline delay expires.
    pub fn on_device_removed(&self, target: TargetId) -> Result<()> {
        self.with_state(|s| -> Result<()> {
            let (delay, quiesced) = (s.offline_delay_ms, s.quiesced);
            s.targets
                .get_mut(target)?
                .device_not_responding(delay, quiesced);
            Ok(())
        })
    }

    /// Reports that a [`PresenceWork`] item has been carried out.
    pub fn presence_work_done(&self, work: &PresenceWork, success: bool) -> Result<()> {
        let target = work.target();
        self.with_state(|s| -> Result<()> {
            let quiesced = s.quiesced;
            if s.targets.get_mut(target)?.work_done(work, success, quiesced) {
                s.begin_offline(target);
            }
            s.restart();
            Ok(())
        })
    }

    /// One watchdog period. Normally driven by [`Adapter::spawn_watchdog`].
    pub fn tick(&self) {
        self.with_state(AdapterState::watch);
    }

    /// Starts a thread calling [`Adapter::tick`] every `tick`. The thread holds only a weak
    /// reference and exits once the adapter is dropped.
    pub fn spawn_watchdog(self: &Arc<Self>) -> Result<BackgroundHandle> {
        watchdog::spawn(Arc::downgrade(self), self.config.tick)
    }

    /// Freezes admission and waits for in-flight commands to drain.
    ///
    /// On timeout the adapter is thawed again and [`HbaError::QuiesceTimeout`] returned.
    pub fn quiesce(&self, timeout: Duration) -> Result<()> {
        self.with_state(|s| {
            if s.failed {
                return Err(HbaError::AdapterFailed);
            }
            s.quiesced = true;
            for t in s.targets.iter_mut() {
                t.set_throttle(Throttle::Hold, true);
            }
            Ok(())
        })?;
        tracing::info!("quiescing");

        let deadline = Instant::now() + timeout;
        loop {
            let in_flight = self.with_state(|s| s.slots.occupied());
            if in_flight == 0 {
                tracing::info!("quiesced");
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(in_flight, "quiesce timed out");
                self.unquiesce();
                return Err(HbaError::QuiesceTimeout {
                    in_flight: in_flight as u32,
                });
            }
            self.poll_transport();
            thread::sleep(self.config.poll_interval);
        }
    }

    pub fn unquiesce(&self) {
        self.with_state(|s| {
            s.quiesced = false;
            for t in s.targets.iter_mut() {
                if t.reset_delay_ms <= 0 {
                    t.restore_max(false);
                }
            }
            s.restart();
        });
        tracing::info!("unquiesced");
    }

    pub fn get_target_state(&self, target: TargetId) -> Result<TargetSnapshot> {
        self.with_state(|s| s.targets.get(target).map(|t| t.snapshot()))
    }

    /// Sets the queue-full retry budget and the reopen interval for `target`.
    pub fn set_throttle_policy(
        &self,
        target: TargetId,
        qfull_retries: u8,
        qfull_retry_interval: Duration,
    ) -> Result<()> {
        let interval = u32::try_from(qfull_retry_interval.as_millis()).unwrap_or(u32::MAX);
        self.set_capability(target, Capability::QfullRetries, u32::from(qfull_retries))?;
        self.set_capability(target, Capability::QfullRetryInterval, interval)
    }

    pub fn get_capability(&self, target: TargetId, cap: Capability) -> Result<u32> {
        self.with_state(|s| s.targets.get(target).map(|t| t.capability(cap)))
    }

    pub fn set_capability(&self, target: TargetId, cap: Capability, value: u32) -> Result<()> {
        self.with_state(|s| -> Result<()> {
            s.targets.get_mut(target)?.set_capability(cap, value)?;
            tracing::debug!(target_id = target, ?cap, value, "capability set");
            s.restart();
            Ok(())
        })
    }

    /// Acknowledges a hardware event. The acknowledgement is a target-less control command
    /// that waits for a free slot if necessary and is consumed internally on completion.
    pub fn ack_event(&self, event: u32, context: u32) -> Result<()> {
        self.with_state(|s| {
            if s.failed {
                return Err(HbaError::AdapterFailed);
            }
            s.submit_ack(Command::control(event, context));
            Ok(())
        })
    }

    /// Ids in the wait queue, in dispatch order.
    pub fn queued_commands(&self) -> Vec<CommandId> {
        self.with_state(|s| s.waitq.ids())
    }

    pub fn stats(&self) -> AdapterStats {
        self.with_state(|s| s.stats())
    }

    /// Callbacks handed to delivery workers that have not run yet.
    pub fn pending_deliveries(&self) -> usize {
        self.delivery.pending()
    }
}
