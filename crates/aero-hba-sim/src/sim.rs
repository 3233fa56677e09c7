//! Simulated hardware and workload driver.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use aero_hba::{
    Adapter, AdapterConfig, AdapterStats, Command, CommandFlags, CommandId, DeviceMetadata,
    PresenceHandler, RawCompletion, RawStatus, ResetScope, SlotId, SubmitRequest, TargetId,
    TargetSnapshot, Transport, TransportError,
};
use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::Workload;

const HARDWARE_POLL: Duration = Duration::from_millis(1);

struct Outstanding {
    target: Option<TargetId>,
    due: Option<Instant>,
    status: RawStatus,
}

struct Hardware {
    rng: StdRng,
    /// Keyed by slot. `due == None` means the hardware will never answer.
    outstanding: HashMap<SlotId, Outstanding>,
}

/// A transport whose "hardware" answers after a random delay, sometimes with queue-full or
/// busy, sometimes not at all.
pub struct SimTransport {
    hw: Mutex<Hardware>,
    workload: Workload,
}

impl SimTransport {
    pub fn new(workload: Workload, seed: u64) -> Self {
        Self {
            hw: Mutex::new(Hardware {
                rng: StdRng::seed_from_u64(seed),
                outstanding: HashMap::new(),
            }),
            workload,
        }
    }

    fn hw(&self) -> std::sync::MutexGuard<'_, Hardware> {
        match self.hw.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Completions whose latency has elapsed.
    fn due(&self, now: Instant) -> Vec<RawCompletion> {
        let mut hw = self.hw();
        let ready: Vec<SlotId> = hw
            .outstanding
            .iter()
            .filter(|(_, o)| o.due.is_some_and(|due| due <= now))
            .map(|(slot, _)| *slot)
            .collect();
        ready
            .into_iter()
            .filter_map(|slot| {
                hw.outstanding
                    .remove(&slot)
                    .map(|o| RawCompletion::slot(slot, o.status))
            })
            .collect()
    }

    fn latency(&self, rng: &mut StdRng) -> Duration {
        let max = u64::try_from(self.workload.max_latency.as_micros()).unwrap_or(u64::MAX);
        Duration::from_micros(rng.gen_range(0..=max))
    }
}

impl Transport for SimTransport {
    fn submit(&self, slot: SlotId, request: &SubmitRequest<'_>) -> Result<(), TransportError> {
        let now = Instant::now();
        let mut hw = self.hw();
        let roll: f64 = hw.rng.gen();
        let w = &self.workload;
        let (status, stalled) = if request.control {
            (RawStatus::Good, false)
        } else if roll < w.stall_rate {
            (RawStatus::Good, true)
        } else if roll < w.stall_rate + w.qfull_rate {
            (RawStatus::QueueFull, false)
        } else if roll < w.stall_rate + w.qfull_rate + w.busy_rate {
            (RawStatus::Busy, false)
        } else {
            (RawStatus::Good, false)
        };
        let due = if stalled {
            tracing::debug!(%slot, target_id = request.target, "hardware stalls");
            None
        } else {
            Some(now + self.latency(&mut hw.rng))
        };
        let previous = hw.outstanding.insert(
            slot,
            Outstanding {
                target: (!request.control).then_some(request.target),
                due,
                status,
            },
        );
        if previous.is_some() {
            tracing::error!(%slot, "slot submitted twice");
            return Err(TransportError::Rejected);
        }
        Ok(())
    }

    fn abort(&self, slot: SlotId) -> Result<(), TransportError> {
        let mut hw = self.hw();
        let latency = self.latency(&mut hw.rng);
        let Some(o) = hw.outstanding.get_mut(&slot) else {
            return Err(TransportError::NoResponse);
        };
        o.status = RawStatus::Aborted;
        o.due = Some(Instant::now() + latency);
        Ok(())
    }

    fn reset(&self, scope: ResetScope) -> Result<(), TransportError> {
        let mut hw = self.hw();
        let before = hw.outstanding.len();
        hw.outstanding.retain(|_, o| match scope {
            ResetScope::Bus => false,
            ResetScope::Target(target) => o.target != Some(target),
        });
        tracing::info!(?scope, discarded = before - hw.outstanding.len(), "hardware reset");
        Ok(())
    }

    fn poll_completions(&self) -> Vec<RawCompletion> {
        self.due(Instant::now())
    }
}

/// Upper-layer stand-in that just logs presence transitions.
pub struct SimPresence;

impl PresenceHandler for SimPresence {
    fn online(&self, target: TargetId, device: &DeviceMetadata) -> bool {
        tracing::info!(target_id = target, wwn = format_args!("{:#018x}", device.wwn), "online");
        true
    }

    fn offline(&self, target: TargetId) {
        tracing::info!(target_id = target, "offline");
    }
}

/// Feeds due completions back into the adapter until stopped.
fn spawn_hardware(
    transport: Arc<SimTransport>,
    adapter: Arc<Adapter>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("aero-hba-sim-hw".into())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let due = transport.due(Instant::now());
                if !due.is_empty() {
                    adapter.on_completions(due);
                }
                thread::sleep(HARDWARE_POLL);
            }
        })
        .context("spawning hardware thread")
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub seed: u64,
    pub commands: usize,
    pub elapsed_ms: u64,
    pub reasons: BTreeMap<String, u64>,
    pub stats: AdapterStats,
    pub targets: Vec<TargetSnapshot>,
}

#[derive(Default)]
struct Tally {
    delivered: AtomicUsize,
    seen: Mutex<HashSet<CommandId>>,
    duplicates: AtomicUsize,
    reasons: Mutex<BTreeMap<String, u64>>,
}

impl Tally {
    fn record(&self, id: CommandId, reason: aero_hba::CompletionReason) {
        let fresh = match self.seen.lock() {
            Ok(mut seen) => seen.insert(id),
            Err(poisoned) => poisoned.into_inner().insert(id),
        };
        if !fresh {
            self.duplicates.fetch_add(1, Ordering::SeqCst);
            return;
        }
        let key = format!("{reason:?}");
        match self.reasons.lock() {
            Ok(mut reasons) => *reasons.entry(key).or_default() += 1,
            Err(poisoned) => *poisoned.into_inner().entry(key).or_default() += 1,
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn run(adapter_config: AdapterConfig, workload: Workload) -> Result<Report> {
    let seed = workload.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let targets = adapter_config.targets;
    tracing::info!(seed, commands = workload.commands, targets, "starting workload");

    let transport = Arc::new(SimTransport::new(workload.clone(), seed));
    let (adapter, runner) = Adapter::new(
        adapter_config,
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(SimPresence),
    )?;
    let adapter = Arc::new(adapter);
    let watchdog = adapter.spawn_watchdog()?;
    let presence = runner.spawn(Arc::clone(&adapter))?;
    let stop = Arc::new(AtomicBool::new(false));
    let hardware = spawn_hardware(Arc::clone(&transport), Arc::clone(&adapter), Arc::clone(&stop))?;

    let tally = Arc::new(Tally::default());
    let started = Instant::now();
    let hotplug_every = (workload.commands / 8).max(1);

    for i in 0..workload.commands {
        let target: TargetId = rng.gen_range(0..targets);
        let len = rng.gen_range(1..=64usize);
        let mut payload = vec![0u8; len];
        rng.fill(payload.as_mut_slice());

        let sink = Arc::clone(&tally);
        let mut cmd = Command::new(target, 0, payload, move |c| sink.record(c.id, c.reason));
        if rng.gen_bool(0.02) {
            cmd = cmd.with_flags(CommandFlags::UNTAGGED);
        }
        adapter.submit(cmd)?;

        if workload.hotplug && i % hotplug_every == hotplug_every / 2 {
            let victim: TargetId = rng.gen_range(0..targets);
            adapter.on_device_removed(victim)?;
            // Sometimes back before the offline delay runs out, sometimes after.
            let offline_delay = adapter.config().offline_delay;
            thread::sleep(offline_delay.mul_f64(rng.gen_range(0.0..2.0)));
            let device = DeviceMetadata {
                wwn: rng.gen(),
                max_luns: 8,
            };
            adapter.on_device_added(victim, device)?;
        }
    }

    let deadline = started + workload.deadline;
    while tally.delivered.load(Ordering::SeqCst) < workload.commands {
        if Instant::now() >= deadline {
            bail!(
                "only {} of {} commands completed before the deadline",
                tally.delivered.load(Ordering::SeqCst),
                workload.commands
            );
        }
        thread::sleep(Duration::from_millis(5));
    }

    stop.store(true, Ordering::Release);
    if hardware.join().is_err() {
        bail!("hardware thread panicked");
    }
    watchdog.stop();
    presence.stop();

    let duplicates = tally.duplicates.load(Ordering::SeqCst);
    if duplicates > 0 {
        bail!("{duplicates} completions were delivered more than once");
    }

    let snapshots = (0..targets)
        .map(|t| adapter.get_target_state(t))
        .collect::<aero_hba::Result<Vec<_>>>()?;
    let reasons = match tally.reasons.lock() {
        Ok(reasons) => reasons.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    Ok(Report {
        seed,
        commands: workload.commands,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        reasons,
        stats: adapter.stats(),
        targets: snapshots,
    })
}
