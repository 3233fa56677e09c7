use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

use crate::dispatch::AdapterState;
use crate::{
    Adapter, AdapterConfig, Command, CommandFlags, CommandId, DeviceMetadata, PresenceHandler,
    RawCompletion, RawStatus, ResetScope, SlotId, SubmitRequest, TargetId, Transport,
    TransportError,
};

const TARGETS: u16 = 3;
const SLOTS: u16 = 4;
const MAX_THROTTLE: u16 = 3;
const MAX_OPS: usize = 96;

#[derive(Debug, Clone)]
enum Op {
    Submit { target: TargetId, untagged: bool },
    Complete { pick: usize, status: RawStatus },
    Tick,
}

#[derive(Default)]
struct Recorder {
    /// Slots handed to the transport and not yet completed.
    live: Vec<SlotId>,
    /// Sequence numbers in the order the transport first saw them.
    started: Vec<(TargetId, u64)>,
    seen: HashSet<u64>,
}

#[derive(Default)]
struct RecordingTransport {
    inner: Mutex<Recorder>,
}

impl Transport for RecordingTransport {
    fn submit(&self, slot: SlotId, request: &SubmitRequest<'_>) -> Result<(), TransportError> {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&request.payload[..8]);
        let seq = u64::from_le_bytes(seq);
        let mut r = self.inner.lock().unwrap();
        r.live.push(slot);
        if r.seen.insert(seq) {
            r.started.push((request.target, seq));
        }
        Ok(())
    }

    fn abort(&self, _slot: SlotId) -> Result<(), TransportError> {
        Ok(())
    }

    fn reset(&self, _scope: ResetScope) -> Result<(), TransportError> {
        Ok(())
    }
}

struct NoPresence;

impl PresenceHandler for NoPresence {
    fn online(&self, _target: TargetId, _device: &DeviceMetadata) -> bool {
        true
    }

    fn offline(&self, _target: TargetId) {}
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let status = prop_oneof![
        6 => Just(RawStatus::Good),
        2 => Just(RawStatus::QueueFull),
        1 => Just(RawStatus::Busy),
        1 => Just(RawStatus::Underrun { residual: 16 }),
    ];
    prop_oneof![
        5 => (0..TARGETS, proptest::bool::weighted(0.1))
            .prop_map(|(target, untagged)| Op::Submit { target, untagged }),
        4 => (any::<usize>(), status).prop_map(|(pick, status)| Op::Complete { pick, status }),
        1 => Just(Op::Tick),
    ]
}

fn check_invariants(s: &AdapterState) -> TestCaseResult {
    let mut ids = HashSet::new();
    let mut per_target: HashMap<TargetId, u32> = HashMap::new();
    for (slot, cmd) in s.slots.iter() {
        prop_assert_eq!(cmd.slot(), Some(slot));
        prop_assert!(cmd.flags().contains(CommandFlags::IN_TRANSPORT));
        prop_assert!(!cmd.flags().contains(CommandFlags::QUEUED));
        prop_assert!(ids.insert(cmd.id()), "{} occupies two slots", cmd.id());
        *per_target.entry(cmd.target()).or_default() += 1;
    }
    prop_assert!(s.slots.occupied() <= usize::from(SLOTS));
    prop_assert_eq!(s.slots.occupied(), s.slots.iter().count());

    let queued = s.waitq.ids();
    for id in &queued {
        prop_assert!(!ids.contains(id), "{} is both queued and in flight", id);
    }

    for t in s.targets.iter() {
        let in_slots = per_target.get(&t.id).copied().unwrap_or(0);
        prop_assert_eq!(t.in_flight, in_slots);
        prop_assert!(t.in_flight <= u32::from(t.max_throttle));
        if t.untagged_active {
            prop_assert_eq!(t.in_flight, 1);
        }
    }
    Ok(())
}

fn run_ops(ops: Vec<Op>) -> TestCaseResult {
    let config = AdapterConfig {
        slots: SLOTS,
        targets: TARGETS,
        max_throttle: MAX_THROTTLE,
        tick: Duration::from_millis(100),
        default_command_timeout: Duration::from_secs(3600),
        qfull_retries: 2,
        qfull_retry_interval: Duration::from_millis(200),
        ..AdapterConfig::default()
    };
    let transport = Arc::new(RecordingTransport::default());
    let (adapter, _runner) = Adapter::new(config, transport.clone(), Arc::new(NoPresence))
        .expect("valid config");

    let delivered: Arc<Mutex<Vec<CommandId>>> = Arc::default();
    let mut submitted = Vec::new();
    let mut next_seq = 0u64;

    for op in ops {
        match op {
            Op::Submit { target, untagged } => {
                let sink = Arc::clone(&delivered);
                let mut cmd = Command::new(target, 0, next_seq.to_le_bytes().to_vec(), move |c| {
                    sink.lock().unwrap().push(c.id);
                });
                if untagged {
                    cmd = cmd.with_flags(CommandFlags::UNTAGGED);
                }
                next_seq += 1;
                submitted.push(cmd.id());
                adapter.submit(cmd).expect("target in range");
            }
            Op::Complete { pick, status } => {
                let slot = {
                    let mut r = transport.inner.lock().unwrap();
                    if r.live.is_empty() {
                        continue;
                    }
                    let idx = pick % r.live.len();
                    r.live.swap_remove(idx)
                };
                adapter.on_completion(RawCompletion::slot(slot, status));
            }
            Op::Tick => adapter.tick(),
        }
        adapter.with_state(|s| check_invariants(s))?;
    }

    // Per target, commands reach the transport in submission order.
    let started = transport.inner.lock().unwrap().started.clone();
    for target in 0..TARGETS {
        let order: Vec<u64> = started
            .iter()
            .filter(|(t, _)| *t == target)
            .map(|(_, seq)| *seq)
            .collect();
        prop_assert!(
            order.windows(2).all(|w| w[0] < w[1]),
            "target {} started out of order: {:?}",
            target,
            order
        );
    }

    let delivered = delivered.lock().unwrap();
    let unique: HashSet<_> = delivered.iter().collect();
    prop_assert_eq!(unique.len(), delivered.len(), "a completion was delivered twice");
    prop_assert!(unique.iter().all(|id| submitted.contains(id)));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_scheduling_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..MAX_OPS)) {
        run_ops(ops)?;
    }
}
