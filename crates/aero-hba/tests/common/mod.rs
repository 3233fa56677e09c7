#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aero_hba::{
    Adapter, AdapterConfig, Command, Completion, CompletionReason, DeviceMetadata,
    PresenceHandler, PresenceRunner, RawCompletion, RawStatus, ResetScope, SlotId, SubmitRequest,
    TargetId, Transport, TransportError,
};

#[derive(Debug, Clone)]
pub struct Submitted {
    pub slot: SlotId,
    pub target: TargetId,
    pub payload: Vec<u8>,
    pub tagged: bool,
    pub control: bool,
    pub context: Option<u32>,
}

#[derive(Default)]
struct MockState {
    submitted: Vec<Submitted>,
    /// Slots submitted and not yet completed, oldest first.
    live: Vec<SlotId>,
    aborts: Vec<SlotId>,
    resets: Vec<ResetScope>,
    reset_results: VecDeque<Result<(), TransportError>>,
    poll_queue: Vec<RawCompletion>,
}

/// Records everything the adapter asks of the hardware. Completions are driven by the test.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    /// Every submission immediately produces a `Good` completion for `poll_completions`.
    pub complete_on_poll: AtomicBool,
    pub refuse_submits: AtomicBool,
    /// The next abort request panics instead of returning.
    pub panic_on_abort: AtomicBool,
}

impl MockTransport {
    pub fn submitted(&self) -> Vec<Submitted> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn live(&self) -> Vec<SlotId> {
        self.state.lock().unwrap().live.clone()
    }

    pub fn aborts(&self) -> Vec<SlotId> {
        self.state.lock().unwrap().aborts.clone()
    }

    pub fn resets(&self) -> Vec<ResetScope> {
        self.state.lock().unwrap().resets.clone()
    }

    /// Outcome of the next reset request. Unscripted resets succeed.
    pub fn script_reset(&self, result: Result<(), TransportError>) {
        self.state.lock().unwrap().reset_results.push_back(result);
    }

    /// Takes `slot` off the live list, as if the hardware had answered it.
    pub fn retire(&self, slot: SlotId) {
        self.state.lock().unwrap().live.retain(|s| *s != slot);
    }

    /// The live slot that carries `payload`.
    pub fn slot_of(&self, payload: &[u8]) -> Option<SlotId> {
        let state = self.state.lock().unwrap();
        state
            .submitted
            .iter()
            .rev()
            .find(|s| s.payload == payload && state.live.contains(&s.slot))
            .map(|s| s.slot)
    }
}

impl Transport for MockTransport {
    fn submit(&self, slot: SlotId, request: &SubmitRequest<'_>) -> Result<(), TransportError> {
        if self.refuse_submits.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected);
        }
        let mut state = self.state.lock().unwrap();
        state.submitted.push(Submitted {
            slot,
            target: request.target,
            payload: request.payload.to_vec(),
            tagged: request.tagged,
            control: request.control,
            context: request.context,
        });
        state.live.push(slot);
        if self.complete_on_poll.load(Ordering::SeqCst) {
            state
                .poll_queue
                .push(RawCompletion::slot(slot, RawStatus::Good));
        }
        Ok(())
    }

    fn abort(&self, slot: SlotId) -> Result<(), TransportError> {
        if self.panic_on_abort.swap(false, Ordering::SeqCst) {
            panic!("controller wedged aborting {slot}");
        }
        self.state.lock().unwrap().aborts.push(slot);
        Ok(())
    }

    fn reset(&self, scope: ResetScope) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.resets.push(scope);
        let result = state.reset_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            // A successful reset discards whatever was outstanding in its scope.
            let doomed: Vec<SlotId> = match scope {
                ResetScope::Bus => state.live.clone(),
                ResetScope::Target(target) => state
                    .live
                    .iter()
                    .copied()
                    .filter(|slot| {
                        state
                            .submitted
                            .iter()
                            .rev()
                            .find(|s| s.slot == *slot)
                            .is_some_and(|s| s.target == target && !s.control)
                    })
                    .collect(),
            };
            state.live.retain(|s| !doomed.contains(s));
        }
        result
    }

    fn poll_completions(&self) -> Vec<RawCompletion> {
        let mut state = self.state.lock().unwrap();
        let raws = std::mem::take(&mut state.poll_queue);
        for raw in &raws {
            if let aero_hba::CompletionTag::Slot(slot) = raw.tag {
                state.live.retain(|s| *s != slot);
            }
        }
        raws
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceCall {
    Online(TargetId),
    Offline(TargetId),
}

pub struct RecordingPresence {
    pub calls: Mutex<Vec<PresenceCall>>,
    pub online_succeeds: AtomicBool,
}

impl Default for RecordingPresence {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            online_succeeds: AtomicBool::new(true),
        }
    }
}

impl RecordingPresence {
    pub fn calls(&self) -> Vec<PresenceCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl PresenceHandler for RecordingPresence {
    fn online(&self, target: TargetId, _device: &DeviceMetadata) -> bool {
        self.calls.lock().unwrap().push(PresenceCall::Online(target));
        self.online_succeeds.load(Ordering::SeqCst)
    }

    fn offline(&self, target: TargetId) {
        self.calls.lock().unwrap().push(PresenceCall::Offline(target));
    }
}

/// Completions in delivery order.
#[derive(Clone, Default)]
pub struct Sink(Arc<Mutex<Vec<Completion>>>);

impl Sink {
    /// A command for `target` whose payload is `tag` and whose completion lands here.
    pub fn command(&self, target: TargetId, tag: u32) -> Command {
        let sink = self.clone();
        Command::new(target, 0, tag.to_le_bytes().to_vec(), move |c| {
            sink.0.lock().unwrap().push(c)
        })
    }

    pub fn all(&self) -> Vec<Completion> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn reasons(&self) -> Vec<CompletionReason> {
        self.all().iter().map(|c| c.reason).collect()
    }

    /// Payload tags of the delivered completions, in delivery order.
    pub fn tags(&self) -> Vec<u32> {
        self.all().iter().map(|c| tag_of(&c.payload)).collect()
    }
}

pub fn tag_of(payload: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&payload[..4]);
    u32::from_le_bytes(buf)
}

pub fn payload(tag: u32) -> Vec<u8> {
    tag.to_le_bytes().to_vec()
}

pub struct Harness {
    pub adapter: Arc<Adapter>,
    pub transport: Arc<MockTransport>,
    pub presence: Arc<RecordingPresence>,
    pub runner: PresenceRunner,
    pub sink: Sink,
}

impl Harness {
    pub fn new(config: AdapterConfig) -> Self {
        let transport = Arc::new(MockTransport::default());
        let presence = Arc::new(RecordingPresence::default());
        let (adapter, runner) = Adapter::new(config, transport.clone(), presence.clone())
            .expect("adapter config is valid");
        Self {
            adapter: Arc::new(adapter),
            transport,
            presence,
            runner,
            sink: Sink::default(),
        }
    }

    /// Completes the oldest live slot with `status`.
    pub fn complete_oldest(&self, status: RawStatus) -> SlotId {
        let slot = *self.transport.live().first().expect("a live slot");
        self.complete(slot, status);
        slot
    }

    pub fn complete(&self, slot: SlotId, status: RawStatus) {
        self.transport.retire(slot);
        self.adapter.on_completion(RawCompletion::slot(slot, status));
    }

    pub fn ticks(&self, n: usize) {
        for _ in 0..n {
            self.adapter.tick();
        }
    }
}

/// Small pool, one-second ticks, short delays.
pub fn config() -> AdapterConfig {
    AdapterConfig {
        slots: 8,
        targets: 4,
        max_throttle: 8,
        tick: Duration::from_secs(1),
        default_command_timeout: Duration::from_secs(5),
        reset_delay: Duration::from_secs(2),
        qfull_retries: 3,
        qfull_retry_interval: Duration::from_secs(2),
        offline_delay: Duration::from_secs(3),
        poll_interval: Duration::from_millis(1),
        poll_timeout: Duration::from_millis(200),
        ..AdapterConfig::default()
    }
}
