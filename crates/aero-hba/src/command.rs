//! Commands, their lifecycle flags and the completion record handed back to callers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use serde::Serialize;

use crate::slots::SlotId;

pub type TargetId = u16;

/// Identity of a command, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CommandId(u64);

impl CommandId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u16 {
        /// Linked into a wait queue.
        const QUEUED = 1 << 0;
        /// Occupies a slot and has been handed to the transport.
        const IN_TRANSPORT = 1 << 1;
        /// Outcome is known.
        const FINISHED = 1 << 2;
        /// Handed to the delivery pipeline.
        const COMPLETED = 1 << 3;
        /// Resubmitted after queue-full/busy.
        const RETRY = 1 << 4;
        /// Caller polls for completion instead of taking a callback.
        const NO_INTR = 1 << 5;
        /// Insert at the front of the wait queue.
        const HEAD = 1 << 6;
        /// Caller cannot tolerate queueing; reject instead.
        const NO_QUEUE = 1 << 7;
        /// Requires exclusive access to the target.
        const UNTAGGED = 1 << 8;
        /// Target-less control command (event acknowledgement).
        const CONTROL = 1 << 9;
        /// Active timeout expired while in flight.
        const TIMED_OUT = 1 << 10;
        /// An abort has been issued to the transport.
        const ABORT_REQUESTED = 1 << 11;
    }
}

impl CommandFlags {
    /// Flags a caller may set on a command; the rest are lifecycle state.
    pub const CALLER: CommandFlags = CommandFlags::NO_INTR
        .union(CommandFlags::HEAD)
        .union(CommandFlags::NO_QUEUE)
        .union(CommandFlags::UNTAGGED);
}

/// Callback invoked exactly once with the command's outcome.
///
/// Callbacks always run without any adapter lock held and may submit new commands.
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// One outstanding request.
///
/// Created by the caller, owned by the adapter from [`Adapter::submit`] until its
/// [`Completion`] is delivered.
///
/// [`Adapter::submit`]: crate::Adapter::submit
pub struct Command {
    id: CommandId,
    target: TargetId,
    lun: u16,
    payload: Vec<u8>,
    timeout: Duration,
    callback: Option<CompletionFn>,
    context: Option<u32>,
    pub(crate) flags: CommandFlags,
    pub(crate) slot: Option<SlotId>,
    pub(crate) qfull_retries: u8,
    pub(crate) active_timeout_ms: i64,
}

impl Command {
    /// A command whose completion is delivered to `on_complete`.
    pub fn new<F>(target: TargetId, lun: u16, payload: Vec<u8>, on_complete: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self::build(target, lun, payload, Some(Box::new(on_complete)))
    }

    /// A command for [`Adapter::submit_polled`](crate::Adapter::submit_polled).
    pub fn polled(target: TargetId, lun: u16, payload: Vec<u8>) -> Self {
        let mut cmd = Self::build(target, lun, payload, None);
        cmd.flags |= CommandFlags::NO_INTR;
        cmd
    }

    /// Target-less event acknowledgement, consumed internally on completion.
    pub(crate) fn control(event: u32, context: u32) -> Self {
        let mut cmd = Self::build(0, 0, event.to_le_bytes().to_vec(), None);
        cmd.flags |= CommandFlags::CONTROL;
        cmd.context = Some(context);
        cmd
    }

    fn build(
        target: TargetId,
        lun: u16,
        payload: Vec<u8>,
        callback: Option<CompletionFn>,
    ) -> Self {
        Self {
            id: CommandId::next(),
            target,
            lun,
            payload,
            timeout: Duration::ZERO,
            callback,
            context: None,
            flags: CommandFlags::empty(),
            slot: None,
            qfull_retries: 0,
            active_timeout_ms: 0,
        }
    }

    /// Requested timeout. Zero selects the adapter's default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds caller flags. Lifecycle flags in `flags` are ignored.
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags & CommandFlags::CALLER;
        self
    }

    pub fn without_flags(mut self, flags: CommandFlags) -> Self {
        self.flags.remove(flags & CommandFlags::CALLER);
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn lun(&self) -> u16 {
        self.lun
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    pub(crate) fn context(&self) -> Option<u32> {
        self.context
    }

    pub(crate) fn is_control(&self) -> bool {
        self.flags.contains(CommandFlags::CONTROL)
    }

    pub(crate) fn is_polled(&self) -> bool {
        self.flags.contains(CommandFlags::NO_INTR)
    }

    /// Consumes the command into its completion record and the route it takes to the caller.
    pub(crate) fn finish(mut self, reason: CompletionReason, residual: u64) -> Finished {
        debug_assert!(
            !self.flags.contains(CommandFlags::COMPLETED),
            "command {} completed twice",
            self.id
        );
        self.flags.remove(CommandFlags::QUEUED | CommandFlags::IN_TRANSPORT);
        self.flags |= CommandFlags::FINISHED | CommandFlags::COMPLETED;

        let route = if self.is_control() {
            Route::Discard
        } else if self.is_polled() {
            Route::Polled
        } else {
            match self.callback.take() {
                Some(cb) => Route::Callback(cb),
                None => Route::Discard,
            }
        };

        Finished {
            completion: Completion {
                id: self.id,
                target: self.target,
                lun: self.lun,
                reason,
                residual,
                payload: self.payload,
            },
            route,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("lun", &self.lun)
            .field("payload_len", &self.payload.len())
            .field("flags", &self.flags)
            .field("slot", &self.slot)
            .field("qfull_retries", &self.qfull_retries)
            .finish_non_exhaustive()
    }
}

/// Outcome of a command as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompletionReason {
    /// Completed. A non-zero residual reports an underrun.
    Success,
    DataOverrun,
    /// The device is gone; not retryable.
    DeviceGone,
    /// Terminated by a target or bus reset.
    Reset,
    /// The command's own timer had expired before the reset that terminated it.
    TimeoutReset,
    QueueFullExhausted,
    BusyExhausted,
    ProtocolError { code: u32 },
    /// The transport refused the request.
    TransportError,
    Aborted,
    /// The adapter failed; nothing further will be admitted.
    Terminated,
}

impl CompletionReason {
    pub fn is_success(self) -> bool {
        matches!(self, CompletionReason::Success)
    }
}

/// Completion record delivered exactly once per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: CommandId,
    pub target: TargetId,
    pub lun: u16,
    pub reason: CompletionReason,
    /// Bytes not transferred (underrun).
    pub residual: u64,
    /// The caller's payload handle, returned unchanged.
    pub payload: Vec<u8>,
}

/// Result of [`Adapter::submit`](crate::Adapter::submit).
#[derive(Debug, PartialEq)]
pub enum Submission {
    /// Handed to the transport, or already terminated (the completion reports why).
    Accepted,
    /// Waiting for a slot or for the target to admit it.
    Queued,
    Rejected(Rejection),
}

/// A `NO_QUEUE` command the adapter refused. The command is handed back untouched and its
/// completion never runs.
#[derive(Debug)]
pub struct Rejection {
    reason: RejectReason,
    command: Command,
}

impl Rejection {
    pub(crate) fn new(reason: RejectReason, command: Command) -> Self {
        Self { reason, command }
    }

    pub fn reason(&self) -> RejectReason {
        self.reason
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Takes the command back, e.g. to resubmit it without `NO_QUEUE`.
    pub fn into_command(self) -> Command {
        self.command
    }
}

/// Two rejections are equal when they refuse the same command for the same reason.
impl PartialEq for Rejection {
    fn eq(&self, other: &Self) -> bool {
        self.reason == other.reason && self.command.id() == other.command.id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The target is busy and the command forbids queueing.
    Busy,
    /// The target is between presence states and the command forbids queueing.
    PresenceTransition,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Busy => write!(f, "busy"),
            RejectReason::PresenceTransition => write!(f, "device presence transition"),
        }
    }
}

pub(crate) enum Route {
    Callback(CompletionFn),
    Polled,
    Discard,
}

pub(crate) struct Finished {
    pub(crate) completion: Completion,
    pub(crate) route: Route,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn with_flags_masks_lifecycle_bits() {
        let cmd = Command::new(1, 0, Vec::new(), |_| {})
            .with_flags(CommandFlags::HEAD | CommandFlags::IN_TRANSPORT | CommandFlags::CONTROL);
        assert_eq!(cmd.flags(), CommandFlags::HEAD);
        let cmd = cmd.without_flags(CommandFlags::HEAD | CommandFlags::NO_QUEUE);
        assert!(cmd.flags().is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let a = Command::polled(0, 0, Vec::new());
        let b = Command::polled(0, 0, Vec::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn finish_routes_to_callback_and_returns_payload() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let cmd = Command::new(3, 1, vec![0xaa, 0xbb], move |c| {
            *seen2.lock().unwrap() = Some(c);
        });
        let id = cmd.id();

        let finished = cmd.finish(CompletionReason::Success, 4);
        match finished.route {
            Route::Callback(cb) => cb(finished.completion),
            _ => panic!("expected callback route"),
        }

        let c = seen.lock().unwrap().take().unwrap();
        assert_eq!(c.id, id);
        assert_eq!(c.target, 3);
        assert_eq!(c.residual, 4);
        assert_eq!(c.payload, vec![0xaa, 0xbb]);
    }

    #[test]
    fn polled_and_control_commands_do_not_take_callbacks() {
        let finished = Command::polled(0, 0, Vec::new()).finish(CompletionReason::Success, 0);
        assert!(matches!(finished.route, Route::Polled));

        let finished = Command::control(7, 9).finish(CompletionReason::Success, 0);
        assert!(matches!(finished.route, Route::Discard));
    }
}
