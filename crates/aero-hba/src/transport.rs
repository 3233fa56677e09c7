//! Seam between the scheduling core and the hardware.

use crate::command::TargetId;
use crate::error::TransportError;
use crate::slots::SlotId;

/// A request as handed to the transport. Wire encoding is the transport's business.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub target: TargetId,
    pub lun: u16,
    pub payload: &'a [u8],
    /// `false` when the command must run alone on its target.
    pub tagged: bool,
    /// Target-less control request (event acknowledgement).
    pub control: bool,
    /// Out-of-band context a control completion may be keyed by.
    pub context: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    Target(TargetId),
    Bus,
}

/// How the transport identifies the command a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTag {
    Slot(SlotId),
    /// Used by control commands that complete without a slot reference.
    Context(u32),
}

/// Device/transport status as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    Good,
    Underrun { residual: u64 },
    Overrun,
    DeviceGone,
    ResetInProgress,
    QueueFull,
    Busy,
    ProtocolError { code: u32 },
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCompletion {
    pub tag: CompletionTag,
    pub status: RawStatus,
}

impl RawCompletion {
    pub fn slot(slot: SlotId, status: RawStatus) -> Self {
        Self {
            tag: CompletionTag::Slot(slot),
            status,
        }
    }
}

/// Hardware collaborator.
///
/// `submit`, `abort` and `reset` are called with the adapter lock held, so implementations
/// must not call back into the [`Adapter`](crate::Adapter) from them. Completions are
/// reported later through [`Adapter::on_completion`](crate::Adapter::on_completion).
///
/// A successful [`reset`](Transport::reset) discards every completion still outstanding in
/// its scope; the adapter terminates those commands itself.
pub trait Transport: Send + Sync {
    fn submit(&self, slot: SlotId, request: &SubmitRequest<'_>) -> Result<(), TransportError>;

    fn abort(&self, slot: SlotId) -> Result<(), TransportError>;

    fn reset(&self, scope: ResetScope) -> Result<(), TransportError>;

    /// Completions available without waiting for an interrupt. Used by polled submission.
    fn poll_completions(&self) -> Vec<RawCompletion> {
        Vec::new()
    }
}
