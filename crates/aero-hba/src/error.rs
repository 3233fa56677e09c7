use thiserror::Error;

use crate::command::{CommandId, RejectReason, TargetId};
use crate::target::Capability;

pub type Result<T> = std::result::Result<T, HbaError>;

/// Failures reported by the [`Transport`](crate::Transport) collaborator.
///
/// The scheduling core never interprets these beyond "the request did not reach the
/// hardware"; they are surfaced to callers as [`CompletionReason::TransportError`] or, for
/// synchronous task management, as [`HbaError::Transport`].
///
/// [`CompletionReason::TransportError`]: crate::CompletionReason::TransportError
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request rejected by the transport")]
    Rejected,

    #[error("no response from the transport")]
    NoResponse,

    #[error("transport io error: {0}")]
    Io(String),
}

/// Unified error type for adapter operations.
///
/// Recoverable conditions (slot exhaustion, queue-full retries) never show up here: they are
/// absorbed by queueing. Terminal per-command outcomes are reported through the command's
/// [`Completion`](crate::Completion), not as an `Err`.
#[derive(Debug, Error)]
pub enum HbaError {
    #[error("invalid target {target} (adapter has {targets} targets)")]
    InvalidTarget { target: TargetId, targets: u16 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("capability {0:?} is read-only")]
    ReadOnlyCapability(Capability),

    #[error("adapter has failed and must be re-attached")]
    AdapterFailed,

    #[error("command rejected: {0}")]
    Rejected(RejectReason),

    #[error("quiesce timed out with {in_flight} commands in flight")]
    QuiesceTimeout { in_flight: u32 },

    #[error("polled command {0} did not complete before its deadline")]
    PollTimeout(CommandId),

    #[error("command {0} not found")]
    CommandNotFound(CommandId),

    #[error("a task management request is already in progress")]
    TaskManagementBusy,

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
