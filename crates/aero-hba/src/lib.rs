//! Command-scheduling core of a host bus adapter driver.
//!
//! An [`Adapter`] multiplexes caller [`Command`]s onto a fixed pool of hardware slots shared
//! by many targets. It owns:
//!
//! - the slot pool (tag allocation, plus one proxy slot for task management);
//! - per-target throttles that bound concurrency and react to queue-full/busy signals;
//! - an intake queue and a FIFO wait queue for work that cannot start yet;
//! - completion classification, bounded retries and delivery (inline or on workers);
//! - a timeout watchdog escalating from target reset to bus reset to adapter failure;
//! - the device presence state machine for hot-plugged targets.
//!
//! Hardware access stays behind the [`Transport`] trait and hot-plug reconfiguration
//! behind [`PresenceHandler`]. Neither is called with a caller callback on the stack, and
//! no callback runs with an adapter lock held.
//!
//! The crate logs through `tracing` and never installs a subscriber.

mod adapter;
mod command;
mod completion;
mod config;
mod delivery;
mod dispatch;
mod error;
mod presence;
mod queue;
mod slots;
mod target;
mod throttle;
mod transport;
mod watchdog;

#[cfg(test)]
mod proptests;

use std::sync::{Mutex, MutexGuard};

pub use adapter::Adapter;
pub use command::{
    Command, CommandFlags, CommandId, Completion, CompletionFn, CompletionReason, RejectReason,
    Rejection, Submission, TargetId,
};
pub use config::AdapterConfig;
pub use dispatch::{AbortOutcome, AdapterStats};
pub use error::{HbaError, Result, TransportError};
pub use presence::{DeviceMetadata, PresenceHandler, PresenceRunner, PresenceState, PresenceWork};
pub use slots::SlotId;
pub use target::{Capability, TargetSnapshot};
pub use throttle::Throttle;
pub use transport::{CompletionTag, RawCompletion, RawStatus, ResetScope, SubmitRequest, Transport};
pub use watchdog::BackgroundHandle;

/// Locks `m`, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
