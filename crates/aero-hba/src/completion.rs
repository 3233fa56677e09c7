//! Classification of hardware completions.

use crate::command::{Command, CommandFlags, CompletionReason};
use crate::dispatch::AdapterState;
use crate::throttle::{Backpressure, Throttle};
use crate::transport::{CompletionTag, RawCompletion, RawStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Deliver {
        reason: CompletionReason,
        residual: u64,
    },
    Retry(Backpressure),
}

pub(crate) fn classify(status: &RawStatus) -> Outcome {
    let deliver = |reason| Outcome::Deliver {
        reason,
        residual: 0,
    };
    match *status {
        RawStatus::Good => deliver(CompletionReason::Success),
        RawStatus::Underrun { residual } => Outcome::Deliver {
            reason: CompletionReason::Success,
            residual,
        },
        RawStatus::Overrun => deliver(CompletionReason::DataOverrun),
        RawStatus::DeviceGone => deliver(CompletionReason::DeviceGone),
        RawStatus::ResetInProgress => deliver(CompletionReason::Reset),
        RawStatus::QueueFull => Outcome::Retry(Backpressure::QueueFull),
        RawStatus::Busy => Outcome::Retry(Backpressure::Busy),
        RawStatus::ProtocolError { code } => deliver(CompletionReason::ProtocolError { code }),
        RawStatus::Aborted => deliver(CompletionReason::Aborted),
    }
}

impl AdapterState {
    pub(crate) fn complete_raw(&mut self, raw: RawCompletion) {
        let slot = match raw.tag {
            CompletionTag::Slot(slot) => slot,
            CompletionTag::Context(context) => {
                let found = self
                    .slots
                    .find_all(|c| c.is_control() && c.context() == Some(context));
                match found.first() {
                    Some(&slot) => slot,
                    None => {
                        tracing::warn!(context, "completion for unknown control context");
                        return;
                    }
                }
            }
        };

        // A reset may already have terminated whatever was in this slot.
        let Some(cmd) = self.release(slot) else {
            tracing::warn!(%slot, status = ?raw.status, "stale completion for idle slot");
            return;
        };

        if cmd.is_control() {
            tracing::debug!(%slot, context = ?cmd.context(), status = ?raw.status, "event acknowledged");
            return;
        }

        if cmd.flags.contains(CommandFlags::ABORT_REQUESTED) {
            self.finish(cmd, CompletionReason::Aborted, 0);
            return;
        }

        match classify(&raw.status) {
            Outcome::Deliver { reason, residual } => {
                if reason.is_success() {
                    if let Ok(t) = self.targets.get_mut(cmd.target()) {
                        t.escalation = 0;
                    }
                }
                tracing::debug!(id = %cmd.id(), %slot, ?reason, residual, "command complete");
                self.finish(cmd, reason, residual);
            }
            Outcome::Retry(kind) => self.handle_backpressure(cmd, kind),
        }
    }

    /// Queue-full/busy: retry at the head of the wait queue with a reduced throttle, or give
    /// up once the per-command budget is spent.
    pub(crate) fn handle_backpressure(&mut self, mut cmd: Command, kind: Backpressure) {
        let quiesced = self.quiesced;
        let Ok(t) = self.targets.get_mut(cmd.target()) else {
            self.finish(cmd, CompletionReason::Terminated, 0);
            return;
        };

        // Checked before counting so a budget of `u8::MAX` still runs out.
        if cmd.qfull_retries >= t.qfull_retries {
            t.set_throttle(Throttle::Drain, quiesced);
            let reason = match kind {
                Backpressure::QueueFull => CompletionReason::QueueFullExhausted,
                Backpressure::Busy => CompletionReason::BusyExhausted,
            };
            tracing::warn!(
                id = %cmd.id(),
                target_id = cmd.target(),
                retries = t.qfull_retries,
                ?kind,
                "retry budget exhausted"
            );
            self.finish(cmd, reason, 0);
            return;
        }

        cmd.qfull_retries += 1;
        t.enter_qfull(quiesced);
        tracing::debug!(
            id = %cmd.id(),
            target_id = cmd.target(),
            attempt = cmd.qfull_retries,
            throttle = ?t.throttle,
            ?kind,
            "retrying after backpressure"
        );
        cmd.flags.insert(CommandFlags::RETRY | CommandFlags::HEAD);
        cmd.flags.remove(CommandFlags::TIMED_OUT);
        self.stats.retries += 1;
        self.enqueue(cmd);
    }
}
