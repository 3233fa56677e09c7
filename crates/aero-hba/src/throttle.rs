//! Per-target throttle state machine.
//!
//! States, most permissive first:
//!
//! | state      | admits                                   |
//! |------------|------------------------------------------|
//! | `Max`      | while in-flight < the target's ceiling   |
//! | `Limit(n)` | while in-flight < n                      |
//! | `Hold`     | nothing (reset delay, presence, quiesce) |
//! | `Drain`    | nothing until in-flight reaches zero     |
//! | `QFull`    | while in-flight < limit, until reopened  |
//! | `Choke`    | nothing, ever (adapter failure)          |
//!
//! `Choke` dominates every other transition. While the adapter is quiesced only `Hold` may
//! be entered. While a reset delay is running only `Hold` and `Choke` may be entered; the
//! watchdog clears the delay before restoring `Max`.

use serde::Serialize;

use crate::target::TargetState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Throttle {
    Max,
    Limit(u16),
    Hold,
    Drain,
    QFull { limit: u16 },
    Choke,
}

impl Throttle {
    pub fn admits(self, in_flight: u32, max: u16) -> bool {
        match self {
            Throttle::Max => in_flight < u32::from(max),
            Throttle::Limit(n) | Throttle::QFull { limit: n } => in_flight < u32::from(n),
            Throttle::Hold | Throttle::Drain | Throttle::Choke => false,
        }
    }
}

/// Which backpressure signal a completion carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backpressure {
    QueueFull,
    Busy,
}

impl TargetState {
    /// Applies `to` subject to the dominance rules above. Returns whether it took effect.
    pub(crate) fn set_throttle(&mut self, to: Throttle, quiesced: bool) -> bool {
        if self.throttle == Throttle::Choke {
            return false;
        }
        let allowed = match to {
            Throttle::Choke | Throttle::Hold => true,
            _ => !quiesced && self.reset_delay_ms <= 0,
        };
        if allowed && self.throttle != to {
            tracing::trace!(target_id = self.id, from = ?self.throttle, ?to, "throttle");
            self.throttle = to;
        }
        allowed
    }

    /// Reopens the target to full concurrency unless something still holds it.
    pub(crate) fn restore_max(&mut self, quiesced: bool) -> bool {
        if self.presence.holds_throttle() {
            return false;
        }
        if self.untagged_active {
            return self.set_throttle(Throttle::Limit(1), quiesced);
        }
        self.set_throttle(Throttle::Max, quiesced)
    }

    /// Queue-full/busy while retries remain: shrink to `max(in_flight - 2, 0)`.
    pub(crate) fn enter_qfull(&mut self, quiesced: bool) {
        if self.reset_delay_ms > 0 {
            return;
        }
        let limit = u16::try_from(self.in_flight.saturating_sub(2)).unwrap_or(u16::MAX);
        if self.set_throttle(Throttle::QFull { limit }, quiesced) {
            self.qfull_restart_ms = self.qfull_retry_interval_ms;
        }
    }

    /// Starts a reset cooldown: nothing is admitted until the watchdog counts it down.
    pub(crate) fn hold_for_reset(&mut self, delay_ms: i64, quiesced: bool) {
        self.set_throttle(Throttle::Hold, quiesced);
        self.reset_delay_ms = delay_ms.max(1);
    }

    /// Watchdog step. Returns `true` when the target became admissible again.
    pub(crate) fn tick_throttle(&mut self, tick_ms: i64, quiesced: bool) -> bool {
        if self.reset_delay_ms > 0 {
            self.reset_delay_ms -= tick_ms;
            if self.reset_delay_ms > 0 {
                return false;
            }
            self.reset_delay_ms = 0;
            return self.restore_max(quiesced);
        }

        match self.throttle {
            Throttle::Drain if self.in_flight == 0 => self.restore_max(quiesced),
            Throttle::QFull { limit } => {
                self.qfull_restart_ms -= tick_ms;
                if self.in_flight < u32::from(limit) || self.qfull_restart_ms <= 0 {
                    self.restore_max(quiesced)
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;

    fn target() -> TargetState {
        TargetState::new(0, &AdapterConfig::default())
    }

    #[test]
    fn admission_per_state() {
        assert!(Throttle::Max.admits(31, 32));
        assert!(!Throttle::Max.admits(32, 32));
        assert!(Throttle::Limit(2).admits(1, 32));
        assert!(!Throttle::Limit(2).admits(2, 32));
        assert!(!Throttle::QFull { limit: 0 }.admits(0, 32));
        for t in [Throttle::Hold, Throttle::Drain, Throttle::Choke] {
            assert!(!t.admits(0, 32));
        }
    }

    #[test]
    fn choke_dominates() {
        let mut t = target();
        assert!(t.set_throttle(Throttle::Choke, false));
        assert!(!t.set_throttle(Throttle::Max, false));
        assert!(!t.set_throttle(Throttle::Hold, false));
        assert_eq!(t.throttle, Throttle::Choke);
    }

    #[test]
    fn quiesce_only_permits_hold() {
        let mut t = target();
        assert!(!t.set_throttle(Throttle::Drain, true));
        assert_eq!(t.throttle, Throttle::Max);
        assert!(t.set_throttle(Throttle::Hold, true));
        assert!(!t.restore_max(true));
        assert_eq!(t.throttle, Throttle::Hold);
    }

    #[test]
    fn qfull_limit_is_in_flight_minus_two() {
        let mut t = target();
        t.in_flight = 7;
        t.enter_qfull(false);
        assert_eq!(t.throttle, Throttle::QFull { limit: 5 });

        let mut t = target();
        t.in_flight = 1;
        t.enter_qfull(false);
        assert_eq!(t.throttle, Throttle::QFull { limit: 0 });
    }

    #[test]
    fn qfull_reopens_after_interval_or_when_drained_below_limit() {
        let mut t = target();
        t.qfull_retry_interval_ms = 300;
        t.in_flight = 1;
        t.enter_qfull(false);
        assert!(!t.tick_throttle(100, false));
        assert!(!t.tick_throttle(100, false));
        assert!(t.tick_throttle(100, false));
        assert_eq!(t.throttle, Throttle::Max);

        let mut t = target();
        t.qfull_retry_interval_ms = 10_000;
        t.in_flight = 6;
        t.enter_qfull(false);
        t.in_flight = 3;
        assert!(t.tick_throttle(100, false));
        assert_eq!(t.throttle, Throttle::Max);
    }

    #[test]
    fn reset_delay_holds_then_restores_max() {
        let mut t = target();
        t.hold_for_reset(2_000, false);
        assert_eq!(t.throttle, Throttle::Hold);
        // Non-hold transitions are refused while the delay runs.
        assert!(!t.set_throttle(Throttle::Max, false));
        assert!(!t.tick_throttle(1_000, false));
        assert!(t.tick_throttle(1_000, false));
        assert_eq!(t.throttle, Throttle::Max);
        assert_eq!(t.reset_delay_ms, 0);
    }

    #[test]
    fn drain_recovers_on_the_next_tick_once_idle() {
        let mut t = target();
        t.set_throttle(Throttle::Drain, false);
        t.in_flight = 1;
        assert!(!t.tick_throttle(1_000, false));
        t.in_flight = 0;
        assert!(t.tick_throttle(1_000, false));
        assert_eq!(t.throttle, Throttle::Max);
    }
}
