//! Tag/slot allocator.
//!
//! The pool is an array of `N` I/O slots plus a round-robin cursor. A slot holds at most one
//! [`Command`]; the command is owned by the pool for as long as it is in flight. One extra
//! index past the I/O range is the task-management proxy slot: it is never handed out by
//! [`SlotPool::find_free`] and only tracks whether a synchronous abort/reset is in progress.

use std::fmt;

use serde::Serialize;

use crate::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(u16);

impl SlotId {
    pub fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct SlotPool {
    slots: Vec<Option<Command>>,
    cursor: usize,
    occupied: usize,
    proxy_busy: bool,
}

impl SlotPool {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(usize::from(capacity));
        slots.resize_with(usize::from(capacity), || None);
        Self {
            slots,
            cursor: 0,
            occupied: 0,
            proxy_busy: false,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.occupied
    }

    pub(crate) fn has_free(&self) -> bool {
        self.occupied < self.slots.len()
    }

    /// Index of the task-management slot (one past the last I/O slot).
    pub(crate) fn proxy_slot(&self) -> SlotId {
        // `AdapterConfig::validate` keeps the capacity below `u16::MAX`.
        SlotId(self.slots.len() as u16)
    }

    /// Scans forward from the cursor for a free slot. O(1) amortized, O(N) when nearly full.
    pub(crate) fn find_free(&self) -> Option<SlotId> {
        if !self.has_free() {
            return None;
        }
        let n = self.slots.len();
        (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&idx| self.slots[idx].is_none())
            .map(|idx| SlotId(idx as u16))
    }

    /// Places `cmd` in `slot` and advances the cursor past it.
    ///
    /// Returns the command back if the slot is out of range or already taken.
    pub(crate) fn occupy(&mut self, slot: SlotId, mut cmd: Command) -> Result<(), Command> {
        let idx = slot.index();
        match self.slots.get_mut(idx) {
            Some(entry) if entry.is_none() => {
                cmd.slot = Some(slot);
                *entry = Some(cmd);
                self.occupied += 1;
                self.cursor = (idx + 1) % self.slots.len();
                Ok(())
            }
            _ => Err(cmd),
        }
    }

    /// Empties `slot`. Releasing a free (or out-of-range) slot is a no-op returning `None`.
    pub(crate) fn vacate(&mut self, slot: SlotId) -> Option<Command> {
        let mut cmd = self.slots.get_mut(slot.index())?.take()?;
        self.occupied -= 1;
        cmd.slot = None;
        Some(cmd)
    }

    pub(crate) fn get(&self, slot: SlotId) -> Option<&Command> {
        self.slots.get(slot.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, slot: SlotId) -> Option<&mut Command> {
        self.slots.get_mut(slot.index()).and_then(Option::as_mut)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotId, &Command)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|c| (SlotId(i as u16), c)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (SlotId, &mut Command)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|c| (SlotId(i as u16), c)))
    }

    /// Slots whose command matches `pred`, in slot order.
    pub(crate) fn find_all<F>(&self, mut pred: F) -> Vec<SlotId>
    where
        F: FnMut(&Command) -> bool,
    {
        self.iter()
            .filter(|(_, c)| pred(c))
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Claims the proxy slot for one task-management request.
    ///
    /// Requests are already serialized by the adapter lock, so the busy flag is
    /// informational: it is never set between locked calls. The claim is released when the
    /// guard drops, including while unwinding out of a panicking transport.
    pub(crate) fn claim_proxy(&mut self) -> Option<ProxyClaim<'_>> {
        if self.proxy_busy {
            return None;
        }
        self.proxy_busy = true;
        Some(ProxyClaim {
            busy: &mut self.proxy_busy,
        })
    }
}

#[derive(Debug)]
pub(crate) struct ProxyClaim<'a> {
    busy: &'a mut bool,
}

impl Drop for ProxyClaim<'_> {
    fn drop(&mut self) {
        *self.busy = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Command {
        Command::polled(0, 0, Vec::new())
    }

    #[test]
    fn allocation_is_round_robin() {
        let mut pool = SlotPool::new(4);
        let s0 = pool.find_free().unwrap();
        pool.occupy(s0, cmd()).unwrap();
        let s1 = pool.find_free().unwrap();
        pool.occupy(s1, cmd()).unwrap();
        assert_eq!((s0.index(), s1.index()), (0, 1));

        // Freeing slot 0 does not pull the cursor back.
        pool.vacate(s0).unwrap();
        assert_eq!(pool.find_free().unwrap().index(), 2);
    }

    #[test]
    fn full_pool_has_no_free_slot_and_released_slots_are_reusable() {
        let mut pool = SlotPool::new(2);
        let a = pool.find_free().unwrap();
        pool.occupy(a, cmd()).unwrap();
        let b = pool.find_free().unwrap();
        pool.occupy(b, cmd()).unwrap();
        assert_eq!(pool.find_free(), None);

        pool.vacate(b).unwrap();
        assert_eq!(pool.find_free(), Some(b));
    }

    #[test]
    fn occupied_slot_cannot_be_taken_twice() {
        let mut pool = SlotPool::new(2);
        pool.occupy(SlotId(1), cmd()).unwrap();
        let second = cmd();
        let id = second.id();
        let back = pool.occupy(SlotId(1), second).unwrap_err();
        assert_eq!(back.id(), id);
        assert_eq!(pool.occupied(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let mut pool = SlotPool::new(2);
        pool.occupy(SlotId(0), cmd()).unwrap();
        assert!(pool.vacate(SlotId(0)).is_some());
        assert!(pool.vacate(SlotId(0)).is_none());
        assert!(pool.vacate(SlotId(9)).is_none());
        assert_eq!(pool.occupied(), 0);
    }

    #[test]
    fn proxy_slot_is_exclusive_and_outside_io_range() {
        let mut pool = SlotPool::new(3);
        assert_eq!(pool.proxy_slot().index(), 3);
        let claim = pool.claim_proxy();
        assert!(claim.is_some());
        drop(claim);
        assert!(!pool.proxy_busy);

        pool.proxy_busy = true;
        assert!(pool.claim_proxy().is_none());
        pool.proxy_busy = false;
        assert!(pool.claim_proxy().is_some());
        assert!(!pool.proxy_busy);
    }

    #[test]
    fn proxy_claim_is_released_while_unwinding() {
        let mut pool = SlotPool::new(2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _claim = pool.claim_proxy();
            panic!("transport blew up");
        }));
        assert!(result.is_err());
        assert!(!pool.proxy_busy);
    }
}
