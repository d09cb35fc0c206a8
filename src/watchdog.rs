/*
 * Watchdog Timer List
 *
 * A "watchdog" here is a software timer, not a hardware reset circuit. All
 * pending timers live in one list sorted by expiry, and each entry stores
 * its delay relative to the entry before it (its "lag"):
 *
 *   head                                          tail
 *   [lag 30] -> [lag 20] -> [lag 0] -> [lag 45]
 *   expires:  30         50         50         95
 *
 * Consequences:
 * - The head is always the next timer to fire; a tick only touches the head
 * - Inserting walks the list accumulating lag and splits the lag of the
 *   entry it lands in front of
 * - Cancelling folds the removed entry's lag into its successor
 * - Entries with equal expiry keep their start order
 *
 * Entries come from a fixed pool sized at boot. Handles carry a generation
 * so a stale handle (timer already fired and recycled) is rejected rather
 * than cancelling someone else's timer.
 *
 * The list is generic over the payload it carries; the scheduler stores
 * "wake this task" and "run this callback" actions in it.
 */

use alloc::vec::Vec;
use core::fmt;

use crate::error::KernelError;

/// Timer ticks
pub type Ticks = u32;

/// Handle of a watchdog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WdogId {
    slot: u16,
    generation: u16,
}

impl WdogId {
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl fmt::Display for WdogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wdog({}.{})", self.slot, self.generation)
    }
}

/// How long a CPU may sleep before a wakeup-relevant timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupDelay {
    /// The soonest wakeup-flagged timer fires in this many ticks
    Ticks(Ticks),

    /// No wakeup-flagged timer is pending
    Unbounded,
}

enum SlotState<T> {
    Free,
    Armed { lag: Ticks, wakeup: bool, payload: T },
    /// Allocated but not on the active list (fired, waiting to be re-armed or released)
    Idle,
}

struct Slot<T> {
    generation: u16,
    next: Option<u16>,
    state: SlotState<T>,
}

/// Sorted, delta-encoded list of pending timers
pub struct WatchdogList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    head: Option<u16>,
    armed: usize,
}

impl<T> WatchdogList<T> {
    /// Create a list backed by `capacity` pre-allocated entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                generation: 0,
                next: None,
                state: SlotState::Free,
            });
        }
        // Hand out low slots first
        let free = (0..capacity as u16).rev().collect();

        Self {
            slots,
            free,
            head: None,
            armed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.armed
    }

    pub fn is_empty(&self) -> bool {
        self.armed == 0
    }

    /// Entries not yet handed out
    pub fn available(&self) -> usize {
        self.free.len()
    }

    fn slot(&self, id: WdogId) -> Option<&Slot<T>> {
        self.slots
            .get(id.slot())
            .filter(|slot| slot.generation == id.generation && !matches!(slot.state, SlotState::Free))
    }

    /// Whether `id` refers to a live (armed or idle) entry
    pub fn contains(&self, id: WdogId) -> bool {
        self.slot(id).is_some()
    }

    /// Whether `id` is currently counting down
    pub fn is_armed(&self, id: WdogId) -> bool {
        matches!(self.slot(id), Some(Slot { state: SlotState::Armed { .. }, .. }))
    }

    /// Take an entry from the pool and arm it
    ///
    /// Returns the payload back if the pool is exhausted. A delay of 0 is
    /// treated as 1 tick: a timer never fires in the tick it was started.
    pub fn start(&mut self, ticks: Ticks, payload: T, wakeup: bool) -> Result<WdogId, T> {
        let Some(slot) = self.free.pop() else {
            return Err(payload);
        };
        let entry = &mut self.slots[slot as usize];
        entry.state = SlotState::Idle;
        let id = WdogId {
            slot,
            generation: entry.generation,
        };

        self.link(slot, ticks.max(1), payload, wakeup);
        Ok(id)
    }

    /// Re-arm an entry that already belongs to the caller
    ///
    /// An armed entry is first taken off the list (its old payload is
    /// dropped); an idle one is simply linked in again.
    pub fn restart(&mut self, id: WdogId, ticks: Ticks, payload: T, wakeup: bool) -> Result<(), KernelError> {
        if !self.contains(id) {
            return Err(KernelError::InvalidArgument);
        }
        if self.is_armed(id) {
            self.unlink(id.slot);
        }
        self.link(id.slot, ticks.max(1), payload, wakeup);
        Ok(())
    }

    /// Insert `slot` so that it expires `delay` ticks from now
    fn link(&mut self, slot: u16, delay: Ticks, payload: T, wakeup: bool) {
        let mut delay = delay;
        let mut prev: Option<u16> = None;
        let mut cur = self.head;

        // Equal expiry goes after the existing entries
        while let Some(index) = cur {
            let lag = self.lag_of(index);
            if delay < lag {
                break;
            }
            delay -= lag;
            prev = cur;
            cur = self.slots[index as usize].next;
        }

        // Split the lag of the entry we land in front of
        if let Some(index) = cur {
            if let SlotState::Armed { lag, .. } = &mut self.slots[index as usize].state {
                *lag -= delay;
            }
        }

        let entry = &mut self.slots[slot as usize];
        entry.state = SlotState::Armed {
            lag: delay,
            wakeup,
            payload,
        };
        entry.next = cur;

        match prev {
            Some(prev) => self.slots[prev as usize].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.armed += 1;
    }

    /// Take `slot` off the active list, folding its lag into the successor
    ///
    /// Leaves the slot Idle and returns its payload.
    fn unlink(&mut self, slot: u16) -> Option<T> {
        let mut prev: Option<u16> = None;
        let mut cur = self.head;
        while let Some(index) = cur {
            if index == slot {
                break;
            }
            prev = cur;
            cur = self.slots[index as usize].next;
        }
        cur?;

        let next = self.slots[slot as usize].next.take();
        let (lag, payload) = match core::mem::replace(&mut self.slots[slot as usize].state, SlotState::Idle) {
            SlotState::Armed { lag, payload, .. } => (lag, payload),
            other => {
                self.slots[slot as usize].state = other;
                return None;
            }
        };

        match prev {
            Some(prev) => self.slots[prev as usize].next = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            if let SlotState::Armed { lag: next_lag, .. } = &mut self.slots[next as usize].state {
                *next_lag += lag;
            }
        }
        self.armed -= 1;
        Some(payload)
    }

    fn lag_of(&self, slot: u16) -> Ticks {
        match self.slots[slot as usize].state {
            SlotState::Armed { lag, .. } => lag,
            _ => 0,
        }
    }

    fn free_slot(&mut self, slot: u16) {
        let entry = &mut self.slots[slot as usize];
        entry.state = SlotState::Free;
        entry.next = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
    }

    /// Stop a timer and return its entry to the pool
    ///
    /// Returns the payload if the timer was still armed. Cancelling an idle
    /// (already fired) entry releases it and returns None.
    pub fn cancel(&mut self, id: WdogId) -> Result<Option<T>, KernelError> {
        if !self.contains(id) {
            return Err(KernelError::InvalidArgument);
        }
        let payload = if self.is_armed(id) { self.unlink(id.slot) } else { None };
        self.free_slot(id.slot);
        Ok(payload)
    }

    /// Ticks until `id` fires
    pub fn remaining(&self, id: WdogId) -> Option<Ticks> {
        if !self.is_armed(id) {
            return None;
        }
        let mut total: Ticks = 0;
        let mut cur = self.head;
        while let Some(index) = cur {
            total = total.saturating_add(self.lag_of(index));
            if index == id.slot {
                return Some(total);
            }
            cur = self.slots[index as usize].next;
        }
        None
    }

    /// Let `ticks` elapse
    ///
    /// Entries that became due are left at the front with lag 0; drain them
    /// with pop_expired().
    pub fn advance(&mut self, ticks: Ticks) {
        let mut remaining = ticks;
        let mut cur = self.head;

        while remaining > 0 {
            let Some(index) = cur else { break };
            let entry = &mut self.slots[index as usize];
            if let SlotState::Armed { lag, .. } = &mut entry.state {
                if *lag > remaining {
                    *lag -= remaining;
                    remaining = 0;
                } else {
                    remaining -= *lag;
                    *lag = 0;
                }
            }
            cur = entry.next;
        }
    }

    /// Dequeue the head if it is due
    ///
    /// The entry stays allocated (idle): the caller either re-arms it with
    /// restart() or gives it back with cancel()/release().
    pub fn pop_expired(&mut self) -> Option<(WdogId, T)> {
        let head = self.head?;
        if self.lag_of(head) != 0 {
            return None;
        }
        let payload = self.unlink(head)?;
        let id = WdogId {
            slot: head,
            generation: self.slots[head as usize].generation,
        };
        Some((id, payload))
    }

    /// Return an idle entry to the pool
    pub fn release(&mut self, id: WdogId) {
        if self.contains(id) && !self.is_armed(id) {
            self.free_slot(id.slot);
        }
    }

    /// Delay until the soonest timer flagged as a CPU wakeup source
    pub fn wakeup_delay(&self) -> WakeupDelay {
        let mut total: Ticks = 0;
        let mut cur = self.head;
        while let Some(index) = cur {
            let entry = &self.slots[index as usize];
            if let SlotState::Armed { lag, wakeup, .. } = entry.state {
                total = total.saturating_add(lag);
                if wakeup {
                    return WakeupDelay::Ticks(total);
                }
            }
            cur = entry.next;
        }
        WakeupDelay::Unbounded
    }

    /// Delay until the next timer of any kind
    pub fn next_expiry(&self) -> Option<Ticks> {
        self.head.map(|head| self.lag_of(head))
    }

    /// Absolute expiry (relative to now) of every armed entry, head first
    pub fn expiries(&self) -> Vec<(WdogId, Ticks)> {
        let mut out = Vec::with_capacity(self.armed);
        let mut total: Ticks = 0;
        let mut cur = self.head;
        while let Some(index) = cur {
            let entry = &self.slots[index as usize];
            total = total.saturating_add(self.lag_of(index));
            out.push((
                WdogId {
                    slot: index,
                    generation: entry.generation,
                },
                total,
            ));
            cur = entry.next;
        }
        out
    }

    /// Payload of an armed entry
    pub fn payload(&self, id: WdogId) -> Option<&T> {
        match self.slot(id) {
            Some(Slot {
                state: SlotState::Armed { payload, .. },
                ..
            }) => Some(payload),
            _ => None,
        }
    }
}
