/*
 * TCB Table (pid hash)
 *
 * Fixed-capacity arena holding every TCB. A pid maps to its slot with
 * `pid % capacity` (capacity is a power of two, so this is a mask). New
 * pids are handed out in increasing order, skipping values whose slot is
 * occupied, so lookups stay O(1) and a stale pid never aliases a live task:
 * the slot's TCB must carry the exact pid asked for.
 *
 * Idle tasks are inserted with pids 0..cpu_count before the first
 * ordinary pid is allocated.
 */

use alloc::vec::Vec;

use super::tcb::{Link, Tcb};
use super::types::Pid;

/// Largest pid handed out before wrapping back to the first ordinary pid
const PID_MAX: u32 = i32::MAX as u32;

pub struct TaskTable {
    slots: Vec<Option<Tcb>>,
    mask: usize,
    first_pid: u32,
    next_pid: u32,
    count: usize,
}

impl TaskTable {
    /// Create a table for `capacity` tasks (power of two)
    ///
    /// `first_pid` is where ordinary pid allocation starts.
    pub fn new(capacity: usize, first_pid: u32) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            mask: capacity - 1,
            first_pid,
            next_pid: first_pid,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    fn index(&self, pid: Pid) -> usize {
        pid.0 as usize & self.mask
    }

    /// Reserve the next free pid
    ///
    /// The pid's slot stays empty until insert(); None when the table is full.
    pub fn alloc_pid(&mut self) -> Option<Pid> {
        if self.is_full() {
            return None;
        }

        // A free slot exists, so at most `capacity` candidates are tried
        loop {
            let pid = Pid(self.next_pid);
            self.next_pid = if self.next_pid >= PID_MAX {
                self.first_pid
            } else {
                self.next_pid + 1
            };

            if self.slots[self.index(pid)].is_none() {
                return Some(pid);
            }
        }
    }

    /// Place a TCB in its slot
    ///
    /// Returns the TCB back if the slot is taken.
    pub fn insert(&mut self, tcb: Tcb) -> Result<(), Tcb> {
        let index = self.index(tcb.pid);
        let slot = &mut self.slots[index];
        if slot.is_some() {
            return Err(tcb);
        }
        *slot = Some(tcb);
        self.count += 1;
        Ok(())
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Tcb> {
        let index = self.index(pid);
        let slot = &mut self.slots[index];
        if slot.as_ref().is_some_and(|tcb| tcb.pid == pid) {
            self.count -= 1;
            slot.take()
        } else {
            None
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Tcb> {
        self.slots[self.index(pid)].as_ref().filter(|tcb| tcb.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Tcb> {
        let index = self.index(pid);
        self.slots[index].as_mut().filter(|tcb| tcb.pid == pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    pub(crate) fn link(&self, pid: Pid) -> Option<&Link> {
        self.get(pid).map(|tcb| &tcb.link)
    }

    pub(crate) fn link_mut(&mut self, pid: Pid) -> Option<&mut Link> {
        self.get_mut(pid).map(|tcb| &mut tcb.link)
    }

    /// All live TCBs in slot order
    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tcb> {
        self.slots.iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::{Gid, Priority};

    fn tcb(pid: Pid) -> Tcb {
        Tcb::new(pid, Gid(pid.0), None, Priority::DEFAULT)
    }

    #[test]
    fn pids_increase_and_skip_occupied_slots() {
        let mut table = TaskTable::new(4, 1);
        table.insert(tcb(Pid(0))).unwrap();

        let a = table.alloc_pid().unwrap();
        table.insert(tcb(a)).unwrap();
        let b = table.alloc_pid().unwrap();
        table.insert(tcb(b)).unwrap();
        assert_eq!((a, b), (Pid(1), Pid(2)));

        let c = table.alloc_pid().unwrap();
        table.insert(tcb(c)).unwrap();
        assert_eq!(c, Pid(3));
        assert!(table.is_full());
        assert_eq!(table.alloc_pid(), None);

        // Pid 4 would hash onto idle's slot 0
        table.remove(a);
        assert_eq!(table.alloc_pid(), Some(Pid(5)));
    }

    #[test]
    fn stale_pid_does_not_alias() {
        let mut table = TaskTable::new(4, 1);
        table.insert(tcb(Pid(1))).unwrap();
        table.remove(Pid(1));
        table.insert(tcb(Pid(5))).unwrap();
        assert!(table.get(Pid(1)).is_none());
        assert!(table.remove(Pid(1)).is_none());
        assert_eq!(table.get(Pid(5)).map(|t| t.pid()), Some(Pid(5)));
    }

    #[test]
    fn occupied_slot_rejects_insert() {
        let mut table = TaskTable::new(2, 0);
        table.insert(tcb(Pid(0))).unwrap();
        assert!(table.insert(tcb(Pid(2))).is_err());
        assert_eq!(table.len(), 1);
    }
}
