/*
 * Thread-Specific Data (pthread keys)
 *
 * Keys are allocated per task group; every member thread has its own value
 * slot for each key (the tls array in its TCB). A key may carry a
 * destructor that is run on thread exit for a non-null value.
 *
 * DESTRUCTOR PASSES:
 * =================
 *
 * A destructor may store new values under other keys, which would need
 * another destructor call. Exit therefore runs passes over all keys until a
 * pass finds nothing left to destroy, but never more than
 * DESTRUCTOR_ITERATIONS passes: a set of destructors that keep re-arming
 * each other cannot keep a thread from exiting. Within one pass each key's
 * destructor runs at most once.
 */

use super::Scheduler;
use super::types::Pid;
use crate::config::{DESTRUCTOR_ITERATIONS, KEYS_MAX};
use crate::error::KernelError;

/// pthread_key_t
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PthreadKey(pub u32);

impl PthreadKey {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<PthreadKey> for i32 {
    fn from(key: PthreadKey) -> i32 {
        key.0 as i32
    }
}

/// Destructor run on thread exit with the key's non-null value
///
/// It may read or overwrite the exiting thread's other values through the
/// ThreadData handle.
pub type KeyDestructor = fn(&mut ThreadData<'_>, usize);

/// The exiting thread's value slots, as seen by a destructor
pub struct ThreadData<'a> {
    pid: Pid,
    values: &'a mut [usize; KEYS_MAX],
}

impl ThreadData<'_> {
    /// Thread whose data is being destroyed
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn get(&self, key: PthreadKey) -> usize {
        self.values.get(key.index()).copied().unwrap_or(0)
    }

    pub fn set(&mut self, key: PthreadKey, value: usize) {
        if let Some(slot) = self.values.get_mut(key.index()) {
            *slot = value;
        }
    }
}

/// Keys of one task group
#[derive(Clone)]
pub struct KeyTable {
    in_use: u64,
    destructors: [Option<KeyDestructor>; KEYS_MAX],
}

impl KeyTable {
    pub const fn new() -> Self {
        Self {
            in_use: 0,
            destructors: [None; KEYS_MAX],
        }
    }

    pub fn is_used(&self, key: PthreadKey) -> bool {
        key.index() < KEYS_MAX && self.in_use & (1 << key.index()) != 0
    }

    pub fn count(&self) -> usize {
        self.in_use.count_ones() as usize
    }

    /// Claim the lowest free key
    pub fn create(&mut self, destructor: Option<KeyDestructor>) -> Option<PthreadKey> {
        let index = (0..KEYS_MAX).find(|index| self.in_use & (1 << index) == 0)?;
        self.in_use |= 1 << index;
        self.destructors[index] = destructor;
        Some(PthreadKey(index as u32))
    }

    pub fn delete(&mut self, key: PthreadKey) -> bool {
        if !self.is_used(key) {
            return false;
        }
        self.in_use &= !(1 << key.index());
        self.destructors[key.index()] = None;
        true
    }

    pub fn destructor(&self, key: PthreadKey) -> Option<KeyDestructor> {
        if self.is_used(key) {
            self.destructors[key.index()]
        } else {
            None
        }
    }

    /// Run destructors for an exiting thread's values
    ///
    /// Returns the number of destructor invocations.
    pub fn destroy_on_exit(&self, pid: Pid, values: &mut [usize; KEYS_MAX]) -> usize {
        let mut calls = 0;

        for pass in 0..DESTRUCTOR_ITERATIONS {
            let mut ran = false;
            for index in 0..KEYS_MAX {
                let key = PthreadKey(index as u32);
                let Some(destructor) = self.destructor(key) else {
                    continue;
                };
                let value = values[index];
                if value == 0 {
                    continue;
                }

                values[index] = 0;
                ran = true;
                calls += 1;
                let mut data = ThreadData { pid, values: &mut *values };
                destructor(&mut data, value);
            }
            if !ran {
                return calls;
            }
            log::debug!("{}: destructor pass {} ran", pid, pass + 1);
        }

        if values.iter().any(|value| *value != 0) {
            log::warn!("{}: data left after {} destructor passes", pid, DESTRUCTOR_ITERATIONS);
        }
        calls
    }
}

impl Default for KeyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Allocate a key in `pid`'s task group
    pub fn key_create(&mut self, pid: Pid, destructor: Option<KeyDestructor>) -> Result<PthreadKey, KernelError> {
        let gid = self.tasks.get(pid).ok_or(KernelError::NoSuchTask)?.group;
        let group = self.groups.get_mut(&gid).ok_or(KernelError::NoSuchTask)?;
        let key = group.keys.create(destructor).ok_or(KernelError::TryAgain)?;

        // A recycled key must not expose a previous key's values
        for member in group.members.iter() {
            if let Some(tcb) = self.tasks.get_mut(*member) {
                tcb.tls[key.index()] = 0;
            }
        }
        Ok(key)
    }

    /// Free a key and clear its value in every member thread
    ///
    /// No destructor runs.
    pub fn key_delete(&mut self, pid: Pid, key: PthreadKey) -> Result<(), KernelError> {
        let gid = self.tasks.get(pid).ok_or(KernelError::NoSuchTask)?.group;
        let group = self.groups.get_mut(&gid).ok_or(KernelError::NoSuchTask)?;
        if !group.keys.delete(key) {
            return Err(KernelError::InvalidArgument);
        }
        for member in group.members.iter() {
            if let Some(tcb) = self.tasks.get_mut(*member) {
                tcb.tls[key.index()] = 0;
            }
        }
        Ok(())
    }

    /// Value `pid` stored under `key`; 0 (null) for unused keys
    pub fn get_specific(&self, pid: Pid, key: PthreadKey) -> usize {
        let Some(tcb) = self.tasks.get(pid) else {
            return 0;
        };
        let used = self.groups.get(&tcb.group).is_some_and(|group| group.keys.is_used(key));
        if used { tcb.tls[key.index()] } else { 0 }
    }

    /// Store `value` under `key` for `pid`
    pub fn set_specific(&mut self, pid: Pid, key: PthreadKey, value: usize) -> Result<(), KernelError> {
        let gid = self.tasks.get(pid).ok_or(KernelError::NoSuchTask)?.group;
        let used = self.groups.get(&gid).is_some_and(|group| group.keys.is_used(key));
        if !used {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(tcb) = self.tasks.get_mut(pid) {
            tcb.tls[key.index()] = value;
        }
        Ok(())
    }

    /// Run key destructors for `pid`'s values
    pub(crate) fn destroy_thread_data(&mut self, pid: Pid) -> usize {
        let Some(tcb) = self.tasks.get_mut(pid) else {
            return 0;
        };
        let Some(group) = self.groups.get(&tcb.group) else {
            return 0;
        };
        group.keys.destroy_on_exit(pid, &mut tcb.tls)
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count_call(_: &mut ThreadData<'_>, _: usize) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn rearm_next(data: &mut ThreadData<'_>, value: usize) {
        // Keys 0..3 keep re-arming each other
        let next = PthreadKey(((value % 3) + 1) as u32 % 3);
        data.set(next, value + 1);
    }

    #[test]
    fn keys_are_allocated_lowest_first() {
        let mut table = KeyTable::new();
        let a = table.create(None).unwrap();
        let b = table.create(None).unwrap();
        assert_eq!((a, b), (PthreadKey(0), PthreadKey(1)));
        assert!(table.delete(a));
        assert!(!table.delete(a));
        assert_eq!(table.create(None), Some(PthreadKey(0)));
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn table_runs_out() {
        let mut table = KeyTable::new();
        for _ in 0..KEYS_MAX {
            table.create(None).unwrap();
        }
        assert_eq!(table.create(None), None);
        assert!(!table.is_used(PthreadKey(KEYS_MAX as u32)));
    }

    #[test]
    fn destructor_runs_once_for_non_null_value() {
        let mut table = KeyTable::new();
        let key = table.create(Some(count_call)).unwrap();
        let _unset = table.create(Some(count_call)).unwrap();
        let mut values = [0usize; KEYS_MAX];
        values[key.index()] = 0x1000;

        let before = CALLS.load(Ordering::SeqCst);
        assert_eq!(table.destroy_on_exit(Pid(1), &mut values), 1);
        assert_eq!(CALLS.load(Ordering::SeqCst) - before, 1);
        assert_eq!(values[key.index()], 0);
    }

    #[test]
    fn rearming_destructors_stop_after_bounded_passes() {
        let mut table = KeyTable::new();
        for _ in 0..3 {
            table.create(Some(rearm_next)).unwrap();
        }
        let mut values = [0usize; KEYS_MAX];
        values[0] = 1;
        values[1] = 2;
        values[2] = 3;

        let calls = table.destroy_on_exit(Pid(1), &mut values);
        assert!(calls <= DESTRUCTOR_ITERATIONS * 3);
        assert!(calls >= DESTRUCTOR_ITERATIONS);
    }
}
