/*
 * Counting Semaphores
 *
 * The blocking primitive of the scheduler. A task that finds the count at
 * zero is taken off its CPU and queued on the semaphore's wait list, most
 * urgent first and FIFO among equals. A post hands the unit straight to the
 * head waiter instead of incrementing the count, so a woken task never has
 * to race for it.
 *
 * Timed waits register a watchdog on behalf of the waiter. Whichever comes
 * first (post, timeout, explicit interrupt) moves the task back to Ready;
 * the other sources find it no longer Blocked and do nothing.
 */

use alloc::vec::Vec;
use core::fmt;

use super::list::TaskList;
use super::tcb::ListTag;
use super::timer::WdogAction;
use super::types::{CpuId, Pid};
use super::Scheduler;
use crate::error::KernelError;
use crate::watchdog::Ticks;

/// Largest value a semaphore count may reach
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

/// Generations wrap below this, so a packed handle is never negative
const GENERATION_LIMIT: u16 = 0x8000;

/// Semaphore handle
///
/// Carries the generation of its slot: once a semaphore is destroyed, old
/// handles to it are rejected even after the slot is reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemId {
    slot: u16,
    generation: u16,
}

impl SemId {
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    /// Packed form used by the C-shaped entry points
    pub fn to_raw(self) -> u32 {
        (u32::from(self.generation) << 16) | u32::from(self.slot)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            slot: raw as u16,
            generation: (raw >> 16) as u16,
        }
    }
}

impl fmt::Display for SemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sem({}.{})", self.slot, self.generation)
    }
}

/// Outcome of sem_wait()
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SemWait {
    /// A unit was available and has been taken
    Acquired,

    /// The caller was blocked; it reads wait_status() once resumed
    Blocked,
}

pub struct Semaphore {
    pub(crate) count: u32,
    pub(crate) waiters: TaskList,
}

struct SemSlot {
    generation: u16,
    sem: Option<Semaphore>,
}

/// Fixed arena of semaphores
pub struct SemaphoreTable {
    slots: Vec<SemSlot>,
}

impl SemaphoreTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || SemSlot {
            generation: 0,
            sem: None,
        });
        Self { slots }
    }

    fn slot(&self, id: SemId) -> Option<&SemSlot> {
        self.slots.get(id.slot()).filter(|slot| slot.generation == id.generation)
    }

    pub fn get(&self, id: SemId) -> Option<&Semaphore> {
        self.slot(id)?.sem.as_ref()
    }

    pub fn get_mut(&mut self, id: SemId) -> Option<&mut Semaphore> {
        self.slots
            .get_mut(id.slot())
            .filter(|slot| slot.generation == id.generation)?
            .sem
            .as_mut()
    }

    fn insert(&mut self, sem: Semaphore) -> Option<SemId> {
        let index = self.slots.iter().position(|slot| slot.sem.is_none())?;
        let slot = &mut self.slots[index];
        slot.sem = Some(sem);
        Some(SemId {
            slot: index as u16,
            generation: slot.generation,
        })
    }

    /// Empty the slot and retire every handle to it
    fn remove(&mut self, id: SemId) -> Option<Semaphore> {
        let slot = self
            .slots
            .get_mut(id.slot())
            .filter(|slot| slot.generation == id.generation)?;
        let sem = slot.sem.take()?;
        slot.generation = (slot.generation + 1) % GENERATION_LIMIT;
        Some(sem)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SemId, &Semaphore)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.sem.as_ref().map(|sem| {
                let id = SemId {
                    slot: index as u16,
                    generation: slot.generation,
                };
                (id, sem)
            })
        })
    }
}

impl Scheduler {
    /// Create a semaphore holding `value` units
    pub fn sem_init(&mut self, value: u32) -> Result<SemId, KernelError> {
        if value > SEM_VALUE_MAX {
            return Err(KernelError::InvalidArgument);
        }
        let sem = Semaphore {
            count: value,
            waiters: TaskList::new(),
        };
        match self.semaphores.insert(sem) {
            Some(id) => Ok(id),
            None => Err(self.heap.allocation_failed(core::mem::size_of::<Semaphore>())),
        }
    }

    /// Destroy a semaphore nobody is waiting on
    pub fn sem_destroy(&mut self, id: SemId) -> Result<(), KernelError> {
        let sem = self.semaphores.get(id).ok_or(KernelError::InvalidArgument)?;
        if !sem.waiters.is_empty() {
            return Err(KernelError::Busy);
        }
        self.semaphores.remove(id);
        Ok(())
    }

    /// Current count of a semaphore
    pub fn sem_value(&self, id: SemId) -> Result<u32, KernelError> {
        self.semaphores.get(id).map(|sem| sem.count).ok_or(KernelError::InvalidArgument)
    }

    /// Tasks blocked on a semaphore, in wake-up order
    pub fn sem_waiters(&self, id: SemId) -> Result<Vec<Pid>, KernelError> {
        let sem = self.semaphores.get(id).ok_or(KernelError::InvalidArgument)?;
        Ok(sem.waiters.iter(&self.tasks).collect())
    }

    /// Release one unit: wake the most urgent waiter, or bump the count
    pub fn sem_post(&mut self, id: SemId) -> Result<(), KernelError> {
        let sem = self.semaphores.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        match sem.waiters.front() {
            Some(waiter) => {
                self.wake(waiter, super::types::WaitStatus::Signaled);
            }
            None => {
                if sem.count >= SEM_VALUE_MAX {
                    return Err(KernelError::InvalidArgument);
                }
                sem.count += 1;
            }
        }
        Ok(())
    }

    /// Take a unit without blocking
    pub fn sem_trywait(&mut self, id: SemId) -> Result<(), KernelError> {
        let sem = self.semaphores.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if sem.count == 0 {
            return Err(KernelError::TryAgain);
        }
        sem.count -= 1;
        Ok(())
    }

    /// Take a unit on behalf of the task running on `cpu`, blocking if none
    /// is available
    ///
    /// With a timeout the wait is bounded by a watchdog; expiry resumes the
    /// task with WaitStatus::TimedOut. A timeout of 0 is rounded up to one
    /// tick.
    pub fn sem_wait(&mut self, cpu: CpuId, id: SemId, timeout: Option<Ticks>) -> Result<SemWait, KernelError> {
        self.valid_cpu(cpu)?;
        let sem = self.semaphores.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if sem.count > 0 {
            sem.count -= 1;
            return Ok(SemWait::Acquired);
        }

        let pid = self.current(cpu).ok_or(KernelError::InvalidArgument)?;
        if self.tasks.get(pid).is_some_and(|tcb| tcb.is_idle) {
            return Err(KernelError::NotPermitted);
        }

        // Reserve the timeout before touching any list
        let wdog = match timeout {
            Some(ticks) => Some(self.start_timeout(pid, ticks)?),
            None => None,
        };

        if let Err(err) = self.block_current(cpu) {
            if let Some(id) = wdog {
                let _ = self.watchdogs.cancel(id);
            }
            return Err(err);
        }
        if let Some(tcb) = self.tasks.get_mut(pid) {
            tcb.wait_wdog = wdog;
        }
        if let Some(sem) = self.semaphores.get_mut(id) {
            sem.waiters.insert_by_priority(&mut self.tasks, pid, ListTag::Semaphore(id));
        }
        log::debug!("{} blocked on {}", pid, id);

        self.reschedule(cpu);
        Ok(SemWait::Blocked)
    }

    /// Arm a watchdog that times out `pid`'s wait
    pub(crate) fn start_timeout(&mut self, pid: Pid, ticks: Ticks) -> Result<crate::watchdog::WdogId, KernelError> {
        match self.watchdogs.start(ticks, WdogAction::Timeout(pid), false) {
            Ok(id) => Ok(id),
            Err(_) => Err(self.heap.allocation_failed(core::mem::size_of::<WdogAction>())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::types::{Priority, TaskAttr, TaskState, WaitStatus};
    use super::*;
    use crate::config::SchedConfig;

    #[test]
    fn post_wakes_most_urgent_waiter() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let sem = sched.sem_init(0).unwrap();

        // Each task blocks as soon as it is dispatched
        let low = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();
        assert_eq!(sched.sem_wait(CpuId::BSP, sem, None), Ok(SemWait::Blocked));
        let high = sched.task_create(TaskAttr::new(Priority(50)), nop, 0).unwrap();
        assert_eq!(sched.sem_wait(CpuId::BSP, sem, None), Ok(SemWait::Blocked));
        let mid = sched.task_create(TaskAttr::new(Priority(30)), nop, 0).unwrap();
        assert_eq!(sched.sem_wait(CpuId::BSP, sem, None), Ok(SemWait::Blocked));

        assert_eq!(sched.sem_waiters(sem).unwrap(), [high, mid, low]);
        assert_eq!(sched.sem_destroy(sem), Err(KernelError::Busy));

        sched.sem_post(sem).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(high));
        assert_eq!(sched.wait_status(high), Some(WaitStatus::Signaled));
        assert_eq!(sched.sem_value(sem), Ok(0));
        assert_eq!(sched.check_list_invariants(), Ok(3));
    }

    #[test]
    fn trywait_never_blocks() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let sem = sched.sem_init(1).unwrap();
        assert_eq!(sched.sem_trywait(sem), Ok(()));
        assert_eq!(sched.sem_trywait(sem), Err(KernelError::TryAgain));
        sched.sem_post(sem).unwrap();
        assert_eq!(sched.sem_value(sem), Ok(1));
        sched.sem_destroy(sem).unwrap();
        assert_eq!(sched.sem_post(sem), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn timed_wait_expires() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let sem = sched.sem_init(0).unwrap();
        let task = sched.task_create(TaskAttr::new(Priority(20)), nop, 0).unwrap();
        assert_eq!(sched.sem_wait(CpuId::BSP, sem, Some(15)), Ok(SemWait::Blocked));

        sched.tick(14);
        assert_eq!(sched.task(task).unwrap().state(), TaskState::Blocked);
        sched.tick(1);
        assert_eq!(sched.current(CpuId::BSP), Some(task));
        assert_eq!(sched.wait_status(task), Some(WaitStatus::TimedOut));
        assert!(sched.sem_waiters(sem).unwrap().is_empty());

        // A late post must not wake it a second time
        sched.sem_post(sem).unwrap();
        assert_eq!(sched.sem_value(sem), Ok(1));
    }

    #[test]
    fn post_cancels_pending_timeout() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let sem = sched.sem_init(0).unwrap();
        let task = sched.task_create(TaskAttr::new(Priority(20)), nop, 0).unwrap();
        sched.sem_wait(CpuId::BSP, sem, Some(50)).unwrap();
        assert_eq!(sched.watchdogs.len(), 1);

        sched.sem_post(sem).unwrap();
        assert_eq!(sched.watchdogs.len(), 0);
        sched.tick(100);
        assert_eq!(sched.wait_status(task), Some(WaitStatus::Signaled));
    }

    #[test]
    fn idle_cannot_block() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let sem = sched.sem_init(0).unwrap();
        assert_eq!(sched.sem_wait(CpuId::BSP, sem, None), Err(KernelError::NotPermitted));
    }

    #[test]
    fn arena_exhaustion_reports_no_memory() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT.with_max_semaphores(1));
        sched.sem_init(0).unwrap();
        assert!(matches!(sched.sem_init(0), Err(KernelError::NoMemory(_))));
    }

    #[test]
    fn destroyed_handle_does_not_reach_a_reused_slot() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT.with_max_semaphores(1));
        let old = sched.sem_init(0).unwrap();
        sched.sem_destroy(old).unwrap();

        let new = sched.sem_init(3).unwrap();
        assert_eq!(new.slot(), old.slot());
        assert_ne!(new, old);
        assert_eq!(sched.sem_post(old), Err(KernelError::InvalidArgument));
        assert_eq!(sched.sem_trywait(old), Err(KernelError::InvalidArgument));
        assert_eq!(sched.sem_destroy(old), Err(KernelError::InvalidArgument));
        assert_eq!(sched.sem_value(new), Ok(3));

        // The packed form round-trips and stays a valid status
        assert_eq!(SemId::from_raw(new.to_raw()), new);
        assert!(new.to_raw() as i32 >= 0);
    }
}
