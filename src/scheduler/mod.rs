/*
 * Real-Time Preemptive Scheduler
 *
 * This module holds the Scheduler: one explicit context object that owns
 * every structure the dispatcher works on. It is constructed once at boot
 * and reached through kernel::with_kernel() (or owned directly by tests).
 *
 * PRIORITY SCHEDULING EXPLAINED:
 * ==============================
 *
 * Every task has a priority 1..=255 (0 is reserved for the per-CPU idle
 * tasks). The highest priority READY task always runs; a task only gives up
 * its CPU when it blocks, yields, exits, or a more urgent task becomes ready.
 * Tasks of equal priority run in FIFO order. Round-robin tasks are
 * additionally rotated behind their equal-priority peers every rr_interval
 * ticks.
 *
 * TASK LIFECYCLE:
 * ==============
 *
 * Initializing -> Ready -> Running -> Ready (preempted, tail of its level)
 *                   ^         |
 *                   |         +----> Blocked (semaphore, sleep, join)
 *                   |         |         |
 *                   +---------+---------+  (signal, timeout, interrupt)
 *                             |
 *                             +----> Terminating -> TCB freed
 *
 * OWNED STRUCTURES:
 * ================
 *
 * - TaskTable: pid-hashed TCB arena (tcb.rs, table.rs)
 * - ReadyQueue: 256 FIFO levels plus a bitmap (ready_queue.rs)
 * - WatchdogList: delta-encoded timers for timeouts and user timers (timer.rs)
 * - Semaphores: counting semaphores with priority-ordered waiters (semaphore.rs)
 * - Task groups: shared thread-specific-data keys and join lists (group.rs, tls.rs)
 * - Per-CPU dispatch state and hotplug state flags (dispatch.rs, hotplug.rs)
 * - KernelHeap: stacks come from here; exhaustion follows the configured policy
 *
 * CONTEXT SWITCHING:
 * =================
 *
 * The scheduler never switches stacks while its own lock is held. Each
 * dispatch decision is recorded as a pending ContextSwitch (at most one per
 * CPU, later decisions overwrite earlier ones). The kernel layer drains them
 * after releasing the lock and asks the Arch port to perform them.
 */

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

pub mod dispatch;
pub mod group;
#[cfg(feature = "smp")]
pub mod hotplug;
pub mod list;
pub mod ready_queue;
pub mod semaphore;
pub mod table;
pub mod task;
pub mod tcb;
pub mod timer;
pub mod tls;
pub mod types;

pub use dispatch::{ContextSwitch, CpuStats};
pub use group::TaskGroup;
pub use semaphore::{SemId, SemWait};
pub use tcb::{ListTag, Tcb};
pub use timer::{TimerCallback, TimerFlags};
pub use tls::{KeyDestructor, PthreadKey, ThreadData};
pub use types::{CpuId, CpuSet, Gid, Pid, Priority, SchedPolicy, TaskAttr, TaskInfo, TaskState, WaitStatus};

use crate::arch::{Arch, CpuHotplugOps};
use crate::config::{MAX_CPUS, SchedConfig};
use crate::error::KernelError;
use crate::memory::{KernelHeap, TaskStack};
use crate::watchdog::WatchdogList;
use dispatch::PerCpu;
use list::TaskList;
use ready_queue::ReadyQueue;
use semaphore::SemaphoreTable;
use table::TaskTable;
use timer::WdogAction;

/// Per-CPU power/hotplug state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    /// Online, receives work
    Running = 0,

    /// Transition in progress, no new work is assigned
    HotplugRequested = 1,

    /// Stopped, excluded from scheduling
    Disabled = 2,
}

impl CpuState {
    fn from_u8(value: u8) -> CpuState {
        match value {
            0 => CpuState::Running,
            1 => CpuState::HotplugRequested,
            _ => CpuState::Disabled,
        }
    }
}

/// State flag of every CPU
///
/// Readable without the scheduler lock (other CPUs poll it); written only
/// by the hotplug coordinator with the lock held.
pub struct CpuStates {
    states: [core::sync::atomic::AtomicU8; MAX_CPUS],
    count: usize,
}

impl CpuStates {
    /// All `count` CPUs start Running
    pub fn new(count: usize) -> Self {
        use core::sync::atomic::AtomicU8;
        Self {
            states: core::array::from_fn(|_| AtomicU8::new(CpuState::Running as u8)),
            count: count.min(MAX_CPUS),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn get(&self, cpu: CpuId) -> Option<CpuState> {
        if cpu.as_usize() >= self.count {
            return None;
        }
        let raw = self.states[cpu.as_usize()].load(core::sync::atomic::Ordering::Acquire);
        Some(CpuState::from_u8(raw))
    }

    pub(crate) fn set(&self, cpu: CpuId, state: CpuState) {
        if cpu.as_usize() < self.count {
            self.states[cpu.as_usize()].store(state as u8, core::sync::atomic::Ordering::Release);
        }
    }

    /// Whether `cpu` may be handed work
    pub fn is_running(&self, cpu: CpuId) -> bool {
        self.get(cpu) == Some(CpuState::Running)
    }
}

/// Main scheduler structure
///
/// Owns every task, list, timer and semaphore of the system. All mutation
/// happens through &mut self, so whoever holds the Scheduler holds the
/// critical section: kernel.rs keeps it inside an IrqSpinLock.
pub struct Scheduler {
    pub(crate) config: SchedConfig,
    pub(crate) arch: Arc<dyn Arch>,
    pub(crate) hotplug_ops: Option<Arc<dyn CpuHotplugOps>>,
    pub(crate) heap: KernelHeap,

    pub(crate) tasks: TaskTable,
    pub(crate) ready: ReadyQueue,
    pub(crate) sleeping: TaskList,
    pub(crate) watchdogs: WatchdogList<WdogAction>,
    pub(crate) semaphores: SemaphoreTable,
    pub(crate) groups: BTreeMap<Gid, TaskGroup>,

    pub(crate) cpus: Vec<PerCpu>,
    pub(crate) cpu_states: CpuStates,
    pub(crate) pending: heapless::Vec<ContextSwitch, MAX_CPUS>,

    /// Exit statuses of tasks nobody joined yet, oldest exit first
    pub(crate) zombies: VecDeque<(Pid, i32)>,

    /// Ticks since boot
    pub(crate) clock: u64,
}

impl Scheduler {
    /// Build the scheduler and one idle task per CPU
    ///
    /// Each CPU starts out running its idle task (pid == cpu index), which is
    /// the context that called into the kernel at boot.
    pub fn new(config: SchedConfig, mut heap: KernelHeap, arch: Arc<dyn Arch>) -> Result<Self, KernelError> {
        config.validate()?;
        heap.set_policy(config.alloc_failure);

        let mut scheduler = Self {
            config,
            arch,
            hotplug_ops: None,
            heap,
            tasks: TaskTable::new(config.max_tasks, config.cpu_count as u32),
            ready: ReadyQueue::new(),
            sleeping: TaskList::new(),
            watchdogs: WatchdogList::new(config.max_watchdogs),
            semaphores: SemaphoreTable::new(config.max_semaphores),
            groups: BTreeMap::new(),
            cpus: Vec::with_capacity(config.cpu_count),
            cpu_states: CpuStates::new(config.cpu_count),
            pending: heapless::Vec::new(),
            zombies: VecDeque::new(),
            clock: 0,
        };

        for index in 0..config.cpu_count {
            let cpu = CpuId(index as u32);
            let idle = scheduler.create_idle(cpu)?;
            scheduler.cpus.push(PerCpu::new(cpu, idle));
        }

        log::info!(
            "Scheduler initialized: {} CPU(s), {} task slots, arch {}",
            config.cpu_count,
            config.max_tasks,
            scheduler.arch.name()
        );
        Ok(scheduler)
    }

    /// Attach the architecture callbacks used by CPU hotplug
    pub fn with_hotplug_ops(mut self, ops: Arc<dyn CpuHotplugOps>) -> Self {
        self.hotplug_ops = Some(ops);
        self
    }

    fn create_idle(&mut self, cpu: CpuId) -> Result<Pid, KernelError> {
        let pid = Pid(cpu.0);
        let stack = TaskStack::allocate(&mut self.heap, self.config.idle_stack_size, self.config.stack_coloration)?;
        let context = self.arch.init_context(crate::kernel::idle_main, cpu.as_usize(), stack.top());

        let mut name: heapless::String<16> = heapless::String::new();
        let _ = core::fmt::write(&mut name, format_args!("idle{}", cpu.0));

        let mut tcb = Tcb::new(pid, Gid(pid.0), Some(name.as_str()), Priority::IDLE);
        tcb.is_idle = true;
        tcb.state = TaskState::Running;
        tcb.affinity = CpuSet::only(cpu);
        tcb.cpu = Some(cpu);
        tcb.stack = Some(stack);
        tcb.context = context;
        tcb.dispatches = 1;

        if let Err(tcb) = self.tasks.insert(tcb) {
            if let Some(stack) = tcb.stack {
                stack.release(&mut self.heap);
            }
            return Err(KernelError::InvalidArgument);
        }
        self.groups.insert(Gid(pid.0), TaskGroup::new(Gid(pid.0), pid));
        Ok(pid)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn arch(&self) -> &Arc<dyn Arch> {
        &self.arch
    }

    pub fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut KernelHeap {
        &mut self.heap
    }

    /// Ticks since boot
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu_state(&self, cpu: CpuId) -> Option<CpuState> {
        self.cpu_states.get(cpu)
    }

    pub fn cpu_states(&self) -> &CpuStates {
        &self.cpu_states
    }

    /// Task running on `cpu`
    pub fn current(&self, cpu: CpuId) -> Option<Pid> {
        self.cpus.get(cpu.as_usize()).map(|percpu| percpu.current)
    }

    /// Idle task of `cpu`
    pub fn idle_task(&self, cpu: CpuId) -> Option<Pid> {
        self.cpus.get(cpu.as_usize()).map(|percpu| percpu.idle)
    }

    pub fn task(&self, pid: Pid) -> Option<&Tcb> {
        self.tasks.get(pid)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_info(&self, pid: Pid) -> Result<TaskInfo, KernelError> {
        self.tasks.get(pid).map(Tcb::info).ok_or(KernelError::NoSuchTask)
    }

    /// Snapshot of every live task, in pid-slot order
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.tasks.iter().map(Tcb::info).collect()
    }

    pub fn group(&self, gid: Gid) -> Option<&TaskGroup> {
        self.groups.get(&gid)
    }

    /// Ready tasks, most urgent first
    pub fn ready_tasks(&self) -> Vec<Pid> {
        self.ready.iter(&self.tasks).collect()
    }

    /// Priority of the most urgent ready task
    pub fn highest_ready_priority(&self) -> Option<Priority> {
        self.ready.highest_priority()
    }

    /// Stack of a task, for diagnostics and fault injection
    pub fn task_stack_mut(&mut self, pid: Pid) -> Option<&mut TaskStack> {
        self.tasks.get_mut(pid).and_then(|tcb| tcb.stack.as_mut())
    }

    fn valid_cpu(&self, cpu: CpuId) -> Result<(), KernelError> {
        if cpu.as_usize() < self.cpus.len() {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    /// Verify that every TCB sits on at most one list and that each list's
    /// members carry its tag
    ///
    /// Returns the number of queued TCBs, or the first pid found in an
    /// inconsistent position.
    pub fn check_list_invariants(&self) -> Result<usize, Pid> {
        let mut seen: BTreeMap<Pid, ListTag> = BTreeMap::new();
        let mut visit = |pid: Pid, tag: ListTag| -> Result<(), Pid> {
            let owner = self.tasks.link(pid).and_then(|link| link.owner);
            if owner != Some(tag) || seen.insert(pid, tag).is_some() {
                return Err(pid);
            }
            Ok(())
        };

        for pid in self.ready.iter(&self.tasks) {
            let priority = self.tasks.get(pid).map(|tcb| tcb.priority).ok_or(pid)?;
            visit(pid, ListTag::Ready(priority))?;
        }
        for pid in self.sleeping.iter(&self.tasks) {
            visit(pid, ListTag::Sleeping)?;
        }
        for (id, sem) in self.semaphores.iter() {
            for pid in sem.waiters.iter(&self.tasks) {
                visit(pid, ListTag::Semaphore(id))?;
            }
        }
        for group in self.groups.values() {
            for pid in group.joiners.iter(&self.tasks) {
                let tag = self.tasks.link(pid).and_then(|link| link.owner).ok_or(pid)?;
                if !matches!(tag, ListTag::Join(_)) {
                    return Err(pid);
                }
                visit(pid, tag)?;
            }
        }

        // Queued exactly when the state says so
        for tcb in self.tasks.iter() {
            let queued = seen.contains_key(&tcb.pid);
            let expected = matches!(tcb.state, TaskState::Ready | TaskState::Blocked);
            if queued != expected {
                return Err(tcb.pid);
            }
        }
        Ok(seen.len())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use alloc::sync::Arc;

    use super::*;
    use crate::arch::sim::SimArch;
    use crate::memory::AllocFailurePolicy;
    use crate::memory::heap::test_heap;

    /// Scheduler over a fresh simulated machine
    pub fn scheduler(config: SchedConfig) -> (Scheduler, SimArch) {
        let arch = SimArch::new();
        let heap = test_heap(256 * 1024, AllocFailurePolicy::ReturnError);
        let scheduler = Scheduler::new(config, heap, Arc::new(arch.clone())).unwrap();
        (scheduler, arch)
    }

    pub fn nop(_: usize) {}
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn boot_creates_one_idle_task_per_cpu() {
        let (sched, _) = scheduler(SchedConfig::DEFAULT.with_cpu_count(2));
        assert_eq!(sched.task_count(), 2);
        for index in 0..2 {
            let cpu = CpuId(index);
            let idle = sched.idle_task(cpu).unwrap();
            assert_eq!(idle, Pid(index));
            assert_eq!(sched.current(cpu), Some(idle));
            let info = sched.task_info(idle).unwrap();
            assert_eq!(info.state, TaskState::Running);
            assert_eq!(info.priority, Priority::IDLE);
            assert_eq!(info.cpu, Some(cpu));
        }
        assert_eq!(sched.cpu_state(CpuId(1)), Some(CpuState::Running));
        assert_eq!(sched.cpu_state(CpuId(2)), None);
        assert_eq!(sched.check_list_invariants(), Ok(0));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let arch = crate::arch::sim::SimArch::new();
        let heap = crate::memory::heap::test_heap(64 * 1024, crate::memory::AllocFailurePolicy::ReturnError);
        let result = Scheduler::new(SchedConfig::DEFAULT.with_max_tasks(6), heap, Arc::new(arch));
        assert!(matches!(result, Err(KernelError::InvalidArgument)));
    }
}
