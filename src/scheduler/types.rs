/*
 * Scheduler Type Definitions
 *
 * This module defines the small, Copy-able identifier and descriptor types
 * shared by every part of the scheduler: task and CPU identifiers,
 * priorities, task states, scheduling policies and the attribute block a
 * task is created from.
 */

use core::fmt;

use bitflags::bitflags;

use crate::config::MAX_CPUS;

/// CPU identifier
///
/// Represents a logical CPU core. CPU 0 is the primary (boot) CPU; it is
/// always online and can never be a hotplug target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Bootstrap processor (CPU 0)
    pub const BSP: CpuId = CpuId(0);

    /// Get the CPU ID as a usize for indexing
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU{}", self.0)
    }
}

/// Task identifier
///
/// Pids are handed out monotonically and never exceed i32::MAX, so a pid is
/// always representable as a non-negative C status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

impl From<Pid> for i32 {
    fn from(pid: Pid) -> i32 {
        pid.0 as i32
    }
}

/// Task group identifier (the pid of the group's first task)
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gid(pub u32);

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group({})", self.0)
    }
}

/// Task priority
///
/// Higher values are more urgent. Priority 0 belongs to the idle tasks;
/// ordinary tasks use 1..=255.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Idle task priority
    pub const IDLE: Priority = Priority(0);

    /// Lowest priority an ordinary task may have
    pub const MIN: Priority = Priority(1);

    /// Default priority for tasks that do not ask for one
    pub const DEFAULT: Priority = Priority(100);

    /// Most urgent priority
    pub const MAX: Priority = Priority(255);

    /// Get the priority as a usize for indexing the ready queue
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

/// Task state
///
/// ```text
/// Initializing -> Ready -> Running -> Ready (preempted)
///                   ^         |  \--> Blocked (semaphore, sleep, join)
///                   |         |             |
///                   +---------+-------------+ (unblocked)
///                             \--> Terminating -> (TCB freed)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// TCB allocated, not yet visible to the dispatcher
    Initializing,

    /// On the ready queue
    Ready,

    /// Executing on a CPU
    Running,

    /// On a wait list (semaphore, sleep, join)
    Blocked,

    /// Being torn down
    Terminating,
}

/// Scheduling policy of a task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Runs until it blocks, yields or is preempted by a higher priority
    #[default]
    Fifo,

    /// Like Fifo, but rotated behind equal-priority peers every timeslice
    RoundRobin,
}

/// Why a blocked task was made ready again
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    /// The awaited event happened (semaphore posted, joined task exited)
    Signaled,

    /// The wait's watchdog expired first
    TimedOut,

    /// The wait was broken off explicitly
    Interrupted,
}

bitflags! {
    /// Set of CPUs a task may run on
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CpuSet: u32 {
        const CPU0 = 1 << 0;
        const CPU1 = 1 << 1;
        const CPU2 = 1 << 2;
        const CPU3 = 1 << 3;
        const CPU4 = 1 << 4;
        const CPU5 = 1 << 5;
        const CPU6 = 1 << 6;
        const CPU7 = 1 << 7;
    }
}

impl CpuSet {
    /// The set holding just `cpu`
    pub fn only(cpu: CpuId) -> CpuSet {
        CpuSet::from_bits_truncate(1u32.checked_shl(cpu.0).unwrap_or(0))
    }

    /// Whether `cpu` is a member
    pub fn has(&self, cpu: CpuId) -> bool {
        cpu.as_usize() < MAX_CPUS && self.intersects(CpuSet::only(cpu))
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        CpuSet::all()
    }
}

/// Parameters a task is created with
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskAttr<'a> {
    /// Task name (truncated to TASK_NAME_SIZE bytes)
    pub name: Option<&'a str>,

    pub priority: Priority,

    /// Stack size in bytes, None for the configured default
    pub stack_size: Option<usize>,

    pub policy: SchedPolicy,

    /// CPUs the task may run on
    pub affinity: CpuSet,
}

impl<'a> TaskAttr<'a> {
    pub const fn new(priority: Priority) -> Self {
        Self {
            name: None,
            priority,
            stack_size: None,
            policy: SchedPolicy::Fifo,
            affinity: CpuSet::all(),
        }
    }

    pub const fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    pub const fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub const fn policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn affinity(mut self, affinity: CpuSet) -> Self {
        self.affinity = affinity;
        self
    }
}

impl Default for TaskAttr<'_> {
    fn default() -> Self {
        TaskAttr::new(Priority::DEFAULT)
    }
}

/// Diagnostic snapshot of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: Pid,
    pub group: Gid,
    pub name: heapless::String<{ crate::config::TASK_NAME_SIZE }>,
    pub priority: Priority,
    pub state: TaskState,
    pub policy: SchedPolicy,

    /// CPU the task runs on, or last ran on
    pub cpu: Option<CpuId>,

    pub stack_size: usize,

    /// Deepest stack use seen so far (needs stack coloration)
    pub stack_high_water: Option<usize>,

    /// Number of times the task was dispatched
    pub dispatches: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_set_membership() {
        let set = CpuSet::only(CpuId(2)) | CpuSet::CPU0;
        assert!(set.has(CpuId::BSP));
        assert!(set.has(CpuId(2)));
        assert!(!set.has(CpuId(1)));
        assert!(!CpuSet::all().has(CpuId(40)));
    }

    #[test]
    fn pid_converts_to_status() {
        assert_eq!(i32::from(Pid(17)), 17);
    }

    #[test]
    fn priorities_order_by_urgency() {
        assert!(Priority::MAX > Priority::DEFAULT);
        assert!(Priority::MIN > Priority::IDLE);
    }
}
