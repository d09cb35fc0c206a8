/*
 * Task Control Block
 *
 * The TCB is the scheduler's per-task record: identity, priority, state,
 * stack, saved context, thread-specific data and the intrusive link that
 * puts it on exactly one scheduling list at a time.
 *
 * TCBs live in the TaskTable arena and are referred to by Pid everywhere
 * else. The link stores neighbouring pids instead of pointers, plus the
 * tag of the list that currently owns the TCB.
 *
 * Why this is important:
 * - A task is on at most one list (ready at priority P, blocked on X, or
 *   none while running); the owner tag makes that checkable
 * - Termination knows which list to unlink from without searching
 * - The group back-reference is an id, the group is owned elsewhere
 */

use heapless::String;

use super::semaphore::SemId;
use super::types::{CpuId, CpuSet, Gid, Pid, Priority, SchedPolicy, TaskInfo, TaskState, WaitStatus};
use crate::arch::TaskContext;
use crate::config::{KEYS_MAX, TASK_NAME_SIZE};
use crate::memory::TaskStack;
use crate::watchdog::WdogId;

/// The list a queued TCB currently belongs to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListTag {
    /// Ready queue at the given priority
    Ready(Priority),

    /// Wait list of a semaphore
    Semaphore(SemId),

    /// Sleeping tasks (woken by their watchdog)
    Sleeping,

    /// Join list of a group, waiting for the given task to exit
    Join(Pid),
}

/// Intrusive list linkage
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub(crate) prev: Option<Pid>,
    pub(crate) next: Option<Pid>,
    pub(crate) owner: Option<ListTag>,
}

impl Link {
    /// List currently holding the TCB, None while running or initializing
    pub fn owner(&self) -> Option<ListTag> {
        self.owner
    }
}

/// Task control block
pub struct Tcb {
    pub(crate) pid: Pid,
    pub(crate) name: String<TASK_NAME_SIZE>,
    pub(crate) group: Gid,
    pub(crate) priority: Priority,
    pub(crate) state: TaskState,
    pub(crate) policy: SchedPolicy,
    pub(crate) affinity: CpuSet,

    /// CPU running the task, or the one it last ran on
    pub(crate) cpu: Option<CpuId>,

    pub(crate) is_idle: bool,

    /// None only for TCBs built without a stack (unit tests)
    pub(crate) stack: Option<TaskStack>,
    pub(crate) context: TaskContext,
    pub(crate) link: Link,

    /// Remaining round-robin ticks
    pub(crate) timeslice: u32,

    /// sched_lock() nesting depth
    pub(crate) lock_count: u32,

    /// Watchdog bounding the current wait
    pub(crate) wait_wdog: Option<WdogId>,
    pub(crate) wait_status: Option<WaitStatus>,

    /// Exit status of the task this one joined
    pub(crate) join_result: Option<i32>,

    /// Thread-specific data, indexed by key
    pub(crate) tls: [usize; KEYS_MAX],

    pub(crate) dispatches: u64,
}

impl Tcb {
    pub fn new(pid: Pid, group: Gid, name: Option<&str>, priority: Priority) -> Self {
        Self {
            pid,
            name: truncated_name(name.unwrap_or("")),
            group,
            priority,
            state: TaskState::Initializing,
            policy: SchedPolicy::Fifo,
            affinity: CpuSet::all(),
            cpu: None,
            is_idle: false,
            stack: None,
            context: TaskContext::default(),
            link: Link::default(),
            timeslice: 0,
            lock_count: 0,
            wait_wdog: None,
            wait_status: None,
            join_result: None,
            tls: [0; KEYS_MAX],
            dispatches: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Gid {
        self.group
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    pub fn affinity(&self) -> CpuSet {
        self.affinity
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    /// Whether the stack guard word still holds the stack color
    pub fn stack_intact(&self) -> bool {
        self.stack.as_ref().is_none_or(|stack| stack.guard_intact())
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            pid: self.pid,
            group: self.group,
            name: self.name.clone(),
            priority: self.priority,
            state: self.state,
            policy: self.policy,
            cpu: self.cpu,
            stack_size: self.stack.as_ref().map_or(0, |stack| stack.size()),
            stack_high_water: self.stack.as_ref().and_then(|stack| stack.high_water_mark()),
            dispatches: self.dispatches,
        }
    }
}

/// Copy `name`, cutting it at a character boundary that fits
fn truncated_name(name: &str) -> String<TASK_NAME_SIZE> {
    let mut end = name.len().min(TASK_NAME_SIZE);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::new();
    // Cannot fail, end <= capacity
    let _ = out.push_str(&name[..end]);
    out
}

impl core::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tcb")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("owner", &self.link.owner)
            .finish()
    }
}
