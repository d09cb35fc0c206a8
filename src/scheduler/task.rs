/*
 * Task Lifecycle
 *
 * Creation, termination and the blocking calls that are not tied to a
 * semaphore (join) plus priority changes and explicit wake-ups.
 *
 * CREATION:
 * ========
 *
 * 1. Validate the attributes (priority 0 belongs to the idle tasks, the
 *    affinity must name at least one existing CPU)
 * 2. Reserve a pid slot in the task table
 * 3. Carve the stack out of the kernel heap and paint its guard
 * 4. Ask the Arch port for the initial context
 * 5. Initializing -> Ready, enqueue, reschedule
 *
 * A failure in steps 2-3 goes through the heap's allocation failure policy:
 * either NoMemory comes back, or the system halts.
 *
 * TERMINATION:
 * ===========
 *
 * A task may be terminated while Running, Ready or Blocked. The order is
 * fixed: leave every list first, then release what the task owns:
 * 1. Terminating, unlink from the owning list, cancel the wait watchdog
 * 2. Run the key destructors (bounded passes)
 * 3. Hand the exit status to joiners, or keep it until someone joins
 * 4. Leave the task group (the group dies with its last member)
 * 5. Free the stack and the pid slot, then reschedule
 */

use super::group::TaskGroup;
use super::tcb::{ListTag, Tcb};
use super::types::{CpuId, Gid, Pid, Priority, TaskAttr, TaskState, WaitStatus};
use super::Scheduler;
use crate::arch::TaskEntry;
use crate::config::MIN_STACK_SIZE;
use crate::error::KernelError;
use crate::memory::TaskStack;

/// Outcome of join()
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The target had already exited with this status
    Exited(i32),

    /// The caller was blocked; it reads join_result() once resumed
    Blocked,
}

/// Exit status reported for cancelled tasks
///
/// Kept out of the -4095..=-1 errno range so the C-shaped join() can tell a
/// cancelled target from a failed join.
pub const CANCELED_STATUS: i32 = i32::MIN;

impl Scheduler {
    // ========================================================================
    // CREATION
    // ========================================================================

    /// Create a task in a new task group
    pub fn task_create(&mut self, attr: TaskAttr<'_>, entry: TaskEntry, arg: usize) -> Result<Pid, KernelError> {
        self.spawn(attr, entry, arg, None)
    }

    /// Create a thread in `parent`'s task group
    ///
    /// The thread shares the group's keys; its own values start out null.
    pub fn thread_create(
        &mut self,
        parent: Pid,
        attr: TaskAttr<'_>,
        entry: TaskEntry,
        arg: usize,
    ) -> Result<Pid, KernelError> {
        let gid = self.tasks.get(parent).ok_or(KernelError::NoSuchTask)?.group;
        self.spawn(attr, entry, arg, Some(gid))
    }

    fn spawn(&mut self, attr: TaskAttr<'_>, entry: TaskEntry, arg: usize, group: Option<Gid>) -> Result<Pid, KernelError> {
        if attr.priority == Priority::IDLE {
            return Err(KernelError::InvalidArgument);
        }
        let online = (0..self.cpus.len()).any(|index| attr.affinity.has(CpuId(index as u32)));
        if !online {
            return Err(KernelError::InvalidArgument);
        }
        let stack_size = attr.stack_size.unwrap_or(self.config.default_stack_size);
        if stack_size < MIN_STACK_SIZE {
            return Err(KernelError::InvalidArgument);
        }

        let Some(pid) = self.alloc_task_pid(group.is_none()) else {
            return Err(self.heap.allocation_failed(core::mem::size_of::<Tcb>()));
        };
        let stack = TaskStack::allocate(&mut self.heap, stack_size, self.config.stack_coloration)?;
        let context = self.arch.init_context(entry, arg, stack.top());

        let gid = group.unwrap_or(Gid(pid.0));
        let mut tcb = Tcb::new(pid, gid, attr.name, attr.priority);
        tcb.policy = attr.policy;
        tcb.affinity = attr.affinity;
        tcb.stack = Some(stack);
        tcb.context = context;

        if let Err(tcb) = self.tasks.insert(tcb) {
            if let Some(stack) = tcb.stack {
                stack.release(&mut self.heap);
            }
            return Err(KernelError::InvalidArgument);
        }

        match self.groups.get_mut(&gid) {
            Some(group) => group.add_member(pid),
            None => {
                self.groups.insert(gid, TaskGroup::new(gid, pid));
            }
        }
        // A recycled pid must not inherit an unjoined status
        self.take_zombie(pid);

        if let Some(tcb) = self.tasks.get_mut(pid) {
            tcb.state = TaskState::Ready;
        }
        self.ready.enqueue(&mut self.tasks, pid);
        log::info!(
            "Created {} '{}' (priority {}, {} byte stack, group {})",
            pid,
            attr.name.unwrap_or(""),
            attr.priority.0,
            stack_size,
            gid.0
        );

        self.reschedule_all();
        Ok(pid)
    }

    /// Next free pid; a group founder's pid must not name a live group
    fn alloc_task_pid(&mut self, founds_group: bool) -> Option<Pid> {
        for _ in 0..self.tasks.capacity() {
            let pid = self.tasks.alloc_pid()?;
            if !founds_group || !self.groups.contains_key(&Gid(pid.0)) {
                return Some(pid);
            }
        }
        None
    }

    // ========================================================================
    // TERMINATION
    // ========================================================================

    /// Terminate `pid` with `status`
    pub fn task_exit(&mut self, pid: Pid, status: i32) -> Result<(), KernelError> {
        let tcb = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask)?;
        if tcb.is_idle {
            return Err(KernelError::NotPermitted);
        }
        tcb.state = TaskState::Terminating;
        let gid = tcb.group;
        let wdog = tcb.wait_wdog.take();

        // CRITICAL: off every list before anything is released
        self.unlink_from_owner(pid);
        if let Some(id) = wdog {
            let _ = self.watchdogs.cancel(id);
        }

        let destructors = self.destroy_thread_data(pid);
        let joiners = self.release_joiners(gid, pid, status);
        if joiners == 0 {
            if self.zombies.len() >= self.config.max_tasks {
                if let Some((evicted, _)) = self.zombies.pop_front() {
                    log::warn!("dropping unjoined exit status of {}", evicted);
                }
            }
            self.zombies.push_back((pid, status));
        }

        let last = self.groups.get_mut(&gid).is_some_and(|group| group.remove_member(pid));
        if last {
            self.groups.remove(&gid);
        }

        if let Some(tcb) = self.tasks.remove(pid) {
            if let Some(stack) = tcb.stack {
                stack.release(&mut self.heap);
            }
        }
        log::info!(
            "{} exited with status {} ({} destructor call(s), {} joiner(s))",
            pid,
            status,
            destructors,
            joiners
        );

        self.reschedule_all();
        Ok(())
    }

    /// Terminate `pid` on behalf of another task
    pub fn task_cancel(&mut self, pid: Pid) -> Result<(), KernelError> {
        self.task_exit(pid, CANCELED_STATUS)
    }

    /// Terminate whatever runs on `cpu`
    pub fn exit_current(&mut self, cpu: CpuId, status: i32) -> Result<(), KernelError> {
        self.valid_cpu(cpu)?;
        let pid = self.current(cpu).ok_or(KernelError::InvalidArgument)?;
        self.task_exit(pid, status)
    }

    /// Collect the kept exit status of `pid`
    fn take_zombie(&mut self, pid: Pid) -> Option<i32> {
        let index = self.zombies.iter().position(|(zombie, _)| *zombie == pid)?;
        self.zombies.remove(index).map(|(_, status)| status)
    }

    /// Wake every task joined on `pid`, handing them `status`
    fn release_joiners(&mut self, gid: Gid, pid: Pid, status: i32) -> usize {
        let Some(group) = self.groups.get(&gid) else {
            return 0;
        };
        let waiting: alloc::vec::Vec<Pid> = group
            .joiners
            .iter(&self.tasks)
            .filter(|joiner| self.tasks.link(*joiner).and_then(|link| link.owner) == Some(ListTag::Join(pid)))
            .collect();

        for joiner in waiting.iter() {
            if let Some(tcb) = self.tasks.get_mut(*joiner) {
                tcb.join_result = Some(status);
            }
            self.make_ready(*joiner, WaitStatus::Signaled);
        }
        waiting.len()
    }

    // ========================================================================
    // WAITING
    // ========================================================================

    /// Wait for `target` to exit on behalf of the task running on `cpu`
    pub fn join(&mut self, cpu: CpuId, target: Pid) -> Result<JoinOutcome, KernelError> {
        self.valid_cpu(cpu)?;
        let pid = self.current(cpu).ok_or(KernelError::InvalidArgument)?;
        if pid == target {
            return Err(KernelError::Deadlock);
        }
        if let Some(status) = self.take_zombie(target) {
            return Ok(JoinOutcome::Exited(status));
        }

        let target_tcb = self.tasks.get(target).ok_or(KernelError::NoSuchTask)?;
        if target_tcb.is_idle {
            return Err(KernelError::InvalidArgument);
        }
        let gid = target_tcb.group;

        self.block_current(cpu)?;
        if let Some(tcb) = self.tasks.get_mut(pid) {
            tcb.join_result = None;
        }
        if let Some(group) = self.groups.get_mut(&gid) {
            group.joiners.push_back(&mut self.tasks, pid, ListTag::Join(target));
        }
        log::debug!("{} joining {}", pid, target);

        self.reschedule(cpu);
        Ok(JoinOutcome::Blocked)
    }

    /// Force a blocked task out of its wait with WaitStatus::Interrupted
    pub fn interrupt_wait(&mut self, pid: Pid) -> Result<(), KernelError> {
        let tcb = self.tasks.get(pid).ok_or(KernelError::NoSuchTask)?;
        if tcb.state != TaskState::Blocked {
            return Err(KernelError::InvalidArgument);
        }
        self.wake(pid, WaitStatus::Interrupted);
        Ok(())
    }

    /// Why `pid` last left a wait
    pub fn wait_status(&self, pid: Pid) -> Option<WaitStatus> {
        self.tasks.get(pid).and_then(|tcb| tcb.wait_status)
    }

    /// Exit status delivered to `pid` by its last join
    pub fn join_result(&self, pid: Pid) -> Option<i32> {
        self.tasks.get(pid).and_then(|tcb| tcb.join_result)
    }

    // ========================================================================
    // PRIORITY
    // ========================================================================

    /// Change the priority of `pid`
    ///
    /// A ready task moves to the tail of its new level; a task waiting on a
    /// semaphore is re-sorted among the other waiters.
    pub fn set_priority(&mut self, pid: Pid, priority: Priority) -> Result<(), KernelError> {
        if priority == Priority::IDLE {
            return Err(KernelError::InvalidArgument);
        }
        let tcb = self.tasks.get(pid).ok_or(KernelError::NoSuchTask)?;
        if tcb.is_idle {
            return Err(KernelError::NotPermitted);
        }
        let old = tcb.priority;
        let owner = tcb.link.owner;

        match owner {
            Some(ListTag::Ready(_)) => {
                self.ready.remove(&mut self.tasks, pid);
                self.set_priority_field(pid, priority);
                self.ready.enqueue(&mut self.tasks, pid);
            }
            Some(ListTag::Semaphore(id)) => {
                self.set_priority_field(pid, priority);
                if let Some(sem) = self.semaphores.get_mut(id) {
                    sem.waiters.remove(&mut self.tasks, pid);
                    sem.waiters.insert_by_priority(&mut self.tasks, pid, ListTag::Semaphore(id));
                }
            }
            _ => self.set_priority_field(pid, priority),
        }
        log::debug!("{} priority {} -> {}", pid, old.0, priority.0);

        self.reschedule_all();
        Ok(())
    }

    fn set_priority_field(&mut self, pid: Pid, priority: Priority) {
        if let Some(tcb) = self.tasks.get_mut(pid) {
            tcb.priority = priority;
        }
    }
}
