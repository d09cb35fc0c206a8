/*
 * Dispatcher
 *
 * Decides which task each CPU runs and records the resulting context
 * switches. This is the mechanism every other part of the scheduler ends
 * in: creating, waking, blocking, exiting, re-prioritizing and ticking all
 * finish with a reschedule.
 *
 * DISPATCH ALGORITHM:
 * ==================
 *
 * For one CPU:
 * 1. Skip if the CPU is not Running (hotplug in progress or disabled)
 * 2. Find the most urgent ready task allowed on this CPU
 * 3. If the current task is still runnable, keep it unless the candidate
 *    is strictly more urgent (or equally urgent and a rotation was asked
 *    for by round-robin expiry or yield)
 * 4. If the current task holds the preemption lock and is still
 *    runnable, remember the request and stop
 * 5. Otherwise: current -> Ready (tail of its level), candidate -> Running,
 *    verify the candidate's stack guard, record the switch
 *
 * STACK GUARD:
 * ===========
 *
 * The guard word at the base of the incoming task's stack is checked right
 * after the task is selected. A mismatch means the stack has already
 * overflowed into whatever lies below it; there is no recovery, the
 * offender is logged and the system halts.
 */

use super::tcb::Tcb;
use super::types::{CpuId, Pid, SchedPolicy, TaskState, WaitStatus};
use super::{CpuState, Scheduler};
use crate::config::StackCheck;
use crate::error::KernelError;

/// A switch decided under the scheduler lock, performed after it is dropped
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ContextSwitch {
    pub cpu: CpuId,

    /// Outgoing task, None if it no longer exists (exited)
    pub from: Option<Pid>,

    pub to: Pid,
}

/// Per-CPU counters
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CpuStats {
    /// Number of context switches performed
    pub context_switches: u64,

    /// Total ticks this CPU has been online
    pub ticks: u64,

    /// Times the idle loop parked the CPU
    pub idle_entries: u64,
}

/// Per-CPU dispatch state
#[derive(Debug)]
pub struct PerCpu {
    pub(crate) cpu: CpuId,

    /// Task executing on this CPU (the idle task when nothing else is)
    pub(crate) current: Pid,

    pub(crate) idle: Pid,

    /// A reschedule was deferred by the preemption lock
    pub(crate) need_resched: bool,

    /// Rotate the current task behind its equal-priority peers
    pub(crate) rotate: bool,

    pub(crate) stats: CpuStats,
}

impl PerCpu {
    pub(crate) fn new(cpu: CpuId, idle: Pid) -> Self {
        Self {
            cpu,
            current: idle,
            idle,
            need_resched: false,
            rotate: false,
            stats: CpuStats::default(),
        }
    }
}

impl Scheduler {
    /// Whether `tcb` may be handed to `cpu` right now
    pub(crate) fn eligible(&self, tcb: &Tcb, cpu: CpuId) -> bool {
        tcb.affinity.has(cpu) && self.cpu_states.is_running(cpu)
    }

    /// Reconsider what `cpu` should run
    pub(crate) fn reschedule(&mut self, cpu: CpuId) {
        let index = cpu.as_usize();
        if index >= self.cpus.len() || self.cpu_states.get(cpu) != Some(CpuState::Running) {
            return;
        }

        let current = self.cpus[index].current;
        let (current_runnable, current_priority, locked) = match self.tasks.get(current) {
            Some(tcb) if tcb.state == TaskState::Running => (true, Some(tcb.priority), tcb.lock_count > 0),
            _ => (false, None, false),
        };

        let rotate = self.cpus[index].rotate;
        let candidate = self.ready.find_highest(&self.tasks, |tcb| self.eligible(tcb, cpu));

        let Some(candidate) = candidate else {
            if current_runnable {
                self.cpus[index].rotate = false;
                return;
            }
            // The idle task is always ready when it is not running
            log::error!("{}: nothing to run after {} stopped", cpu, current);
            panic!("ready queue empty on {}", cpu);
        };
        let candidate_priority = self.tasks.get(candidate).map(|tcb| tcb.priority);

        if current_runnable {
            let preempt = match (candidate_priority, current_priority) {
                (Some(next), Some(now)) => next > now || (rotate && next == now),
                _ => false,
            };
            if !preempt {
                self.cpus[index].rotate = false;
                return;
            }
            if locked {
                log::debug!("{}: preemption of {} deferred by sched_lock", cpu, current);
                self.cpus[index].need_resched = true;
                return;
            }
        }

        self.cpus[index].rotate = false;
        self.ready.remove(&mut self.tasks, candidate);

        // Outgoing task goes behind its equal-priority peers
        let from = if current_runnable {
            if let Some(tcb) = self.tasks.get_mut(current) {
                tcb.state = TaskState::Ready;
            }
            self.ready.enqueue(&mut self.tasks, current);
            Some(current)
        } else if self.tasks.contains(current) {
            Some(current)
        } else {
            None
        };

        self.dispatch(cpu, candidate);
        self.record_switch(ContextSwitch {
            cpu,
            from,
            to: candidate,
        });
    }

    /// Make `pid` the running task of `cpu`
    fn dispatch(&mut self, cpu: CpuId, pid: Pid) {
        let rr_interval = self.config.rr_interval;
        let check = self.config.stack_check == StackCheck::OnDispatch;

        let Some(tcb) = self.tasks.get_mut(pid) else {
            return;
        };
        tcb.state = TaskState::Running;
        tcb.cpu = Some(cpu);
        tcb.dispatches += 1;
        if tcb.policy == SchedPolicy::RoundRobin && tcb.timeslice == 0 {
            tcb.timeslice = rr_interval;
        }
        let percpu = &mut self.cpus[cpu.as_usize()];
        percpu.current = pid;
        percpu.need_resched = false;
        percpu.stats.context_switches += 1;

        log::debug!("{}: dispatch {}", cpu, pid);
        if check {
            self.check_stack(pid);
        }
    }

    /// Halt if the guard word of `pid`'s stack was overwritten
    pub(crate) fn check_stack(&self, pid: Pid) {
        let Some(tcb) = self.tasks.get(pid) else {
            return;
        };
        let Some(stack) = tcb.stack.as_ref() else {
            return;
        };
        if !stack.guard_intact() {
            log::error!(
                "stack overflow detected: {} '{}' (guard {:#010x}, stack {:#x}..{:#x})",
                pid,
                tcb.name(),
                stack.guard_value(),
                stack.base(),
                stack.top()
            );
            panic!("stack overflow in {} '{}'", pid, tcb.name());
        }
    }

    /// Check every live task's guard word
    pub(crate) fn check_all_stacks(&self) {
        for tcb in self.tasks.iter() {
            self.check_stack(tcb.pid);
        }
    }

    pub(crate) fn record_switch(&mut self, switch: ContextSwitch) {
        if let Some(position) = self.pending.iter().position(|pending| pending.cpu == switch.cpu) {
            // Keep the original outgoing task, only the destination changes
            let from = self.pending[position].from;
            if from == Some(switch.to) {
                self.pending.swap_remove(position);
            } else {
                self.pending[position].to = switch.to;
            }
            return;
        }
        // At most one entry per CPU and at most MAX_CPUS CPUs
        let _ = self.pending.push(switch);
    }

    /// Reconsider every online CPU
    pub(crate) fn reschedule_all(&mut self) {
        for index in 0..self.cpus.len() {
            self.reschedule(CpuId(index as u32));
        }
    }

    /// Switches decided since the last call, at most one per CPU
    pub fn take_pending_switches(&mut self) -> heapless::Vec<ContextSwitch, { crate::config::MAX_CPUS }> {
        core::mem::take(&mut self.pending)
    }

    /// Saved context of a live task
    ///
    /// The pointer stays valid until the task is removed from the table.
    pub fn context_ptr(&mut self, pid: Pid) -> Option<*mut crate::arch::TaskContext> {
        self.tasks.get_mut(pid).map(|tcb| &mut tcb.context as *mut _)
    }

    // ========================================================================
    // RUNNING-TASK TRANSITIONS
    // ========================================================================

    /// Take the task running on `cpu` off the CPU and mark it Blocked
    ///
    /// The caller queues it on a wait list afterwards and then calls
    /// reschedule(). Idle tasks never block.
    pub(crate) fn block_current(&mut self, cpu: CpuId) -> Result<Pid, KernelError> {
        let pid = self.current(cpu).ok_or(KernelError::InvalidArgument)?;
        let tcb = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask)?;
        if tcb.is_idle {
            return Err(KernelError::NotPermitted);
        }
        tcb.state = TaskState::Blocked;
        tcb.wait_status = None;
        Ok(pid)
    }

    /// Move a blocked task back to the ready queue
    ///
    /// Removes it from its wait list, cancels its timeout watchdog (unless
    /// that watchdog is what fired) and records why it woke. Does not
    /// reschedule.
    pub(crate) fn make_ready(&mut self, pid: Pid, status: WaitStatus) -> bool {
        match self.tasks.get(pid) {
            Some(tcb) if tcb.state == TaskState::Blocked => {}
            _ => return false,
        }

        self.unlink_from_owner(pid);
        if let Some(id) = self.tasks.get_mut(pid).and_then(|tcb| tcb.wait_wdog.take()) {
            let _ = self.watchdogs.cancel(id);
        }
        if let Some(tcb) = self.tasks.get_mut(pid) {
            tcb.state = TaskState::Ready;
            tcb.wait_status = Some(status);
        }
        self.ready.enqueue(&mut self.tasks, pid);
        log::debug!("{} woken ({:?})", pid, status);
        true
    }

    /// Wake a blocked task and let it preempt whoever it outranks
    pub(crate) fn wake(&mut self, pid: Pid, status: WaitStatus) -> bool {
        let woke = self.make_ready(pid, status);
        if woke {
            self.reschedule_all();
        }
        woke
    }

    /// Remove `pid` from whatever list its owner tag names
    pub(crate) fn unlink_from_owner(&mut self, pid: Pid) {
        use super::tcb::ListTag;

        let Some(owner) = self.tasks.link(pid).and_then(|link| link.owner) else {
            return;
        };
        match owner {
            ListTag::Ready(_) => {
                self.ready.remove(&mut self.tasks, pid);
            }
            ListTag::Sleeping => {
                self.sleeping.remove(&mut self.tasks, pid);
            }
            ListTag::Semaphore(id) => {
                if let Some(sem) = self.semaphores.get_mut(id) {
                    sem.waiters.remove(&mut self.tasks, pid);
                }
            }
            ListTag::Join(target) => {
                let gid = self.tasks.get(target).map(|tcb| tcb.group);
                let joiners = gid.and_then(|gid| self.groups.get_mut(&gid)).map(|group| &mut group.joiners);
                match joiners {
                    Some(list) => {
                        list.remove(&mut self.tasks, pid);
                    }
                    None => {
                        // Target vanished without waking its joiners
                        log::warn!("{} waited on missing {}", pid, target);
                        if let Some(link) = self.tasks.link_mut(pid) {
                            *link = Default::default();
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // PREEMPTION CONTROL
    // ========================================================================

    /// Disable preemption of the task running on `cpu` (nestable)
    ///
    /// The lock belongs to the task: it may still block voluntarily, and the
    /// lock is in force again when it resumes.
    pub fn sched_lock(&mut self, cpu: CpuId) -> Result<(), KernelError> {
        let pid = self.current(cpu).ok_or(KernelError::InvalidArgument)?;
        let tcb = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask)?;
        tcb.lock_count = tcb.lock_count.checked_add(1).ok_or(KernelError::InvalidArgument)?;
        Ok(())
    }

    /// Undo one sched_lock(); the outermost unlock honours deferred preemption
    pub fn sched_unlock(&mut self, cpu: CpuId) -> Result<(), KernelError> {
        let pid = self.current(cpu).ok_or(KernelError::InvalidArgument)?;
        let tcb = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask)?;
        if tcb.lock_count == 0 {
            return Err(KernelError::InvalidArgument);
        }
        tcb.lock_count -= 1;

        let percpu = &mut self.cpus[cpu.as_usize()];
        if tcb.lock_count == 0 && percpu.need_resched {
            percpu.need_resched = false;
            self.reschedule(cpu);
        }
        Ok(())
    }

    /// sched_lock() depth of the task running on `cpu`
    pub fn sched_lock_count(&self, cpu: CpuId) -> u32 {
        self.current(cpu)
            .and_then(|pid| self.tasks.get(pid))
            .map_or(0, |tcb| tcb.lock_count)
    }

    /// Let equal-priority ready tasks run before the current one
    pub fn yield_now(&mut self, cpu: CpuId) -> Result<(), KernelError> {
        self.valid_cpu(cpu)?;
        self.cpus[cpu.as_usize()].rotate = true;
        self.reschedule(cpu);
        Ok(())
    }

    pub fn cpu_stats(&self, cpu: CpuId) -> Option<CpuStats> {
        self.cpus.get(cpu.as_usize()).map(|percpu| percpu.stats)
    }

    /// Count one pass of the idle loop on `cpu`
    pub fn note_idle(&mut self, cpu: CpuId) {
        if let Some(percpu) = self.cpus.get_mut(cpu.as_usize()) {
            percpu.stats.idle_entries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::types::{Priority, TaskAttr};
    use super::*;
    use crate::config::SchedConfig;

    #[test]
    fn higher_priority_task_preempts_on_creation() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let low = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(low));

        let high = sched.task_create(TaskAttr::new(Priority(20)), nop, 0).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(high));
        assert_eq!(sched.task(low).unwrap().state(), TaskState::Ready);

        let switches = sched.take_pending_switches();
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].from, Some(Pid(0)));
        assert_eq!(switches[0].to, high);
    }

    #[test]
    fn coalesced_switch_back_to_origin_disappears() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let task = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();
        sched.take_pending_switches();

        sched.sleep(CpuId::BSP, 5).unwrap();
        sched.interrupt_wait(task).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(task));
        assert!(sched.take_pending_switches().is_empty());
    }

    #[test]
    fn sched_lock_defers_preemption() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let low = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();
        sched.sched_lock(CpuId::BSP).unwrap();
        sched.sched_lock(CpuId::BSP).unwrap();

        let high = sched.task_create(TaskAttr::new(Priority(90)), nop, 0).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(low));

        sched.sched_unlock(CpuId::BSP).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(low));
        sched.sched_unlock(CpuId::BSP).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(high));
        assert_eq!(sched.sched_unlock(CpuId::BSP), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn yield_rotates_equal_priority_only() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let a = sched.task_create(TaskAttr::new(Priority(30)), nop, 0).unwrap();
        let b = sched.task_create(TaskAttr::new(Priority(30)), nop, 0).unwrap();
        let _low = sched.task_create(TaskAttr::new(Priority(5)), nop, 0).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(a));

        sched.yield_now(CpuId::BSP).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(b));
        sched.yield_now(CpuId::BSP).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(a));

        sched.task_exit(b, 0).unwrap();
        sched.yield_now(CpuId::BSP).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(a));
    }

    #[test]
    fn blocking_while_locked_still_switches() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let a = sched.task_create(TaskAttr::new(Priority(30)), nop, 0).unwrap();
        sched.sched_lock(CpuId::BSP).unwrap();
        sched.sleep(CpuId::BSP, 10).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(Pid(0)));
        assert_eq!(sched.task(a).unwrap().state(), TaskState::Blocked);
        assert_eq!(sched.sched_lock_count(CpuId::BSP), 0);

        // The lock comes back with the task
        sched.tick(10);
        assert_eq!(sched.current(CpuId::BSP), Some(a));
        assert_eq!(sched.sched_lock_count(CpuId::BSP), 1);
    }

    #[test]
    fn dispatch_counts_switches() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        sched.task_create(TaskAttr::new(Priority(30)), nop, 0).unwrap();
        assert_eq!(sched.cpu_stats(CpuId::BSP).unwrap().context_switches, 1);
        sched.note_idle(CpuId::BSP);
        assert_eq!(sched.cpu_stats(CpuId::BSP).unwrap().idle_entries, 1);
    }
}
