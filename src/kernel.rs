/*
 * Kernel Instance and External Entry Points
 *
 * The Scheduler is an ordinary value; this module holds the one instance a
 * booted system uses, inside an IrqSpinLock, and exposes the entry points
 * drivers and applications call.
 *
 * LOCKING AND SWITCHING:
 * =====================
 *
 * with_kernel() is the only way in:
 * 1. Mask interrupts and take the spinlock
 * 2. Run the operation against the Scheduler
 * 3. Collect the context switches it decided, resolve them to context
 *    pointers, release the lock
 * 4. Perform the switches through the Arch port
 *
 * Step 4 happens without the lock because the resumed task will typically
 * call back into the kernel. The context pointers stay valid: TCBs live in
 * the fixed task table and only move out of it when the task is freed,
 * which cannot happen to a task that is being switched to.
 *
 * STATUS CONVENTION:
 * =================
 *
 * The entry points return C-shaped statuses: a non-negative value (0, a
 * pid, a key) on success, a negative errno otherwise. Waits that end by
 * timeout or interruption report -ETIMEDOUT / -EINTR, which are wake
 * reasons rather than KernelErrors.
 */

use alloc::sync::Arc;

use crate::arch::{Arch, CpuHotplugOps, TaskContext, TaskEntry};
use crate::config::{MAX_CPUS, SchedConfig};
use crate::error::{KernelError, to_status, unit_status};
use crate::memory::KernelHeap;
use crate::scheduler::task::JoinOutcome;
use crate::scheduler::{
    CpuId, KeyDestructor, Pid, Priority, PthreadKey, Scheduler, SemId, SemWait, TaskAttr, TimerCallback, TimerFlags,
    WaitStatus,
};
use crate::sync::IrqSpinLock;
use crate::watchdog::{Ticks, WakeupDelay, WdogId};

/// Status of a wait that ended by timeout
pub const ETIMEDOUT: i32 = 110;

/// Status of a wait that was interrupted
pub const EINTR: i32 = 4;

static KERNEL: IrqSpinLock<Option<Scheduler>> = IrqSpinLock::new(None);

/// Build the scheduler and install it as the system's instance
pub fn init(
    config: SchedConfig,
    heap: KernelHeap,
    arch: Arc<dyn Arch>,
    hotplug: Option<Arc<dyn CpuHotplugOps>>,
) -> Result<(), KernelError> {
    let mut kernel = KERNEL.lock();
    if kernel.is_some() {
        return Err(KernelError::AlreadyInitialized);
    }

    let mut scheduler = Scheduler::new(config, heap, arch)?;
    if let Some(ops) = hotplug {
        scheduler = scheduler.with_hotplug_ops(ops);
    }
    *kernel = Some(scheduler);
    Ok(())
}

pub fn is_initialized() -> bool {
    KERNEL.lock().is_some()
}

/// Remove the installed instance (hosted runs start over with a fresh one)
pub fn teardown() -> Option<Scheduler> {
    KERNEL.lock().take()
}

/// Run `f` against the kernel, then perform the context switches it caused
pub fn with_kernel<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Result<R, KernelError> {
    let mut switches: heapless::Vec<(CpuId, Option<*mut TaskContext>, *const TaskContext), MAX_CPUS> =
        heapless::Vec::new();

    let (result, arch) = {
        let mut kernel = KERNEL.lock();
        let scheduler = kernel.as_mut().ok_or(KernelError::NotInitialized)?;
        let result = f(scheduler);

        for switch in scheduler.take_pending_switches() {
            let from = switch.from.and_then(|pid| scheduler.context_ptr(pid));
            if let Some(to) = scheduler.context_ptr(switch.to) {
                // One entry per CPU at most
                let _ = switches.push((switch.cpu, from, to as *const TaskContext));
            }
        }
        (result, scheduler.arch().clone())
    };

    for (cpu, from, to) in switches {
        // SAFETY: both contexts belong to live TCBs in the task table and
        // the kernel lock has been released
        unsafe { arch.switch_context(cpu, from, to) };
    }
    Ok(result)
}

/// Task running on the calling CPU
fn current_pid(scheduler: &Scheduler) -> Result<(CpuId, Pid), KernelError> {
    let cpu = scheduler.arch().current_cpu();
    let pid = scheduler.current(cpu).ok_or(KernelError::InvalidArgument)?;
    Ok((cpu, pid))
}

/// Status for a task that just came back from a wait
fn resumed_status(pid: Pid) -> i32 {
    let status = with_kernel(|s| s.wait_status(pid)).ok().flatten();
    match status {
        Some(WaitStatus::TimedOut) => -ETIMEDOUT,
        Some(WaitStatus::Interrupted) => -EINTR,
        // Signaled, or still blocked on a port whose switch returns at once
        Some(WaitStatus::Signaled) | None => 0,
    }
}

// ============================================================================
// TASKS
// ============================================================================

/// Create a task; returns its pid or a negative errno
pub fn task_create(attr: TaskAttr<'_>, entry: TaskEntry, arg: usize) -> i32 {
    to_status(with_kernel(|s| s.task_create(attr, entry, arg)).and_then(|result| result))
}

/// Create a thread in the calling task's group
pub fn thread_create(attr: TaskAttr<'_>, entry: TaskEntry, arg: usize) -> i32 {
    let result = with_kernel(|s| {
        let (_, parent) = current_pid(s)?;
        s.thread_create(parent, attr, entry, arg)
    });
    to_status(result.and_then(|result| result))
}

/// Terminate the calling task
///
/// On hardware ports this does not return once the switch away happened;
/// it returns a negative errno if the exit was refused (idle task).
pub fn task_exit(status: i32) -> i32 {
    let result = with_kernel(|s| {
        let (cpu, _) = current_pid(s)?;
        s.exit_current(cpu, status)
    });
    unit_status(result.and_then(|result| result))
}

pub fn task_cancel(pid: Pid) -> i32 {
    unit_status(with_kernel(|s| s.task_cancel(pid)).and_then(|result| result))
}

pub fn set_priority(pid: Pid, priority: Priority) -> i32 {
    unit_status(with_kernel(|s| s.set_priority(pid, priority)).and_then(|result| result))
}

/// Wait for `target` to exit; returns its exit status or a negative errno
///
/// A cancelled target reports CANCELED_STATUS, which lies outside the errno
/// range. A target that exits with a status of its own in -4095..=-1 cannot
/// be told apart from a failed join; use Scheduler::join() when that
/// matters. A join cut short by interrupt_wait() returns -EINTR.
pub fn join(target: Pid) -> i32 {
    let result = with_kernel(|s| {
        let (cpu, pid) = current_pid(s)?;
        s.join(cpu, target).map(|outcome| (pid, outcome))
    });
    match result.and_then(|result| result) {
        Ok((_, JoinOutcome::Exited(status))) => status,
        Ok((pid, JoinOutcome::Blocked)) => {
            let (wait, exit) = with_kernel(|s| (s.wait_status(pid), s.join_result(pid))).unwrap_or((None, None));
            joined_status(wait, exit)
        }
        Err(err) => err.status(),
    }
}

/// Status of a join that blocked, from how the wait ended
fn joined_status(wait: Option<WaitStatus>, exit: Option<i32>) -> i32 {
    match wait {
        Some(WaitStatus::Interrupted) => -EINTR,
        Some(WaitStatus::TimedOut) => -ETIMEDOUT,
        // Signaled by the target's exit, or a port whose switch returns at once
        Some(WaitStatus::Signaled) | None => exit.unwrap_or(0),
    }
}

/// Sleep for `ticks`; 0 on normal expiry, -EINTR if woken early
pub fn sleep(ticks: Ticks) -> i32 {
    let result = with_kernel(|s| {
        let (cpu, pid) = current_pid(s)?;
        s.sleep(cpu, ticks).map(|()| pid)
    });
    match result.and_then(|result| result) {
        Ok(pid) if ticks > 0 => match resumed_status(pid) {
            status if status == -ETIMEDOUT => 0,
            status => status,
        },
        Ok(_) => 0,
        Err(err) => err.status(),
    }
}

pub fn yield_now() -> i32 {
    let result = with_kernel(|s| {
        let cpu = s.arch().current_cpu();
        s.yield_now(cpu)
    });
    unit_status(result.and_then(|result| result))
}

pub fn sched_lock() -> i32 {
    let result = with_kernel(|s| {
        let cpu = s.arch().current_cpu();
        s.sched_lock(cpu)
    });
    unit_status(result.and_then(|result| result))
}

pub fn sched_unlock() -> i32 {
    let result = with_kernel(|s| {
        let cpu = s.arch().current_cpu();
        s.sched_unlock(cpu)
    });
    unit_status(result.and_then(|result| result))
}

// ============================================================================
// SEMAPHORES
// ============================================================================

/// Create a semaphore; returns its packed id (SemId::to_raw) or a negative errno
pub fn sem_init(value: u32) -> i32 {
    let result = with_kernel(|s| s.sem_init(value)).and_then(|result| result);
    to_status(result.map(|id| id.to_raw() as i32))
}

pub fn sem_destroy(id: SemId) -> i32 {
    unit_status(with_kernel(|s| s.sem_destroy(id)).and_then(|result| result))
}

pub fn sem_post(id: SemId) -> i32 {
    unit_status(with_kernel(|s| s.sem_post(id)).and_then(|result| result))
}

pub fn sem_trywait(id: SemId) -> i32 {
    unit_status(with_kernel(|s| s.sem_trywait(id)).and_then(|result| result))
}

/// Take a unit, blocking up to `timeout` ticks (None waits forever)
pub fn sem_wait(id: SemId, timeout: Option<Ticks>) -> i32 {
    let result = with_kernel(|s| {
        let (cpu, pid) = current_pid(s)?;
        s.sem_wait(cpu, id, timeout).map(|outcome| (pid, outcome))
    });
    match result.and_then(|result| result) {
        Ok((_, SemWait::Acquired)) => 0,
        Ok((pid, SemWait::Blocked)) => resumed_status(pid),
        Err(err) => err.status(),
    }
}

// ============================================================================
// TIMERS
// ============================================================================

pub fn timer_start(delay: Ticks, flags: TimerFlags, callback: TimerCallback, arg: usize) -> Result<WdogId, KernelError> {
    with_kernel(|s| s.timer_start(delay, flags, callback, arg))?
}

pub fn timer_cancel(id: WdogId) -> i32 {
    unit_status(with_kernel(|s| s.timer_cancel(id)).and_then(|result| result))
}

/// How long the calling CPU may stay in a low-power state
pub fn wakeup_delay() -> Result<WakeupDelay, KernelError> {
    with_kernel(|s| s.wakeup_delay())
}

/// System tick handler
pub fn tick(elapsed: Ticks) -> i32 {
    unit_status(with_kernel(|s| s.tick(elapsed)))
}

// ============================================================================
// THREAD-SPECIFIC DATA
// ============================================================================

/// pthread_key_create for the calling task's group
pub fn key_create(destructor: Option<KeyDestructor>) -> i32 {
    let result = with_kernel(|s| {
        let (_, pid) = current_pid(s)?;
        s.key_create(pid, destructor)
    });
    to_status(result.and_then(|result| result))
}

pub fn key_delete(key: PthreadKey) -> i32 {
    let result = with_kernel(|s| {
        let (_, pid) = current_pid(s)?;
        s.key_delete(pid, key)
    });
    unit_status(result.and_then(|result| result))
}

/// Calling task's value for `key`, 0 (null) if unset or unknown
pub fn get_specific(key: PthreadKey) -> usize {
    with_kernel(|s| current_pid(s).map(|(_, pid)| s.get_specific(pid, key)).unwrap_or(0)).unwrap_or(0)
}

pub fn set_specific(key: PthreadKey, value: usize) -> i32 {
    let result = with_kernel(|s| {
        let (_, pid) = current_pid(s)?;
        s.set_specific(pid, key, value)
    });
    unit_status(result.and_then(|result| result))
}

// ============================================================================
// CPU HOTPLUG
// ============================================================================

#[cfg(feature = "smp")]
pub fn cpu_enable(cpu: u32) -> i32 {
    unit_status(with_kernel(|s| s.cpu_enable(CpuId(cpu))).and_then(|result| result))
}

#[cfg(feature = "smp")]
pub fn cpu_disable(cpu: u32) -> i32 {
    unit_status(with_kernel(|s| s.cpu_disable(CpuId(cpu))).and_then(|result| result))
}

#[cfg(feature = "smp")]
pub fn cpu_hotplug(cpu: u32) -> i32 {
    unit_status(with_kernel(|s| s.cpu_hotplug(CpuId(cpu))).and_then(|result| result))
}

// ============================================================================
// IDLE LOOP
// ============================================================================

/// One pass of the idle loop: park the CPU until the next wakeup timer
pub fn idle_step(cpu: CpuId) -> Result<WakeupDelay, KernelError> {
    let (budget, arch) = with_kernel(|s| {
        s.note_idle(cpu);
        (s.wakeup_delay(), s.arch().clone())
    })?;
    arch.idle(cpu, budget);
    Ok(budget)
}

/// Body of every per-CPU idle task; the argument is the CPU index
pub fn idle_main(arg: usize) {
    let cpu = CpuId(arg as u32);
    loop {
        if idle_step(cpu).is_err() {
            core::hint::spin_loop();
        }
    }
}
