/*
 * Architecture Abstraction Layer
 *
 * The scheduler core never touches registers itself. Everything that differs
 * between CPUs goes through this module:
 *
 * - Interrupt masking (irq_save / irq_restore), used by sync::IrqMask
 * - Building the initial register frame of a new task (Arch::init_context)
 * - The register/stack swap itself (Arch::switch_context)
 * - Parking an idle CPU for a bounded time (Arch::idle)
 * - Starting and stopping secondary CPUs (CpuHotplugOps)
 *
 * Ports:
 * - sim: hosted simulation used by the test-suite (records what it is asked to do)
 * - x86_64: bare-metal port built on the x86_64 crate
 */

use crate::error::KernelError;
use crate::scheduler::types::CpuId;
use crate::watchdog::WakeupDelay;

pub mod sim;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

/// Task entry point; the argument is passed through unchanged
pub type TaskEntry = fn(usize);

/// Saved execution state of a task that is not running
///
/// Only the stack pointer is architecturally meaningful after the first
/// switch; pc/arg describe where a fresh context starts.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskContext {
    /// Saved stack pointer
    pub sp: usize,

    /// Entry point of a task that has never run
    pub pc: usize,

    /// Argument handed to the entry point
    pub arg: usize,
}

/// CPU port used by the dispatcher
pub trait Arch: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// CPU executing the caller
    fn current_cpu(&self) -> CpuId;

    /// Build the context a new task starts from
    ///
    /// `stack_top` is the 16-byte aligned end of the task's stack.
    fn init_context(&self, entry: TaskEntry, arg: usize, stack_top: usize) -> TaskContext;

    /// Save the running context into `from` (if any) and resume `to` on `cpu`
    ///
    /// For a CPU other than the caller's, ports raise a reschedule IPI and the
    /// target performs the swap itself.
    ///
    /// # Safety
    /// Both pointers must reference live contexts owned by the scheduler, and
    /// the scheduler lock must not be held (the resumed task may take it).
    unsafe fn switch_context(&self, cpu: CpuId, from: Option<*mut TaskContext>, to: *const TaskContext);

    /// Park `cpu` in a low-power state for at most `budget`
    fn idle(&self, cpu: CpuId, budget: WakeupDelay);
}

/// Architecture callbacks behind CPU hotplug
pub trait CpuHotplugOps: Send + Sync {
    /// Start a stopped secondary CPU
    fn cpu_enable(&self, cpu: CpuId) -> Result<(), KernelError>;

    /// Stop a secondary CPU; it stays powered and parked
    fn cpu_disable(&self, cpu: CpuId) -> Result<(), KernelError>;

    /// Take a secondary CPU offline and remove its power
    fn cpu_hotplug(&self, cpu: CpuId) -> Result<(), KernelError>;
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86_64::interrupts::{irq_restore, irq_save, irqs_masked};

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use self::sim::{irq_restore, irq_save, irqs_masked};
