/*
 * rtsched: Real-Time Scheduler Core
 *
 * The task-scheduling heart of a small preemptive RTOS kernel, as a no_std
 * library. The kernel image that embeds it provides the global allocator,
 * the panic handler (which halts) and a board-specific Arch port.
 *
 * Why this is important:
 * - Priority-preemptive dispatch with FIFO order among equals
 * - Delta-encoded watchdog list as the single timeout primitive
 * - Thread-specific data with bounded destructor passes
 * - Stack guard words checked on dispatch; overflow halts the system
 * - SMP-aware: per-CPU dispatch state and runtime CPU hotplug
 *
 * Key modules:
 * - scheduler: the Scheduler context object and everything it owns
 * - watchdog: the timer list
 * - kernel: the single boot-time instance and the C-shaped entry points
 * - arch: CPU ports (hosted simulation, bare-metal x86_64)
 *
 * The crate builds against std only for its own tests, so the whole core
 * runs hosted on the simulation port.
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod scheduler;
pub mod sync;
pub mod utils;
pub mod watchdog;

pub use config::{SchedConfig, StackCheck};
pub use error::KernelError;
pub use memory::{AllocFailurePolicy, KernelHeap};
pub use scheduler::task::JoinOutcome;
pub use scheduler::{CpuId, Pid, Priority, SchedPolicy, Scheduler, TaskAttr, TaskState, WaitStatus};
pub use watchdog::{Ticks, WakeupDelay, WdogId};
