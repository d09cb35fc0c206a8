/*
 * Scheduler Configuration
 *
 * This module holds the boot-time configuration of the scheduler core.
 * Sizes that shape fixed arrays (priority levels, key table, CPU count limit)
 * are compile-time constants; everything a board or a test may want to vary
 * lives in SchedConfig and is validated once at init.
 *
 * Why this is important:
 * - Embedded targets know their task/timer counts up front, so every pool
 *   is pre-sized from these values and never grows at runtime
 * - Fatal-vs-recoverable policies (allocation failure) are plain values,
 *   so both behaviours can be exercised in the same binary
 */

use crate::error::KernelError;
use crate::memory::heap::AllocFailurePolicy;

/// Number of priority levels (0 = idle, 255 = most urgent)
pub const NUM_PRIORITIES: usize = 256;

/// Thread-specific data keys per task group (PTHREAD_KEYS_MAX)
pub const KEYS_MAX: usize = 32;

/// Destructor passes run on thread exit (PTHREAD_DESTRUCTOR_ITERATIONS)
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Maximum task name length in bytes, longer names are truncated
pub const TASK_NAME_SIZE: usize = 31;

/// Upper bound on CPUs the per-CPU tables are sized for
pub const MAX_CPUS: usize = 8;

/// Value painted at the stack base and checked on every dispatch
pub const STACK_COLOR: u32 = 0xDEAD_BEEF;

/// Smallest stack a task may be created with
pub const MIN_STACK_SIZE: usize = 256;

/// When the dispatcher verifies stack guard words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCheck {
    /// Check the incoming task every time it is dispatched
    OnDispatch,

    /// Check every live task once per given number of ticks
    Periodic(u32),

    /// Never check (guard words are still written)
    Disabled,
}

/// Boot-time scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Capacity of the TCB table, must be a power of two (pid hash)
    pub max_tasks: usize,

    /// Number of CPUs brought up at boot (1 = uniprocessor)
    pub cpu_count: usize,

    /// Capacity of the watchdog pool
    pub max_watchdogs: usize,

    /// Capacity of the semaphore arena
    pub max_semaphores: usize,

    /// Round-robin timeslice in ticks (0 disables time slicing)
    pub rr_interval: u32,

    /// Stack size of each per-CPU idle task
    pub idle_stack_size: usize,

    /// Stack size used when a TaskAttr does not specify one
    pub default_stack_size: usize,

    /// Stack guard verification mode
    pub stack_check: StackCheck,

    /// Paint the whole stack (enables high-water-mark reporting)
    pub stack_coloration: bool,

    /// What to do when kernel bookkeeping cannot be allocated
    pub alloc_failure: AllocFailurePolicy,
}

impl SchedConfig {
    pub const DEFAULT: SchedConfig = SchedConfig {
        max_tasks: 32,
        cpu_count: 1,
        max_watchdogs: 32,
        max_semaphores: 32,
        rr_interval: 20,
        idle_stack_size: 1024,
        default_stack_size: 2048,
        stack_check: StackCheck::OnDispatch,
        stack_coloration: true,
        alloc_failure: AllocFailurePolicy::ReturnError,
    };

    pub const fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub const fn with_cpu_count(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    pub const fn with_max_watchdogs(mut self, max_watchdogs: usize) -> Self {
        self.max_watchdogs = max_watchdogs;
        self
    }

    pub const fn with_max_semaphores(mut self, max_semaphores: usize) -> Self {
        self.max_semaphores = max_semaphores;
        self
    }

    pub const fn with_rr_interval(mut self, ticks: u32) -> Self {
        self.rr_interval = ticks;
        self
    }

    pub const fn with_stack_sizes(mut self, idle: usize, default: usize) -> Self {
        self.idle_stack_size = idle;
        self.default_stack_size = default;
        self
    }

    pub const fn with_stack_check(mut self, check: StackCheck) -> Self {
        self.stack_check = check;
        self
    }

    pub const fn with_stack_coloration(mut self, enabled: bool) -> Self {
        self.stack_coloration = enabled;
        self
    }

    pub const fn with_alloc_failure(mut self, policy: AllocFailurePolicy) -> Self {
        self.alloc_failure = policy;
        self
    }

    /// Check the configuration before any pool is sized from it
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_tasks == 0 || !self.max_tasks.is_power_of_two() {
            log::error!("config: max_tasks {} is not a power of two", self.max_tasks);
            return Err(KernelError::InvalidArgument);
        }

        // Every CPU needs an idle task plus room for at least one real task
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS || self.cpu_count >= self.max_tasks {
            log::error!("config: cpu_count {} out of range", self.cpu_count);
            return Err(KernelError::InvalidArgument);
        }

        if self.max_watchdogs == 0 || self.max_watchdogs > u16::MAX as usize {
            return Err(KernelError::InvalidArgument);
        }

        if self.max_semaphores > u16::MAX as usize {
            return Err(KernelError::InvalidArgument);
        }

        if self.idle_stack_size < MIN_STACK_SIZE || self.default_stack_size < MIN_STACK_SIZE {
            log::error!("config: stack sizes must be at least {} bytes", MIN_STACK_SIZE);
            return Err(KernelError::InvalidArgument);
        }

        if self.stack_check == StackCheck::Periodic(0) {
            return Err(KernelError::InvalidArgument);
        }

        Ok(())
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
