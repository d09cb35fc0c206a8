/*
 * Kernel Error Types
 *
 * Every recoverable failure in the scheduler core is reported as a
 * KernelError. The external (C-shaped) interfaces collapse results into a
 * "value or negative errno" status with to_status().
 *
 * Timeouts are deliberately absent: a wait that times out is a normal wake
 * reason and is reported as WaitStatus::TimedOut, not as an error.
 * Stack corruption is absent too: it halts the system and never travels
 * back through a return value.
 */

use core::fmt;

use crate::memory::heap::AllocFailure;

/// Errors returned by scheduler operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Bad argument (cpu index, key, priority, handle...)
    InvalidArgument,

    /// No task with the given pid exists
    NoSuchTask,

    /// Kernel bookkeeping could not be allocated
    NoMemory(AllocFailure),

    /// Resource temporarily unavailable (key table full, semaphore at zero)
    TryAgain,

    /// Object is in use (semaphore with waiters, CPU mid-transition)
    Busy,

    /// Operation not allowed on this target (idle task, primary CPU)
    NotPermitted,

    /// One-time initialization was attempted twice
    AlreadyInitialized,

    /// The wait could never complete (joining yourself)
    Deadlock,

    /// The global kernel has not been set up yet
    NotInitialized,
}

impl KernelError {
    /// POSIX errno value for this error
    pub const fn errno(&self) -> i32 {
        match self {
            KernelError::InvalidArgument => 22,
            KernelError::NoSuchTask => 3,
            KernelError::NoMemory(_) => 12,
            KernelError::TryAgain => 11,
            KernelError::Busy => 16,
            KernelError::NotPermitted => 1,
            KernelError::AlreadyInitialized => 114,
            KernelError::Deadlock => 35,
            KernelError::NotInitialized => 19,
        }
    }

    /// Negative status code as returned across the C-shaped interfaces
    pub const fn status(&self) -> i32 {
        -self.errno()
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::NoSuchTask => write!(f, "no such task"),
            KernelError::NoMemory(failure) => write!(f, "out of memory ({})", failure),
            KernelError::TryAgain => write!(f, "resource temporarily unavailable"),
            KernelError::Busy => write!(f, "resource busy"),
            KernelError::NotPermitted => write!(f, "operation not permitted"),
            KernelError::AlreadyInitialized => write!(f, "already initialized"),
            KernelError::Deadlock => write!(f, "deadlock would occur"),
            KernelError::NotInitialized => write!(f, "kernel not initialized"),
        }
    }
}

/// Collapse a result into "non-negative value or negative errno"
pub fn to_status<T: Into<i32>>(result: Result<T, KernelError>) -> i32 {
    match result {
        Ok(value) => value.into(),
        Err(err) => err.status(),
    }
}

/// Status for operations that only report success (0) or failure
pub fn unit_status(result: Result<(), KernelError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_negated_errno() {
        assert_eq!(KernelError::InvalidArgument.status(), -22);
        assert_eq!(KernelError::NoSuchTask.status(), -3);
        assert_eq!(unit_status(Err(KernelError::Busy)), -16);
        assert_eq!(unit_status(Ok(())), 0);
    }

    #[test]
    fn to_status_passes_values_through() {
        assert_eq!(to_status::<i32>(Ok(7)), 7);
        assert_eq!(to_status::<i32>(Err(KernelError::TryAgain)), -11);
    }
}
