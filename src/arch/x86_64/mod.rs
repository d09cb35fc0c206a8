/*
 * x86_64 Architecture Support Module
 *
 * Bare-metal port of the scheduler core for x86_64 processors.
 *
 * Submodules:
 * - interrupts: Interrupt mask/restore used by every critical section
 * - context: Callee-saved register context switch and task trampoline
 *
 * This port drives a single CPU. switch_context() for any other CPU is
 * refused with a log line; secondary bring-up belongs to the board's
 * CpuHotplugOps implementation.
 */

pub mod context;
pub mod interrupts;

use super::{Arch, TaskContext, TaskEntry};
use crate::scheduler::types::CpuId;
use crate::watchdog::WakeupDelay;

/// The x86_64 port
pub struct X86_64;

impl Arch for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn current_cpu(&self) -> CpuId {
        CpuId::BSP
    }

    fn init_context(&self, entry: TaskEntry, arg: usize, stack_top: usize) -> TaskContext {
        // SAFETY: stack_top is the end of a freshly allocated, unused stack
        unsafe { context::build_initial_frame(entry, arg, stack_top) }
    }

    unsafe fn switch_context(&self, cpu: CpuId, from: Option<*mut TaskContext>, to: *const TaskContext) {
        if cpu != CpuId::BSP {
            log::warn!("x86_64: switch requested for remote CPU {}", cpu.0);
            return;
        }

        // SAFETY: forwarded from the caller's contract
        unsafe {
            match from {
                Some(from) => context::switch(&mut (*from).sp, (*to).sp),
                None => context::load((*to).sp),
            }
        }
    }

    fn idle(&self, _cpu: CpuId, budget: WakeupDelay) {
        // The tick interrupt is the wakeup source; a bounded budget is left to
        // the board's timer programming.
        log::trace!("x86_64: idle, budget {:?}", budget);
        ::x86_64::instructions::interrupts::enable_and_hlt();
    }
}
