/*
 * x86_64 Context Switch
 *
 * A task that is not running keeps its callee-saved registers on its own
 * stack; its TaskContext only records the stack pointer. Switching is:
 *
 *   push rbp, rbx, r12-r15 on the old stack
 *   store rsp into the old context
 *   load rsp from the new context
 *   pop r15-r12, rbx, rbp and `ret` into the new task
 *
 * A fresh task gets a hand-built frame whose return address is the
 * trampoline, with the entry point in r12 and its argument in r13. The
 * trampoline only knows the C calling convention, so it hands both to
 * rtsched_task_start(), which calls the Rust entry function.
 *
 * Initial frame (from the saved rsp upwards):
 *
 *   r15 r14 r13(arg) r12(entry) rbx rbp [rtsched_task_trampoline] [pad]
 */

use core::arch::global_asm;

use crate::arch::{TaskContext, TaskEntry};

global_asm!(
    ".global rtsched_context_switch",
    "rtsched_context_switch:",
    "    push rbp",
    "    push rbx",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    mov [rdi], rsp",
    "    mov rsp, rsi",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
    "",
    ".global rtsched_context_load",
    "rtsched_context_load:",
    "    mov rsp, rdi",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
    "",
    ".global rtsched_task_trampoline",
    "rtsched_task_trampoline:",
    "    and rsp, -16",
    "    mov rdi, r12",
    "    mov rsi, r13",
    "    call rtsched_task_start",
    "    ud2",
);

unsafe extern "C" {
    fn rtsched_context_switch(save_sp: *mut usize, load_sp: usize);
    fn rtsched_context_load(load_sp: usize) -> !;
    fn rtsched_task_trampoline();
}

/// First Rust code a new task runs
///
/// Calls the entry function and exits the task if it returns.
#[unsafe(no_mangle)]
#[allow(improper_ctypes_definitions)] // entry only travels through r12
extern "C" fn rtsched_task_start(entry: TaskEntry, arg: usize) -> ! {
    entry(arg);

    let status = crate::kernel::task_exit(0);
    log::error!("x86_64: exit of returning task refused ({})", status);
    loop {
        ::x86_64::instructions::hlt();
    }
}

// The trampoline calls this with the C convention
const _: extern "C" fn(TaskEntry, usize) -> ! = rtsched_task_start;

const FRAME_WORDS: usize = 8;

/// Lay out the first frame of a new task at the top of its stack
///
/// # Safety
/// `stack_top` must be the 16-byte aligned end of writable memory with at
/// least FRAME_WORDS words below it.
pub unsafe fn build_initial_frame(entry: TaskEntry, arg: usize, stack_top: usize) -> TaskContext {
    let sp = stack_top - FRAME_WORDS * core::mem::size_of::<usize>();
    let frame = sp as *mut usize;

    let words: [usize; FRAME_WORDS] = [
        0,                                     // r15
        0,                                     // r14
        arg,                                   // r13
        entry as usize,                        // r12
        0,                                     // rbx
        0,                                     // rbp
        rtsched_task_trampoline as usize,      // return address
        0,                                     // pad
    ];
    for (i, word) in words.iter().enumerate() {
        // SAFETY: inside the caller-provided stack
        unsafe { frame.add(i).write(*word) };
    }

    TaskContext {
        sp,
        pc: entry as usize,
        arg,
    }
}

/// Save the current task's stack pointer into `save_sp` and resume `load_sp`
///
/// # Safety
/// `load_sp` must be a stack pointer previously produced by switch() or
/// build_initial_frame() for a task that is not running.
pub unsafe fn switch(save_sp: &mut usize, load_sp: usize) {
    unsafe { rtsched_context_switch(save_sp as *mut usize, load_sp) }
}

/// Resume `load_sp` without saving anything (first dispatch on a CPU)
///
/// # Safety
/// Same as switch().
pub unsafe fn load(load_sp: usize) -> ! {
    unsafe { rtsched_context_load(load_sp) }
}
