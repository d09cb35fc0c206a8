/*
 * Hosted Simulation Port
 *
 * Stand-in for real hardware when the scheduler core runs as an ordinary
 * process (unit and integration tests). Nothing is executed: every request
 * the dispatcher makes is appended to a shared trace so tests can assert on
 * exactly which contexts were swapped, how long a CPU was allowed to sleep,
 * and which hotplug callbacks ran.
 *
 * Interrupt masking is modelled by a nesting counter per host thread: each
 * test thread plays one CPU, so concurrent tests cannot see each other's
 * masked sections. Bare-metal targets without a port of their own fall back
 * to a single counter.
 */

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use super::{Arch, CpuHotplugOps, TaskContext, TaskEntry};
use crate::error::KernelError;
use crate::scheduler::types::CpuId;
use crate::watchdog::WakeupDelay;

#[cfg(not(target_os = "none"))]
mod mask {
    extern crate std;

    use core::cell::Cell;

    std::thread_local! {
        static DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    /// Enter a masked section, returning the previous depth
    pub fn enter() -> usize {
        DEPTH.with(|depth| {
            let previous = depth.get();
            depth.set(previous + 1);
            previous
        })
    }

    pub fn leave() {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }

    pub fn depth() -> usize {
        DEPTH.with(Cell::get)
    }
}

#[cfg(target_os = "none")]
mod mask {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static DEPTH: AtomicUsize = AtomicUsize::new(0);

    pub fn enter() -> usize {
        DEPTH.fetch_add(1, Ordering::SeqCst)
    }

    pub fn leave() {
        DEPTH.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn depth() -> usize {
        DEPTH.load(Ordering::SeqCst)
    }
}

/// Mask simulated interrupts, returning whether they were enabled
pub fn irq_save() -> bool {
    mask::enter() == 0
}

/// Undo one irq_save
pub fn irq_restore(_was_enabled: bool) {
    mask::leave();
}

pub fn irqs_masked() -> bool {
    mask::depth() > 0
}

/// Something the scheduler asked the simulated hardware to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Switch {
        cpu: CpuId,
        from: Option<TaskContext>,
        to: TaskContext,
    },
    Idle {
        cpu: CpuId,
        budget: WakeupDelay,
    },
    CpuEnabled(CpuId),
    CpuDisabled(CpuId),
    CpuHotplugged(CpuId),
}

/// Simulated CPU complex
///
/// Clones share the same trace, so a test can keep one handle while the
/// scheduler owns another.
#[derive(Clone)]
pub struct SimArch {
    trace: Arc<Mutex<Vec<SimEvent>>>,
    current_cpu: Arc<AtomicU32>,
    fail_hotplug: Arc<AtomicBool>,
    switch_hook: Arc<Mutex<Option<fn()>>>,
}

impl SimArch {
    pub fn new() -> Self {
        Self {
            trace: Arc::new(Mutex::new(Vec::new())),
            current_cpu: Arc::new(AtomicU32::new(0)),
            fail_hotplug: Arc::new(AtomicBool::new(false)),
            switch_hook: Arc::new(Mutex::new(None)),
        }
    }

    /// Pretend the caller now runs on `cpu`
    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.current_cpu.store(cpu.0, Ordering::SeqCst);
    }

    /// Make the next hotplug callback fail with Busy
    pub fn fail_next_hotplug(&self) {
        self.fail_hotplug.store(true, Ordering::SeqCst);
    }

    /// Run `hook` during the next context switch
    ///
    /// Stands in for whatever the rest of the system does while the
    /// switched-out task is off the CPU. The hook runs after the kernel lock
    /// was released, so it may call back into the kernel.
    pub fn on_next_switch(&self, hook: fn()) {
        *self.switch_hook.lock() = Some(hook);
    }

    /// Copy of everything recorded so far
    pub fn events(&self) -> Vec<SimEvent> {
        self.trace.lock().clone()
    }

    /// Only the context switches, in order
    pub fn switches(&self) -> Vec<(CpuId, TaskContext)> {
        self.trace
            .lock()
            .iter()
            .filter_map(|event| match event {
                SimEvent::Switch { cpu, to, .. } => Some((*cpu, *to)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.trace.lock().clear();
    }

    fn record(&self, event: SimEvent) {
        self.trace.lock().push(event);
    }

    fn scripted_result(&self) -> Result<(), KernelError> {
        if self.fail_hotplug.swap(false, Ordering::SeqCst) {
            Err(KernelError::Busy)
        } else {
            Ok(())
        }
    }
}

impl Default for SimArch {
    fn default() -> Self {
        Self::new()
    }
}

impl Arch for SimArch {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn current_cpu(&self) -> CpuId {
        CpuId(self.current_cpu.load(Ordering::SeqCst))
    }

    fn init_context(&self, entry: TaskEntry, arg: usize, stack_top: usize) -> TaskContext {
        TaskContext {
            sp: stack_top,
            pc: entry as usize,
            arg,
        }
    }

    unsafe fn switch_context(&self, cpu: CpuId, from: Option<*mut TaskContext>, to: *const TaskContext) {
        // SAFETY: the caller guarantees both contexts are live
        let (from, to) = unsafe { (from.map(|ptr| *ptr), *to) };
        self.record(SimEvent::Switch { cpu, from, to });

        let hook = self.switch_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn idle(&self, cpu: CpuId, budget: WakeupDelay) {
        self.record(SimEvent::Idle { cpu, budget });
    }
}

impl CpuHotplugOps for SimArch {
    fn cpu_enable(&self, cpu: CpuId) -> Result<(), KernelError> {
        self.scripted_result()?;
        self.record(SimEvent::CpuEnabled(cpu));
        Ok(())
    }

    fn cpu_disable(&self, cpu: CpuId) -> Result<(), KernelError> {
        self.scripted_result()?;
        self.record(SimEvent::CpuDisabled(cpu));
        Ok(())
    }

    fn cpu_hotplug(&self, cpu: CpuId) -> Result<(), KernelError> {
        self.scripted_result()?;
        self.record(SimEvent::CpuHotplugged(cpu));
        Ok(())
    }
}
