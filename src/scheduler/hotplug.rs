/*
 * CPU Hotplug Coordinator
 *
 * Brings secondary CPUs online and offline at runtime. The architecture
 * does the actual work (CpuHotplugOps); the coordinator keeps the per-CPU
 * state flag in step so the dispatcher never hands work to a CPU that is
 * going away.
 *
 * STATE MACHINE (per secondary CPU):
 * =================================
 *
 *   Running --disable/hotplug--> HotplugRequested --ok--> Disabled
 *      ^                               |  (failure reverts)
 *      +------------ok--- HotplugRequested <--enable-- Disabled
 *
 * While a CPU is HotplugRequested or Disabled the dispatcher skips it, and
 * tasks whose affinity allows other CPUs are picked up there. CPU 0 is the
 * boot processor and cannot be taken down.
 */

use super::types::{CpuId, TaskState};
use super::{CpuState, Scheduler};
use crate::arch::CpuHotplugOps;
use crate::error::KernelError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Shutdown {
    Disable,
    Hotplug,
}

impl Scheduler {
    /// Bring a stopped secondary CPU back into scheduling
    pub fn cpu_enable(&mut self, cpu: CpuId) -> Result<(), KernelError> {
        let ops = self.hotplug_target(cpu)?;
        if self.cpu_states.get(cpu) == Some(CpuState::Running) {
            return Ok(());
        }

        self.cpu_states.set(cpu, CpuState::HotplugRequested);
        if let Err(err) = ops.cpu_enable(cpu) {
            log::warn!("{}: enable failed: {}", cpu, err);
            self.cpu_states.set(cpu, CpuState::Disabled);
            return Err(err);
        }

        // The CPU comes up in its idle task
        let idle = self.cpus[cpu.as_usize()].idle;
        self.ready.remove(&mut self.tasks, idle);
        if let Some(tcb) = self.tasks.get_mut(idle) {
            tcb.state = TaskState::Running;
            tcb.cpu = Some(cpu);
        }
        let percpu = &mut self.cpus[cpu.as_usize()];
        percpu.current = idle;
        percpu.need_resched = false;
        percpu.rotate = false;

        self.cpu_states.set(cpu, CpuState::Running);
        log::info!("{} enabled", cpu);
        self.reschedule(cpu);
        Ok(())
    }

    /// Stop a secondary CPU, leaving it powered
    pub fn cpu_disable(&mut self, cpu: CpuId) -> Result<(), KernelError> {
        self.cpu_shutdown(cpu, Shutdown::Disable)
    }

    /// Take a secondary CPU offline and power it down
    pub fn cpu_hotplug(&mut self, cpu: CpuId) -> Result<(), KernelError> {
        self.cpu_shutdown(cpu, Shutdown::Hotplug)
    }

    fn cpu_shutdown(&mut self, cpu: CpuId, how: Shutdown) -> Result<(), KernelError> {
        let ops = self.hotplug_target(cpu)?;
        if self.cpu_states.get(cpu) == Some(CpuState::Disabled) {
            return Ok(());
        }

        // No new work from here on
        self.cpu_states.set(cpu, CpuState::HotplugRequested);
        self.evacuate(cpu);

        let result = match how {
            Shutdown::Disable => ops.cpu_disable(cpu),
            Shutdown::Hotplug => ops.cpu_hotplug(cpu),
        };
        match result {
            Ok(()) => {
                self.cpu_states.set(cpu, CpuState::Disabled);
                log::info!("{} {}", cpu, if how == Shutdown::Hotplug { "unplugged" } else { "disabled" });
            }
            Err(err) => {
                log::warn!("{}: {:?} failed: {}", cpu, how, err);
                self.cpu_states.set(cpu, CpuState::Running);
                self.reschedule_all();
                return Err(err);
            }
        }

        self.reschedule_all();
        Ok(())
    }

    /// Move the running task off `cpu` and leave its idle task in charge
    fn evacuate(&mut self, cpu: CpuId) {
        let percpu = &self.cpus[cpu.as_usize()];
        let (current, idle) = (percpu.current, percpu.idle);
        if current == idle {
            return;
        }

        let runnable = self.tasks.get(current).is_some_and(|tcb| tcb.state == TaskState::Running);
        if runnable {
            if let Some(tcb) = self.tasks.get_mut(current) {
                tcb.state = TaskState::Ready;
            }
            self.ready.enqueue_front(&mut self.tasks, current);
            log::debug!("{}: migrating {}", cpu, current);
        }

        self.ready.remove(&mut self.tasks, idle);
        if let Some(tcb) = self.tasks.get_mut(idle) {
            tcb.state = TaskState::Running;
            tcb.cpu = Some(cpu);
        }
        let percpu = &mut self.cpus[cpu.as_usize()];
        percpu.current = idle;
        percpu.need_resched = false;
        percpu.rotate = false;

        let from = self.tasks.contains(current).then_some(current);
        self.record_switch(super::ContextSwitch { cpu, from, to: idle });
    }

    /// Validate a hotplug target and fetch the callbacks
    fn hotplug_target(&self, cpu: CpuId) -> Result<alloc::sync::Arc<dyn CpuHotplugOps>, KernelError> {
        if cpu == CpuId::BSP || cpu.as_usize() >= self.cpus.len() {
            return Err(KernelError::InvalidArgument);
        }
        self.hotplug_ops.clone().ok_or(KernelError::NotPermitted)
    }
}
