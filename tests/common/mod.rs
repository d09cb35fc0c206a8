//! Shared setup for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use rtsched::arch::sim::SimArch;
use rtsched::{AllocFailurePolicy, KernelHeap, SchedConfig, Scheduler};

pub const HEAP_SIZE: usize = 512 * 1024;

/// Word-aligned heap region that lives for the rest of the test process
pub fn heap(size: usize, policy: AllocFailurePolicy) -> KernelHeap {
    let words: &'static mut [u64] = Box::leak(vec![0u64; size / 8].into_boxed_slice());
    let region = unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, size) };
    KernelHeap::from_static(region, policy)
}

/// Scheduler on a fresh simulated machine
pub fn boot(config: SchedConfig) -> (Scheduler, SimArch) {
    let arch = SimArch::new();
    let scheduler = Scheduler::new(config, heap(HEAP_SIZE, config.alloc_failure), Arc::new(arch.clone()))
        .expect("valid test configuration");
    (scheduler, arch)
}

/// Scheduler with the simulated hotplug callbacks attached
pub fn boot_smp(cpus: usize) -> (Scheduler, SimArch) {
    let (scheduler, arch) = boot(SchedConfig::DEFAULT.with_cpu_count(cpus));
    (scheduler.with_hotplug_ops(Arc::new(arch.clone())), arch)
}

pub fn nop(_: usize) {}
