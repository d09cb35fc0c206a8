//! CPU hotplug coordination

#![cfg(feature = "smp")]

mod common;

use common::{boot_smp, nop};
use rtsched::arch::sim::SimEvent;
use rtsched::scheduler::{CpuSet, CpuState};
use rtsched::{CpuId, KernelError, Pid, Priority, TaskAttr, TaskState};

#[test]
fn primary_cpu_cannot_be_disabled() {
    let (mut sched, arch) = boot_smp(4);
    assert_eq!(sched.cpu_disable(CpuId(0)), Err(KernelError::InvalidArgument));
    assert_eq!(sched.cpu_hotplug(CpuId(0)), Err(KernelError::InvalidArgument));
    assert_eq!(sched.cpu_disable(CpuId(4)), Err(KernelError::InvalidArgument));
    assert_eq!(KernelError::InvalidArgument.status(), -22);
    assert!(arch.events().is_empty());
}

#[test]
fn work_migrates_off_a_disabled_cpu() {
    let (mut sched, arch) = boot_smp(2);
    let a = sched.task_create(TaskAttr::new(Priority(40)), nop, 0).unwrap();
    let b = sched.task_create(TaskAttr::new(Priority(30)), nop, 0).unwrap();
    assert_eq!(sched.current(CpuId(1)), Some(b));

    sched.cpu_hotplug(CpuId(1)).unwrap();
    assert_eq!(sched.cpu_state(CpuId(1)), Some(CpuState::Disabled));
    assert_eq!(sched.current(CpuId(1)), Some(Pid(1)));
    assert_eq!(sched.task(b).unwrap().state(), TaskState::Ready);
    assert!(arch.events().contains(&SimEvent::CpuHotplugged(CpuId(1))));

    // b gets CPU 0 as soon as a leaves
    sched.task_exit(a, 0).unwrap();
    assert_eq!(sched.current(CpuId(0)), Some(b));
    assert_eq!(sched.check_list_invariants(), Ok(1));
}

#[test]
fn re_enabled_cpu_picks_up_ready_work() {
    let (mut sched, arch) = boot_smp(3);
    sched.cpu_disable(CpuId(2)).unwrap();
    let pinned = sched
        .task_create(TaskAttr::new(Priority(60)).affinity(CpuSet::CPU2), nop, 0)
        .unwrap();
    assert_eq!(sched.task(pinned).unwrap().state(), TaskState::Ready);

    sched.cpu_enable(CpuId(2)).unwrap();
    assert_eq!(sched.cpu_state(CpuId(2)), Some(CpuState::Running));
    assert_eq!(sched.current(CpuId(2)), Some(pinned));
    assert_eq!(
        arch.events()
            .iter()
            .filter(|event| matches!(event, SimEvent::CpuDisabled(_) | SimEvent::CpuEnabled(_)))
            .count(),
        2
    );
}

#[test]
fn failed_transition_is_rolled_back() {
    let (mut sched, arch) = boot_smp(2);
    let task = sched.task_create(TaskAttr::new(Priority(5)).affinity(CpuSet::CPU1), nop, 0).unwrap();
    assert_eq!(sched.current(CpuId(1)), Some(task));

    arch.fail_next_hotplug();
    assert_eq!(sched.cpu_disable(CpuId(1)), Err(KernelError::Busy));
    assert_eq!(sched.cpu_state(CpuId(1)), Some(CpuState::Running));
    assert_eq!(sched.current(CpuId(1)), Some(task));
}
