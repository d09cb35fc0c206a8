//! Thread-specific data across a task group

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::{boot, nop};
use rtsched::config::{DESTRUCTOR_ITERATIONS, KEYS_MAX};
use rtsched::scheduler::{PthreadKey, ThreadData};
use rtsched::{KernelError, Priority, SchedConfig, TaskAttr};

const KEYS: u32 = 8;

static REARM_CALLS: AtomicUsize = AtomicUsize::new(0);

/// Puts data back under the next key, forever
fn rearm_next(data: &mut ThreadData<'_>, value: usize) {
    REARM_CALLS.fetch_add(1, Ordering::SeqCst);
    let next = PthreadKey((value as u32 + 1) % KEYS);
    data.set(next, value + 1);
}

#[test]
fn rearming_destructors_cannot_keep_a_thread_alive() {
    let (mut sched, _) = boot(SchedConfig::DEFAULT);
    let pid = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();
    assert!(KEYS as usize > DESTRUCTOR_ITERATIONS);

    for index in 0..KEYS {
        let key = sched.key_create(pid, Some(rearm_next)).unwrap();
        assert_eq!(key, PthreadKey(index));
        sched.set_specific(pid, key, index as usize + 1).unwrap();
    }

    sched.task_exit(pid, 0).unwrap();
    let calls = REARM_CALLS.load(Ordering::SeqCst);
    assert!(calls >= KEYS as usize);
    assert!(calls <= DESTRUCTOR_ITERATIONS * KEYS as usize);
    assert!(sched.task(pid).is_none());
}

#[test]
fn delete_clears_every_member() {
    let (mut sched, _) = boot(SchedConfig::DEFAULT);
    let main = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();
    let worker = sched.thread_create(main, TaskAttr::new(Priority(10)), nop, 0).unwrap();

    let key = sched.key_create(main, None).unwrap();
    sched.set_specific(main, key, 0x10).unwrap();
    sched.set_specific(worker, key, 0x20).unwrap();
    assert_eq!(sched.get_specific(worker, key), 0x20);

    sched.key_delete(worker, key).unwrap();
    assert_eq!(sched.get_specific(main, key), 0);
    assert_eq!(sched.get_specific(worker, key), 0);
    assert_eq!(sched.set_specific(main, key, 1), Err(KernelError::InvalidArgument));

    // The slot comes back empty
    let again = sched.key_create(main, None).unwrap();
    assert_eq!(again, key);
    assert_eq!(sched.get_specific(worker, again), 0);
}

#[test]
fn unknown_keys_read_as_null() {
    let (mut sched, _) = boot(SchedConfig::DEFAULT);
    let pid = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();
    assert_eq!(sched.get_specific(pid, PthreadKey(3)), 0);
    assert_eq!(sched.get_specific(pid, PthreadKey(KEYS_MAX as u32 + 5)), 0);
    assert_eq!(sched.key_delete(pid, PthreadKey(3)), Err(KernelError::InvalidArgument));
}

#[test]
fn groups_have_separate_key_tables() {
    let (mut sched, _) = boot(SchedConfig::DEFAULT);
    let a = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();
    let b = sched.task_create(TaskAttr::new(Priority(10)), nop, 0).unwrap();

    for _ in 0..KEYS_MAX {
        sched.key_create(a, None).unwrap();
    }
    assert_eq!(sched.key_create(a, None), Err(KernelError::TryAgain));
    assert_eq!(sched.key_create(b, None), Ok(PthreadKey(0)));
}
