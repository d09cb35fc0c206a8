/*
 * Timers and the System Tick
 *
 * The scheduler's WatchdogList carries two kinds of entries:
 * - Timeout(pid): bounds a blocking wait (semaphore, sleep); expiry wakes
 *   the task with WaitStatus::TimedOut
 * - User timers started through timer_start(): expiry calls the callback
 *   with the scheduler, so callbacks may post semaphores or start/cancel
 *   timers. Periodic timers are re-armed with the same handle unless the
 *   callback cancelled them.
 *
 * tick() is the heartbeat. It may be told that several ticks elapsed at
 * once (tickless idle catching up). The span is replayed one expiry at a
 * time: the list only advances up to the next due entry, which fires
 * before time moves on. A periodic timer therefore fires once per period
 * inside the span, and anything a callback arms is placed relative to the
 * instant its callback ran, not the end of the span.
 *
 * Why this is important:
 * - The watchdog list is the only timeout primitive; nothing else counts time
 * - Entries flagged WAKEUP are what the idle loop may not sleep past
 */

use bitflags::bitflags;

use super::Scheduler;
use super::types::{CpuId, Pid, SchedPolicy, TaskState, WaitStatus};
use crate::config::StackCheck;
use crate::error::KernelError;
use crate::watchdog::{Ticks, WakeupDelay, WdogId};

/// User timer callback: scheduler, the timer's handle, user argument
pub type TimerCallback = fn(&mut Scheduler, WdogId, usize);

bitflags! {
    /// Options of timer_start()
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TimerFlags: u32 {
        /// Re-arm with the same delay after every expiry
        const PERIODIC = 1 << 0;

        /// The CPU must be awake when this timer fires (limits idle sleep)
        const WAKEUP = 1 << 1;
    }
}

/// What happens when a watchdog fires
#[derive(Debug, Copy, Clone)]
pub enum WdogAction {
    /// Time out the wait of a blocked task
    Timeout(Pid),

    /// Call a user callback
    User {
        callback: TimerCallback,
        arg: usize,
        period: Option<Ticks>,
        wakeup: bool,
    },
}

impl Scheduler {
    // ========================================================================
    // TIMER API
    // ========================================================================

    /// Start a timer firing `callback(arg)` after `delay` ticks
    ///
    /// A delay of 0 fires on the next tick. With PERIODIC the timer keeps
    /// firing every `delay` ticks until cancelled.
    pub fn timer_start(
        &mut self,
        delay: Ticks,
        flags: TimerFlags,
        callback: TimerCallback,
        arg: usize,
    ) -> Result<WdogId, KernelError> {
        let delay = delay.max(1);
        let wakeup = flags.contains(TimerFlags::WAKEUP);
        let action = WdogAction::User {
            callback,
            arg,
            period: flags.contains(TimerFlags::PERIODIC).then_some(delay),
            wakeup,
        };

        match self.watchdogs.start(delay, action, wakeup) {
            Ok(id) => {
                log::debug!("{} started: {} ticks, {:?}", id, delay, flags);
                Ok(id)
            }
            Err(_) => Err(self.heap.allocation_failed(core::mem::size_of::<WdogAction>())),
        }
    }

    /// Stop a user timer and release its handle
    ///
    /// Also valid from inside the timer's own callback, which stops a
    /// periodic timer for good.
    pub fn timer_cancel(&mut self, id: WdogId) -> Result<(), KernelError> {
        if matches!(self.watchdogs.payload(id), Some(WdogAction::Timeout(_))) {
            // Task timeouts belong to the scheduler
            return Err(KernelError::InvalidArgument);
        }
        self.watchdogs.cancel(id).map(|_| ())
    }

    /// Ticks until a timer fires, None if it is not armed
    pub fn timer_remaining(&self, id: WdogId) -> Option<Ticks> {
        self.watchdogs.remaining(id)
    }

    /// How long the CPU may sleep before a WAKEUP timer must fire
    pub fn wakeup_delay(&self) -> WakeupDelay {
        self.watchdogs.wakeup_delay()
    }

    /// Number of armed watchdogs (timeouts and user timers)
    pub fn armed_timers(&self) -> usize {
        self.watchdogs.len()
    }

    // ========================================================================
    // SLEEP
    // ========================================================================

    /// Put the task running on `cpu` to sleep for `ticks`
    ///
    /// Sleeping 0 ticks is a yield. The task resumes with
    /// WaitStatus::TimedOut, or Interrupted if woken early by
    /// interrupt_wait().
    pub fn sleep(&mut self, cpu: CpuId, ticks: Ticks) -> Result<(), KernelError> {
        self.valid_cpu(cpu)?;
        if ticks == 0 {
            return self.yield_now(cpu);
        }

        let pid = self.current(cpu).ok_or(KernelError::InvalidArgument)?;
        if self.tasks.get(pid).is_some_and(|tcb| tcb.is_idle) {
            return Err(KernelError::NotPermitted);
        }
        let wdog = self.start_timeout(pid, ticks)?;
        if let Err(err) = self.block_current(cpu) {
            let _ = self.watchdogs.cancel(wdog);
            return Err(err);
        }
        if let Some(tcb) = self.tasks.get_mut(pid) {
            tcb.wait_wdog = Some(wdog);
        }
        self.sleeping.push_back(&mut self.tasks, pid, super::tcb::ListTag::Sleeping);
        log::debug!("{} sleeping {} ticks", pid, ticks);

        self.reschedule(cpu);
        Ok(())
    }

    // ========================================================================
    // TICK
    // ========================================================================

    /// Account for `elapsed` ticks
    ///
    /// Fires due watchdogs, charges round-robin timeslices, runs periodic
    /// stack checks and reschedules every online CPU.
    pub fn tick(&mut self, elapsed: Ticks) {
        if elapsed == 0 {
            return;
        }
        let before = self.clock;
        self.run_watchdogs(elapsed);
        self.charge_timeslices(elapsed);

        if let StackCheck::Periodic(interval) = self.config.stack_check {
            let interval = u64::from(interval);
            if before / interval != self.clock / interval {
                self.check_all_stacks();
            }
        }

        self.reschedule_all();
    }

    /// Let `elapsed` ticks pass on the watchdog list, expiry by expiry
    ///
    /// The clock follows along, so a callback sees the time it was due at.
    fn run_watchdogs(&mut self, elapsed: Ticks) {
        let mut remaining = elapsed;
        loop {
            self.fire_expired();
            // Re-armed and new entries are at least one tick out, so every
            // pass consumes time
            match self.watchdogs.next_expiry() {
                Some(lag) if lag <= remaining => {
                    self.watchdogs.advance(lag);
                    self.clock += u64::from(lag);
                    remaining -= lag;
                }
                _ => break,
            }
        }
        self.watchdogs.advance(remaining);
        self.clock += u64::from(remaining);
    }

    /// Run every watchdog that is due now, in expiry order
    fn fire_expired(&mut self) {
        while let Some((id, action)) = self.watchdogs.pop_expired() {
            match action {
                WdogAction::Timeout(pid) => {
                    self.watchdogs.release(id);
                    let owns = self.tasks.get(pid).is_some_and(|tcb| tcb.wait_wdog == Some(id));
                    if owns {
                        if let Some(tcb) = self.tasks.get_mut(pid) {
                            tcb.wait_wdog = None;
                        }
                        self.make_ready(pid, WaitStatus::TimedOut);
                    }
                }
                WdogAction::User {
                    callback,
                    arg,
                    period,
                    wakeup,
                } => {
                    callback(self, id, arg);

                    // The callback may have cancelled (released) or restarted it
                    if !self.watchdogs.contains(id) || self.watchdogs.is_armed(id) {
                        continue;
                    }
                    match period {
                        Some(period) => {
                            let _ = self.watchdogs.restart(id, period, action, wakeup);
                        }
                        None => self.watchdogs.release(id),
                    }
                }
            }
        }
    }

    /// Rotate round-robin tasks whose slice ran out
    fn charge_timeslices(&mut self, elapsed: Ticks) {
        let interval = self.config.rr_interval;
        for index in 0..self.cpus.len() {
            let cpu = CpuId(index as u32);
            if !self.cpu_states.is_running(cpu) {
                continue;
            }
            self.cpus[index].stats.ticks += u64::from(elapsed);
            if interval == 0 {
                continue;
            }

            let current = self.cpus[index].current;
            let Some(tcb) = self.tasks.get_mut(current) else {
                continue;
            };
            if tcb.policy != SchedPolicy::RoundRobin || tcb.state != TaskState::Running {
                continue;
            }
            tcb.timeslice = tcb.timeslice.saturating_sub(elapsed);
            if tcb.timeslice == 0 {
                tcb.timeslice = interval;
                self.cpus[index].rotate = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::super::testing::*;
    use super::super::types::{Priority, TaskAttr};
    use super::*;
    use crate::config::SchedConfig;

    fn bump(_: &mut Scheduler, _: WdogId, arg: usize) {
        let counter = unsafe { &*(arg as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel_self(sched: &mut Scheduler, id: WdogId, arg: usize) {
        bump(sched, id, arg);
        sched.timer_cancel(id).unwrap();
    }

    fn counter_arg(counter: &'static AtomicUsize) -> usize {
        counter as *const AtomicUsize as usize
    }

    #[test]
    fn periodic_timer_keeps_its_handle() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let id = sched
            .timer_start(10, TimerFlags::PERIODIC, bump, counter_arg(&FIRED))
            .unwrap();

        for _ in 0..35 {
            sched.tick(1);
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);
        assert_eq!(sched.timer_remaining(id), Some(5));

        sched.timer_cancel(id).unwrap();
        assert_eq!(sched.armed_timers(), 0);
        assert_eq!(sched.timer_cancel(id), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn catch_up_tick_replays_every_period() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let id = sched
            .timer_start(10, TimerFlags::PERIODIC, bump, counter_arg(&FIRED))
            .unwrap();

        sched.tick(35);
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);
        assert_eq!(sched.timer_remaining(id), Some(5));

        // Same phase as if the ticks had come one by one
        sched.tick(5);
        assert_eq!(FIRED.load(Ordering::SeqCst), 4);
        assert_eq!(sched.timer_remaining(id), Some(10));
    }

    static ORDER: spin::Mutex<alloc::vec::Vec<usize>> = spin::Mutex::new(alloc::vec::Vec::new());

    /// Logs the label, checking it fired at that absolute tick
    fn record(sched: &mut Scheduler, _: WdogId, label: usize) {
        assert_eq!(sched.clock(), label as u64);
        ORDER.lock().push(label);
    }

    fn start_follow_up(sched: &mut Scheduler, _: WdogId, _: usize) {
        sched.timer_start(5, TimerFlags::empty(), record, 15).unwrap();
    }

    #[test]
    fn timer_started_by_a_callback_counts_from_its_parent() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        sched.timer_start(10, TimerFlags::empty(), start_follow_up, 0).unwrap();
        sched.timer_start(20, TimerFlags::empty(), record, 20).unwrap();

        sched.tick(30);
        assert_eq!(*ORDER.lock(), [15, 20]);
        assert_eq!(sched.armed_timers(), 0);
    }

    #[test]
    fn catch_up_tick_leaves_later_timers_pending() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let early = sched.timer_start(7, TimerFlags::empty(), bump, counter_arg(&FIRED)).unwrap();
        let late = sched.timer_start(40, TimerFlags::empty(), bump, counter_arg(&FIRED)).unwrap();

        sched.tick(25);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(sched.timer_remaining(early), None);
        assert_eq!(sched.timer_remaining(late), Some(15));
    }

    #[test]
    fn periodic_timer_can_cancel_itself() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        sched
            .timer_start(4, TimerFlags::PERIODIC, cancel_self, counter_arg(&FIRED))
            .unwrap();
        sched.tick(20);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(sched.armed_timers(), 0);
        assert_eq!(sched.watchdogs.available(), sched.watchdogs.capacity());
    }

    #[test]
    fn one_shot_timer_releases_its_entry() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT.with_max_watchdogs(1));
        sched.timer_start(0, TimerFlags::empty(), bump, counter_arg(&FIRED)).unwrap();
        sched.tick(1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        // The single pool entry is free again
        sched.timer_start(5, TimerFlags::empty(), bump, counter_arg(&FIRED)).unwrap();
        assert!(matches!(
            sched.timer_start(5, TimerFlags::empty(), bump, counter_arg(&FIRED)),
            Err(KernelError::NoMemory(_))
        ));
    }

    #[test]
    fn sleep_wakes_after_its_ticks() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let task = sched.task_create(TaskAttr::new(Priority(40)), nop, 0).unwrap();
        sched.sleep(CpuId::BSP, 3).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(Pid(0)));

        sched.tick(2);
        assert_eq!(sched.task(task).unwrap().state(), TaskState::Blocked);
        sched.tick(1);
        assert_eq!(sched.current(CpuId::BSP), Some(task));
        assert_eq!(sched.wait_status(task), Some(WaitStatus::TimedOut));
        assert_eq!(sched.armed_timers(), 0);
    }

    #[test]
    fn round_robin_rotates_equal_priorities() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT.with_rr_interval(5));
        let attr = TaskAttr::new(Priority(20)).policy(SchedPolicy::RoundRobin);
        let a = sched.task_create(attr, nop, 0).unwrap();
        let b = sched.task_create(attr, nop, 0).unwrap();
        assert_eq!(sched.current(CpuId::BSP), Some(a));

        sched.tick(4);
        assert_eq!(sched.current(CpuId::BSP), Some(a));
        sched.tick(1);
        assert_eq!(sched.current(CpuId::BSP), Some(b));
        sched.tick(5);
        assert_eq!(sched.current(CpuId::BSP), Some(a));
    }

    #[test]
    fn fifo_task_is_never_sliced() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT.with_rr_interval(5));
        let a = sched.task_create(TaskAttr::new(Priority(20)), nop, 0).unwrap();
        let _b = sched.task_create(TaskAttr::new(Priority(20)), nop, 0).unwrap();
        sched.tick(50);
        assert_eq!(sched.current(CpuId::BSP), Some(a));
    }

    #[test]
    fn task_timeouts_cannot_be_cancelled_as_timers() {
        let (mut sched, _) = scheduler(SchedConfig::DEFAULT);
        let task = sched.task_create(TaskAttr::new(Priority(40)), nop, 0).unwrap();
        sched.sleep(CpuId::BSP, 30).unwrap();
        let wdog = sched.task(task).unwrap().wait_wdog.unwrap();
        assert_eq!(sched.timer_cancel(wdog), Err(KernelError::InvalidArgument));
    }
}
