/*
 * Ready Queue
 *
 * One FIFO TaskList per priority level plus a 256-bit bitmap of non-empty
 * levels. Finding the most urgent level is a leading-zero count on at most
 * four words, independent of how many tasks are ready.
 *
 *   bitmap word 3           word 2     word 1     word 0
 *   [255 ........ 192]     [191..128] [127..64]  [63 ... 0]
 *
 * Why this is important:
 * - Strict priority dominance: dequeue always returns a task whose priority
 *   is >= every other ready task
 * - FIFO inside a level: round-robin rotation and equal-priority fairness
 *   rely on insertion order being preserved
 * - On SMP a candidate may be unsuitable for the asking CPU (affinity, CPU
 *   being taken offline); the caller's filter skips it without disturbing
 *   its position
 */

use super::list::TaskList;
use super::table::TaskTable;
use super::tcb::{ListTag, Tcb};
use super::types::{Pid, Priority};
use crate::config::NUM_PRIORITIES;

const BITMAP_WORDS: usize = NUM_PRIORITIES / 64;

pub struct ReadyQueue {
    levels: [TaskList; NUM_PRIORITIES],
    bitmap: [u64; BITMAP_WORDS],
    len: usize,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            levels: [TaskList::new(); NUM_PRIORITIES],
            bitmap: [0; BITMAP_WORDS],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mark(&mut self, level: usize) {
        self.bitmap[level / 64] |= 1 << (level % 64);
    }

    fn update_bit(&mut self, level: usize) {
        if self.levels[level].is_empty() {
            self.bitmap[level / 64] &= !(1 << (level % 64));
        }
    }

    /// Append at the tail of the task's priority level
    pub fn enqueue(&mut self, tasks: &mut TaskTable, pid: Pid) {
        let Some(priority) = tasks.get(pid).map(|tcb| tcb.priority) else {
            return;
        };
        let level = priority.as_usize();
        self.levels[level].push_back(tasks, pid, ListTag::Ready(priority));
        self.mark(level);
        self.len += 1;
    }

    /// Insert at the head of the task's priority level
    pub fn enqueue_front(&mut self, tasks: &mut TaskTable, pid: Pid) {
        let Some(priority) = tasks.get(pid).map(|tcb| tcb.priority) else {
            return;
        };
        let level = priority.as_usize();
        self.levels[level].push_front(tasks, pid, ListTag::Ready(priority));
        self.mark(level);
        self.len += 1;
    }

    /// Unlink a ready task
    ///
    /// Uses the level recorded in the owner tag, so it works even after the
    /// TCB's priority field was changed.
    pub fn remove(&mut self, tasks: &mut TaskTable, pid: Pid) -> bool {
        let Some(ListTag::Ready(priority)) = tasks.link(pid).and_then(|link| link.owner) else {
            return false;
        };
        let level = priority.as_usize();
        if !self.levels[level].remove(tasks, pid) {
            return false;
        }
        self.update_bit(level);
        self.len -= 1;
        true
    }

    /// Most urgent non-empty level
    pub fn highest_priority(&self) -> Option<Priority> {
        self.bitmap
            .iter()
            .enumerate()
            .rev()
            .find(|(_, word)| **word != 0)
            .map(|(index, word)| Priority((index * 64 + 63 - word.leading_zeros() as usize) as u8))
    }

    /// Most urgent ready task accepted by `eligible`, left in place
    ///
    /// Levels are visited from the top of the bitmap down; inside a level the
    /// first accepted task in FIFO order wins.
    pub fn find_highest<F>(&self, tasks: &TaskTable, eligible: F) -> Option<Pid>
    where
        F: Fn(&Tcb) -> bool,
    {
        for index in (0..BITMAP_WORDS).rev() {
            let mut bits = self.bitmap[index];
            while bits != 0 {
                let bit = 63 - bits.leading_zeros() as usize;
                bits &= !(1 << bit);

                let level = index * 64 + bit;
                let found = self.levels[level]
                    .iter(tasks)
                    .find(|pid| tasks.get(*pid).is_some_and(&eligible));
                if found.is_some() {
                    return found;
                }
            }
        }
        None
    }

    /// Remove and return the most urgent task accepted by `eligible`
    pub fn dequeue_highest<F>(&mut self, tasks: &mut TaskTable, eligible: F) -> Option<Pid>
    where
        F: Fn(&Tcb) -> bool,
    {
        let pid = self.find_highest(tasks, eligible)?;
        self.remove(tasks, pid);
        Some(pid)
    }

    /// Tasks waiting at `priority`
    pub fn level(&self, priority: Priority) -> &TaskList {
        &self.levels[priority.as_usize()]
    }

    /// Walk every ready task, most urgent level first
    pub fn iter<'a>(&'a self, tasks: &'a TaskTable) -> impl Iterator<Item = Pid> + 'a {
        self.levels.iter().rev().flat_map(move |level| level.iter(tasks))
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::scheduler::types::Gid;

    fn spawn(tasks: &mut TaskTable, queue: &mut ReadyQueue, priority: u8) -> Pid {
        let pid = tasks.alloc_pid().unwrap();
        tasks.insert(Tcb::new(pid, Gid(pid.0), None, Priority(priority))).unwrap();
        queue.enqueue(tasks, pid);
        pid
    }

    #[test]
    fn equal_priorities_dequeue_in_creation_order() {
        let mut tasks = TaskTable::new(8, 1);
        let mut queue = ReadyQueue::new();
        let low = spawn(&mut tasks, &mut queue, 10);
        let first = spawn(&mut tasks, &mut queue, 20);
        let second = spawn(&mut tasks, &mut queue, 20);

        let order: Vec<Pid> = (0..3)
            .filter_map(|_| queue.dequeue_highest(&mut tasks, |_| true))
            .collect();
        assert_eq!(order, [first, second, low]);
        assert!(queue.is_empty());
        assert_eq!(queue.highest_priority(), None);
    }

    #[test]
    fn bitmap_tracks_levels_across_words() {
        let mut tasks = TaskTable::new(8, 1);
        let mut queue = ReadyQueue::new();
        let a = spawn(&mut tasks, &mut queue, 3);
        let b = spawn(&mut tasks, &mut queue, 200);
        spawn(&mut tasks, &mut queue, 64);

        assert_eq!(queue.highest_priority(), Some(Priority(200)));
        queue.remove(&mut tasks, b);
        assert_eq!(queue.highest_priority(), Some(Priority(64)));
        assert_eq!(queue.dequeue_highest(&mut tasks, |_| true).map(|_| ()), Some(()));
        assert_eq!(queue.highest_priority(), Some(Priority(3)));
        assert_eq!(queue.dequeue_highest(&mut tasks, |_| true), Some(a));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn filter_skips_without_reordering() {
        let mut tasks = TaskTable::new(8, 1);
        let mut queue = ReadyQueue::new();
        let pinned = spawn(&mut tasks, &mut queue, 50);
        let other = spawn(&mut tasks, &mut queue, 50);
        let low = spawn(&mut tasks, &mut queue, 5);

        assert_eq!(queue.dequeue_highest(&mut tasks, |tcb| tcb.pid() != pinned), Some(other));
        assert_eq!(queue.dequeue_highest(&mut tasks, |tcb| tcb.pid() != pinned), Some(low));
        assert_eq!(queue.dequeue_highest(&mut tasks, |tcb| tcb.pid() != pinned), None);
        assert_eq!(queue.level(Priority(50)).front(), Some(pinned));
    }

    #[test]
    fn front_insert_jumps_the_level() {
        let mut tasks = TaskTable::new(8, 1);
        let mut queue = ReadyQueue::new();
        let a = spawn(&mut tasks, &mut queue, 9);
        let b = tasks.alloc_pid().unwrap();
        tasks.insert(Tcb::new(b, Gid(b.0), None, Priority(9))).unwrap();
        queue.enqueue_front(&mut tasks, b);
        assert_eq!(queue.iter(&tasks).collect::<Vec<_>>(), [b, a]);
    }
}
