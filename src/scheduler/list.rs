/*
 * Intrusive Task Lists
 *
 * Doubly linked lists threaded through the Link field of each TCB. A list
 * only stores head, tail and length; the links live in the TaskTable, so
 * every operation borrows the table.
 *
 * Every insertion stamps the TCB with the list's tag and every removal
 * clears it. Inserting a TCB that already has an owner is a kernel bug and
 * panics: a task on two lists at once would be woken twice.
 *
 * All operations are O(1) except the priority-ordered insert used by wait
 * lists, which walks past higher-or-equal priority waiters.
 */

use super::table::TaskTable;
use super::tcb::ListTag;
use super::types::Pid;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TaskList {
    head: Option<Pid>,
    tail: Option<Pid>,
    len: usize,
}

impl TaskList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<Pid> {
        self.head
    }

    pub fn back(&self) -> Option<Pid> {
        self.tail
    }

    /// Stamp `pid` as owned by `tag`
    fn claim(tasks: &mut TaskTable, pid: Pid, tag: ListTag) -> bool {
        let Some(link) = tasks.link_mut(pid) else {
            return false;
        };
        // CRITICAL: a TCB may sit on one list only
        assert!(
            link.owner.is_none(),
            "{} queued on {:?} while still on {:?}",
            pid,
            tag,
            link.owner
        );
        link.owner = Some(tag);
        link.prev = None;
        link.next = None;
        true
    }

    fn set_next(tasks: &mut TaskTable, pid: Pid, next: Option<Pid>) {
        if let Some(link) = tasks.link_mut(pid) {
            link.next = next;
        }
    }

    fn set_prev(tasks: &mut TaskTable, pid: Pid, prev: Option<Pid>) {
        if let Some(link) = tasks.link_mut(pid) {
            link.prev = prev;
        }
    }

    pub fn push_back(&mut self, tasks: &mut TaskTable, pid: Pid, tag: ListTag) {
        if !Self::claim(tasks, pid, tag) {
            return;
        }
        match self.tail {
            Some(tail) => {
                Self::set_next(tasks, tail, Some(pid));
                Self::set_prev(tasks, pid, Some(tail));
            }
            None => self.head = Some(pid),
        }
        self.tail = Some(pid);
        self.len += 1;
    }

    pub fn push_front(&mut self, tasks: &mut TaskTable, pid: Pid, tag: ListTag) {
        if !Self::claim(tasks, pid, tag) {
            return;
        }
        match self.head {
            Some(head) => {
                Self::set_prev(tasks, head, Some(pid));
                Self::set_next(tasks, pid, Some(head));
            }
            None => self.tail = Some(pid),
        }
        self.head = Some(pid);
        self.len += 1;
    }

    /// Insert behind every entry of higher or equal priority
    ///
    /// Keeps wait lists sorted most urgent first, FIFO among equals.
    pub fn insert_by_priority(&mut self, tasks: &mut TaskTable, pid: Pid, tag: ListTag) {
        let Some(priority) = tasks.get(pid).map(|tcb| tcb.priority) else {
            return;
        };

        let mut cursor = self.head;
        while let Some(current) = cursor {
            let Some(tcb) = tasks.get(current) else { break };
            if tcb.priority < priority {
                break;
            }
            cursor = tcb.link.next;
        }

        let Some(before) = cursor else {
            self.push_back(tasks, pid, tag);
            return;
        };
        if !Self::claim(tasks, pid, tag) {
            return;
        }

        let prev = tasks.link(before).and_then(|link| link.prev);
        Self::set_prev(tasks, pid, prev);
        Self::set_next(tasks, pid, Some(before));
        Self::set_prev(tasks, before, Some(pid));
        match prev {
            Some(prev) => Self::set_next(tasks, prev, Some(pid)),
            None => self.head = Some(pid),
        }
        self.len += 1;
    }

    /// Unlink `pid`; false if it is not on a list
    ///
    /// The caller must only pass TCBs owned by this list (the owner tag says
    /// which one).
    pub fn remove(&mut self, tasks: &mut TaskTable, pid: Pid) -> bool {
        let Some(link) = tasks.link_mut(pid) else {
            return false;
        };
        if link.owner.is_none() {
            return false;
        }
        let (prev, next) = (link.prev, link.next);
        link.prev = None;
        link.next = None;
        link.owner = None;

        match prev {
            Some(prev) => Self::set_next(tasks, prev, next),
            None => self.head = next,
        }
        match next {
            Some(next) => Self::set_prev(tasks, next, prev),
            None => self.tail = prev,
        }
        self.len -= 1;
        true
    }

    pub fn pop_front(&mut self, tasks: &mut TaskTable) -> Option<Pid> {
        let head = self.head?;
        self.remove(tasks, head);
        Some(head)
    }

    /// Walk the list front to back
    pub fn iter<'a>(&self, tasks: &'a TaskTable) -> Iter<'a> {
        Iter {
            tasks,
            cursor: self.head,
        }
    }
}

pub struct Iter<'a> {
    tasks: &'a TaskTable,
    cursor: Option<Pid>,
}

impl Iterator for Iter<'_> {
    type Item = Pid;

    fn next(&mut self) -> Option<Pid> {
        let pid = self.cursor?;
        self.cursor = self.tasks.link(pid).and_then(|link| link.next);
        Some(pid)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::scheduler::tcb::Tcb;
    use crate::scheduler::types::{Gid, Priority};

    fn table_with(priorities: &[u8]) -> TaskTable {
        let mut tasks = TaskTable::new(16, 0);
        for (pid, priority) in priorities.iter().enumerate() {
            let pid = Pid(pid as u32);
            tasks.insert(Tcb::new(pid, Gid(0), None, Priority(*priority))).unwrap();
        }
        tasks
    }

    fn pids(list: &TaskList, tasks: &TaskTable) -> Vec<u32> {
        list.iter(tasks).map(|pid| pid.0).collect()
    }

    #[test]
    fn push_and_remove_keep_links_consistent() {
        let mut tasks = table_with(&[1, 1, 1, 1]);
        let mut list = TaskList::new();
        for pid in 0..3 {
            list.push_back(&mut tasks, Pid(pid), ListTag::Sleeping);
        }
        list.push_front(&mut tasks, Pid(3), ListTag::Sleeping);
        assert_eq!(pids(&list, &tasks), [3, 0, 1, 2]);

        assert!(list.remove(&mut tasks, Pid(0)));
        assert!(list.remove(&mut tasks, Pid(2)));
        assert_eq!(pids(&list, &tasks), [3, 1]);
        assert_eq!(list.back(), Some(Pid(1)));
        assert_eq!(tasks.link(Pid(0)).unwrap().owner(), None);
        assert!(!list.remove(&mut tasks, Pid(0)));

        assert_eq!(list.pop_front(&mut tasks), Some(Pid(3)));
        assert_eq!(list.pop_front(&mut tasks), Some(Pid(1)));
        assert!(list.is_empty());
        assert_eq!(list.back(), None);
    }

    #[test]
    fn priority_insert_is_fifo_among_equals() {
        let mut tasks = table_with(&[10, 30, 20, 30, 5]);
        let mut list = TaskList::new();
        for pid in 0..5 {
            list.insert_by_priority(&mut tasks, Pid(pid), ListTag::Sleeping);
        }
        assert_eq!(pids(&list, &tasks), [1, 3, 2, 0, 4]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    #[should_panic(expected = "while still on")]
    fn double_queueing_is_caught() {
        let mut tasks = table_with(&[1]);
        let mut a = TaskList::new();
        let mut b = TaskList::new();
        a.push_back(&mut tasks, Pid(0), ListTag::Sleeping);
        b.push_back(&mut tasks, Pid(0), ListTag::Join(Pid(0)));
    }
}
