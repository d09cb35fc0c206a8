/*
 * Task Groups
 *
 * A task group is the process-like unit of this kernel: the set of threads
 * started from one task_create() call. Members share
 * - The thread-specific-data key table and its destructors
 * - A join list where other tasks wait for a member to exit
 *
 * Why this is important:
 * - TCBs only carry the group id; the group is owned by the scheduler and
 *   outlives any single member
 * - The group is destroyed with its last member, after that member's key
 *   destructors have run
 */

use alloc::vec::Vec;

use super::list::TaskList;
use super::tls::KeyTable;
use super::types::{Gid, Pid};

pub struct TaskGroup {
    /// Group id (pid of the founding task)
    pub(crate) id: Gid,

    /// Live member tasks, founder first
    pub(crate) members: Vec<Pid>,

    /// Keys in use and their destructors
    pub(crate) keys: KeyTable,

    /// Tasks waiting for a member to exit (tagged with the awaited pid)
    pub(crate) joiners: TaskList,
}

impl TaskGroup {
    pub fn new(id: Gid, founder: Pid) -> Self {
        let mut members = Vec::with_capacity(1);
        members.push(founder);
        Self {
            id,
            members,
            keys: KeyTable::new(),
            joiners: TaskList::new(),
        }
    }

    pub fn id(&self) -> Gid {
        self.id
    }

    pub fn members(&self) -> &[Pid] {
        &self.members
    }

    pub fn keys(&self) -> &KeyTable {
        &self.keys
    }

    pub(crate) fn add_member(&mut self, pid: Pid) {
        if !self.members.contains(&pid) {
            self.members.push(pid);
        }
    }

    /// Drop `pid` from the group; true if it was the last member
    pub(crate) fn remove_member(&mut self, pid: Pid) -> bool {
        self.members.retain(|member| *member != pid);
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_member_leaving_empties_group() {
        let mut group = TaskGroup::new(Gid(4), Pid(4));
        group.add_member(Pid(9));
        group.add_member(Pid(9));
        assert_eq!(group.members(), [Pid(4), Pid(9)]);
        assert!(!group.remove_member(Pid(4)));
        assert!(group.remove_member(Pid(9)));
    }
}
