//! FIFO queue of reusable VM ids.
//!
//! Removal is lazy: the membership index drops the id and the stale queue
//! entry is skipped on pop. Each push stamps a fresh ticket so an id that is
//! removed and pushed again queues at the back, not at its old position.

use std::collections::{HashMap, VecDeque};

use minerpool_state::{VmId, VmRecord};

#[derive(Debug, Default)]
pub struct FreeList {
    queue: VecDeque<(u64, VmId)>,
    members: HashMap<VmId, u64>,
    next_ticket: u64,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Free ids in ledger order.
    pub fn from_records(records: &[VmRecord]) -> Self {
        let mut list = Self::new();
        for record in records.iter().filter(|r| r.is_free()) {
            list.push(record.vm_id.clone());
        }
        list
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Queue `vm_id` at the back. No-op if already queued.
    pub fn push(&mut self, vm_id: VmId) -> bool {
        if self.members.contains_key(&vm_id) {
            return false;
        }
        let ticket = self.ticket();
        self.members.insert(vm_id.clone(), ticket);
        self.queue.push_back((ticket, vm_id));
        true
    }

    /// Queue `vm_id` at the front, for a claim that could not be persisted.
    pub fn restore(&mut self, vm_id: VmId) -> bool {
        if self.members.contains_key(&vm_id) {
            return false;
        }
        let ticket = self.ticket();
        self.members.insert(vm_id.clone(), ticket);
        self.queue.push_front((ticket, vm_id));
        true
    }

    pub fn remove(&mut self, vm_id: &VmId) -> bool {
        self.members.remove(vm_id).is_some()
    }

    /// Oldest live id.
    pub fn pop(&mut self) -> Option<VmId> {
        while let Some((ticket, vm_id)) = self.queue.pop_front() {
            if self.members.get(&vm_id) == Some(&ticket) {
                self.members.remove(&vm_id);
                return Some(vm_id);
            }
        }
        None
    }

    pub fn contains(&self, vm_id: &VmId) -> bool {
        self.members.contains_key(vm_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn id(s: &str) -> VmId {
        VmId::new(s)
    }

    #[test]
    fn pops_in_push_order() {
        let mut list = FreeList::new();
        list.push(id("a"));
        list.push(id("b"));
        assert!(!list.push(id("a")));
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop(), Some(id("a")));
        assert_eq!(list.pop(), Some(id("b")));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn removed_ids_are_skipped() {
        let mut list = FreeList::new();
        list.push(id("a"));
        list.push(id("b"));
        assert!(list.remove(&id("a")));
        assert!(!list.contains(&id("a")));
        assert_eq!(list.pop(), Some(id("b")));
        assert!(list.is_empty());
    }

    #[test]
    fn re_pushed_id_goes_to_back() {
        let mut list = FreeList::new();
        list.push(id("a"));
        list.push(id("b"));
        list.remove(&id("a"));
        list.push(id("a"));
        assert_eq!(list.pop(), Some(id("b")));
        assert_eq!(list.pop(), Some(id("a")));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn restore_goes_to_front() {
        let mut list = FreeList::new();
        list.push(id("a"));
        list.push(id("b"));
        let first = list.pop().unwrap();
        list.restore(first);
        assert_eq!(list.pop(), Some(id("a")));
    }

    #[test]
    fn built_from_inactive_records_in_ledger_order() {
        let now = Utc::now();
        let mut active = VmRecord::inactive(id("x"), now);
        active.claim("owner", "n", now);
        let records = vec![
            VmRecord::inactive(id("c"), now),
            active,
            VmRecord::inactive(id("a"), now),
        ];
        let mut list = FreeList::from_records(&records);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop(), Some(id("c")));
        assert_eq!(list.pop(), Some(id("a")));
    }
}
