use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// An item waiting to be dispatched.
#[derive(Debug, PartialEq, Eq)]
struct Pending {
    priority: i64,
    seq: u64,
    epoch: u64,
    id: String,
}

impl Ord for Pending {
    /// Higher priorities first, and first-in-first-out within the same priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The ids waiting for a free slot, ordered by priority.
///
/// Entries are tagged with the epoch of the item they were queued for. An entry whose item was
/// cleared or replaced in the meantime stays in the heap until it is popped, where the caller is
/// expected to skip it.
#[derive(Debug, Default)]
pub(super) struct DispatchQueue {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
}

impl DispatchQueue {
    pub fn push(&mut self, id: String, epoch: u64, priority: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Pending {
            priority,
            seq,
            epoch,
            id,
        });
    }

    /// Removes the next id to dispatch, along with the epoch it was queued for.
    pub fn pop(&mut self) -> Option<(String, u64)> {
        self.heap.pop().map(|pending| (pending.id, pending.epoch))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Bounds the number of attempts running at the same time.
///
/// Slots are keyed by item epoch, so an attempt for a cleared item keeps its slot until it has
/// actually wound down, even when the same id is loaded again in the meantime.
#[derive(Debug)]
pub(super) struct ConcurrencyGate {
    max_concurrent: usize,
    active: HashMap<u64, String>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            active: HashMap::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max_concurrent
    }

    pub fn acquire(&mut self, epoch: u64, id: &str) {
        debug_assert!(self.has_capacity());
        self.active.insert(epoch, id.to_owned());
    }

    /// Frees the slot held for `epoch`, returning whether it was held.
    pub fn release(&mut self, epoch: u64) -> bool {
        self.active.remove(&epoch).is_some()
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }
}
