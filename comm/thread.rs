// ========================================================================================
//
//                        Thread-group communicator (the innermost tier)
//
// ========================================================================================
//
// All threads of one process share a `ThreadGroup`. Every operation follows the same
// discipline: each thread writes only its own slot, a barrier publishes the slots,
// thread 0 reads them, and a second barrier publishes thread 0's answer through the
// dedicated broadcast slot. The slot mutexes are never contended; they exist so the
// hand-off stays in safe code.

use super::barrier::CyclicBarrier;
use super::{CommError, Reducible};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// State shared by every thread of one process.
#[derive(Debug)]
pub struct ThreadGroup {
    barrier: CyclicBarrier,
    slots: Vec<Mutex<Vec<f64>>>,
    broadcast: Mutex<Vec<f64>>,
}

impl ThreadGroup {
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            barrier: CyclicBarrier::new(size),
            slots: (0..size).map(|_| Mutex::new(Vec::new())).collect(),
            broadcast: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Breaks the group barrier so every sibling fails out of its next collective.
    pub fn abort(&self, reason: &str) {
        self.barrier.abort(reason);
    }
}

fn lock(slot: &Mutex<Vec<f64>>) -> MutexGuard<'_, Vec<f64>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One thread's handle onto its [`ThreadGroup`].
#[derive(Debug, Clone)]
pub struct ThreadComm {
    group: Arc<ThreadGroup>,
    thread_id: usize,
}

impl ThreadComm {
    pub fn new(group: Arc<ThreadGroup>, thread_id: usize) -> Self {
        debug_assert!(thread_id < group.size());
        Self { group, thread_id }
    }

    /// Creates one handle per thread of a fresh group.
    pub fn group(size: usize) -> Vec<Self> {
        let group = ThreadGroup::new(size);
        (0..group.size())
            .map(|thread_id| Self::new(Arc::clone(&group), thread_id))
            .collect()
    }

    #[inline]
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.group.size()
    }

    /// Thread 0 is the thread that talks to the outer tiers.
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.thread_id == 0
    }

    pub fn barrier(&self) -> Result<(), CommError> {
        self.group.barrier.wait().map(|_| ())
    }

    pub fn abort(&self, reason: &str) {
        self.group.abort(reason);
    }

    /// Writes this thread's partial into its slot and, on thread 0, combines every
    /// slot in thread order. Non-leaders receive `None`.
    pub fn reduce_to_leader<T: Reducible>(&self, value: &T) -> Result<Option<T>, CommError> {
        {
            let mut slot = lock(&self.group.slots[self.thread_id]);
            slot.clear();
            slot.resize(T::LANES, 0.0);
            value.write_lanes(&mut slot);
        }
        self.barrier()?;

        if !self.is_leader() {
            return Ok(None);
        }
        let mut total = T::read_lanes(&lock(&self.group.slots[0]));
        for slot in &self.group.slots[1..] {
            total.combine(&T::read_lanes(&lock(slot)));
        }
        Ok(Some(total))
    }

    /// Hands thread 0's value to every thread. Thread 0 must pass `Some`.
    ///
    /// Callers must already be past a group barrier that follows the previous read
    /// of the broadcast slot; [`ThreadComm::reduce_to_leader`] provides one.
    pub fn broadcast_from_leader<T: Reducible>(&self, value: Option<T>) -> Result<T, CommError> {
        if self.is_leader() {
            let value = value.ok_or_else(|| {
                CommError::Transport("thread 0 reached a broadcast without a value".into())
            })?;
            let mut slot = lock(&self.group.broadcast);
            slot.clear();
            slot.resize(T::LANES, 0.0);
            value.write_lanes(&mut slot);
        }
        self.barrier()?;
        let slot = lock(&self.group.broadcast);
        if slot.len() != T::LANES {
            return Err(CommError::LengthMismatch {
                expected: T::LANES,
                found: slot.len(),
            });
        }
        Ok(T::read_lanes(&slot))
    }

    /// Sum across threads, result on every thread.
    pub fn all_reduce<T: Reducible>(&self, value: &T) -> Result<T, CommError> {
        let partial = self.reduce_to_leader(value)?;
        self.broadcast_from_leader(partial)
    }

    /// Writes `values` into this thread's slot, then waits until every sibling has
    /// published too. The slots stay readable until the caller's next group barrier.
    pub fn publish(&self, values: &[f64]) -> Result<(), CommError> {
        {
            let mut slot = lock(&self.group.slots[self.thread_id]);
            slot.clear();
            slot.extend_from_slice(values);
        }
        self.barrier()
    }

    /// Visits the slots written by [`ThreadComm::publish`] in thread order.
    pub fn for_each_published(&self, mut visit: impl FnMut(usize, &[f64])) {
        for (thread_id, slot) in self.group.slots.iter().enumerate() {
            visit(thread_id, &lock(slot));
        }
    }

    /// Copies thread 0's `data` into every other thread's `data`.
    pub fn broadcast_slice(&self, data: &mut [f64]) -> Result<(), CommError> {
        // Nobody may still be reading the broadcast slot from an earlier operation.
        self.barrier()?;
        if self.is_leader() {
            let mut slot = lock(&self.group.broadcast);
            slot.clear();
            slot.extend_from_slice(data);
        }
        self.barrier()?;
        if !self.is_leader() {
            let slot = lock(&self.group.broadcast);
            if slot.len() != data.len() {
                return Err(CommError::LengthMismatch {
                    expected: data.len(),
                    found: slot.len(),
                });
            }
            data.copy_from_slice(&slot);
        }
        Ok(())
    }
}
