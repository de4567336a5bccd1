// ========================================================================================
//
//                           A reusable, breakable cyclic barrier
//
// ========================================================================================
//
// `std::sync::Barrier` cannot be broken: if one participant fails, every sibling waits
// forever. A collective that loses a participant is fatal for the whole run, so the
// barrier used by both tiers carries an abort flag that wakes all waiters with an error.

use super::CommError;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    broken: Option<String>,
}

/// A cyclic barrier for a fixed number of parties.
///
/// Every call to [`CyclicBarrier::wait`] blocks until `parties` callers have arrived,
/// after which the barrier resets for the next generation. Once [`CyclicBarrier::abort`]
/// has been called, all current and future waiters fail with
/// [`CommError::BarrierBroken`].
#[derive(Debug)]
pub struct CyclicBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl CyclicBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                broken: None,
            }),
            released: Condvar::new(),
        }
    }

    #[inline]
    pub fn parties(&self) -> usize {
        self.parties
    }

    // A poisoned lock only means another participant panicked while holding it. The
    // state itself is a pair of counters and stays coherent, and that participant's
    // guard breaks the barrier on its way out.
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until all parties have arrived. Returns `true` for exactly one caller per
    /// generation (the last to arrive).
    pub fn wait(&self) -> Result<bool, CommError> {
        let mut state = self.lock();
        if let Some(reason) = &state.broken {
            return Err(CommError::BarrierBroken {
                reason: reason.clone(),
            });
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(true);
        }

        while state.generation == generation && state.broken.is_none() {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        // The generation may have completed right before someone aborted; that wait
        // still succeeded.
        if state.generation == generation {
            if let Some(reason) = &state.broken {
                return Err(CommError::BarrierBroken {
                    reason: reason.clone(),
                });
            }
        }
        Ok(false)
    }

    /// Breaks the barrier. The first reason recorded wins.
    pub fn abort(&self, reason: &str) {
        let mut state = self.lock();
        if state.broken.is_none() {
            state.broken = Some(reason.to_string());
        }
        self.released.notify_all();
    }

    pub fn is_broken(&self) -> bool {
        self.lock().broken.is_some()
    }

    pub fn broken_reason(&self) -> Option<String> {
        self.lock().broken.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn barrier_is_reusable_across_generations() {
        let barrier = Arc::new(CyclicBarrier::new(4));
        let counter = Arc::new(AtomicUsize::new(0));

        thread::scope(|s| {
            for _ in 0..4 {
                let barrier = Arc::clone(&barrier);
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    for round in 0..10 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait().unwrap();
                        // Every party incremented before anyone got past the barrier.
                        assert!(counter.load(Ordering::SeqCst) >= (round + 1) * 4);
                        barrier.wait().unwrap();
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn exactly_one_leader_per_generation() {
        let barrier = Arc::new(CyclicBarrier::new(3));
        let leaders = Arc::new(AtomicUsize::new(0));

        thread::scope(|s| {
            for _ in 0..3 {
                let barrier = Arc::clone(&barrier);
                let leaders = Arc::clone(&leaders);
                s.spawn(move || {
                    if barrier.wait().unwrap() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_wakes_blocked_waiters() {
        let barrier = Arc::new(CyclicBarrier::new(3));

        thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    s.spawn(move || barrier.wait())
                })
                .collect();

            while barrier.lock().arrived < 2 {
                thread::yield_now();
            }
            barrier.abort("worker 2 failed");

            for handle in handles {
                let result = handle.join().unwrap();
                assert!(matches!(result, Err(CommError::BarrierBroken { .. })));
            }
        });

        assert!(barrier.is_broken());
        assert!(barrier.wait().is_err());
    }

    #[test]
    fn single_party_never_blocks() {
        let barrier = CyclicBarrier::new(1);
        assert!(barrier.wait().unwrap());
        assert!(barrier.wait().unwrap());
        assert_eq!(barrier.parties(), 1);
    }
}
