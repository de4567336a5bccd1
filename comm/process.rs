// ========================================================================================
//
//                        Process tier: the message-passing seam
//
// ========================================================================================
//
// The solver never talks to a transport directly. It needs four primitives from the
// process tier (barrier, broadcast, variable-count all-gather and abort), expressed by
// `ProcessComm`. `LocalComm` implements them for process groups that live inside one
// OS process: every ordered pair of ranks gets its own channel, so messages of
// consecutive collectives can never be matched against the wrong operation.

use super::barrier::CyclicBarrier;
use super::CommError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How often a rank blocked on a receive re-checks whether the group was aborted.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Collective primitives among the processes of one communicator.
///
/// Every rank of the communicator must call the same collectives in the same order.
pub trait ProcessComm: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn barrier(&self) -> Result<(), CommError>;

    /// Overwrites `data` on every rank with the contents of `data` on `root`.
    fn broadcast(&self, data: &mut [f64], root: usize) -> Result<(), CommError>;

    /// Concatenates every rank's `local` block, in rank order, into `out`.
    /// `counts[r]` is the length of rank `r`'s block.
    fn all_gather_v(&self, local: &[f64], counts: &[usize], out: &mut [f64])
    -> Result<(), CommError>;

    /// Makes every pending and future collective on this communicator fail.
    fn abort(&self, reason: &str);

    /// Element-wise sum over ranks, accumulated in rank order.
    fn all_reduce_sum(&self, data: &mut [f64]) -> Result<(), CommError> {
        let size = self.size();
        let counts = vec![data.len(); size];
        let mut gathered = vec![0.0; data.len() * size];
        self.all_gather_v(data, &counts, &mut gathered)?;
        data.fill(0.0);
        for block in gathered.chunks_exact(data.len().max(1)).take(size) {
            for (acc, value) in data.iter_mut().zip(block) {
                *acc += *value;
            }
        }
        Ok(())
    }
}

struct Fabric {
    barrier: CyclicBarrier,
}

/// In-process implementation of [`ProcessComm`].
pub struct LocalComm {
    rank: usize,
    size: usize,
    fabric: Arc<Fabric>,
    // outgoing[to] and incoming[from]
    outgoing: Vec<Sender<Vec<f64>>>,
    incoming: Vec<Receiver<Vec<f64>>>,
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl LocalComm {
    /// Builds a communicator of `size` ranks and returns one handle per rank.
    pub fn group(size: usize) -> Vec<LocalComm> {
        let size = size.max(1);
        let fabric = Arc::new(Fabric {
            barrier: CyclicBarrier::new(size),
        });

        // channels[from][to]
        let mut senders: Vec<Vec<Option<Sender<Vec<f64>>>>> = Vec::with_capacity(size);
        let mut receivers: Vec<Vec<Option<Receiver<Vec<f64>>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        for from in 0..size {
            let mut row = Vec::with_capacity(size);
            for to in 0..size {
                let (tx, rx) = unbounded();
                row.push(Some(tx));
                receivers[to][from] = Some(rx);
            }
            senders.push(row);
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| LocalComm {
                rank,
                size,
                fabric: Arc::clone(&fabric),
                outgoing: outgoing.into_iter().flatten().collect(),
                incoming: incoming.into_iter().flatten().collect(),
            })
            .collect()
    }

    fn send(&self, to: usize, payload: Vec<f64>) -> Result<(), CommError> {
        self.outgoing[to]
            .send(payload)
            .map_err(|_| CommError::Transport(format!("rank {to} is no longer receiving")))
    }

    fn receive(&self, from: usize) -> Result<Vec<f64>, CommError> {
        loop {
            match self.incoming[from].recv_timeout(ABORT_POLL_INTERVAL) {
                Ok(payload) => return Ok(payload),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(reason) = self.fabric.barrier.broken_reason() {
                        return Err(CommError::BarrierBroken { reason });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Transport(format!(
                        "rank {from} disconnected during a collective"
                    )));
                }
            }
        }
    }
}

impl ProcessComm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.fabric.barrier.wait().map(|_| ())
    }

    fn broadcast(&self, data: &mut [f64], root: usize) -> Result<(), CommError> {
        if root >= self.size {
            return Err(CommError::Transport(format!(
                "broadcast root {root} outside communicator of size {}",
                self.size
            )));
        }
        if self.rank == root {
            for to in (0..self.size).filter(|&to| to != root) {
                self.send(to, data.to_vec())?;
            }
            return Ok(());
        }
        let payload = self.receive(root)?;
        if payload.len() != data.len() {
            return Err(CommError::LengthMismatch {
                expected: data.len(),
                found: payload.len(),
            });
        }
        data.copy_from_slice(&payload);
        Ok(())
    }

    fn all_gather_v(
        &self,
        local: &[f64],
        counts: &[usize],
        out: &mut [f64],
    ) -> Result<(), CommError> {
        if counts.len() != self.size {
            return Err(CommError::LengthMismatch {
                expected: self.size,
                found: counts.len(),
            });
        }
        if local.len() != counts[self.rank] {
            return Err(CommError::LengthMismatch {
                expected: counts[self.rank],
                found: local.len(),
            });
        }
        let total: usize = counts.iter().sum();
        if out.len() != total {
            return Err(CommError::LengthMismatch {
                expected: total,
                found: out.len(),
            });
        }

        for to in (0..self.size).filter(|&to| to != self.rank) {
            self.send(to, local.to_vec())?;
        }

        let mut offset = 0;
        for (from, &count) in counts.iter().enumerate() {
            let block = &mut out[offset..offset + count];
            if from == self.rank {
                block.copy_from_slice(local);
            } else {
                let payload = self.receive(from)?;
                if payload.len() != count {
                    return Err(CommError::LengthMismatch {
                        expected: count,
                        found: payload.len(),
                    });
                }
                block.copy_from_slice(&payload);
            }
            offset += count;
        }
        Ok(())
    }

    fn abort(&self, reason: &str) {
        self.fabric.barrier.abort(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_world<R: Send>(size: usize, f: impl Fn(LocalComm) -> R + Sync) -> Vec<R> {
        let comms = LocalComm::group(size);
        thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    s.spawn(move || f(comm))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_gather_v_concatenates_in_rank_order() {
        let results = run_world(3, |comm| {
            let counts = [1, 2, 3];
            let local = vec![comm.rank() as f64; counts[comm.rank()]];
            let mut out = vec![0.0; 6];
            comm.all_gather_v(&local, &counts, &mut out).unwrap();
            out
        });
        for out in results {
            assert_eq!(out, vec![0.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn back_to_back_collectives_keep_their_messages_apart() {
        let results = run_world(4, |comm| {
            let mut sums = Vec::new();
            for round in 0..20 {
                let mut data = vec![(comm.rank() * round) as f64];
                comm.all_reduce_sum(&mut data).unwrap();
                sums.push(data[0]);
            }
            sums
        });
        for sums in results {
            for (round, sum) in sums.into_iter().enumerate() {
                assert_eq!(sum, (6 * round) as f64);
            }
        }
    }

    #[test]
    fn broadcast_from_non_zero_root() {
        let results = run_world(3, |comm| {
            let mut data = if comm.rank() == 2 {
                vec![4.0, 5.0]
            } else {
                vec![0.0, 0.0]
            };
            comm.broadcast(&mut data, 2).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, vec![4.0, 5.0]);
        }
    }

    #[test]
    fn abort_releases_a_rank_waiting_for_data() {
        let comms = LocalComm::group(2);
        thread::scope(|s| {
            let waiting = s.spawn(|| {
                let mut data = vec![0.0];
                comms[1].broadcast(&mut data, 0)
            });
            comms[0].abort("rank 0 failed to read its distances");
            assert!(waiting.join().unwrap().is_err());
        });
    }
}
