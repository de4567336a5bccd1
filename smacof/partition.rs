//! Static assignment of matrix rows to processes and to the threads inside them.
//!
//! The topology is computed once, before any worker starts, and shared read-only by
//! every component. Processes are grouped into nodes of `procs_per_node` consecutive
//! ranks; the lowest rank of each node is its lead.

use crate::types::RowRange;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("the number of data points must be positive")]
    NoPoints,
    #[error("the target dimension must be positive")]
    NoDimension,
    #[error("{what} must be positive")]
    ZeroCount { what: &'static str },
}

/// Splits `total` rows into `parts` contiguous ranges. The first `total % parts`
/// ranges receive one extra row.
pub fn partition_rows(start: usize, total: usize, parts: usize) -> Vec<RowRange> {
    let parts = parts.max(1);
    let quotient = total / parts;
    let remainder = total % parts;
    let mut cursor = start;
    (0..parts)
        .map(|part| {
            let len = quotient + usize::from(part < remainder);
            let range = RowRange::new(cursor, len);
            cursor += len;
            range
        })
        .collect()
}

/// The immutable process layout of a run.
#[derive(Debug, Clone)]
pub struct Topology {
    n_points: usize,
    dim: usize,
    process_count: usize,
    threads_per_process: usize,
    procs_per_node: usize,
    process_rows: Vec<RowRange>,
    thread_rows: Vec<Vec<RowRange>>,
}

impl Topology {
    pub fn new(
        n_points: usize,
        dim: usize,
        process_count: usize,
        threads_per_process: usize,
        procs_per_node: usize,
    ) -> Result<Self, TopologyError> {
        if n_points == 0 {
            return Err(TopologyError::NoPoints);
        }
        if dim == 0 {
            return Err(TopologyError::NoDimension);
        }
        for (value, what) in [
            (process_count, "the process count"),
            (threads_per_process, "the thread count per process"),
            (procs_per_node, "the number of processes per node"),
        ] {
            if value == 0 {
                return Err(TopologyError::ZeroCount { what });
            }
        }

        let process_rows = partition_rows(0, n_points, process_count);
        let thread_rows = process_rows
            .iter()
            .map(|rows| partition_rows(rows.start(), rows.len(), threads_per_process))
            .collect();

        Ok(Self {
            n_points,
            dim,
            process_count,
            threads_per_process,
            procs_per_node: procs_per_node.min(process_count),
            process_rows,
            thread_rows,
        })
    }

    /// A single process with `threads` workers.
    pub fn single_process(n_points: usize, dim: usize, threads: usize) -> Result<Self, TopologyError> {
        Self::new(n_points, dim, 1, threads, 1)
    }

    #[inline]
    pub fn n_points(&self) -> usize {
        self.n_points
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn process_count(&self) -> usize {
        self.process_count
    }

    #[inline]
    pub fn threads_per_process(&self) -> usize {
        self.threads_per_process
    }

    #[inline]
    pub fn procs_per_node(&self) -> usize {
        self.procs_per_node
    }

    /// Whether the node and world tiers take part in collectives at all.
    #[inline]
    pub fn is_multi_process(&self) -> bool {
        self.process_count > 1
    }

    pub fn node_count(&self) -> usize {
        self.process_count.div_ceil(self.procs_per_node)
    }

    /// Global rows owned by process `rank`.
    pub fn process_rows(&self, rank: usize) -> RowRange {
        self.process_rows[rank]
    }

    /// Global rows owned by thread `thread` of process `rank`.
    pub fn thread_rows(&self, rank: usize, thread: usize) -> RowRange {
        self.thread_rows[rank][thread]
    }

    pub fn node_of(&self, rank: usize) -> usize {
        rank / self.procs_per_node
    }

    /// Ranks living on `node`.
    pub fn node_ranks(&self, node: usize) -> Range<usize> {
        let start = node * self.procs_per_node;
        start..(start + self.procs_per_node).min(self.process_count)
    }

    pub fn procs_in_node(&self, node: usize) -> usize {
        self.node_ranks(node).len()
    }

    /// Position of `rank` among the processes of its node.
    pub fn index_in_node(&self, rank: usize) -> usize {
        rank % self.procs_per_node
    }

    pub fn is_node_lead(&self, rank: usize) -> bool {
        self.index_in_node(rank) == 0
    }

    /// Global rows owned by all processes of `node`.
    pub fn node_rows(&self, node: usize) -> RowRange {
        let ranks = self.node_ranks(node);
        let first = self.process_rows[ranks.start];
        let len = ranks.map(|rank| self.process_rows[rank].len()).sum();
        RowRange::new(first.start(), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_spreads_the_remainder_over_the_first_parts() {
        let parts = partition_rows(0, 10, 4);
        let lens: Vec<_> = parts.iter().map(RowRange::len).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
        assert_eq!(parts[3], RowRange::new(8, 2));
    }

    #[test]
    fn thread_ranges_tile_all_rows_exactly_once() {
        for (n, procs, threads, per_node) in [(17, 3, 4, 2), (5, 2, 4, 1), (64, 4, 2, 4), (3, 1, 8, 1)] {
            let topology = Topology::new(n, 2, procs, threads, per_node).unwrap();
            let mut seen = vec![0_u32; n];
            for rank in 0..procs {
                let proc_rows = topology.process_rows(rank);
                for thread in 0..threads {
                    let rows = topology.thread_rows(rank, thread);
                    assert!(rows.is_empty() || proc_rows.contains(rows.start()));
                    for row in rows.iter() {
                        seen[row] += 1;
                    }
                }
            }
            assert!(seen.iter().all(|&count| count == 1), "n={n} procs={procs} threads={threads}");
        }
    }

    #[test]
    fn nodes_group_consecutive_ranks() {
        let topology = Topology::new(20, 3, 5, 2, 2).unwrap();
        assert_eq!(topology.node_count(), 3);
        assert_eq!(topology.node_ranks(2), 4..5);
        assert_eq!(topology.procs_in_node(2), 1);
        assert!(topology.is_node_lead(2));
        assert!(!topology.is_node_lead(3));
        assert_eq!(topology.node_of(3), 1);
        assert_eq!(topology.index_in_node(3), 1);
        assert_eq!(topology.node_rows(0), RowRange::new(0, 8));
        assert_eq!(topology.node_rows(1), RowRange::new(8, 8));
        assert_eq!(topology.node_rows(2), RowRange::new(16, 4));
    }

    #[test]
    fn invalid_topologies_are_rejected() {
        assert_eq!(Topology::new(0, 2, 1, 1, 1).unwrap_err(), TopologyError::NoPoints);
        assert_eq!(Topology::new(4, 0, 1, 1, 1).unwrap_err(), TopologyError::NoDimension);
        assert!(matches!(
            Topology::new(4, 2, 1, 0, 1),
            Err(TopologyError::ZeroCount { .. })
        ));
    }
}
