// ========================================================================================
//
//                        The two-tier collective protocol
//
// ========================================================================================
//
// Every collective walks the same four phases:
//
//   LocalWrite  threads publish their partials to thread 0 (thread tier); thread 0 of
//               each process copies the process partial into its node-region slot
//   NodeSync    a world barrier makes the slots visible; the node lead combines them
//   WorldSync   node leads exchange node partials by message passing, the lead writes
//               the result back into the region, a second world barrier publishes it
//   Broadcast   thread 0 reads the result and hands it to its sibling threads
//
// With one process the middle two phases do not exist. Only thread 0 of a process ever
// touches the process tier or writes into the node region; sibling threads hand their
// partials and rows to it through the thread-group slots.

use super::process::{LocalComm, ProcessComm};
use super::shared::SharedRegion;
use super::thread::{ThreadComm, ThreadGroup};
use super::{CommError, MAX_REDUCE_LANES, Reducible, to_lane_vec};
use crate::partition::Topology;
use crate::types::RowRange;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One step of a collective operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LocalWrite,
    NodeSync,
    WorldSync,
    Broadcast,
}

const SINGLE_PROCESS: [Phase; 2] = [Phase::LocalWrite, Phase::Broadcast];
const MULTI_PROCESS: [Phase; 4] = [
    Phase::LocalWrite,
    Phase::NodeSync,
    Phase::WorldSync,
    Phase::Broadcast,
];

/// The phase sequence of a single collective call.
///
/// Every participant drives one `CollectiveOp` per call and runs its part of each phase
/// in order, which keeps the barrier pairing identical on every thread and process.
#[derive(Debug, Clone)]
pub struct CollectiveOp {
    phases: &'static [Phase],
    next: usize,
}

impl CollectiveOp {
    pub fn new(multi_process: bool) -> Self {
        let phases: &'static [Phase] = if multi_process {
            &MULTI_PROCESS
        } else {
            &SINGLE_PROCESS
        };
        Self { phases, next: 0 }
    }

    /// The phase that will be returned by the next call to `next`, if any.
    pub fn current(&self) -> Option<Phase> {
        self.phases.get(self.next).copied()
    }
}

impl Iterator for CollectiveOp {
    type Item = Phase;

    fn next(&mut self) -> Option<Phase> {
        let phase = self.current()?;
        self.next += 1;
        Some(phase)
    }
}

/// Offsets (in `f64` values) of the areas of one node's shared region.
///
/// ```text
/// | slot 0 | slot 1 | ... | result | node rows (node_rows x D) | full (N x D) |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    procs_in_node: usize,
    node_rows: RowRange,
    dim: usize,
    n_points: usize,
}

impl RegionLayout {
    pub fn for_node(topology: &Topology, node: usize) -> Self {
        Self {
            procs_in_node: topology.procs_in_node(node),
            node_rows: topology.node_rows(node),
            dim: topology.dim(),
            n_points: topology.n_points(),
        }
    }

    pub fn slot_offset(&self, index_in_node: usize) -> usize {
        index_in_node * MAX_REDUCE_LANES
    }

    pub fn result_offset(&self) -> usize {
        self.procs_in_node * MAX_REDUCE_LANES
    }

    pub fn rows_offset(&self) -> usize {
        self.result_offset() + MAX_REDUCE_LANES
    }

    /// Where `rows` (global indices inside this node) start in the node rows area.
    pub fn row_offset(&self, rows: RowRange) -> usize {
        self.rows_offset() + rows.relative_to(self.node_rows.start()).start() * self.dim
    }

    pub fn node_rows_len(&self) -> usize {
        self.node_rows.len() * self.dim
    }

    pub fn full_offset(&self) -> usize {
        self.rows_offset() + self.node_rows_len()
    }

    pub fn total_len(&self) -> usize {
        self.full_offset() + self.n_points * self.dim
    }
}

/// The node-tier resources of one process: its node's shared region and, on node
/// leads, the communicator that links the leads of all nodes.
#[derive(Debug, Clone)]
pub struct NodeResources {
    region: Arc<SharedRegion>,
    layout: RegionLayout,
    leaders: Option<Arc<dyn ProcessComm>>,
}

impl NodeResources {
    pub fn new(
        region: Arc<SharedRegion>,
        layout: RegionLayout,
        leaders: Option<Arc<dyn ProcessComm>>,
    ) -> Result<Self, CommError> {
        if region.len() < layout.total_len() {
            return Err(CommError::RegionBounds {
                offset: 0,
                len: layout.total_len(),
                capacity: region.len(),
            });
        }
        Ok(Self {
            region,
            layout,
            leaders,
        })
    }

    /// Maps the region of `node` from a file so that separate OS processes can attach
    /// to it.
    pub fn file_backed(
        topology: &Topology,
        node: usize,
        path: &Path,
        leaders: Option<Arc<dyn ProcessComm>>,
    ) -> Result<Self, CommError> {
        let layout = RegionLayout::for_node(topology, node);
        let region = SharedRegion::file_backed(path, layout.total_len())?;
        Self::new(Arc::new(region), layout, leaders)
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }
}

/// The file backing the region of `node` under `dir`.
pub fn region_path(dir: &Path, node: usize) -> PathBuf {
    dir.join(format!("damds-node{node}.region"))
}

/// Everything one process needs to take part in collectives. Shared by all of the
/// process's threads.
#[derive(Debug)]
pub struct ProcessContext {
    rank: usize,
    topology: Arc<Topology>,
    world: Arc<dyn ProcessComm>,
    node: NodeResources,
    threads: Arc<ThreadGroup>,
}

impl ProcessContext {
    pub fn new(
        rank: usize,
        topology: Arc<Topology>,
        world: Arc<dyn ProcessComm>,
        node: NodeResources,
    ) -> Arc<Self> {
        let threads = ThreadGroup::new(topology.threads_per_process());
        Arc::new(Self {
            rank,
            topology,
            world,
            node,
            threads,
        })
    }

    /// Builds the contexts of every process of `topology` inside this OS process:
    /// an in-process world communicator, one region per node, and a communicator
    /// among node leads.
    ///
    /// Without `region_dir` each node shares one anonymous mapping. With it, every
    /// process maps `region_dir/damds-node{node}.region` on its own, so the processes
    /// of a node meet only through the file.
    pub fn local_world(
        topology: Arc<Topology>,
        region_dir: Option<&Path>,
    ) -> Result<Vec<Arc<Self>>, CommError> {
        let node_count = topology.node_count();
        let mut leaders: Vec<Option<Arc<dyn ProcessComm>>> = LocalComm::group(node_count)
            .into_iter()
            .map(|comm| Some(Arc::new(comm) as Arc<dyn ProcessComm>))
            .collect();

        let mut regions = Vec::with_capacity(node_count);
        if region_dir.is_none() {
            for node in 0..node_count {
                let layout = RegionLayout::for_node(&topology, node);
                regions.push((Arc::new(SharedRegion::anonymous(layout.total_len())?), layout));
            }
        }

        let mut contexts = Vec::with_capacity(topology.process_count());
        for (rank, world) in LocalComm::group(topology.process_count()).into_iter().enumerate() {
            let node = topology.node_of(rank);
            let leader = if topology.is_node_lead(rank) {
                leaders[node].take()
            } else {
                None
            };
            let resources = match region_dir {
                Some(dir) => NodeResources::file_backed(&topology, node, &region_path(dir, node), leader)?,
                None => {
                    let (region, layout) = &regions[node];
                    NodeResources::new(Arc::clone(region), *layout, leader)?
                }
            };
            contexts.push(Self::new(rank, Arc::clone(&topology), Arc::new(world), resources));
        }
        Ok(contexts)
    }

    /// One collective handle per thread of this process.
    pub fn collectives(self: &Arc<Self>) -> Vec<Collective> {
        (0..self.threads.size())
            .map(|thread_id| Collective {
                threads: ThreadComm::new(Arc::clone(&self.threads), thread_id),
                process: Arc::clone(self),
            })
            .collect()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn is_multi_process(&self) -> bool {
        self.topology.is_multi_process()
    }

    fn index_in_node(&self) -> usize {
        self.topology.index_in_node(self.rank)
    }

    /// Breaks every barrier this process participates in.
    pub fn abort(&self, reason: &str) {
        self.threads.abort(reason);
        self.world.abort(reason);
        if let Some(leaders) = &self.node.leaders {
            leaders.abort(reason);
        }
    }
}

/// One thread's handle onto the whole collective hierarchy.
#[derive(Debug, Clone)]
pub struct Collective {
    threads: ThreadComm,
    process: Arc<ProcessContext>,
}

impl Collective {
    #[inline]
    pub fn thread_id(&self) -> usize {
        self.threads.thread_id()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.process.rank
    }

    /// Thread 0 of process 0: the only participant that logs and writes results.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.process.rank == 0 && self.threads.is_leader()
    }

    #[inline]
    pub fn topology(&self) -> &Topology {
        &self.process.topology
    }

    /// Global rows this thread computes.
    #[inline]
    pub fn rows(&self) -> RowRange {
        self.topology().thread_rows(self.process.rank, self.thread_id())
    }

    fn op(&self) -> CollectiveOp {
        CollectiveOp::new(self.process.is_multi_process())
    }

    pub fn abort(&self, reason: &str) {
        self.process.abort(reason);
    }

    /// No participant leaves until every thread of every process has arrived.
    pub fn barrier(&self) -> Result<(), CommError> {
        for phase in self.op() {
            match phase {
                Phase::LocalWrite | Phase::Broadcast => self.threads.barrier()?,
                Phase::NodeSync if self.threads.is_leader() => self.process.world.barrier()?,
                Phase::NodeSync | Phase::WorldSync => {}
            }
        }
        Ok(())
    }

    /// Combines `value` over every thread of every process; all participants receive
    /// the same total, merged in ascending thread, process and node order.
    pub fn all_reduce<T: Reducible>(&self, value: &T) -> Result<T, CommError> {
        let process = &self.process;
        let node = &process.node;
        let layout = node.layout;
        let multi = process.is_multi_process();
        if multi && T::LANES > MAX_REDUCE_LANES {
            return Err(CommError::LengthMismatch {
                expected: MAX_REDUCE_LANES,
                found: T::LANES,
            });
        }

        let mut partial: Option<T> = None;
        let mut node_partial: Option<T> = None;
        for phase in self.op() {
            match phase {
                Phase::LocalWrite => {
                    partial = self.threads.reduce_to_leader(value)?;
                    if let (true, Some(total)) = (multi, &partial) {
                        let slot = layout.slot_offset(process.index_in_node());
                        // SAFETY: only this process's thread 0 writes its slot, and the
                        // lead reads it after the world barrier of the next phase.
                        unsafe { node.region.write(slot, &to_lane_vec(total))? };
                    }
                }
                Phase::NodeSync => {
                    if self.threads.is_leader() {
                        process.world.barrier()?;
                        if node.leaders.is_some() {
                            node_partial = Some(self.read_node_slots::<T>()?);
                        }
                    }
                }
                Phase::WorldSync => {
                    if self.threads.is_leader() {
                        if let (Some(leaders), Some(local)) = (&node.leaders, &node_partial) {
                            let total = gather_and_combine(leaders.as_ref(), local)?;
                            // SAFETY: readers of the result area wait for the world
                            // barrier below.
                            unsafe {
                                node.region
                                    .write(layout.result_offset(), &to_lane_vec(&total))?
                            };
                        }
                        process.world.barrier()?;
                        let mut lanes = vec![0.0; T::LANES];
                        // SAFETY: the result was published by the barrier above and is
                        // not rewritten before the next collective's NodeSync barrier.
                        unsafe { node.region.read(layout.result_offset(), &mut lanes)? };
                        partial = Some(T::read_lanes(&lanes));
                    }
                }
                Phase::Broadcast => return self.threads.broadcast_from_leader(partial.take()),
            }
        }
        Err(CommError::Transport("collective ended before its broadcast phase".into()))
    }

    fn read_node_slots<T: Reducible>(&self) -> Result<T, CommError> {
        let node = &self.process.node;
        let mut lanes = vec![0.0; T::LANES];
        let mut total: Option<T> = None;
        for index in 0..node.layout.procs_in_node {
            // SAFETY: every slot was written before the world barrier that precedes this
            // read, and is not rewritten until the next collective's LocalWrite.
            unsafe { node.region.read(node.layout.slot_offset(index), &mut lanes)? };
            let value = T::read_lanes(&lanes);
            match total.as_mut() {
                Some(acc) => acc.combine(&value),
                None => total = Some(value),
            }
        }
        total.ok_or_else(|| CommError::Transport("node without processes".into()))
    }

    /// Makes every participant's copy of the row-major `N x D` array `data` agree: on
    /// return each thread's rows hold what that thread had computed for them.
    pub fn merge_rows(&self, data: &mut [f64]) -> Result<(), CommError> {
        let topology = self.topology();
        let dim = topology.dim();
        let expected = topology.n_points() * dim;
        if data.len() != expected {
            return Err(CommError::LengthMismatch {
                expected,
                found: data.len(),
            });
        }

        let process = &self.process;
        let node = &process.node;
        let layout = node.layout;
        let multi = process.is_multi_process();
        for phase in self.op() {
            match phase {
                Phase::LocalWrite => {
                    let rows = self.rows();
                    self.threads.publish(&data[rows.start() * dim..rows.end() * dim])?;
                    if multi && self.threads.is_leader() {
                        let mut written = Ok(());
                        self.threads.for_each_published(|thread, values| {
                            let rows = topology.thread_rows(process.rank, thread);
                            if written.is_ok() {
                                // SAFETY: only this process's thread 0 writes its rows of
                                // the node area; the lead reads them after NodeSync.
                                written = unsafe { node.region.write(layout.row_offset(rows), values) };
                            }
                        });
                        written?;
                    }
                }
                Phase::NodeSync => {
                    if self.threads.is_leader() {
                        process.world.barrier()?;
                    }
                }
                Phase::WorldSync => {
                    if self.threads.is_leader() {
                        if let Some(leaders) = &node.leaders {
                            let mut local = vec![0.0; layout.node_rows_len()];
                            // SAFETY: node rows were published by the NodeSync barrier.
                            unsafe { node.region.read(layout.rows_offset(), &mut local)? };
                            let counts: Vec<usize> = (0..topology.node_count())
                                .map(|n| topology.node_rows(n).len() * dim)
                                .collect();
                            let mut full = vec![0.0; expected];
                            leaders.all_gather_v(&local, &counts, &mut full)?;
                            // SAFETY: readers of the full area wait for the barrier below.
                            unsafe { node.region.write(layout.full_offset(), &full)? };
                        }
                        process.world.barrier()?;
                    }
                }
                Phase::Broadcast => {
                    self.threads.barrier()?;
                    if multi {
                        // SAFETY: published by the WorldSync barrier; rewritten only after
                        // the next collective's NodeSync barrier.
                        unsafe { node.region.read(layout.full_offset(), data)? };
                    } else {
                        self.threads.for_each_published(|thread, values| {
                            let start = topology.thread_rows(process.rank, thread).start() * dim;
                            data[start..start + values.len()].copy_from_slice(values);
                        });
                    }
                    // Slots and region stay untouched until everyone has copied.
                    self.threads.barrier()?;
                }
            }
        }
        Ok(())
    }

    /// Copies `data` from thread 0 of process 0 to every participant.
    pub fn broadcast(&self, data: &mut [f64]) -> Result<(), CommError> {
        for phase in self.op() {
            match phase {
                Phase::LocalWrite | Phase::NodeSync => {}
                Phase::WorldSync => {
                    if self.threads.is_leader() {
                        self.process.world.broadcast(data, 0)?;
                    }
                }
                Phase::Broadcast => self.threads.broadcast_slice(data)?,
            }
        }
        Ok(())
    }
}

fn gather_and_combine<T: Reducible>(leaders: &dyn ProcessComm, local: &T) -> Result<T, CommError> {
    let size = leaders.size();
    let counts = vec![T::LANES; size];
    let mut gathered = vec![0.0; T::LANES * size];
    leaders.all_gather_v(&to_lane_vec(local), &counts, &mut gathered)?;
    let mut total = T::read_lanes(&gathered[..T::LANES]);
    for block in gathered[T::LANES..].chunks_exact(T::LANES.max(1)) {
        total.combine(&T::read_lanes(block));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_world<R: Send>(
        topology: Topology,
        f: impl Fn(Collective) -> R + Sync,
    ) -> Vec<(usize, usize, R)> {
        run_world_in(topology, None, f)
    }

    fn run_world_in<R: Send>(
        topology: Topology,
        region_dir: Option<&Path>,
        f: impl Fn(Collective) -> R + Sync,
    ) -> Vec<(usize, usize, R)> {
        let contexts = ProcessContext::local_world(Arc::new(topology), region_dir).unwrap();
        let collectives: Vec<Collective> = contexts.iter().flat_map(|c| c.collectives()).collect();
        thread::scope(|s| {
            let handles: Vec<_> = collectives
                .into_iter()
                .map(|collective| {
                    let f = &f;
                    s.spawn(move || {
                        let (rank, thread) = (collective.rank(), collective.thread_id());
                        (rank, thread, f(collective))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn single_process_skips_the_node_and_world_phases() {
        let phases: Vec<_> = CollectiveOp::new(false).collect();
        assert_eq!(phases, vec![Phase::LocalWrite, Phase::Broadcast]);
        let phases: Vec<_> = CollectiveOp::new(true).collect();
        assert_eq!(
            phases,
            vec![
                Phase::LocalWrite,
                Phase::NodeSync,
                Phase::WorldSync,
                Phase::Broadcast
            ]
        );
    }

    #[test]
    fn op_reports_its_current_phase() {
        let mut op = CollectiveOp::new(true);
        assert_eq!(op.current(), Some(Phase::LocalWrite));
        op.next();
        op.next();
        assert_eq!(op.current(), Some(Phase::WorldSync));
        op.next();
        op.next();
        assert_eq!(op.current(), None);
    }

    #[test]
    fn region_layout_areas_do_not_overlap() {
        let topology = Topology::new(10, 3, 3, 2, 2).unwrap();
        let layout = RegionLayout::for_node(&topology, 0);
        assert_eq!(layout.result_offset(), 2 * MAX_REDUCE_LANES);
        assert_eq!(layout.rows_offset(), 3 * MAX_REDUCE_LANES);
        // node 0 holds ranks 0 and 1: rows 0..4 and 4..7
        assert_eq!(layout.node_rows_len(), 7 * 3);
        assert_eq!(layout.full_offset(), layout.rows_offset() + 21);
        assert_eq!(layout.total_len(), layout.full_offset() + 30);
        assert_eq!(
            layout.row_offset(topology.process_rows(1)),
            layout.rows_offset() + 4 * 3
        );
    }

    #[test]
    fn all_reduce_agrees_across_every_tier_shape() {
        for (procs, threads, per_node) in [(1, 4, 1), (4, 1, 1), (2, 2, 2), (3, 2, 1), (4, 2, 2)] {
            let topology = Topology::new(16, 2, procs, threads, per_node).unwrap();
            let results = run_world(topology, |collective| {
                let mine = [1.0, (collective.rank() * 10 + collective.thread_id()) as f64];
                collective.all_reduce(&mine).unwrap()
            });
            let expected_count = (procs * threads) as f64;
            let expected_sum: f64 = (0..procs)
                .flat_map(|r| (0..threads).map(move |t| (r * 10 + t) as f64))
                .sum();
            for (_, _, total) in results {
                assert_eq!(total, [expected_count, expected_sum]);
            }
        }
    }

    #[test]
    fn repeated_reductions_stay_in_step() {
        let topology = Topology::new(8, 1, 3, 2, 2).unwrap();
        let results = run_world(topology, |collective| {
            (0..25)
                .map(|round| collective.all_reduce(&(round as f64)).unwrap())
                .collect::<Vec<_>>()
        });
        for (_, _, totals) in results {
            for (round, total) in totals.into_iter().enumerate() {
                assert_eq!(total, 6.0 * round as f64);
            }
        }
    }

    #[test]
    fn merge_rows_assembles_every_threads_rows() {
        for (procs, threads, per_node) in [(1, 3, 1), (3, 1, 1), (2, 2, 1), (4, 2, 2), (3, 3, 2)] {
            let n = 11;
            let dim = 2;
            let topology = Topology::new(n, dim, procs, threads, per_node).unwrap();
            let results = run_world(topology, |collective| {
                let mut data = vec![-1.0; n * dim];
                for row in collective.rows().iter() {
                    data[row * dim] = row as f64;
                    data[row * dim + 1] = (row * row) as f64;
                }
                // a second merge reuses the region areas
                collective.merge_rows(&mut data).unwrap();
                collective.merge_rows(&mut data).unwrap();
                data
            });
            for (_, _, data) in results {
                for row in 0..n {
                    assert_eq!(data[row * dim], row as f64);
                    assert_eq!(data[row * dim + 1], (row * row) as f64);
                }
            }
        }
    }

    #[test]
    fn file_backed_nodes_meet_through_their_region_files() {
        let dir = tempfile::tempdir().unwrap();
        let (n, dim) = (9, 2);
        let topology = Topology::new(n, dim, 4, 2, 2).unwrap();
        let results = run_world_in(topology, Some(dir.path()), |collective| {
            let mut data = vec![0.0; n * dim];
            for row in collective.rows().iter() {
                data[row * dim] = row as f64;
                data[row * dim + 1] = -(row as f64);
            }
            collective.merge_rows(&mut data).unwrap();
            let total = collective.all_reduce(&(collective.rank() as f64 + 1.0)).unwrap();
            (data, total)
        });
        assert_eq!(results.len(), 8);
        for (_, _, (data, total)) in results {
            // two threads per rank: 2 * (1 + 2 + 3 + 4)
            assert_eq!(total, 20.0);
            for row in 0..n {
                assert_eq!(data[row * dim], row as f64);
                assert_eq!(data[row * dim + 1], -(row as f64));
            }
        }
        for node in 0..2 {
            assert!(region_path(dir.path(), node).exists(), "node {node} region missing");
        }
        assert!(!region_path(dir.path(), 2).exists());
    }

    #[test]
    fn merge_rows_rejects_wrong_length() {
        let topology = Topology::single_process(4, 2, 1).unwrap();
        let results = run_world(topology, |collective| {
            let mut data = vec![0.0; 5];
            collective.merge_rows(&mut data)
        });
        assert!(matches!(
            results[0].2,
            Err(CommError::LengthMismatch {
                expected: 8,
                found: 5
            })
        ));
    }

    #[test]
    fn broadcast_reaches_every_participant() {
        let topology = Topology::new(6, 2, 3, 2, 2).unwrap();
        let results = run_world(topology, |collective| {
            let mut data = if collective.is_root() {
                vec![3.0, 1.0, 4.0]
            } else {
                vec![0.0; 3]
            };
            collective.broadcast(&mut data).unwrap();
            collective.barrier().unwrap();
            data
        });
        assert_eq!(results.len(), 6);
        for (_, _, data) in results {
            assert_eq!(data, vec![3.0, 1.0, 4.0]);
        }
    }

    #[test]
    fn abort_in_one_process_releases_all_others() {
        let topology = Topology::new(8, 2, 2, 2, 1).unwrap();
        let results = run_world(topology, |collective| {
            if collective.rank() == 1 && collective.thread_id() == 1 {
                collective.abort("rank 1 thread 1 could not read its rows");
                return false;
            }
            let failed = collective.all_reduce(&1.0).is_err();
            if failed {
                collective.abort("peer failure");
            }
            failed
        });
        for (rank, thread, failed) in results {
            if !(rank == 1 && thread == 1) {
                assert!(failed, "rank {rank} thread {thread} was not released");
            }
        }
    }
}
