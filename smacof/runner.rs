//! Runs a whole world of workers inside one OS process.
//!
//! Every simulated process gets its own thread group, every node its own shared region,
//! and the process tier is carried by in-memory channels. A worker that fails aborts the
//! world so that its peers leave their barriers instead of waiting forever.

use crate::anneal::{AnnealOutcome, Worker};
use crate::comm::{Collective, ProcessContext};
use crate::config::SolverConfig;
use crate::io::{InputError, InputSet};
use crate::timing::{AnnealObserver, NoopObserver};
use crate::types::SmacofError;
use log::{error, info};
use std::sync::Arc;
use std::thread;

/// Aborts the world if the owning worker unwinds.
struct AbortOnPanic<'c>(&'c Collective);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort("worker panicked");
        }
    }
}

fn run_worker(
    collective: Collective,
    config: &SolverConfig,
    inputs: &InputSet,
    observer: &mut dyn AnnealObserver,
) -> Result<AnnealOutcome, SmacofError> {
    let guard = AbortOnPanic(&collective);
    let result = inputs
        .store(collective.rows())
        .map_err(SmacofError::from)
        .and_then(|store| Worker::new(collective.clone(), config, store, observer).run());
    if let Err(err) = &result {
        guard.0.abort(&err.to_string());
    }
    result
}

/// Runs the configured topology on local threads and returns the root's outcome.
///
/// `observer` receives the root worker's progress.
pub fn run_local(
    config: &SolverConfig,
    inputs: &InputSet,
    observer: &mut (dyn AnnealObserver + Send),
) -> Result<AnnealOutcome, SmacofError> {
    config.validate()?;
    let topology = Arc::new(config.topology()?);
    let found = inputs.distances.n_points();
    if found != topology.n_points() {
        return Err(InputError::SourceSize {
            expected: topology.n_points(),
            found,
        }
        .into());
    }
    info!(
        "Running {} points into {} dimensions on {} processes x {} threads ({} per node)",
        topology.n_points(),
        topology.dim(),
        topology.process_count(),
        topology.threads_per_process(),
        topology.procs_per_node()
    );

    if let Some(dir) = &config.shared_region_dir {
        info!("Node regions mapped from files under {}", dir.display());
    }
    let contexts = ProcessContext::local_world(Arc::clone(&topology), config.shared_region_dir.as_deref())?;
    let collectives: Vec<Collective> = contexts.iter().flat_map(|c| c.collectives()).collect();
    let abort_all = |reason: &str| {
        for context in &contexts {
            context.abort(reason);
        }
    };

    let mut observer = Some(observer);
    let results: Vec<(usize, usize, Result<AnnealOutcome, SmacofError>)> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(collectives.len());
        let mut spawn_error = None;
        for collective in collectives {
            let (rank, thread_id) = (collective.rank(), collective.thread_id());
            let root_observer = if collective.is_root() { observer.take() } else { None };
            let spawned = thread::Builder::new()
                .name(format!("damds-p{rank}-t{thread_id}"))
                .spawn_scoped(s, move || match root_observer {
                    Some(observer) => run_worker(collective, config, inputs, observer),
                    None => run_worker(collective, config, inputs, &mut NoopObserver),
                });
            match spawned {
                Ok(handle) => handles.push((rank, thread_id, handle)),
                Err(err) => {
                    abort_all("failed to start every worker");
                    spawn_error = Some(err);
                    break;
                }
            }
        }

        let mut results: Vec<_> = handles
            .into_iter()
            .map(|(rank, thread_id, handle)| {
                let result = handle.join().unwrap_or_else(|_| {
                    abort_all("worker panicked");
                    Err(SmacofError::WorkerPanicked {
                        rank,
                        thread: thread_id,
                    })
                });
                (rank, thread_id, result)
            })
            .collect();
        if let Some(err) = spawn_error {
            results.push((0, 0, Err(SmacofError::Spawn(err))));
        }
        results
    });

    pick_outcome(results)
}

/// The root's outcome when every worker succeeded, otherwise the first root-cause error.
fn pick_outcome(
    results: Vec<(usize, usize, Result<AnnealOutcome, SmacofError>)>,
) -> Result<AnnealOutcome, SmacofError> {
    let mut root = None;
    let mut primary = None;
    let mut secondary = None;
    for (rank, thread_id, result) in results {
        match result {
            Ok(outcome) => {
                if rank == 0 && thread_id == 0 {
                    root = Some(outcome);
                }
            }
            Err(err) if err.is_secondary() => {
                secondary.get_or_insert(err);
            }
            Err(err) => {
                error!("Worker {rank}.{thread_id} failed: {err}");
                primary.get_or_insert(err);
            }
        }
    }
    if let Some(err) = primary.or(secondary) {
        return Err(err);
    }
    root.ok_or(SmacofError::WorkerPanicked { rank: 0, thread: 0 })
}
