use damds::timing::StressTrace;
use damds::{AnnealOutcome, InputSet, SolverConfig, run_local};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tempfile::tempdir;

const N: usize = 24;
const DIM: usize = 3;

fn inputs() -> InputSet {
    let mut rng = StdRng::seed_from_u64(2024);
    let points: Vec<[f64; DIM]> = (0..N)
        .map(|_| [rng.sample(Standard), rng.sample(Standard), rng.sample(Standard)])
        .collect();
    let mut values = vec![0.0; N * N];
    for i in 0..N {
        for j in 0..N {
            let squared: f64 = (0..DIM).map(|d| (points[i][d] - points[j][d]).powi(2)).sum();
            values[i * N + j] = squared.sqrt() / 2.0;
        }
    }
    // a few missing pairs, kept symmetric
    for (i, j) in [(0, 5), (7, 19), (11, 12)] {
        values[i * N + j] = -1.0;
        values[j * N + i] = -1.0;
    }
    InputSet::in_memory(N, &values).expect("inputs")
}

fn run(processes: usize, threads: usize, per_node: usize) -> (AnnealOutcome, StressTrace) {
    run_with_regions(processes, threads, per_node, None)
}

fn run_with_regions(
    processes: usize,
    threads: usize,
    per_node: usize,
    region_dir: Option<&Path>,
) -> (AnnealOutcome, StressTrace) {
    let mut config = SolverConfig::new(N, DIM);
    config.shared_region_dir = region_dir.map(Path::to_path_buf);
    config.alpha = 0.6;
    config.block_size = 5;
    config.seed = 11;
    config.process_count = processes;
    config.threads_per_process = threads;
    config.procs_per_node = per_node;
    let mut trace = StressTrace::default();
    let outcome = run_local(&config, &inputs(), &mut trace)
        .unwrap_or_else(|err| panic!("{processes}x{threads} ({per_node} per node): {err}"));
    (outcome, trace)
}

fn assert_same_run(reference: &(AnnealOutcome, StressTrace), other: &(AnnealOutcome, StressTrace), label: &str) {
    let (expected, expected_trace) = reference;
    let (found, found_trace) = other;
    assert_eq!(expected.temperature_loops, found.temperature_loops, "{label}: loops");
    assert_eq!(expected.smacof_iterations, found.smacof_iterations, "{label}: iterations");
    assert_eq!(expected.summary.count, found.summary.count, "{label}: valid count");
    assert_eq!(expected.missing_distances, found.missing_distances, "{label}: missing");
    for ((_, a), (_, b)) in expected_trace.iterations.iter().zip(&found_trace.iterations) {
        assert!((a - b).abs() <= 1e-9 * a.abs().max(1.0), "{label}: stress {a} vs {b}");
    }
    for (a, b) in expected.points.iter().zip(found.points.iter()) {
        assert!((a - b).abs() <= 1e-9, "{label}: coordinate {a} vs {b}");
    }
    assert!((expected.final_stress - found.final_stress).abs() <= 1e-9);
}

#[test]
fn thread_only_and_process_only_layouts_agree() {
    let reference = run(1, 1, 1);
    assert_same_run(&reference, &run(1, 4, 1), "1x4");
    assert_same_run(&reference, &run(4, 1, 1), "4x1");
}

#[test]
fn hybrid_layouts_with_shared_nodes_agree() {
    let reference = run(1, 1, 1);
    assert_same_run(&reference, &run(2, 2, 2), "2x2, one node");
    assert_same_run(&reference, &run(4, 2, 2), "4x2, two nodes");
    assert_same_run(&reference, &run(3, 2, 1), "3x2, one process per node");
}

#[test]
fn file_backed_node_regions_match_anonymous_ones() {
    let dir = tempdir().expect("temporary directory");
    let reference = run(1, 1, 1);
    assert_same_run(&reference, &run_with_regions(2, 2, 2, Some(dir.path())), "2x2 file-backed");
    assert_same_run(&reference, &run_with_regions(4, 2, 2, Some(dir.path())), "4x2 file-backed");
    assert!(dir.path().join("damds-node0.region").is_file());
    assert!(dir.path().join("damds-node1.region").is_file());
}

#[test]
fn more_workers_than_points_still_runs() {
    let mut config = SolverConfig::new(4, 2);
    config.process_count = 2;
    config.threads_per_process = 3;
    let values: Vec<f64> = (0..16)
        .map(|k| ((k / 4) as f64 - (k % 4) as f64).abs() / 3.0)
        .collect();
    let inputs = InputSet::in_memory(4, &values).expect("inputs");
    let outcome = run_local(&config, &inputs, &mut StressTrace::default()).expect("run");
    assert_eq!(outcome.points.dim(), (4, 2));
    assert!(outcome.final_stress.is_finite());
}
