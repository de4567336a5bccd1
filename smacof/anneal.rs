// ========================================================================================
//
//                        Deterministic annealing driver
//
// ========================================================================================
//
// One `Worker` runs per (process, thread). Every worker executes the same sequence of
// collective operations in the same order; workers only differ in the rows they own.
// The full `N x D` coordinates, the `B(Z) X` right-hand side and the CG scratch arrays
// are replicated in every worker and kept identical by `Collective::merge_rows`.

use crate::cg::{ConjugateGradient, MajorizationOperator};
use crate::comm::Collective;
use crate::config::SolverConfig;
use crate::distances::DistanceStore;
use crate::io::read_initial_mapping;
use crate::kernel::{blocked_multiply, build_bofz, compute_statistics, generate_v, multiply_by_v, stress_partial};
use crate::stats::StressSummary;
use crate::timing::{AnnealObserver, PhaseTimings, TimingPhase, format_elapsed};
use crate::types::{PointSet, SmacofError};
use log::{debug, info};
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// Everything a finished run reports. Identical in every worker.
#[derive(Debug, Clone)]
pub struct AnnealOutcome {
    pub points: PointSet,
    /// Normalized stress of the initial mapping at `T = 0`.
    pub initial_stress: f64,
    /// Normalized stress of the initial mapping at `Tmax`.
    pub stress_at_t_max: f64,
    /// Normalized stress at `final_temperature`, the last temperature reached.
    pub final_stress: f64,
    /// `0` after a full schedule; the cooled temperature after a capped one.
    pub final_temperature: f64,
    pub t_max: f64,
    pub t_min: f64,
    pub temperature_loops: usize,
    pub smacof_iterations: usize,
    pub cg_iterations: usize,
    /// Solves that stopped at the CG iteration cap.
    pub cg_cap_hits: usize,
    pub summary: StressSummary,
    pub missing_distances: f64,
    pub snapped_distances: f64,
    /// Stress of the last SMACOF iteration divided by the number of point pairs.
    pub qor1: f64,
    /// `qor1` divided by the squared average distance.
    pub qor2: f64,
    pub timings: PhaseTimings,
    pub elapsed: Duration,
}

impl AnnealOutcome {
    /// Average CG iterations per SMACOF iteration.
    pub fn average_cg_iterations(&self) -> f64 {
        if self.smacof_iterations == 0 {
            0.0
        } else {
            self.cg_iterations as f64 / self.smacof_iterations as f64
        }
    }
}

/// `M x` for the owned rows, merged into a full array.
struct IterationMatrix<'w> {
    collective: &'w Collective,
    store: &'w DistanceStore,
    v: &'w [f64],
    local: &'w mut [f64],
    timings: &'w mut PhaseTimings,
    dim: usize,
}

impl MajorizationOperator for IterationMatrix<'_> {
    fn apply(&mut self, x: &[f64], out: &mut [f64]) -> Result<(), SmacofError> {
        let start = Instant::now();
        multiply_by_v(self.store, self.v, x, self.dim, self.local);
        let rows = self.store.rows();
        out[rows.start() * self.dim..rows.end() * self.dim].copy_from_slice(self.local);
        self.collective.merge_rows(out)?;
        self.timings.record(TimingPhase::Mm, start.elapsed());
        Ok(())
    }
}

/// Seeded initial mapping: a random sign times a uniform `[0, 1)` magnitude.
pub fn random_mapping(n: usize, dim: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dim)
        .map(|_| {
            let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            sign * rng.sample::<f64, _>(Standard)
        })
        .collect()
}

pub struct Worker<'a> {
    collective: Collective,
    config: &'a SolverConfig,
    store: DistanceStore,
    observer: &'a mut dyn AnnealObserver,
    n: usize,
    dim: usize,
    points: Vec<f64>,
    bc: Vec<f64>,
    bofz: Array2<f64>,
    local: Vec<f64>,
    v: Vec<f64>,
    cg: ConjugateGradient,
    timings: PhaseTimings,
    inv_sum_of_squares: f64,
}

impl<'a> Worker<'a> {
    pub fn new(
        collective: Collective,
        config: &'a SolverConfig,
        store: DistanceStore,
        observer: &'a mut dyn AnnealObserver,
    ) -> Self {
        let n = config.number_data_points;
        let dim = config.target_dimension;
        let owned = store.rows().len();
        Self {
            collective,
            config,
            store,
            observer,
            n,
            dim,
            points: vec![0.0; n * dim],
            bc: vec![0.0; n * dim],
            bofz: Array2::zeros((owned, n)),
            local: vec![0.0; owned * dim],
            v: Vec::new(),
            cg: ConjugateGradient::new(n * dim, config.cg_iter, config.cg_error_threshold),
            timings: PhaseTimings::default(),
            inv_sum_of_squares: 0.0,
        }
    }

    fn is_root(&self) -> bool {
        self.collective.is_root()
    }

    /// Runs the full annealing schedule and returns the final embedding.
    pub fn run(mut self) -> Result<AnnealOutcome, SmacofError> {
        let started = Instant::now();
        let config = self.config;

        let (summary, missing) = self.collective.all_reduce(&compute_statistics(&self.store))?;
        if summary.is_empty() || summary.sum_of_squares == 0.0 {
            return Err(SmacofError::NoValidDistances);
        }
        self.inv_sum_of_squares = 1.0 / summary.sum_of_squares;
        if self.store.is_sammon() {
            self.store.set_average_distance(summary.average());
        }
        let snapped_local = self.store.snap_zero_distances(summary.min_positive()) as f64;
        let snapped = self.collective.all_reduce(&snapped_local)?;

        if self.is_root() {
            let total = (self.n * self.n) as f64;
            info!("Distance summary: {summary}");
            info!(
                "Missing distances: {} ({:.4}%), snapped to {:.6}: {}",
                missing,
                100.0 * missing / total,
                summary.min_positive(),
                snapped
            );
            if self.store.is_sammon() {
                info!("Sammon weights with average distance {:.6}", summary.average());
            }
            info!("Weights: {}", self.store.weights().describe());
        }

        self.load_initial_mapping()?;

        let scale = (2.0 * self.dim as f64).sqrt();
        let t_max = summary.max / scale;
        let t_min = config.t_min_factor * summary.min_positive() / scale;
        self.v = generate_v(&self.store);

        let initial_stress = self.stress(0.0)?;
        let stress_at_t_max = self.stress(t_max)?;
        if self.is_root() {
            info!("Initial stress {initial_stress:.10}, at Tmax {stress_at_t_max:.10}");
            info!("Tmax {t_max:.6}, Tmin {t_min:.6}, alpha {}", config.alpha);
            self.observer.on_initial_stress(initial_stress);
        }
        self.collective.barrier()?;

        let mut t_cur = config.alpha * t_max;
        let mut loop_num = 0;
        let mut temperature_loops = 0;
        let mut smacof_iterations = 0;
        let mut cg_iterations = 0;
        let mut cg_cap_hits = 0;
        let mut stress = initial_stress;

        loop {
            let loop_start = Instant::now();
            let mut pre_stress = self.timed_stress(t_cur)?;
            let mut diff = config.threshold + 1.0;
            let mut iteration = 0;

            while diff >= config.threshold {
                let start = Instant::now();
                self.compute_bc(t_cur)?;
                self.timings.record(TimingPhase::Bc, start.elapsed());

                let start = Instant::now();
                let mut operator = IterationMatrix {
                    collective: &self.collective,
                    store: &self.store,
                    v: &self.v,
                    local: &mut self.local,
                    timings: &mut self.timings,
                    dim: self.dim,
                };
                let outcome = self.cg.solve(&mut operator, &mut self.bc, &mut self.points)?;
                self.timings.record(TimingPhase::Cg, start.elapsed());
                cg_iterations += outcome.iterations;
                if outcome.reached_cap {
                    cg_cap_hits += 1;
                }

                stress = self.timed_stress(t_cur)?;
                diff = pre_stress - stress;
                pre_stress = stress;

                if self.is_root() {
                    if iteration % 10 == 0 || iteration >= config.stress_iter {
                        debug!(
                            "Loop {loop_num} iteration {iteration}: stress {stress:.10}, CG {} iterations",
                            outcome.iterations
                        );
                    }
                    self.observer.on_iteration(loop_num, iteration, stress);
                }
                iteration += 1;
                smacof_iterations += 1;
            }
            self.timings.record(TimingPhase::TemperatureLoop, loop_start.elapsed());
            temperature_loops += 1;

            if self.is_root() {
                info!(
                    "Loop {loop_num} at T {t_cur:.6}: {iteration} iterations, stress {stress:.10}"
                );
                self.observer.on_temperature_end(loop_num, t_cur, iteration, stress);
            }

            if t_cur == 0.0 {
                break;
            }
            t_cur *= config.alpha;
            if t_cur < t_min {
                t_cur = 0.0;
            }
            loop_num += 1;
            if config.max_temp_loops > 0 && loop_num == config.max_temp_loops {
                break;
            }
        }

        let final_stress = self.timed_stress(t_cur)?;
        let pairs = self.n as f64 * (self.n as f64 - 1.0) / 2.0;
        let qor1 = if pairs > 0.0 { stress / pairs } else { 0.0 };
        let average = summary.average();
        let qor2 = if average > 0.0 { qor1 / (average * average) } else { 0.0 };
        let elapsed = started.elapsed();

        let outcome = AnnealOutcome {
            points: Array2::from_shape_fn((self.n, self.dim), |(i, d)| self.points[i * self.dim + d]),
            initial_stress,
            stress_at_t_max,
            final_stress,
            final_temperature: t_cur,
            t_max,
            t_min,
            temperature_loops,
            smacof_iterations,
            cg_iterations,
            cg_cap_hits,
            summary,
            missing_distances: missing,
            snapped_distances: snapped,
            qor1,
            qor2,
            timings: self.timings.clone(),
            elapsed,
        };

        if self.is_root() {
            info!(
                "Finished in {}: final stress {final_stress:.10} at T {t_cur:.6}, {} temperature loops, {} SMACOF iterations",
                format_elapsed(elapsed),
                outcome.temperature_loops,
                smacof_iterations
            );
            info!(
                "CG: {cg_iterations} iterations, {:.2} per SMACOF iteration, {cg_cap_hits} at the cap",
                outcome.average_cg_iterations()
            );
            info!("QoR1 {qor1:.6e}, QoR2 {qor2:.6e}");
            debug!("Timings: {}", outcome.timings);
        }
        Ok(outcome)
    }

    /// Root reads or draws the mapping, then every worker receives it.
    fn load_initial_mapping(&mut self) -> Result<(), SmacofError> {
        if self.is_root() {
            self.points = match &self.config.initial_points_file {
                Some(path) => {
                    info!("Initial mapping from {}", path.display());
                    read_initial_mapping(path, self.n, self.dim)?
                }
                None => {
                    info!("Random initial mapping (seed {})", self.config.seed);
                    random_mapping(self.n, self.dim, self.config.seed)
                }
            };
        }
        self.collective.broadcast(&mut self.points)?;
        Ok(())
    }

    fn stress(&self, temperature: f64) -> Result<f64, SmacofError> {
        let partial = stress_partial(&self.store, &self.points, self.dim, temperature);
        Ok(self.collective.all_reduce(&partial)? * self.inv_sum_of_squares)
    }

    fn timed_stress(&mut self, temperature: f64) -> Result<f64, SmacofError> {
        let start = Instant::now();
        let stress = self.stress(temperature)?;
        self.timings.record(TimingPhase::Stress, start.elapsed());
        Ok(stress)
    }

    /// Fills the replicated `B(Z) Z` for the current points.
    fn compute_bc(&mut self, temperature: f64) -> Result<(), SmacofError> {
        build_bofz(&self.store, &self.points, self.dim, temperature, &mut self.bofz);
        blocked_multiply(
            self.bofz.view(),
            &self.points,
            self.dim,
            self.config.block_size,
            &mut self.local,
        );
        let rows = self.store.rows();
        self.bc[rows.start() * self.dim..rows.end() * self.dim].copy_from_slice(&self.local);
        self.collective.merge_rows(&mut self.bc)?;
        Ok(())
    }
}
