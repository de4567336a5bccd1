// ========================================================================================
//
//                        Majorization kernels
//
// ========================================================================================
//
// Every kernel works on the rows one worker thread owns (`store.rows()`) against the
// full, replicated `N x D` coordinates. Coordinates are flat row-major slices; results
// for the owned rows are written relative to the first owned row and become visible to
// other workers only through `Collective::merge_rows`.

use crate::distances::DistanceStore;
use crate::stats::StressSummary;
use ndarray::{Array2, ArrayView2};

/// Below this temperature the annealing offset vanishes.
pub const TEMPERATURE_EPSILON: f64 = 1e-10;
/// Pairs closer than this contribute nothing to the Guttman transform.
pub const DISTANCE_EPSILON: f64 = 1e-10;

/// `sqrt(2 D) * T`, the amount subtracted from every target distance at temperature `T`.
#[inline]
pub fn heat_offset(temperature: f64, dim: usize) -> f64 {
    if temperature < TEMPERATURE_EPSILON {
        0.0
    } else {
        (2.0 * dim as f64).sqrt() * temperature
    }
}

/// Euclidean distance between points `i` and `j` of a flat `N x dim` array.
#[inline]
pub fn euclidean(points: &[f64], dim: usize, i: usize, j: usize) -> f64 {
    let a = &points[i * dim..(i + 1) * dim];
    let b = &points[j * dim..(j + 1) * dim];
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[inline]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Summary of the valid distances in the owned rows, plus the number of missing ones.
///
/// Validity only looks at the base weight: Sammon rescaling needs the average distance
/// this pass computes.
pub fn compute_statistics(store: &DistanceStore) -> (StressSummary, f64) {
    let mut summary = StressSummary::default();
    let mut missing = 0.0;
    for row in store.rows().iter() {
        for col in 0..store.n_cols() {
            let distance = store.distance(row, col);
            if distance < 0.0 {
                missing += 1.0;
                continue;
            }
            if store.weights().base(row, col) == 0.0 {
                continue;
            }
            summary.accept(distance);
        }
    }
    (summary, missing)
}

/// `v_i = 1 + sum_{j != i} w_ij` over valid pairs of every owned row.
pub fn generate_v(store: &DistanceStore) -> Vec<f64> {
    store
        .rows()
        .iter()
        .map(|row| {
            1.0 + (0..store.n_cols())
                .filter(|&col| col != row)
                .filter_map(|col| store.entry(row, col))
                .map(|(_, weight)| weight)
                .sum::<f64>()
        })
        .collect()
}

/// Fills `out` (`owned rows x N`) with the rows of `B(Z)` at `temperature`.
pub fn build_bofz(store: &DistanceStore, points: &[f64], dim: usize, temperature: f64, out: &mut Array2<f64>) {
    let diff = heat_offset(temperature, dim);
    let rows = store.rows();
    debug_assert_eq!(out.dim(), (rows.len(), store.n_cols()));

    for (local, row) in rows.iter().enumerate() {
        let mut out_row = out.row_mut(local);
        let mut diagonal = 0.0;
        for col in 0..store.n_cols() {
            if col == row {
                continue;
            }
            let value = match store.entry(row, col) {
                Some((distance, weight)) => {
                    let dist = euclidean(points, dim, row, col);
                    if dist >= DISTANCE_EPSILON && diff < distance {
                        -weight * (distance - diff) / dist
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            out_row[col] = value;
            diagonal -= value;
        }
        out_row[row] = diagonal;
    }
}

/// `out = a * x` where `a` holds owned rows (`r x N`) and `x` is `N x dim`.
///
/// The inner dimension is walked in ascending order for every output element, so the
/// result of a row does not depend on `block_size` or on how rows are split.
pub fn blocked_multiply(a: ArrayView2<'_, f64>, x: &[f64], dim: usize, block_size: usize, out: &mut [f64]) {
    let (rows, inner) = a.dim();
    debug_assert_eq!(x.len(), inner * dim);
    debug_assert_eq!(out.len(), rows * dim);
    out.fill(0.0);

    let block = block_size.max(1);
    for row_block in (0..rows).step_by(block) {
        let row_end = (row_block + block).min(rows);
        for k_block in (0..inner).step_by(block) {
            let k_end = (k_block + block).min(inner);
            for i in row_block..row_end {
                let a_row = a.row(i);
                let out_row = &mut out[i * dim..(i + 1) * dim];
                for k in k_block..k_end {
                    let coefficient = a_row[k];
                    if coefficient == 0.0 {
                        continue;
                    }
                    for (o, value) in out_row.iter_mut().zip(&x[k * dim..(k + 1) * dim]) {
                        *o += coefficient * value;
                    }
                }
            }
        }
    }
}

/// Applies the iteration matrix `M = diag(v) - W` (off-diagonal valid weights) to `x`
/// for the owned rows, without materializing `M`.
pub fn multiply_by_v(store: &DistanceStore, v: &[f64], x: &[f64], dim: usize, out: &mut [f64]) {
    let rows = store.rows();
    debug_assert_eq!(v.len(), rows.len());
    debug_assert_eq!(out.len(), rows.len() * dim);

    for (local, row) in rows.iter().enumerate() {
        let out_row = &mut out[local * dim..(local + 1) * dim];
        for (o, value) in out_row.iter_mut().zip(&x[row * dim..(row + 1) * dim]) {
            *o = v[local] * value;
        }
        for col in 0..store.n_cols() {
            if col == row {
                continue;
            }
            if let Some((_, weight)) = store.entry(row, col) {
                for (o, value) in out_row.iter_mut().zip(&x[col * dim..(col + 1) * dim]) {
                    *o -= weight * value;
                }
            }
        }
    }
}

/// Unnormalized weighted stress of the owned rows at `temperature`.
///
/// Pairs whose target distance is below the heat offset pull the points together:
/// their term is `-euclid` before squaring.
pub fn stress_partial(store: &DistanceStore, points: &[f64], dim: usize, temperature: f64) -> f64 {
    let diff = heat_offset(temperature, dim);
    let mut sigma = 0.0;
    for row in store.rows().iter() {
        for col in 0..store.n_cols() {
            let Some((distance, weight)) = store.entry(row, col) else {
                continue;
            };
            let euclid = euclidean(points, dim, row, col);
            let term = if distance >= diff {
                distance - diff - euclid
            } else {
                -euclid
            };
            sigma += weight * term * term;
        }
    }
    sigma
}
