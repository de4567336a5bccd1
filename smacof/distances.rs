// ========================================================================================
//
//                        Weighted distance store
//
// ========================================================================================
//
// Distances live as 16-bit quantized values for the rows a worker thread owns and are
// decoded on every access. A negative decoded value marks a missing distance; every
// consumer skips it. Weights come from one of several sources (uniform, a dense
// quantized matrix, run-length compressed rows, or a per-point vector) and may be
// rescaled into Sammon weights once the average distance is known.

use crate::types::{INV_SHORT_MAX, RowRange, SHORT_MAX};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Sammon weights never divide by less than this fraction of the average distance.
pub const SAMMON_FLOOR_FACTOR: f64 = 0.001;

#[inline]
pub fn decode(raw: i16) -> f64 {
    f64::from(raw) * INV_SHORT_MAX
}

/// Rounds to the nearest representable value. Negative values stay negative so a
/// missing distance can never become a valid one.
#[inline]
pub fn encode(value: f64) -> i16 {
    let scaled = (value * SHORT_MAX).round().clamp(-SHORT_MAX, SHORT_MAX);
    if value < 0.0 {
        scaled.min(-1.0) as i16
    } else {
        scaled as i16
    }
}

// ----------------------------------------------------------------------------------------
//  Transforms
// ----------------------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum TransformParseError {
    #[error("unknown distance transform '{0}' (expected identity, power:<exponent> or log1p)")]
    Unknown(String),
    #[error("invalid power exponent '{0}'")]
    BadExponent(String),
}

/// A monotone transform applied to every valid distance before the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DistanceTransform {
    #[default]
    Identity,
    Power { exponent: f64 },
    Log1p,
}

impl DistanceTransform {
    /// The plain power transform, collapsed to `Identity` for an exponent of one.
    pub fn power(exponent: f64) -> Self {
        if exponent == 1.0 {
            DistanceTransform::Identity
        } else {
            DistanceTransform::Power { exponent }
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, DistanceTransform::Identity)
    }

    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            DistanceTransform::Identity => value,
            DistanceTransform::Power { exponent } => value.powf(exponent),
            DistanceTransform::Log1p => value.ln_1p(),
        }
    }
}

impl fmt::Display for DistanceTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceTransform::Identity => f.write_str("identity"),
            DistanceTransform::Power { exponent } => write!(f, "power:{exponent}"),
            DistanceTransform::Log1p => f.write_str("log1p"),
        }
    }
}

impl FromStr for DistanceTransform {
    type Err = TransformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "identity" | "none" => return Ok(DistanceTransform::Identity),
            "log1p" => return Ok(DistanceTransform::Log1p),
            _ => {}
        }
        match s.split_once(':') {
            Some(("power", exponent)) => exponent
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|e| e.is_finite() && *e > 0.0)
                .map(DistanceTransform::power)
                .ok_or_else(|| TransformParseError::BadExponent(exponent.to_string())),
            _ => Err(TransformParseError::Unknown(s.to_string())),
        }
    }
}

impl TryFrom<String> for DistanceTransform {
    type Error = TransformParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DistanceTransform> for String {
    fn from(value: DistanceTransform) -> Self {
        value.to_string()
    }
}

// ----------------------------------------------------------------------------------------
//  Quantized rows
// ----------------------------------------------------------------------------------------

/// Raw quantized values of a block of rows, each spanning all `n_cols` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedRows {
    rows: RowRange,
    n_cols: usize,
    data: Vec<i16>,
}

impl QuantizedRows {
    /// Returns `None` when `data` does not hold exactly `rows.len() * n_cols` values.
    pub fn new(rows: RowRange, n_cols: usize, data: Vec<i16>) -> Option<Self> {
        (data.len() == rows.len() * n_cols).then_some(Self { rows, n_cols, data })
    }

    pub fn from_decoded(rows: RowRange, n_cols: usize, values: &[f64]) -> Option<Self> {
        Self::new(rows, n_cols, values.iter().copied().map(encode).collect())
    }

    #[inline]
    pub fn rows(&self) -> RowRange {
        self.rows
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    #[inline]
    fn index(&self, row: usize, col: usize) -> usize {
        debug_assert!(self.rows.contains(row) && col < self.n_cols);
        (row - self.rows.start()) * self.n_cols + col
    }

    #[inline]
    pub fn raw(&self, row: usize, col: usize) -> i16 {
        self.data[self.index(row, col)]
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        decode(self.raw(row, col))
    }

    /// Raw values of one global row.
    pub fn row(&self, row: usize) -> &[i16] {
        let start = self.index(row, 0);
        &self.data[start..start + self.n_cols]
    }

    fn raw_mut(&mut self) -> &mut [i16] {
        &mut self.data
    }
}

// ----------------------------------------------------------------------------------------
//  Run-length compressed rows
// ----------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct RleRow {
    values: Vec<f64>,
    // Exclusive end column of every run.
    ends: Vec<usize>,
}

impl RleRow {
    fn get(&self, col: usize) -> f64 {
        let run = self.ends.partition_point(|&end| end <= col);
        self.values.get(run).copied().unwrap_or(0.0)
    }
}

/// Weight rows stored as `(value, count)` runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RleRows {
    rows: RowRange,
    n_cols: usize,
    runs: Vec<RleRow>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("run-length row {row} covers {found} columns, expected {expected}")]
pub struct RleLengthError {
    pub row: usize,
    pub expected: usize,
    pub found: usize,
}

impl RleRows {
    /// Builds rows from explicit runs, one list per row of `rows`.
    pub fn from_runs(
        rows: RowRange,
        n_cols: usize,
        runs: Vec<Vec<(f64, usize)>>,
    ) -> Result<Self, RleLengthError> {
        let runs = runs
            .into_iter()
            .zip(rows.iter())
            .map(|(row_runs, row)| {
                let mut values = Vec::with_capacity(row_runs.len());
                let mut ends = Vec::with_capacity(row_runs.len());
                let mut end = 0;
                for (value, count) in row_runs.into_iter().filter(|&(_, count)| count > 0) {
                    end += count;
                    values.push(value);
                    ends.push(end);
                }
                if end != n_cols {
                    return Err(RleLengthError {
                        row,
                        expected: n_cols,
                        found: end,
                    });
                }
                Ok(RleRow { values, ends })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if runs.len() != rows.len() {
            return Err(RleLengthError {
                row: rows.start() + runs.len(),
                expected: n_cols,
                found: 0,
            });
        }
        Ok(Self { rows, n_cols, runs })
    }

    /// Compresses dense row-major values.
    pub fn compress(rows: RowRange, n_cols: usize, dense: &[f64]) -> Result<Self, RleLengthError> {
        let runs = dense
            .chunks(n_cols.max(1))
            .take(rows.len())
            .map(|row| {
                let mut runs: Vec<(f64, usize)> = Vec::new();
                for &value in row {
                    match runs.last_mut() {
                        Some((last, count)) if *last == value => *count += 1,
                        _ => runs.push((value, 1)),
                    }
                }
                runs
            })
            .collect();
        Self::from_runs(rows, n_cols, runs)
    }

    pub fn run_count(&self) -> usize {
        self.runs.iter().map(|row| row.values.len()).sum()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        debug_assert!(col < self.n_cols);
        self.runs[row - self.rows.start()].get(col)
    }
}

// ----------------------------------------------------------------------------------------
//  Weights
// ----------------------------------------------------------------------------------------

/// Where the base weight `w_ij` of a pair comes from.
#[derive(Debug, Clone)]
pub enum WeightView {
    /// Every pair weighs 1.
    Uniform,
    /// Dense quantized weights for the owned rows.
    Matrix(QuantizedRows),
    /// Run-length compressed weights for the owned rows.
    Rle(RleRows),
    /// `w_ij = s_i * s_j` from one weight per point.
    Simple(Arc<[f64]>),
}

impl WeightView {
    #[inline]
    pub fn base(&self, row: usize, col: usize) -> f64 {
        match self {
            WeightView::Uniform => 1.0,
            WeightView::Matrix(rows) => rows.get(row, col),
            WeightView::Rle(rows) => rows.get(row, col),
            WeightView::Simple(points) => points[row] * points[col],
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            WeightView::Uniform => "uniform",
            WeightView::Matrix(_) => "dense matrix",
            WeightView::Rle(_) => "run-length rows",
            WeightView::Simple(_) => "per-point",
        }
    }
}

// ----------------------------------------------------------------------------------------
//  The store
// ----------------------------------------------------------------------------------------

/// Distances and weights of the rows owned by one worker thread.
#[derive(Debug, Clone)]
pub struct DistanceStore {
    distances: QuantizedRows,
    weights: WeightView,
    sammon: bool,
    average_distance: f64,
}

impl DistanceStore {
    /// Applies `transform` to every valid distance and re-quantizes it.
    pub fn new(
        mut distances: QuantizedRows,
        weights: WeightView,
        transform: DistanceTransform,
        sammon: bool,
    ) -> Self {
        if !transform.is_identity() {
            for raw in distances.raw_mut() {
                let value = decode(*raw);
                if value >= 0.0 {
                    *raw = encode(transform.apply(value));
                }
            }
        }
        Self {
            distances,
            weights,
            sammon,
            average_distance: 1.0,
        }
    }

    #[inline]
    pub fn rows(&self) -> RowRange {
        self.distances.rows()
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.distances.n_cols()
    }

    pub fn is_sammon(&self) -> bool {
        self.sammon
    }

    pub fn weights(&self) -> &WeightView {
        &self.weights
    }

    /// Decoded distance; negative means missing.
    #[inline]
    pub fn distance(&self, row: usize, col: usize) -> f64 {
        self.distances.get(row, col)
    }

    /// Weight of a pair, rescaled in Sammon mode.
    #[inline]
    pub fn weight(&self, row: usize, col: usize) -> f64 {
        let base = self.weights.base(row, col);
        if !self.sammon || base == 0.0 {
            return base;
        }
        let avg = self.average_distance;
        let floor = SAMMON_FLOOR_FACTOR * avg;
        base * avg / self.distance(row, col).max(floor)
    }

    /// `(distance, weight)` of a pair, or `None` if the distance is missing or the
    /// pair carries no weight.
    #[inline]
    pub fn entry(&self, row: usize, col: usize) -> Option<(f64, f64)> {
        let distance = self.distance(row, col);
        if distance < 0.0 {
            return None;
        }
        let weight = self.weight(row, col);
        (weight != 0.0).then_some((distance, weight))
    }

    /// Sets the average distance used by Sammon weights.
    pub fn set_average_distance(&mut self, average: f64) {
        if average > 0.0 && average.is_finite() {
            self.average_distance = average;
        }
    }

    pub fn average_distance(&self) -> f64 {
        self.average_distance
    }

    /// Replaces every distance in `[0, positive_min)` (diagonal included) with
    /// `positive_min` and returns how many were replaced.
    pub fn snap_zero_distances(&mut self, positive_min: f64) -> u64 {
        let snapped = encode(positive_min);
        let mut count = 0;
        for raw in self.distances.raw_mut() {
            let value = decode(*raw);
            if value >= 0.0 && value < positive_min {
                *raw = snapped;
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::distributions::Standard;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn store(values: &[f64], n: usize, weights: WeightView, sammon: bool) -> DistanceStore {
        let rows = RowRange::new(0, values.len() / n);
        let distances = QuantizedRows::from_decoded(rows, n, values).unwrap();
        DistanceStore::new(distances, weights, DistanceTransform::Identity, sammon)
    }

    #[test]
    fn encode_keeps_missing_values_negative() {
        assert_eq!(encode(-1e-9), -1);
        assert_eq!(encode(-1.0), -32767);
        assert_eq!(encode(0.0), 0);
        assert_eq!(encode(1.0), 32767);
        assert_eq!(encode(2.0), 32767);
        assert_relative_eq!(decode(encode(0.5)), 0.5, epsilon = INV_SHORT_MAX);
    }

    #[test]
    fn decode_is_strictly_increasing_over_every_raw_value() {
        for raw in i16::MIN..i16::MAX {
            assert!(decode(raw) < decode(raw + 1), "decode({raw}) >= decode({})", raw + 1);
        }
    }

    #[test]
    fn quantization_error_stays_within_one_step() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..100_000 {
            let value: f64 = rng.sample(Standard);
            let error = (decode(encode(value)) - value).abs();
            assert!(error <= INV_SHORT_MAX, "{value} came back off by {error}");

            let missing = -value - f64::EPSILON;
            assert!(decode(encode(missing)) < 0.0, "{missing} decoded as valid");
        }
    }

    #[test]
    fn transforms_parse_from_config_strings() {
        assert_eq!("identity".parse::<DistanceTransform>(), Ok(DistanceTransform::Identity));
        assert_eq!("power:1".parse::<DistanceTransform>(), Ok(DistanceTransform::Identity));
        assert_eq!(
            "power:0.5".parse::<DistanceTransform>(),
            Ok(DistanceTransform::Power { exponent: 0.5 })
        );
        assert_eq!("log1p".parse::<DistanceTransform>(), Ok(DistanceTransform::Log1p));
        assert!(matches!(
            "power:x".parse::<DistanceTransform>(),
            Err(TransformParseError::BadExponent(_))
        ));
        assert!(matches!(
            "cube".parse::<DistanceTransform>(),
            Err(TransformParseError::Unknown(_))
        ));
    }

    #[test]
    fn transform_skips_missing_distances() {
        let rows = RowRange::new(0, 1);
        let distances = QuantizedRows::from_decoded(rows, 3, &[0.25, -1.0, 0.64]).unwrap();
        let store = DistanceStore::new(
            distances,
            WeightView::Uniform,
            DistanceTransform::power(0.5),
            false,
        );
        assert_relative_eq!(store.distance(0, 0), 0.5, epsilon = 1e-4);
        assert!(store.distance(0, 1) < 0.0);
        assert_relative_eq!(store.distance(0, 2), 0.8, epsilon = 1e-4);
    }

    #[test]
    fn entries_skip_missing_and_zero_weight_pairs() {
        let weights = RowRange::new(0, 1);
        let weights = QuantizedRows::from_decoded(weights, 3, &[1.0, 1.0, 0.0]).unwrap();
        let store = store(&[0.0, -0.5, 0.5], 3, WeightView::Matrix(weights), false);
        assert!(store.entry(0, 0).is_some());
        assert!(store.entry(0, 1).is_none());
        assert!(store.entry(0, 2).is_none());
    }

    #[test]
    fn sammon_weights_scale_with_the_average_distance() {
        let mut store = store(&[0.0, 0.25, 0.5], 3, WeightView::Uniform, true);
        store.set_average_distance(0.5);
        assert_relative_eq!(store.weight(0, 2), 1.0, epsilon = 1e-4);
        assert_relative_eq!(store.weight(0, 1), 2.0, epsilon = 1e-3);
        // zero distances divide by the floor instead
        assert_relative_eq!(store.weight(0, 0), 1.0 / SAMMON_FLOOR_FACTOR, epsilon = 1e-6);
    }

    #[test]
    fn simple_weights_are_products_of_point_weights() {
        let view = WeightView::Simple(Arc::from(vec![0.5, 2.0, 3.0]));
        assert_eq!(view.base(1, 2), 6.0);
        assert_eq!(view.base(0, 0), 0.25);
    }

    #[test]
    fn rle_rows_decompress_by_column() {
        let rows = RowRange::new(5, 2);
        let dense = [1.0, 1.0, 0.0, 0.0, 0.5, 2.0, 2.0, 2.0, 2.0, 2.0];
        let rle = RleRows::compress(rows, 5, &dense).unwrap();
        assert_eq!(rle.run_count(), 4);
        for (i, row) in rows.iter().enumerate() {
            for col in 0..5 {
                assert_eq!(rle.get(row, col), dense[i * 5 + col]);
            }
        }
    }

    #[test]
    fn rle_rows_must_cover_every_column() {
        let err = RleRows::from_runs(RowRange::new(0, 1), 4, vec![vec![(1.0, 3)]]).unwrap_err();
        assert_eq!(
            err,
            RleLengthError {
                row: 0,
                expected: 4,
                found: 3
            }
        );
    }

    #[test]
    fn snapping_replaces_zeros_including_the_diagonal() {
        let mut store = store(&[0.0, 0.0, 0.5, -0.2], 2, WeightView::Uniform, false);
        let snapped = store.snap_zero_distances(0.5);
        assert_eq!(snapped, 2);
        assert_relative_eq!(store.distance(0, 0), 0.5, epsilon = 1e-4);
        assert_relative_eq!(store.distance(0, 1), 0.5, epsilon = 1e-4);
        assert!(store.distance(1, 1) < 0.0);
    }
}
