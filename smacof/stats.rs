//! Summary of the valid input distances, merged across every worker.

use crate::comm::Reducible;
use std::fmt;

/// Count, moments and range of the valid (non-missing, weighted) distances.
///
/// Merging is associative and commutative, so per-thread summaries can be combined
/// through any reduction tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressSummary {
    pub count: f64,
    pub sum: f64,
    pub sum_of_squares: f64,
    /// Smallest strictly positive distance; `f64::INFINITY` until one is seen.
    pub positive_min: f64,
    pub max: f64,
}

impl Default for StressSummary {
    fn default() -> Self {
        Self {
            count: 0.0,
            sum: 0.0,
            sum_of_squares: 0.0,
            positive_min: f64::INFINITY,
            max: 0.0,
        }
    }
}

impl StressSummary {
    #[inline]
    pub fn accept(&mut self, distance: f64) {
        self.count += 1.0;
        self.sum += distance;
        self.sum_of_squares += distance * distance;
        if distance > 0.0 && distance < self.positive_min {
            self.positive_min = distance;
        }
        if distance > self.max {
            self.max = distance;
        }
    }

    pub fn merge(&mut self, other: &StressSummary) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
        self.positive_min = self.positive_min.min(other.positive_min);
        self.max = self.max.max(other.max);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0.0
    }

    pub fn average(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.sum / self.count
        }
    }

    pub fn variance(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let mean = self.average();
        (self.sum_of_squares / self.count - mean * mean).max(0.0)
    }

    /// The smallest positive distance, or 0 when every valid distance is zero.
    pub fn min_positive(&self) -> f64 {
        if self.positive_min.is_finite() {
            self.positive_min
        } else {
            0.0
        }
    }
}

impl Reducible for StressSummary {
    const LANES: usize = 5;

    fn write_lanes(&self, lanes: &mut [f64]) {
        lanes[..5].copy_from_slice(&[
            self.count,
            self.sum,
            self.sum_of_squares,
            self.positive_min,
            self.max,
        ]);
    }

    fn read_lanes(lanes: &[f64]) -> Self {
        Self {
            count: lanes[0],
            sum: lanes[1],
            sum_of_squares: lanes[2],
            positive_min: lanes[3],
            max: lanes[4],
        }
    }

    fn combine(&mut self, other: &Self) {
        self.merge(other);
    }
}

impl fmt::Display for StressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} avg={:.6} variance={:.6} min={:.6} max={:.6} sum_sq={:.6}",
            self.count,
            self.average(),
            self.variance(),
            self.min_positive(),
            self.max,
            self.sum_of_squares
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn summarize(values: &[f64]) -> StressSummary {
        let mut summary = StressSummary::default();
        values.iter().for_each(|&d| summary.accept(d));
        summary
    }

    #[test]
    fn positive_min_ignores_zeros() {
        let summary = summarize(&[0.0, 0.3, 0.1, 0.0]);
        assert_eq!(summary.count, 4.0);
        assert_eq!(summary.min_positive(), 0.1);
        assert_eq!(summary.max, 0.3);
        assert_relative_eq!(summary.average(), 0.1);
    }

    #[test]
    fn empty_summary_reports_zeroes() {
        let summary = StressSummary::default();
        assert!(summary.is_empty());
        assert_eq!(summary.average(), 0.0);
        assert_eq!(summary.min_positive(), 0.0);
    }

    #[test]
    fn merge_order_does_not_change_the_result() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            // quarter-steps keep every partial sum exact
            let values: Vec<f64> = (0..rng.gen_range(1..200))
                .map(|_| f64::from(rng.gen_range(0..64_u32)) * 0.25)
                .collect();
            let whole = summarize(&values);

            let mut cuts: Vec<usize> = (0..rng.gen_range(0..6))
                .map(|_| rng.gen_range(0..=values.len()))
                .collect();
            cuts.sort_unstable();
            let mut parts = Vec::new();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(values.len())) {
                parts.push(summarize(&values[start..cut]));
                start = cut;
            }
            parts.shuffle(&mut rng);

            let mut merged = StressSummary::default();
            for part in &parts {
                merged.combine(part);
            }
            assert_eq!(merged, whole);
        }
    }

    #[test]
    fn lanes_round_trip_through_reducible() {
        let summary = summarize(&[0.5, 0.25]);
        let mut lanes = [0.0; 5];
        summary.write_lanes(&mut lanes);
        assert_eq!(StressSummary::read_lanes(&lanes), summary);
    }
}
