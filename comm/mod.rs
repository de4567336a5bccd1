//! The collective layer: barriers, reductions, broadcasts and row gathers across
//! worker threads of one process, processes sharing one node, and nodes.
//!
//! Reductions travel through every tier as fixed-width `f64` lanes (see
//! [`Reducible`]), which lets the same protocol carry a scalar stress, a distance
//! summary, or any other associative value through thread slots, the node-shared
//! region, and the message-passing layer without knowing its type.

pub mod barrier;
pub mod collective;
pub mod process;
pub mod shared;
pub mod thread;

pub use barrier::CyclicBarrier;
pub use collective::{Collective, CollectiveOp, NodeResources, Phase, ProcessContext, RegionLayout};
pub use process::{LocalComm, ProcessComm};
pub use shared::SharedRegion;
pub use thread::{ThreadComm, ThreadGroup};

use thiserror::Error;

/// The widest value any reduction may carry through the node-shared region.
pub const MAX_REDUCE_LANES: usize = 8;

/// Failures of the collective layer. Every variant is fatal for the run: after a
/// collective fails, the numerical state of the participants can no longer be trusted.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("synchronization aborted: {reason}")]
    BarrierBroken { reason: String },

    #[error("message-passing transport failed: {0}")]
    Transport(String),

    #[error("collective length mismatch: expected {expected} values, found {found}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("shared region access out of bounds: offset {offset} + {len} exceeds {capacity}")]
    RegionBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("shared region could not be mapped: {0}")]
    Region(#[from] std::io::Error),
}

/// A value that can be merged associatively and shipped as `f64` lanes.
///
/// `combine` must be associative; merges at every tier happen in ascending
/// thread/process/node order so results are reproducible for a fixed topology.
pub trait Reducible: Sized {
    const LANES: usize;

    fn write_lanes(&self, lanes: &mut [f64]);
    fn read_lanes(lanes: &[f64]) -> Self;
    fn combine(&mut self, other: &Self);
}

impl Reducible for f64 {
    const LANES: usize = 1;

    fn write_lanes(&self, lanes: &mut [f64]) {
        lanes[0] = *self;
    }

    fn read_lanes(lanes: &[f64]) -> Self {
        lanes[0]
    }

    fn combine(&mut self, other: &Self) {
        *self += *other;
    }
}

impl<const N: usize> Reducible for [f64; N] {
    const LANES: usize = N;

    fn write_lanes(&self, lanes: &mut [f64]) {
        lanes[..N].copy_from_slice(self);
    }

    fn read_lanes(lanes: &[f64]) -> Self {
        let mut out = [0.0; N];
        out.copy_from_slice(&lanes[..N]);
        out
    }

    fn combine(&mut self, other: &Self) {
        for (a, b) in self.iter_mut().zip(other) {
            *a += *b;
        }
    }
}

impl<A: Reducible, B: Reducible> Reducible for (A, B) {
    const LANES: usize = A::LANES + B::LANES;

    fn write_lanes(&self, lanes: &mut [f64]) {
        self.0.write_lanes(&mut lanes[..A::LANES]);
        self.1.write_lanes(&mut lanes[A::LANES..A::LANES + B::LANES]);
    }

    fn read_lanes(lanes: &[f64]) -> Self {
        (
            A::read_lanes(&lanes[..A::LANES]),
            B::read_lanes(&lanes[A::LANES..A::LANES + B::LANES]),
        )
    }

    fn combine(&mut self, other: &Self) {
        self.0.combine(&other.0);
        self.1.combine(&other.1);
    }
}

/// Encodes a reducible value into a freshly allocated lane vector.
pub(crate) fn to_lane_vec<T: Reducible>(value: &T) -> Vec<f64> {
    let mut lanes = vec![0.0; T::LANES];
    value.write_lanes(&mut lanes);
    lanes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_lanes_are_laid_out_back_to_back() {
        let value = (1.5_f64, [2.0, 3.0]);
        let lanes = to_lane_vec(&value);
        assert_eq!(lanes, vec![1.5, 2.0, 3.0]);
        let decoded = <(f64, [f64; 2])>::read_lanes(&lanes);
        assert_eq!(decoded, value);
    }

    #[test]
    fn array_combine_is_elementwise_sum() {
        let mut a = [1.0, 2.0, 3.0];
        a.combine(&[0.5, 0.5, 0.5]);
        assert_eq!(a, [1.5, 2.5, 3.5]);
    }
}
