// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use crate::comm::CommError;
use crate::config::ConfigError;
use crate::io::InputError;
use crate::partition::TopologyError;
use ndarray::Array2;
use std::fmt;
use thiserror::Error;

/// Scale of the 16-bit quantization: a stored value `q` decodes to `q / SHORT_MAX`.
pub const SHORT_MAX: f64 = i16::MAX as f64;
pub const INV_SHORT_MAX: f64 = 1.0 / SHORT_MAX;

/// `N x D` coordinates, one point per row.
pub type PointSet = Array2<f64>;

/// A contiguous block of matrix rows `[start, start + len)`.
///
/// Ranges are handed out by [`crate::partition::Topology`]; a worker may own an empty
/// range when there are more workers than rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RowRange {
    start: usize,
    len: usize,
}

impl RowRange {
    #[inline]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    #[inline]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the last row.
    #[inline]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }

    /// The last row of the range (inclusive), if any.
    #[inline]
    pub const fn last(&self) -> Option<usize> {
        if self.len == 0 {
            None
        } else {
            Some(self.start + self.len - 1)
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub const fn contains(&self, row: usize) -> bool {
        row >= self.start && row < self.start + self.len
    }

    #[inline]
    pub fn iter(&self) -> std::ops::Range<usize> {
        self.start..self.end()
    }

    /// The same rows expressed relative to `origin`.
    #[inline]
    pub fn relative_to(&self, origin: usize) -> Self {
        debug_assert!(self.start >= origin);
        Self::new(self.start - origin, self.len)
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last() {
            Some(last) => write!(f, "[{}, {}]", self.start, last),
            None => write!(f, "[{}, empty]", self.start),
        }
    }
}

/// The top-level error of a solver run.
#[derive(Debug, Error)]
pub enum SmacofError {
    #[error("collective operation failed: {0}")]
    Comm(#[from] CommError),
    #[error("invalid input: {0}")]
    Input(#[from] InputError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid process topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("every distance is missing or carries zero weight")]
    NoValidDistances,
    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker thread for process {rank} thread {thread} panicked")]
    WorkerPanicked { rank: usize, thread: usize },
}

impl SmacofError {
    /// `true` when this error is only the echo of another participant's failure.
    pub fn is_secondary(&self) -> bool {
        matches!(self, SmacofError::Comm(CommError::BarrierBroken { .. }))
    }
}
