//! Conjugate gradient for the majorized system `M X = B(Z) X`.
//!
//! Every participant runs the same iteration on its own replicated copy of the `N x D`
//! arrays. Only the operator application touches other workers (it computes owned rows
//! and merges them), so inner products are computed locally and agree everywhere
//! without a reduction.

use crate::kernel::dot;
use crate::types::SmacofError;

/// Applies the iteration matrix to a full `N x D` array.
pub trait MajorizationOperator {
    fn apply(&mut self, x: &[f64], out: &mut [f64]) -> Result<(), SmacofError>;
}

/// Steps of one solve, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgPhase {
    Init,
    MultInitial,
    ResidualInit,
    Loop,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgOutcome {
    pub iterations: usize,
    /// The loop stopped at the iteration cap rather than on the residual test.
    pub reached_cap: bool,
    /// `r·r` when the loop stopped.
    pub residual: f64,
}

/// Scratch arrays reused across solves.
#[derive(Debug, Clone)]
pub struct ConjugateGradient {
    max_iter: usize,
    threshold: f64,
    product: Vec<f64>,
    direction: Vec<f64>,
}

impl ConjugateGradient {
    pub fn new(len: usize, max_iter: usize, threshold: f64) -> Self {
        Self {
            max_iter,
            threshold,
            product: vec![0.0; len],
            direction: vec![0.0; len],
        }
    }

    /// Improves `x` towards `M x = b`. `b` is consumed as the residual buffer.
    ///
    /// The relative residual test runs after `x` has been updated but before the
    /// residual is, so an early exit returns the `x` of the iteration that passed it.
    pub fn solve<O: MajorizationOperator>(
        &mut self,
        operator: &mut O,
        b: &mut [f64],
        x: &mut [f64],
    ) -> Result<CgOutcome, SmacofError> {
        debug_assert_eq!(b.len(), x.len());
        let mut phase = CgPhase::Init;
        let mut outcome = CgOutcome {
            iterations: 0,
            reached_cap: false,
            residual: 0.0,
        };
        let mut rtr = 0.0;
        let mut test_end = 0.0;

        while phase != CgPhase::Done {
            phase = match phase {
                CgPhase::Init => {
                    self.product.resize(x.len(), 0.0);
                    self.direction.resize(x.len(), 0.0);
                    CgPhase::MultInitial
                }
                CgPhase::MultInitial => {
                    operator.apply(x, &mut self.product)?;
                    CgPhase::ResidualInit
                }
                CgPhase::ResidualInit => {
                    for (r, mx) in b.iter_mut().zip(&self.product) {
                        *r -= mx;
                    }
                    self.direction.copy_from_slice(b);
                    rtr = dot(b, b);
                    test_end = rtr * self.threshold;
                    CgPhase::Loop
                }
                CgPhase::Loop => {
                    if outcome.iterations >= self.max_iter {
                        outcome.reached_cap = true;
                        CgPhase::Done
                    } else {
                        outcome.iterations += 1;
                        self.iterate(operator, b, x, &mut rtr, test_end)?
                    }
                }
                CgPhase::Done => CgPhase::Done,
            };
        }
        outcome.residual = rtr;
        Ok(outcome)
    }

    fn iterate<O: MajorizationOperator>(
        &mut self,
        operator: &mut O,
        r: &mut [f64],
        x: &mut [f64],
        rtr: &mut f64,
        test_end: f64,
    ) -> Result<CgPhase, SmacofError> {
        operator.apply(&self.direction, &mut self.product)?;
        let curvature = dot(&self.direction, &self.product);
        if curvature == 0.0 {
            return Ok(CgPhase::Done);
        }
        let alpha = *rtr / curvature;
        for (xi, pi) in x.iter_mut().zip(&self.direction) {
            *xi += alpha * pi;
        }
        if *rtr < test_end {
            return Ok(CgPhase::Done);
        }

        for (ri, api) in r.iter_mut().zip(&self.product) {
            *ri -= alpha * api;
        }
        let next = dot(r, r);
        let beta = next / *rtr;
        *rtr = next;
        for (pi, ri) in self.direction.iter_mut().zip(r.iter()) {
            *pi = ri + beta * *pi;
        }
        Ok(CgPhase::Loop)
    }
}
