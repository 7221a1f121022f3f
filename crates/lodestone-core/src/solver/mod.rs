//! Linear solver abstraction and reference implementations.
//!
//! The [`LinearSolver`] trait is the uniform solve contract the pipeline
//! drives: given a [`SolverHandle`] (the conditioned, possibly factorised
//! system matrix) and one measurement vector, return one voxel vector.
//! Solvers are interchangeable; the frame loop never knows which one runs.
//!
//! # Available solvers
//!
//! | Solver | Handle | Notes |
//! |--------|--------|-------|
//! | [`kaczmarz::Kaczmarz`] | matrix | row-action, λ via augmented system |
//! | [`cgnr::Cgnr`] | matrix | CG on the regularised normal equations |
//! | [`direct::PseudoInverse`] | SVD | batched as a matrix product |
//! | [`direct::Tikhonov`] | LU | one triangular solve pair per frame |
//!
//! Every solver minimises $\|Ac - u\|^2 + \lambda\|c\|^2$ where
//! $\lambda$ is the square of [`SolverHandle::regularization`].

pub mod adapter;
pub mod cgnr;
pub mod direct;
pub mod handle;
pub mod kaczmarz;
pub mod transform;

use ndarray::{Array2, ArrayView1, ArrayView2};
use num_complex::Complex64;
use thiserror::Error;

pub use adapter::{create_solver, SolverConfig, SolverState};
pub use handle::SolverHandle;
pub use transform::SparseTransform;

use crate::params::SolverKind;

/// Errors that can occur during a solve.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Solver failed to converge after {max_iter} iterations (residual: {residual:.2e})")]
    ConvergenceFailure { max_iter: usize, residual: f64 },

    #[error("{solver} cannot operate on a {handle} handle")]
    IncompatibleHandle {
        solver: &'static str,
        handle: &'static str,
    },

    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Linear algebra error: {0}")]
    LinAlgError(String),
}

/// Options shared by the reference solvers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    /// Iteration cap for iterative solvers.
    pub iterations: usize,
    /// Convergence tolerance; `None` runs the full iteration budget and
    /// never reports non-convergence.
    pub tolerance: Option<f64>,
    /// Project the iterate onto real values.
    pub enforce_real: bool,
    /// Project the iterate onto non-negative real parts.
    pub enforce_positive: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            iterations: 10,
            tolerance: None,
            enforce_real: true,
            enforce_positive: true,
        }
    }
}

/// The solve contract consumed by the frame loop.
pub trait LinearSolver: Send + Sync {
    /// Solve for one voxel vector given one measurement vector.
    fn solve(
        &self,
        handle: &SolverHandle,
        rhs: ArrayView1<Complex64>,
    ) -> Result<ndarray::Array1<Complex64>, SolverError>;

    /// Solve every column of `rhs` (shape `(channels, n)`), returning
    /// `(voxels, n)`. The default loops over columns.
    fn solve_batch(
        &self,
        handle: &SolverHandle,
        rhs: ArrayView2<Complex64>,
    ) -> Result<Array2<Complex64>, SolverError> {
        let (_, voxels) = handle.shape();
        let mut out = Array2::<Complex64>::zeros((voxels, rhs.ncols()));
        for (j, column) in rhs.columns().into_iter().enumerate() {
            let x = self.solve(handle, column)?;
            out.column_mut(j).assign(&x);
        }
        Ok(out)
    }

    /// Human-readable name of the solver.
    fn name(&self) -> &'static str;
}

/// Instantiate the reference solver for `kind`.
pub fn solver_for(kind: SolverKind, options: SolverOptions) -> Box<dyn LinearSolver> {
    match kind {
        SolverKind::Kaczmarz => Box::new(kaczmarz::Kaczmarz::new(options)),
        SolverKind::Cgnr => Box::new(cgnr::Cgnr::new(options)),
        SolverKind::PseudoInverse => Box::new(direct::PseudoInverse),
        SolverKind::Direct => Box::new(direct::Tikhonov),
    }
}

/// Apply the real/non-negative projections in place.
pub(crate) fn project(x: &mut ndarray::Array1<Complex64>, enforce_real: bool, enforce_positive: bool) {
    if !enforce_real && !enforce_positive {
        return;
    }
    for c in x.iter_mut() {
        let re = if enforce_positive { c.re.max(0.0) } else { c.re };
        let im = if enforce_real { 0.0 } else { c.im };
        *c = Complex64::new(re, im);
    }
}
