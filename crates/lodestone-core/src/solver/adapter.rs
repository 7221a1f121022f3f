//! Uniform solve contract around a conditioned handle.
//!
//! [`create_solver`] resolves the absolute regularisation once per
//! reconstruction and pushes it into the handle; [`SolverState::solve`]
//! then weights the measurement, runs the solver, transforms the result back
//! to voxel space and applies the real/non-negative projections.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use num_complex::Complex64;

use super::{project, solver_for, LinearSolver, SolverError, SolverHandle, SolverOptions, SparseTransform};
use crate::params::{RecoParams, SolverKind};

/// Solver selection and regularisation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub kind: SolverKind,
    pub lambda: f64,
    /// Scale `lambda` by `trace(AᴴA) / voxels` of the weighted matrix.
    pub relative_lambda: bool,
    pub options: SolverOptions,
}

impl SolverConfig {
    pub fn from_params(params: &RecoParams) -> Self {
        Self {
            kind: params.solver,
            lambda: params.lambda,
            relative_lambda: params.relative_lambda,
            options: SolverOptions {
                iterations: params.iterations,
                tolerance: params.tolerance,
                enforce_real: params.enforce_real,
                enforce_positive: params.enforce_positive,
            },
        }
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            SolverKind::Kaczmarz => "Kaczmarz",
            SolverKind::Cgnr => "CGNR",
            SolverKind::PseudoInverse => "pseudo-inverse",
            SolverKind::Direct => "direct",
        }
    }
}

/// A ready-to-use solver: handle, solver, weights and transform.
pub struct SolverState {
    handle: SolverHandle,
    solver: Box<dyn LinearSolver>,
    weights: Option<Array1<f64>>,
    transform: SparseTransform,
    lambda: f64,
    enforce_real: bool,
    enforce_positive: bool,
}

/// Build a solver state and apply the regularisation once.
///
/// The handle must already carry the weighting and transform (the
/// conditioner applies both before factorising). `weights` is reused here to
/// scale each measurement vector.
pub fn create_solver(
    mut handle: SolverHandle,
    weights: Option<Array1<f64>>,
    transform: SparseTransform,
    config: &SolverConfig,
) -> Result<SolverState, SolverError> {
    let (channels, voxels) = handle.shape();
    if let Some(w) = &weights {
        if w.len() != channels {
            return Err(SolverError::DimensionMismatch {
                expected: channels,
                found: w.len(),
            });
        }
    }

    let lambda = if config.relative_lambda && voxels > 0 {
        config.lambda * handle.frobenius_norm_sq() / voxels as f64
    } else {
        config.lambda
    };
    handle.set_regularization(lambda.sqrt());
    log::debug!(
        "{} solver on {}x{} {} handle, lambda = {:.3e}",
        config.kind_name(),
        channels,
        voxels,
        handle.kind_name(),
        lambda
    );

    // Projections are meaningless on transform coefficients; defer them.
    let mut options = config.options;
    if !transform.is_identity() {
        options.enforce_real = false;
        options.enforce_positive = false;
    }

    Ok(SolverState {
        handle,
        solver: solver_for(config.kind, options),
        weights,
        transform,
        lambda,
        enforce_real: config.options.enforce_real,
        enforce_positive: config.options.enforce_positive,
    })
}

impl SolverState {
    /// Number of channels one measurement vector must have.
    pub fn channels(&self) -> usize {
        self.handle.shape().0
    }

    /// Length of the solved voxel vector.
    pub fn voxels(&self) -> usize {
        self.handle.shape().1
    }

    /// Absolute regularisation in effect.
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn handle(&self) -> &SolverHandle {
        &self.handle
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }

    /// Solve one measurement vector.
    pub fn solve(&self, rhs: ArrayView1<Complex64>) -> Result<Array1<Complex64>, SolverError> {
        let weighted = self.weigh(rhs.to_owned());
        let x = self.solver.solve(&self.handle, weighted.view())?;
        self.finish(x)
    }

    /// Solve every column of a `(channels, n)` block, returning
    /// `(voxels, n)`.
    pub fn solve_batch(&self, rhs: ArrayView2<Complex64>) -> Result<Array2<Complex64>, SolverError> {
        if rhs.nrows() != self.channels() {
            return Err(SolverError::DimensionMismatch {
                expected: self.channels(),
                found: rhs.nrows(),
            });
        }
        let mut weighted = rhs.to_owned();
        if let Some(w) = &self.weights {
            for (mut row, wk) in weighted.rows_mut().into_iter().zip(w.iter()) {
                row.mapv_inplace(|c| c * *wk);
            }
        }
        let solved = self.solver.solve_batch(&self.handle, weighted.view())?;
        let mut out = Array2::<Complex64>::zeros(solved.dim());
        for (j, column) in solved.columns().into_iter().enumerate() {
            let x = self.finish(column.to_owned())?;
            out.column_mut(j).assign(&x);
        }
        Ok(out)
    }

    fn weigh(&self, mut rhs: Array1<Complex64>) -> Array1<Complex64> {
        if let Some(w) = &self.weights {
            for (c, wk) in rhs.iter_mut().zip(w.iter()) {
                *c *= *wk;
            }
        }
        rhs
    }

    fn finish(&self, x: Array1<Complex64>) -> Result<Array1<Complex64>, SolverError> {
        let mut x = self.transform.inverse(x.view())?;
        project(&mut x, self.enforce_real, self.enforce_positive);
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{SolverFamily, SparseTrafo};
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    fn config(kind: SolverKind, lambda: f64, relative: bool) -> SolverConfig {
        SolverConfig {
            kind,
            lambda,
            relative_lambda: relative,
            options: SolverOptions {
                iterations: 50,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_relative_lambda_scales_by_trace_over_voxels() {
        let matrix = array![[c(1.0), c(2.0)], [c(3.0), c(4.0)]];
        let handle = SolverHandle::build(SolverFamily::Direct, matrix).unwrap();
        let state = create_solver(handle, None, SparseTransform::Identity, &config(SolverKind::Direct, 0.1, true)).unwrap();
        // trace(AᴴA) = 1 + 4 + 9 + 16 = 30, voxels = 2.
        assert_relative_eq!(state.lambda(), 0.1 * 30.0 / 2.0, epsilon = 1e-12);
        assert_relative_eq!(state.handle().regularization(), (1.5f64).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_weights_scale_measurement() {
        // Matrix rows already weighted by w = [2, 1]: original A = I.
        let matrix = array![[c(2.0), c(0.0)], [c(0.0), c(1.0)]];
        let handle = SolverHandle::build(SolverFamily::PseudoInverse, matrix).unwrap();
        let state = create_solver(
            handle,
            Some(array![2.0, 1.0]),
            SparseTransform::Identity,
            &config(SolverKind::PseudoInverse, 0.0, false),
        )
        .unwrap();
        let x = state.solve(array![c(3.0), c(5.0)].view()).unwrap();
        assert_relative_eq!(x[0].re, 3.0, epsilon = 1e-12);
        assert_relative_eq!(x[1].re, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_round_trip_recovers_voxels() {
        let shape = [2, 2, 1];
        let transform = SparseTransform::new(SparseTrafo::Dct, shape);
        let mut matrix = Array2::<Complex64>::eye(4);
        transform.transform_rows(&mut matrix).unwrap();
        let handle = SolverHandle::build(SolverFamily::PseudoInverse, matrix).unwrap();
        let state = create_solver(handle, None, transform, &config(SolverKind::PseudoInverse, 0.0, false)).unwrap();
        let truth = array![c(1.0), c(2.0), c(3.0), c(4.0)];
        let x = state.solve(truth.view()).unwrap();
        for (a, b) in x.iter().zip(truth.iter()) {
            assert!((a - b).norm() < 1e-10);
        }
    }

    #[test]
    fn test_batch_rejects_wrong_channel_count() {
        let handle = SolverHandle::build(SolverFamily::Iterative, Array2::<Complex64>::eye(3)).unwrap();
        let state = create_solver(handle, None, SparseTransform::Identity, &config(SolverKind::Kaczmarz, 0.0, true)).unwrap();
        let block = Array2::<Complex64>::zeros((2, 4));
        assert!(matches!(
            state.solve_batch(block.view()),
            Err(SolverError::DimensionMismatch { expected: 3, found: 2 })
        ));
    }
}
