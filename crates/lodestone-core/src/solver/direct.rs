//! Factorisation-based solvers.
//!
//! Both operate on handles prepared during conditioning, so a frame solve
//! costs one back-substitution (LU) or one pair of thin matrix products
//! (SVD). Neither re-factorises per frame.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use num_complex::Complex64;

use super::{LinearSolver, SolverError, SolverHandle};

/// Regularised pseudo-inverse $c = V \,\mathrm{diag}(\sigma/(\sigma^2+\lambda^2))\, U^H u$.
pub struct PseudoInverse;

/// Direct Tikhonov solve via the LU of $A^H A + \lambda^2 I$.
pub struct Tikhonov;

impl LinearSolver for PseudoInverse {
    fn solve(
        &self,
        handle: &SolverHandle,
        rhs: ArrayView1<Complex64>,
    ) -> Result<Array1<Complex64>, SolverError> {
        let column = rhs.insert_axis(Axis(1));
        let out = self.solve_batch(handle, column)?;
        Ok(out.column(0).to_owned())
    }

    fn solve_batch(
        &self,
        handle: &SolverHandle,
        rhs: ArrayView2<Complex64>,
    ) -> Result<Array2<Complex64>, SolverError> {
        let SolverHandle::Svd(factor) = handle else {
            return Err(SolverError::IncompatibleHandle {
                solver: self.name(),
                handle: handle.kind_name(),
            });
        };
        if rhs.nrows() != factor.u.nrows() {
            return Err(SolverError::DimensionMismatch {
                expected: factor.u.nrows(),
                found: rhs.nrows(),
            });
        }
        // Uᴴ B, then scale each singular row by the damped reciprocal.
        let mut projected = factor.u.t().mapv(|c| c.conj()).dot(&rhs);
        for (mut row, d) in projected.rows_mut().into_iter().zip(factor.damped.iter()) {
            row.mapv_inplace(|c| c * *d);
        }
        Ok(factor.v.dot(&projected))
    }

    fn name(&self) -> &'static str {
        "pseudo-inverse"
    }
}

impl LinearSolver for Tikhonov {
    fn solve(
        &self,
        handle: &SolverHandle,
        rhs: ArrayView1<Complex64>,
    ) -> Result<Array1<Complex64>, SolverError> {
        let SolverHandle::Tikhonov(factor) = handle else {
            return Err(SolverError::IncompatibleHandle {
                solver: self.name(),
                handle: handle.kind_name(),
            });
        };
        if rhs.len() != factor.matrix.nrows() {
            return Err(SolverError::DimensionMismatch {
                expected: factor.matrix.nrows(),
                found: rhs.len(),
            });
        }
        let x = factor.solve(&rhs.to_owned());
        if x.iter().any(|c| !c.re.is_finite() || !c.im.is_finite()) {
            return Err(SolverError::LinAlgError(
                "normal equations are singular; increase lambda".into(),
            ));
        }
        Ok(x)
    }

    fn name(&self) -> &'static str {
        "Tikhonov (direct)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SolverFamily;
    use ndarray::array;

    fn sample() -> (Array2<Complex64>, Array1<Complex64>) {
        let matrix = array![
            [Complex64::new(1.0, 1.0), Complex64::new(2.0, 0.0)],
            [Complex64::new(0.0, 1.0), Complex64::new(3.0, -1.0)],
            [Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)],
        ];
        let truth = array![Complex64::new(0.5, 0.0), Complex64::new(1.25, 0.0)];
        (matrix, truth)
    }

    #[test]
    fn test_pseudo_inverse_recovers_truth() {
        let (matrix, truth) = sample();
        let rhs = matrix.dot(&truth);
        let handle = SolverHandle::build(SolverFamily::PseudoInverse, matrix).unwrap();
        let x = PseudoInverse.solve(&handle, rhs.view()).unwrap();
        for (a, b) in x.iter().zip(truth.iter()) {
            assert!((a - b).norm() < 1e-10, "got {:?}, expected {:?}", a, b);
        }
    }

    #[test]
    fn test_direct_and_pseudo_inverse_agree_under_regularisation() {
        let (matrix, truth) = sample();
        let rhs = matrix.dot(&truth);
        let mut svd = SolverHandle::build(SolverFamily::PseudoInverse, matrix.clone()).unwrap();
        let mut lu = SolverHandle::build(SolverFamily::Direct, matrix).unwrap();
        svd.set_regularization(0.7);
        lu.set_regularization(0.7);
        let a = PseudoInverse.solve(&svd, rhs.view()).unwrap();
        let b = Tikhonov.solve(&lu, rhs.view()).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).norm() < 1e-10, "{:?} vs {:?}", x, y);
        }
    }

    #[test]
    fn test_batched_pseudo_inverse_matches_column_solves() {
        let (matrix, truth) = sample();
        let rhs1 = matrix.dot(&truth);
        let rhs2 = rhs1.mapv(|c| c * 2.0);
        let mut block = Array2::<Complex64>::zeros((3, 2));
        block.column_mut(0).assign(&rhs1);
        block.column_mut(1).assign(&rhs2);
        let handle = SolverHandle::build(SolverFamily::PseudoInverse, matrix).unwrap();
        let batch = PseudoInverse.solve_batch(&handle, block.view()).unwrap();
        let second = PseudoInverse.solve(&handle, rhs2.view()).unwrap();
        for (a, b) in batch.column(1).iter().zip(second.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
    }
}
