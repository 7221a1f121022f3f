//! Conjugate gradients on the regularised normal equations (CGNR).
//!
//! Solves $(A^H A + \lambda I) c = A^H u$ using only products with $A$ and
//! $A^H$, so the normal-equations matrix is never formed.

use ndarray::{Array1, Array2, ArrayView1};
use num_complex::Complex64;

use super::{project, LinearSolver, SolverError, SolverHandle, SolverOptions};

pub struct Cgnr {
    options: SolverOptions,
}

impl Cgnr {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

/// $A^H y$ without materialising the adjoint.
fn adjoint_mul(matrix: &Array2<Complex64>, y: &Array1<Complex64>) -> Array1<Complex64> {
    matrix
        .t()
        .dot(&y.mapv(|c| c.conj()))
        .mapv(|c| c.conj())
}

fn norm_sq(x: &Array1<Complex64>) -> f64 {
    x.iter().map(|c| c.norm_sqr()).sum()
}

impl LinearSolver for Cgnr {
    fn solve(
        &self,
        handle: &SolverHandle,
        rhs: ArrayView1<Complex64>,
    ) -> Result<Array1<Complex64>, SolverError> {
        let SolverHandle::Matrix { matrix, lambda } = handle else {
            return Err(SolverError::IncompatibleHandle {
                solver: self.name(),
                handle: handle.kind_name(),
            });
        };
        if rhs.len() != matrix.nrows() {
            return Err(SolverError::DimensionMismatch {
                expected: matrix.nrows(),
                found: rhs.len(),
            });
        }
        let shift = lambda * lambda;

        let mut x = Array1::<Complex64>::zeros(matrix.ncols());
        let mut r = adjoint_mul(matrix, &rhs.to_owned());
        let reference = norm_sq(&r).sqrt();
        if reference == 0.0 {
            return Ok(x);
        }
        let mut p = r.clone();
        let mut rs = norm_sq(&r);
        let mut residual = 1.0;

        for _ in 0..self.options.iterations {
            let ap = matrix.dot(&p);
            let np = adjoint_mul(matrix, &ap) + &p.mapv(|c| c * shift);
            let curvature: f64 = p
                .iter()
                .zip(np.iter())
                .map(|(a, b)| (a.conj() * b).re)
                .sum();
            if curvature <= 0.0 {
                break;
            }
            let alpha = rs / curvature;
            x.scaled_add(Complex64::from(alpha), &p);
            r.scaled_add(Complex64::from(-alpha), &np);

            let rs_new = norm_sq(&r);
            residual = rs_new.sqrt() / reference;
            if !residual.is_finite() {
                return Err(SolverError::ConvergenceFailure {
                    max_iter: self.options.iterations,
                    residual,
                });
            }
            if let Some(tol) = self.options.tolerance {
                if residual <= tol {
                    project(&mut x, self.options.enforce_real, self.options.enforce_positive);
                    return Ok(x);
                }
            }
            p = &r + &p.mapv(|c| c * (rs_new / rs));
            rs = rs_new;
        }

        if let Some(tol) = self.options.tolerance {
            if residual > tol {
                return Err(SolverError::ConvergenceFailure {
                    max_iter: self.options.iterations,
                    residual,
                });
            }
        }
        project(&mut x, self.options.enforce_real, self.options.enforce_positive);
        Ok(x)
    }

    fn name(&self) -> &'static str {
        "CGNR"
    }
}
