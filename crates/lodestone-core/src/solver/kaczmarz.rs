//! Regularised Kaczmarz solver.
//!
//! Row-action method on the augmented system $[A \; \sqrt\lambda I]
//! [c; v] = u$, which converges to the minimiser of
//! $\|Ac - u\|^2 + \lambda\|c\|^2$. One iteration sweeps every channel row
//! once; the real/non-negative projections are applied after each sweep.

use ndarray::{Array1, ArrayView1};
use num_complex::Complex64;

use super::{project, LinearSolver, SolverError, SolverHandle, SolverOptions};

pub struct Kaczmarz {
    options: SolverOptions,
}

impl Kaczmarz {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl LinearSolver for Kaczmarz {
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
        let (rows, cols) = matrix.dim();
        if rhs.len() != rows {
            return Err(SolverError::DimensionMismatch {
                expected: rows,
                found: rhs.len(),
            });
        }

        let sqrt_lambda = *lambda;
        let lambda_sq = lambda * lambda;
        let row_energy: Vec<f64> = matrix
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|c| c.norm_sqr()).sum())
            .collect();

        let mut x = Array1::<Complex64>::zeros(cols);
        let mut v = Array1::<Complex64>::zeros(rows);
        let mut change = f64::INFINITY;

        for _ in 0..self.options.iterations {
            let previous = x.clone();
            for (k, row) in matrix.rows().into_iter().enumerate() {
                let denom = row_energy[k] + lambda_sq;
                if denom == 0.0 {
                    continue;
                }
                let dot: Complex64 = row.iter().zip(x.iter()).map(|(a, xi)| a * xi).sum();
                let tau = (rhs[k] - dot - v[k] * sqrt_lambda) / denom;
                for (xi, a) in x.iter_mut().zip(row.iter()) {
                    *xi += tau * a.conj();
                }
                v[k] += tau * sqrt_lambda;
            }
            project(&mut x, self.options.enforce_real, self.options.enforce_positive);

            let norm: f64 = x.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
            let delta: f64 = x
                .iter()
                .zip(previous.iter())
                .map(|(a, b)| (a - b).norm_sqr())
                .sum::<f64>()
                .sqrt();
            change = if norm > 0.0 { delta / norm } else { delta };
            if let Some(tol) = self.options.tolerance {
                if change <= tol {
                    return Ok(x);
                }
            }
        }

        match self.options.tolerance {
            Some(_) => Err(SolverError::ConvergenceFailure {
                max_iter: self.options.iterations,
                residual: change,
            }),
            None => Ok(x),
        }
    }

    fn name(&self) -> &'static str {
        "Kaczmarz"
    }
}
