//! Solver handles: the conditioned system matrix in the form a solver
//! family needs.
//!
//! Iterative solvers read the transposed matrix directly. The pseudo-inverse
//! keeps a thin SVD plus the regularised reciprocal singular values. The
//! direct solver keeps the matrix and an LU factorisation of the
//! regularised normal equations. Only [`SolverHandle::set_regularization`]
//! mutates a handle, recomputing the λ-dependent factor in place.

use faer::complex_native::c64;
use faer::linalg::solvers::PartialPivLu;
use faer::Mat;
use nalgebra::DMatrix;
use ndarray::{Array1, Array2};
use num_complex::Complex64;

use super::SolverError;
use crate::params::SolverFamily;

/// Thin SVD $A = U \Sigma V^H$ with precomputed $\sigma / (\sigma^2 + \lambda^2)$.
pub struct SvdFactor {
    /// Left singular vectors, `(channels, rank)`.
    pub u: Array2<Complex64>,
    /// Singular values, descending.
    pub singular_values: Array1<f64>,
    /// Right singular vectors, `(voxels, rank)`.
    pub v: Array2<Complex64>,
    /// Regularised reciprocal singular values.
    pub damped: Array1<f64>,
    lambda: f64,
}

/// Matrix plus LU of $A^H A + \lambda^2 I$.
pub struct TikhonovFactor {
    /// Transposed system matrix, `(channels, voxels)`.
    pub matrix: Array2<Complex64>,
    normal: Array2<Complex64>,
    lu: PartialPivLu<c64>,
    lambda: f64,
}

/// Inversion-method-specific representation of the conditioned matrix.
pub enum SolverHandle {
    /// Transposed matrix `(channels, voxels)` for iterative solvers.
    Matrix {
        matrix: Array2<Complex64>,
        lambda: f64,
    },
    Svd(SvdFactor),
    Tikhonov(TikhonovFactor),
}

impl SolverHandle {
    /// Build the handle for `family` from a transposed `(channels, voxels)`
    /// matrix, with λ = 0.
    pub fn build(family: SolverFamily, matrix: Array2<Complex64>) -> Result<Self, SolverError> {
        match family {
            SolverFamily::Iterative => Ok(SolverHandle::Matrix { matrix, lambda: 0.0 }),
            SolverFamily::PseudoInverse => Ok(SolverHandle::Svd(SvdFactor::new(&matrix)?)),
            SolverFamily::Direct => Ok(SolverHandle::Tikhonov(TikhonovFactor::new(matrix))),
        }
    }

    /// `(channels, voxels)`.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            SolverHandle::Matrix { matrix, .. } => matrix.dim(),
            SolverHandle::Svd(f) => (f.u.nrows(), f.v.nrows()),
            SolverHandle::Tikhonov(f) => f.matrix.dim(),
        }
    }

    /// Number of entries of the represented matrix.
    pub fn element_count(&self) -> usize {
        let (rows, cols) = self.shape();
        rows * cols
    }

    /// Current regularisation value λ (the objective uses λ²).
    pub fn regularization(&self) -> f64 {
        match self {
            SolverHandle::Matrix { lambda, .. } => *lambda,
            SolverHandle::Svd(f) => f.lambda,
            SolverHandle::Tikhonov(f) => f.lambda,
        }
    }

    /// Set λ and recompute any λ-dependent factor.
    pub fn set_regularization(&mut self, lambda: f64) {
        match self {
            SolverHandle::Matrix { lambda: l, .. } => *l = lambda,
            SolverHandle::Svd(f) => f.set_regularization(lambda),
            SolverHandle::Tikhonov(f) => f.set_regularization(lambda),
        }
    }

    /// $\|A\|_F^2 = \mathrm{trace}(A^H A)$.
    pub fn frobenius_norm_sq(&self) -> f64 {
        match self {
            SolverHandle::Matrix { matrix, .. } => matrix.iter().map(|c| c.norm_sqr()).sum(),
            SolverHandle::Svd(f) => f.singular_values.iter().map(|s| s * s).sum(),
            SolverHandle::Tikhonov(f) => f.matrix.iter().map(|c| c.norm_sqr()).sum(),
        }
    }

    /// The raw transposed matrix, when the handle keeps one.
    pub fn matrix(&self) -> Option<&Array2<Complex64>> {
        match self {
            SolverHandle::Matrix { matrix, .. } => Some(matrix),
            SolverHandle::Svd(_) => None,
            SolverHandle::Tikhonov(f) => Some(&f.matrix),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SolverHandle::Matrix { .. } => "matrix",
            SolverHandle::Svd(_) => "SVD",
            SolverHandle::Tikhonov(_) => "LU",
        }
    }
}

impl SvdFactor {
    fn new(matrix: &Array2<Complex64>) -> Result<Self, SolverError> {
        let (rows, cols) = matrix.dim();
        let m = DMatrix::<Complex64>::from_fn(rows, cols, |i, j| matrix[[i, j]]);
        let svd = m.svd(true, true);
        let u = svd
            .u
            .ok_or_else(|| SolverError::LinAlgError("SVD did not return U".into()))?;
        let v_t = svd
            .v_t
            .ok_or_else(|| SolverError::LinAlgError("SVD did not return Vᴴ".into()))?;
        let rank = svd.singular_values.len();

        let u = Array2::from_shape_fn((rows, rank), |(i, k)| u[(i, k)]);
        let v = Array2::from_shape_fn((cols, rank), |(j, k)| v_t[(k, j)].conj());
        let singular_values = Array1::from_iter(svd.singular_values.iter().copied());

        let mut factor = Self {
            u,
            damped: Array1::zeros(rank),
            singular_values,
            v,
            lambda: 0.0,
        };
        factor.set_regularization(0.0);
        Ok(factor)
    }

    fn set_regularization(&mut self, lambda: f64) {
        let l2 = lambda * lambda;
        self.damped = self
            .singular_values
            .mapv(|s| if s * s + l2 > 0.0 { s / (s * s + l2) } else { 0.0 });
        self.lambda = lambda;
    }
}

impl TikhonovFactor {
    fn new(matrix: Array2<Complex64>) -> Self {
        let normal = matrix.t().mapv(|c| c.conj()).dot(&matrix);
        let lu = factorise(&normal, 0.0);
        Self {
            matrix,
            normal,
            lu,
            lambda: 0.0,
        }
    }

    fn set_regularization(&mut self, lambda: f64) {
        self.lu = factorise(&self.normal, lambda * lambda);
        self.lambda = lambda;
    }

    /// Solve $(A^H A + \lambda^2 I) x = A^H b$.
    pub(crate) fn solve(&self, rhs: &Array1<Complex64>) -> Array1<Complex64> {
        use faer::linalg::solvers::SpSolver;

        let ahb = self
            .matrix
            .t()
            .dot(&rhs.mapv(|c| c.conj()))
            .mapv(|c| c.conj());
        let n = ahb.len();
        let faer_rhs = faer::Col::<c64>::from_fn(n, |i| c64::new(ahb[i].re, ahb[i].im));
        let sol = self.lu.solve(&faer_rhs);
        Array1::from_shape_fn(n, |i| {
            let c = sol[i];
            Complex64::new(c.re, c.im)
        })
    }
}

fn factorise(normal: &Array2<Complex64>, shift: f64) -> PartialPivLu<c64> {
    let n = normal.nrows();
    let mat = Mat::<c64>::from_fn(n, n, |i, j| {
        let c = normal[[i, j]];
        let re = if i == j { c.re + shift } else { c.re };
        c64::new(re, c.im)
    });
    mat.partial_piv_lu()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn sample() -> Array2<Complex64> {
        array![
            [Complex64::new(1.0, 0.5), Complex64::new(0.0, 1.0), Complex64::new(2.0, 0.0)],
            [Complex64::new(0.5, 0.0), Complex64::new(3.0, -1.0), Complex64::new(0.0, 0.0)],
        ]
    }

    #[test]
    fn test_shape_and_element_count_agree_across_families() {
        for family in [SolverFamily::Iterative, SolverFamily::PseudoInverse, SolverFamily::Direct] {
            let handle = SolverHandle::build(family, sample()).unwrap();
            assert_eq!(handle.shape(), (2, 3));
            assert_eq!(handle.element_count(), 6);
        }
    }

    #[test]
    fn test_frobenius_norm_matches_singular_values() {
        let plain = SolverHandle::build(SolverFamily::Iterative, sample()).unwrap();
        let svd = SolverHandle::build(SolverFamily::PseudoInverse, sample()).unwrap();
        assert_relative_eq!(plain.frobenius_norm_sq(), svd.frobenius_norm_sq(), epsilon = 1e-10);
    }

    #[test]
    fn test_set_regularization_updates_damped_values() {
        let mut handle = SolverHandle::build(SolverFamily::PseudoInverse, sample()).unwrap();
        handle.set_regularization(0.5);
        assert_relative_eq!(handle.regularization(), 0.5);
        if let SolverHandle::Svd(f) = &handle {
            for (s, d) in f.singular_values.iter().zip(f.damped.iter()) {
                assert_relative_eq!(*d, s / (s * s + 0.25), epsilon = 1e-12);
            }
        } else {
            panic!("expected SVD handle");
        }
    }
}
