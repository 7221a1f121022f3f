//! Sparse-basis transforms.
//!
//! With a transform $B$ (orthonormal), the solver works on
//! $A B^T$ and returns coefficients $x$; the voxel vector is $B^T x$.
//! Rows of the channel-major matrix are transformed once during
//! conditioning; solved vectors are transformed back per frame.

use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};
use num_complex::Complex64;

use super::SolverError;
use crate::params::SparseTrafo;

/// Orthonormal separable DCT-II over a 3-D grid.
#[derive(Debug, Clone)]
pub struct Dct3 {
    shape: [usize; 3],
    /// Basis matrix per axis (x, y, z); rows are basis functions.
    bases: [Array2<f64>; 3],
}

impl Dct3 {
    pub fn new(shape: [usize; 3]) -> Self {
        Self {
            shape,
            bases: [dct_matrix(shape[0]), dct_matrix(shape[1]), dct_matrix(shape[2])],
        }
    }

    fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Apply the basis (or its transpose) along every axis of one block.
    fn apply(&self, block: ArrayView1<Complex64>, transpose: bool) -> Array1<Complex64> {
        let [nx, ny, nz] = self.shape;
        // x is fastest in the linear layout, so it is the last axis here.
        let mut volume = Array3::from_shape_fn((nz, ny, nx), |(iz, iy, ix)| {
            block[ix + nx * (iy + ny * iz)]
        });
        for (axis, basis) in [(2, &self.bases[0]), (1, &self.bases[1]), (0, &self.bases[2])] {
            for mut lane in volume.lanes_mut(Axis(axis)) {
                let src = lane.to_owned();
                let n = src.len();
                for k in 0..n {
                    let mut acc = Complex64::new(0.0, 0.0);
                    for j in 0..n {
                        let w = if transpose { basis[[j, k]] } else { basis[[k, j]] };
                        acc += src[j] * w;
                    }
                    lane[k] = acc;
                }
            }
        }
        let mut out = Array1::<Complex64>::zeros(self.len());
        for ((iz, iy, ix), value) in volume.indexed_iter() {
            out[ix + nx * (iy + ny * iz)] = *value;
        }
        out
    }
}

/// Orthonormal DCT-II matrix of size `n`.
fn dct_matrix(n: usize) -> Array2<f64> {
    let nf = n as f64;
    Array2::from_shape_fn((n, n), |(k, j)| {
        let alpha = if k == 0 { (1.0 / nf).sqrt() } else { (2.0 / nf).sqrt() };
        alpha * (std::f64::consts::PI * (2.0 * j as f64 + 1.0) * k as f64 / (2.0 * nf)).cos()
    })
}

/// Change of basis wrapped around the solve.
#[derive(Debug, Clone, Default)]
pub enum SparseTransform {
    #[default]
    Identity,
    /// One DCT per calibration block, applied in order and repeated when
    /// the voxel vector holds several copies of the block sequence.
    Dct(Vec<Dct3>),
}

impl SparseTransform {
    pub fn new(kind: SparseTrafo, shape: [usize; 3]) -> Self {
        Self::for_blocks(kind, &[shape])
    }

    /// Transform for a voxel vector made of consecutive grids of `shapes`.
    pub fn for_blocks(kind: SparseTrafo, shapes: &[[usize; 3]]) -> Self {
        match kind {
            SparseTrafo::Identity => SparseTransform::Identity,
            SparseTrafo::Dct => SparseTransform::Dct(shapes.iter().map(|&s| Dct3::new(s)).collect()),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, SparseTransform::Identity)
    }

    /// Voxel space to transform space.
    pub fn forward(&self, v: ArrayView1<Complex64>) -> Result<Array1<Complex64>, SolverError> {
        self.blockwise(v, false)
    }

    /// Transform space back to voxel space.
    pub fn inverse(&self, v: ArrayView1<Complex64>) -> Result<Array1<Complex64>, SolverError> {
        self.blockwise(v, true)
    }

    fn blockwise(&self, v: ArrayView1<Complex64>, transpose: bool) -> Result<Array1<Complex64>, SolverError> {
        let blocks = match self {
            SparseTransform::Identity => return Ok(v.to_owned()),
            SparseTransform::Dct(blocks) => blocks,
        };
        let period: usize = blocks.iter().map(Dct3::len).sum();
        if period == 0 || v.len() % period != 0 {
            return Err(SolverError::DimensionMismatch {
                expected: period,
                found: v.len(),
            });
        }
        let mut out = Array1::<Complex64>::zeros(v.len());
        let mut start = 0;
        for dct in blocks.iter().cycle() {
            if start == v.len() {
                break;
            }
            let end = start + dct.len();
            let transformed = dct.apply(v.slice(ndarray::s![start..end]), transpose);
            out.slice_mut(ndarray::s![start..end]).assign(&transformed);
            start = end;
        }
        Ok(out)
    }

    /// Transform every row of a channel-major `(channels, voxels)` matrix.
    pub fn transform_rows(&self, matrix: &mut Array2<Complex64>) -> Result<(), SolverError> {
        if self.is_identity() {
            return Ok(());
        }
        for mut row in matrix.rows_mut() {
            let transformed = self.forward(row.view())?;
            row.assign(&transformed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dct_matrix_is_orthonormal() {
        let m = dct_matrix(5);
        let product = m.dot(&m.t());
        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((product[[i, j]] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_inverse_undoes_forward_over_two_blocks() {
        let t = SparseTransform::new(SparseTrafo::Dct, [3, 2, 2]);
        let v = Array1::from_shape_fn(24, |i| Complex64::new(i as f64, (i % 5) as f64));
        let back = t.inverse(t.forward(v.view()).unwrap().view()).unwrap();
        for (a, b) in v.iter().zip(back.iter()) {
            assert!((a - b).norm() < 1e-10);
        }
    }

    #[test]
    fn test_constant_volume_compacts_to_one_coefficient() {
        let t = SparseTransform::new(SparseTrafo::Dct, [4, 3, 2]);
        let v = Array1::from_elem(24, Complex64::new(1.0, 0.0));
        let coeffs = t.forward(v.view()).unwrap();
        assert!((coeffs[0].re - 24f64.sqrt()).abs() < 1e-10);
        assert!(coeffs.iter().skip(1).all(|c| c.norm() < 1e-10));
    }

    #[test]
    fn test_each_block_uses_its_own_lattice() {
        let t = SparseTransform::for_blocks(SparseTrafo::Dct, &[[4, 1, 1], [2, 2, 1]]);
        let alone = SparseTransform::new(SparseTrafo::Dct, [2, 2, 1]);
        let v = Array1::from_shape_fn(8, |i| Complex64::new((i * i) as f64, 0.0));
        let coeffs = t.forward(v.view()).unwrap();
        let second = alone.forward(v.slice(ndarray::s![4..8])).unwrap();
        for (a, b) in coeffs.slice(ndarray::s![4..8]).iter().zip(second.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
        let back = t.inverse(coeffs.view()).unwrap();
        for (a, b) in v.iter().zip(back.iter()) {
            assert!((a - b).norm() < 1e-10);
        }
    }

    #[test]
    fn test_rejects_partial_block() {
        let t = SparseTransform::new(SparseTrafo::Dct, [2, 2, 2]);
        let v = Array1::<Complex64>::zeros(7);
        assert!(t.forward(v.view()).is_err());
    }
}
