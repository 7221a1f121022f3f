//! Trilinear resampling of system-matrix columns onto a new grid.

use ndarray::{Array2, ArrayView1, Axis};
use num_complex::Complex64;
use rayon::prelude::*;

use crate::types::Grid;

/// Interpolation stencil along one axis: two source indices and the weight
/// of the upper one. `None` marks a target outside the source lattice.
type Stencil = Option<(usize, usize, f64)>;

fn axis_stencils(from: &Grid, to: &Grid, axis: usize) -> Vec<Stencil> {
    let n = from.shape[axis];
    let origin = from.origin()[axis];
    let spacing = from.spacing()[axis];
    to.axis_values(axis)
        .into_iter()
        .map(|t| {
            let f = (t - origin) / spacing;
            // Half a voxel of slack on either side, clamped to the edge.
            if !f.is_finite() || f < -0.5 - 1e-9 || f > n as f64 - 0.5 + 1e-9 {
                return None;
            }
            if n == 1 {
                return Some((0, 0, 0.0));
            }
            let f = f.clamp(0.0, (n - 1) as f64);
            let lo = (f.floor() as usize).min(n - 2);
            Some((lo, lo + 1, f - lo as f64))
        })
        .collect()
}

fn resample_column(
    column: ArrayView1<Complex64>,
    from: &Grid,
    to: &Grid,
    stencils: &[Vec<Stencil>; 3],
) -> Vec<Complex64> {
    let [nx, ny, _] = from.shape;
    let at = |ix: usize, iy: usize, iz: usize| column[ix + nx * (iy + ny * iz)];
    let mut out = Vec::with_capacity(to.voxel_count());
    for sz in &stencils[2] {
        for sy in &stencils[1] {
            for sx in &stencils[0] {
                let value = match (sx, sy, sz) {
                    (Some((x0, x1, wx)), Some((y0, y1, wy)), Some((z0, z1, wz))) => {
                        let lerp = |a: Complex64, b: Complex64, w: f64| a * (1.0 - w) + b * w;
                        let c00 = lerp(at(*x0, *y0, *z0), at(*x1, *y0, *z0), *wx);
                        let c10 = lerp(at(*x0, *y1, *z0), at(*x1, *y1, *z0), *wx);
                        let c01 = lerp(at(*x0, *y0, *z1), at(*x1, *y0, *z1), *wx);
                        let c11 = lerp(at(*x0, *y1, *z1), at(*x1, *y1, *z1), *wx);
                        lerp(lerp(c00, c10, *wy), lerp(c01, c11, *wy), *wz)
                    }
                    _ => Complex64::new(0.0, 0.0),
                };
                out.push(value);
            }
        }
    }
    out
}

/// Resample every column of a `(voxels, channels)` matrix from `from` to
/// `to`. Target voxel centres outside the source lattice evaluate to zero.
pub fn interpolate_matrix(matrix: &Array2<Complex64>, from: &Grid, to: &Grid) -> Array2<Complex64> {
    log::warn!(
        "Interpolating system matrix from {:?} to {:?} voxels",
        from.shape,
        to.shape
    );
    let stencils = [
        axis_stencils(from, to, 0),
        axis_stencils(from, to, 1),
        axis_stencils(from, to, 2),
    ];
    let columns: Vec<Vec<Complex64>> = matrix
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| resample_column(column, from, to, &stencils))
        .collect();

    let mut out = Array2::<Complex64>::zeros((to.voxel_count(), matrix.ncols()));
    for (k, column) in columns.into_iter().enumerate() {
        for (i, value) in column.into_iter().enumerate() {
            out[[i, k]] = value;
        }
    }
    out
}
