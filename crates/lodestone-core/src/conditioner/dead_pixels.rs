//! Dead-pixel repair.
//!
//! A dead voxel's system-matrix row is overwritten with the average of its
//! two neighbours along x, then along y, then along z, each only when the
//! voxel lies strictly inside the grid along that axis. Later overwrites
//! win, so an interior voxel ends up with the z-axis average. Boundary
//! voxels along every axis are left untouched.

use ndarray::{Array1, Array2};
use num_complex::Complex64;

use crate::error::RecoError;
use crate::types::Grid;

/// Repair the rows of `matrix` (shape `(voxels, channels)`) listed in
/// `dead`, in the order given.
pub fn repair_dead_pixels(matrix: &mut Array2<Complex64>, grid: &Grid, dead: &[usize]) -> Result<(), RecoError> {
    let voxels = grid.voxel_count();
    if matrix.nrows() != voxels {
        return Err(RecoError::ShapeMismatch {
            context: "dead-pixel repair",
            expected: voxels,
            found: matrix.nrows(),
        });
    }
    let [nx, ny, nz] = grid.shape;
    let strides = [1, nx, nx * ny];
    let extents = [nx, ny, nz];

    for &index in dead {
        if index >= voxels {
            return Err(RecoError::Configuration(format!(
                "dead pixel {} outside a grid of {} voxels",
                index, voxels
            )));
        }
        let position = grid.cartesian_index(index);
        for axis in 0..3 {
            let p = position[axis];
            if p == 0 || p + 1 >= extents[axis] {
                continue;
            }
            let lo = index - strides[axis];
            let hi = index + strides[axis];
            let average: Array1<Complex64> = (&matrix.row(lo) + &matrix.row(hi)) / Complex64::from(2.0);
            matrix.row_mut(index).assign(&average);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        Grid::new([3, 3, 3], [0.03; 3], [0.0; 3])
    }

    fn ramp(grid: &Grid) -> Array2<Complex64> {
        Array2::from_shape_fn((grid.voxel_count(), 2), |(i, k)| {
            let [x, y, z] = grid.cartesian_index(i);
            Complex64::new((x + 10 * y + 100 * z) as f64, k as f64)
        })
    }

    #[test]
    fn test_interior_voxel_takes_z_average() {
        let grid = grid();
        let mut m = ramp(&grid);
        let center = grid.linear_index(1, 1, 1);
        let below = grid.linear_index(1, 1, 0);
        let above = grid.linear_index(1, 1, 2);
        // Make the z neighbours distinguishable from the x/y averages.
        m[[below, 0]] = Complex64::new(7.0, 0.0);
        m[[above, 0]] = Complex64::new(9.0, 0.0);
        m[[center, 0]] = Complex64::new(-1e6, 0.0);
        repair_dead_pixels(&mut m, &grid, &[center]).unwrap();
        assert_eq!(m[[center, 0]], Complex64::new(8.0, 0.0));
    }

    #[test]
    fn test_boundary_voxel_is_untouched() {
        let grid = grid();
        let mut m = ramp(&grid);
        let corner = grid.linear_index(0, 0, 0);
        m[[corner, 1]] = Complex64::new(42.0, 0.0);
        let before = m.row(corner).to_owned();
        repair_dead_pixels(&mut m, &grid, &[corner]).unwrap();
        assert_eq!(m.row(corner), before);
    }

    #[test]
    fn test_face_voxel_uses_last_interior_axis() {
        // Interior along x and y, on the z boundary: y average wins.
        let grid = grid();
        let mut m = ramp(&grid);
        let index = grid.linear_index(1, 1, 0);
        m[[grid.linear_index(1, 0, 0), 0]] = Complex64::new(2.0, 0.0);
        m[[grid.linear_index(1, 2, 0), 0]] = Complex64::new(4.0, 0.0);
        repair_dead_pixels(&mut m, &grid, &[index]).unwrap();
        assert_eq!(m[[index, 0]], Complex64::new(3.0, 0.0));
    }

    #[test]
    fn test_repair_is_idempotent_for_isolated_dead_pixels() {
        let grid = Grid::new([5, 5, 5], [0.05; 3], [0.0; 3]);
        let mut m = ramp(&grid);
        let dead = [grid.linear_index(1, 1, 1), grid.linear_index(3, 3, 3)];
        repair_dead_pixels(&mut m, &grid, &dead).unwrap();
        let once = m.clone();
        repair_dead_pixels(&mut m, &grid, &dead).unwrap();
        assert_eq!(m, once);
    }

    #[test]
    fn test_out_of_range_index_is_configuration_error() {
        let grid = grid();
        let mut m = ramp(&grid);
        assert!(matches!(
            repair_dead_pixels(&mut m, &grid, &[27]),
            Err(RecoError::Configuration(_))
        ));
    }
}
