//! System-matrix conditioning.
//!
//! Turns one or more calibration sources plus a frequency selection into a
//! solver-ready handle: fetch the selected columns, repair dead pixels,
//! resample onto the reconstruction grid, stack sources, unpack to real
//! form, transpose to channel-major order, weight, transform and finally
//! factorise for the chosen solver family.

pub mod dead_pixels;
pub mod frequency;
pub mod interpolate;

use ndarray::{concatenate, Array1, Array2, Axis};
use num_complex::Complex64;

pub use dead_pixels::repair_dead_pixels;
pub use frequency::{select_frequencies, FrequencyFilter, VarianceFilter};
pub use interpolate::interpolate_matrix;

use crate::error::RecoError;
use crate::params::{RecoParams, SolverFamily, SparseTrafo, WeightType};
use crate::solver::{SolverHandle, SparseTransform};
use crate::source::CalibrationSource;
use crate::types::{FrequencySelection, Grid};

/// Conditioning settings derived from the resolved parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOptions {
    pub family: SolverFamily,
    /// Target voxel counts; the calibration's when unset.
    pub gridsize: Option<[usize; 3]>,
    /// Target field of view; the calibration's when unset.
    pub fov: Option<[f64; 3]>,
    /// Offset added to the calibration grid centre.
    pub center: [f64; 3],
    pub dead_pixels: Vec<usize>,
    pub load_as_real: bool,
    pub weight_type: WeightType,
    pub sparse_trafo: SparseTrafo,
}

impl ConditionOptions {
    pub fn from_params(params: &RecoParams) -> Self {
        Self {
            family: params.solver.family(),
            gridsize: params.gridsize,
            fov: params.fov,
            center: params.center,
            dead_pixels: params.dead_pixels.clone(),
            load_as_real: params.load_as_real,
            weight_type: params.weight_type.clone(),
            sparse_trafo: params.sparse_trafo,
        }
    }

    /// Reconstruction grid for a calibration grid.
    pub fn target_grid(&self, calibration: &Grid) -> Grid {
        Grid {
            shape: self.gridsize.unwrap_or(calibration.shape),
            fov: self.fov.unwrap_or(calibration.fov),
            center: [
                calibration.center[0] + self.center[0],
                calibration.center[1] + self.center[1],
                calibration.center[2] + self.center[2],
            ],
        }
    }
}

/// A conditioned system matrix ready for [`crate::solver::create_solver`].
pub struct Conditioned {
    pub handle: SolverHandle,
    /// Grid of the first source; every source shares its voxel count.
    pub grid: Grid,
    /// Voxel count per stacked source, in source order.
    pub voxel_counts: Vec<usize>,
    /// Per-row weights already folded into the handle.
    pub weights: Option<Array1<f64>>,
    pub transform: SparseTransform,
    /// Whether rows are real-unpacked `(re, im)` pairs.
    pub real: bool,
    pub selection: FrequencySelection,
}

impl Conditioned {
    /// Rows the measurement vector must have.
    pub fn channels(&self) -> usize {
        self.handle.shape().0
    }

    pub fn voxels(&self) -> usize {
        self.handle.shape().1
    }
}

/// Load one source's selected columns onto its reconstruction grid.
fn load_source(
    source: &dyn CalibrationSource,
    selection: &FrequencySelection,
    options: &ConditionOptions,
) -> Result<(Array2<Complex64>, Grid), RecoError> {
    let calibration_grid = source.grid();
    let mut matrix = source.system_matrix(selection.channels())?;
    if matrix.nrows() != calibration_grid.voxel_count() {
        return Err(RecoError::ShapeMismatch {
            context: "system matrix rows",
            expected: calibration_grid.voxel_count(),
            found: matrix.nrows(),
        });
    }
    if matrix.ncols() != selection.len() {
        return Err(RecoError::ShapeMismatch {
            context: "system matrix columns",
            expected: selection.len(),
            found: matrix.ncols(),
        });
    }

    repair_dead_pixels(&mut matrix, &calibration_grid, &options.dead_pixels)?;

    let target = options.target_grid(&calibration_grid);
    if target.same_lattice(&calibration_grid) {
        return Ok((matrix, calibration_grid));
    }
    let resampled = interpolate_matrix(&matrix, &calibration_grid, &target);
    Ok((resampled, target))
}

/// Split real and imaginary parts: `(N, M)` complex becomes `(N, 2M)` with
/// the real parts of every channel first and the imaginary parts second,
/// stored as zero-imaginary complex.
fn unpack_real(matrix: &Array2<Complex64>) -> Array2<Complex64> {
    let (n, m) = matrix.dim();
    Array2::from_shape_fn((n, 2 * m), |(i, k)| {
        let value = if k < m { matrix[[i, k]].re } else { matrix[[i, k - m]].im };
        Complex64::new(value, 0.0)
    })
}

fn row_weights(matrix: &Array2<Complex64>, weight_type: &WeightType) -> Result<Option<Array1<f64>>, RecoError> {
    match weight_type {
        WeightType::Uniform => Ok(None),
        WeightType::RowNorm => Ok(Some(
            matrix
                .rows()
                .into_iter()
                .map(|row| {
                    let norm = row.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
                    if norm > 0.0 {
                        1.0 / norm
                    } else {
                        0.0
                    }
                })
                .collect(),
        )),
        WeightType::Explicit(weights) => {
            if weights.len() != matrix.nrows() {
                return Err(RecoError::ShapeMismatch {
                    context: "explicit channel weights",
                    expected: matrix.nrows(),
                    found: weights.len(),
                });
            }
            Ok(Some(Array1::from(weights.clone())))
        }
    }
}

/// Condition calibration sources for reconstruction.
///
/// Several sources are stacked along the voxel axis so their blocks solve
/// jointly; they must share a voxel count. The returned grid is the first
/// source's.
pub fn condition(
    sources: &[&dyn CalibrationSource],
    selection: &FrequencySelection,
    options: &ConditionOptions,
) -> Result<Conditioned, RecoError> {
    if sources.is_empty() {
        return Err(RecoError::Configuration("no calibration source given".into()));
    }
    if selection.is_empty() {
        return Err(RecoError::EmptySelection("nothing to condition".into()));
    }

    let mut blocks = Vec::with_capacity(sources.len());
    let mut grids: Vec<Grid> = Vec::with_capacity(sources.len());
    for source in sources {
        let (block, grid) = load_source(*source, selection, options)?;
        if let Some(first) = grids.first() {
            if grid.voxel_count() != first.voxel_count() {
                return Err(RecoError::Configuration(format!(
                    "stacked calibrations need equal voxel counts, got {} and {}",
                    first.voxel_count(),
                    grid.voxel_count()
                )));
            }
        }
        blocks.push(block);
        grids.push(grid);
    }
    let voxel_counts: Vec<usize> = grids.iter().map(Grid::voxel_count).collect();
    let shapes: Vec<[usize; 3]> = grids.iter().map(|g| g.shape).collect();
    let grid = grids.swap_remove(0);

    let stacked = if blocks.len() == 1 {
        blocks.swap_remove(0)
    } else {
        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| RecoError::Configuration(e.to_string()))?
    };

    let unpacked = if options.load_as_real {
        unpack_real(&stacked)
    } else {
        stacked
    };

    // Channel-major: one row per (receiver, bin) or per re/im component.
    let mut matrix = unpacked.t().as_standard_layout().into_owned();

    let weights = row_weights(&matrix, &options.weight_type)?;
    if let Some(w) = &weights {
        for (mut row, wk) in matrix.rows_mut().into_iter().zip(w.iter()) {
            row.mapv_inplace(|c| c * *wk);
        }
    }

    let transform = SparseTransform::for_blocks(options.sparse_trafo, &shapes);
    transform.transform_rows(&mut matrix)?;

    log::info!(
        "Conditioned {} channels x {} voxels from {} calibration(s){}",
        matrix.nrows(),
        matrix.ncols(),
        sources.len(),
        if options.load_as_real { ", real-unpacked" } else { "" }
    );
    let handle = SolverHandle::build(options.family, matrix)?;

    Ok(Conditioned {
        handle,
        grid,
        voxel_counts,
        weights,
        transform,
        real: options.load_as_real,
        selection: selection.clone(),
    })
}
