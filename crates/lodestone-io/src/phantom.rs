//! Synthetic system matrices and phantom measurements.
//!
//! The sensitivity of bin `b` at receiver `r` is a separable product of
//! Chebyshev polynomials $T_{m_x}(\xi_x) T_{m_y}(\xi_y) T_{m_z}(\xi_z)$ over
//! coordinates normalised to $(-1, 1)$ across the field of view, damped
//! with the mixing order and rotated by a bin/receiver phase. Receiver 1
//! swaps the x and y orders.

use lodestone_core::source::SourceError;
use lodestone_core::types::Grid;
use ndarray::{Array1, Array2, Array3};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::memory::{InMemoryCalibration, InMemoryMeasurement};

/// Synthetic scanner description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub grid: Grid,
    pub bins: usize,
    pub receivers: usize,
    /// Frequency of bin 0 (Hz).
    pub base_frequency: f64,
    /// Spacing between bins (Hz).
    pub frequency_step: f64,
    /// Duration of one acquisition cycle (s).
    pub cycle_duration: f64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            grid: Grid::new([8, 8, 1], [0.02, 0.02, 0.001], [0.0; 3]),
            bins: 40,
            receivers: 2,
            base_frequency: 2.5e4,
            frequency_step: 2.5e4,
            cycle_duration: 21.54e-3,
        }
    }
}

impl ScannerConfig {
    pub fn frequencies(&self) -> Vec<f64> {
        (0..self.bins)
            .map(|b| self.base_frequency + self.frequency_step * b as f64)
            .collect()
    }
}

/// Chebyshev polynomial of the first kind, by recurrence.
fn chebyshev(n: usize, x: f64) -> f64 {
    let (mut prev, mut cur) = (1.0, x);
    if n == 0 {
        return prev;
    }
    for _ in 1..n {
        let next = 2.0 * x * cur - prev;
        prev = cur;
        cur = next;
    }
    cur
}

/// Mixing orders `[m_x, m_y, m_z]` of a channel on a grid; flat axes stay
/// at order 0.
pub fn mixing_orders(bin: usize, receiver: usize, shape: [usize; 3]) -> [usize; 3] {
    let (mut mx, mut my) = (bin % 6, (bin / 6) % 6);
    let mz = if shape[2] > 1 { (bin / 36) % 3 } else { 0 };
    if receiver % 2 == 1 {
        std::mem::swap(&mut mx, &mut my);
    }
    [
        if shape[0] > 1 { mx } else { 0 },
        if shape[1] > 1 { my } else { 0 },
        mz,
    ]
}

/// Synthetic calibration for `config`.
pub fn system_matrix(config: &ScannerConfig) -> Result<InMemoryCalibration, SourceError> {
    let grid = &config.grid;
    let normalised: Vec<Vec<f64>> = (0..3)
        .map(|axis| {
            grid.axis_values(axis)
                .into_iter()
                .map(|v| 2.0 * (v - grid.center[axis]) / grid.fov[axis])
                .collect()
        })
        .collect();

    let channels = config.receivers * config.bins;
    let mut matrix = Array2::<Complex64>::zeros((grid.voxel_count(), channels));
    let mut snr = Array2::<f64>::zeros((config.bins, config.receivers));
    for receiver in 0..config.receivers {
        for bin in 0..config.bins {
            let orders = mixing_orders(bin, receiver, grid.shape);
            let damping = 1.0 / (1.0 + 0.1 * orders.iter().sum::<usize>() as f64);
            let phase = Complex64::from_polar(damping, 0.3 * bin as f64 + 1.1 * receiver as f64);
            let column = bin + config.bins * receiver;
            for voxel in 0..grid.voxel_count() {
                let [ix, iy, iz] = grid.cartesian_index(voxel);
                let value = chebyshev(orders[0], normalised[0][ix])
                    * chebyshev(orders[1], normalised[1][iy])
                    * chebyshev(orders[2], normalised[2][iz]);
                matrix[[voxel, column]] = phase * value;
            }
            snr[[bin, receiver]] = 60.0 * (1.0 - 0.2 * (receiver % 2) as f64) / (1.0 + 0.25 * bin as f64);
        }
    }
    InMemoryCalibration::new(grid.clone(), config.frequencies(), config.receivers, matrix, snr)
}

/// A spherical blob of tracer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dot {
    pub center: [f64; 3],
    pub radius: f64,
    pub intensity: f64,
}

/// Two dots inside the field of view of `grid`.
pub fn default_phantom(grid: &Grid) -> Vec<Dot> {
    let [fx, fy, _] = grid.fov;
    let [cx, cy, cz] = grid.center;
    vec![
        Dot {
            center: [cx - fx / 4.0, cy + fy / 8.0, cz],
            radius: fx / 6.0,
            intensity: 1.0,
        },
        Dot {
            center: [cx + fx / 5.0, cy - fy / 5.0, cz],
            radius: fx / 8.0,
            intensity: 0.5,
        },
    ]
}

/// Tracer concentration at every voxel centre of `grid`, x fastest.
pub fn sample_dots(grid: &Grid, dots: &[Dot]) -> Array1<f64> {
    let axes = [grid.axis_values(0), grid.axis_values(1), grid.axis_values(2)];
    Array1::from_shape_fn(grid.voxel_count(), |voxel| {
        let [ix, iy, iz] = grid.cartesian_index(voxel);
        let p = [axes[0][ix], axes[1][iy], axes[2][iz]];
        dots.iter()
            .filter(|d| {
                let r2: f64 = (0..3).map(|a| (p[a] - d.center[a]).powi(2)).sum();
                r2 <= d.radius * d.radius
            })
            .map(|d| d.intensity)
            .sum()
    })
}

/// Forward-simulate a measurement: one concentration volume per period,
/// with a slow linear rise of 25 % over the frames.
pub fn simulate_measurement(
    calibration: &InMemoryCalibration,
    volumes: &[Array1<f64>],
    frames: usize,
    cycle_duration: f64,
) -> Result<InMemoryMeasurement, SourceError> {
    let voxels = calibration.grid.voxel_count();
    if let Some(bad) = volumes.iter().find(|v| v.len() != voxels) {
        return Err(SourceError::Format(format!(
            "phantom has {} voxels, calibration grid has {}",
            bad.len(),
            voxels
        )));
    }
    let rows = calibration.matrix.ncols();
    // Noise-free signal per period: Sᵀ c.
    let signals: Vec<Array1<Complex64>> = volumes
        .iter()
        .map(|v| calibration.matrix.t().dot(&v.mapv(|c| Complex64::new(c, 0.0))))
        .collect();
    let data = Array3::from_shape_fn((rows, volumes.len(), frames), |(row, period, frame)| {
        let scale = 1.0 + 0.25 * frame as f64 / frames.max(1) as f64;
        signals[period][row] * scale
    });
    InMemoryMeasurement::new(calibration.frequencies.clone(), calibration.receivers, data, cycle_duration)
}

/// Focus points of `patches` patches tiled along x, centred on the origin.
pub fn patch_focus_points(grid: &Grid, patches: usize) -> Vec<[f64; 3]> {
    let offset = (patches as f64 - 1.0) / 2.0;
    (0..patches)
        .map(|p| [(p as f64 - offset) * grid.fov[0], 0.0, 0.0])
        .collect()
}

/// Calibration plus a multi-patch measurement of `dots`: patch `p` sees the
/// phantom through the calibration grid shifted to its focus point.
pub fn simulate_patches(
    config: &ScannerConfig,
    dots: &[Dot],
    patches: usize,
    frames: usize,
) -> Result<(InMemoryCalibration, InMemoryMeasurement), SourceError> {
    let calibration = system_matrix(config)?;
    let focus = patch_focus_points(&config.grid, patches.max(1));
    let volumes: Vec<Array1<f64>> = focus
        .iter()
        .map(|f| sample_dots(&config.grid.translated(*f), dots))
        .collect();
    let measurement = simulate_measurement(&calibration, &volumes, frames, config.cycle_duration)?.with_focus_points(focus);
    log::info!(
        "Simulated {} patch(es) x {} frames on a {:?} grid with {} channels",
        volumes.len(),
        frames,
        config.grid.shape,
        calibration.matrix.ncols()
    );
    Ok((calibration, measurement))
}
