//! In-memory calibration and measurement sources.
//!
//! Both hold complete datasets and serve any channel/frame subset. They are
//! also the payload of the JSON dataset format, see
//! [`DatasetFile`](crate::dataset::DatasetFile).

use std::ops::Range;

use lodestone_core::source::{CalibrationSource, MeasurementSource, SourceError};
use lodestone_core::types::{ChannelIndex, Grid};
use ndarray::{Array2, Array3, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Calibration with the full system matrix in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InMemoryCalibration {
    /// Frequency of every bin (Hz).
    pub frequencies: Vec<f64>,
    pub receivers: usize,
    pub grid: Grid,
    /// Shape `(voxels, receivers * bins)`, columns in linear channel order.
    pub matrix: Array2<Complex64>,
    /// Shape `(bins, receivers)`.
    pub snr: Array2<f64>,
    #[serde(default)]
    pub gradient: [f64; 3],
}

impl InMemoryCalibration {
    pub fn new(
        grid: Grid,
        frequencies: Vec<f64>,
        receivers: usize,
        matrix: Array2<Complex64>,
        snr: Array2<f64>,
    ) -> Result<Self, SourceError> {
        let calibration = Self {
            frequencies,
            receivers,
            grid,
            matrix,
            snr,
            gradient: [0.0; 3],
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Check that the matrix and SNR table agree with the grid and channel
    /// counts.
    pub fn validate(&self) -> Result<(), SourceError> {
        let bins = self.frequencies.len();
        let expected = (self.grid.voxel_count(), self.receivers * bins);
        if self.matrix.dim() != expected {
            return Err(SourceError::Format(format!(
                "system matrix is {:?}, expected {:?}",
                self.matrix.dim(),
                expected
            )));
        }
        if self.snr.dim() != (bins, self.receivers) {
            return Err(SourceError::Format(format!(
                "SNR table is {:?}, expected {:?}",
                self.snr.dim(),
                (bins, self.receivers)
            )));
        }
        Ok(())
    }
}

impl CalibrationSource for InMemoryCalibration {
    fn frequency_count(&self) -> usize {
        self.frequencies.len()
    }

    fn receive_channels(&self) -> usize {
        self.receivers
    }

    fn frequencies(&self) -> Vec<f64> {
        self.frequencies.clone()
    }

    fn snr(&self) -> Array2<f64> {
        self.snr.clone()
    }

    fn grid_shape(&self) -> [usize; 3] {
        self.grid.shape
    }

    fn field_of_view(&self) -> [f64; 3] {
        self.grid.fov
    }

    fn grid_center(&self) -> [f64; 3] {
        self.grid.center
    }

    fn system_matrix(&self, channels: &[ChannelIndex]) -> Result<Array2<Complex64>, SourceError> {
        let bins = self.frequencies.len();
        let columns = channels
            .iter()
            .map(|c| {
                if c.receiver < self.receivers && c.bin < bins {
                    Ok(c.linear(bins))
                } else {
                    Err(SourceError::ChannelUnavailable(*c))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.matrix.select(Axis(1), &columns))
    }
}

/// Measurement with all frames in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InMemoryMeasurement {
    pub frequencies: Vec<f64>,
    pub receivers: usize,
    /// Shape `(receivers * bins, periods, frames)`, rows in linear channel
    /// order.
    pub data: Array3<Complex64>,
    pub cycle_duration: f64,
    /// One focus point per period; missing entries default to the origin.
    #[serde(default)]
    pub focus_points: Vec<[f64; 3]>,
    /// File name of the calibration this measurement belongs to.
    #[serde(default)]
    pub calibration: Option<String>,
    #[serde(default)]
    pub gradient: [f64; 3],
}

impl InMemoryMeasurement {
    pub fn new(frequencies: Vec<f64>, receivers: usize, data: Array3<Complex64>, cycle_duration: f64) -> Result<Self, SourceError> {
        let measurement = Self {
            frequencies,
            receivers,
            data,
            cycle_duration,
            focus_points: Vec::new(),
            calibration: None,
            gradient: [0.0; 3],
        };
        measurement.validate()?;
        Ok(measurement)
    }

    pub fn with_focus_points(mut self, points: Vec<[f64; 3]>) -> Self {
        self.focus_points = points;
        self
    }

    pub fn with_calibration(mut self, name: impl Into<String>) -> Self {
        self.calibration = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        let rows = self.receivers * self.frequencies.len();
        if self.data.dim().0 != rows {
            return Err(SourceError::Format(format!(
                "measurement has {} channel rows, expected {}",
                self.data.dim().0,
                rows
            )));
        }
        if self.focus_points.len() > self.data.dim().1 {
            return Err(SourceError::Format(format!(
                "{} focus points for {} periods",
                self.focus_points.len(),
                self.data.dim().1
            )));
        }
        Ok(())
    }
}

impl MeasurementSource for InMemoryMeasurement {
    fn frequency_count(&self) -> usize {
        self.frequencies.len()
    }

    fn receive_channels(&self) -> usize {
        self.receivers
    }

    fn frequencies(&self) -> Vec<f64> {
        self.frequencies.clone()
    }

    fn frame_count(&self) -> usize {
        self.data.dim().2
    }

    fn periods_per_frame(&self) -> usize {
        self.data.dim().1
    }

    fn cycle_duration(&self) -> f64 {
        self.cycle_duration
    }

    fn focus_point(&self, period: usize) -> [f64; 3] {
        self.focus_points.get(period).copied().unwrap_or([0.0; 3])
    }

    fn gradient_strength(&self) -> [f64; 3] {
        self.gradient
    }

    fn calibration_hint(&self) -> Option<String> {
        self.calibration.clone()
    }

    fn measurement(&self, channels: &[ChannelIndex], frames: Range<usize>) -> Result<Array3<Complex64>, SourceError> {
        let available = self.frame_count();
        if frames.start > frames.end || frames.end > available {
            return Err(SourceError::FrameOutOfRange {
                requested: frames,
                available,
            });
        }
        let bins = self.frequencies.len();
        let rows = channels
            .iter()
            .map(|c| {
                if self.has_channel(c) {
                    Ok(c.linear(bins))
                } else {
                    Err(SourceError::ChannelUnavailable(*c))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let window = self.data.slice(ndarray::s![.., .., frames]);
        Ok(window.select(Axis(0), &rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement() -> InMemoryMeasurement {
        // 2 receivers x 2 bins, 1 period, 3 frames; value = 10·row + frame.
        let data = Array3::from_shape_fn((4, 1, 3), |(r, _, f)| Complex64::new((10 * r + f) as f64, 0.0));
        InMemoryMeasurement::new(vec![1e3, 2e3], 2, data, 0.5).unwrap()
    }

    #[test]
    fn test_measurement_selects_channels_and_frames() {
        let m = measurement();
        let block = m
            .measurement(&[ChannelIndex::new(1, 0), ChannelIndex::new(0, 1)], 1..3)
            .unwrap();
        assert_eq!(block.dim(), (2, 1, 2));
        assert_eq!(block[[0, 0, 0]].re, 21.0);
        assert_eq!(block[[1, 0, 1]].re, 12.0);
    }

    #[test]
    fn test_frames_out_of_range() {
        let m = measurement();
        assert!(matches!(
            m.measurement(&[ChannelIndex::new(0, 0)], 2..5),
            Err(SourceError::FrameOutOfRange { available: 3, .. })
        ));
    }

    #[test]
    fn test_averaged_measurement_rounds_up() {
        let m = measurement();
        let avg = m.averaged_measurement(&[ChannelIndex::new(0, 0)], 0..3, 2).unwrap();
        assert_eq!(avg.dim(), (1, 1, 2));
        assert_eq!(avg[[0, 0, 0]].re, 0.5);
        assert_eq!(avg[[0, 0, 1]].re, 2.0);
    }

    #[test]
    fn test_calibration_rejects_bad_shape() {
        let grid = Grid::new([2, 1, 1], [0.02, 0.01, 0.01], [0.0; 3]);
        let result = InMemoryCalibration::new(
            grid,
            vec![1e3],
            1,
            Array2::zeros((3, 1)),
            Array2::ones((1, 1)),
        );
        assert!(matches!(result, Err(SourceError::Format(_))));
    }

    #[test]
    fn test_calibration_columns_follow_linear_order() {
        let grid = Grid::new([1, 1, 1], [0.01; 3], [0.0; 3]);
        let matrix = Array2::from_shape_fn((1, 4), |(_, k)| Complex64::new(k as f64, 0.0));
        let cal = InMemoryCalibration::new(grid, vec![1e3, 2e3], 2, matrix, Array2::ones((2, 2))).unwrap();
        let s = cal.system_matrix(&[ChannelIndex::new(1, 1), ChannelIndex::new(0, 1)]).unwrap();
        assert_eq!(s[[0, 0]].re, 3.0);
        assert_eq!(s[[0, 1]].re, 1.0);
        assert!(cal.system_matrix(&[ChannelIndex::new(2, 0)]).is_err());
    }
}
