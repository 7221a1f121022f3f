//! Accessors consumed from the instrument file-format layer.
//!
//! The pipeline never parses instrument files itself. It reads calibration
//! data through [`CalibrationSource`] and frequency-domain measurements
//! through [`MeasurementSource`]; `lodestone-io` provides in-memory and
//! file-backed implementations.

use std::ops::Range;
use std::path::Path;

use ndarray::{s, Array2, Array3, Axis};
use num_complex::Complex64;
use thiserror::Error;

use crate::types::{ChannelIndex, Grid};

/// Errors raised by calibration and measurement sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Frequency channel (receiver {}, bin {}) is not available", .0.receiver, .0.bin)]
    ChannelUnavailable(ChannelIndex),

    #[error("Frames {requested:?} exceed the {available} recorded frames")]
    FrameOutOfRange {
        requested: Range<usize>,
        available: usize,
    },

    #[error("Failed to read dataset: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed dataset: {0}")]
    Format(String),
}

/// A stored system matrix plus the grid and metadata it was measured on.
pub trait CalibrationSource {
    /// Number of frequency bins per receive channel.
    fn frequency_count(&self) -> usize;

    /// Number of receive channels.
    fn receive_channels(&self) -> usize;

    /// Frequency (Hz) of every bin.
    fn frequencies(&self) -> Vec<f64>;

    /// Signal-to-noise ratio per `(bin, receiver)`.
    fn snr(&self) -> Array2<f64>;

    /// Voxel counts of the calibration grid.
    fn grid_shape(&self) -> [usize; 3];

    /// Field of view of the calibration grid (metres).
    fn field_of_view(&self) -> [f64; 3];

    /// Centre of the calibration grid (metres).
    fn grid_center(&self) -> [f64; 3] {
        [0.0; 3]
    }

    /// Raw system matrix for the requested channels, shape
    /// `(voxels, channels)`, voxels x-fastest.
    fn system_matrix(&self, channels: &[ChannelIndex]) -> Result<Array2<Complex64>, SourceError>;

    /// The calibration lattice.
    fn grid(&self) -> Grid {
        Grid::new(self.grid_shape(), self.field_of_view(), self.grid_center())
    }

    /// Every channel this source can deliver.
    fn all_channels(&self) -> Vec<ChannelIndex> {
        let bins = self.frequency_count();
        (0..self.receive_channels())
            .flat_map(|rx| (0..bins).map(move |bin| ChannelIndex::new(rx, bin)))
            .collect()
    }
}

/// Frequency-domain measurement data.
pub trait MeasurementSource {
    /// Number of frequency bins per receive channel.
    fn frequency_count(&self) -> usize;

    /// Number of receive channels.
    fn receive_channels(&self) -> usize;

    /// Frequency (Hz) of every bin.
    fn frequencies(&self) -> Vec<f64>;

    /// Number of recorded frames.
    fn frame_count(&self) -> usize;

    /// Acquisition periods per frame; more than one means a multi-patch
    /// acquisition.
    fn periods_per_frame(&self) -> usize;

    /// Duration of one acquisition cycle (seconds).
    fn cycle_duration(&self) -> f64;

    /// Focus-point position of the given period (metres).
    fn focus_point(&self, period: usize) -> [f64; 3];

    /// Gradient strength of the selection field per axis (T/m).
    fn gradient_strength(&self) -> [f64; 3] {
        [0.0; 3]
    }

    /// Identifier of the calibration this measurement was taken for, used
    /// to derive a default system-matrix path.
    fn calibration_hint(&self) -> Option<String> {
        None
    }

    /// Raw measurement, shape `(channels, periods, frames)`.
    fn measurement(
        &self,
        channels: &[ChannelIndex],
        frames: Range<usize>,
    ) -> Result<Array3<Complex64>, SourceError>;

    /// Whether a channel is present in this measurement.
    fn has_channel(&self, channel: &ChannelIndex) -> bool {
        channel.receiver < self.receive_channels() && channel.bin < self.frequency_count()
    }

    /// Measurement averaged in consecutive groups of `num_averages` frames.
    ///
    /// Returns `ceil(frames.len() / num_averages)` columns along the last
    /// axis; a trailing partial group is averaged over the frames it has.
    fn averaged_measurement(
        &self,
        channels: &[ChannelIndex],
        frames: Range<usize>,
        num_averages: usize,
    ) -> Result<Array3<Complex64>, SourceError> {
        let raw = self.measurement(channels, frames)?;
        if num_averages <= 1 {
            return Ok(raw);
        }
        let (nc, np, nf) = raw.dim();
        let groups = nf.div_ceil(num_averages);
        let mut out = Array3::<Complex64>::zeros((nc, np, groups));
        for g in 0..groups {
            let lo = g * num_averages;
            let hi = (lo + num_averages).min(nf);
            let block = raw.slice(s![.., .., lo..hi]);
            let mean = block.sum_axis(Axis(2)) / Complex64::from((hi - lo) as f64);
            out.slice_mut(s![.., .., g]).assign(&mean);
        }
        Ok(out)
    }
}

/// Opens calibration and measurement sources from paths.
pub trait DatasetLoader {
    fn open_calibration(&self, path: &Path) -> Result<Box<dyn CalibrationSource>, SourceError>;

    fn open_measurement(&self, path: &Path) -> Result<Box<dyn MeasurementSource>, SourceError>;
}
