//! Chunked frame loop.
//!
//! The measurement is fetched and solved one chunk of frames at a time so
//! peak memory is bounded by the chunk size. Frames are solved and handed
//! to the sink in increasing time order.

use std::ops::Range;

use ndarray::{concatenate, s, Array2, Array3, ArrayView2, Axis};
use num_complex::Complex64;

use crate::error::RecoError;
use crate::params::RecoParams;
use crate::solver::SolverState;
use crate::source::MeasurementSource;
use crate::types::FrequencySelection;

/// Consecutive frame sub-ranges covering `frames`.
///
/// Each chunk is `max(num_averages, chunk_size - chunk_size % num_averages)`
/// frames long, except possibly the last, so averaging groups never
/// straddle two chunks.
pub fn chunk_ranges(frames: Range<usize>, chunk_size: usize, num_averages: usize) -> Vec<Range<usize>> {
    let num_averages = num_averages.max(1);
    let step = (chunk_size - chunk_size % num_averages).max(num_averages);
    let mut chunks = Vec::with_capacity(frames.len().div_ceil(step));
    let mut start = frames.start;
    while start < frames.end {
        let end = (start + step).min(frames.end);
        chunks.push(start..end);
        start = end;
    }
    chunks
}

/// Receives solved chunks of shape `(voxels, frames)`, where `voxels` is
/// the concatenation of every patch's solved block in patch order.
pub trait FrameSink {
    fn write_chunk(&mut self, solved: ArrayView2<f64>) -> Result<(), RecoError>;
}

/// One acquisition period and the solver that reconstructs it.
pub struct PatchSolve<'a> {
    pub period: usize,
    pub solver: &'a SolverState,
}

/// Frame-loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub frames: Range<usize>,
    pub num_averages: usize,
    pub chunk_size: usize,
    pub noise_threshold: Option<f64>,
    /// Measurements are fed as `[re…, im…]` real vectors.
    pub real: bool,
}

impl StreamSettings {
    pub fn from_params(params: &RecoParams, real: bool) -> Self {
        Self {
            frames: params.frames.clone(),
            num_averages: params.num_averages,
            chunk_size: params.chunk_size,
            noise_threshold: params.noise_threshold,
            real,
        }
    }
}

/// Streams one measurement through one or more patch solvers.
pub struct FrameStreamer<'a> {
    measurement: &'a dyn MeasurementSource,
    selection: &'a FrequencySelection,
    settings: StreamSettings,
    /// Averaged background, shape `(channels, periods)`.
    background: Option<Array2<Complex64>>,
}

impl<'a> FrameStreamer<'a> {
    pub fn new(
        measurement: &'a dyn MeasurementSource,
        selection: &'a FrequencySelection,
        settings: StreamSettings,
    ) -> Self {
        Self {
            measurement,
            selection,
            settings,
            background: None,
        }
    }

    /// Average `frames` of `source` once and subtract it from every chunk.
    ///
    /// An empty or out-of-range frame set disables subtraction with a
    /// warning.
    pub fn with_background(mut self, source: &dyn MeasurementSource, frames: Range<usize>) -> Result<Self, RecoError> {
        if frames.is_empty() || frames.end > source.frame_count() {
            log::warn!(
                "Background frames {:?} unavailable ({} frames); skipping background subtraction",
                frames,
                source.frame_count()
            );
            return Ok(self);
        }
        let raw = source.measurement(self.selection.channels(), frames.clone())?;
        let periods = self.measurement.periods_per_frame();
        if raw.dim().1 != periods && raw.dim().1 != 1 {
            return Err(RecoError::ShapeMismatch {
                context: "background periods",
                expected: periods,
                found: raw.dim().1,
            });
        }
        let mean = raw.sum_axis(Axis(2)) / Complex64::from(frames.len() as f64);
        log::debug!("Background averaged over frames {:?}", frames);
        self.background = Some(mean);
        Ok(self)
    }

    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    /// Fetch, average, correct and threshold one chunk.
    fn load_chunk(&self, frames: Range<usize>) -> Result<Array3<Complex64>, RecoError> {
        let channels = self.selection.channels();
        let mut block = self
            .measurement
            .averaged_measurement(channels, frames, self.settings.num_averages)?;
        if block.dim().0 != channels.len() {
            return Err(RecoError::ShapeMismatch {
                context: "measurement channels",
                expected: channels.len(),
                found: block.dim().0,
            });
        }
        if let Some(background) = &self.background {
            for mut lane in block.axis_iter_mut(Axis(2)) {
                if background.ncols() == lane.ncols() {
                    lane -= background;
                } else {
                    lane -= &background.column(0).insert_axis(Axis(1));
                }
            }
        }
        if let Some(threshold) = self.settings.noise_threshold {
            block.mapv_inplace(|u| if u.norm() < threshold { Complex64::new(0.0, 0.0) } else { u });
        }
        Ok(block)
    }

    /// `(channels, n)` complex block as the solver's right-hand sides.
    fn right_hand_sides(&self, block: ArrayView2<Complex64>) -> Array2<Complex64> {
        if !self.settings.real {
            return block.to_owned();
        }
        let channels = block.nrows();
        Array2::from_shape_fn((2 * channels, block.ncols()), |(row, col)| {
            let u = block[[row % channels, col]];
            Complex64::new(if row < channels { u.re } else { u.im }, 0.0)
        })
    }

    /// Run every chunk through `patches` and write the results to `sink`.
    ///
    /// Returns the number of output frames written.
    pub fn run(&self, patches: &[PatchSolve<'_>], sink: &mut dyn FrameSink) -> Result<usize, RecoError> {
        let periods = self.measurement.periods_per_frame();
        for patch in patches {
            if patch.period >= periods {
                return Err(RecoError::Configuration(format!(
                    "patch period {} outside a measurement with {} periods",
                    patch.period, periods
                )));
            }
        }

        let chunks = chunk_ranges(
            self.settings.frames.clone(),
            self.settings.chunk_size,
            self.settings.num_averages,
        );
        let mut written = 0;
        for (index, frames) in chunks.iter().enumerate() {
            let block = self.load_chunk(frames.clone())?;
            let mut solved = Vec::with_capacity(patches.len());
            for patch in patches {
                let rhs = self.right_hand_sides(block.slice(s![.., patch.period, ..]));
                if rhs.nrows() != patch.solver.channels() {
                    return Err(RecoError::ShapeMismatch {
                        context: "measurement rows vs. system matrix channels",
                        expected: patch.solver.channels(),
                        found: rhs.nrows(),
                    });
                }
                let x = patch.solver.solve_batch(rhs.view())?;
                solved.push(x.mapv(|c| c.re));
            }
            let views: Vec<_> = solved.iter().map(|x| x.view()).collect();
            let stacked = concatenate(Axis(0), &views).map_err(|e| RecoError::Configuration(e.to_string()))?;
            sink.write_chunk(stacked.view())?;
            written += stacked.ncols();
            log::debug!(
                "Chunk {}/{}: frames {:?} -> {} output frames",
                index + 1,
                chunks.len(),
                frames,
                stacked.ncols()
            );
        }
        Ok(written)
    }
}
