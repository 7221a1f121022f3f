//! Reconstruction parameters.
//!
//! [`RecoOptions`] is the partial, user-facing option set: every field is
//! optional so it can be read straight from a TOML table. Calling
//! [`RecoOptions::resolve`] against a measurement returns a new,
//! fully-populated [`RecoParams`], which is what the pipeline consumes and
//! what gets attached to results for provenance.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::RecoError;
use crate::source::MeasurementSource;

/// Which solver runs the per-frame inverse problem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    /// Regularised row-action Kaczmarz.
    #[default]
    Kaczmarz,
    /// Conjugate gradients on the regularised normal equations.
    Cgnr,
    /// Truncated/regularised SVD pseudo-inverse.
    PseudoInverse,
    /// Direct Tikhonov solve via LU of the normal equations.
    Direct,
}

/// How the conditioned matrix is prepared for a solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverFamily {
    /// Transpose only; the solver handles λ itself.
    Iterative,
    /// Transpose and SVD factorisation.
    PseudoInverse,
    /// Transpose and LU factorisation of the normal equations.
    Direct,
}

impl SolverKind {
    pub fn family(self) -> SolverFamily {
        match self {
            SolverKind::Kaczmarz | SolverKind::Cgnr => SolverFamily::Iterative,
            SolverKind::PseudoInverse => SolverFamily::PseudoInverse,
            SolverKind::Direct => SolverFamily::Direct,
        }
    }
}

/// Per-channel weighting of the inverse problem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightType {
    /// No weighting.
    #[default]
    Uniform,
    /// `1 / ‖row‖` of every channel row.
    RowNorm,
    /// Caller-supplied weights, one per channel.
    Explicit(Vec<f64>),
}

/// Basis the solver operates in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparseTrafo {
    /// Voxel basis.
    #[default]
    Identity,
    /// Orthonormal 3-D DCT-II over the grid.
    Dct,
}

/// User-facing reconstruction options. Unset fields are filled in by
/// [`RecoOptions::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoOptions {
    /// Lowest usable frequency (Hz).
    pub min_freq: Option<f64>,
    /// Highest usable frequency (Hz).
    pub max_freq: Option<f64>,
    /// Minimum calibration SNR of a usable channel.
    pub snr_thresh: Option<f64>,
    /// Keep only this many channels with the highest SNR.
    pub num_used_freqs: Option<usize>,
    /// Receive channels to use.
    pub rec_channels: Option<Vec<usize>>,
    /// Foreground/background discrimination threshold.
    pub var_mean_thresh: Option<f64>,
    /// Foreground frames for the variance filter.
    pub fg_frames: Option<Range<usize>>,
    /// Background frames, for subtraction and the variance filter.
    pub bg_frames: Option<Range<usize>>,

    pub solver: Option<SolverKind>,
    pub iterations: Option<usize>,
    pub lambda: Option<f64>,
    /// Interpret `lambda` relative to `trace(AᴴA) / voxels`.
    pub relative_lambda: Option<bool>,
    pub tolerance: Option<f64>,
    pub enforce_real: Option<bool>,
    pub enforce_positive: Option<bool>,
    pub sparse_trafo: Option<SparseTrafo>,
    pub weight_type: Option<WeightType>,

    /// Target grid voxel counts.
    pub gridsize: Option<[usize; 3]>,
    /// Target field of view (metres).
    pub fov: Option<[f64; 3]>,
    /// Target grid centre relative to the calibration centre (metres).
    pub center: Option<[f64; 3]>,
    /// Voxel indices whose system-matrix rows need repair.
    pub dead_pixels: Option<Vec<usize>>,
    /// Split complex channels into real/imaginary pairs.
    pub load_as_real: Option<bool>,

    pub frames: Option<Range<usize>>,
    pub num_averages: Option<usize>,
    /// Frames loaded and solved per chunk.
    pub chunk_size: Option<usize>,
    /// Zero measurement entries whose magnitude is below this value.
    pub noise_threshold: Option<f64>,

    /// Calibration index per patch.
    pub mapping: Option<Vec<usize>>,
    /// Focus-point override per patch (metres).
    pub focus_points: Option<Vec<[f64; 3]>>,
}

/// Fully resolved, immutable reconstruction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoParams {
    pub min_freq: f64,
    pub max_freq: Option<f64>,
    pub snr_thresh: Option<f64>,
    pub num_used_freqs: Option<usize>,
    pub rec_channels: Vec<usize>,
    pub var_mean_thresh: Option<f64>,
    pub fg_frames: Option<Range<usize>>,
    pub bg_frames: Option<Range<usize>>,

    pub solver: SolverKind,
    pub iterations: usize,
    pub lambda: f64,
    pub relative_lambda: bool,
    pub tolerance: Option<f64>,
    pub enforce_real: bool,
    pub enforce_positive: bool,
    pub sparse_trafo: SparseTrafo,
    pub weight_type: WeightType,

    pub gridsize: Option<[usize; 3]>,
    pub fov: Option<[f64; 3]>,
    pub center: [f64; 3],
    pub dead_pixels: Vec<usize>,
    pub load_as_real: bool,

    pub frames: Range<usize>,
    pub num_averages: usize,
    pub chunk_size: usize,
    pub noise_threshold: Option<f64>,

    pub mapping: Option<Vec<usize>>,
    pub focus_points: Option<Vec<[f64; 3]>>,
}

pub const DEFAULT_ITERATIONS: usize = 10;
pub const DEFAULT_CHUNK_SIZE: usize = 256;

impl RecoOptions {
    /// Fill every unset option from defaults and the measurement metadata,
    /// validating what can be checked before any data is loaded.
    pub fn resolve(&self, measurement: &dyn MeasurementSource) -> Result<RecoParams, RecoError> {
        let rec_channels = self
            .rec_channels
            .clone()
            .unwrap_or_else(|| (0..measurement.receive_channels()).collect());

        let params = RecoParams {
            frames: self.frames.clone().unwrap_or(0..measurement.frame_count()),
            num_averages: self.num_averages.unwrap_or(1),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            lambda: self.lambda.unwrap_or(0.0),
            min_freq: self.min_freq.unwrap_or(0.0),
            max_freq: self.max_freq,
            snr_thresh: self.snr_thresh,
            num_used_freqs: self.num_used_freqs,
            rec_channels,
            var_mean_thresh: self.var_mean_thresh,
            fg_frames: self.fg_frames.clone(),
            bg_frames: self.bg_frames.clone(),
            solver: self.solver.unwrap_or_default(),
            iterations: self.iterations.unwrap_or(DEFAULT_ITERATIONS),
            relative_lambda: self.relative_lambda.unwrap_or(true),
            tolerance: self.tolerance,
            enforce_real: self.enforce_real.unwrap_or(true),
            enforce_positive: self.enforce_positive.unwrap_or(true),
            sparse_trafo: self.sparse_trafo.unwrap_or_default(),
            weight_type: self.weight_type.clone().unwrap_or_default(),
            gridsize: self.gridsize,
            fov: self.fov,
            center: self.center.unwrap_or([0.0; 3]),
            dead_pixels: self.dead_pixels.clone().unwrap_or_default(),
            load_as_real: self.load_as_real.unwrap_or(false),
            noise_threshold: self.noise_threshold,
            mapping: self.mapping.clone(),
            focus_points: self.focus_points.clone(),
        };
        params.validate(measurement)?;
        Ok(params)
    }
}

impl RecoParams {
    /// Check the parameters against a measurement. Every entry point that
    /// accepts a `RecoParams` directly runs this before any data is loaded.
    pub fn validate(&self, measurement: &dyn MeasurementSource) -> Result<(), RecoError> {
        let frame_count = measurement.frame_count();
        if self.frames.is_empty() || self.frames.end > frame_count {
            return Err(RecoError::Configuration(format!(
                "frames {:?} invalid for a measurement with {} frames",
                self.frames, frame_count
            )));
        }
        if self.num_averages == 0 {
            return Err(RecoError::Configuration("num_averages must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(RecoError::Configuration("chunk_size must be at least 1".into()));
        }
        if self.lambda.is_nan() || self.lambda < 0.0 {
            return Err(RecoError::Configuration(format!(
                "lambda must be non-negative, got {}",
                self.lambda
            )));
        }
        if self.var_mean_thresh.is_some() && (self.fg_frames.is_none() || self.bg_frames.is_none()) {
            return Err(RecoError::Configuration(
                "var_mean_thresh requires both fg_frames and bg_frames".into(),
            ));
        }

        let periods = measurement.periods_per_frame();
        if let Some(mapping) = &self.mapping {
            if mapping.len() != periods {
                return Err(RecoError::Configuration(format!(
                    "mapping has {} entries but the measurement has {} patches",
                    mapping.len(),
                    periods
                )));
            }
        }
        if let Some(points) = &self.focus_points {
            if points.len() != periods {
                return Err(RecoError::Configuration(format!(
                    "{} focus points given for {} patches",
                    points.len(),
                    periods
                )));
            }
        }
        if let Some(gridsize) = self.gridsize {
            if gridsize.iter().any(|&n| n == 0) {
                return Err(RecoError::Configuration(format!(
                    "gridsize {:?} has an empty axis",
                    gridsize
                )));
            }
        }
        Ok(())
    }

    /// Number of output frames after averaging.
    pub fn output_frames(&self) -> usize {
        self.frames.len().div_ceil(self.num_averages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;
    use crate::types::ChannelIndex;
    use ndarray::Array3;
    use num_complex::Complex64;

    struct Stub {
        frames: usize,
        periods: usize,
    }

    impl MeasurementSource for Stub {
        fn frequency_count(&self) -> usize {
            4
        }
        fn receive_channels(&self) -> usize {
            2
        }
        fn frequencies(&self) -> Vec<f64> {
            vec![0.0, 1.0, 2.0, 3.0]
        }
        fn frame_count(&self) -> usize {
            self.frames
        }
        fn periods_per_frame(&self) -> usize {
            self.periods
        }
        fn cycle_duration(&self) -> f64 {
            0.02
        }
        fn focus_point(&self, _period: usize) -> [f64; 3] {
            [0.0; 3]
        }
        fn measurement(
            &self,
            channels: &[ChannelIndex],
            frames: Range<usize>,
        ) -> Result<Array3<Complex64>, SourceError> {
            Ok(Array3::zeros((channels.len(), self.periods, frames.len())))
        }
    }

    #[test]
    fn test_resolve_backfills_defaults() {
        let params = RecoOptions::default()
            .resolve(&Stub { frames: 7, periods: 1 })
            .unwrap();
        assert_eq!(params.frames, 0..7);
        assert_eq!(params.rec_channels, vec![0, 1]);
        assert_eq!(params.solver, SolverKind::Kaczmarz);
        assert_eq!(params.iterations, DEFAULT_ITERATIONS);
        assert!(params.relative_lambda);
        assert!(params.enforce_real);
    }

    #[test]
    fn test_resolve_rejects_frames_beyond_measurement() {
        let opts = RecoOptions {
            frames: Some(0..9),
            ..Default::default()
        };
        let err = opts.resolve(&Stub { frames: 7, periods: 1 }).unwrap_err();
        assert!(matches!(err, RecoError::Configuration(_)));
    }

    #[test]
    fn test_resolve_rejects_mapping_patch_count_mismatch() {
        let opts = RecoOptions {
            mapping: Some(vec![0, 0, 0]),
            ..Default::default()
        };
        let err = opts.resolve(&Stub { frames: 2, periods: 4 }).unwrap_err();
        assert!(matches!(err, RecoError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_hand_built_params() {
        let stub = Stub { frames: 6, periods: 1 };
        let params = RecoOptions::default().resolve(&stub).unwrap();
        assert!(params.validate(&stub).is_ok());

        let mut zero_averages = params.clone();
        zero_averages.num_averages = 0;
        let mut zero_chunk = params.clone();
        zero_chunk.chunk_size = 0;
        let mut negative_lambda = params.clone();
        negative_lambda.lambda = -1.0;
        let mut empty_frames = params.clone();
        empty_frames.frames = 3..3;
        let mut lone_threshold = params.clone();
        lone_threshold.var_mean_thresh = Some(1.0);
        for bad in [zero_averages, zero_chunk, negative_lambda, empty_frames, lone_threshold] {
            assert!(matches!(bad.validate(&stub), Err(RecoError::Configuration(_))));
        }
    }

    #[test]
    fn test_output_frames_rounds_up() {
        let opts = RecoOptions {
            frames: Some(0..10),
            num_averages: Some(3),
            ..Default::default()
        };
        let params = opts.resolve(&Stub { frames: 10, periods: 1 }).unwrap();
        assert_eq!(params.output_frames(), 4);
    }

    #[test]
    fn test_options_deserialise_snake_case_variants() {
        let json = r#"{"solver": "pseudo_inverse", "weight_type": "row_norm", "frames": {"start": 1, "end": 3}}"#;
        let opts: RecoOptions = serde_json::from_str(json).unwrap();
        assert_eq!(opts.solver, Some(SolverKind::PseudoInverse));
        assert_eq!(opts.weight_type, Some(WeightType::RowNorm));
        assert_eq!(opts.frames, Some(1..3));
    }
}
