//! Reconstruction entry points.
//!
//! Every entry resolves what it is missing and funnels into
//! [`reconstruct_with_selection`], which dispatches to the single-patch or
//! multi-patch pipeline depending on the number of acquisition periods per
//! frame.
//!
//! | inputs | entry |
//! |---|---|
//! | a request (paths + options), optionally store-backed | [`reconstruct_request`] |
//! | a measurement path and a calibration directory | [`reconstruct_path`] |
//! | calibration paths and a measurement path | [`reconstruct_paths`] |
//! | open sources | [`reconstruct_handles`] |
//! | open sources and a fixed frequency selection | [`reconstruct_with_selection`] |
//! | a raw system matrix and raw measurements | [`reconstruct_arrays`] |

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::conditioner::{condition, select_frequencies, ConditionOptions, FrequencyFilter};
use crate::error::RecoError;
use crate::multipatch::{focus_points, resolve_mapping, MultiPatchAssembler};
use crate::params::{RecoOptions, RecoParams};
use crate::solver::{create_solver, SolverConfig, SolverState};
use crate::source::{CalibrationSource, DatasetLoader, MeasurementSource, SourceError};
use crate::store::{RecoKey, ReconstructionStore};
use crate::streamer::{FrameStreamer, PatchSolve, StreamSettings};
use crate::types::{ChannelIndex, FrequencySelection, Grid, OutputImage, RecoOutput};

/// Everything needed to reconstruct from files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoRequest {
    pub measurement: PathBuf,
    /// Calibration files, in concatenation order. When empty, the path is
    /// derived from `calibration_dir` and the measurement's calibration
    /// hint.
    pub calibrations: Vec<PathBuf>,
    pub calibration_dir: Option<PathBuf>,
    /// Separate empty-scanner measurement used for background subtraction.
    pub background: Option<PathBuf>,
    pub options: RecoOptions,
}

fn default_calibration(measurement: &dyn MeasurementSource, dir: Option<&Path>) -> Result<PathBuf, RecoError> {
    let dir = dir.ok_or_else(|| {
        RecoError::Configuration("no calibration given and no calibration directory to derive one from".into())
    })?;
    let hint = measurement.calibration_hint().ok_or_else(|| {
        RecoError::Configuration("measurement does not name its calibration; pass one explicitly".into())
    })?;
    Ok(dir.join(hint))
}

/// Reconstruct from a request, consulting `store` first and saving the
/// result there when it had to be computed.
pub fn reconstruct_request(
    request: &RecoRequest,
    loader: &dyn DatasetLoader,
    store: Option<&mut dyn ReconstructionStore>,
) -> Result<RecoOutput, RecoError> {
    let measurement = loader.open_measurement(&request.measurement)?;
    let calibration_paths = if request.calibrations.is_empty() {
        vec![default_calibration(measurement.as_ref(), request.calibration_dir.as_deref())?]
    } else {
        request.calibrations.clone()
    };
    let params = request.options.resolve(measurement.as_ref())?;
    let key = RecoKey {
        measurement: request.measurement.display().to_string(),
        calibrations: calibration_paths.iter().map(|p| p.display().to_string()).collect(),
        background: request.background.as_ref().map(|p| p.display().to_string()),
        params: params.clone(),
    };

    if let Some(store) = store.as_deref() {
        if let Some(id) = store.find(&key)? {
            log::info!("Reusing stored reconstruction {}", id);
            return Ok(store.load(id)?);
        }
    }

    let calibrations = calibration_paths
        .iter()
        .map(|p| loader.open_calibration(p))
        .collect::<Result<Vec<_>, SourceError>>()?;
    let background = request
        .background
        .as_ref()
        .map(|p| loader.open_measurement(p))
        .transpose()?;

    let sources: Vec<&dyn CalibrationSource> = calibrations.iter().map(|c| c.as_ref()).collect();
    let mut output = reconstruct_resolved(&sources, measurement.as_ref(), background.as_deref(), &params)?;

    let inputs = serde_json::json!({
        "measurement": key.measurement,
        "calibrations": key.calibrations,
        "background": key.background,
    });
    for image in images_mut(&mut output) {
        image.provenance.insert("inputs".into(), inputs.clone());
    }

    if let Some(store) = store {
        let id = store.save(&key, &output)?;
        log::info!("Stored reconstruction as {}", id);
    }
    Ok(output)
}

/// Reconstruct a measurement file with the calibration derived from its
/// metadata inside `calibration_dir`.
pub fn reconstruct_path(
    measurement: &Path,
    calibration_dir: &Path,
    options: &RecoOptions,
    loader: &dyn DatasetLoader,
) -> Result<RecoOutput, RecoError> {
    let request = RecoRequest {
        measurement: measurement.to_path_buf(),
        calibration_dir: Some(calibration_dir.to_path_buf()),
        options: options.clone(),
        ..Default::default()
    };
    reconstruct_request(&request, loader, None)
}

/// Reconstruct a measurement file with explicit calibration files.
pub fn reconstruct_paths(
    calibrations: &[PathBuf],
    measurement: &Path,
    options: &RecoOptions,
    loader: &dyn DatasetLoader,
) -> Result<RecoOutput, RecoError> {
    if calibrations.is_empty() {
        return Err(RecoError::Configuration("at least one calibration path is required".into()));
    }
    let request = RecoRequest {
        measurement: measurement.to_path_buf(),
        calibrations: calibrations.to_vec(),
        options: options.clone(),
        ..Default::default()
    };
    reconstruct_request(&request, loader, None)
}

/// Reconstruct from open sources.
pub fn reconstruct_handles(
    calibrations: &[&dyn CalibrationSource],
    measurement: &dyn MeasurementSource,
    background: Option<&dyn MeasurementSource>,
    options: &RecoOptions,
) -> Result<RecoOutput, RecoError> {
    let params = options.resolve(measurement)?;
    reconstruct_resolved(calibrations, measurement, background, &params)
}

fn reconstruct_resolved(
    calibrations: &[&dyn CalibrationSource],
    measurement: &dyn MeasurementSource,
    background: Option<&dyn MeasurementSource>,
    params: &RecoParams,
) -> Result<RecoOutput, RecoError> {
    let selection = select_frequencies(calibrations, measurement, &FrequencyFilter::from_params(params))?;
    reconstruct_with_selection(calibrations, measurement, background, &selection, params)
}

/// Reconstruct with an already chosen frequency selection.
///
/// A measurement with one period per frame gives [`RecoOutput::Single`],
/// with one color per calibration. More periods give one image per patch.
pub fn reconstruct_with_selection(
    calibrations: &[&dyn CalibrationSource],
    measurement: &dyn MeasurementSource,
    background: Option<&dyn MeasurementSource>,
    selection: &FrequencySelection,
    params: &RecoParams,
) -> Result<RecoOutput, RecoError> {
    if calibrations.is_empty() {
        return Err(RecoError::Configuration("no calibration source given".into()));
    }
    if selection.is_empty() {
        return Err(RecoError::EmptySelection("no channels were passed in".into()));
    }
    params.validate(measurement)?;
    if let Some(missing) = selection.channels().iter().find(|c| !measurement.has_channel(c)) {
        return Err(SourceError::ChannelUnavailable(*missing).into());
    }

    let periods = measurement.periods_per_frame();
    log::info!(
        "Reconstructing frames {:?} ({} output frames, {} channels, {} period(s)) with {:?}",
        params.frames,
        params.output_frames(),
        selection.len(),
        periods,
        params.solver
    );
    if periods > 1 {
        reconstruct_patches(calibrations, measurement, background, selection, params).map(RecoOutput::Patches)
    } else {
        reconstruct_single(calibrations, measurement, background, selection, params).map(RecoOutput::Single)
    }
}

fn frame_streamer<'a>(
    measurement: &'a dyn MeasurementSource,
    background: Option<&dyn MeasurementSource>,
    selection: &'a FrequencySelection,
    params: &RecoParams,
) -> Result<FrameStreamer<'a>, RecoError> {
    let streamer = FrameStreamer::new(
        measurement,
        selection,
        StreamSettings::from_params(params, params.load_as_real),
    );
    match (background, &params.bg_frames) {
        (Some(empty), frames) => {
            let frames = frames.clone().unwrap_or(0..empty.frame_count());
            streamer.with_background(empty, frames)
        }
        (None, Some(frames)) => streamer.with_background(measurement, frames.clone()),
        (None, None) => Ok(streamer),
    }
}

fn frame_duration(measurement: &dyn MeasurementSource, params: &RecoParams) -> f64 {
    measurement.cycle_duration() * params.num_averages as f64
}

fn provenance(
    measurement: &dyn MeasurementSource,
    params: &RecoParams,
    selection: &FrequencySelection,
    solver: &SolverState,
) -> Result<BTreeMap<String, serde_json::Value>, RecoError> {
    let serialise = |e: serde_json::Error| RecoError::Configuration(format!("cannot record provenance: {}", e));
    let mut entries = BTreeMap::new();
    entries.insert("recoParams".to_string(), serde_json::to_value(params).map_err(serialise)?);
    entries.insert("channels".to_string(), serde_json::to_value(selection.channels()).map_err(serialise)?);
    entries.insert("solver".to_string(), serde_json::Value::from(solver.solver_name()));
    entries.insert("lambda".to_string(), serde_json::Value::from(solver.lambda()));
    entries.insert(
        "gradient".to_string(),
        serde_json::to_value(measurement.gradient_strength()).map_err(serialise)?,
    );
    Ok(entries)
}

fn reconstruct_single(
    calibrations: &[&dyn CalibrationSource],
    measurement: &dyn MeasurementSource,
    background: Option<&dyn MeasurementSource>,
    selection: &FrequencySelection,
    params: &RecoParams,
) -> Result<OutputImage, RecoError> {
    let conditioned = condition(calibrations, selection, &ConditionOptions::from_params(params))?;
    let grid = conditioned.grid;
    let solver = create_solver(
        conditioned.handle,
        conditioned.weights,
        conditioned.transform,
        &SolverConfig::from_params(params),
    )?;

    let mut image = OutputImage::zeros(
        grid,
        calibrations.len(),
        params.output_frames(),
        frame_duration(measurement, params),
    );
    image.provenance = provenance(measurement, params, selection, &solver)?;

    let mut assembler = MultiPatchAssembler::stacked(image);
    frame_streamer(measurement, background, selection, params)?
        .run(&[PatchSolve { period: 0, solver: &solver }], &mut assembler)?;
    assembler
        .into_images()
        .pop()
        .ok_or_else(|| RecoError::Configuration("assembler lost its image".into()))
}

fn reconstruct_patches(
    calibrations: &[&dyn CalibrationSource],
    measurement: &dyn MeasurementSource,
    background: Option<&dyn MeasurementSource>,
    selection: &FrequencySelection,
    params: &RecoParams,
) -> Result<Vec<OutputImage>, RecoError> {
    let periods = measurement.periods_per_frame();
    let mapping = resolve_mapping(params.mapping.as_deref(), calibrations.len(), periods)?;
    let points = focus_points(measurement, params.focus_points.as_deref());
    if points.len() != periods {
        return Err(RecoError::Configuration(format!(
            "{} focus points for {} patches",
            points.len(),
            periods
        )));
    }

    // One conditioned matrix and solver per calibration actually used.
    let options = ConditionOptions::from_params(params);
    let config = SolverConfig::from_params(params);
    let mut solvers: BTreeMap<usize, (SolverState, Grid)> = BTreeMap::new();
    for &index in &mapping {
        if solvers.contains_key(&index) {
            continue;
        }
        let conditioned = condition(&[calibrations[index]], selection, &options)?;
        let grid = conditioned.grid;
        let solver = create_solver(conditioned.handle, conditioned.weights, conditioned.transform, &config)?;
        solvers.insert(index, (solver, grid));
    }
    log::info!(
        "{} patches share {} conditioned calibration(s)",
        periods,
        solvers.len()
    );

    let mut images = Vec::with_capacity(periods);
    let mut patches = Vec::with_capacity(periods);
    for (period, &index) in mapping.iter().enumerate() {
        let (solver, grid) = &solvers[&index];
        let mut image = OutputImage::zeros(
            grid.translated(points[period]),
            1,
            params.output_frames(),
            frame_duration(measurement, params),
        );
        image.provenance = provenance(measurement, params, selection, solver)?;
        image.provenance.insert("patch".into(), serde_json::Value::from(period));
        image.provenance.insert("calibration".into(), serde_json::Value::from(index));
        images.push(image);
        patches.push(PatchSolve { period, solver });
    }

    let mut assembler = MultiPatchAssembler::patches(images);
    frame_streamer(measurement, background, selection, params)?.run(&patches, &mut assembler)?;
    Ok(assembler.into_images())
}

fn images_mut(output: &mut RecoOutput) -> Vec<&mut OutputImage> {
    match output {
        RecoOutput::Single(image) => vec![image],
        RecoOutput::Patches(images) => images.iter_mut().collect(),
    }
}

/// System matrix held in memory; channel `k` is receiver 0, bin `k`.
struct RawCalibration {
    matrix: Array2<Complex64>,
    grid: Grid,
}

impl CalibrationSource for RawCalibration {
    fn frequency_count(&self) -> usize {
        self.matrix.ncols()
    }

    fn receive_channels(&self) -> usize {
        1
    }

    /// Bin indices stand in for frequencies.
    fn frequencies(&self) -> Vec<f64> {
        (0..self.matrix.ncols()).map(|k| k as f64).collect()
    }

    fn snr(&self) -> Array2<f64> {
        Array2::ones((self.matrix.ncols(), 1))
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
        if let Some(bad) = channels.iter().find(|c| c.receiver != 0 || c.bin >= self.matrix.ncols()) {
            return Err(SourceError::ChannelUnavailable(*bad));
        }
        let columns: Vec<usize> = channels.iter().map(|c| c.bin).collect();
        Ok(self.matrix.select(Axis(1), &columns))
    }
}

/// Measurements held in memory, shape `(channels, frames)`, one period.
struct RawMeasurement {
    data: Array2<Complex64>,
}

impl MeasurementSource for RawMeasurement {
    fn frequency_count(&self) -> usize {
        self.data.nrows()
    }

    fn receive_channels(&self) -> usize {
        1
    }

    fn frequencies(&self) -> Vec<f64> {
        (0..self.data.nrows()).map(|k| k as f64).collect()
    }

    fn frame_count(&self) -> usize {
        self.data.ncols()
    }

    fn periods_per_frame(&self) -> usize {
        1
    }

    fn cycle_duration(&self) -> f64 {
        1.0
    }

    fn focus_point(&self, _period: usize) -> [f64; 3] {
        [0.0; 3]
    }

    fn measurement(&self, channels: &[ChannelIndex], frames: Range<usize>) -> Result<Array3<Complex64>, SourceError> {
        if frames.end > self.data.ncols() {
            return Err(SourceError::FrameOutOfRange {
                requested: frames,
                available: self.data.ncols(),
            });
        }
        if let Some(bad) = channels.iter().find(|c| !self.has_channel(c)) {
            return Err(SourceError::ChannelUnavailable(*bad));
        }
        Ok(Array3::from_shape_fn((channels.len(), 1, frames.len()), |(c, _, f)| {
            self.data[[channels[c].bin, frames.start + f]]
        }))
    }
}

/// Reconstruct from a raw `(voxels, channels)` system matrix on `grid` and
/// raw `(channels, frames)` measurements.
///
/// Frequencies are the channel indices, so `min_freq`/`max_freq` select by
/// index here.
pub fn reconstruct_arrays(
    matrix: Array2<Complex64>,
    grid: Grid,
    measurements: Array2<Complex64>,
    options: &RecoOptions,
) -> Result<RecoOutput, RecoError> {
    if matrix.nrows() != grid.voxel_count() {
        return Err(RecoError::ShapeMismatch {
            context: "system matrix rows vs. grid voxels",
            expected: grid.voxel_count(),
            found: matrix.nrows(),
        });
    }
    if measurements.nrows() != matrix.ncols() {
        return Err(RecoError::ShapeMismatch {
            context: "measurement rows vs. system matrix channels",
            expected: matrix.ncols(),
            found: measurements.nrows(),
        });
    }
    let calibration = RawCalibration { matrix, grid };
    let measurement = RawMeasurement { data: measurements };
    reconstruct_handles(&[&calibration], &measurement, None, options)
}
