//! Job runner: ties together dataset loading, reconstruction and output.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use lodestone_core::conditioner::frequency::{select_frequencies, FrequencyFilter};
use lodestone_core::multipatch::compose_patches;
use lodestone_core::source::{CalibrationSource, DatasetLoader};
use lodestone_core::store::ReconstructionStore;
use lodestone_core::types::OutputImage;
use lodestone_core::{reco::reconstruct_request, RecoOutput, RecoRequest};
use lodestone_io::phantom::{default_phantom, simulate_patches, ScannerConfig};
use lodestone_io::{read_dataset, write_dataset, DatasetFile, DirectoryStore, JsonDatasetLoader};

use crate::config::JobConfig;

const CALIBRATION_FILE: &str = "calibration.json";
const MEASUREMENT_FILE: &str = "measurement.json";

fn request(job: &JobConfig) -> RecoRequest {
    RecoRequest {
        measurement: job.data.measurement.clone(),
        calibrations: job.data.calibrations.clone(),
        calibration_dir: job.data.calibration_dir.clone(),
        background: job.data.background.clone(),
        options: job.reconstruction.clone(),
    }
}

/// Run a reconstruction from a parsed job configuration.
pub fn run_reconstruction(job: &JobConfig) -> Result<RecoOutput> {
    let request = request(job);
    let mut store = job
        .output
        .store
        .as_ref()
        .map(DirectoryStore::open)
        .transpose()
        .context("opening reconstruction store")?;
    let output = reconstruct_request(
        &request,
        &JsonDatasetLoader,
        store.as_mut().map(|s| s as &mut dyn ReconstructionStore),
    )
    .with_context(|| format!("reconstructing {}", request.measurement.display()))?;

    for (i, image) in output.images().iter().enumerate() {
        let shape = image.data.shape();
        println!(
            "  Image {}: {} color(s) x {:?} voxels x {} frame(s), {:.3e} s per frame",
            i,
            shape[0],
            image.grid.shape,
            shape[4],
            image.frame_duration
        );
    }
    Ok(output)
}

fn write_image(image: &OutputImage, path: &Path) -> Result<()> {
    let json = serde_json::to_string(image).map_err(|e| anyhow::anyhow!("JSON serialisation error: {}", e))?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    println!("Image written to: {}", path.display());
    Ok(())
}

/// Write the reconstruction to `dir`: `image.json` for a single image,
/// `patch-<n>.json` per patch otherwise, plus `composite.json` when
/// requested. Returns the written paths.
pub fn write_output(output: &RecoOutput, dir: &Path, composite: bool) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut written = Vec::new();
    match output {
        RecoOutput::Single(image) => {
            let path = dir.join("image.json");
            write_image(image, &path)?;
            written.push(path);
        }
        RecoOutput::Patches(images) => {
            for (i, image) in images.iter().enumerate() {
                let path = dir.join(format!("patch-{}.json", i));
                write_image(image, &path)?;
                written.push(path);
            }
            if composite {
                let path = dir.join("composite.json");
                write_image(&compose_patches(images)?, &path)?;
                written.push(path);
            }
        }
    }
    Ok(written)
}

/// Open every input and run frequency selection without solving. Returns
/// the number of selected channels.
pub fn validate(job: &JobConfig) -> Result<usize> {
    let loader = JsonDatasetLoader;
    let measurement = loader
        .open_measurement(&job.data.measurement)
        .with_context(|| format!("opening {}", job.data.measurement.display()))?;
    let params = job.reconstruction.resolve(measurement.as_ref())?;

    let calibration_paths = if job.data.calibrations.is_empty() {
        let hint = measurement
            .calibration_hint()
            .context("no calibrations configured and the measurement names none")?;
        let dir = job.data.calibration_dir.clone().unwrap_or_default();
        vec![dir.join(hint)]
    } else {
        job.data.calibrations.clone()
    };
    let calibrations = calibration_paths
        .iter()
        .map(|p| loader.open_calibration(p).with_context(|| format!("opening {}", p.display())))
        .collect::<Result<Vec<_>>>()?;
    if let Some(background) = &job.data.background {
        loader
            .open_measurement(background)
            .with_context(|| format!("opening {}", background.display()))?;
    }

    let sources: Vec<&dyn CalibrationSource> = calibrations.iter().map(|c| c.as_ref()).collect();
    let selection = select_frequencies(&sources, measurement.as_ref(), &FrequencyFilter::from_params(&params))?;
    println!(
        "  {} calibration(s), {} patch(es), {} output frame(s), {} channel(s) selected",
        sources.len(),
        measurement.periods_per_frame(),
        params.output_frames(),
        selection.len()
    );
    Ok(selection.len())
}

/// Write a synthetic calibration, a phantom measurement and a ready-to-run
/// `job.toml` into `dir`.
pub fn simulate(dir: &Path, patches: usize, frames: usize) -> Result<()> {
    if patches == 0 || frames == 0 {
        anyhow::bail!("patches and frames must both be at least 1");
    }
    let config = ScannerConfig::default();
    let dots = default_phantom(&config.grid);
    let (calibration, measurement) = simulate_patches(&config, &dots, patches, frames)?;
    let measurement = measurement.with_calibration(CALIBRATION_FILE);

    write_dataset(&dir.join(CALIBRATION_FILE), &DatasetFile::Calibration(calibration))?;
    write_dataset(&dir.join(MEASUREMENT_FILE), &DatasetFile::Measurement(measurement))?;

    let job = format!(
        "[data]\nmeasurement = \"{}\"\ncalibration_dir = \".\"\n\n\
         [reconstruction]\nsnr_thresh = 5.0\niterations = 3\nlambda = 0.01\n\n\
         [output]\ndirectory = \"output\"\n",
        MEASUREMENT_FILE
    );
    let job_path = dir.join("job.toml");
    std::fs::write(&job_path, job).with_context(|| format!("writing {}", job_path.display()))?;
    println!("Synthetic dataset written to: {}", dir.display());
    Ok(())
}

/// Print the metadata of a dataset file.
pub fn info(path: &Path) -> Result<()> {
    let dataset = read_dataset(path).with_context(|| format!("reading {}", path.display()))?;
    for line in dataset.summary() {
        println!("  {}", line);
    }
    Ok(())
}
