//! Store-backed reconstructions from dataset files.

use std::path::PathBuf;

use lodestone_core::store::ReconstructionStore;
use lodestone_core::{reconstruct_paths, reconstruct_request, RecoError, RecoOptions, RecoRequest};
use lodestone_io::phantom::{default_phantom, simulate_patches, ScannerConfig};
use lodestone_io::{write_dataset, DatasetFile, DirectoryStore, JsonDatasetLoader, MemoryStore};

fn write_inputs(dir: &std::path::Path, patches: usize) -> (PathBuf, PathBuf) {
    let config = ScannerConfig::default();
    let (calibration, measurement) = simulate_patches(&config, &default_phantom(&config.grid), patches, 2).unwrap();
    let cal = dir.join("cal.json");
    let meas = dir.join("meas.json");
    write_dataset(&cal, &DatasetFile::Calibration(calibration)).unwrap();
    write_dataset(&meas, &DatasetFile::Measurement(measurement.with_calibration("cal.json"))).unwrap();
    (cal, meas)
}

fn request(meas: PathBuf, dir: PathBuf, iterations: usize) -> RecoRequest {
    RecoRequest {
        measurement: meas,
        calibration_dir: Some(dir),
        options: RecoOptions {
            snr_thresh: Some(5.0),
            iterations: Some(iterations),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn test_second_request_is_served_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let (_, meas) = write_inputs(dir.path(), 1);
    let mut store = DirectoryStore::open(dir.path().join("store")).unwrap();

    let req = request(meas.clone(), dir.path().to_path_buf(), 2);
    let first = reconstruct_request(&req, &JsonDatasetLoader, Some(&mut store)).unwrap();
    assert_eq!(store.ids().unwrap(), vec![0]);

    // Removing the calibration proves the second call never reads it.
    std::fs::remove_file(dir.path().join("cal.json")).unwrap();
    let second = reconstruct_request(&req, &JsonDatasetLoader, Some(&mut store)).unwrap();
    assert_eq!(first, second);
    assert_eq!(store.ids().unwrap(), vec![0]);

    // A different parameter set is a different key.
    let other = request(meas, dir.path().to_path_buf(), 3);
    assert!(reconstruct_request(&other, &JsonDatasetLoader, Some(&mut store)).is_err());
}

#[test]
fn test_patch_output_is_stored_whole() {
    let dir = tempfile::tempdir().unwrap();
    let (_, meas) = write_inputs(dir.path(), 2);
    let mut store = MemoryStore::new();
    let req = request(meas, dir.path().to_path_buf(), 1);
    let output = reconstruct_request(&req, &JsonDatasetLoader, Some(&mut store)).unwrap();
    assert_eq!(output.images().len(), 2);
    assert_eq!(store.len(), 1);
    let stored = store.load(0).unwrap();
    assert_eq!(stored, output);
}

#[test]
fn test_missing_calibration_hint_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = ScannerConfig::default();
    let (_, measurement) = simulate_patches(&config, &default_phantom(&config.grid), 1, 1).unwrap();
    let meas = dir.path().join("meas.json");
    write_dataset(&meas, &DatasetFile::Measurement(measurement)).unwrap();

    let err = reconstruct_request(&request(meas, dir.path().to_path_buf(), 1), &JsonDatasetLoader, None).unwrap_err();
    assert!(matches!(err, RecoError::Configuration(_)));
}

#[test]
fn test_two_calibrations_become_colors() {
    let dir = tempfile::tempdir().unwrap();
    let (cal, meas) = write_inputs(dir.path(), 1);
    let options = RecoOptions {
        snr_thresh: Some(5.0),
        iterations: Some(1),
        ..Default::default()
    };
    let output = reconstruct_paths(&[cal.clone(), cal], &meas, &options, &JsonDatasetLoader).unwrap();
    let images = output.into_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].colors(), 2);
    assert_eq!(images[0].grid.shape, ScannerConfig::default().grid.shape);
}
