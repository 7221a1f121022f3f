//! JSON dataset files.
//!
//! A dataset file holds either a calibration or a measurement, tagged by
//! `"kind"`:
//!
//! ```json
//! { "kind": "calibration", "frequencies": [...], "receivers": 2, "grid": {...}, ... }
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use lodestone_core::source::{CalibrationSource, DatasetLoader, MeasurementSource, SourceError};
use serde::{Deserialize, Serialize};

use crate::memory::{InMemoryCalibration, InMemoryMeasurement};

/// Contents of one dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetFile {
    Calibration(InMemoryCalibration),
    Measurement(InMemoryMeasurement),
}

impl DatasetFile {
    pub fn kind(&self) -> &'static str {
        match self {
            DatasetFile::Calibration(_) => "calibration",
            DatasetFile::Measurement(_) => "measurement",
        }
    }

    /// Human-readable metadata lines.
    pub fn summary(&self) -> Vec<String> {
        let band = |f: &[f64]| match (f.first(), f.last()) {
            (Some(lo), Some(hi)) => format!("{} bins, {:.3e}–{:.3e} Hz", f.len(), lo, hi),
            _ => "no frequency bins".to_string(),
        };
        match self {
            DatasetFile::Calibration(c) => vec![
                "Kind: calibration".to_string(),
                format!("Frequencies: {}", band(&c.frequencies)),
                format!("Receive channels: {}", c.receivers),
                format!("Grid: {:?} voxels, FOV {:?} m, centre {:?} m", c.grid.shape, c.grid.fov, c.grid.center),
                format!("Gradient: {:?} T/m", c.gradient),
            ],
            DatasetFile::Measurement(m) => {
                let (_, periods, frames) = m.data.dim();
                vec![
                    "Kind: measurement".to_string(),
                    format!("Frequencies: {}", band(&m.frequencies)),
                    format!("Receive channels: {}", m.receivers),
                    format!("Frames: {} ({} period(s) each, cycle {:.3e} s)", frames, periods, m.cycle_duration),
                    format!("Gradient: {:?} T/m", m.gradient),
                    format!("Calibration: {}", m.calibration.as_deref().unwrap_or("(none)")),
                ]
            }
        }
    }
}

fn format_error(path: &Path, e: serde_json::Error) -> SourceError {
    SourceError::Format(format!("{}: {}", path.display(), e))
}

/// Read and validate a dataset file.
pub fn read_dataset(path: &Path) -> Result<DatasetFile, SourceError> {
    let reader = BufReader::new(File::open(path)?);
    let dataset: DatasetFile = serde_json::from_reader(reader).map_err(|e| format_error(path, e))?;
    match &dataset {
        DatasetFile::Calibration(c) => c.validate()?,
        DatasetFile::Measurement(m) => m.validate()?,
    }
    log::debug!("Read {} dataset {}", dataset.kind(), path.display());
    Ok(dataset)
}

/// Write a dataset file, creating parent directories as needed.
pub fn write_dataset(path: &Path, dataset: &DatasetFile) -> Result<(), SourceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, dataset).map_err(|e| format_error(path, e))?;
    writer.flush()?;
    log::debug!("Wrote {} dataset {}", dataset.kind(), path.display());
    Ok(())
}

/// Opens JSON dataset files.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDatasetLoader;

impl DatasetLoader for JsonDatasetLoader {
    fn open_calibration(&self, path: &Path) -> Result<Box<dyn CalibrationSource>, SourceError> {
        match read_dataset(path)? {
            DatasetFile::Calibration(c) => Ok(Box::new(c)),
            other => Err(SourceError::Format(format!(
                "{} holds a {}, not a calibration",
                path.display(),
                other.kind()
            ))),
        }
    }

    fn open_measurement(&self, path: &Path) -> Result<Box<dyn MeasurementSource>, SourceError> {
        match read_dataset(path)? {
            DatasetFile::Measurement(m) => Ok(Box::new(m)),
            other => Err(SourceError::Format(format!(
                "{} holds a {}, not a measurement",
                path.display(),
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::types::Grid;
    use ndarray::{Array2, Array3};
    use num_complex::Complex64;

    fn calibration() -> InMemoryCalibration {
        let grid = Grid::new([2, 1, 1], [0.02, 0.01, 0.01], [0.0, 0.0, 0.005]);
        let matrix = Array2::from_shape_fn((2, 2), |(i, k)| Complex64::new(i as f64, k as f64));
        InMemoryCalibration::new(grid, vec![2.5e4, 5e4], 1, matrix, Array2::ones((2, 1))).unwrap()
    }

    #[test]
    fn test_calibration_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal.json");
        let dataset = DatasetFile::Calibration(calibration());
        write_dataset(&path, &dataset).unwrap();
        assert_eq!(read_dataset(&path).unwrap(), dataset);
    }

    #[test]
    fn test_loader_rejects_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal.json");
        write_dataset(&path, &DatasetFile::Calibration(calibration())).unwrap();
        assert!(JsonDatasetLoader.open_calibration(&path).is_ok());
        assert!(matches!(
            JsonDatasetLoader.open_measurement(&path),
            Err(SourceError::Format(_))
        ));
    }

    #[test]
    fn test_malformed_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"kind\": \"measurement\"}").unwrap();
        assert!(matches!(read_dataset(&path), Err(SourceError::Format(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_dataset(&dir.path().join("absent.json")),
            Err(SourceError::Io(_))
        ));
    }

    #[test]
    fn test_summary_names_calibration() {
        let data = Array3::<Complex64>::zeros((2, 1, 4));
        let m = InMemoryMeasurement::new(vec![1.0, 2.0], 1, data, 0.02)
            .unwrap()
            .with_calibration("cal.json");
        let lines = DatasetFile::Measurement(m).summary();
        assert!(lines.iter().any(|l| l.contains("cal.json")));
        assert!(lines.iter().any(|l| l.contains("4 (1 period(s)")));
    }
}
