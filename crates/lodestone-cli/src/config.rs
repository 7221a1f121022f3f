//! TOML configuration deserialisation for reconstruction jobs.
//!
//! ```toml
//! [data]
//! measurement = "measurement.json"
//! calibrations = ["calibration.json"]
//!
//! [reconstruction]
//! snr_thresh = 5.0
//! min_freq = 80e3
//! iterations = 3
//! lambda = 0.01
//!
//! [output]
//! directory = "./output"
//! ```
//!
//! Relative paths are resolved against the directory holding the
//! configuration file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use lodestone_core::RecoOptions;
use serde::{Deserialize, Serialize};

/// Top-level job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub reconstruction: RecoOptions,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Input files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub measurement: PathBuf,
    /// Calibration files, concatenated in order. Empty means: use the
    /// calibration named by the measurement, looked up in
    /// `calibration_dir`.
    #[serde(default)]
    pub calibrations: Vec<PathBuf>,
    #[serde(default)]
    pub calibration_dir: Option<PathBuf>,
    #[serde(default)]
    pub background: Option<PathBuf>,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,
    /// Directory of a reconstruction store; when set, identical jobs reuse
    /// the stored result.
    #[serde(default)]
    pub store: Option<PathBuf>,
    /// Whether to write a composite of all patches (default: true).
    #[serde(default = "default_true")]
    pub composite: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            store: None,
            composite: true,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_true() -> bool {
    true
}

impl JobConfig {
    /// Make every relative path relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.data.measurement);
        self.data.calibrations.iter_mut().for_each(join);
        self.data.calibration_dir.iter_mut().for_each(join);
        self.data.background.iter_mut().for_each(join);
        join(&mut self.output.directory);
        self.output.store.iter_mut().for_each(join);
    }
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &Path) -> anyhow::Result<JobConfig> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut config: JobConfig = toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: JobConfig = toml::from_str("[data]\nmeasurement = \"m.json\"\n").unwrap();
        assert!(config.data.calibrations.is_empty());
        assert_eq!(config.reconstruction, RecoOptions::default());
        assert_eq!(config.output.directory, PathBuf::from("./output"));
        assert!(config.output.composite);
    }

    #[test]
    fn test_reconstruction_table_maps_onto_options() {
        let text = r#"
            [data]
            measurement = "m.json"
            calibrations = ["a.json", "b.json"]

            [reconstruction]
            snr_thresh = 5.0
            iterations = 3
            mapping = [0, 0]
            frames = { start = 2, end = 6 }
        "#;
        let config: JobConfig = toml::from_str(text).unwrap();
        let options = &config.reconstruction;
        assert_eq!(options.snr_thresh, Some(5.0));
        assert_eq!(options.iterations, Some(3));
        assert_eq!(options.mapping.as_deref(), Some(&[0, 0][..]));
        assert_eq!(options.frames, Some(2..6));
    }

    #[test]
    fn test_unknown_reconstruction_key_is_rejected() {
        let text = "[data]\nmeasurement = \"m.json\"\n[reconstruction]\nsnr_treshold = 5.0\n";
        assert!(toml::from_str::<JobConfig>(text).is_err());
    }

    #[test]
    fn test_paths_resolve_against_config_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            "[data]\nmeasurement = \"m.json\"\nbackground = \"/abs/bg.json\"\n[output]\ndirectory = \"out\"\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.data.measurement, dir.path().join("m.json"));
        assert_eq!(config.data.background, Some(PathBuf::from("/abs/bg.json")));
        assert_eq!(config.output.directory, dir.path().join("out"));
    }
}
