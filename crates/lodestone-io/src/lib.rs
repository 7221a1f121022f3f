//! # Lodestone IO
//!
//! Data access for Lodestone: concrete calibration and measurement sources,
//! a JSON dataset format, reconstruction stores and a synthetic scanner for
//! tests and demonstrations.
//!
//! | Module | Provides |
//! |--------|----------|
//! | [`memory`] | [`InMemoryCalibration`], [`InMemoryMeasurement`] |
//! | [`dataset`] | [`DatasetFile`], [`JsonDatasetLoader`] |
//! | [`store`] | [`MemoryStore`], [`DirectoryStore`] |
//! | [`phantom`] | Chebyshev system matrices and dot phantoms |

pub mod dataset;
pub mod memory;
pub mod phantom;
pub mod store;

pub use dataset::{read_dataset, write_dataset, DatasetFile, JsonDatasetLoader};
pub use memory::{InMemoryCalibration, InMemoryMeasurement};
pub use phantom::{ScannerConfig, Dot};
pub use store::{DirectoryStore, MemoryStore};
