//! Dataset-store abstraction for previously computed reconstructions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::RecoParams;
use crate::types::RecoOutput;

/// Errors from reconstruction stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Reconstruction {0} not found")]
    NotFound(u64),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialisation error: {0}")]
    Serialisation(String),
}

/// Identifies a reconstruction by its inputs and resolved parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoKey {
    /// Measurement path.
    pub measurement: String,
    /// Calibration paths, in concatenation order.
    pub calibrations: Vec<String>,
    /// Background measurement path, if any.
    #[serde(default)]
    pub background: Option<String>,
    pub params: RecoParams,
}

/// Lookup-or-compute storage for reconstructions.
pub trait ReconstructionStore {
    /// Identifier of a stored reconstruction with exactly this key.
    fn find(&self, key: &RecoKey) -> Result<Option<u64>, StoreError>;

    fn load(&self, id: u64) -> Result<RecoOutput, StoreError>;

    /// Persist a reconstruction and return its identifier.
    fn save(&mut self, key: &RecoKey, output: &RecoOutput) -> Result<u64, StoreError>;
}
