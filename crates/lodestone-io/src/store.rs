//! Reconstruction stores.
//!
//! [`MemoryStore`] keeps reconstructions for the lifetime of the process;
//! [`DirectoryStore`] writes one `reco-<id>.json` file per reconstruction
//! and matches keys structurally on lookup.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use lodestone_core::store::{RecoKey, ReconstructionStore, StoreError};
use lodestone_core::types::RecoOutput;
use serde::{Deserialize, Serialize};

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Vec<(RecoKey, RecoOutput)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ReconstructionStore for MemoryStore {
    fn find(&self, key: &RecoKey) -> Result<Option<u64>, StoreError> {
        Ok(self.entries.iter().position(|(k, _)| k == key).map(|i| i as u64))
    }

    fn load(&self, id: u64) -> Result<RecoOutput, StoreError> {
        self.entries
            .get(id as usize)
            .map(|(_, output)| output.clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn save(&mut self, key: &RecoKey, output: &RecoOutput) -> Result<u64, StoreError> {
        self.entries.push((key.clone(), output.clone()));
        Ok(self.entries.len() as u64 - 1)
    }
}

/// One persisted reconstruction.
#[derive(Debug, Serialize, Deserialize)]
struct StoredReconstruction {
    id: u64,
    key: RecoKey,
    output: RecoOutput,
}

/// Store backed by a directory of JSON files.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.root.join(format!("reco-{:06}.json", id))
    }

    /// Identifiers of every stored reconstruction, ascending.
    pub fn ids(&self) -> Result<Vec<u64>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_prefix("reco-"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(id) = id {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn read(&self, id: u64) -> Result<StoredReconstruction, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id));
        }
        let reader = BufReader::new(File::open(&path)?);
        serde_json::from_reader(reader)
            .map_err(|e| StoreError::Serialisation(format!("{}: {}", path.display(), e)))
    }
}

impl ReconstructionStore for DirectoryStore {
    fn find(&self, key: &RecoKey) -> Result<Option<u64>, StoreError> {
        for id in self.ids()? {
            match self.read(id) {
                Ok(stored) if &stored.key == key => return Ok(Some(id)),
                Ok(_) => {}
                Err(StoreError::Serialisation(e)) => log::warn!("Skipping unreadable entry: {}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn load(&self, id: u64) -> Result<RecoOutput, StoreError> {
        Ok(self.read(id)?.output)
    }

    fn save(&mut self, key: &RecoKey, output: &RecoOutput) -> Result<u64, StoreError> {
        let id = self.ids()?.last().map_or(0, |last| last + 1);
        let stored = StoredReconstruction {
            id,
            key: key.clone(),
            output: output.clone(),
        };
        let path = self.path_for(id);
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, &stored).map_err(|e| StoreError::Serialisation(e.to_string()))?;
        writer.flush()?;
        log::debug!("Saved reconstruction {} to {}", id, path.display());
        Ok(id)
    }
}
