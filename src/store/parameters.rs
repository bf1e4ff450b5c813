use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tools;

pub const PARAMETER_FILENAME: &str = "parameter.json";

pub const PARAMETER_VERSION: u32 = 1;

pub const COLLECTION_TYPE_DOCUMENT: u32 = 2;
pub const COLLECTION_TYPE_EDGE: u32 = 3;

/// Smallest allowed datafile capacity. The header marker and the
/// footer reserve must always fit with room to spare.
pub const MINIMAL_DATAFILE_SIZE: u32 = 4096;

/// Collection metadata, persisted as `parameter.json` inside the
/// collection directory. Replaced atomically by writing a temp file and
/// renaming it into place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionParameters {
    pub version: u32,
    #[serde(rename = "type")]
    pub collection_type: u32,
    pub cid: u64,
    pub name: String,
    /// Capacity of each journal, datafile and compactor file.
    pub maximal_size: u32,
    /// Sync discipline: 1 forces a sync wait on every write, a larger
    /// value bounds the number of unsynced markers. 0 disarms the rule.
    #[serde(default)]
    pub sync_after_objects: u32,
    /// Bound on unsynced bytes; 0 disarms the rule.
    #[serde(default)]
    pub sync_after_bytes: u32,
    /// Bound on the age of the oldest unsynced byte in seconds; 0
    /// disarms the rule.
    #[serde(default)]
    pub sync_after_seconds: f64,
    /// Force the every-write discipline regardless of the thresholds.
    #[serde(default)]
    pub wait_for_sync: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl CollectionParameters {
    pub fn load(directory: &Path) -> Result<CollectionParameters> {
        let path = directory.join(PARAMETER_FILENAME);
        let raw = std::fs::read(&path)?;
        let parameters: CollectionParameters = serde_json::from_slice(&raw)
            .map_err(|err| Error::InvalidParameter(format!("cannot parse '{}': {}", path.display(), err)))?;
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn save(&self, directory: &Path) -> Result<()> {
        let path = directory.join(PARAMETER_FILENAME);
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|err| Error::InvalidParameter(format!("cannot serialize parameters: {}", err)))?;
        tools::file_set_contents(&path, &raw, None)
    }

    pub fn validate(&self) -> Result<()> {
        if self.maximal_size < MINIMAL_DATAFILE_SIZE {
            return Err(Error::InvalidParameter(format!(
                "maximal size {} is below the minimum of {}",
                self.maximal_size, MINIMAL_DATAFILE_SIZE
            )));
        }
        if self.collection_type != COLLECTION_TYPE_DOCUMENT && self.collection_type != COLLECTION_TYPE_EDGE {
            return Err(Error::InvalidParameter(format!(
                "unknown collection type {}",
                self.collection_type
            )));
        }
        Ok(())
    }

    /// Whether every single write must wait for its marker to be
    /// synced before returning.
    pub fn sync_every_write(&self) -> bool {
        self.wait_for_sync || self.sync_after_objects == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CollectionParameters {
        CollectionParameters {
            version: PARAMETER_VERSION,
            collection_type: COLLECTION_TYPE_DOCUMENT,
            cid: 4711,
            name: "accounts".to_string(),
            maximal_size: 1024 * 1024,
            sync_after_objects: 0,
            sync_after_bytes: 0,
            sync_after_seconds: 0.0,
            wait_for_sync: false,
            deleted: false,
        }
    }

    #[test]
    fn json_field_names() {
        let json = serde_json::to_value(&sample()).unwrap();
        assert_eq!(json["type"], COLLECTION_TYPE_DOCUMENT);
        assert_eq!(json["maximalSize"], 1024 * 1024);
        assert_eq!(json["waitForSync"], false);
        assert_eq!(json["cid"], 4711);
    }

    #[test]
    fn save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let parameters = sample();
        parameters.save(dir.path())?;

        let loaded = CollectionParameters::load(dir.path())?;
        assert_eq!(loaded.name, "accounts");
        assert_eq!(loaded.cid, 4711);
        assert_eq!(loaded.maximal_size, 1024 * 1024);
        Ok(())
    }

    #[test]
    fn validation_rejects_tiny_files() {
        let mut parameters = sample();
        parameters.maximal_size = 100;
        assert!(parameters.validate().is_err());
    }
}
