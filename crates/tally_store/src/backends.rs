//! Storage backends for the FactStore

use crate::{FactBackend, SampleIter, StoreError};
use parking_lot::RwLock;
use std::path::Path;
use tally_types::{BucketKey, TelemetrySample};

/// In-memory backend for development and testing
pub struct MemoryBackend {
    samples: RwLock<Vec<TelemetrySample>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FactBackend for MemoryBackend {
    fn append(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        self.samples.write().push(sample.clone());
        Ok(())
    }

    fn scan(&self, bucket: Option<&BucketKey>) -> Result<SampleIter<'_>, StoreError> {
        // Copy out under the read lock so iteration never blocks writers.
        let samples = self.samples.read();
        let matching: Vec<TelemetrySample> = match bucket {
            Some(key) => samples
                .iter()
                .filter(|s| {
                    s.hardware == key.hardware
                        && s.encoder == key.encoder
                        && s.codec == key.codec
                        && s.resolution == key.resolution
                })
                .cloned()
                .collect(),
            None => samples.clone(),
        };
        Ok(Box::new(matching.into_iter().map(Ok)))
    }

    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

const TREE_SAMPLES: &str = "samples";

/// Sled (embedded database) backend
///
/// Keys are `bucket prefix ++ zero-padded sequence id`, so a bucket scan is
/// a prefix scan and samples within a bucket come back in arrival order.
pub struct SledBackend {
    db: sled::Db,
    samples: sled::Tree,
}

impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())
            .map_err(|e| StoreError::Unavailable(format!("failed to open sled db: {}", e)))?;
        Self::from_db(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open().map_err(|e| {
            StoreError::Unavailable(format!("failed to create in-memory sled db: {}", e))
        })?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let samples = db
            .open_tree(TREE_SAMPLES)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db, samples })
    }

    fn sample_key(&self, bucket: &BucketKey) -> Result<Vec<u8>, StoreError> {
        let seq = self
            .db
            .generate_id()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(format!("{}{:020}", bucket.storage_prefix(), seq).into_bytes())
    }
}

fn decode(item: sled::Result<(sled::IVec, sled::IVec)>) -> Result<TelemetrySample, StoreError> {
    let (_key, raw) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl FactBackend for SledBackend {
    fn append(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        let key = self.sample_key(&sample.bucket_key())?;
        let bytes =
            serde_json::to_vec(sample).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.samples
            .insert(key, bytes)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn scan(&self, bucket: Option<&BucketKey>) -> Result<SampleIter<'_>, StoreError> {
        let iter = match bucket {
            Some(key) => self.samples.scan_prefix(key.storage_prefix().as_bytes()),
            None => self.samples.iter(),
        };
        Ok(Box::new(iter.map(decode)))
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.db
            .size_on_disk()
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}
