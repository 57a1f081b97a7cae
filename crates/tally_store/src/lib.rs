//! Tally Fact Store: append-only storage for accepted telemetry samples.
//!
//! Raw samples go to a pluggable [`FactBackend`] (memory, sled or sqlite).
//! Alongside them the store keeps running aggregates per configuration
//! bucket and per encoder, so aggregation reads O(buckets) state instead of
//! rescanning history. The aggregates are derived data: [`FactStore::open`]
//! rebuilds them from the backend, which is how they survive a restart.

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tally_config::StoreBackendKind;
use tally_types::{BucketKey, Coverage, TelemetrySample};
use tracing::{debug, info};

pub mod aggregate;
pub mod backends;
pub mod sqlite;

pub use aggregate::{BucketAggregate, BucketStats, EncoderTally, FIXED_POINT_SCALE};
pub use backends::{MemoryBackend, SledBackend};
pub use sqlite::SqliteBackend;

/// Lazy sequence of stored samples.
pub type SampleIter<'a> = Box<dyn Iterator<Item = Result<TelemetrySample, StoreError>> + 'a>;

/// Durable home of raw samples.
///
/// Backends are append-only: there is no update or delete.
pub trait FactBackend: Send + Sync {
    /// Persist one sample. Must not return `Ok` until the sample is stored.
    fn append(&self, sample: &TelemetrySample) -> Result<(), StoreError>;

    /// Iterate stored samples, optionally restricted to one bucket.
    fn scan(&self, bucket: Option<&BucketKey>) -> Result<SampleIter<'_>, StoreError>;

    /// Cheap liveness check.
    fn ping(&self) -> Result<(), StoreError>;

    /// Force buffered writes to disk.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("backend: {0}")]
    Backend(String),
    #[error("serialization: {0}")]
    Serialization(String),
}

/// Open the backend selected by configuration.
pub fn open_backend(
    kind: StoreBackendKind,
    path: &Path,
) -> Result<Arc<dyn FactBackend>, StoreError> {
    Ok(match kind {
        StoreBackendKind::Memory => Arc::new(MemoryBackend::new()),
        StoreBackendKind::Sled => Arc::new(SledBackend::open(path)?),
        StoreBackendKind::Sqlite => Arc::new(SqliteBackend::open(path)?),
    })
}

/// Append-only sample store plus its running aggregates.
pub struct FactStore {
    backend: Arc<dyn FactBackend>,
    buckets: DashMap<BucketKey, Arc<Mutex<BucketAggregate>>>,
    encoders: DashMap<String, Arc<Mutex<EncoderTally>>>,
    hardware: DashSet<String>,
    total_jobs: AtomicU64,
}

impl FactStore {
    /// Wrap a backend and rebuild the running aggregates from what it holds.
    pub fn open(backend: Arc<dyn FactBackend>) -> Result<Self, StoreError> {
        let store = Self::empty(backend);
        let mut replayed = 0u64;
        for sample in store.backend.scan(None)? {
            store.record(&sample?);
            replayed += 1;
        }
        info!(
            samples = replayed,
            buckets = store.buckets.len(),
            "fact store aggregates rebuilt"
        );
        Ok(store)
    }

    /// Fresh in-memory store. Nothing to replay, so no `open`.
    pub fn in_memory() -> Self {
        Self::empty(Arc::new(MemoryBackend::new()))
    }

    fn empty(backend: Arc<dyn FactBackend>) -> Self {
        Self {
            backend,
            buckets: DashMap::new(),
            encoders: DashMap::new(),
            hardware: DashSet::new(),
            total_jobs: AtomicU64::new(0),
        }
    }

    /// Store a sample, then count it.
    ///
    /// There is no await point here: a cancelled caller either gets the
    /// whole append or none of it. If the backend write fails nothing is
    /// counted.
    pub fn append(&self, sample: TelemetrySample) -> Result<(), StoreError> {
        self.backend.append(&sample)?;
        self.record(&sample);
        debug!(bucket = %sample.bucket_key(), "sample appended");
        Ok(())
    }

    pub fn scan(&self, bucket: Option<&BucketKey>) -> Result<SampleIter<'_>, StoreError> {
        self.backend.scan(bucket)
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()
    }

    pub fn coverage(&self) -> Coverage {
        Coverage {
            total_jobs: self.total_jobs.load(Ordering::Acquire),
            unique_hardware: self.hardware.len() as u64,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Copy of one bucket's aggregate, if the bucket exists.
    pub fn bucket(&self, key: &BucketKey) -> Option<BucketAggregate> {
        let cell = self.buckets.get(key)?.value().clone();
        let agg = cell.lock().clone();
        Some(agg)
    }

    /// Run `f` over every bucket, each under its own short lock.
    ///
    /// Buckets are visited one at a time; appends to other buckets proceed
    /// meanwhile, and samples landing after a bucket was visited are simply
    /// seen on the next call.
    pub fn fold_buckets<T, F>(&self, mut f: F) -> Vec<T>
    where
        F: FnMut(&BucketKey, &BucketAggregate) -> T,
    {
        let cells: Vec<(BucketKey, Arc<Mutex<BucketAggregate>>)> = self
            .buckets
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        cells
            .into_iter()
            .map(|(key, cell)| {
                let agg = cell.lock();
                f(&key, &agg)
            })
            .collect()
    }

    /// Copy of every encoder tally.
    pub fn encoder_tallies(&self) -> Vec<(String, EncoderTally)> {
        let cells: Vec<(String, Arc<Mutex<EncoderTally>>)> = self
            .encoders
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        cells
            .into_iter()
            .map(|(encoder, cell)| {
                let tally = cell.lock().clone();
                (encoder, tally)
            })
            .collect()
    }

    fn record(&self, sample: &TelemetrySample) {
        let bucket = self.bucket_cell(sample.bucket_key());
        bucket.lock().record(sample);

        let encoder = self.encoder_cell(&sample.encoder);
        encoder.lock().record(sample);

        if !self.hardware.contains(&sample.hardware) {
            self.hardware.insert(sample.hardware.clone());
        }
        self.total_jobs.fetch_add(1, Ordering::AcqRel);
    }

    fn bucket_cell(&self, key: BucketKey) -> Arc<Mutex<BucketAggregate>> {
        if let Some(cell) = self.buckets.get(&key) {
            return cell.value().clone();
        }
        self.buckets.entry(key).or_default().value().clone()
    }

    fn encoder_cell(&self, encoder: &str) -> Arc<Mutex<EncoderTally>> {
        if let Some(cell) = self.encoders.get(encoder) {
            return cell.value().clone();
        }
        self.encoders
            .entry(encoder.to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_types::{Codec, Outcome};

    fn sample(hardware: &str, encoder: &str) -> TelemetrySample {
        TelemetrySample {
            hardware: hardware.into(),
            encoder: encoder.into(),
            codec: Codec::new_unchecked("av1"),
            resolution: "1080p".into(),
            speed_factor: Some(1.5),
            size_reduction_ratio: Some(0.4),
            duration_seconds: 12.0,
            outcome: Outcome::Success,
            error_code: None,
            submitted_at: Utc::now(),
        }
    }

    struct DeadBackend;

    impl FactBackend for DeadBackend {
        fn append(&self, _sample: &TelemetrySample) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }
        fn scan(&self, _bucket: Option<&BucketKey>) -> Result<SampleIter<'_>, StoreError> {
            Ok(Box::new(std::iter::empty()))
        }
        fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }
    }

    #[test]
    fn empty_store_has_zero_coverage() {
        let store = FactStore::in_memory();
        assert_eq!(store.coverage(), Coverage::default());
        assert_eq!(store.bucket_count(), 0);
    }

    #[test]
    fn total_jobs_counts_every_append() {
        let store = FactStore::in_memory();
        for i in 0..25 {
            store.append(sample(&format!("hw{}", i % 4), "svt-av1")).unwrap();
        }
        let coverage = store.coverage();
        assert_eq!(coverage.total_jobs, 25);
        assert_eq!(coverage.unique_hardware, 4);
        assert_eq!(store.bucket_count(), 4);
    }

    #[test]
    fn failed_backend_write_counts_nothing() {
        let store = FactStore::open(Arc::new(DeadBackend)).unwrap();
        assert!(matches!(
            store.append(sample("hw", "enc")),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.coverage().total_jobs, 0);
        assert_eq!(store.coverage().unique_hardware, 0);
        assert_eq!(store.bucket_count(), 0);
    }

    #[test]
    fn scan_filters_by_bucket() {
        let store = FactStore::in_memory();
        store.append(sample("a", "x")).unwrap();
        store.append(sample("a", "x")).unwrap();
        store.append(sample("b", "x")).unwrap();

        let key = sample("a", "x").bucket_key();
        let hits: Vec<_> = store
            .scan(Some(&key))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(store.scan(None).unwrap().count(), 3);
    }

    #[test]
    fn in_memory_matches_open_on_fresh_backend() {
        let fresh = FactStore::in_memory();
        let opened = FactStore::open(Arc::new(MemoryBackend::new())).unwrap();
        for store in [&fresh, &opened] {
            store.append(sample("a", "x")).unwrap();
            store.append(sample("b", "y")).unwrap();
        }
        assert_eq!(fresh.coverage(), opened.coverage());
        let mut a = fresh.encoder_tallies();
        let mut b = opened.encoder_tallies();
        a.sort_by(|x, y| x.0.cmp(&y.0));
        b.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(a, b);
        let key = sample("a", "x").bucket_key();
        assert_eq!(fresh.bucket(&key), opened.bucket(&key));
    }

    #[test]
    fn reopen_rebuilds_aggregates() {
        let backend: Arc<dyn FactBackend> = Arc::new(MemoryBackend::new());
        {
            let store = FactStore::open(backend.clone()).unwrap();
            store.append(sample("a", "x")).unwrap();
            store.append(sample("b", "y")).unwrap();
        }
        let reopened = FactStore::open(backend).unwrap();
        assert_eq!(reopened.coverage().total_jobs, 2);
        assert_eq!(reopened.encoder_tallies().len(), 2);
        let key = sample("a", "x").bucket_key();
        assert_eq!(reopened.bucket(&key).map(|b| b.successes()), Some(1));
    }
}
