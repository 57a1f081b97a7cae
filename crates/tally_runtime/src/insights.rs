//! Insights Cache: the published `{coverage, leaderboard, stability}`
//! snapshot.
//!
//! Readers load an `Arc` out of an [`ArcSwap`] and never wait on
//! aggregation. [`InsightsCache::refresh`] builds a complete new snapshot
//! off to the side and publishes it with a single pointer swap, so a reader
//! holds either the whole old snapshot or the whole new one.

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally_config::AggregationConfig;
use tally_store::{FactStore, StoreError};
use tally_types::{EncoderReliability, InsightsSnapshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::efficiency::compute_leaderboard;
use crate::stability::{compute_stability, encoder_reliability};

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("refresh task failed: {0}")]
    Task(String),
}

/// What one successful refresh produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub generation: u64,
    pub leaderboard_entries: usize,
    pub stability_entries: usize,
    pub bucket_errors: u64,
    pub elapsed: Duration,
}

pub struct InsightsCache {
    store: Arc<FactStore>,
    config: AggregationConfig,
    current: ArcSwap<InsightsSnapshot>,
    /// Serializes writers; readers never touch it.
    refresh_lock: Mutex<()>,
}

impl InsightsCache {
    /// Starts out serving [`InsightsSnapshot::empty`].
    pub fn new(store: Arc<FactStore>, config: AggregationConfig) -> Self {
        Self {
            store,
            config,
            current: ArcSwap::from_pointee(InsightsSnapshot::empty()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<InsightsSnapshot> {
        self.current.load_full()
    }

    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    /// Per-encoder failure rates, read straight from the running tallies.
    pub fn reliability(&self) -> Vec<EncoderReliability> {
        encoder_reliability(&self.store)
    }

    /// Recompute everything and swap it in. On error the previous snapshot
    /// stays published.
    pub fn refresh(&self) -> Result<RefreshReport, RefreshError> {
        let _writer = self.refresh_lock.lock();
        let started = Instant::now();
        let previous_generation = self.current.load().generation;

        if let Err(e) = self.store.ping() {
            error!(
                error = %e,
                generation = previous_generation,
                "insights refresh failed, keeping previous snapshot"
            );
            return Err(e.into());
        }

        let board = compute_leaderboard(&self.store, &self.config);
        let stability = compute_stability(&self.store, &self.config);
        let next = InsightsSnapshot {
            coverage: self.store.coverage(),
            leaderboard: board.entries,
            stability,
            generation: previous_generation + 1,
            generated_at: Some(Utc::now()),
        };
        let report = RefreshReport {
            generation: next.generation,
            leaderboard_entries: next.leaderboard.len(),
            stability_entries: next.stability.len(),
            bucket_errors: board.bucket_errors,
            elapsed: started.elapsed(),
        };
        self.current.store(Arc::new(next));

        debug!(
            generation = report.generation,
            leaderboard = report.leaderboard_entries,
            stability = report.stability_entries,
            bucket_errors = report.bucket_errors,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "insights snapshot published"
        );
        Ok(report)
    }
}

/// Refresh `cache` every `period`, starting immediately.
///
/// Each run happens on the blocking pool; `on_result` sees every outcome
/// (the gate records metrics there).
pub fn spawn_refresh_loop<F>(
    cache: Arc<InsightsCache>,
    period: Duration,
    on_result: F,
) -> JoinHandle<()>
where
    F: Fn(&Result<RefreshReport, RefreshError>) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "insights refresh loop started");
        loop {
            ticker.tick().await;
            let worker = cache.clone();
            let result = tokio::task::spawn_blocking(move || worker.refresh())
                .await
                .unwrap_or_else(|e| Err(RefreshError::Task(e.to_string())));
            if let Err(RefreshError::Task(msg)) = &result {
                error!(error = %msg, "insights refresh task panicked");
            }
            on_result(&result);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tally_store::{FactBackend, MemoryBackend, SampleIter};
    use tally_types::{BucketKey, Codec, Coverage, Outcome, TelemetrySample};

    fn sample(hardware: &str, speed: f64) -> TelemetrySample {
        TelemetrySample {
            hardware: hardware.into(),
            encoder: "svt-av1".into(),
            codec: Codec::new_unchecked("av1"),
            resolution: "1080p".into(),
            speed_factor: Some(speed),
            size_reduction_ratio: Some(0.4),
            duration_seconds: 10.0,
            outcome: Outcome::Success,
            error_code: None,
            submitted_at: Utc::now(),
        }
    }

    /// Memory backend whose health can be switched off.
    struct Flaky {
        inner: MemoryBackend,
        down: AtomicBool,
    }

    impl FactBackend for Flaky {
        fn append(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
            self.inner.append(sample)
        }
        fn scan(&self, bucket: Option<&BucketKey>) -> Result<SampleIter<'_>, StoreError> {
            self.inner.scan(bucket)
        }
        fn ping(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("unplugged".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn starts_empty() {
        let cache = InsightsCache::new(Arc::new(FactStore::in_memory()), Default::default());
        let snap = cache.snapshot();
        assert_eq!(snap.coverage, Coverage::default());
        assert!(snap.leaderboard.is_empty());
        assert!(snap.stability.is_empty());
        assert_eq!(snap.generation, 0);
    }

    #[test]
    fn refresh_publishes_new_generation() {
        let store = Arc::new(FactStore::in_memory());
        for _ in 0..3 {
            store.append(sample("m2", 2.0)).unwrap();
        }
        let cache = InsightsCache::new(store, Default::default());
        let before = cache.snapshot();
        let report = cache.refresh().unwrap();
        let after = cache.snapshot();

        assert_eq!(report.generation, 1);
        assert_eq!(after.generation, 1);
        assert!(after.generated_at.is_some());
        assert_eq!(after.coverage.total_jobs, 3);
        assert_eq!(after.leaderboard.len(), 1);
        // Old readers keep what they loaded.
        assert!(before.leaderboard.is_empty());
    }

    #[test]
    fn failed_refresh_keeps_previous_snapshot() {
        let backend = Arc::new(Flaky {
            inner: MemoryBackend::new(),
            down: AtomicBool::new(false),
        });
        let store = Arc::new(FactStore::open(backend.clone()).unwrap());
        for _ in 0..3 {
            store.append(sample("m2", 2.0)).unwrap();
        }
        let cache = InsightsCache::new(store.clone(), Default::default());
        cache.refresh().unwrap();
        let good = cache.snapshot();

        store.append(sample("m3", 5.0)).unwrap();
        backend.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            cache.refresh(),
            Err(RefreshError::StoreUnavailable(_))
        ));
        assert!(Arc::ptr_eq(&good, &cache.snapshot()));

        backend.down.store(false, Ordering::SeqCst);
        assert_eq!(cache.refresh().unwrap().generation, 2);
        assert_eq!(cache.snapshot().coverage.total_jobs, 4);
    }

    #[tokio::test]
    async fn refresh_loop_runs_at_startup() {
        let store = Arc::new(FactStore::in_memory());
        store.append(sample("m1", 1.0)).unwrap();
        let cache = Arc::new(InsightsCache::new(store, Default::default()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_refresh_loop(cache.clone(), Duration::from_secs(3600), move |r| {
            let _ = tx.send(r.as_ref().map(|rep| rep.generation).ok());
        });
        assert_eq!(rx.recv().await, Some(Some(1)));
        assert_eq!(cache.snapshot().coverage.total_jobs, 1);
        handle.abort();
    }
}
