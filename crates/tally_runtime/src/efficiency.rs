//! Efficiency Aggregator: one leaderboard entry per qualifying bucket.
//!
//! A pure function of the bucket aggregates. Buckets below `min_samples`
//! successes are left out; a bucket whose state cannot be summarized is
//! skipped and logged while the rest of the board is still produced.

use std::cmp::Ordering;
use tally_config::AggregationConfig;
use tally_store::{BucketAggregate, BucketStats, FactStore};
use tally_types::{BucketKey, LeaderboardEntry};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("bucket {0} has no successful samples")]
    EmptyBucket(BucketKey),
    #[error("bucket {0} has inconsistent running state")]
    Inconsistent(BucketKey),
    #[error("bucket {0} produced a non-finite {1}")]
    NonFinite(BucketKey, &'static str),
}

/// Ranked leaderboard plus a count of buckets that had to be skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Leaderboard {
    pub entries: Vec<LeaderboardEntry>,
    pub bucket_errors: u64,
}

/// Mean speed (trimmed once the bucket is large enough) and mean reduction
/// over the successful samples of one bucket.
pub fn summarize_bucket(
    key: &BucketKey,
    agg: &BucketAggregate,
    config: &AggregationConfig,
) -> Result<LeaderboardEntry, AggregationError> {
    entry_from_stats(key, agg.stats(config))
}

/// Build an entry from stats already copied out of the bucket.
pub fn entry_from_stats(
    key: &BucketKey,
    stats: BucketStats,
) -> Result<LeaderboardEntry, AggregationError> {
    if stats.successes == 0 {
        return Err(AggregationError::EmptyBucket(key.clone()));
    }
    if !stats.consistent {
        return Err(AggregationError::Inconsistent(key.clone()));
    }
    let (Some(speed), Some(reduction)) = (stats.speed, stats.reduction) else {
        return Err(AggregationError::Inconsistent(key.clone()));
    };
    if !speed.is_finite() {
        return Err(AggregationError::NonFinite(key.clone(), "speed"));
    }
    if !reduction.is_finite() {
        return Err(AggregationError::NonFinite(key.clone(), "reduction"));
    }

    Ok(LeaderboardEntry {
        hardware: key.hardware.clone(),
        encoder: key.encoder.clone(),
        codec: key.codec.as_str().to_string(),
        res: key.resolution.clone(),
        speed,
        reduction,
        samples: stats.successes,
    })
}

/// Score descending, then samples descending, then hardware, encoder,
/// codec and resolution ascending. A total order, so ranking never depends
/// on the order buckets were visited.
pub fn rank_order(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.efficiency_score()
        .total_cmp(&a.efficiency_score())
        .then_with(|| b.samples.cmp(&a.samples))
        .then_with(|| a.hardware.cmp(&b.hardware))
        .then_with(|| a.encoder.cmp(&b.encoder))
        .then_with(|| a.codec.cmp(&b.codec))
        .then_with(|| a.res.cmp(&b.res))
}

/// Leaderboard over the store's live aggregates. Each bucket lock is held
/// only while its stats are copied out.
pub fn compute_leaderboard(store: &FactStore, config: &AggregationConfig) -> Leaderboard {
    let copied = store.fold_buckets(|key, agg| {
        (agg.successes() >= config.min_samples).then(|| (key.clone(), agg.stats(config)))
    });
    let results = copied
        .into_iter()
        .flatten()
        .map(|(key, stats)| entry_from_stats(&key, stats));
    finish(results, config)
}

/// Leaderboard over explicit aggregates, e.g. partials merged from several
/// instances with [`BucketAggregate::merge`].
pub fn leaderboard_from<'a, I>(buckets: I, config: &AggregationConfig) -> Leaderboard
where
    I: IntoIterator<Item = (&'a BucketKey, &'a BucketAggregate)>,
{
    let results = buckets
        .into_iter()
        .filter(|(_, agg)| agg.successes() >= config.min_samples)
        .map(|(key, agg)| summarize_bucket(key, agg, config));
    finish(results, config)
}

fn finish<I>(results: I, config: &AggregationConfig) -> Leaderboard
where
    I: Iterator<Item = Result<LeaderboardEntry, AggregationError>>,
{
    let mut board = Leaderboard::default();
    for result in results {
        match result {
            Ok(entry) => board.entries.push(entry),
            Err(e) => {
                warn!(error = %e, "skipping bucket");
                board.bucket_errors += 1;
            }
        }
    }
    board.entries.sort_by(rank_order);
    board.entries.truncate(config.leaderboard_limit);
    board
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tally_types::{Codec, Outcome, TelemetrySample};

    fn sample(hardware: &str, encoder: &str, speed: f64, reduction: f64) -> TelemetrySample {
        TelemetrySample {
            hardware: hardware.into(),
            encoder: encoder.into(),
            codec: Codec::new_unchecked("av1"),
            resolution: "1080p".into(),
            speed_factor: Some(speed),
            size_reduction_ratio: Some(reduction),
            duration_seconds: 20.0,
            outcome: Outcome::Success,
            error_code: None,
            submitted_at: Utc::now(),
        }
    }

    fn defaults() -> AggregationConfig {
        AggregationConfig::default()
    }

    #[test]
    fn bucket_means() {
        let store = FactStore::in_memory();
        for (s, r) in [(2.0, 0.3), (4.0, 0.5), (3.0, 0.4)] {
            store.append(sample("m1", "vt", s, r)).unwrap();
        }
        let board = compute_leaderboard(&store, &defaults());
        assert_eq!(board.bucket_errors, 0);
        assert_eq!(board.entries.len(), 1);
        let e = &board.entries[0];
        assert_eq!((e.speed, e.reduction, e.samples), (3.0, 0.4, 3));
        assert_eq!(e.res, "1080p");
    }

    #[test]
    fn buckets_below_min_samples_are_left_out() {
        let store = FactStore::in_memory();
        store.append(sample("a", "x", 1.0, 0.5)).unwrap();
        store.append(sample("a", "x", 1.0, 0.5)).unwrap();
        assert!(compute_leaderboard(&store, &defaults()).entries.is_empty());
        store.append(sample("a", "x", 1.0, 0.5)).unwrap();
        assert_eq!(compute_leaderboard(&store, &defaults()).entries.len(), 1);
    }

    #[test]
    fn outliers_trimmed_only_in_large_buckets() {
        let store = FactStore::in_memory();
        for _ in 0..18 {
            store.append(sample("big", "x", 1.0, 0.5)).unwrap();
        }
        store.append(sample("big", "x", 0.001, 0.5)).unwrap();
        store.append(sample("big", "x", 900.0, 0.5)).unwrap();
        for s in [1.0, 1.0, 100.0] {
            store.append(sample("small", "x", s, 0.5)).unwrap();
        }

        let board = compute_leaderboard(&store, &defaults());
        let big = board.entries.iter().find(|e| e.hardware == "big").unwrap();
        let small = board.entries.iter().find(|e| e.hardware == "small").unwrap();
        assert_eq!(big.speed, 1.0);
        assert_eq!(big.samples, 20);
        assert_eq!(small.speed, 34.0);
    }

    #[test]
    fn ordering_ties_fall_through_to_labels() {
        let store = FactStore::in_memory();
        for hw in ["zeta", "alpha"] {
            for _ in 0..3 {
                store.append(sample(hw, "x", 2.0, 0.5)).unwrap();
            }
        }
        for _ in 0..4 {
            store.append(sample("mid", "x", 2.0, 0.5)).unwrap();
        }
        for _ in 0..3 {
            store.append(sample("best", "x", 8.0, 0.7)).unwrap();
        }
        let order: Vec<_> = compute_leaderboard(&store, &defaults())
            .entries
            .into_iter()
            .map(|e| e.hardware)
            .collect();
        assert_eq!(order, ["best", "mid", "alpha", "zeta"]);
    }

    #[test]
    fn limit_caps_output() {
        let store = FactStore::in_memory();
        for i in 0..8 {
            for _ in 0..3 {
                store.append(sample(&format!("hw{i}"), "x", 1.0 + i as f64, 0.5)).unwrap();
            }
        }
        let config = AggregationConfig {
            leaderboard_limit: 5,
            ..defaults()
        };
        let board = compute_leaderboard(&store, &config);
        assert_eq!(board.entries.len(), 5);
        assert_eq!(board.entries[0].hardware, "hw7");
    }

    #[test]
    fn empty_bucket_is_an_error_not_a_panic() {
        let key = sample("a", "x", 1.0, 0.1).bucket_key();
        let agg = BucketAggregate::new();
        assert_eq!(
            summarize_bucket(&key, &agg, &defaults()),
            Err(AggregationError::EmptyBucket(key))
        );
    }

    #[test]
    fn inconsistent_stats_are_skipped_not_ranked() {
        let key = sample("a", "x", 1.0, 0.1).bucket_key();
        let stats = BucketStats {
            successes: 4,
            consistent: false,
            speed: Some(2.0),
            reduction: Some(0.3),
        };
        assert_eq!(
            entry_from_stats(&key, stats),
            Err(AggregationError::Inconsistent(key))
        );
    }

    #[test]
    fn merged_partials_rank_like_a_single_store() {
        let inputs = [
            sample("a", "x", 2.0, 0.3),
            sample("a", "x", 4.0, 0.5),
            sample("a", "x", 3.0, 0.4),
            sample("b", "y", 9.0, 0.1),
            sample("b", "y", 7.0, 0.2),
            sample("b", "y", 8.0, 0.3),
        ];
        let single = FactStore::in_memory();
        let mut left: BTreeMap<BucketKey, BucketAggregate> = BTreeMap::new();
        let mut right: BTreeMap<BucketKey, BucketAggregate> = BTreeMap::new();
        for (i, s) in inputs.iter().enumerate() {
            single.append(s.clone()).unwrap();
            let side = if i % 2 == 0 { &mut left } else { &mut right };
            side.entry(s.bucket_key()).or_default().record(s);
        }
        for (key, agg) in &right {
            left.entry(key.clone()).or_default().merge(agg);
        }
        assert_eq!(
            leaderboard_from(&left, &defaults()),
            compute_leaderboard(&single, &defaults())
        );
    }
}
