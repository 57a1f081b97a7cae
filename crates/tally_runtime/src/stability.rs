//! Stability Aggregator: failure counts per (encoder, error code).

use std::cmp::Ordering;
use tally_config::AggregationConfig;
use tally_store::{EncoderTally, FactStore};
use tally_types::{EncoderReliability, StabilityEntry};

pub fn compute_stability(store: &FactStore, config: &AggregationConfig) -> Vec<StabilityEntry> {
    stability_from(&store.encoder_tallies(), config)
}

/// Count descending, then encoder and error code ascending.
pub fn stability_from(
    tallies: &[(String, EncoderTally)],
    config: &AggregationConfig,
) -> Vec<StabilityEntry> {
    let mut entries: Vec<StabilityEntry> = tallies
        .iter()
        .flat_map(|(encoder, tally)| {
            tally
                .failures()
                .iter()
                .filter(|(_, count)| **count >= config.stability_min_count)
                .map(move |(code, count)| StabilityEntry {
                    encoder: encoder.clone(),
                    error: code.clone(),
                    count: *count,
                })
        })
        .collect();
    entries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.encoder.cmp(&b.encoder))
            .then_with(|| a.error.cmp(&b.error))
    });
    entries.truncate(config.stability_limit);
    entries
}

/// Failure rate per encoder over every attempt it ever made, worst first.
pub fn encoder_reliability(store: &FactStore) -> Vec<EncoderReliability> {
    let mut out: Vec<EncoderReliability> = store
        .encoder_tallies()
        .into_iter()
        .filter(|(_, tally)| tally.attempts() > 0)
        .map(|(encoder, tally)| EncoderReliability {
            failure_rate: tally.total_failures() as f64 / tally.attempts() as f64,
            attempts: tally.attempts(),
            failures: tally.total_failures(),
            encoder,
        })
        .collect();
    out.sort_by(|a, b| match b.failure_rate.total_cmp(&a.failure_rate) {
        Ordering::Equal => a.encoder.cmp(&b.encoder),
        other => other,
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_types::{Codec, Outcome, TelemetrySample};

    fn failure(encoder: &str, code: &str) -> TelemetrySample {
        TelemetrySample {
            hardware: "rtx 3080".into(),
            encoder: encoder.into(),
            codec: Codec::new_unchecked("hevc"),
            resolution: "1080p".into(),
            speed_factor: None,
            size_reduction_ratio: None,
            duration_seconds: 5.0,
            outcome: Outcome::Failure,
            error_code: Some(code.into()),
            submitted_at: Utc::now(),
        }
    }

    fn success(encoder: &str) -> TelemetrySample {
        TelemetrySample {
            speed_factor: Some(2.0),
            size_reduction_ratio: Some(0.4),
            outcome: Outcome::Success,
            error_code: None,
            ..failure(encoder, "unused")
        }
    }

    fn entry(encoder: &str, error: &str, count: u64) -> StabilityEntry {
        StabilityEntry {
            encoder: encoder.into(),
            error: error.into(),
            count,
        }
    }

    #[test]
    fn crash_and_oom_counts() {
        let store = FactStore::in_memory();
        store.append(failure("x", "OOM")).unwrap();
        for _ in 0..10 {
            store.append(failure("x", "CRASH")).unwrap();
        }
        assert_eq!(
            compute_stability(&store, &AggregationConfig::default()),
            vec![entry("x", "CRASH", 10), entry("x", "OOM", 1)]
        );
    }

    #[test]
    fn ties_order_by_encoder_then_code() {
        let store = FactStore::in_memory();
        for (enc, code) in [("qsv", "B"), ("amf", "Z"), ("qsv", "A"), ("amf", "A")] {
            store.append(failure(enc, code)).unwrap();
        }
        assert_eq!(
            compute_stability(&store, &AggregationConfig::default()),
            vec![
                entry("amf", "A", 1),
                entry("amf", "Z", 1),
                entry("qsv", "A", 1),
                entry("qsv", "B", 1),
            ]
        );
    }

    #[test]
    fn min_count_and_limit() {
        let store = FactStore::in_memory();
        for _ in 0..3 {
            store.append(failure("nvenc", "DRIVER")).unwrap();
        }
        store.append(failure("nvenc", "RARE")).unwrap();
        store.append(failure("amf", "TIMEOUT")).unwrap();
        store.append(failure("amf", "TIMEOUT")).unwrap();

        let config = AggregationConfig {
            stability_min_count: 2,
            stability_limit: 1,
            ..AggregationConfig::default()
        };
        assert_eq!(
            compute_stability(&store, &config),
            vec![entry("nvenc", "DRIVER", 3)]
        );
    }

    #[test]
    fn successes_never_appear() {
        let store = FactStore::in_memory();
        store.append(success("x")).unwrap();
        assert!(compute_stability(&store, &AggregationConfig::default()).is_empty());
    }

    #[test]
    fn reliability_uses_all_attempts() {
        let store = FactStore::in_memory();
        for _ in 0..3 {
            store.append(success("good")).unwrap();
        }
        store.append(success("bad")).unwrap();
        store.append(failure("bad", "CRASH")).unwrap();

        let rel = encoder_reliability(&store);
        assert_eq!(rel.len(), 2);
        assert_eq!(rel[0].encoder, "bad");
        assert_eq!((rel[0].attempts, rel[0].failures), (2, 1));
        assert_eq!(rel[0].failure_rate, 0.5);
        assert_eq!(rel[1].failure_rate, 0.0);
    }
}
