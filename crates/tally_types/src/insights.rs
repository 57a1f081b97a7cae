//! Derived result types served by the read API.
//!
//! The serialized field names are the dashboard's contract and must not
//! change: `res` (not `resolution`), `error` (not `error_code`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub total_jobs: u64,
    pub unique_hardware: u64,
}

/// One ranked configuration bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub hardware: String,
    pub encoder: String,
    pub codec: String,
    pub res: String,
    pub speed: f64,
    pub reduction: f64,
    pub samples: u64,
}

impl LeaderboardEntry {
    /// `reduction * ln(1 + speed)`. Rewards both axes while logarithmically
    /// discounting extreme speed claims.
    pub fn efficiency_score(&self) -> f64 {
        self.reduction * self.speed.ln_1p()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityEntry {
    pub encoder: String,
    pub error: String,
    pub count: u64,
}

/// Per-encoder failure rate, derived from retained attempt counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderReliability {
    pub encoder: String,
    pub attempts: u64,
    pub failures: u64,
    pub failure_rate: f64,
}

/// Point-in-time result set, immutable once published.
///
/// `generation` and `generated_at` are never serialized: the public body is
/// exactly `{coverage, leaderboard, stability}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightsSnapshot {
    pub coverage: Coverage,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub stability: Vec<StabilityEntry>,
    #[serde(skip)]
    pub generation: u64,
    #[serde(skip)]
    pub generated_at: Option<DateTime<Utc>>,
}

impl InsightsSnapshot {
    /// The snapshot served before the first refresh completes.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_snapshot_has_exact_wire_shape() {
        let value = serde_json::to_value(InsightsSnapshot::empty()).unwrap();
        assert_eq!(
            value,
            json!({
                "coverage": {"total_jobs": 0, "unique_hardware": 0},
                "leaderboard": [],
                "stability": []
            })
        );
    }

    #[test]
    fn generation_is_not_serialized() {
        let snapshot = InsightsSnapshot {
            generation: 7,
            generated_at: Some(Utc::now()),
            ..InsightsSnapshot::empty()
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
        assert!(value.get("generation").is_none());
    }

    #[test]
    fn score_uses_natural_log() {
        let entry = LeaderboardEntry {
            hardware: "h".into(),
            encoder: "e".into(),
            codec: "av1".into(),
            res: "1080p".into(),
            speed: std::f64::consts::E - 1.0,
            reduction: 0.5,
            samples: 3,
        };
        assert!((entry.efficiency_score() - 0.5).abs() < 1e-12);
    }
}
