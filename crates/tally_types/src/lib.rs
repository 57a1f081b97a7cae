//! Leaf-level data model for the insights engine.
//!
//! Everything here is plain data: the validated `TelemetrySample` that the
//! ingestor produces, the `BucketKey` the store partitions by, and the
//! derived entries that make up an `InsightsSnapshot`. No crate in the
//! workspace sits below this one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod insights;

pub use insights::{
    Coverage, EncoderReliability, InsightsSnapshot, LeaderboardEntry, StabilityEntry,
};

/// Separator used when a `BucketKey` is flattened into a storage key.
/// ASCII unit separator; the ingestor rejects control characters in labels,
/// so it can never appear inside a component.
pub const KEY_SEPARATOR: char = '\u{1f}';

// ── Codec ───────────────────────────────────────────────────────────────

/// Video codec family, lower-cased with common aliases folded together.
///
/// Invariant: non-empty, at most 16 chars of `[a-z0-9_.-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Codec(String);

impl Codec {
    pub const MAX_LEN: usize = 16;

    /// Validated constructor. Trims, lower-cases and folds aliases
    /// (`h265` → `hevc`, `avc` → `h264`, ...).
    pub fn parse(raw: &str) -> Result<Self, TypeParseError> {
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered.is_empty() {
            return Err(TypeParseError::Empty("codec"));
        }
        if lowered.len() > Self::MAX_LEN {
            return Err(TypeParseError::TooLong {
                kind: "codec",
                max: Self::MAX_LEN,
            });
        }
        if !lowered
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(TypeParseError::InvalidChars { kind: "codec" });
        }
        let canonical = match lowered.as_str() {
            "h265" | "x265" | "h.265" | "hvc1" | "hev1" => "hevc",
            "avc" | "x264" | "h.264" | "avc1" => "h264",
            "vp09" => "vp9",
            "av01" => "av1",
            other => other,
        };
        Ok(Self(canonical.to_string()))
    }

    /// Unchecked constructor for values read back from the store.
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Outcome ─────────────────────────────────────────────────────────────

/// How the encoding job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

// ── BucketKey ───────────────────────────────────────────────────────────

/// Configuration bucket: the unit of aggregation.
///
/// The derived `Ord` compares hardware, then encoder, then codec, then
/// resolution, which is the leaderboard's final tie-break order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub hardware: String,
    pub encoder: String,
    pub codec: Codec,
    pub resolution: String,
}

impl BucketKey {
    pub fn new(
        hardware: impl Into<String>,
        encoder: impl Into<String>,
        codec: Codec,
        resolution: impl Into<String>,
    ) -> Self {
        Self {
            hardware: hardware.into(),
            encoder: encoder.into(),
            codec,
            resolution: resolution.into(),
        }
    }

    /// Flat key used as a storage prefix: components joined by
    /// [`KEY_SEPARATOR`], with a trailing separator so that one bucket's
    /// prefix never matches a longer sibling.
    pub fn storage_prefix(&self) -> String {
        let mut out = String::with_capacity(
            self.hardware.len() + self.encoder.len() + self.resolution.len() + 24,
        );
        for part in [
            self.hardware.as_str(),
            self.encoder.as_str(),
            self.codec.as_str(),
            self.resolution.as_str(),
        ] {
            out.push_str(part);
            out.push(KEY_SEPARATOR);
        }
        out
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.hardware, self.encoder, self.codec, self.resolution
        )
    }
}

// ── TelemetrySample ─────────────────────────────────────────────────────

/// One validated, normalized telemetry record. Immutable once accepted.
///
/// Built only by the ingestor; speed and size fields are always present on
/// successful samples and optional on failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub hardware: String,
    pub encoder: String,
    pub codec: Codec,
    pub resolution: String,
    pub speed_factor: Option<f64>,
    pub size_reduction_ratio: Option<f64>,
    pub duration_seconds: f64,
    pub outcome: Outcome,
    pub error_code: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn bucket_key(&self) -> BucketKey {
        BucketKey::new(
            self.hardware.clone(),
            self.encoder.clone(),
            self.codec.clone(),
            self.resolution.clone(),
        )
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeParseError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{kind} exceeds {max} characters")]
    TooLong { kind: &'static str, max: usize },
    #[error("{kind} contains characters outside the allowed set")]
    InvalidChars { kind: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_folds_aliases() {
        assert_eq!(Codec::parse("H265").unwrap().as_str(), "hevc");
        assert_eq!(Codec::parse(" x264 ").unwrap().as_str(), "h264");
        assert_eq!(Codec::parse("AV1").unwrap().as_str(), "av1");
        assert_eq!(Codec::parse("vp09").unwrap().as_str(), "vp9");
        assert_eq!(Codec::parse("prores").unwrap().as_str(), "prores");
    }

    #[test]
    fn codec_rejects_bad_input() {
        assert_eq!(Codec::parse("  "), Err(TypeParseError::Empty("codec")));
        assert!(matches!(
            Codec::parse("hevc/main10"),
            Err(TypeParseError::InvalidChars { .. })
        ));
        assert!(matches!(
            Codec::parse("averyveryverylongcodecname"),
            Err(TypeParseError::TooLong { .. })
        ));
    }

    #[test]
    fn bucket_prefix_is_not_a_prefix_of_sibling() {
        let a = BucketKey::new("gpu", "nvenc", Codec::new_unchecked("hevc"), "1080p");
        let b = BucketKey::new("gpu", "nvenc", Codec::new_unchecked("hevc"), "1080p60");
        assert!(!b.storage_prefix().starts_with(&a.storage_prefix()));
    }

    #[test]
    fn bucket_keys_order_by_hardware_first() {
        let a = BucketKey::new("a", "z", Codec::new_unchecked("vp9"), "720p");
        let b = BucketKey::new("b", "a", Codec::new_unchecked("av1"), "480p");
        assert!(a < b);
    }

    #[test]
    fn outcome_wire_form_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&Outcome::Failure).unwrap(),
            "\"failure\""
        );
    }
}
