//! Wire schema and normalization into a strict [`TelemetrySample`].

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::Deserialize;
use tally_types::{Codec, Outcome, TelemetrySample, TypeParseError};

use crate::knock::KnockError;

pub const MAX_LABEL_CHARS: usize = 64;
pub const MAX_SPEED_FACTOR: f64 = 1000.0;
/// One week.
pub const MAX_DURATION_SECONDS: f64 = 604_800.0;

/// A submission as it arrives, before any checks beyond JSON typing.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSample {
    pub hardware: String,
    pub encoder: String,
    pub codec: String,
    pub resolution: String,
    #[serde(default, alias = "speedFactor")]
    pub speed_factor: Option<f64>,
    #[serde(default, alias = "sizeReductionRatio")]
    pub size_reduction_ratio: Option<f64>,
    #[serde(alias = "durationSeconds")]
    pub duration_seconds: f64,
    pub outcome: Outcome,
    #[serde(default, alias = "errorCode")]
    pub error_code: Option<String>,
    /// Parsed and dropped: `submitted_at` is always the server clock.
    #[serde(default, rename = "submitted_at", alias = "submittedAt")]
    _submitted_at: Option<IgnoredAny>,
}

impl RawSample {
    /// Every free-text field, tagged with its wire name.
    pub fn text_fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("hardware", Some(self.hardware.as_str())),
            ("encoder", Some(self.encoder.as_str())),
            ("codec", Some(self.codec.as_str())),
            ("resolution", Some(self.resolution.as_str())),
            ("error_code", self.error_code.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Knock(#[from] KnockError),
    /// Field missing, mistyped or unknown. Carries no detail: serde's message
    /// can quote the offending value.
    #[error("body does not match the sample schema")]
    Schema,
    #[error("{field}: {source}")]
    Label {
        field: &'static str,
        #[source]
        source: TypeParseError,
    },
    #[error("{0} is not finite")]
    NotFinite(&'static str),
    #[error("{0} out of range")]
    OutOfRange(&'static str),
    #[error("{0} is required on successful samples")]
    Missing(&'static str),
    #[error("error_code is only allowed on failed samples")]
    UnexpectedErrorCode,
}

/// Validate bounds and normalize labels. Privacy screening must already
/// have run on `raw`.
pub fn normalize(raw: RawSample, now: DateTime<Utc>) -> Result<TelemetrySample, ValidationError> {
    let success = raw.outcome.is_success();

    let speed_factor = optional_in_range("speed_factor", raw.speed_factor, |v| {
        v > 0.0 && v <= MAX_SPEED_FACTOR
    })?;
    let size_reduction_ratio =
        optional_in_range("size_reduction_ratio", raw.size_reduction_ratio, |v| {
            (0.0..1.0).contains(&v)
        })?;
    let duration_seconds = in_range("duration_seconds", raw.duration_seconds, |v| {
        v > 0.0 && v <= MAX_DURATION_SECONDS
    })?;

    if success {
        if speed_factor.is_none() {
            return Err(ValidationError::Missing("speed_factor"));
        }
        if size_reduction_ratio.is_none() {
            return Err(ValidationError::Missing("size_reduction_ratio"));
        }
        if raw.error_code.is_some() {
            return Err(ValidationError::UnexpectedErrorCode);
        }
    }

    let codec = Codec::parse(&raw.codec).map_err(|source| ValidationError::Label {
        field: "codec",
        source,
    })?;
    let error_code = raw
        .error_code
        .as_deref()
        .map(normalize_error_code)
        .transpose()
        .map_err(|source| ValidationError::Label {
            field: "error_code",
            source,
        })?;

    Ok(TelemetrySample {
        hardware: label("hardware", &raw.hardware)?,
        encoder: label("encoder", &raw.encoder)?,
        codec,
        resolution: resolution(&raw.resolution)?,
        speed_factor,
        size_reduction_ratio,
        duration_seconds,
        outcome: raw.outcome,
        error_code,
        submitted_at: now,
    })
}

/// Trim, collapse inner whitespace runs, lower-case.
pub fn normalize_label(kind: &'static str, raw: &str) -> Result<String, TypeParseError> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    check_label(kind, collapsed.to_lowercase())
}

/// Upper-cased `[A-Z0-9_.-]`, so `crash` and `CRASH` land in one entry.
pub fn normalize_error_code(raw: &str) -> Result<String, TypeParseError> {
    let code = raw.trim().to_ascii_uppercase();
    let code = check_label("error_code", code)?;
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(TypeParseError::InvalidChars { kind: "error_code" });
    }
    Ok(code)
}

fn label(field: &'static str, raw: &str) -> Result<String, ValidationError> {
    normalize_label(field, raw).map_err(|source| ValidationError::Label { field, source })
}

fn resolution(raw: &str) -> Result<String, ValidationError> {
    check_label("resolution", raw.trim().to_lowercase()).map_err(|source| {
        ValidationError::Label {
            field: "resolution",
            source,
        }
    })
}

fn check_label(kind: &'static str, value: String) -> Result<String, TypeParseError> {
    if value.is_empty() {
        return Err(TypeParseError::Empty(kind));
    }
    if value.chars().count() > MAX_LABEL_CHARS {
        return Err(TypeParseError::TooLong {
            kind,
            max: MAX_LABEL_CHARS,
        });
    }
    if value.chars().any(char::is_control) {
        return Err(TypeParseError::InvalidChars { kind });
    }
    Ok(value)
}

fn in_range(
    field: &'static str,
    value: f64,
    ok: impl Fn(f64) -> bool,
) -> Result<f64, ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite(field));
    }
    if !ok(value) {
        return Err(ValidationError::OutOfRange(field));
    }
    Ok(value)
}

fn optional_in_range(
    field: &'static str,
    value: Option<f64>,
    ok: impl Fn(f64) -> bool,
) -> Result<Option<f64>, ValidationError> {
    value.map(|v| in_range(field, v, ok)).transpose()
}
