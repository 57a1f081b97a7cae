//! Sample Ingestor: the only way a sample reaches the fact store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tally_config::TallyConfig;
use tally_store::{FactStore, StoreError};
use tally_types::BucketKey;
use tracing::{debug, error, warn};

use crate::knock::knock;
use crate::normalize::{normalize, RawSample, ValidationError};
use crate::privacy::{self, PrivacyViolation};
use crate::rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};

/// Receipt for a stored sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub bucket: BucketKey,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RejectionReason {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("privacy: {0}")]
    PrivacyViolation(#[from] PrivacyViolation),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl RejectionReason {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::PrivacyViolation(_) => "privacy",
            Self::RateLimited { .. } => "rate_limited",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Seconds the caller should wait before retrying, when retrying can help.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => Some(retry_after.as_secs() + 1),
            Self::StoreUnavailable(_) => Some(STORE_RETRY_AFTER_SECS),
            _ => None,
        }
    }
}

const STORE_RETRY_AFTER_SECS: u64 = 30;

pub struct Ingestor {
    store: Arc<FactStore>,
    limiter: Option<Arc<RateLimiter>>,
}

impl Ingestor {
    pub fn new(store: Arc<FactStore>, limiter: Option<Arc<RateLimiter>>) -> Self {
        Self { store, limiter }
    }

    /// Ingestor with the limiter the configuration asks for.
    pub fn from_config(store: Arc<FactStore>, config: &TallyConfig) -> Self {
        let limiter = config.rate_limit_enabled.then(|| {
            Arc::new(RateLimiter::new(RateLimitConfig::per_minute(
                config.rate_limit_per_min,
            )))
        });
        Self::new(store, limiter)
    }

    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Validate one raw submission and append it.
    ///
    /// Order: rate limit, knock, schema, privacy, normalize, append. A
    /// rejected sample is never written anywhere.
    pub async fn ingest(&self, raw: &[u8], origin: &str) -> Result<Accepted, RejectionReason> {
        if let Some(limiter) = &self.limiter {
            if let RateLimitResult::Limited { retry_after } = limiter.check(origin).await {
                debug!(retry_after_ms = retry_after.as_millis() as u64, "submission rate limited");
                return Err(RejectionReason::RateLimited { retry_after });
            }
        }
        self.accept(raw)
    }

    fn accept(&self, raw: &[u8]) -> Result<Accepted, RejectionReason> {
        let value = knock(raw).map_err(|e| {
            debug!(error = %e, "knock rejected submission");
            ValidationError::from(e)
        })?;
        let parsed: RawSample = serde_json::from_value(value).map_err(|_| {
            debug!("submission does not match schema");
            ValidationError::Schema
        })?;

        for (field, text) in parsed.text_fields() {
            if let Err(violation) = privacy::screen(field, text) {
                warn!(
                    field = violation.field,
                    pattern = %violation.kind,
                    "privacy screen rejected submission"
                );
                return Err(violation.into());
            }
        }

        let sample = normalize(parsed, Utc::now()).map_err(|e| {
            debug!(error = %e, "submission failed validation");
            e
        })?;
        let accepted = Accepted {
            bucket: sample.bucket_key(),
            submitted_at: sample.submitted_at,
        };
        self.store.append(sample).map_err(|e| {
            error!(error = %e, "fact store append failed");
            RejectionReason::StoreUnavailable(e)
        })?;
        Ok(accepted)
    }
}
