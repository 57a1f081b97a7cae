//! Tally runtime: everything between the HTTP gate and the fact store.
//!
//! Write path: [`ingest::Ingestor`] runs rate limit → knock → schema →
//! privacy → normalize, then appends to the [`tally_store::FactStore`].
//!
//! Read path: [`insights::InsightsCache`] periodically runs the efficiency
//! and stability aggregators over the store's running aggregates and
//! publishes a fresh [`tally_types::InsightsSnapshot`] by pointer swap.

pub mod efficiency;
pub mod ingest;
pub mod insights;
pub mod knock;
pub mod normalize;
pub mod privacy;
pub mod rate_limit;
pub mod stability;

pub use efficiency::{compute_leaderboard, AggregationError};
pub use ingest::{Accepted, Ingestor, RejectionReason};
pub use insights::{spawn_refresh_loop, InsightsCache, RefreshError, RefreshReport};
pub use privacy::{PatternKind, PrivacyViolation};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use stability::{compute_stability, encoder_reliability};
