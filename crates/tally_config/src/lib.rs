//! Runtime configuration, read once from the environment at startup.
//!
//! Unset or unparsable variables fall back to their defaults; a bad value
//! is logged and otherwise ignored so a typo never keeps the gate down.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Which `FactBackend` the store opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    Memory,
    Sled,
    Sqlite,
}

impl FromStr for StoreBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "sled" => Ok(Self::Sled),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend {other:?}")),
        }
    }
}

/// Aggregation tunables. Kept separate so the runtime crate can take just
/// this part.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationConfig {
    /// Minimum successful samples before a bucket is ranked.
    pub min_samples: u64,
    /// Fraction of speed values dropped from each end when trimming.
    pub trim_fraction: f64,
    /// Bucket size at which trimming starts.
    pub trim_min_samples: u64,
    /// Minimum count for a stability entry to be reported.
    pub stability_min_count: u64,
    pub leaderboard_limit: usize,
    pub stability_limit: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            trim_fraction: 0.05,
            trim_min_samples: 20,
            stability_min_count: 1,
            leaderboard_limit: 50,
            stability_limit: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TallyConfig {
    pub listen_addr: SocketAddr,
    pub store_backend: StoreBackendKind,
    pub store_path: PathBuf,
    pub refresh_interval: Duration,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_min: u32,
    /// Take the submitting origin from `X-Forwarded-For` instead of the
    /// socket peer. Only safe behind a proxy that sets it.
    pub trust_forwarded_for: bool,
    pub aggregation: AggregationConfig,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            store_backend: StoreBackendKind::Sled,
            store_path: PathBuf::from("./data/samples"),
            refresh_interval: Duration::from_secs(60),
            rate_limit_enabled: true,
            rate_limit_per_min: 30,
            trust_forwarded_for: false,
            aggregation: AggregationConfig::default(),
        }
    }
}

impl TallyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. `from_env` is this with
    /// `std::env::var`; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let agg = AggregationConfig::default();
        Self {
            listen_addr: parsed(&lookup, "TALLY_LISTEN_ADDR", d.listen_addr),
            store_backend: parsed(&lookup, "TALLY_STORE_BACKEND", d.store_backend),
            store_path: lookup("TALLY_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.store_path),
            refresh_interval: Duration::from_secs(
                parsed(&lookup, "TALLY_REFRESH_INTERVAL_SECS", 60u64).max(1),
            ),
            rate_limit_enabled: env_bool(&lookup, "TALLY_RATE_LIMIT_ENABLED", true),
            rate_limit_per_min: parsed(&lookup, "TALLY_RATE_LIMIT_PER_MIN", d.rate_limit_per_min)
                .max(1),
            trust_forwarded_for: env_bool(&lookup, "TALLY_TRUST_FORWARDED_FOR", false),
            aggregation: AggregationConfig {
                min_samples: parsed(&lookup, "TALLY_MIN_SAMPLES", agg.min_samples).max(1),
                trim_fraction: parsed(&lookup, "TALLY_TRIM_FRACTION", agg.trim_fraction)
                    .clamp(0.0, 0.49),
                trim_min_samples: parsed(&lookup, "TALLY_TRIM_MIN_SAMPLES", agg.trim_min_samples),
                stability_min_count: parsed(
                    &lookup,
                    "TALLY_STABILITY_MIN_COUNT",
                    agg.stability_min_count,
                )
                .max(1),
                leaderboard_limit: parsed(&lookup, "TALLY_LEADERBOARD_LIMIT", agg.leaderboard_limit),
                stability_limit: parsed(&lookup, "TALLY_STABILITY_LIMIT", agg.stability_limit),
            },
        }
    }
}

fn env_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(default)
}

fn parsed<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable config value");
            default
        }
    }
}
