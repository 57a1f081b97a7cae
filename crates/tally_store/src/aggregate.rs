//! Running aggregate state, one object per bucket and one per encoder.
//!
//! Sums are kept in fixed-point units (value × 10⁹) so that accumulation is
//! exact integer arithmetic: the result is independent of the order samples
//! arrive in, and merging partial aggregates from several instances is
//! commutative and associative.

use std::collections::BTreeMap;
use tally_config::AggregationConfig;
use tally_types::TelemetrySample;

/// Units per 1.0 in the fixed-point sums.
pub const FIXED_POINT_SCALE: f64 = 1_000_000_000.0;

fn to_units(v: f64) -> u64 {
    (v * FIXED_POINT_SCALE).round() as u64
}

fn from_units(units: u128, count: u64) -> f64 {
    units as f64 / (count as f64 * FIXED_POINT_SCALE)
}

/// Running state for one configuration bucket.
///
/// Failed samples count as attempts but contribute no speed or size data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketAggregate {
    attempts: u64,
    successes: u64,
    speed_units: u128,
    reduction_units: u128,
    /// Successful speeds as value -> occurrences, kept ordered for trimming.
    speed_histogram: BTreeMap<u64, u64>,
}

/// What the leaderboard needs from one bucket, read in one short pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStats {
    pub successes: u64,
    pub consistent: bool,
    /// Trimmed when the bucket reaches `trim_min_samples`.
    pub speed: Option<f64>,
    pub reduction: Option<f64>,
}

impl BucketAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: &TelemetrySample) {
        self.attempts += 1;
        if !sample.is_success() {
            return;
        }
        let (Some(speed), Some(reduction)) = (sample.speed_factor, sample.size_reduction_ratio)
        else {
            return;
        };
        let speed = to_units(speed);
        self.successes += 1;
        self.speed_units += u128::from(speed);
        self.reduction_units += u128::from(to_units(reduction));
        *self.speed_histogram.entry(speed).or_insert(0) += 1;
    }

    /// Fold another partial aggregate (e.g. from a second instance) into
    /// this one.
    pub fn merge(&mut self, other: &BucketAggregate) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.speed_units += other.speed_units;
        self.reduction_units += other.reduction_units;
        for (speed, count) in &other.speed_histogram {
            *self.speed_histogram.entry(*speed).or_insert(0) += count;
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    /// Number of distinct speed values retained.
    pub fn distinct_speeds(&self) -> usize {
        self.speed_histogram.len()
    }

    /// Cheap counter check. Debug builds also re-sum the histogram.
    pub fn is_consistent(&self) -> bool {
        let counters = self.successes <= self.attempts
            && self.speed_histogram.is_empty() == (self.successes == 0);
        counters && (!cfg!(debug_assertions) || self.histogram_matches_counters())
    }

    fn histogram_matches_counters(&self) -> bool {
        let (count, units) = self
            .speed_histogram
            .iter()
            .fold((0u64, 0u128), |(n, sum), (speed, c)| {
                (n + c, sum + u128::from(*speed) * u128::from(*c))
            });
        count == self.successes && units == self.speed_units
    }

    pub fn mean_speed(&self) -> Option<f64> {
        (self.successes > 0).then(|| from_units(self.speed_units, self.successes))
    }

    pub fn mean_reduction(&self) -> Option<f64> {
        (self.successes > 0).then(|| from_units(self.reduction_units, self.successes))
    }

    /// Mean speed after dropping `floor(n * fraction)` values from each end.
    /// Falls back to the plain mean when nothing would be dropped.
    ///
    /// Only the two tails of the histogram are walked.
    pub fn trimmed_mean_speed(&self, fraction: f64) -> Option<f64> {
        if self.successes == 0 {
            return None;
        }
        let n = self.successes;
        let cut = ((n as f64) * fraction).floor() as u64;
        if cut == 0 || cut * 2 >= n {
            return self.mean_speed();
        }
        let low = tail_units(self.speed_histogram.iter(), cut);
        let high = tail_units(self.speed_histogram.iter().rev(), cut);
        let kept = self.speed_units.checked_sub(low + high)?;
        Some(from_units(kept, n - 2 * cut))
    }

    /// Everything a leaderboard entry is built from.
    pub fn stats(&self, config: &AggregationConfig) -> BucketStats {
        let speed = if self.successes >= config.trim_min_samples {
            self.trimmed_mean_speed(config.trim_fraction)
        } else {
            self.mean_speed()
        };
        BucketStats {
            successes: self.successes,
            consistent: self.is_consistent(),
            speed,
            reduction: self.mean_reduction(),
        }
    }
}

/// Sum of the first `take` values of a (value, occurrences) walk.
fn tail_units<'a, I>(entries: I, take: u64) -> u128
where
    I: Iterator<Item = (&'a u64, &'a u64)>,
{
    let mut left = take;
    let mut units = 0u128;
    for (speed, count) in entries {
        if left == 0 {
            break;
        }
        let used = (*count).min(left);
        units += u128::from(*speed) * u128::from(used);
        left -= used;
    }
    units
}

/// Per-encoder attempt and failure counts.
///
/// Failures without an error code count toward `total_failures` but have
/// no entry in `failures`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncoderTally {
    attempts: u64,
    failed: u64,
    failures: BTreeMap<String, u64>,
}

impl EncoderTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: &TelemetrySample) {
        self.attempts += 1;
        if sample.is_success() {
            return;
        }
        self.failed += 1;
        if let Some(code) = sample.error_code.as_deref() {
            *self.failures.entry(code.to_string()).or_insert(0) += 1;
        }
    }

    pub fn merge(&mut self, other: &EncoderTally) {
        self.attempts += other.attempts;
        self.failed += other.failed;
        for (code, count) in &other.failures {
            *self.failures.entry(code.clone()).or_insert(0) += count;
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Failure counts keyed by error code, in code order.
    pub fn failures(&self) -> &BTreeMap<String, u64> {
        &self.failures
    }

    pub fn total_failures(&self) -> u64 {
        self.failed
    }
}
