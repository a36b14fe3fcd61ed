//! Lock-free fixed-range frequency table shared by all workers.
//!
//! Every bucket is an independent atomic counter, so concurrent `record` calls from any
//! number of threads yield exact per-bucket counts. The running minimum and maximum are
//! maintained with compare-and-swap retry loops which converge to the true extremum once
//! all writers quiesce.
//!
//! The aggregate read-side methods ([`Histogram::mean`], [`Histogram::stdev`],
//! [`Histogram::within_stdev`], [`Histogram::percentile`] and [`Histogram::correct`]) are
//! meant to run after recording has stopped. Nothing enforces this; running them
//! concurrently with writers only yields a possibly inconsistent snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use serde::{Serialize, Serializer};

pub struct Histogram {
    buckets: Box<[AtomicU64]>,
    count: CachePadded<AtomicU64>,
    min: CachePadded<AtomicU64>,
    max: CachePadded<AtomicU64>,
}

impl Histogram {
    /// Creates a histogram accepting values in `0..limit`.
    pub fn new(limit: u64) -> Self {
        let buckets = (0..limit).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            count: CachePadded::new(AtomicU64::new(0)),
            min: CachePadded::new(AtomicU64::new(u64::MAX)),
            max: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn limit(&self) -> u64 {
        self.buckets.len() as u64
    }

    /// Records one occurrence of `value`.
    ///
    /// Returns `false` and leaves every counter untouched if `value` is out of range.
    pub fn record(&self, value: u64) -> bool {
        let Some(bucket) = self.buckets.get(value as usize) else {
            return false;
        };
        bucket.fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.lower_min(value);
        self.raise_max(value);
        true
    }

    fn lower_min(&self, value: u64) {
        let mut current = self.min.load(Ordering::Relaxed);
        while value < current {
            match self.min.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(stored) => current = stored,
            }
        }
    }

    fn raise_max(&self, value: u64) {
        let mut current = self.max.load(Ordering::Relaxed);
        while value > current {
            match self.max.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(stored) => current = stored,
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Smallest recorded value, `None` while empty.
    pub fn min(&self) -> Option<u64> {
        (self.count() > 0).then(|| self.min.load(Ordering::Relaxed))
    }

    /// Largest recorded value, `0` while empty.
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Count stored in the bucket for `value`; `0` when out of range.
    pub fn bucket(&self, value: u64) -> u64 {
        self.buckets
            .get(value as usize)
            .map_or(0, |b| b.load(Ordering::Relaxed))
    }

    /// Iterates `(value, count)` over the occupied range `min..=max`.
    fn occupied(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let range = match self.min() {
            Some(min) => min..=self.max(),
            #[allow(clippy::reversed_empty_ranges)]
            None => 1..=0,
        };
        range.map(|v| (v, self.bucket(v)))
    }

    /// Coordinated-omission correction.
    ///
    /// For every bucket `n >= 2 * expected`, each of its samples implies the requests that
    /// would have been issued while it stalled; one synthetic sample is added at
    /// `n - expected`, `n - 2 * expected`, ... for every such point strictly above
    /// `expected`.
    pub fn correct(&self, expected: u64) {
        if expected == 0 || self.count() == 0 {
            return;
        }
        let Some(start) = expected.checked_mul(2) else {
            return;
        };
        let max = self.max();
        let mut lowest = None;

        for n in start..=max {
            let count = self.bucket(n);
            if count == 0 {
                continue;
            }
            let mut m = n - expected;
            while m > expected {
                self.buckets[m as usize].fetch_add(count, Ordering::Relaxed);
                self.count.fetch_add(count, Ordering::Relaxed);
                lowest = Some(lowest.map_or(m, |low: u64| low.min(m)));
                m -= expected;
            }
        }

        if let Some(lowest) = lowest {
            self.lower_min(lowest);
        }
    }

    /// Weighted mean of all recorded values, `0` when empty.
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .occupied()
            .map(|(value, n)| n as f64 * value as f64)
            .sum();
        sum / count as f64
    }

    /// Sample standard deviation (Bessel corrected), `0` with fewer than two samples.
    pub fn stdev(&self, mean: f64) -> f64 {
        let count = self.count();
        if count < 2 {
            return 0.0;
        }
        let sum: f64 = self
            .occupied()
            .filter(|(_, n)| *n > 0)
            .map(|(value, n)| n as f64 * (value as f64 - mean).powi(2))
            .sum();
        (sum / (count - 1) as f64).sqrt()
    }

    /// Percentage of samples within `k` standard deviations of `mean`.
    pub fn within_stdev(&self, mean: f64, stdev: f64, k: u64) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        let lower = mean - stdev * k as f64;
        let upper = mean + stdev * k as f64;
        let within: u64 = self
            .occupied()
            .filter(|(value, _)| (lower..=upper).contains(&(*value as f64)))
            .map(|(_, n)| n)
            .sum();
        within as f64 / count as f64 * 100.0
    }

    /// Smallest value at which the cumulative count reaches `percentile`% of all samples.
    pub fn percentile(&self, percentile: f64) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        let target = ((percentile.clamp(0.0, 100.0) / 100.0) * count as f64).ceil() as u64;
        let target = target.max(1);
        let mut seen = 0;
        for (value, n) in self.occupied() {
            seen += n;
            if seen >= target {
                return value;
            }
        }
        self.max()
    }
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Histogram")
            .field("limit", &self.limit())
            .field("count", &self.count())
            .field("min", &self.min())
            .field("max", &self.max())
            .finish()
    }
}

/// Serializes the summary statistics rather than the raw buckets.
impl Serialize for Histogram {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mean = self.mean();
        let stdev = self.stdev(mean);
        let mut state = serializer.serialize_struct("Histogram", 9)?;
        state.serialize_field("count", &self.count())?;
        state.serialize_field("min", &self.min())?;
        state.serialize_field("max", &self.max())?;
        state.serialize_field("mean", &mean)?;
        state.serialize_field("stdev", &stdev)?;
        state.serialize_field("within_stdev", &self.within_stdev(mean, stdev, 1))?;
        state.serialize_field("p50", &self.percentile(50.0))?;
        state.serialize_field("p90", &self.percentile(90.0))?;
        state.serialize_field("p99", &self.percentile(99.0))?;
        state.end()
    }
}
