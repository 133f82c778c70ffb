//! Latency distribution statistics.
//!
//! Percentiles for small samples come from a full sort; large samples skip
//! the `O(n log n)` sort and use a randomized-pivot quickselect per
//! percentile instead, with min and max taken from the first pass. Each
//! selection runs on the same buffer but none relies on the ordering a
//! previous one left behind.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The reported percentile points, in order: min, 25th, median, 75th,
/// 90th, 95th, 99th, max.
const PERCENTILES: [f64; 8] = [0.0, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 1.0];

/// Below this sample size a full sort beats repeated selection.
const QUICKSELECT_THRESHOLD: usize = 10_000;

/// Summary of a latency sample: count, mean, sample standard deviation and
/// the fixed percentile set. Latencies are nanoseconds; the display form
/// converts to milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionStatistics {
    count: usize,
    percentiles: [i64; 8],
    mean: f64,
    std_dev: f64,
}

impl DistributionStatistics {
    /// Compute statistics over `values`.
    ///
    /// The input buffer is working space and WILL be reordered by the
    /// percentile selection. An empty input yields a sentinel record with
    /// `count == 0` and every other field at `-1`.
    pub fn compute(values: &mut [i32]) -> Self {
        if values.is_empty() {
            tracing::warn!("cannot compute statistics for an empty sample");
            return Self {
                count: 0,
                percentiles: [-1; 8],
                mean: -1.0,
                std_dev: -1.0,
            };
        }

        let n = values.len();
        let mut sum = 0.0;
        let mut min = i32::MAX;
        let mut max = i32::MIN;
        for &v in values.iter() {
            sum += f64::from(v);
            min = min.min(v);
            max = max.max(v);
        }
        let mean = sum / n as f64;

        let mut sum_sq_diff = 0.0;
        for &v in values.iter() {
            let d = f64::from(v) - mean;
            sum_sq_diff += d * d;
        }
        let std_dev = if n > 1 {
            (sum_sq_diff / (n - 1) as f64).sqrt()
        } else {
            0.0
        };

        let mut percentiles = [0i64; 8];
        if n <= QUICKSELECT_THRESHOLD {
            values.sort_unstable();
            for (slot, p) in percentiles.iter_mut().zip(PERCENTILES) {
                *slot = i64::from(values[rank(p, n)]);
            }
        } else {
            percentiles[0] = i64::from(min);
            percentiles[7] = i64::from(max);
            let mut rng = rand::thread_rng();
            for i in 1..PERCENTILES.len() - 1 {
                percentiles[i] =
                    i64::from(quickselect(values, rank(PERCENTILES[i], n), &mut rng));
            }
        }

        Self {
            count: n,
            percentiles,
            mean,
            std_dev,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn minimum(&self) -> i64 {
        self.percentiles[0]
    }

    pub fn p25(&self) -> i64 {
        self.percentiles[1]
    }

    pub fn median(&self) -> i64 {
        self.percentiles[2]
    }

    pub fn p75(&self) -> i64 {
        self.percentiles[3]
    }

    pub fn p90(&self) -> i64 {
        self.percentiles[4]
    }

    pub fn p95(&self) -> i64 {
        self.percentiles[5]
    }

    pub fn p99(&self) -> i64 {
        self.percentiles[6]
    }

    pub fn maximum(&self) -> i64 {
        self.percentiles[7]
    }
}

impl fmt::Display for DistributionStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MS: f64 = 1e6;
        write!(
            f,
            "[min={:.3}, 25th={:.3}, median={:.3}, avg={:.3}, 75th={:.3}, \
             90th={:.3}, 95th={:.3}, 99th={:.3}, max={:.3}]",
            self.minimum() as f64 / MS,
            self.p25() as f64 / MS,
            self.median() as f64 / MS,
            self.mean / MS,
            self.p75() as f64 / MS,
            self.p90() as f64 / MS,
            self.p95() as f64 / MS,
            self.p99() as f64 / MS,
            self.maximum() as f64 / MS,
        )
    }
}

/// Index of percentile `p` in a sorted sample of `n`, clamped to the last
/// element.
fn rank(p: f64, n: usize) -> usize {
    ((p * n as f64) as usize).min(n - 1)
}

/// K-th smallest element via randomized-pivot quickselect. Average `O(n)`;
/// the random pivot makes the quadratic worst case vanishingly unlikely.
fn quickselect<R: Rng>(values: &mut [i32], k: usize, rng: &mut R) -> i32 {
    let mut lo = 0;
    let mut hi = values.len() - 1;
    loop {
        if lo == hi {
            return values[lo];
        }
        let pivot = lo + rng.gen_range(0..=hi - lo);
        let pivot = partition(values, lo, hi, pivot);
        match k.cmp(&pivot) {
            std::cmp::Ordering::Equal => return values[k],
            std::cmp::Ordering::Less => hi = pivot - 1,
            std::cmp::Ordering::Greater => lo = pivot + 1,
        }
    }
}

fn partition(values: &mut [i32], lo: usize, hi: usize, pivot: usize) -> usize {
    let pivot_value = values[pivot];
    values.swap(pivot, hi);
    let mut store = lo;
    for i in lo..hi {
        if values[i] < pivot_value {
            values.swap(store, i);
            store += 1;
        }
    }
    values.swap(store, hi);
    store
}
