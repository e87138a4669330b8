// Fixed-capacity reservoir for approximate latency percentiles
//
// Numan Thabit 2025 Nov

use rand::Rng;

/// Uniform sample of an unbounded stream (Algorithm R).
///
/// Percentiles read from the reservoir are exact while fewer than `capacity`
/// samples have been seen and approximate afterwards.
#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: usize,
    seen: u64,
    samples: Vec<f64>,
}

/// p90/p95/p99 read from one sorted copy of the reservoir.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: 0,
            samples: Vec::with_capacity(capacity.min(1024)),
        }
    }

    /// Offer one sample. Past capacity, the n-th sample replaces a random
    /// slot with probability `capacity / n`.
    pub fn offer<R: Rng + ?Sized>(&mut self, value: f64, rng: &mut R) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let slot = rng.gen_range(0..self.seen);
        if let Ok(slot) = usize::try_from(slot) {
            if slot < self.capacity {
                self.samples[slot] = value;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Order statistic at `ceil(pct/100 * size) - 1` of the sorted reservoir.
    pub fn percentile(&self, pct: u32) -> Option<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        rank(&sorted, pct)
    }

    pub fn percentiles(&self) -> Option<Percentiles> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        Some(Percentiles {
            p90: rank(&sorted, 90)?,
            p95: rank(&sorted, 95)?,
            p99: rank(&sorted, 99)?,
        })
    }
}

fn rank(sorted: &[f64], pct: u32) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    // integer ceil keeps 95% of 20 at index 18 instead of drifting on float rounding
    let ordinal = (pct.min(100) as usize * n).div_ceil(100).max(1);
    sorted.get(ordinal - 1).copied()
}
