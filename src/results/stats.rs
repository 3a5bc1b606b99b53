//! Progressive statistics over interaction streams.
//!
//! Two tools: [`moving_average`] for per-stream reward curves, and
//! [`OnlineStats`] for mean/variance estimates that can be merged across
//! disjoint shards of a stream without re-scanning raw data.

/// Computes a moving average over `values`.
///
/// With `span = Some(n)` each point is the mean of the trailing window of up
/// to `n` values (a sliding window). With `span = None` each point is the
/// cumulative mean of everything seen so far (a progressive average).
pub fn moving_average(values: &[f64], span: Option<usize>) -> Vec<f64> {
    match span {
        None => {
            let mut out = Vec::with_capacity(values.len());
            let mut sum = 0.0;
            for (i, v) in values.iter().enumerate() {
                sum += v;
                out.push(sum / (i + 1) as f64);
            }
            out
        }
        Some(0) => Vec::new(),
        Some(span) => {
            let mut out = Vec::with_capacity(values.len());
            let mut sum = 0.0;
            for (i, v) in values.iter().enumerate() {
                sum += v;
                if i >= span {
                    sum -= values[i - span];
                }
                let window = (i + 1).min(span);
                out.push(sum / window as f64);
            }
            out
        }
    }
}

/// A mergeable streaming mean/variance estimate.
///
/// Accumulates with Welford's update and merges two partial estimates with
/// the weighted (sample-count) combination, so statistics computed on
/// disjoint shards equal the statistics of the concatenated stream up to
/// floating-point error.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: &[f64]) -> Self {
        let mut stats = Self::new();
        for &v in values {
            stats.update(v);
        }
        stats
    }

    /// Folds one observation into the estimate.
    pub fn update(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Combines two partial estimates, weighting by sample counts.
    pub fn merge(&self, other: &OnlineStats) -> OnlineStats {
        if self.n == 0 {
            return *other;
        }
        if other.n == 0 {
            return *self;
        }
        let n = self.n + other.n;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * other.n as f64 / n as f64;
        let m2 = self.m2 + other.m2 + delta * delta * (self.n as f64 * other.n as f64) / n as f64;
        OnlineStats { n, mean, m2 }
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            f64::NAN
        } else {
            self.mean
        }
    }

    /// Sample variance (n - 1 denominator).
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            f64::NAN
        } else {
            self.m2 / (self.n - 1) as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn standard_error(&self) -> f64 {
        if self.n < 2 {
            f64::NAN
        } else {
            (self.variance() / self.n as f64).sqrt()
        }
    }
}
