//! allan.rs — Allan deviation over the PPS offset series
//!
//! Overlapping-pair estimator: pick a block size m close to tau over the mean
//! sampling interval, average consecutive blocks, and take half the mean
//! squared successive difference. The log-log slope over a decade of tau
//! classifies the dominant oscillator noise process.

use std::collections::HashMap;

use serde::Serialize;

/// Dominant noise process inferred from the sigma-tau slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoiseType {
    WhitePhase,
    FlickerPhase,
    WhiteFrequency,
    FlickerFrequency,
    RandomWalkFrequency,
    Unknown,
}

/// Ring of (timestamp, offset) samples with cached per-tau variances.
pub struct AllanDeviation {
    max_samples: usize,
    times_ns: Vec<u64>,
    values: Vec<f64>,
    /// Cache keyed by tau bit pattern; cleared on every new sample
    cache: HashMap<u64, f64>,
}

impl AllanDeviation {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples: max_samples.max(3),
            times_ns: Vec::new(),
            values: Vec::new(),
            cache: HashMap::new(),
        }
    }

    pub fn add_sample(&mut self, timestamp_ns: u64, value: f64) {
        self.times_ns.push(timestamp_ns);
        self.values.push(value);
        if self.times_ns.len() > self.max_samples {
            self.times_ns.remove(0);
            self.values.remove(0);
        }
        self.cache.clear();
    }

    pub fn reset(&mut self) {
        self.times_ns.clear();
        self.values.clear();
        self.cache.clear();
    }

    pub fn sample_count(&self) -> usize {
        self.values.len()
    }

    /// Allan variance at averaging time `tau` seconds; 0 with < 3 samples.
    pub fn variance(&mut self, tau: f64) -> f64 {
        if self.values.len() < 3 || tau <= 0.0 {
            return 0.0;
        }
        if let Some(cached) = self.cache.get(&tau.to_bits()) {
            return *cached;
        }

        let m = self.averaging_factor(tau * 1.0e9);
        if m == 0 {
            return 0.0;
        }

        let mut sum = 0.0;
        let mut count = 0usize;
        let values = &self.values;
        let mut i = 0;
        while i + 2 * m <= values.len() {
            let y1: f64 = values[i..i + m].iter().sum::<f64>() / m as f64;
            let y2: f64 = values[i + m..i + 2 * m].iter().sum::<f64>() / m as f64;
            let diff = y2 - y1;
            sum += diff * diff;
            count += 1;
            i += 1;
        }

        let variance = if count > 0 { 0.5 * sum / count as f64 } else { 0.0 };
        self.cache.insert(tau.to_bits(), variance);
        variance
    }

    /// Allan deviation sigma_y(tau).
    pub fn deviation(&mut self, tau: f64) -> f64 {
        self.variance(tau).sqrt()
    }

    /// Deviation over `points` log-spaced tau values in [min_tau, max_tau].
    pub fn multi_tau(&mut self, min_tau: f64, max_tau: f64, points: usize) -> Vec<(f64, f64)> {
        if min_tau <= 0.0 || max_tau <= min_tau || points < 2 {
            return Vec::new();
        }
        let log_min = min_tau.log10();
        let log_max = max_tau.log10();
        let step = (log_max - log_min) / (points - 1) as f64;
        (0..points)
            .map(|i| {
                let tau = 10f64.powf(log_min + i as f64 * step);
                let dev = self.deviation(tau);
                (tau, dev)
            })
            .collect()
    }

    /// Classify the dominant noise from the sigma-tau slope over
    /// [min_tau, max_tau]. Returns the type and the fitted slope.
    pub fn noise_type(&mut self, min_tau: f64, max_tau: f64) -> (NoiseType, f64) {
        let deviations = self.multi_tau(min_tau, max_tau, 10);
        let points: Vec<(f64, f64)> = deviations
            .into_iter()
            .filter(|(_, dev)| *dev > 0.0)
            .map(|(tau, dev)| (tau.log10(), dev.log10()))
            .collect();
        if points.len() < 2 {
            return (NoiseType::Unknown, 0.0);
        }

        // Least-squares slope on the log-log points
        let n = points.len() as f64;
        let sum_x: f64 = points.iter().map(|p| p.0).sum();
        let sum_y: f64 = points.iter().map(|p| p.1).sum();
        let sum_xy: f64 = points.iter().map(|p| p.0 * p.1).sum();
        let sum_xx: f64 = points.iter().map(|p| p.0 * p.0).sum();
        let denom = n * sum_xx - sum_x * sum_x;
        if denom.abs() < 1e-15 {
            return (NoiseType::Unknown, 0.0);
        }
        let slope = (n * sum_xy - sum_x * sum_y) / denom;

        let noise = if slope < -0.9 {
            NoiseType::WhitePhase
        } else if slope < -0.4 {
            NoiseType::FlickerPhase
        } else if slope < 0.1 {
            NoiseType::WhiteFrequency
        } else if slope < 0.6 {
            NoiseType::FlickerFrequency
        } else {
            NoiseType::RandomWalkFrequency
        };
        (noise, slope)
    }

    /// Block size m ~ tau / mean sampling interval, bounded so at least three
    /// block pairs fit.
    fn averaging_factor(&self, tau_ns: f64) -> usize {
        if self.times_ns.len() < 2 {
            return 0;
        }
        let span = (self.times_ns[self.times_ns.len() - 1] - self.times_ns[0]) as f64;
        let mean_interval = span / (self.times_ns.len() - 1) as f64;
        if mean_interval <= 0.0 {
            return 0;
        }
        let mut m = (tau_ns / mean_interval).round() as usize;
        if m * 3 > self.times_ns.len() {
            m = self.times_ns.len() / 3;
        }
        m.max(1)
    }
}
