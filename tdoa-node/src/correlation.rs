//! correlation.rs — windowed cross-correlation with sub-sample peak
//! interpolation
//!
//! Turns a pair of sample streams into a delay estimate with confidence. The
//! correlation itself is the direct O(N²) form; the accuracy comes from the
//! peak interpolators, which refine the integer-lag maximum to a fraction of a
//! sample. Confidence blends the peak's SNR against the off-peak noise floor
//! with the local curvature (a sharp peak is trustworthy, a plateau is not).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Window applied to both inputs before correlating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowType {
    /// Rectangular (no windowing)
    None,
    #[default]
    Hamming,
    Hanning,
    Blackman,
    BlackmanHarris,
    FlatTop,
}

/// Sub-sample refinement applied to each detected peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterpolationType {
    None,
    #[default]
    Parabolic,
    Cubic,
    Gaussian,
    Sinc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    pub window: WindowType,
    pub interpolation: InterpolationType,
    /// Peaks below `peak_threshold * max|r|` are ignored
    pub peak_threshold: f64,
    pub max_peaks: usize,
    pub normalize_output: bool,
    /// Sample rate of both inputs, Hz
    pub sample_rate: f64,
    /// Minimum linear SNR for a peak to be considered valid downstream
    pub min_snr: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window: WindowType::Hamming,
            interpolation: InterpolationType::Parabolic,
            peak_threshold: 0.5,
            max_peaks: 3,
            normalize_output: true,
            sample_rate: 1.0,
            min_snr: 3.0,
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// One interpolated correlation peak.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CorrelationPeak {
    /// Peak location in samples from the start of the lag window (fractional)
    pub delay: f64,
    /// Correlation value at the interpolated peak (sign preserved)
    pub coefficient: f64,
    /// Linear SNR against the off-peak noise floor
    pub snr: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

/// Full output of one correlation call.
#[derive(Debug, Clone, Default)]
pub struct CorrelationResult {
    /// Correlation sequence of length n1 + n2 - 1
    pub correlation: Vec<f64>,
    /// Peaks sorted by descending confidence, at most `max_peaks`
    pub peaks: Vec<CorrelationPeak>,
    pub sample_rate: f64,
    pub max_peak_confidence: f64,
}

impl CorrelationResult {
    /// Peak with the greatest confidence, if any survived the threshold.
    pub fn best_peak(&self) -> Option<&CorrelationPeak> {
        self.peaks.first()
    }

    /// Lag-window centre: the index at which two aligned signals peak.
    pub fn zero_lag(&self) -> f64 {
        (self.correlation.len() as f64 - 1.0) / 2.0
    }
}

// ── Windows ───────────────────────────────────────────────────────────────────

/// Cosine-sum window coefficients over [0, length - 1].
pub fn generate_window(length: usize, window: WindowType) -> Result<Vec<f64>> {
    if length == 0 {
        return Err(PipelineError::Precondition("window length must be positive".into()));
    }
    if length == 1 {
        return Ok(vec![1.0]);
    }
    let n = (length - 1) as f64;
    let coeffs = |i: usize| 2.0 * std::f64::consts::PI * i as f64 / n;
    let values = (0..length)
        .map(|i| {
            let x = coeffs(i);
            match window {
                WindowType::None => 1.0,
                WindowType::Hamming => 0.54 - 0.46 * x.cos(),
                WindowType::Hanning => 0.5 * (1.0 - x.cos()),
                WindowType::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                WindowType::BlackmanHarris => {
                    0.35875 - 0.48829 * x.cos() + 0.14128 * (2.0 * x).cos()
                        - 0.01168 * (3.0 * x).cos()
                }
                WindowType::FlatTop => {
                    0.21557895 - 0.41663158 * x.cos() + 0.277263158 * (2.0 * x).cos()
                        - 0.083578947 * (3.0 * x).cos()
                        + 0.006947368 * (4.0 * x).cos()
                }
            }
        })
        .collect();
    Ok(values)
}

fn apply_window(signal: &[f64], window: WindowType) -> Result<Vec<f64>> {
    if window == WindowType::None {
        return Ok(signal.to_vec());
    }
    let w = generate_window(signal.len(), window)?;
    Ok(signal.iter().zip(&w).map(|(s, w)| s * w).collect())
}

fn apply_window_complex(signal: &[(f64, f64)], window: WindowType) -> Result<Vec<(f64, f64)>> {
    if window == WindowType::None {
        return Ok(signal.to_vec());
    }
    let w = generate_window(signal.len(), window)?;
    Ok(signal.iter().zip(&w).map(|((re, im), w)| (re * w, im * w)).collect())
}

// ── Correlation kernels ───────────────────────────────────────────────────────

/// Full cross-correlation, length n1 + n2 - 1:
///   r[k] = sum_n x[n] * y[n + k - (n1 - 1)]
/// For equal-length inputs the zero-lag term sits at index n1 - 1; a peak
/// above it means y lags x (the emission reached y later).
fn direct_cross_correlation(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n1 = x.len() as isize;
    let n2 = y.len() as isize;
    let out_len = (n1 + n2 - 1) as usize;
    let mut r = vec![0.0; out_len];
    for (k, rk) in r.iter_mut().enumerate() {
        let shift = k as isize - (n1 - 1);
        let mut acc = 0.0;
        for n in 0..n1 {
            let idx = n + shift;
            if idx >= 0 && idx < n2 {
                acc += x[n as usize] * y[idx as usize];
            }
        }
        *rk = acc;
    }
    r
}

/// Complex form: r[k] = Re(sum_n x[n] * conj(y[n + k - (n1 - 1)])).
fn direct_cross_correlation_complex(x: &[(f64, f64)], y: &[(f64, f64)]) -> Vec<f64> {
    let n1 = x.len() as isize;
    let n2 = y.len() as isize;
    let out_len = (n1 + n2 - 1) as usize;
    let mut r = vec![0.0; out_len];
    for (k, rk) in r.iter_mut().enumerate() {
        let shift = k as isize - (n1 - 1);
        let mut acc = 0.0;
        for n in 0..n1 {
            let idx = n + shift;
            if idx >= 0 && idx < n2 {
                let (xr, xi) = x[n as usize];
                let (yr, yi) = y[idx as usize];
                // x * conj(y), real part
                acc += xr * yr + xi * yi;
            }
        }
        *rk = acc;
    }
    r
}

fn normalize(mut r: Vec<f64>) -> Vec<f64> {
    let max_abs = r.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if max_abs > 1e-10 {
        for v in &mut r {
            *v /= max_abs;
        }
    }
    r
}

// ── Public entry points ───────────────────────────────────────────────────────

/// Cross-correlate two real sequences.
pub fn cross_correlate(x: &[f64], y: &[f64], config: &CorrelationConfig) -> Result<CorrelationResult> {
    if x.is_empty() || y.is_empty() {
        return Err(PipelineError::Precondition("input signals cannot be empty".into()));
    }
    let xw = apply_window(x, config.window)?;
    let yw = apply_window(y, config.window)?;
    let mut r = direct_cross_correlation(&xw, &yw);
    if config.normalize_output {
        r = normalize(r);
    }
    finish(r, config)
}

/// Cross-correlate two complex sequences (interleaved (re, im) pairs).
pub fn cross_correlate_complex(
    x: &[(f64, f64)],
    y: &[(f64, f64)],
    config: &CorrelationConfig,
) -> Result<CorrelationResult> {
    if x.is_empty() || y.is_empty() {
        return Err(PipelineError::Precondition("input signals cannot be empty".into()));
    }
    let xw = apply_window_complex(x, config.window)?;
    let yw = apply_window_complex(y, config.window)?;
    let mut r = direct_cross_correlation_complex(&xw, &yw);
    if config.normalize_output {
        r = normalize(r);
    }
    finish(r, config)
}

fn finish(r: Vec<f64>, config: &CorrelationConfig) -> Result<CorrelationResult> {
    let peaks = find_peaks(&r, config.peak_threshold, config.max_peaks, config.interpolation);
    let max_peak_confidence = peaks.iter().fold(0.0f64, |m, p| m.max(p.confidence));
    Ok(CorrelationResult { correlation: r, peaks, sample_rate: config.sample_rate, max_peak_confidence })
}

// ── Delay conversions ─────────────────────────────────────────────────────────

pub fn samples_to_seconds(delay_samples: f64, sample_rate: f64) -> f64 {
    if sample_rate > 0.0 {
        delay_samples / sample_rate
    } else {
        0.0
    }
}

pub fn seconds_to_samples(delay_seconds: f64, sample_rate: f64) -> f64 {
    delay_seconds * sample_rate
}

// ── Peak detection ────────────────────────────────────────────────────────────

/// Scan for local extrema above the relative threshold, keep the strongest
/// `max_peaks`, and refine each with the configured interpolator. The returned
/// peaks are sorted by descending confidence.
pub fn find_peaks(
    correlation: &[f64],
    peak_threshold: f64,
    max_peaks: usize,
    interpolation: InterpolationType,
) -> Vec<CorrelationPeak> {
    let n = correlation.len();
    if n <= 2 || max_peaks == 0 {
        return Vec::new();
    }

    let max_abs = correlation.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let abs_threshold = max_abs * peak_threshold;

    let mut candidates: Vec<(usize, f64)> = Vec::new();
    for i in 1..n - 1 {
        let prev = correlation[i - 1];
        let val = correlation[i];
        let next = correlation[i + 1];
        let local_max = val > prev && val > next;
        let local_min = val < prev && val < next;
        if (local_max || local_min) && val.abs() >= abs_threshold {
            candidates.push((i, val.abs()));
        }
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(max_peaks);

    let mut peaks: Vec<CorrelationPeak> = candidates
        .iter()
        .map(|&(idx, _)| {
            let mut peak = interpolate_peak(correlation, idx, interpolation);
            // The interpolated coefficient keeps the sign of the extremum.
            peak.coefficient = if correlation[idx] < 0.0 {
                -peak.coefficient.abs()
            } else {
                peak.coefficient.abs()
            };
            peak
        })
        .collect();

    peaks.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    peaks
}

/// Refine an integer peak location with the selected interpolator and attach
/// SNR + confidence.
pub fn interpolate_peak(
    correlation: &[f64],
    peak_index: usize,
    interpolation: InterpolationType,
) -> CorrelationPeak {
    let n = correlation.len();

    // No neighbours at the edges; return the raw sample.
    if peak_index == 0 || peak_index + 1 >= n {
        let snr = estimate_peak_snr(correlation, peak_index, 20);
        let mut peak = CorrelationPeak {
            delay: peak_index as f64,
            coefficient: correlation[peak_index],
            snr,
            confidence: 0.0,
        };
        peak.confidence = peak_confidence(&peak, correlation);
        return peak;
    }

    let y_prev = correlation[peak_index - 1];
    let y_peak = correlation[peak_index];
    let y_next = correlation[peak_index + 1];

    let (delay, coefficient) = match interpolation {
        InterpolationType::None => (peak_index as f64, y_peak),
        InterpolationType::Parabolic => parabolic(peak_index, y_prev, y_peak, y_next),
        InterpolationType::Cubic => cubic(correlation, peak_index),
        InterpolationType::Gaussian => gaussian(peak_index, y_prev, y_peak, y_next),
        InterpolationType::Sinc => sinc_refine(correlation, peak_index),
    };

    let snr = estimate_peak_snr(correlation, peak_index, 20);
    let mut peak = CorrelationPeak { delay, coefficient, snr, confidence: 0.0 };
    peak.confidence = peak_confidence(&peak, correlation);
    peak
}

/// Fit a parabola through the three points around the peak; the extremum is at
/// -b / 2a.
fn parabolic(peak_index: usize, y_prev: f64, y_peak: f64, y_next: f64) -> (f64, f64) {
    let a = 0.5 * (y_prev + y_next) - y_peak;
    if a.abs() <= 1e-10 {
        // Flat top: no refinement possible
        return (peak_index as f64, y_peak);
    }
    let b = 0.5 * (y_next - y_prev);
    let offset = -b / (2.0 * a);
    let refined = y_peak + b * offset + a * offset * offset;
    (peak_index as f64 + offset, refined)
}

/// Five-point cubic fit; takes the derivative root closest to the peak,
/// falling back to parabolic near the edges or for distant roots.
fn cubic(correlation: &[f64], peak_index: usize) -> (f64, f64) {
    let n = correlation.len();
    if peak_index < 2 || peak_index + 2 >= n {
        let (y_prev, y_peak, y_next) =
            (correlation[peak_index - 1], correlation[peak_index], correlation[peak_index + 1]);
        return parabolic(peak_index, y_prev, y_peak, y_next);
    }
    let y_prev2 = correlation[peak_index - 2];
    let y_prev = correlation[peak_index - 1];
    let y_peak = correlation[peak_index];
    let y_next = correlation[peak_index + 1];
    let y_next2 = correlation[peak_index + 2];

    let a = (y_next2 - 4.0 * y_next + 6.0 * y_peak - 4.0 * y_prev + y_prev2) / 24.0;
    let b = (y_next - 2.0 * y_peak + y_prev) / 2.0;
    let c = (y_next - y_prev) / 2.0;

    if a.abs() <= 1e-10 {
        return parabolic(peak_index, y_prev, y_peak, y_next);
    }
    let discriminant = b * b - 3.0 * a * c;
    if discriminant < 0.0 {
        return parabolic(peak_index, y_prev, y_peak, y_next);
    }
    let root1 = (-b + discriminant.sqrt()) / (3.0 * a);
    let root2 = (-b - discriminant.sqrt()) / (3.0 * a);
    let offset = if root1.abs() < root2.abs() { root1 } else { root2 };

    if offset.abs() > 1.5 {
        return parabolic(peak_index, y_prev, y_peak, y_next);
    }
    let refined = y_peak + c * offset + b * offset * offset + a * offset * offset * offset;
    (peak_index as f64 + offset, refined)
}

/// Parabolic interpolation in log space: exact for Gaussian-shaped peaks.
fn gaussian(peak_index: usize, y_prev: f64, y_peak: f64, y_next: f64) -> (f64, f64) {
    let log_prev = y_prev.abs().max(1e-10).ln();
    let log_peak = y_peak.abs().max(1e-10).ln();
    let log_next = y_next.abs().max(1e-10).ln();

    let denominator = 2.0 * log_prev - 4.0 * log_peak + 2.0 * log_next;
    if denominator.abs() <= 1e-10 {
        return (peak_index as f64, y_peak);
    }
    let delta = (log_prev - log_next) / denominator;
    let sigma2 = -1.0 / (log_prev - 2.0 * log_peak + log_next);
    let refined = y_peak * (-(delta * delta) / (2.0 * sigma2)).exp();
    (peak_index as f64 + delta, refined)
}

/// Newton iteration on the 5-point sinc interpolant (damping 0.1, up to 5
/// steps, 1e-5 convergence). Falls back to parabolic near the sequence edges.
fn sinc_refine(correlation: &[f64], peak_index: usize) -> (f64, f64) {
    let n = correlation.len();
    if peak_index < 2 || peak_index + 2 >= n {
        let (y_prev, y_peak, y_next) =
            (correlation[peak_index - 1], correlation[peak_index], correlation[peak_index + 1]);
        return parabolic(peak_index, y_prev, y_peak, y_next);
    }
    let base = peak_index as f64;
    let samples: Vec<(f64, f64)> = (0..5)
        .map(|i| (base - 2.0 + i as f64, correlation[peak_index - 2 + i]))
        .collect();

    let evaluate = |x: f64| -> (f64, f64, f64) {
        let pi = std::f64::consts::PI;
        let mut y = 0.0;
        let mut dy = 0.0;
        let mut d2y = 0.0;
        for &(xi, yi) in &samples {
            let dx = x - xi;
            if dx.abs() < 1e-10 {
                y += yi;
                d2y += yi * (-pi * pi / 3.0);
            } else {
                let pi_dx = pi * dx;
                let sin = pi_dx.sin();
                let cos = pi_dx.cos();
                y += yi * sin / pi_dx;
                dy += yi * (cos / dx - sin / (pi_dx * dx));
                d2y += yi * (-pi * sin / dx - 2.0 * cos / (dx * dx) + 2.0 * sin / (pi * dx * dx * dx));
            }
        }
        (y, dy, d2y)
    };

    // Damped Newton on the interpolant's derivative root.
    let mut x = base;
    for _ in 0..5 {
        let (_, dy, d2y) = evaluate(x);
        if dy.abs() <= 1e-10 || d2y.abs() <= 1e-10 {
            break;
        }
        let step = 0.1 * (-dy / d2y);
        x += step;
        if step.abs() < 1e-5 {
            break;
        }
    }

    if (x - base).abs() > 1.5 {
        let (y_prev, y_peak, y_next) =
            (correlation[peak_index - 1], correlation[peak_index], correlation[peak_index + 1]);
        return parabolic(peak_index, y_prev, y_peak, y_next);
    }
    let (y, _, _) = evaluate(x);
    (x, y)
}

// ── SNR and confidence ────────────────────────────────────────────────────────

/// Linear SNR: |peak| over the standard deviation of |r| outside a
/// ±`exclusion` window around the peak. Expands to the whole sequence (minus
/// the peak) when fewer than ten noise samples remain.
pub fn estimate_peak_snr(correlation: &[f64], peak_index: usize, exclusion: usize) -> f64 {
    let n = correlation.len();
    if peak_index >= n {
        return 0.0;
    }
    let peak_value = correlation[peak_index];

    let mut noise: Vec<f64> = correlation
        .iter()
        .enumerate()
        .filter(|(i, _)| *i + exclusion < peak_index || *i > peak_index + exclusion)
        .map(|(_, v)| v.abs())
        .collect();
    if noise.len() < 10 {
        noise = correlation
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != peak_index)
            .map(|(_, v)| v.abs())
            .collect();
    }
    if noise.is_empty() {
        return 0.0;
    }

    let mean = noise.iter().sum::<f64>() / noise.len() as f64;
    let std = if noise.len() > 1 {
        (noise.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (noise.len() - 1) as f64).sqrt()
    } else {
        0.0
    };
    peak_value.abs() / std.max(1e-10)
}

/// Confidence = 0.6 * min(SNR / 10, 1) + 0.4 * sharpness, where sharpness is
/// the normalized second difference at the peak.
fn peak_confidence(peak: &CorrelationPeak, correlation: &[f64]) -> f64 {
    let n = correlation.len();
    let idx = peak.delay.round();
    if idx < 0.0 || idx >= n as f64 {
        return 0.0;
    }
    let idx = idx as usize;

    let sharpness = if idx > 0 && idx + 1 < n {
        let second_diff =
            (correlation[idx - 1] - 2.0 * correlation[idx] + correlation[idx + 1]).abs();
        // 4.0 is the theoretical maximum for a normalized sequence
        (second_diff / 4.0).min(1.0)
    } else {
        0.0
    };

    let snr_factor = (peak.snr / 10.0).min(1.0);
    (0.6 * snr_factor + 0.4 * sharpness).clamp(0.0, 1.0)
}

// ── Segmented correlator ──────────────────────────────────────────────────────

/// Streaming correlator for continuous signals. Each call correlates
/// [previous segment | current minus overlap] on both sides, so energy that
/// straddles a segment boundary is not lost. Single-threaded by construction;
/// the extractor owns one per receiver pair.
pub struct SegmentedCorrelator {
    config: CorrelationConfig,
    segment_size: usize,
    overlap_factor: f64,
    prev_x: Vec<f64>,
    prev_y: Vec<f64>,
    prev_cx: Vec<(f64, f64)>,
    prev_cy: Vec<(f64, f64)>,
}

impl SegmentedCorrelator {
    pub fn new(config: CorrelationConfig, segment_size: usize, overlap_factor: f64) -> Result<Self> {
        if segment_size == 0 {
            return Err(PipelineError::Configuration("segment size must be positive".into()));
        }
        if !(0.0..1.0).contains(&overlap_factor) {
            return Err(PipelineError::Configuration(format!(
                "overlap factor must be in [0, 1), got {overlap_factor}"
            )));
        }
        Ok(Self {
            config,
            segment_size,
            overlap_factor,
            prev_x: Vec::new(),
            prev_y: Vec::new(),
            prev_cx: Vec::new(),
            prev_cy: Vec::new(),
        })
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: CorrelationConfig) {
        self.config = config;
    }

    /// Process one real segment pair.
    pub fn process_segment(&mut self, x: &[f64], y: &[f64]) -> Result<CorrelationResult> {
        let result = if self.prev_x.is_empty() || self.prev_y.is_empty() {
            cross_correlate(x, y, &self.config)?
        } else {
            let overlap = ((self.segment_size as f64) * self.overlap_factor) as usize;
            let overlap = overlap.min(x.len()).min(y.len());
            let cx: Vec<f64> = self.prev_x.iter().chain(&x[overlap..]).copied().collect();
            let cy: Vec<f64> = self.prev_y.iter().chain(&y[overlap..]).copied().collect();
            cross_correlate(&cx, &cy, &self.config)?
        };
        self.prev_x = x.to_vec();
        self.prev_y = y.to_vec();
        debug!(
            "segmented correlation: {} peaks, best confidence {:.3}",
            result.peaks.len(),
            result.max_peak_confidence
        );
        Ok(result)
    }

    /// Process one complex segment pair.
    pub fn process_segment_complex(
        &mut self,
        x: &[(f64, f64)],
        y: &[(f64, f64)],
    ) -> Result<CorrelationResult> {
        let result = if self.prev_cx.is_empty() || self.prev_cy.is_empty() {
            cross_correlate_complex(x, y, &self.config)?
        } else {
            let overlap = ((self.segment_size as f64) * self.overlap_factor) as usize;
            let overlap = overlap.min(x.len()).min(y.len());
            let cx: Vec<(f64, f64)> = self.prev_cx.iter().chain(&x[overlap..]).copied().collect();
            let cy: Vec<(f64, f64)> = self.prev_cy.iter().chain(&y[overlap..]).copied().collect();
            cross_correlate_complex(&cx, &cy, &self.config)?
        };
        self.prev_cx = x.to_vec();
        self.prev_cy = y.to_vec();
        Ok(result)
    }

    /// Drop retained segments; the next call starts a fresh stream.
    pub fn reset(&mut self) {
        self.prev_x.clear();
        self.prev_y.clear();
        self.prev_cx.clear();
        self.prev_cy.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn gaussian_pulse(len: usize, center: f64, width: f64) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let d = i as f64 - center;
                (-d * d / (2.0 * width * width)).exp()
            })
            .collect()
    }

    fn no_window_config() -> CorrelationConfig {
        CorrelationConfig {
            window: WindowType::None,
            normalize_output: true,
            sample_rate: 1.0e6,
            ..Default::default()
        }
    }

    #[test]
    fn window_coefficients_match_references() {
        // Endpoint and midpoint spot checks against the standard formulas
        let hamming = generate_window(11, WindowType::Hamming).unwrap();
        assert!((hamming[0] - 0.08).abs() < 1e-9);
        assert!((hamming[5] - 1.0).abs() < 1e-9);

        let hanning = generate_window(11, WindowType::Hanning).unwrap();
        assert!(hanning[0].abs() < 1e-12);
        assert!((hanning[5] - 1.0).abs() < 1e-9);

        let blackman = generate_window(11, WindowType::Blackman).unwrap();
        assert!(blackman[0].abs() < 1e-9);
        assert!((blackman[5] - 1.0).abs() < 1e-9);

        let rect = generate_window(7, WindowType::None).unwrap();
        assert!(rect.iter().all(|&v| v == 1.0));

        assert!(generate_window(0, WindowType::Hamming).is_err());
    }

    #[test]
    fn identical_signals_peak_at_zero_lag() {
        let x = gaussian_pulse(200, 100.0, 10.0);
        let result = cross_correlate(&x, &x, &no_window_config()).unwrap();
        assert_eq!(result.correlation.len(), 399);
        let best = result.best_peak().expect("autocorrelation must have a peak");
        assert!((best.delay - result.zero_lag()).abs() < 0.5, "delay {}", best.delay);
    }

    #[test]
    fn known_integer_delay_is_recovered() {
        let x = gaussian_pulse(400, 200.0, 15.0);
        let delay = 37usize;
        let mut y = vec![0.0; 400];
        for i in 0..400 - delay {
            y[i + delay] = x[i];
        }
        let result = cross_correlate(&x, &y, &no_window_config()).unwrap();
        let best = result.best_peak().unwrap();
        // y lags x by `delay`, so the peak sits `delay` samples above zero lag
        let measured = best.delay - result.zero_lag();
        assert!((measured - delay as f64).abs() < 0.5, "measured {measured}");
    }

    #[test]
    fn noisy_pulse_delay_within_half_sample() {
        // A 100-sample wideband burst at sample 500, delayed 42 samples, with
        // additive noise at 10 dB SNR; parabolic interpolation. A wideband
        // burst correlates to a sharp peak, which is what the confidence
        // metric rewards.
        let n = 1000;
        let delay = 42usize;
        let mut rng = StdRng::seed_from_u64(7);
        let burst = Normal::new(0.0, 1.0).unwrap();
        let mut x = vec![0.0; n];
        for v in x.iter_mut().take(550).skip(450) {
            *v = burst.sample(&mut rng);
        }
        let mut y = vec![0.0; n];
        for i in 0..n - delay {
            y[i + delay] = x[i];
        }
        // 10 dB SNR against the burst's unit power
        let sigma = (1.0f64 / 10.0f64).sqrt();
        let noise = Normal::new(0.0, sigma).unwrap();
        for v in &mut y {
            *v += noise.sample(&mut rng);
        }

        let config = CorrelationConfig {
            window: WindowType::None,
            interpolation: InterpolationType::Parabolic,
            normalize_output: true,
            sample_rate: 1.0e6,
            ..Default::default()
        };
        let result = cross_correlate(&x, &y, &config).unwrap();
        let best = result.best_peak().unwrap();
        let measured = best.delay - result.zero_lag();
        assert!(
            (measured - delay as f64).abs() < 0.5,
            "measured {measured}, expected {delay}"
        );
        assert!(best.confidence > 0.7, "confidence {}", best.confidence);
    }

    #[test]
    fn fractional_delay_resolved_sub_sample() {
        // A wide pulse sampled at a 0.3-sample offset: parabolic interpolation
        // should land well inside the sample.
        let n = 512;
        let x = gaussian_pulse(n, 256.0, 20.0);
        let y = gaussian_pulse(n, 256.3, 20.0);
        let result = cross_correlate(&x, &y, &no_window_config()).unwrap();
        let best = result.best_peak().unwrap();
        let measured = best.delay - result.zero_lag();
        assert!((measured - 0.3).abs() < 0.1, "measured {measured}");
    }

    #[test]
    fn interpolators_agree_on_smooth_peak() {
        let n = 512;
        let x = gaussian_pulse(n, 256.0, 12.0);
        let y = gaussian_pulse(n, 250.0, 12.0);
        let mut reference = None;
        for interp in [
            InterpolationType::Parabolic,
            InterpolationType::Cubic,
            InterpolationType::Gaussian,
            InterpolationType::Sinc,
        ] {
            let config = CorrelationConfig {
                window: WindowType::None,
                interpolation: interp,
                normalize_output: true,
                sample_rate: 1.0,
                ..Default::default()
            };
            let result = cross_correlate(&x, &y, &config).unwrap();
            let delay = result.best_peak().unwrap().delay;
            match reference {
                None => reference = Some(delay),
                Some(r) => {
                    assert!((delay - r).abs() < 0.6, "{interp:?} gave {delay} vs {r}")
                }
            }
        }
    }

    #[test]
    fn peak_confidences_in_unit_range_and_sorted() {
        let n = 600;
        let x = gaussian_pulse(n, 300.0, 8.0);
        let mut y = gaussian_pulse(n, 200.0, 8.0);
        // A second, weaker echo
        for (i, v) in gaussian_pulse(n, 420.0, 8.0).iter().enumerate() {
            y[i] += 0.7 * v;
        }
        let config = CorrelationConfig {
            window: WindowType::None,
            peak_threshold: 0.3,
            max_peaks: 5,
            normalize_output: true,
            sample_rate: 1.0,
            ..Default::default()
        };
        let result = cross_correlate(&x, &y, &config).unwrap();
        assert!(result.peaks.len() >= 2);
        for pair in result.peaks.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
        for peak in &result.peaks {
            assert!((0.0..=1.0).contains(&peak.confidence));
        }
    }

    #[test]
    fn empty_input_is_a_precondition_error() {
        let x: Vec<f64> = Vec::new();
        let y = vec![1.0, 2.0];
        assert!(cross_correlate(&x, &y, &no_window_config()).is_err());
    }

    #[test]
    fn complex_correlation_matches_real_for_real_inputs() {
        let x = gaussian_pulse(128, 64.0, 6.0);
        let y = gaussian_pulse(128, 70.0, 6.0);
        let cx: Vec<(f64, f64)> = x.iter().map(|&v| (v, 0.0)).collect();
        let cy: Vec<(f64, f64)> = y.iter().map(|&v| (v, 0.0)).collect();
        let rr = cross_correlate(&x, &y, &no_window_config()).unwrap();
        let rc = cross_correlate_complex(&cx, &cy, &no_window_config()).unwrap();
        for (a, b) in rr.correlation.iter().zip(&rc.correlation) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn segmented_correlator_validates_construction() {
        assert!(SegmentedCorrelator::new(CorrelationConfig::default(), 0, 0.5).is_err());
        assert!(SegmentedCorrelator::new(CorrelationConfig::default(), 64, 1.0).is_err());
        assert!(SegmentedCorrelator::new(CorrelationConfig::default(), 64, 0.0).is_ok());
    }

    #[test]
    fn segmented_correlator_retains_and_resets() {
        let mut sc = SegmentedCorrelator::new(no_window_config(), 64, 0.5).unwrap();
        let x = gaussian_pulse(64, 32.0, 4.0);
        let y = gaussian_pulse(64, 36.0, 4.0);

        // First call: plain correlation of one segment pair
        let first = sc.process_segment(&x, &y).unwrap();
        assert_eq!(first.correlation.len(), 64 + 64 - 1);

        // Second call: [prev | current - overlap] on both sides
        let second = sc.process_segment(&x, &y).unwrap();
        let combined = 64 + 64 - 32;
        assert_eq!(second.correlation.len(), combined + combined - 1);

        sc.reset();
        let third = sc.process_segment(&x, &y).unwrap();
        assert_eq!(third.correlation.len(), 64 + 64 - 1);
    }
}
