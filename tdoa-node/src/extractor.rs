//! extractor.rs — per-pair correlation → validated time differences
//!
//! Holds one segmented correlator per (reference, peer) receiver pair. Each
//! segment epoch is correlated against the reference, the best peak is
//! converted to seconds, corrected for known clock biases, and screened
//! against the pair's recent history before it is allowed into the output set.
//!
//! Accepted sets are pushed onto an event channel drained by the caller, so
//! no user code ever runs under the extractor's lock.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use tdoa_types::{SignalSource, TimeDifference, TimeDifferenceSet};

use crate::correlation::{samples_to_seconds, CorrelationConfig, SegmentedCorrelator};
use crate::error::{PipelineError, Result};

// ── Configuration ─────────────────────────────────────────────────────────────

/// How receiver-pair delay biases are removed from raw correlation delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockCorrectionMethod {
    /// Use the raw correlation delay
    None,
    /// Subtract cable + antenna + static clock offset
    Offset,
    /// Offset plus drift integrated over the measurement timestamp
    #[default]
    Linear,
    /// Same correction as Linear; the Kalman discipline runs upstream in the
    /// time base, so the per-source terms here are already filtered values
    Kalman,
}

/// Calibration strategy carried in configuration. Manual calibration feeds
/// known offsets through the source setters; automatic modes are not
/// implemented and fail loudly when started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalibrationMode {
    #[default]
    None,
    Manual,
    Automatic,
    Continuous,
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub correlation: CorrelationConfig,
    pub calibration_mode: CalibrationMode,
    pub clock_correction: ClockCorrectionMethod,
    /// Peaks below this confidence are discarded
    pub detection_threshold: f64,
    /// Z-score above which a measurement is rejected as an outlier
    pub outlier_threshold: f64,
    /// Bounded per-pair history length
    pub history_size: usize,
    pub enable_statistical_validation: bool,
    /// Segment size handed to each pair's segmented correlator
    pub segment_size: usize,
    /// Overlap factor for the segmented correlators, [0, 1)
    pub overlap_factor: f64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            correlation: CorrelationConfig::default(),
            calibration_mode: CalibrationMode::None,
            clock_correction: ClockCorrectionMethod::Linear,
            detection_threshold: 0.5,
            outlier_threshold: 3.0,
            history_size: 100,
            enable_statistical_validation: true,
            segment_size: 1024,
            overlap_factor: 0.5,
        }
    }
}

// ── Extractor ─────────────────────────────────────────────────────────────────

struct ExtractorInner {
    config: ExtractorConfig,
    sources: HashMap<String, SignalSource>,
    reference_id: String,
    correlators: HashMap<String, SegmentedCorrelator>,
    history: HashMap<String, Vec<TimeDifference>>,
    rejected_outliers: u64,
}

/// Converts per-segment correlations into validated time-difference sets
/// relative to a designated reference receiver. Safe for concurrent calls.
pub struct TimeDifferenceExtractor {
    inner: Mutex<ExtractorInner>,
    events_tx: Sender<TimeDifferenceSet>,
}

impl TimeDifferenceExtractor {
    /// Returns the extractor plus the receiver for accepted sets.
    pub fn new(config: ExtractorConfig) -> (Self, Receiver<TimeDifferenceSet>) {
        let (events_tx, events_rx) = channel();
        (
            Self {
                inner: Mutex::new(ExtractorInner {
                    config,
                    sources: HashMap::new(),
                    reference_id: String::new(),
                    correlators: HashMap::new(),
                    history: HashMap::new(),
                    rejected_outliers: 0,
                }),
                events_tx,
            },
            events_rx,
        )
    }

    // ── Source management ─────────────────────────────────────────────────────

    /// Add a receiver. The first added receiver becomes the reference.
    pub fn add_source(&self, source: SignalSource) -> Result<()> {
        if source.id.is_empty() {
            return Err(PipelineError::Precondition("source id must not be empty".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        let id = source.id.clone();
        inner.sources.insert(id.clone(), source);
        if inner.reference_id.is_empty() {
            debug!("'{id}' designated as reference source");
            inner.reference_id = id;
        } else if id != inner.reference_id {
            let key = pair_key(&inner.reference_id, &id);
            ensure_pair(&mut inner, &key)?;
        }
        Ok(())
    }

    /// Remove a receiver and all correlators/history mentioning it. Removing
    /// the reference promotes an arbitrary remaining receiver.
    pub fn remove_source(&self, source_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sources.remove(source_id).is_none() {
            return Err(PipelineError::Precondition(format!("source '{source_id}' not found")));
        }
        let gone: Vec<String> = inner
            .correlators
            .keys()
            .filter(|k| k.split('\u{1f}').any(|part| part == source_id))
            .cloned()
            .collect();
        for key in gone {
            inner.correlators.remove(&key);
            inner.history.remove(&key);
        }
        if inner.reference_id == source_id {
            inner.reference_id = inner.sources.keys().next().cloned().unwrap_or_default();
            if !inner.reference_id.is_empty() {
                let new_ref = inner.reference_id.clone();
                debug!("reference removed, promoting '{new_ref}'");
                rebuild_pairs(&mut inner)?;
            }
        }
        Ok(())
    }

    pub fn source(&self, source_id: &str) -> Option<SignalSource> {
        self.inner.lock().unwrap().sources.get(source_id).cloned()
    }

    pub fn sources(&self) -> HashMap<String, SignalSource> {
        self.inner.lock().unwrap().sources.clone()
    }

    pub fn reference_source(&self) -> String {
        self.inner.lock().unwrap().reference_id.clone()
    }

    /// Designate a new reference: all correlators are recreated and per-pair
    /// history is flushed.
    pub fn set_reference_source(&self, source_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sources.contains_key(source_id) {
            return Err(PipelineError::Precondition(format!("source '{source_id}' not found")));
        }
        inner.reference_id = source_id.to_string();
        rebuild_pairs(&mut inner)
    }

    // ── Per-source calibration setters ────────────────────────────────────────

    pub fn set_cable_delay(&self, source_id: &str, delay_s: f64) -> Result<()> {
        self.update_source(source_id, |s| s.cable_delay = delay_s)
    }

    pub fn set_antenna_delay(&self, source_id: &str, delay_s: f64) -> Result<()> {
        self.update_source(source_id, |s| s.antenna_delay = delay_s)
    }

    pub fn set_clock_offset(&self, source_id: &str, offset_s: f64) -> Result<()> {
        self.update_source(source_id, |s| s.clock_offset = offset_s)
    }

    pub fn set_clock_drift(&self, source_id: &str, drift: f64) -> Result<()> {
        self.update_source(source_id, |s| s.clock_drift = drift)
    }

    fn update_source(&self, source_id: &str, apply: impl FnOnce(&mut SignalSource)) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let source = inner
            .sources
            .get_mut(source_id)
            .ok_or_else(|| PipelineError::Precondition(format!("source '{source_id}' not found")))?;
        apply(source);
        Ok(())
    }

    /// Automatic calibration is not implemented; callers get a loud error
    /// instead of a silent no-op.
    pub fn start_automatic_calibration(&self, _sources: &[String], _duration_s: f64) -> Result<()> {
        Err(PipelineError::Configuration(
            "automatic calibration is not implemented; use the per-source delay setters".into(),
        ))
    }

    // ── Processing ────────────────────────────────────────────────────────────

    /// Correlate every non-reference segment against the reference segment and
    /// return the validated set. `segments` maps source id → real samples.
    pub fn process_segments(
        &self,
        segments: &HashMap<String, Vec<f64>>,
        timestamp_ns: u64,
    ) -> Result<TimeDifferenceSet> {
        self.process_impl(segments, timestamp_ns, |correlator, reference, segment| {
            correlator.process_segment(reference, segment)
        })
    }

    /// Complex-segment variant; samples are (re, im) pairs.
    pub fn process_segments_complex(
        &self,
        segments: &HashMap<String, Vec<(f64, f64)>>,
        timestamp_ns: u64,
    ) -> Result<TimeDifferenceSet> {
        self.process_impl(segments, timestamp_ns, |correlator, reference, segment| {
            correlator.process_segment_complex(reference, segment)
        })
    }

    fn process_impl<T>(
        &self,
        segments: &HashMap<String, Vec<T>>,
        timestamp_ns: u64,
        mut correlate: impl FnMut(
            &mut SegmentedCorrelator,
            &[T],
            &[T],
        ) -> Result<crate::correlation::CorrelationResult>,
    ) -> Result<TimeDifferenceSet> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reference_id.is_empty() {
            return Err(PipelineError::Precondition("no reference source designated".into()));
        }
        let reference_id = inner.reference_id.clone();
        let reference_segment = match segments.get(&reference_id) {
            Some(s) => s,
            None => {
                return Err(PipelineError::Precondition(format!(
                    "no segment for reference source '{reference_id}'"
                )))
            }
        };

        let mut result = TimeDifferenceSet {
            differences: Vec::new(),
            timestamp_ns,
            reference_id: reference_id.clone(),
        };

        let mut ordered: Vec<&String> = segments.keys().collect();
        ordered.sort();
        for source_id in ordered {
            if *source_id == reference_id {
                continue;
            }
            let segment = &segments[source_id];
            let source = match inner.sources.get(source_id) {
                Some(s) => s.clone(),
                None => {
                    trace!("segment from unknown source '{source_id}' ignored");
                    continue;
                }
            };

            let key = pair_key(&reference_id, source_id);
            ensure_pair(&mut inner, &key)?;
            let config = inner.config.clone();
            let correlator = inner.correlators.get_mut(&key).expect("ensured above");
            let correlation = correlate(correlator, reference_segment, segment)?;

            let best = match correlation.best_peak() {
                Some(p) => *p,
                None => continue,
            };
            if best.confidence < config.detection_threshold {
                trace!(
                    "pair {key}: best peak confidence {:.3} below threshold {:.3}",
                    best.confidence,
                    config.detection_threshold
                );
                continue;
            }

            // Raw delay relative to the lag-window zero point.
            let fs = config.correlation.sample_rate;
            let zero_lag = (correlation.correlation.len() as f64 - 1.0) / 2.0;
            let mut time_diff = samples_to_seconds(best.delay - zero_lag, fs);
            time_diff = apply_clock_correction(&config, time_diff, &source, timestamp_ns);

            let uncertainty = (1.0 - best.confidence) * 1.0e-6;
            let diff = TimeDifference::new(
                reference_id.clone(),
                source_id.clone(),
                time_diff,
                uncertainty,
                best.confidence,
                timestamp_ns,
            );

            // Validate against this pair's recent history before accepting.
            let history = inner.history.entry(key.clone()).or_default();
            if config.enable_statistical_validation
                && history.len() >= 3
                && !validate_measurement(&diff, history, config.outlier_threshold)
            {
                warn!(
                    "pair {key}: rejected outlier dt={:.3e}s at confidence {:.2}",
                    diff.time_diff, diff.confidence
                );
                inner.rejected_outliers += 1;
                continue;
            }

            history.push(diff.clone());
            let excess = history.len().saturating_sub(config.history_size);
            if excess > 0 {
                history.drain(0..excess);
            }
            result.differences.push(diff);
        }
        drop(inner);

        if !result.differences.is_empty() {
            // Receiver may be gone when the pipeline is shutting down.
            let _ = self.events_tx.send(result.clone());
        }
        Ok(result)
    }

    /// Latest accepted measurement for every pair.
    pub fn recent_differences(&self) -> Vec<TimeDifference> {
        let inner = self.inner.lock().unwrap();
        inner.history.values().filter_map(|h| h.last().cloned()).collect()
    }

    pub fn rejected_outliers(&self) -> u64 {
        self.inner.lock().unwrap().rejected_outliers
    }

    pub fn config(&self) -> ExtractorConfig {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn set_config(&self, config: ExtractorConfig) {
        let mut inner = self.inner.lock().unwrap();
        inner.config = config.clone();
        for correlator in inner.correlators.values_mut() {
            correlator.set_config(config.correlation.clone());
        }
    }

    /// Reset all correlator retention and history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        for correlator in inner.correlators.values_mut() {
            correlator.reset();
        }
        inner.history.clear();
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Pair key with a separator that cannot appear in ids via config files.
fn pair_key(reference_id: &str, source_id: &str) -> String {
    format!("{reference_id}\u{1f}{source_id}")
}

fn ensure_pair(inner: &mut ExtractorInner, key: &str) -> Result<()> {
    if !inner.correlators.contains_key(key) {
        let correlator = SegmentedCorrelator::new(
            inner.config.correlation.clone(),
            inner.config.segment_size,
            inner.config.overlap_factor,
        )?;
        inner.correlators.insert(key.to_string(), correlator);
        inner.history.insert(key.to_string(), Vec::new());
    }
    Ok(())
}

fn rebuild_pairs(inner: &mut ExtractorInner) -> Result<()> {
    inner.correlators.clear();
    inner.history.clear();
    let reference_id = inner.reference_id.clone();
    let peer_ids: Vec<String> =
        inner.sources.keys().filter(|id| **id != reference_id).cloned().collect();
    for id in peer_ids {
        let key = pair_key(&reference_id, &id);
        ensure_pair(inner, &key)?;
    }
    Ok(())
}

fn apply_clock_correction(
    config: &ExtractorConfig,
    time_diff: f64,
    source: &SignalSource,
    timestamp_ns: u64,
) -> f64 {
    match config.clock_correction {
        ClockCorrectionMethod::None => time_diff,
        ClockCorrectionMethod::Offset => {
            time_diff - (source.cable_delay + source.antenna_delay + source.clock_offset)
        }
        ClockCorrectionMethod::Linear | ClockCorrectionMethod::Kalman => {
            let corrected =
                time_diff - (source.cable_delay + source.antenna_delay + source.clock_offset);
            corrected - source.clock_drift * (timestamp_ns as f64 * 1.0e-9)
        }
    }
}

/// Z-score screen over the last (up to) five accepted measurements, with the
/// deviation floored so near-static signals do not reject everything.
fn validate_measurement(
    diff: &TimeDifference,
    history: &[TimeDifference],
    outlier_threshold: f64,
) -> bool {
    let recent: Vec<f64> = history.iter().rev().take(5).map(|d| d.time_diff).collect();
    let mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let variance = recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / recent.len() as f64;
    let std = variance.sqrt().max(1.0e-9);
    let z = (diff.time_diff - mean).abs() / std;
    z <= outlier_threshold
}
