//! signal.rs — typed I/Q sample buffer with metadata
//!
//! A `Signal` owns one contiguous sample buffer in one of four layouts and
//! carries the capture metadata every downstream stage needs: sample rate,
//! center frequency, bandwidth, timestamp, and source descriptor.
//!
//! Transform conventions:
//!   - deep transforms (`convert_to_format`, `clone_signal`) copy the buffer
//!   - shallow transforms (`slice`) copy only the selected range and record
//!     their provenance in the tag map

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

// ── Sample formats ────────────────────────────────────────────────────────────

/// Buffer layout of one complex sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SampleFormat {
    /// Interleaved f32 pairs, 8 bytes per sample
    ComplexFloat32,
    /// Interleaved i16 pairs, 4 bytes per sample
    ComplexInt16,
    /// Interleaved i8 pairs, 2 bytes per sample
    ComplexInt8,
    /// Opaque bytes; layout described by tags
    Raw,
}

impl SampleFormat {
    /// Bytes per complex sample; 1 for `Raw` (sample count == byte count).
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::ComplexFloat32 => 8,
            SampleFormat::ComplexInt16 => 4,
            SampleFormat::ComplexInt8 => 2,
            SampleFormat::Raw => 1,
        }
    }
}

/// Format-matched sample storage. Integer layouts keep their native width so
/// typed views are borrows, not decodes.
#[derive(Debug, Clone)]
enum Samples {
    F32(Vec<f32>),
    I16(Vec<i16>),
    I8(Vec<i8>),
    Raw(Vec<u8>),
}

impl Samples {
    fn zeroed(format: SampleFormat, sample_count: usize) -> Self {
        match format {
            SampleFormat::ComplexFloat32 => Samples::F32(vec![0.0; sample_count * 2]),
            SampleFormat::ComplexInt16 => Samples::I16(vec![0; sample_count * 2]),
            SampleFormat::ComplexInt8 => Samples::I8(vec![0; sample_count * 2]),
            SampleFormat::Raw => Samples::Raw(vec![0; sample_count]),
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Samples::F32(v) => v.len() * 4,
            Samples::I16(v) => v.len() * 2,
            Samples::I8(v) => v.len(),
            Samples::Raw(v) => v.len(),
        }
    }
}

// ── Source descriptor ─────────────────────────────────────────────────────────

/// Where a signal was captured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    pub device_type: String,
    pub device_id: String,
    pub location_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

// ── Signal ────────────────────────────────────────────────────────────────────

/// An owned chunk of I/Q data with capture metadata.
#[derive(Debug, Clone)]
pub struct Signal {
    format: SampleFormat,
    sample_count: usize,
    samples: Samples,

    pub sample_rate: f64,
    pub center_frequency: f64,
    pub bandwidth: f64,
    /// Capture time of the first sample, seconds since the Unix epoch
    pub timestamp: f64,
    pub source: SourceInfo,
    id: String,
    tags: HashMap<String, String>,
}

impl Signal {
    /// Allocate a zeroed buffer of `sample_count` samples.
    pub fn new(format: SampleFormat, sample_count: usize) -> Self {
        Self {
            format,
            sample_count,
            samples: Samples::zeroed(format, sample_count),
            sample_rate: 0.0,
            center_frequency: 0.0,
            bandwidth: 0.0,
            timestamp: 0.0,
            source: SourceInfo::default(),
            id: Uuid::new_v4().to_string(),
            tags: HashMap::new(),
        }
    }

    /// Wrap a copied byte range. The byte length must match
    /// `sample_count * bytes_per_sample` for the given format.
    pub fn from_bytes(data: &[u8], format: SampleFormat, sample_count: usize) -> Result<Self> {
        let expected = sample_count * format.bytes_per_sample();
        if data.len() != expected {
            return Err(PipelineError::Precondition(format!(
                "buffer is {} bytes, format {:?} with {} samples needs {}",
                data.len(),
                format,
                sample_count,
                expected
            )));
        }
        let mut s = Self::new(format, sample_count);
        match &mut s.samples {
            Samples::F32(v) => {
                for (dst, src) in v.iter_mut().zip(data.chunks_exact(4)) {
                    *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
                }
            }
            Samples::I16(v) => {
                for (dst, src) in v.iter_mut().zip(data.chunks_exact(2)) {
                    *dst = i16::from_le_bytes([src[0], src[1]]);
                }
            }
            Samples::I8(v) => {
                for (dst, src) in v.iter_mut().zip(data) {
                    *dst = *src as i8;
                }
            }
            Samples::Raw(v) => v.copy_from_slice(data),
        }
        Ok(s)
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn byte_len(&self) -> usize {
        self.samples.byte_len()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Raw little-endian bytes of the buffer. Integer and float layouts borrow
    /// via a plain cast; only big-endian hosts would need a copy here, and the
    /// deployment targets are little-endian.
    pub fn bytes(&self) -> &[u8] {
        match &self.samples {
            Samples::F32(v) => bytemuck::cast_slice(v),
            Samples::I16(v) => bytemuck::cast_slice(v),
            Samples::I8(v) => bytemuck::cast_slice(v),
            Samples::Raw(v) => v,
        }
    }

    /// Signal duration in seconds (0 when the sample rate is unset).
    pub fn duration(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.sample_count as f64 / self.sample_rate
        } else {
            0.0
        }
    }

    // ── Tags ──────────────────────────────────────────────────────────────────

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    // ── Typed views ───────────────────────────────────────────────────────────

    /// Interleaved (re, im) f32 view; `None` if the format does not match.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.samples {
            Samples::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.samples {
            Samples::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<&[i16]> {
        match &self.samples {
            Samples::I16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i16_mut(&mut self) -> Option<&mut [i16]> {
        match &mut self.samples {
            Samples::I16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match &self.samples {
            Samples::I8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i8_mut(&mut self) -> Option<&mut [i8]> {
        match &mut self.samples {
            Samples::I8(v) => Some(v),
            _ => None,
        }
    }

    /// One complex sample as an (re, im) f32 pair. Errors distinctly for a
    /// format mismatch vs an out-of-range index.
    pub fn sample_at(&self, index: usize) -> Result<(f32, f32)> {
        if index >= self.sample_count {
            return Err(PipelineError::Precondition(format!(
                "sample index {} out of range ({} samples)",
                index, self.sample_count
            )));
        }
        let view = self.as_f32().ok_or_else(|| {
            PipelineError::Precondition(format!(
                "sample_at requires ComplexFloat32, signal is {:?}",
                self.format
            ))
        })?;
        Ok((view[index * 2], view[index * 2 + 1]))
    }

    // ── Deep transforms ───────────────────────────────────────────────────────

    /// Re-encode samples into `target` format. All metadata is preserved and a
    /// fresh buffer is allocated. Float → int clamps to [-1, 1] and scales to
    /// the integer's full range; int → float divides back, preserving sign.
    pub fn convert_to_format(&self, target: SampleFormat) -> Result<Signal> {
        if self.format == SampleFormat::Raw || target == SampleFormat::Raw {
            return Err(PipelineError::Precondition(
                "cannot convert to or from the Raw layout".into(),
            ));
        }
        let mut out = Signal::new(target, self.sample_count);
        out.copy_metadata_from(self);
        if self.format == target {
            out.samples = self.samples.clone();
            return Ok(out);
        }

        // All conversions route through normalized f32 components.
        let components = self.normalized_components();
        match &mut out.samples {
            Samples::F32(v) => v.copy_from_slice(&components),
            Samples::I16(v) => {
                for (dst, c) in v.iter_mut().zip(&components) {
                    *dst = (c.clamp(-1.0, 1.0) * 32767.0) as i16;
                }
            }
            Samples::I8(v) => {
                for (dst, c) in v.iter_mut().zip(&components) {
                    *dst = (c.clamp(-1.0, 1.0) * 127.0) as i8;
                }
            }
            Samples::Raw(_) => unreachable!(),
        }
        Ok(out)
    }

    /// Deep copy with a fresh id; provenance recorded in `original_id`.
    pub fn clone_signal(&self) -> Signal {
        let mut out = self.clone();
        out.id = Uuid::new_v4().to_string();
        out.set_tag("original_id", self.id.clone());
        out
    }

    // ── Shallow transform ─────────────────────────────────────────────────────

    /// Copy out `count` samples starting at `start`. The slice's timestamp is
    /// advanced by `start / sample_rate` and its tags record the provenance.
    pub fn slice(&self, start: usize, count: usize) -> Result<Signal> {
        if start >= self.sample_count || start + count > self.sample_count {
            return Err(PipelineError::Precondition(format!(
                "slice [{start}, {start}+{count}) out of range ({} samples)",
                self.sample_count
            )));
        }
        let mut out = Signal::new(self.format, count);
        out.copy_metadata_from(self);
        match (&mut out.samples, &self.samples) {
            (Samples::F32(dst), Samples::F32(src)) => {
                dst.copy_from_slice(&src[start * 2..(start + count) * 2])
            }
            (Samples::I16(dst), Samples::I16(src)) => {
                dst.copy_from_slice(&src[start * 2..(start + count) * 2])
            }
            (Samples::I8(dst), Samples::I8(src)) => {
                dst.copy_from_slice(&src[start * 2..(start + count) * 2])
            }
            (Samples::Raw(dst), Samples::Raw(src)) => {
                dst.copy_from_slice(&src[start..start + count])
            }
            _ => unreachable!(),
        }

        if self.sample_rate > 0.0 {
            out.timestamp = self.timestamp + start as f64 / self.sample_rate;
        }
        out.id = format!("{}_slice_{}_{}", self.id, start, count);
        out.set_tag("slice_start", start.to_string());
        out.set_tag("slice_count", count.to_string());
        out.set_tag("original_id", self.id.clone());
        Ok(out)
    }

    /// Samples as f64 (re, im) pairs for the correlator, regardless of layout.
    /// `None` for the Raw layout.
    pub fn to_complex_f64(&self) -> Option<Vec<(f64, f64)>> {
        if self.format == SampleFormat::Raw {
            return None;
        }
        let components = self.normalized_components();
        Some(
            components
                .chunks_exact(2)
                .map(|c| (c[0] as f64, c[1] as f64))
                .collect(),
        )
    }

    fn copy_metadata_from(&mut self, src: &Signal) {
        self.sample_rate = src.sample_rate;
        self.center_frequency = src.center_frequency;
        self.bandwidth = src.bandwidth;
        self.timestamp = src.timestamp;
        self.source = src.source.clone();
        self.tags = src.tags.clone();
    }

    /// Interleaved f32 components; integer layouts scale back into [-1, 1].
    fn normalized_components(&self) -> Vec<f32> {
        match &self.samples {
            Samples::F32(v) => v.clone(),
            Samples::I16(v) => v.iter().map(|&s| s as f32 / 32767.0).collect(),
            Samples::I8(v) => v.iter().map(|&s| s as f32 / 127.0).collect(),
            Samples::Raw(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_signal(n: usize) -> Signal {
        let mut s = Signal::new(SampleFormat::ComplexFloat32, n);
        s.sample_rate = 1000.0;
        s.center_frequency = 100e6;
        s.bandwidth = 20e3;
        s.timestamp = 10.0;
        let view = s.as_f32_mut().unwrap();
        for i in 0..n {
            view[i * 2] = (i as f32 / n as f32) * 2.0 - 1.0;
            view[i * 2 + 1] = -((i as f32 / n as f32) * 2.0 - 1.0);
        }
        s
    }

    #[test]
    fn byte_size_matches_sample_count() {
        let s = Signal::new(SampleFormat::ComplexInt16, 64);
        assert_eq!(s.byte_len(), 64 * 4);
        assert_eq!(s.sample_count(), 64);
        assert_eq!(s.bytes().len(), 64 * 4);
    }

    #[test]
    fn from_bytes_rejects_size_mismatch() {
        let err = Signal::from_bytes(&[0u8; 10], SampleFormat::ComplexFloat32, 2);
        assert!(matches!(err, Err(PipelineError::Precondition(_))));
    }

    #[test]
    fn from_bytes_round_trips_raw_bytes() {
        let data: Vec<u8> = (0..32).collect();
        let s = Signal::from_bytes(&data, SampleFormat::ComplexInt16, 8).unwrap();
        assert_eq!(s.bytes(), &data[..]);
    }

    #[test]
    fn typed_view_requires_matching_format() {
        let s = Signal::new(SampleFormat::ComplexInt16, 8);
        assert!(s.as_f32().is_none());
        assert!(s.as_i16().is_some());
        assert!(s.as_i8().is_none());
    }

    #[test]
    fn conversion_preserves_count_and_metadata() {
        let s = ramp_signal(100);
        for target in [SampleFormat::ComplexInt16, SampleFormat::ComplexInt8] {
            let c = s.convert_to_format(target).unwrap();
            assert_eq!(c.sample_count(), s.sample_count());
            assert_eq!(c.sample_rate, s.sample_rate);
            assert_eq!(c.center_frequency, s.center_frequency);
            assert_eq!(c.bandwidth, s.bandwidth);
            assert_eq!(c.timestamp, s.timestamp);
        }
    }

    #[test]
    fn float_int_round_trip_stays_close() {
        let s = ramp_signal(50);
        let back = s
            .convert_to_format(SampleFormat::ComplexInt16)
            .unwrap()
            .convert_to_format(SampleFormat::ComplexFloat32)
            .unwrap();
        let a = s.as_f32().unwrap();
        let b = back.as_f32().unwrap();
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 2.0 / 32767.0, "{x} vs {y}");
        }
    }

    #[test]
    fn conversion_clamps_out_of_range_floats() {
        let mut s = Signal::new(SampleFormat::ComplexFloat32, 1);
        let view = s.as_f32_mut().unwrap();
        view[0] = 3.5;
        view[1] = -3.5;
        let c = s.convert_to_format(SampleFormat::ComplexInt16).unwrap();
        let v = c.as_i16().unwrap();
        assert_eq!(v[0], 32767);
        assert_eq!(v[1], -32767);
    }

    #[test]
    fn raw_layout_cannot_convert() {
        let s = Signal::new(SampleFormat::Raw, 16);
        assert!(s.convert_to_format(SampleFormat::ComplexFloat32).is_err());
        assert!(s.to_complex_f64().is_none());
    }

    #[test]
    fn slice_advances_timestamp_and_records_provenance() {
        let s = ramp_signal(1000);
        let sl = s.slice(250, 100).unwrap();
        assert_eq!(sl.sample_count(), 100);
        assert!((sl.timestamp - (10.0 + 0.25)).abs() < 1e-12);
        assert_eq!(sl.tag("slice_start"), Some("250"));
        assert_eq!(sl.tag("slice_count"), Some("100"));
        assert_eq!(sl.tag("original_id"), Some(s.id()));
        // Slice content matches the source range
        let a = s.as_f32().unwrap();
        let b = sl.as_f32().unwrap();
        assert_eq!(&a[500..700], b);
    }

    #[test]
    fn slice_out_of_range_fails() {
        let s = ramp_signal(10);
        assert!(s.slice(8, 5).is_err());
        assert!(s.slice(10, 1).is_err());
    }

    #[test]
    fn clone_gets_fresh_id() {
        let s = ramp_signal(10);
        let c = s.clone_signal();
        assert_ne!(s.id(), c.id());
        assert_eq!(c.tag("original_id"), Some(s.id()));
        assert_eq!(c.bytes(), s.bytes());
    }

    #[test]
    fn sample_at_distinguishes_failures() {
        let s = Signal::new(SampleFormat::ComplexInt8, 4);
        // Format mismatch
        assert!(s.sample_at(0).is_err());
        let f = Signal::new(SampleFormat::ComplexFloat32, 4);
        // Out of range
        assert!(f.sample_at(4).is_err());
        assert!(f.sample_at(3).is_ok());
    }
}
