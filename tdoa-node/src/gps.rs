//! gps.rs — GPS receiver adapter interface
//!
//! The time base only needs fixes and PPS edges; everything device-specific
//! (gpsd sockets, u-blox binary, raw NMEA) lives behind this trait and is
//! provided by the deployment. A deterministic scripted device backs the
//! time-base tests.

use chrono::{DateTime, Utc};

use crate::error::{PipelineError, Result};

// ── Data types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsFixKind {
    NoFix,
    Fix2D,
    Fix3D,
}

/// Latest navigation solution from the receiver.
#[derive(Debug, Clone)]
pub struct GpsData {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// UTC time of the fix
    pub time: DateTime<Utc>,
    pub fix: GpsFixKind,
    pub hdop: f64,
    pub pdop: f64,
    pub vdop: f64,
    pub satellites: u32,
    /// Per-satellite SNR, dB-Hz
    pub satellite_snr: Vec<f64>,
}

impl GpsData {
    pub fn has_fix(&self) -> bool {
        self.fix != GpsFixKind::NoFix
    }

    /// Fix time as nanoseconds since the Unix epoch.
    pub fn time_ns(&self) -> u64 {
        self.time.timestamp_nanos_opt().unwrap_or(0).max(0) as u64
    }
}

/// Supported adapter backends, selected by a case-insensitive name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsDeviceKind {
    Gpsd,
    Ublox,
    Nmea,
}

impl GpsDeviceKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GPSD" => Ok(Self::Gpsd),
            "UBLOX" => Ok(Self::Ublox),
            "NMEA" => Ok(Self::Nmea),
            other => Err(PipelineError::Configuration(format!(
                "unknown GPS device type '{other}'"
            ))),
        }
    }
}

pub type DataCallback = Box<dyn Fn(&GpsData) + Send + Sync>;
pub type PpsCallback = Box<dyn Fn(u64) + Send + Sync>;

// ── Device trait ──────────────────────────────────────────────────────────────

/// Contract for a GPS receiver adapter. Implementations deliver navigation
/// data and PPS edge timestamps through the registered callbacks.
pub trait GpsDevice: Send {
    fn open(&mut self, path: &str) -> Result<()>;
    fn close(&mut self);

    /// Most recent navigation solution, if any was received.
    fn last_data(&self) -> Option<GpsData>;

    fn register_data_callback(&mut self, callback: DataCallback);
    fn register_pps_callback(&mut self, callback: PpsCallback);

    /// Select the hardware pin carrying the PPS edge, where applicable.
    fn set_pps_input_pin(&mut self, _pin: u32) -> Result<()> {
        Ok(())
    }

    /// Backend-specific key/value configuration.
    fn configure(&mut self, key: &str, value: &str) -> Result<()>;

    /// Fixed latency between the true PPS edge and its reported timestamp.
    fn pps_offset_ns(&self) -> f64 {
        0.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_parsing_is_case_insensitive() {
        assert_eq!(GpsDeviceKind::parse("gpsd").unwrap(), GpsDeviceKind::Gpsd);
        assert_eq!(GpsDeviceKind::parse("UBLOX").unwrap(), GpsDeviceKind::Ublox);
        assert_eq!(GpsDeviceKind::parse("Nmea").unwrap(), GpsDeviceKind::Nmea);
        assert!(GpsDeviceKind::parse("sirf").is_err());
    }
}
