//! config.rs — node configuration
//!
//! TOML file parsed into typed sections with serde defaults, so a partial
//! file only overrides what it names. Environment variables cover the
//! deployment-specific ports.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Deserialize;

use crate::correlation::{CorrelationConfig, InterpolationType, WindowType};
use crate::engine::{BackpressurePolicy, EngineConfig};
use crate::error::{PipelineError, Result};
use crate::extractor::{CalibrationMode, ClockCorrectionMethod, ExtractorConfig};
use crate::protocol::ProtocolConfig;
use crate::solver::{RegionBounds, SolverConfig, SolverMethod};
use crate::time_base::TimeBaseConfig;
use crate::transport::TransportConfig;

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeBaseSection {
    pub max_holdover_s: f64,
    pub drift_threshold_ppb: f64,
    pub temperature_compensation: bool,
    pub temperature_coefficient: f64,
    pub antenna_delay_ns: f64,
    pub cable_delay_ns: f64,
    pub receiver_delay_ns: f64,
    /// Case-insensitive: GPSD, UBLOX or NMEA
    pub gps_device: String,
    pub gps_path: String,
}

impl Default for TimeBaseSection {
    fn default() -> Self {
        Self {
            max_holdover_s: 60.0,
            drift_threshold_ppb: 500.0,
            temperature_compensation: false,
            temperature_coefficient: -0.2,
            antenna_delay_ns: 0.0,
            cable_delay_ns: 0.0,
            receiver_delay_ns: 0.0,
            gps_device: "GPSD".to_string(),
            gps_path: "localhost:2947".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelationSection {
    pub window: WindowType,
    pub interpolation: InterpolationType,
    pub peak_threshold: f64,
    pub max_peaks: usize,
    pub normalize_output: bool,
    pub sample_rate: f64,
    pub min_snr: f64,
    pub segment_size: usize,
    pub overlap_factor: f64,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            window: WindowType::Hamming,
            interpolation: InterpolationType::Parabolic,
            peak_threshold: 0.5,
            max_peaks: 3,
            normalize_output: true,
            sample_rate: 1.0e6,
            min_snr: 3.0,
            segment_size: 1024,
            overlap_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractorSection {
    pub calibration_mode: CalibrationMode,
    pub clock_correction: ClockCorrectionMethod,
    pub detection_threshold: f64,
    pub outlier_threshold: f64,
    pub history_size: usize,
    pub enable_statistical_validation: bool,
}

impl Default for ExtractorSection {
    fn default() -> Self {
        Self {
            calibration_mode: CalibrationMode::None,
            clock_correction: ClockCorrectionMethod::Linear,
            detection_threshold: 0.5,
            outlier_threshold: 3.0,
            history_size: 100,
            enable_statistical_validation: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverSection {
    pub method: SolverMethod,
    pub speed_of_light: f64,
    pub convergence_threshold: f64,
    pub max_iterations: u32,
    pub confidence_level: f64,
    pub min_required_sources: usize,
    pub min_required_time_diffs: usize,
    pub region_min_x: Option<f64>,
    pub region_max_x: Option<f64>,
    pub region_min_y: Option<f64>,
    pub region_max_y: Option<f64>,
}

impl Default for SolverSection {
    fn default() -> Self {
        Self {
            method: SolverMethod::TaylorSeries,
            speed_of_light: 299_792_458.0,
            convergence_threshold: 1.0e-6,
            max_iterations: 20,
            confidence_level: 0.95,
            min_required_sources: 3,
            min_required_time_diffs: 2,
            region_min_x: None,
            region_max_x: None,
            region_min_y: None,
            region_max_y: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolSection {
    pub node_id: String,
    pub port: u16,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub multicast_ttl: u32,
    pub multicast_loopback: bool,
    pub reference_interval_s: f64,
    pub status_interval_s: f64,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            port: 0,
            multicast_group: Ipv4Addr::new(239, 255, 77, 77),
            multicast_port: 7777,
            multicast_ttl: 1,
            multicast_loopback: true,
            reference_interval_s: 1.0,
            status_interval_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    /// 0 = hardware concurrency
    pub workers: usize,
    pub max_queue_size: usize,
    /// One of: block, drop-oldest, drop-lowest-priority, drop-new, expand
    pub backpressure: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self { workers: 0, max_queue_size: 1000, backpressure: "block".to_string() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub time_base: TimeBaseSection,
    pub correlation: CorrelationSection,
    pub extractor: ExtractorSection,
    pub solver: SolverSection,
    pub protocol: ProtocolSection,
    pub engine: EngineSection,
}

impl NodeConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(text)
            .map_err(|e| PipelineError::Configuration(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.correlation.sample_rate <= 0.0 {
            return Err(PipelineError::Configuration(format!(
                "sample_rate must be positive, got {}",
                self.correlation.sample_rate
            )));
        }
        if !(0.0..1.0).contains(&self.correlation.overlap_factor) {
            return Err(PipelineError::Configuration(format!(
                "overlap_factor must be in [0, 1), got {}",
                self.correlation.overlap_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.extractor.detection_threshold) {
            return Err(PipelineError::Configuration(
                "detection_threshold must be in [0, 1]".into(),
            ));
        }
        self.backpressure_policy()?;
        Ok(())
    }

    pub fn backpressure_policy(&self) -> Result<BackpressurePolicy> {
        match self.engine.backpressure.as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "drop-oldest" => Ok(BackpressurePolicy::DropOldest),
            "drop-lowest-priority" => Ok(BackpressurePolicy::DropLowestPriority),
            "drop-new" => Ok(BackpressurePolicy::DropNew),
            "expand" => Ok(BackpressurePolicy::ExpandQueue),
            other => Err(PipelineError::Configuration(format!(
                "unknown backpressure policy '{other}'"
            ))),
        }
    }

    pub fn correlation_config(&self) -> CorrelationConfig {
        CorrelationConfig {
            window: self.correlation.window,
            interpolation: self.correlation.interpolation,
            peak_threshold: self.correlation.peak_threshold,
            max_peaks: self.correlation.max_peaks,
            normalize_output: self.correlation.normalize_output,
            sample_rate: self.correlation.sample_rate,
            min_snr: self.correlation.min_snr,
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            correlation: self.correlation_config(),
            calibration_mode: self.extractor.calibration_mode,
            clock_correction: self.extractor.clock_correction,
            detection_threshold: self.extractor.detection_threshold,
            outlier_threshold: self.extractor.outlier_threshold,
            history_size: self.extractor.history_size,
            enable_statistical_validation: self.extractor.enable_statistical_validation,
            segment_size: self.correlation.segment_size,
            overlap_factor: self.correlation.overlap_factor,
        }
    }

    pub fn solver_config(&self) -> SolverConfig {
        let region = match (
            self.solver.region_min_x,
            self.solver.region_max_x,
            self.solver.region_min_y,
            self.solver.region_max_y,
        ) {
            (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) => {
                Some(RegionBounds { min_x, max_x, min_y, max_y })
            }
            _ => None,
        };
        SolverConfig {
            method: self.solver.method,
            speed_of_light: self.solver.speed_of_light,
            convergence_threshold: self.solver.convergence_threshold,
            max_iterations: self.solver.max_iterations,
            confidence_level: self.solver.confidence_level,
            min_required_sources: self.solver.min_required_sources,
            min_required_time_diffs: self.solver.min_required_time_diffs,
            region,
        }
    }

    pub fn time_base_config(&self) -> TimeBaseConfig {
        TimeBaseConfig {
            max_holdover_s: self.time_base.max_holdover_s,
            drift_threshold_ppb: self.time_base.drift_threshold_ppb,
            temperature_compensation_enabled: self.time_base.temperature_compensation,
            temperature_coefficient: self.time_base.temperature_coefficient,
            antenna_delay_ns: self.time_base.antenna_delay_ns,
            cable_delay_ns: self.time_base.cable_delay_ns,
            receiver_delay_ns: self.time_base.receiver_delay_ns,
        }
    }

    /// Port knobs can also come from the environment for deployment
    /// overrides.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            local_port: std::env::var("TDOA_UDP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.protocol.port),
            multicast_group: self.protocol.multicast_group,
            multicast_port: self.protocol.multicast_port,
            multicast_ttl: self.protocol.multicast_ttl,
            multicast_loopback: self.protocol.multicast_loopback,
        }
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            reference_interval: Duration::from_secs_f64(self.protocol.reference_interval_s),
            status_interval: Duration::from_secs_f64(self.protocol.status_interval_s),
            ..Default::default()
        }
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            workers: self.engine.workers,
            max_queue_size: self.engine.max_queue_size,
            backpressure: self.backpressure_policy()?,
        })
    }
}
