//! # tdoa-types
//!
//! Shared data model for the TDOA geolocation pipeline.
//!
//! These types are used by:
//! - `tdoa-node`: the receiver-node service (time base, correlators, solver)
//! - the time-reference wire protocol (JSON payloads inside the binary frame)
//!
//! ## Conventions
//!
//! - Positions are Cartesian metres in a local ENU frame; the solver works in 2-D
//! - Time differences are signed seconds, positive when the non-reference
//!   receiver hears the emission later than the reference
//! - Nanosecond timestamps count from the Unix epoch
//! - Confidence values are always in [0, 1]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Synchronization status ────────────────────────────────────────────────────

/// Discipline state of a node's local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Unknown,
    /// Time base created but no reference seen yet
    Unsynchronized,
    /// GPS fix present, collecting PPS pulses
    Acquiring,
    /// Disciplined to the reference within tolerance
    Synchronized,
    /// Reference lost, coasting on the last drift estimate
    Holdover,
    /// Holdover budget expired or drift over threshold
    Error,
}

/// Where a node's time reference comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncSource {
    #[default]
    None,
    Gps,
    Ptp,
    Ntp,
    Manual,
    LocalOscillator,
}

// ── Time reference ────────────────────────────────────────────────────────────

/// A node's disciplined time estimate at one instant.
///
/// Exchanged between nodes over the time-reference protocol; always encoded
/// explicitly (JSON payload), never as raw struct bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeReference {
    /// Wall-clock timestamp at capture
    pub timestamp: DateTime<Utc>,
    /// Disciplined nanoseconds since the Unix epoch
    pub nanoseconds: u64,
    /// 1-sigma uncertainty of `nanoseconds`, in ns
    pub uncertainty_ns: f64,
    pub source: SyncSource,
    pub status: SyncStatus,
}

/// Per-node synchronization health, broadcast every status interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub sync_status: SyncStatus,
    pub primary_source: SyncSource,
    pub secondary_source: SyncSource,
    /// Current time uncertainty in nanoseconds
    pub uncertainty_ns: f64,
    /// Allan deviation at tau = 1 s (0 until enough samples)
    pub allan_deviation: f64,
    /// Clock drift estimate in parts per billion
    pub drift_rate_ppb: f64,
    /// GPS satellites in view (0 for non-GPS sources)
    pub satellite_count: u32,
    /// Nanosecond timestamp of the last update from this node
    pub last_update_ns: u64,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            sync_status: SyncStatus::Unknown,
            primary_source: SyncSource::None,
            secondary_source: SyncSource::None,
            uncertainty_ns: 1_000_000.0, // 1 ms until first discipline
            allan_deviation: 0.0,
            drift_rate_ppb: 0.0,
            satellite_count: 0,
            last_update_ns: 0,
        }
    }
}

// ── Signal sources (receivers) ────────────────────────────────────────────────

/// A receiver participating in the TDOA fix.
///
/// Positions are assumed static for the duration of a position fix.
/// Delay fields are in seconds and default to zero until calibrated.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalSource {
    pub id: String,
    /// East, metres
    pub x: f64,
    /// North, metres
    pub y: f64,
    /// Up, metres (unused by the 2-D solver, carried for calibration)
    pub z: f64,
    /// Known clock offset relative to the reference node, seconds
    pub clock_offset: f64,
    /// Clock drift, seconds per second
    pub clock_drift: f64,
    /// Cable delay, seconds
    pub cable_delay: f64,
    /// Antenna delay, seconds
    pub antenna_delay: f64,
}

impl SignalSource {
    pub fn at(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self { id: id.into(), x, y, ..Default::default() }
    }

    /// Euclidean 2-D distance to a point, metres.
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        ((self.x - x).powi(2) + (self.y - y).powi(2)).sqrt()
    }
}

// ── Time differences ──────────────────────────────────────────────────────────

/// One validated TDOA measurement between a reference receiver and a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeDifference {
    /// Reference receiver id
    pub reference_id: String,
    /// Non-reference receiver id
    pub source_id: String,
    /// Signed delay in seconds (positive: `source_id` hears the emission later)
    pub time_diff: f64,
    /// 1-sigma uncertainty in seconds
    pub uncertainty: f64,
    /// Confidence in [0, 1], derived from the correlation peak
    pub confidence: f64,
    /// Nanosecond timestamp of the underlying segment pair
    pub timestamp_ns: u64,
}

impl TimeDifference {
    pub fn new(
        reference_id: impl Into<String>,
        source_id: impl Into<String>,
        time_diff: f64,
        uncertainty: f64,
        confidence: f64,
        timestamp_ns: u64,
    ) -> Self {
        Self {
            reference_id: reference_id.into(),
            source_id: source_id.into(),
            time_diff,
            uncertainty,
            confidence,
            timestamp_ns,
        }
    }
}

/// All time differences extracted from one segment epoch, against one reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeDifferenceSet {
    pub differences: Vec<TimeDifference>,
    pub timestamp_ns: u64,
    pub reference_id: String,
}

impl TimeDifferenceSet {
    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn len(&self) -> usize {
        self.differences.len()
    }
}

// ── Position fix ──────────────────────────────────────────────────────────────

/// 2-D position estimate with per-axis uncertainty.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position2D {
    pub x: f64,
    pub y: f64,
    /// 1-sigma uncertainty along x, metres
    pub uncertainty_x: f64,
    /// 1-sigma uncertainty along y, metres
    pub uncertainty_y: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl Default for Position2D {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, uncertainty_x: 1000.0, uncertainty_y: 1000.0, confidence: 0.0 }
    }
}

/// Equi-probability contour of the position estimate at a confidence level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConfidenceEllipse {
    pub center_x: f64,
    pub center_y: f64,
    /// Semi-major axis, metres
    pub semi_major: f64,
    /// Semi-minor axis, metres
    pub semi_minor: f64,
    /// Rotation of the major axis from +x, radians
    pub rotation_rad: f64,
    /// Confidence level the axes were scaled for (e.g. 0.95)
    pub confidence_level: f64,
}

/// Dilution-of-precision record. All zero when the receiver geometry is
/// degenerate (collinear) or fewer than three receivers are known.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GdopInfo {
    pub gdop: f64,
    pub pdop: f64,
    pub hdop: f64,
    /// Always 0 in 2-D
    pub vdop: f64,
    pub tdop: f64,
}

impl GdopInfo {
    /// True when the geometry matrix was rank-deficient and no DOP could be
    /// computed.
    pub fn is_degenerate(&self) -> bool {
        self.gdop == 0.0
    }
}

/// Complete output of one multilateration solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionFix {
    pub position: Position2D,
    pub ellipse: ConfidenceEllipse,
    pub gdop: GdopInfo,
    /// Iterations taken by the iterative solver (0 for closed-form)
    pub iterations: u32,
    /// Norm of the final measurement residual, seconds
    pub residual_norm: f64,
    pub valid: bool,
    /// Human-readable reason when `valid` is false
    pub diagnostic: String,
}

impl PositionFix {
    pub fn invalid(diagnostic: impl Into<String>) -> Self {
        Self {
            position: Position2D::default(),
            ellipse: ConfidenceEllipse::default(),
            gdop: GdopInfo::default(),
            iterations: 0,
            residual_norm: 0.0,
            valid: false,
            diagnostic: diagnostic.into(),
        }
    }
}

// ── Task priority ─────────────────────────────────────────────────────────────

/// Scheduling priority for processing-fabric tasks and resource requests.
/// Ordering: `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] =
        [TaskPriority::Low, TaskPriority::Normal, TaskPriority::High, TaskPriority::Critical];
}

// ── Resource kinds ────────────────────────────────────────────────────────────

/// A schedulable resource tracked by the resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    /// CPU cores
    Cpu,
    /// Memory, MB
    Memory,
    /// GPU memory, MB
    Gpu,
    /// Network bandwidth, MB/s
    Network,
    /// Disk throughput, MB/s
    Disk,
    /// Application-defined resource
    Custom(String),
}

impl ResourceKind {
    /// Default unit string for display and status payloads.
    pub fn unit(&self) -> &str {
        match self {
            ResourceKind::Cpu => "cores",
            ResourceKind::Memory | ResourceKind::Gpu => "MB",
            ResourceKind::Network | ResourceKind::Disk => "MB/s",
            ResourceKind::Custom(_) => "units",
        }
    }
}

// ── Protocol message types ────────────────────────────────────────────────────

/// Wire message kinds for the time-reference protocol (`u8` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    TimeReference = 0,
    SyncRequest = 1,
    SyncResponse = 2,
    StatusUpdate = 3,
    StatusRequest = 4,
    StatusResponse = 5,
    ConsensusProposal = 6,
    ConsensusVote = 7,
    Alert = 8,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::TimeReference),
            1 => Some(Self::SyncRequest),
            2 => Some(Self::SyncResponse),
            3 => Some(Self::StatusUpdate),
            4 => Some(Self::StatusRequest),
            5 => Some(Self::StatusResponse),
            6 => Some(Self::ConsensusProposal),
            7 => Some(Self::ConsensusVote),
            8 => Some(Self::Alert),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_scheduling_rule() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn message_type_round_trips_through_u8() {
        for v in 0..=8u8 {
            let mt = MessageType::from_u8(v).unwrap();
            assert_eq!(mt as u8, v);
        }
        assert!(MessageType::from_u8(9).is_none());
    }

    #[test]
    fn signal_source_defaults_are_zero() {
        let s = SignalSource::at("rx-1", 100.0, -50.0);
        assert_eq!(s.clock_offset, 0.0);
        assert_eq!(s.clock_drift, 0.0);
        assert_eq!(s.cable_delay, 0.0);
        assert_eq!(s.antenna_delay, 0.0);
        assert!((s.distance_to(100.0, -50.0)).abs() < 1e-12);
    }

    #[test]
    fn node_status_serializes_as_screaming_snake() {
        let json = serde_json::to_string(&SyncStatus::Holdover).unwrap();
        assert_eq!(json, "\"HOLDOVER\"");
    }
}
