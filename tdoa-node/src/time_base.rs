//! time_base.rs — GPS-disciplined time base
//!
//! Owns the node's notion of time: PPS edges measured against the UTC second
//! boundary discipline a Kalman filter, an Allan-deviation ring characterizes
//! the oscillator, and an optional temperature model removes thermal drift.
//! `precise_timestamp` is a short-lock read of the Kalman prediction and never
//! touches device I/O.
//!
//! Status walk: Unknown → Unsynchronized on init, → Acquiring on the first
//! GPS fix, → Synchronized after five disciplined PPS pulses, → Holdover when
//! PPS stops for 2 s, → Error past the holdover budget or the drift
//! threshold, → Synchronized again on PPS recovery.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use tracing::{info, warn};

use tdoa_types::{NodeStatus, SyncSource, SyncStatus, TimeReference};

use crate::allan::AllanDeviation;
use crate::gps::GpsData;
use crate::kalman::ClockKalmanFilter;
use crate::temp_comp::TemperatureCompensation;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TimeBaseConfig {
    /// Seconds the base may coast on its drift estimate before erroring
    pub max_holdover_s: f64,
    /// Drift (ppb) above which holdover degrades to Error
    pub drift_threshold_ppb: f64,
    pub temperature_compensation_enabled: bool,
    /// Linear temperature coefficient, ppb per degree C
    pub temperature_coefficient: f64,
    /// Antenna delay, ns
    pub antenna_delay_ns: f64,
    /// Cable delay, ns
    pub cable_delay_ns: f64,
    /// Receiver processing delay, ns
    pub receiver_delay_ns: f64,
}

impl Default for TimeBaseConfig {
    fn default() -> Self {
        Self {
            max_holdover_s: 60.0,
            drift_threshold_ppb: 500.0,
            temperature_compensation_enabled: false,
            temperature_coefficient: -0.2,
            antenna_delay_ns: 0.0,
            cable_delay_ns: 0.0,
            receiver_delay_ns: 0.0,
        }
    }
}

/// Snapshot of the discipline quality.
#[derive(Debug, Clone, Default)]
pub struct SyncStatistics {
    /// Allan deviation at tau = 1 s (0 until enough samples)
    pub allan_deviation: f64,
    /// Kalman drift estimate, ppb
    pub drift_ppb: f64,
    /// Kalman offset estimate, ns
    pub offset_ns: f64,
    pub temperature_coefficient: f64,
    /// PPS pulses disciplined so far
    pub pps_count: u32,
    pub missed_pps: u32,
    /// Seconds since the last PPS, if any was seen
    pub seconds_since_sync: Option<f64>,
}

/// Status-transition event pushed to the owner's channel.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub reference: TimeReference,
    pub message: String,
}

const HOLDOVER_ENTRY_S: f64 = 2.0;
const UNCERTAINTY_CAP_NS: f64 = 1.0e9;
const INITIAL_UNCERTAINTY_NS: f64 = 1_000_000.0;
const PPS_SYNC_COUNT: usize = 5;

// ── Time base ─────────────────────────────────────────────────────────────────

struct TimeBaseInner {
    config: TimeBaseConfig,
    status: SyncStatus,
    kalman: ClockKalmanFilter,
    allan: AllanDeviation,
    temperature: TemperatureCompensation,
    current_temperature_c: f64,
    uncertainty_ns: f64,
    last_pps_ns: u64,
    last_gps: Option<GpsData>,
    /// Extra fixed latency reported by the GPS device for its PPS edge
    device_pps_offset_ns: f64,
    pps_count: u32,
    /// Recent PPS offsets, bounded to one minute
    recent_offsets: Vec<f64>,
}

/// Thread-safe GPS-disciplined clock. PPS and GPS updates arrive from device
/// callbacks; a periodic monitor drives the holdover timeout.
pub struct TimeBase {
    inner: Mutex<TimeBaseInner>,
    events_tx: Sender<SyncEvent>,
}

impl TimeBase {
    pub fn new(config: TimeBaseConfig) -> (Arc<Self>, Receiver<SyncEvent>) {
        let (events_tx, events_rx) = channel();
        let mut temperature = TemperatureCompensation::new(config.temperature_coefficient);
        temperature.set_enabled(config.temperature_compensation_enabled);
        let base = Arc::new(Self {
            inner: Mutex::new(TimeBaseInner {
                config,
                status: SyncStatus::Unknown,
                kalman: ClockKalmanFilter::new(1.0e-12, 1.0e-6),
                allan: AllanDeviation::new(1024),
                temperature,
                current_temperature_c: 25.0,
                uncertainty_ns: INITIAL_UNCERTAINTY_NS,
                last_pps_ns: 0,
                last_gps: None,
                device_pps_offset_ns: 0.0,
                pps_count: 0,
                recent_offsets: Vec::new(),
            }),
            events_tx,
        });
        (base, events_rx)
    }

    /// Mark the device attached; the base starts waiting for a fix.
    pub fn initialize(&self, device_pps_offset_ns: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.device_pps_offset_ns = device_pps_offset_ns;
        inner.status = SyncStatus::Unsynchronized;
    }

    /// Begin disciplining: clears filter state and waits for PPS.
    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.kalman.reset();
        inner.allan.reset();
        inner.recent_offsets.clear();
        inner.pps_count = 0;
        inner.last_pps_ns = 0;
        inner.uncertainty_ns = INITIAL_UNCERTAINTY_NS;
        inner.status = SyncStatus::Unsynchronized;
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = SyncStatus::Unsynchronized;
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.lock().unwrap().status
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.inner.lock().unwrap().current_temperature_c = celsius;
    }

    pub fn configure_holdover(&self, max_holdover_s: f64, drift_threshold_ppb: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.config.max_holdover_s = max_holdover_s;
        inner.config.drift_threshold_ppb = drift_threshold_ppb;
    }

    pub fn configure_temperature_compensation(&self, enabled: bool, coefficient: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.config.temperature_compensation_enabled = enabled;
        inner.temperature.set_enabled(enabled);
        if enabled && coefficient != 0.0 {
            inner.config.temperature_coefficient = coefficient;
            inner.temperature.set_coefficient(coefficient);
        }
    }

    /// Apply known systematic delays. The combined delay is pushed into the
    /// filter as a one-off negative offset (a longer path means the edge is
    /// observed late).
    pub fn set_delay_calibration(&self, antenna_ns: f64, cable_ns: f64, receiver_ns: f64) {
        let now_ns = wall_clock_ns();
        let mut inner = self.inner.lock().unwrap();
        inner.config.antenna_delay_ns = antenna_ns;
        inner.config.cable_delay_ns = cable_ns;
        inner.config.receiver_delay_ns = receiver_ns;
        let total = antenna_ns + cable_ns + receiver_ns;
        let uncertainty = inner.uncertainty_ns;
        inner.kalman.update(now_ns, -total, uncertainty);
        inner.uncertainty_ns = inner.kalman.uncertainty_ns();
        drop(inner);
        self.emit(format!("delay calibration applied: {total} ns"));
    }

    /// Inject a known offset (manual calibration).
    pub fn calibrate(&self, offset_ns: f64) {
        let now_ns = wall_clock_ns();
        let mut inner = self.inner.lock().unwrap();
        let uncertainty = inner.uncertainty_ns;
        inner.kalman.update(now_ns, offset_ns, uncertainty);
        inner.uncertainty_ns = inner.kalman.uncertainty_ns();
        drop(inner);
        self.emit(format!("manual calibration applied: {offset_ns} ns"));
    }

    // ── Device feed ───────────────────────────────────────────────────────────

    /// New navigation solution from the GPS device.
    pub fn handle_gps_data(&self, data: GpsData) {
        let mut inner = self.inner.lock().unwrap();
        let had_fix = data.has_fix();
        inner.last_gps = Some(data);
        match (had_fix, inner.status) {
            (true, SyncStatus::Unsynchronized) => {
                inner.status = SyncStatus::Acquiring;
                drop(inner);
                self.emit("GPS fix acquired, disciplining".to_string());
            }
            (false, SyncStatus::Synchronized) => {
                inner.status = SyncStatus::Acquiring;
                drop(inner);
                self.emit("GPS fix lost, re-acquiring".to_string());
            }
            _ => {}
        }
    }

    /// PPS edge captured at `timestamp_ns` (monotonic-epoch nanoseconds).
    pub fn handle_pps(&self, timestamp_ns: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.pps_count += 1;

        let fix_ns = match &inner.last_gps {
            Some(data) if data.has_fix() => data.time_ns(),
            _ => {
                // PPS without a fix still refreshes the timeout clock
                inner.last_pps_ns = timestamp_ns;
                return;
            }
        };

        // The edge marks the start of the next UTC second after the fix time
        let utc_boundary_ns = (fix_ns / 1_000_000_000 + 1) * 1_000_000_000;
        let mut offset_ns = utc_boundary_ns as f64 - timestamp_ns as f64;
        offset_ns -= inner.device_pps_offset_ns;
        offset_ns -= inner.config.antenna_delay_ns
            + inner.config.cable_delay_ns
            + inner.config.receiver_delay_ns;
        if inner.config.temperature_compensation_enabled {
            // ppb over the one-second PPS interval is ns directly
            let temp = inner.current_temperature_c;
            offset_ns -= inner.temperature.compensation(temp);
        }

        inner.allan.add_sample(timestamp_ns, offset_ns);
        let uncertainty = inner.uncertainty_ns;
        inner.kalman.update(timestamp_ns, offset_ns, uncertainty);
        inner.uncertainty_ns = inner.kalman.uncertainty_ns();

        inner.recent_offsets.push(offset_ns);
        if inner.recent_offsets.len() > 60 {
            inner.recent_offsets.remove(0);
        }
        inner.last_pps_ns = timestamp_ns;

        match inner.status {
            SyncStatus::Acquiring if inner.recent_offsets.len() >= PPS_SYNC_COUNT => {
                inner.status = SyncStatus::Synchronized;
                let uncertainty = inner.uncertainty_ns;
                drop(inner);
                self.emit(format!("synchronized, uncertainty {uncertainty:.0} ns"));
            }
            SyncStatus::Holdover => {
                inner.status = SyncStatus::Synchronized;
                drop(inner);
                self.emit("recovered from holdover".to_string());
            }
            _ => {}
        }
    }

    // ── Holdover monitor ──────────────────────────────────────────────────────

    /// Evaluate PPS timeouts at `now_ns`. Called from the periodic monitor
    /// task; tests drive it directly with synthetic clocks.
    pub fn check_pps_timeout(&self, now_ns: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.last_pps_ns == 0 {
            return;
        }
        let seconds_since_pps = (now_ns.saturating_sub(inner.last_pps_ns)) as f64 / 1.0e9;

        match inner.status {
            SyncStatus::Synchronized if seconds_since_pps > HOLDOVER_ENTRY_S => {
                inner.status = SyncStatus::Holdover;
                drop(inner);
                self.emit(format!("entered holdover, PPS lost for {seconds_since_pps:.1} s"));
            }
            SyncStatus::Holdover => {
                // Uncertainty grows with the unobserved drift and never
                // decreases without a measurement
                let drift_ppb = inner.kalman.drift_ppb().abs();
                let grown =
                    inner.uncertainty_ns + seconds_since_pps * drift_ppb.max(1.0) / 1000.0;
                inner.uncertainty_ns = grown.min(UNCERTAINTY_CAP_NS);

                if seconds_since_pps > inner.config.max_holdover_s
                    || drift_ppb > inner.config.drift_threshold_ppb
                {
                    inner.status = SyncStatus::Error;
                    inner.uncertainty_ns = UNCERTAINTY_CAP_NS;
                    drop(inner);
                    warn!(
                        "holdover expired after {seconds_since_pps:.1} s (drift {drift_ppb:.0} ppb)"
                    );
                    self.emit(format!(
                        "holdover expired after {seconds_since_pps:.1} s, drift {drift_ppb:.0} ppb"
                    ));
                }
            }
            _ => {}
        }
    }

    /// Spawn the 100 ms monitor task driving `check_pps_timeout` from the
    /// wall clock.
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let base = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                base.check_pps_timeout(wall_clock_ns());
            }
        })
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// Disciplined nanosecond timestamp for "now". Short lock, no device I/O.
    pub fn precise_timestamp(&self) -> u64 {
        self.precise_timestamp_at(wall_clock_ns())
    }

    /// Disciplined timestamp for an arbitrary raw clock reading.
    pub fn precise_timestamp_at(&self, raw_ns: u64) -> u64 {
        let inner = self.inner.lock().unwrap();
        let kalman_offset = inner.kalman.predict(raw_ns);
        let mut adjusted = raw_ns as f64 + kalman_offset;
        if inner.config.temperature_compensation_enabled && inner.last_pps_ns > 0 {
            let seconds_since_pps = (raw_ns.saturating_sub(inner.last_pps_ns)) as f64 / 1.0e9;
            let comp_ppb = inner.temperature.compensation(inner.current_temperature_c);
            adjusted -= seconds_since_pps * comp_ppb;
        }
        adjusted.max(0.0) as u64
    }

    pub fn time_reference(&self) -> TimeReference {
        let nanoseconds = self.precise_timestamp();
        let inner = self.inner.lock().unwrap();
        TimeReference {
            timestamp: Utc::now(),
            nanoseconds,
            uncertainty_ns: inner.uncertainty_ns,
            source: SyncSource::Gps,
            status: inner.status,
        }
    }

    pub fn statistics(&self) -> SyncStatistics {
        let now_ns = wall_clock_ns();
        let mut inner = self.inner.lock().unwrap();
        let allan_deviation =
            if inner.allan.sample_count() >= 3 { inner.allan.deviation(1.0) } else { 0.0 };
        let seconds_since_sync = if inner.last_pps_ns > 0 {
            Some((now_ns.saturating_sub(inner.last_pps_ns)) as f64 / 1.0e9)
        } else {
            None
        };
        let expected = seconds_since_sync.map(|s| s.round() as u32).unwrap_or(0);
        SyncStatistics {
            allan_deviation,
            drift_ppb: inner.kalman.drift_ppb(),
            offset_ns: inner.kalman.offset_ns(),
            temperature_coefficient: inner.temperature.coefficient(),
            pps_count: inner.pps_count,
            missed_pps: expected.saturating_sub(1),
            seconds_since_sync,
        }
    }

    /// Status payload for the time-reference protocol.
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        let mut inner = self.inner.lock().unwrap();
        let allan_deviation =
            if inner.allan.sample_count() >= 3 { inner.allan.deviation(1.0) } else { 0.0 };
        NodeStatus {
            node_id: node_id.to_string(),
            sync_status: inner.status,
            primary_source: SyncSource::Gps,
            secondary_source: SyncSource::None,
            uncertainty_ns: inner.uncertainty_ns,
            allan_deviation,
            drift_rate_ppb: inner.kalman.drift_ppb(),
            satellite_count: inner.last_gps.as_ref().map(|g| g.satellites).unwrap_or(0),
            last_update_ns: inner.last_pps_ns,
        }
    }

    /// Signed difference remote − local in ns, with the combined uncertainty.
    pub fn time_difference(local: &TimeReference, remote: &TimeReference) -> (f64, f64) {
        let diff = remote.nanoseconds as f64 - local.nanoseconds as f64;
        let combined = (local.uncertainty_ns * local.uncertainty_ns
            + remote.uncertainty_ns * remote.uncertainty_ns)
            .sqrt();
        if diff.abs() < combined {
            info!("time difference {diff:.0} ns is below combined uncertainty {combined:.0} ns");
        }
        (diff, combined)
    }

    fn emit(&self, message: String) {
        info!("time base: {message}");
        let reference = self.time_reference();
        let _ = self.events_tx.send(SyncEvent { reference, message });
    }
}

/// Wire a GPS device's callbacks into the time base and mark it attached.
pub fn attach_gps_device(base: &Arc<TimeBase>, device: &mut dyn crate::gps::GpsDevice) {
    let data_base = base.clone();
    device.register_data_callback(Box::new(move |data| data_base.handle_gps_data(data.clone())));
    let pps_base = base.clone();
    device.register_pps_callback(Box::new(move |timestamp_ns| pps_base.handle_pps(timestamp_ns)));
    base.initialize(device.pps_offset_ns());
}

fn wall_clock_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}
