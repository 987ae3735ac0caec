//! kalman.rs — clock-discipline Kalman filter
//!
//! Three-state filter tracking the local oscillator against a reference:
//! offset (s), drift (s/s), and aging (s/s²). The only measurement is the
//! scalar offset between a captured PPS edge and the expected UTC second
//! boundary, so the measurement matrix is H = [1, 0, 0].

/// State transition over dt:
///   offset' = offset + drift·dt + ½·aging·dt²
///   drift'  = drift + aging·dt
///   aging'  = aging
#[derive(Debug, Clone)]
pub struct ClockKalmanFilter {
    /// State vector [offset s, drift s/s, aging s/s²]
    x: [f64; 3],
    /// Error covariance
    p: [[f64; 3]; 3],
    /// Process noise covariance (diagonal)
    q: [f64; 3],
    /// Measurement noise variance, s²
    r: f64,
    last_update_ns: u64,
    initialized: bool,
}

impl ClockKalmanFilter {
    /// `process_noise` seeds the offset term of Q; drift and aging scale down
    /// from it. `measurement_noise` is the default R in s².
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            x: [0.0; 3],
            p: initial_covariance(1.0),
            q: [process_noise, process_noise * 1.0e-4, process_noise * 1.0e-8],
            r: measurement_noise,
            last_update_ns: 0,
            initialized: false,
        }
    }

    pub fn set_measurement_noise(&mut self, noise: f64) {
        self.r = noise;
    }

    pub fn set_process_noise(&mut self, offset: f64, drift: f64, aging: f64) {
        self.q = [
            offset,
            if drift > 0.0 { drift } else { offset * 1.0e-4 },
            if aging > 0.0 { aging } else { offset * 1.0e-8 },
        ];
    }

    pub fn reset(&mut self) {
        self.x = [0.0; 3];
        self.p = initial_covariance(1.0);
        self.last_update_ns = 0;
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Feed a measured offset in nanoseconds at `timestamp_ns`, with the
    /// measurement's 1-sigma uncertainty in ns (0 keeps the configured R).
    pub fn update(&mut self, timestamp_ns: u64, measurement_ns: f64, uncertainty_ns: f64) {
        let measurement = measurement_ns * 1.0e-9;
        if uncertainty_ns > 0.0 {
            self.r = (uncertainty_ns * 1.0e-9).powi(2);
        }

        if !self.initialized {
            self.x[0] = measurement;
            self.last_update_ns = timestamp_ns;
            self.initialized = true;
            return;
        }

        if timestamp_ns <= self.last_update_ns {
            // Out-of-order measurement, nothing sensible to predict over
            return;
        }
        let dt = (timestamp_ns - self.last_update_ns) as f64 * 1.0e-9;

        // Predict
        let x_pred = [
            self.x[0] + self.x[1] * dt + 0.5 * self.x[2] * dt * dt,
            self.x[1] + self.x[2] * dt,
            self.x[2],
        ];
        let f = [[1.0, dt, 0.5 * dt * dt], [0.0, 1.0, dt], [0.0, 0.0, 1.0]];
        let mut p_pred = mat_mul(&mat_mul(&f, &self.p), &transpose(&f));
        for i in 0..3 {
            p_pred[i][i] += self.q[i];
        }

        // Update with the scalar offset measurement (H = [1, 0, 0])
        let innovation = measurement - x_pred[0];
        let s = p_pred[0][0] + self.r;
        let k = [p_pred[0][0] / s, p_pred[1][0] / s, p_pred[2][0] / s];

        for i in 0..3 {
            self.x[i] = x_pred[i] + k[i] * innovation;
        }
        // P = (I - K H) P_pred; K H only touches column 0 of the identity
        let mut p_new = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                p_new[i][j] = p_pred[i][j] - k[i] * p_pred[0][j];
            }
        }
        self.p = p_new;
        self.last_update_ns = timestamp_ns;
    }

    /// Predicted offset at `timestamp_ns`, in nanoseconds.
    pub fn predict(&self, timestamp_ns: u64) -> f64 {
        if !self.initialized {
            return 0.0;
        }
        let dt = (timestamp_ns.saturating_sub(self.last_update_ns)) as f64 * 1.0e-9;
        (self.x[0] + self.x[1] * dt + 0.5 * self.x[2] * dt * dt) * 1.0e9
    }

    /// Current offset estimate, ns.
    pub fn offset_ns(&self) -> f64 {
        self.x[0] * 1.0e9
    }

    /// Drift estimate in parts per billion.
    pub fn drift_ppb(&self) -> f64 {
        self.x[1] * 1.0e9
    }

    /// Aging estimate in ppb per day.
    pub fn aging_ppb_per_day(&self) -> f64 {
        self.x[2] * 86_400.0 * 1.0e9
    }

    /// 1-sigma uncertainty of the offset estimate, ns.
    pub fn uncertainty_ns(&self) -> f64 {
        self.p[0][0].max(0.0).sqrt() * 1.0e9
    }
}

fn initial_covariance(offset_var: f64) -> [[f64; 3]; 3] {
    let mut p = [[0.0; 3]; 3];
    p[0][0] = offset_var;
    p[1][1] = 1.0e-8;
    p[2][2] = 1.0e-12;
    p
}

fn mat_mul(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            for (k, bk) in b.iter().enumerate() {
                out[i][j] += a[i][k] * bk[j];
            }
        }
    }
    out
}

fn transpose(a: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = a[j][i];
        }
    }
    out
}
