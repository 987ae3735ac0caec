//! temp_comp.rs — oscillator temperature compensation
//!
//! Maps temperature to a frequency-offset correction in ppb. Polynomial
//! models are fit to calibration points by normal-equations least squares;
//! the spline model interpolates linearly between bracketing points with
//! constant extrapolation beyond them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationModel {
    None,
    #[default]
    Linear,
    Quadratic,
    Cubic,
    Spline,
}

/// Temperature → ppb correction model.
#[derive(Debug, Clone)]
pub struct TemperatureCompensation {
    enabled: bool,
    /// Linear coefficient, ppb per degree C
    default_coefficient: f64,
    reference_temperature: f64,
    /// Temperature (milli-degree key) → frequency offset in ppb
    calibration: BTreeMap<i64, f64>,
    model: CompensationModel,
    /// Polynomial coefficients in ascending order, around the reference
    coefficients: Vec<f64>,
}

/// Integer key for the calibration map (BTreeMap needs Ord).
fn temp_key(temperature: f64) -> i64 {
    (temperature * 1000.0).round() as i64
}

impl TemperatureCompensation {
    /// The default linear coefficient for AT-cut crystals is about
    /// -0.2 ppb/degree C near room temperature.
    pub fn new(default_coefficient: f64) -> Self {
        Self {
            enabled: false,
            default_coefficient,
            reference_temperature: 25.0,
            calibration: BTreeMap::new(),
            model: CompensationModel::Linear,
            coefficients: vec![0.0, default_coefficient],
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_reference_temperature(&mut self, temperature: f64) {
        self.reference_temperature = temperature;
    }

    pub fn coefficient(&self) -> f64 {
        self.default_coefficient
    }

    pub fn set_coefficient(&mut self, coefficient: f64) {
        self.default_coefficient = coefficient;
        if self.model == CompensationModel::Linear {
            self.coefficients = vec![0.0, coefficient];
        }
    }

    pub fn add_calibration_point(&mut self, temperature: f64, offset_ppb: f64) {
        self.calibration.insert(temp_key(temperature), offset_ppb);
        if matches!(
            self.model,
            CompensationModel::Quadratic | CompensationModel::Cubic
        ) {
            self.fit_polynomial();
        }
    }

    pub fn clear_calibration_points(&mut self) {
        self.calibration.clear();
    }

    pub fn model(&self) -> CompensationModel {
        self.model
    }

    pub fn set_model(&mut self, model: CompensationModel) {
        self.model = model;
        match model {
            CompensationModel::None => self.coefficients = vec![0.0],
            CompensationModel::Linear => {
                self.coefficients = vec![0.0, self.default_coefficient]
            }
            CompensationModel::Quadratic | CompensationModel::Cubic => {
                if self.calibration.len() >= 2 {
                    self.fit_polynomial();
                } else {
                    // Not enough data, stay linear with the default slope
                    self.coefficients = vec![0.0, self.default_coefficient];
                }
            }
            CompensationModel::Spline => {}
        }
    }

    /// Model suggested by the amount of calibration data available.
    pub fn optimal_model(&self) -> CompensationModel {
        match self.calibration.len() {
            0..=2 => CompensationModel::Linear,
            3 => CompensationModel::Quadratic,
            4..=7 => CompensationModel::Cubic,
            _ => CompensationModel::Spline,
        }
    }

    /// Frequency compensation at `temperature`, in ppb. Zero when disabled.
    pub fn compensation(&self, temperature: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        match self.model {
            CompensationModel::None => 0.0,
            CompensationModel::Linear | CompensationModel::Quadratic | CompensationModel::Cubic => {
                self.evaluate_polynomial(temperature - self.reference_temperature)
            }
            CompensationModel::Spline => self.interpolate_spline(temperature),
        }
    }

    fn evaluate_polynomial(&self, x: f64) -> f64 {
        let mut result = 0.0;
        let mut x_pow = 1.0;
        for c in &self.coefficients {
            result += c * x_pow;
            x_pow *= x;
        }
        result
    }

    /// Least-squares polynomial fit over the calibration points, centred on
    /// the reference temperature. Gaussian elimination with partial pivoting
    /// on the (order+1)-square normal equations.
    fn fit_polynomial(&mut self) {
        if self.calibration.len() < 2 {
            return;
        }
        let xs: Vec<f64> = self
            .calibration
            .keys()
            .map(|k| *k as f64 / 1000.0 - self.reference_temperature)
            .collect();
        let ys: Vec<f64> = self.calibration.values().copied().collect();

        let mut order = match self.model {
            CompensationModel::Quadratic => 2,
            CompensationModel::Cubic => 3,
            _ => 1,
        };
        if order >= self.calibration.len() {
            order = self.calibration.len() - 1;
        }
        let m = order + 1;

        // Normal equations A^T A c = A^T y over the Vandermonde matrix
        let mut ata = vec![vec![0.0f64; m]; m];
        let mut aty = vec![0.0f64; m];
        for (x, y) in xs.iter().zip(&ys) {
            let mut powers = Vec::with_capacity(m);
            let mut p = 1.0;
            for _ in 0..m {
                powers.push(p);
                p *= x;
            }
            for i in 0..m {
                for j in 0..m {
                    ata[i][j] += powers[i] * powers[j];
                }
                aty[i] += powers[i] * y;
            }
        }

        // Gaussian elimination with partial pivoting
        for i in 0..m {
            let mut pivot = i;
            for j in i + 1..m {
                if ata[j][i].abs() > ata[pivot][i].abs() {
                    pivot = j;
                }
            }
            if ata[pivot][i].abs() < 1e-12 {
                return; // Degenerate system, keep previous coefficients
            }
            ata.swap(i, pivot);
            aty.swap(i, pivot);
            for j in i + 1..m {
                let factor = ata[j][i] / ata[i][i];
                for k in i..m {
                    ata[j][k] -= factor * ata[i][k];
                }
                aty[j] -= factor * aty[i];
            }
        }
        let mut coeffs = vec![0.0f64; m];
        for i in (0..m).rev() {
            let mut sum = 0.0;
            for j in i + 1..m {
                sum += ata[i][j] * coeffs[j];
            }
            coeffs[i] = (aty[i] - sum) / ata[i][i];
        }
        self.coefficients = coeffs;
    }

    /// Piecewise-linear interpolation between the bracketing calibration
    /// points; constant beyond the first/last point.
    fn interpolate_spline(&self, temperature: f64) -> f64 {
        if self.calibration.is_empty() {
            return 0.0;
        }
        let key = temp_key(temperature);
        let above = self.calibration.range(key..).next();
        let below = self.calibration.range(..=key).next_back();
        match (below, above) {
            (Some((k, v)), _) if *k == key => *v,
            (None, Some((_, v))) => *v,
            (Some((_, v)), None) => *v,
            (Some((k1, v1)), Some((k2, v2))) => {
                let t1 = *k1 as f64 / 1000.0;
                let t2 = *k2 as f64 / 1000.0;
                if (t2 - t1).abs() < 1e-9 {
                    return *v1;
                }
                let t_norm = (temperature - t1) / (t2 - t1);
                v1 + t_norm * (v2 - v1)
            }
            (None, None) => 0.0,
        }
    }
}

impl Default for TemperatureCompensation {
    fn default() -> Self {
        Self::new(-0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_returns_zero() {
        let comp = TemperatureCompensation::default();
        assert_eq!(comp.compensation(60.0), 0.0);
    }

    #[test]
    fn linear_model_uses_default_coefficient() {
        let mut comp = TemperatureCompensation::new(-0.2);
        comp.set_enabled(true);
        // 10 degrees above the 25 C reference: -2 ppb
        assert!((comp.compensation(35.0) - (-2.0)).abs() < 1e-9);
        assert!((comp.compensation(25.0)).abs() < 1e-9);

        comp.set_coefficient(-0.5);
        assert!((comp.compensation(35.0) - (-5.0)).abs() < 1e-9);
    }

    #[test]
    fn quadratic_fit_recovers_parabola() {
        let mut comp = TemperatureCompensation::new(-0.2);
        comp.set_enabled(true);
        // y = 0.1 * (T - 25)^2 sampled at five points
        for t in [5.0, 15.0, 25.0, 35.0, 45.0] {
            let x: f64 = t - 25.0;
            comp.add_calibration_point(t, 0.1 * x * x);
        }
        comp.set_model(CompensationModel::Quadratic);
        for t in [10.0, 20.0, 30.0, 40.0] {
            let x: f64 = t - 25.0;
            let expected = 0.1 * x * x;
            assert!(
                (comp.compensation(t) - expected).abs() < 1e-6,
                "at {t}: {} vs {expected}",
                comp.compensation(t)
            );
        }
    }

    #[test]
    fn cubic_fit_with_few_points_degrades_order() {
        let mut comp = TemperatureCompensation::new(-0.2);
        comp.set_enabled(true);
        comp.add_calibration_point(20.0, 1.0);
        comp.add_calibration_point(30.0, 3.0);
        // Only two points: fit degrades to a line through them
        comp.set_model(CompensationModel::Cubic);
        assert!((comp.compensation(25.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn spline_interpolates_and_extrapolates_constant() {
        let mut comp = TemperatureCompensation::new(-0.2);
        comp.set_enabled(true);
        comp.set_model(CompensationModel::Spline);
        comp.add_calibration_point(10.0, 2.0);
        comp.add_calibration_point(20.0, 4.0);
        comp.add_calibration_point(40.0, 0.0);

        assert!((comp.compensation(15.0) - 3.0).abs() < 1e-9);
        assert!((comp.compensation(30.0) - 2.0).abs() < 1e-9);
        // Exact point
        assert!((comp.compensation(20.0) - 4.0).abs() < 1e-9);
        // Constant extrapolation
        assert!((comp.compensation(-10.0) - 2.0).abs() < 1e-9);
        assert!((comp.compensation(80.0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn optimal_model_scales_with_data() {
        let mut comp = TemperatureCompensation::default();
        assert_eq!(comp.optimal_model(), CompensationModel::Linear);
        for (i, t) in [0.0, 10.0, 20.0].iter().enumerate() {
            comp.add_calibration_point(*t, i as f64);
        }
        assert_eq!(comp.optimal_model(), CompensationModel::Quadratic);
        for t in [30.0, 40.0, 50.0, 60.0] {
            comp.add_calibration_point(t, 1.0);
        }
        assert_eq!(comp.optimal_model(), CompensationModel::Cubic);
        for t in [70.0, 80.0] {
            comp.add_calibration_point(t, 1.0);
        }
        assert_eq!(comp.optimal_model(), CompensationModel::Spline);
    }
}
