//! solver.rs — 2-D multilateration from time-difference sets
//!
//! Each time difference constrains the emitter to a hyperbola between two
//! receivers; the solver intersects them. Two usable methods: a closed-form
//! least-squares linearization and the default iterative Taylor-series
//! (Gauss-Newton) refinement. Near-singular normal matrices always fall back
//! to the pseudo-inverse; direct inversion below the determinant floor is
//! never attempted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tdoa_types::{
    ConfidenceEllipse, GdopInfo, Position2D, PositionFix, SignalSource, TimeDifferenceSet,
};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolverMethod {
    LeastSquares,
    #[default]
    TaylorSeries,
    /// Placeholder: returns a coarse fix (100 m, 0.1 confidence)
    Bayesian,
    /// Placeholder: returns a coarse fix (100 m, 0.1 confidence)
    GradientDescent,
}

/// Optional rectangular constraint applied to every position update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegionBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    pub method: SolverMethod,
    /// Signal propagation speed, m/s
    pub speed_of_light: f64,
    /// Stop iterating when the position update norm falls below this, metres
    pub convergence_threshold: f64,
    pub max_iterations: u32,
    /// Confidence level for the reported ellipse (0.5 .. 0.99)
    pub confidence_level: f64,
    pub min_required_sources: usize,
    pub min_required_time_diffs: usize,
    pub region: Option<RegionBounds>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            method: SolverMethod::TaylorSeries,
            speed_of_light: 299_792_458.0,
            convergence_threshold: 1.0e-6,
            max_iterations: 20,
            confidence_level: 0.95,
            min_required_sources: 3,
            min_required_time_diffs: 2,
            region: None,
        }
    }
}

const DET_FLOOR: f64 = 1.0e-10;
/// Relative eigenvalue cutoff for the pseudo-inverse rank decision
const RANK_EPSILON: f64 = 1.0e-12;

// ── Small symmetric linear algebra ────────────────────────────────────────────

/// Solve the symmetric 2x2 system M p = b. Below the determinant floor —
/// which TDOA normal matrices always are, their entries scale as 1/c² — the
/// pseudo-inverse from the eigendecomposition is used instead of direct
/// inversion, zeroing directions that are small relative to the dominant
/// eigenvalue.
fn solve_sym2(m: [[f64; 2]; 2], b: [f64; 2]) -> [f64; 2] {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if det.abs() >= DET_FLOOR {
        return [
            (m[1][1] * b[0] - m[0][1] * b[1]) / det,
            (m[0][0] * b[1] - m[1][0] * b[0]) / det,
        ];
    }
    let (eigenvalues, eigenvectors) = eigen_sym2(m);
    let scale = eigenvalues[0].abs().max(eigenvalues[1].abs());
    if scale <= 0.0 {
        return [0.0, 0.0];
    }
    let cutoff = scale * RANK_EPSILON;
    let mut p = [0.0, 0.0];
    for i in 0..2 {
        let lambda = eigenvalues[i];
        if lambda.abs() < cutoff {
            continue;
        }
        let v = eigenvectors[i];
        let vb = v[0] * b[0] + v[1] * b[1];
        p[0] += v[0] * vb / lambda;
        p[1] += v[1] * vb / lambda;
    }
    p
}

/// Per-axis 1-sigma uncertainties from `variance * M^-1`, via the
/// eigendecomposition. Rank-deficient directions keep the 1000 m prior
/// instead of a fake zero.
fn covariance_uncertainties(m: [[f64; 2]; 2], variance: f64) -> (f64, f64) {
    let (eigenvalues, eigenvectors) = eigen_sym2(m);
    let scale = eigenvalues[0].abs().max(eigenvalues[1].abs());
    if scale <= 0.0 {
        return (1000.0, 1000.0);
    }
    let cutoff = scale * RANK_EPSILON;
    let mut c = [[0.0f64; 2]; 2];
    for i in 0..2 {
        let gain = if eigenvalues[i].abs() < cutoff {
            1000.0 * 1000.0
        } else {
            (variance / eigenvalues[i]).abs()
        };
        let v = eigenvectors[i];
        c[0][0] += gain * v[0] * v[0];
        c[1][1] += gain * v[1] * v[1];
    }
    (c[0][0].sqrt(), c[1][1].sqrt())
}

/// Eigenvalues (ascending) and unit eigenvectors of a symmetric 2x2 matrix.
fn eigen_sym2(m: [[f64; 2]; 2]) -> ([f64; 2], [[f64; 2]; 2]) {
    let a = m[0][0];
    let b = m[0][1];
    let c = m[1][1];
    let trace = a + c;
    let diff = a - c;
    let disc = (diff * diff / 4.0 + b * b).sqrt();
    let l1 = trace / 2.0 - disc;
    let l2 = trace / 2.0 + disc;

    let vector_for = |lambda: f64| -> [f64; 2] {
        // (a - lambda) x + b y = 0
        let (vx, vy) = if b.abs() > 1e-15 {
            (lambda - c, b)
        } else if (a - lambda).abs() < (c - lambda).abs() {
            (1.0, 0.0)
        } else {
            (0.0, 1.0)
        };
        let norm = (vx * vx + vy * vy).sqrt();
        if norm > 0.0 {
            [vx / norm, vy / norm]
        } else {
            [1.0, 0.0]
        }
    };

    ([l1, l2], [vector_for(l1), vector_for(l2)])
}

/// Inverse of a symmetric 3x3 matrix by the adjugate; `None` below the
/// determinant floor.
fn invert_sym3(m: [[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < DET_FLOOR {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut inv = [[0.0; 3]; 3];
    inv[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
    inv[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
    inv[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
    inv[1][0] = inv[0][1];
    inv[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
    inv[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
    inv[2][0] = inv[0][2];
    inv[2][1] = inv[1][2];
    inv[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;
    Some(inv)
}

// ── Solver ────────────────────────────────────────────────────────────────────

pub struct MultilaterationSolver {
    config: SolverConfig,
}

impl MultilaterationSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SolverConfig) {
        self.config = config;
    }

    /// Estimate the emitter position from a time-difference set and the
    /// receiver map. Always returns a fix; `valid` is false with a diagnostic
    /// when the inputs cannot support a solution.
    pub fn solve(
        &self,
        time_diffs: &TimeDifferenceSet,
        sources: &HashMap<String, SignalSource>,
    ) -> PositionFix {
        if sources.len() < self.config.min_required_sources {
            return PositionFix::invalid(format!(
                "need at least {} sources, have {}",
                self.config.min_required_sources,
                sources.len()
            ));
        }
        if time_diffs.differences.len() < self.config.min_required_time_diffs {
            return PositionFix::invalid(format!(
                "need at least {} time differences, have {}",
                self.config.min_required_time_diffs,
                time_diffs.differences.len()
            ));
        }

        let solved = match self.config.method {
            SolverMethod::LeastSquares => self.solve_least_squares(time_diffs, sources),
            SolverMethod::TaylorSeries => self.solve_taylor_series(time_diffs, sources),
            SolverMethod::Bayesian | SolverMethod::GradientDescent => {
                // Unimplemented strategies return a coarse fix so callers can
                // tell them apart from a failed solve.
                warn!("{:?} solver is a placeholder", self.config.method);
                Some(Solved {
                    position: Position2D {
                        x: 0.0,
                        y: 0.0,
                        uncertainty_x: 100.0,
                        uncertainty_y: 100.0,
                        confidence: 0.1,
                    },
                    iterations: 0,
                    residual_norm: 0.0,
                })
            }
        };

        let solved = match solved {
            Some(s) => s,
            None => return PositionFix::invalid("no usable measurement rows"),
        };

        let gdop = self.compute_gdop(sources, &solved.position);
        let ellipse = self.confidence_ellipse(&solved.position);
        PositionFix {
            position: solved.position,
            ellipse,
            gdop,
            iterations: solved.iterations,
            residual_norm: solved.residual_norm,
            valid: true,
            diagnostic: String::new(),
        }
    }

    // ── Least squares (Schau-Robinson linearization) ──────────────────────────

    fn solve_least_squares(
        &self,
        time_diffs: &TimeDifferenceSet,
        sources: &HashMap<String, SignalSource>,
    ) -> Option<Solved> {
        let c = self.config.speed_of_light;
        let mut a_rows: Vec<[f64; 2]> = Vec::new();
        let mut b_rows: Vec<f64> = Vec::new();

        for td in &time_diffs.differences {
            let source = sources.get(&td.source_id);
            let reference = sources.get(&td.reference_id);
            let (source, reference) = match (source, reference) {
                (Some(s), Some(r)) => (s, r),
                _ => continue,
            };

            let dist_diff = td.time_diff * c;
            let (x1, y1) = (source.x, source.y);
            let (x2, y2) = (reference.x, reference.y);
            let r1 = (x1 * x1 + y1 * y1).sqrt();
            let r2 = (x2 * x2 + y2 * y2).sqrt();

            a_rows.push([2.0 * (x2 - x1), 2.0 * (y2 - y1)]);
            b_rows.push(dist_diff * dist_diff + r1 * r1 - r2 * r2 - 2.0 * dist_diff * r1);
        }

        if a_rows.len() < 2 {
            return None;
        }

        let (ata, atb) = normal_equations(&a_rows, &b_rows);
        let p = solve_sym2(ata, atb);

        let mut position = Position2D {
            x: p[0],
            y: p[1],
            uncertainty_x: 1000.0,
            uncertainty_y: 1000.0,
            confidence: 0.0,
        };
        self.clamp_to_region(&mut position);

        // Residual-driven covariance
        let rows = a_rows.len();
        let residual_sq: f64 = a_rows
            .iter()
            .zip(&b_rows)
            .map(|(a, b)| (a[0] * position.x + a[1] * position.y - b).powi(2))
            .sum();
        let variance = if rows > 2 { residual_sq / (rows as f64 - 2.0) } else { residual_sq };
        let (ux, uy) = covariance_uncertainties(ata, variance);
        position.uncertainty_x = ux;
        position.uncertainty_y = uy;

        let normalized_residual = (residual_sq / rows as f64).sqrt() / c;
        position.confidence = (-normalized_residual / 1.0e-6).exp().clamp(0.0, 1.0);

        Some(Solved {
            position,
            iterations: 0,
            residual_norm: residual_sq.sqrt(),
        })
    }

    // ── Taylor series (Gauss-Newton) ──────────────────────────────────────────

    fn solve_taylor_series(
        &self,
        time_diffs: &TimeDifferenceSet,
        sources: &HashMap<String, SignalSource>,
    ) -> Option<Solved> {
        let c = self.config.speed_of_light;

        // Initialize at the receiver centroid
        let mut x = 0.0;
        let mut y = 0.0;
        for s in sources.values() {
            x += s.x;
            y += s.y;
        }
        x /= sources.len() as f64;
        y /= sources.len() as f64;

        let mut iterations = 0u32;

        while iterations < self.config.max_iterations {
            let (h_rows, dy_rows) = jacobian(time_diffs, sources, x, y, c);
            if h_rows.len() < 2 {
                return None;
            }

            let (hth, htdy) = normal_equations(&h_rows, &dy_rows);
            let delta = solve_sym2(hth, htdy);
            x += delta[0];
            y += delta[1];
            if let Some(region) = &self.config.region {
                x = x.clamp(region.min_x, region.max_x);
                y = y.clamp(region.min_y, region.max_y);
            }
            iterations += 1;

            let update_norm = (delta[0] * delta[0] + delta[1] * delta[1]).sqrt();
            if update_norm < self.config.convergence_threshold {
                break;
            }
        }

        // Covariance and residuals at the solution
        let (h_rows, dy_rows) = jacobian(time_diffs, sources, x, y, c);
        if h_rows.len() < 2 {
            return None;
        }
        let rows = h_rows.len();
        let residual_sq: f64 = dy_rows.iter().map(|r| r * r).sum();

        let mut position = Position2D {
            x,
            y,
            uncertainty_x: 1000.0,
            uncertainty_y: 1000.0,
            confidence: 0.0,
        };
        let (hth, _) = normal_equations(&h_rows, &dy_rows);
        let variance = if rows > 2 { residual_sq / (rows as f64 - 2.0) } else { residual_sq };
        let (ux, uy) = covariance_uncertainties(hth, variance);
        position.uncertainty_x = ux;
        position.uncertainty_y = uy;

        let normalized_residual = (residual_sq / rows as f64).sqrt() / c;
        let iteration_penalty = iterations as f64 / self.config.max_iterations as f64;
        position.confidence = ((-normalized_residual / 1.0e-6).exp()
            * (1.0 - 0.5 * iteration_penalty))
            .clamp(0.0, 1.0);

        debug!(
            "taylor fix ({x:.3}, {y:.3}) after {iterations} iterations, residual {:.3e}",
            residual_sq.sqrt()
        );
        Some(Solved { position, iterations, residual_norm: residual_sq.sqrt() })
    }

    fn clamp_to_region(&self, position: &mut Position2D) {
        if let Some(region) = &self.config.region {
            position.x = position.x.clamp(region.min_x, region.max_x);
            position.y = position.y.clamp(region.min_y, region.max_y);
        }
    }

    // ── GDOP ──────────────────────────────────────────────────────────────────

    /// Geometric dilution of precision at the solved position. Returns the
    /// zero record for fewer than three receivers or rank-deficient geometry.
    pub fn compute_gdop(
        &self,
        sources: &HashMap<String, SignalSource>,
        position: &Position2D,
    ) -> GdopInfo {
        if sources.len() < 3 {
            return GdopInfo::default();
        }

        // Rows [(p - p_i)/||p - p_i||, 1]; G^T G is symmetric 3x3
        let mut gtg = [[0.0f64; 3]; 3];
        for s in sources.values() {
            let dx = position.x - s.x;
            let dy = position.y - s.y;
            let dist = (dx * dx + dy * dy).sqrt();
            let row = if dist > DET_FLOOR {
                [dx / dist, dy / dist, 1.0]
            } else {
                [0.0, 0.0, 1.0]
            };
            for i in 0..3 {
                for j in 0..3 {
                    gtg[i][j] += row[i] * row[j];
                }
            }
        }

        match invert_sym3(gtg) {
            Some(cov) => {
                let trace = cov[0][0] + cov[1][1] + cov[2][2];
                GdopInfo {
                    gdop: trace.abs().sqrt(),
                    pdop: (cov[0][0] + cov[1][1]).abs().sqrt(),
                    hdop: (cov[0][0] + cov[1][1]).abs().sqrt(),
                    vdop: 0.0,
                    tdop: cov[2][2].abs().sqrt(),
                }
            }
            None => GdopInfo::default(),
        }
    }

    // ── Confidence ellipse ────────────────────────────────────────────────────

    /// Ellipse from the per-axis uncertainties at the configured confidence
    /// level (chi-squared, 2 degrees of freedom).
    pub fn confidence_ellipse(&self, position: &Position2D) -> ConfidenceEllipse {
        let covariance = [
            [position.uncertainty_x * position.uncertainty_x, 0.0],
            [0.0, position.uncertainty_y * position.uncertainty_y],
        ];
        self.covariance_to_ellipse(covariance, position)
    }

    pub fn covariance_to_ellipse(
        &self,
        covariance: [[f64; 2]; 2],
        position: &Position2D,
    ) -> ConfidenceEllipse {
        let level = self.config.confidence_level;
        let chi_square = if level >= 0.99 {
            9.21
        } else if level >= 0.95 {
            5.99
        } else if level >= 0.90 {
            4.61
        } else if level >= 0.70 {
            2.41
        } else if level >= 0.50 {
            1.39
        } else {
            1.0
        };

        let (eigenvalues, eigenvectors) = eigen_sym2(covariance);
        let major = eigenvectors[1];
        ConfidenceEllipse {
            center_x: position.x,
            center_y: position.y,
            semi_major: (chi_square * eigenvalues[1].max(0.0)).sqrt(),
            semi_minor: (chi_square * eigenvalues[0].max(0.0)).sqrt(),
            rotation_rad: major[1].atan2(major[0]),
            confidence_level: level,
        }
    }
}

struct Solved {
    position: Position2D,
    iterations: u32,
    residual_norm: f64,
}

/// Accumulate A^T A and A^T b for 2-column rows.
fn normal_equations(rows: &[[f64; 2]], rhs: &[f64]) -> ([[f64; 2]; 2], [f64; 2]) {
    let mut ata = [[0.0f64; 2]; 2];
    let mut atb = [0.0f64; 2];
    for (row, b) in rows.iter().zip(rhs) {
        ata[0][0] += row[0] * row[0];
        ata[0][1] += row[0] * row[1];
        ata[1][0] += row[1] * row[0];
        ata[1][1] += row[1] * row[1];
        atb[0] += row[0] * b;
        atb[1] += row[1] * b;
    }
    (ata, atb)
}

/// Jacobian rows and residuals of the TDOA model at (x, y).
fn jacobian(
    time_diffs: &TimeDifferenceSet,
    sources: &HashMap<String, SignalSource>,
    x: f64,
    y: f64,
    c: f64,
) -> (Vec<[f64; 2]>, Vec<f64>) {
    let mut h_rows = Vec::new();
    let mut dy_rows = Vec::new();
    for td in &time_diffs.differences {
        let source = sources.get(&td.source_id);
        let reference = sources.get(&td.reference_id);
        let (source, reference) = match (source, reference) {
            (Some(s), Some(r)) => (s, r),
            _ => continue,
        };

        let d1 = source.distance_to(x, y).max(1e-12);
        let d2 = reference.distance_to(x, y).max(1e-12);
        let predicted = (d1 - d2) / c;

        h_rows.push([
            (x - source.x) / (d1 * c) - (x - reference.x) / (d2 * c),
            (y - source.y) / (d1 * c) - (y - reference.y) / (d2 * c),
        ]);
        dy_rows.push(td.time_diff - predicted);
    }
    (h_rows, dy_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdoa_types::TimeDifference;

    const C: f64 = 299_792_458.0;

    fn sources_at(points: &[(&str, f64, f64)]) -> HashMap<String, SignalSource> {
        points
            .iter()
            .map(|&(id, x, y)| (id.to_string(), SignalSource::at(id, x, y)))
            .collect()
    }

    /// Noise-free time differences for an emitter at (ex, ey), reference
    /// being the first listed source.
    fn ideal_time_diffs(
        sources: &HashMap<String, SignalSource>,
        reference_id: &str,
        ex: f64,
        ey: f64,
    ) -> TimeDifferenceSet {
        let reference = &sources[reference_id];
        let d_ref = reference.distance_to(ex, ey);
        let mut differences = Vec::new();
        let mut ids: Vec<&String> = sources.keys().collect();
        ids.sort();
        for id in ids {
            if id == reference_id {
                continue;
            }
            let s = &sources[id];
            let dt = (s.distance_to(ex, ey) - d_ref) / C;
            differences.push(TimeDifference::new(reference_id, id.clone(), dt, 1e-9, 0.95, 0));
        }
        TimeDifferenceSet { differences, timestamp_ns: 0, reference_id: reference_id.into() }
    }

    fn four_receivers() -> HashMap<String, SignalSource> {
        sources_at(&[
            ("r1", -1000.0, -1000.0),
            ("r2", 1000.0, -1000.0),
            ("r3", 0.0, 1000.0),
            ("r4", -500.0, 500.0),
        ])
    }

    #[test]
    fn taylor_series_converges_on_ideal_geometry() {
        // Receivers at (-1000,-1000), (1000,-1000), (0,1000), (-500,500);
        // emitter at (250, 300); noise-free differences.
        let sources = four_receivers();
        let set = ideal_time_diffs(&sources, "r1", 250.0, 300.0);
        let solver = MultilaterationSolver::new(SolverConfig::default());
        let fix = solver.solve(&set, &sources);

        assert!(fix.valid);
        assert!(
            (fix.position.x - 250.0).abs() < 1e-3 && (fix.position.y - 300.0).abs() < 1e-3,
            "fix at ({}, {})",
            fix.position.x,
            fix.position.y
        );
        assert!(fix.iterations <= 5, "took {} iterations", fix.iterations);
        assert!(fix.gdop.gdop.is_finite() && fix.gdop.gdop > 0.0);
        // Zero residual; only the iteration penalty discounts confidence
        assert!(fix.position.confidence > 0.85, "confidence {}", fix.position.confidence);
        assert_eq!(fix.ellipse.confidence_level, 0.95);
    }

    #[test]
    fn least_squares_exact_at_linearization_point() {
        // The closed-form expansion linearizes about the origin, where it is
        // exact; away from it the Taylor solver is the accurate path.
        let sources = four_receivers();
        let set = ideal_time_diffs(&sources, "r1", 0.0, 0.0);
        let solver = MultilaterationSolver::new(SolverConfig {
            method: SolverMethod::LeastSquares,
            ..Default::default()
        });
        let fix = solver.solve(&set, &sources);
        assert!(fix.valid);
        assert!(
            fix.position.x.abs() < 1e-6 && fix.position.y.abs() < 1e-6,
            "fix at ({}, {})",
            fix.position.x,
            fix.position.y
        );
    }

    #[test]
    fn least_squares_returns_finite_fix_off_origin() {
        let sources = four_receivers();
        let set = ideal_time_diffs(&sources, "r1", 250.0, 300.0);
        let solver = MultilaterationSolver::new(SolverConfig {
            method: SolverMethod::LeastSquares,
            ..Default::default()
        });
        let fix = solver.solve(&set, &sources);
        assert!(fix.valid);
        assert!(fix.position.x.is_finite() && fix.position.y.is_finite());
    }

    #[test]
    fn too_few_sources_gives_invalid_fix() {
        let sources = sources_at(&[("r1", 0.0, 0.0), ("r2", 100.0, 0.0)]);
        let set = ideal_time_diffs(&sources, "r1", 10.0, 10.0);
        let solver = MultilaterationSolver::new(SolverConfig::default());
        let fix = solver.solve(&set, &sources);
        assert!(!fix.valid);
        assert!(!fix.diagnostic.is_empty());
        assert_eq!(fix.position.uncertainty_x, 1000.0);
        assert_eq!(fix.position.uncertainty_y, 1000.0);
    }

    #[test]
    fn too_few_time_diffs_gives_invalid_fix() {
        let sources = four_receivers();
        let mut set = ideal_time_diffs(&sources, "r1", 250.0, 300.0);
        set.differences.truncate(1);
        let solver = MultilaterationSolver::new(SolverConfig::default());
        assert!(!solver.solve(&set, &sources).valid);
    }

    #[test]
    fn collinear_receivers_survive_via_fallback() {
        // Three collinear receivers: the normal matrix is near-singular; the
        // pseudo-inverse path must still return a (poor) answer.
        let sources =
            sources_at(&[("r1", -1000.0, 0.0), ("r2", -800.0, 0.0), ("r3", -600.0, 0.0)]);
        let set = ideal_time_diffs(&sources, "r1", 250.0, 300.0);
        let solver = MultilaterationSolver::new(SolverConfig::default());
        let fix = solver.solve(&set, &sources);

        assert!(fix.valid, "fallback must not reject the solve");
        let gdop = solver.compute_gdop(&sources, &fix.position);
        // Collinear geometry: either detected as degenerate or enormous
        assert!(
            gdop.is_degenerate() || gdop.gdop > 100.0,
            "gdop {:?} for collinear receivers",
            gdop
        );
        assert!(
            fix.position.uncertainty_x >= 100.0 || fix.position.uncertainty_y >= 100.0,
            "uncertainty ({}, {}) too optimistic for collinear geometry",
            fix.position.uncertainty_x,
            fix.position.uncertainty_y
        );
    }

    #[test]
    fn gdop_zero_record_below_three_receivers() {
        let sources = sources_at(&[("r1", 0.0, 0.0), ("r2", 100.0, 0.0)]);
        let solver = MultilaterationSolver::new(SolverConfig::default());
        let gdop = solver.compute_gdop(
            &sources,
            &Position2D { x: 50.0, y: 50.0, ..Default::default() },
        );
        assert!(gdop.is_degenerate());
    }

    #[test]
    fn gdop_reasonable_for_good_geometry() {
        let sources = four_receivers();
        let solver = MultilaterationSolver::new(SolverConfig::default());
        let gdop = solver.compute_gdop(
            &sources,
            &Position2D { x: 0.0, y: 0.0, ..Default::default() },
        );
        assert!(!gdop.is_degenerate());
        assert!(gdop.gdop > 0.0 && gdop.gdop < 10.0, "gdop {}", gdop.gdop);
        assert_eq!(gdop.vdop, 0.0);
        assert!((gdop.hdop - gdop.pdop).abs() < 1e-12);
    }

    #[test]
    fn region_bounds_clamp_the_fix() {
        let sources = four_receivers();
        let set = ideal_time_diffs(&sources, "r1", 250.0, 300.0);
        let solver = MultilaterationSolver::new(SolverConfig {
            region: Some(RegionBounds { min_x: -100.0, max_x: 100.0, min_y: -100.0, max_y: 100.0 }),
            ..Default::default()
        });
        let fix = solver.solve(&set, &sources);
        assert!(fix.position.x <= 100.0 && fix.position.y <= 100.0);
    }

    #[test]
    fn confidence_ellipse_axes_follow_uncertainties() {
        let solver = MultilaterationSolver::new(SolverConfig::default());
        let position = Position2D {
            x: 10.0,
            y: -5.0,
            uncertainty_x: 3.0,
            uncertainty_y: 1.0,
            confidence: 0.9,
        };
        let ellipse = solver.confidence_ellipse(&position);
        assert_eq!(ellipse.center_x, 10.0);
        assert_eq!(ellipse.center_y, -5.0);
        // 95% level: chi-square 5.99
        assert!((ellipse.semi_major - (5.99f64 * 9.0).sqrt()).abs() < 1e-9);
        assert!((ellipse.semi_minor - (5.99f64 * 1.0).sqrt()).abs() < 1e-9);
        // Major axis along x
        assert!(ellipse.rotation_rad.abs() < 1e-9 || (ellipse.rotation_rad.abs() - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn chi_square_table_tracks_confidence_level() {
        for (level, chi) in [(0.99, 9.21), (0.95, 5.99), (0.90, 4.61), (0.70, 2.41), (0.50, 1.39)] {
            let solver = MultilaterationSolver::new(SolverConfig {
                confidence_level: level,
                ..Default::default()
            });
            let position = Position2D {
                uncertainty_x: 1.0,
                uncertainty_y: 1.0,
                ..Default::default()
            };
            let ellipse = solver.confidence_ellipse(&position);
            assert!(
                (ellipse.semi_major - (chi as f64).sqrt()).abs() < 1e-9,
                "level {level}: {}",
                ellipse.semi_major
            );
        }
    }

    #[test]
    fn placeholder_methods_return_coarse_fix() {
        let sources = four_receivers();
        let set = ideal_time_diffs(&sources, "r1", 250.0, 300.0);
        for method in [SolverMethod::Bayesian, SolverMethod::GradientDescent] {
            let solver = MultilaterationSolver::new(SolverConfig { method, ..Default::default() });
            let fix = solver.solve(&set, &sources);
            assert!(fix.valid);
            assert_eq!(fix.position.uncertainty_x, 100.0);
            assert!((fix.position.confidence - 0.1).abs() < 1e-12);
        }
    }

    #[test]
    fn unknown_source_rows_are_skipped() {
        let sources = four_receivers();
        let mut set = ideal_time_diffs(&sources, "r1", 250.0, 300.0);
        set.differences.push(TimeDifference::new("r1", "ghost", 1e-6, 1e-9, 0.9, 0));
        let solver = MultilaterationSolver::new(SolverConfig::default());
        let fix = solver.solve(&set, &sources);
        assert!(fix.valid);
        assert!((fix.position.x - 250.0).abs() < 1e-3);
    }
}
