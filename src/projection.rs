//! Projection of a requested flexible power onto its feasible region.

use num_complex::Complex64;

use crate::error::ConfigError;
use crate::flexible::{DEFAULT_ALPHA, DEFAULT_EPSILON, soft_clip, softplus};

/// Feasibility-region projection law. New laws are new variants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Reactive power clipped into `[q_min, q_max]`, then the complex power scaled back onto the
    /// disk of radius `s_max`, both smoothed with steepness `alpha`.
    Euclidean { alpha: f64, epsilon: f64 },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Euclidean {
            alpha: DEFAULT_ALPHA,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl Projection {
    pub fn euclidean(alpha: f64, epsilon: f64) -> Result<Self, ConfigError> {
        let projection = Projection::Euclidean { alpha, epsilon };
        projection.validate()?;
        Ok(projection)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Projection::Euclidean { .. } => "euclidean",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Projection::Euclidean { alpha, epsilon } => {
                let valid = |x: f64| x.is_finite() && x > 0.0;
                if valid(alpha) && valid(epsilon) {
                    Ok(())
                } else {
                    Err(ConfigError::InvalidSmoothing { alpha, epsilon })
                }
            }
        }
    }

    /// Returns a power with `|S| <= s_max` and `q_min <= Q <= q_max` (up to smoothing).
    pub fn project(&self, s: Complex64, s_max: f64, q_min: f64, q_max: f64) -> Complex64 {
        match *self {
            Projection::Euclidean { alpha, epsilon } => {
                let s = Complex64::new(s.re, soft_clip(s.im, q_min, q_max, alpha));
                let m = s.norm();
                if m < epsilon {
                    return s;
                }
                let m_proj = (m - softplus(alpha * (m - s_max)) / alpha).max(0.0);
                s * (m_proj / m)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn candidate_outside_disk_lands_on_boundary() {
        let projection = Projection::default();
        let candidate = Complex64::new(-2076.7, 3418.7);
        let s = projection.project(candidate, 4000.0, -4000.0, 4000.0);
        assert_abs_diff_eq!(s.norm(), 4000.0, epsilon = 1e-3);
        assert_abs_diff_eq!(s.arg(), candidate.arg(), epsilon = 1e-9);
    }

    #[test]
    fn power_inside_disk_is_unchanged() {
        let projection = Projection::default();
        for k in 0..16 {
            let angle = k as f64 * std::f64::consts::PI / 8.0;
            for &m in &[0.0, 10.0, 1500.0, 3900.0] {
                let s = Complex64::from_polar(m, angle);
                let p = projection.project(s, 4000.0, -4000.0, 4000.0);
                assert_abs_diff_eq!((p - s).norm(), 0.0, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn projection_never_exceeds_s_max() {
        let projection = Projection::euclidean(50.0, 1e-6).unwrap();
        for k in 0..24 {
            let angle = k as f64 * std::f64::consts::PI / 12.0;
            for &m in &[3999.0, 4000.0, 4000.01, 4100.0, 1e5] {
                let s = Complex64::from_polar(m, angle);
                let p = projection.project(s, 4000.0, -4000.0, 4000.0);
                assert!(p.norm() <= 4000.0 + 1e-6, "|S| = {} for m = {m}", p.norm());
            }
        }
    }

    #[test]
    fn reactive_limits_are_enforced() {
        let projection = Projection::default();
        let s = projection.project(Complex64::new(100.0, 900.0), 4000.0, -500.0, 500.0);
        assert_abs_diff_eq!(s.im, 500.0, epsilon = 1e-2);
        assert_abs_diff_eq!(s.re, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn smoothing_parameters_are_checked() {
        assert!(Projection::euclidean(0.0, 1e-8).is_err());
        assert!(Projection::euclidean(1000.0, -1.0).is_err());
        assert!(Projection::euclidean(f64::INFINITY, 1e-8).is_err());
    }
}
