//! Voltage-dependent control laws of flexible loads.
//!
//! Every law is a piecewise-linear curve of the branch voltage magnitude `u`, smoothed with a
//! softplus construction so that the outer control/solve iteration sees a differentiable map.
//! The steepness `alpha` sets how close the smooth curve sits to the piecewise-linear one: the
//! two differ by at most `ln(2) / alpha` (in volts) at a breakpoint.

use num_complex::Complex64;

use crate::error::ConfigError;
use crate::projection::Projection;

pub const DEFAULT_ALPHA: f64 = 1000.0;
pub const DEFAULT_EPSILON: f64 = 1e-8;

/// `ln(1 + e^x)` without overflow for large `x`.
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Smooth approximation of `x.clamp(lower, upper)`.
pub fn soft_clip(x: f64, lower: f64, upper: f64, alpha: f64) -> f64 {
    lower + (softplus(alpha * (x - lower)) - softplus(alpha * (x - upper))) / alpha
}

/// Smooth ramp from 0 at `a` to 1 at `b`.
fn ramp(u: f64, a: f64, b: f64, alpha: f64) -> f64 {
    (soft_clip(u, a, b, alpha) - a) / (b - a)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Constant,
    /// Production curtailed from full power at `u_up` down to zero at `u_max`.
    PMaxUProduction { u_up: f64, u_max: f64, alpha: f64 },
    /// Consumption curtailed from full power at `u_down` down to zero at `u_min`.
    PMaxUConsumption { u_min: f64, u_down: f64, alpha: f64 },
    /// Reactive support: `q_max` below `u_min`, nothing between `u_down` and `u_up`, `q_min` above
    /// `u_max`.
    QU {
        u_min: f64,
        u_down: f64,
        u_up: f64,
        u_max: f64,
        alpha: f64,
    },
}

impl Control {
    pub fn p_max_u_production(u_up: f64, u_max: f64, alpha: f64) -> Result<Self, ConfigError> {
        let control = Control::PMaxUProduction { u_up, u_max, alpha };
        control.validate()?;
        Ok(control)
    }

    pub fn p_max_u_consumption(u_min: f64, u_down: f64, alpha: f64) -> Result<Self, ConfigError> {
        let control = Control::PMaxUConsumption {
            u_min,
            u_down,
            alpha,
        };
        control.validate()?;
        Ok(control)
    }

    pub fn q_u(
        u_min: f64,
        u_down: f64,
        u_up: f64,
        u_max: f64,
        alpha: f64,
    ) -> Result<Self, ConfigError> {
        let control = Control::QU {
            u_min,
            u_down,
            u_up,
            u_max,
            alpha,
        };
        control.validate()?;
        Ok(control)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Control::Constant => "constant",
            Control::PMaxUProduction { .. } => "p_max_u_production",
            Control::PMaxUConsumption { .. } => "p_max_u_consumption",
            Control::QU { .. } => "q_u",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (breakpoints, alpha): (Vec<f64>, f64) = match self {
            Control::Constant => return Ok(()),
            Control::PMaxUProduction { u_up, u_max, alpha } => (vec![*u_up, *u_max], *alpha),
            Control::PMaxUConsumption {
                u_min,
                u_down,
                alpha,
            } => (vec![*u_min, *u_down], *alpha),
            Control::QU {
                u_min,
                u_down,
                u_up,
                u_max,
                alpha,
            } => (vec![*u_min, *u_down, *u_up, *u_max], *alpha),
        };
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(ConfigError::InvalidSteepness {
                control: self.name(),
                alpha,
            });
        }
        let ordered = breakpoints.iter().all(|u| u.is_finite() && *u >= 0.0)
            && breakpoints.windows(2).all(|w| w[0] < w[1]);
        if !ordered {
            return Err(ConfigError::BreakpointOrder {
                control: self.name(),
                breakpoints: breakpoints
                    .iter()
                    .map(|u| u.to_string())
                    .collect::<Vec<_>>()
                    .join(" < "),
            });
        }
        Ok(())
    }

    fn active_power(&self, u: f64, p: f64) -> f64 {
        match *self {
            Control::PMaxUProduction { u_up, u_max, alpha } => {
                p * (1.0 - ramp(u, u_up, u_max, alpha))
            }
            Control::PMaxUConsumption {
                u_min,
                u_down,
                alpha,
            } => p * ramp(u, u_min, u_down, alpha),
            Control::Constant | Control::QU { .. } => p,
        }
    }

    fn reactive_power(&self, u: f64, q: f64, q_min: f64, q_max: f64) -> f64 {
        match *self {
            Control::QU {
                u_min,
                u_down,
                u_up,
                u_max,
                alpha,
            } => {
                q_max * (1.0 - ramp(u, u_min, u_down, alpha)) + q_min * ramp(u, u_up, u_max, alpha)
            }
            Control::Constant
            | Control::PMaxUProduction { .. }
            | Control::PMaxUConsumption { .. } => q,
        }
    }
}

/// Control configuration of one phase of a flexible load.
#[derive(Debug, Clone, PartialEq)]
pub struct FlexibleParameter {
    control_p: Control,
    control_q: Control,
    projection: Projection,
    s_max: f64,
    q_min: Option<f64>,
    q_max: Option<f64>,
}

impl FlexibleParameter {
    pub fn new(
        control_p: Control,
        control_q: Control,
        projection: Projection,
        s_max: f64,
        q_min: Option<f64>,
        q_max: Option<f64>,
    ) -> Result<Self, ConfigError> {
        if matches!(control_p, Control::QU { .. }) {
            return Err(ConfigError::ControlMisuse {
                control: control_p.name(),
                usage: "active power",
            });
        }
        if matches!(
            control_q,
            Control::PMaxUProduction { .. } | Control::PMaxUConsumption { .. }
        ) {
            return Err(ConfigError::ControlMisuse {
                control: control_q.name(),
                usage: "reactive power",
            });
        }
        control_p.validate()?;
        control_q.validate()?;
        projection.validate()?;
        if !(s_max.is_finite() && s_max > 0.0) {
            return Err(ConfigError::NonPositiveSMax(s_max));
        }
        let lo = q_min.unwrap_or(-s_max);
        let hi = q_max.unwrap_or(s_max);
        if !(lo >= -s_max && lo < hi && hi <= s_max) {
            return Err(ConfigError::ReactiveLimits {
                q_min: lo,
                q_max: hi,
                s_max,
            });
        }
        Ok(Self {
            control_p,
            control_q,
            projection,
            s_max,
            q_min,
            q_max,
        })
    }

    /// No control: the configured power is only projected.
    pub fn constant(s_max: f64) -> Result<Self, ConfigError> {
        Self::new(
            Control::Constant,
            Control::Constant,
            Projection::default(),
            s_max,
            None,
            None,
        )
    }

    pub fn p_max_u_production(u_up: f64, u_max: f64, s_max: f64) -> Result<Self, ConfigError> {
        Self::new(
            Control::p_max_u_production(u_up, u_max, DEFAULT_ALPHA)?,
            Control::Constant,
            Projection::default(),
            s_max,
            None,
            None,
        )
    }

    pub fn p_max_u_consumption(u_min: f64, u_down: f64, s_max: f64) -> Result<Self, ConfigError> {
        Self::new(
            Control::p_max_u_consumption(u_min, u_down, DEFAULT_ALPHA)?,
            Control::Constant,
            Projection::default(),
            s_max,
            None,
            None,
        )
    }

    pub fn q_u(
        u_min: f64,
        u_down: f64,
        u_up: f64,
        u_max: f64,
        s_max: f64,
    ) -> Result<Self, ConfigError> {
        Self::new(
            Control::Constant,
            Control::q_u(u_min, u_down, u_up, u_max, DEFAULT_ALPHA)?,
            Projection::default(),
            s_max,
            None,
            None,
        )
    }

    /// Production curtailment combined with `q_u` reactive support.
    pub fn pq_u_production(
        up_up: f64,
        up_max: f64,
        uq_min: f64,
        uq_down: f64,
        uq_up: f64,
        uq_max: f64,
        s_max: f64,
    ) -> Result<Self, ConfigError> {
        Self::new(
            Control::p_max_u_production(up_up, up_max, DEFAULT_ALPHA)?,
            Control::q_u(uq_min, uq_down, uq_up, uq_max, DEFAULT_ALPHA)?,
            Projection::default(),
            s_max,
            None,
            None,
        )
    }

    /// Consumption curtailment combined with `q_u` reactive support.
    pub fn pq_u_consumption(
        up_min: f64,
        up_down: f64,
        uq_min: f64,
        uq_down: f64,
        uq_up: f64,
        uq_max: f64,
        s_max: f64,
    ) -> Result<Self, ConfigError> {
        Self::new(
            Control::p_max_u_consumption(up_min, up_down, DEFAULT_ALPHA)?,
            Control::q_u(uq_min, uq_down, uq_up, uq_max, DEFAULT_ALPHA)?,
            Projection::default(),
            s_max,
            None,
            None,
        )
    }

    pub fn control_p(&self) -> &Control {
        &self.control_p
    }

    pub fn control_q(&self) -> &Control {
        &self.control_q
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn s_max(&self) -> f64 {
        self.s_max
    }

    pub fn q_min(&self) -> f64 {
        self.q_min.unwrap_or(-self.s_max)
    }

    pub fn q_max(&self) -> f64 {
        self.q_max.unwrap_or(self.s_max)
    }

    /// Rejects a configured power whose sign contradicts the active-power control.
    pub fn check_power(&self, element: &str, power: Complex64) -> Result<(), ConfigError> {
        let message = match self.control_p {
            Control::PMaxUProduction { .. } if power.re > 0.0 => {
                "p_max_u_production needs a non-positive (producing) active power"
            }
            Control::PMaxUConsumption { .. } if power.re < 0.0 => {
                "p_max_u_consumption needs a non-negative (consuming) active power"
            }
            _ => return Ok(()),
        };
        Err(ConfigError::InvalidParameter {
            element: element.to_string(),
            message: message.to_string(),
        })
    }

    /// Power requested by the control laws at voltage magnitude `u`, before projection.
    pub fn candidate_power(&self, u: f64, s: Complex64) -> Complex64 {
        let p = self.control_p.active_power(u, s.re);
        let q = self
            .control_q
            .reactive_power(u, s.im, self.q_min(), self.q_max());
        Complex64::new(p, q)
    }

    /// Feasible power at voltage magnitude `u` for the configured (theoretical) power `s`.
    pub fn compute_power(&self, u: f64, s: Complex64) -> Complex64 {
        let candidate = self.candidate_power(u, s);
        self.projection
            .project(candidate, self.s_max, self.q_min(), self.q_max())
    }
}
