//! Transformer parameters and winding layouts.
//!
//! A vector group such as `Dyn11` names the high-voltage winding (`D`, `Y`, `YN`), the low-voltage
//! winding (`d`, `y`, `yn`) and the clock number, the lag of the low-voltage phase-to-neutral
//! voltages behind the high-voltage ones in steps of 30 degrees. The high-voltage windings have a
//! fixed connection; the low-voltage connection (limb-to-phase rotation, polarity and, for deltas,
//! the closing direction) is picked from the finite set of candidates that realises the clock.
//! Single-phase transformers use `Ii0` and `Ii6`.

use std::fmt;
use std::str::FromStr;

use num_complex::Complex64;

use crate::error::ConfigError;
use crate::phase::{Phase, Phases};

const THREE_PHASES: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winding {
    Delta,
    Star,
    StarNeutral,
    Single,
}

impl Winding {
    fn default_phases(self) -> Option<&'static str> {
        match self {
            Winding::Delta | Winding::Star => Some("abc"),
            Winding::StarNeutral => Some("abcn"),
            Winding::Single => None,
        }
    }

    /// Rated winding voltage for a line-to-line rating `u`.
    fn winding_voltage(self, u: f64) -> f64 {
        match self {
            Winding::Star | Winding::StarNeutral => u / 3f64.sqrt(),
            Winding::Delta | Winding::Single => u,
        }
    }

    /// Angle of the high-voltage winding voltage relative to its phase, in degrees.
    fn offset(self) -> i32 {
        match self {
            Winding::Delta => 30,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorGroup {
    pub hv: Winding,
    pub lv: Winding,
    pub clock: u8,
}

impl VectorGroup {
    pub fn is_single_phase(&self) -> bool {
        self.hv == Winding::Single
    }
}

impl FromStr for VectorGroup {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidVectorGroup(s.to_string());
        if s.contains(['Z', 'z']) {
            return Err(ConfigError::UnsupportedWinding(s.to_string()));
        }
        let split = s.find(|c: char| c.is_ascii_digit()).ok_or_else(invalid)?;
        let (windings, clock) = s.split_at(split);
        let clock: u8 = clock.parse().map_err(|_| invalid())?;
        if clock > 11 {
            return Err(invalid());
        }
        let (hv, lv) = match windings {
            "Ii" => (Winding::Single, Winding::Single),
            _ => {
                let lv_start = windings
                    .find(|c: char| c.is_ascii_lowercase())
                    .ok_or_else(invalid)?;
                let (hv, lv) = windings.split_at(lv_start);
                let hv = match hv {
                    "D" => Winding::Delta,
                    "Y" => Winding::Star,
                    "YN" => Winding::StarNeutral,
                    _ => return Err(invalid()),
                };
                let lv = match lv {
                    "d" => Winding::Delta,
                    "y" => Winding::Star,
                    "yn" => Winding::StarNeutral,
                    _ => return Err(invalid()),
                };
                (hv, lv)
            }
        };
        if hv == Winding::Single && clock != 0 && clock != 6 {
            return Err(invalid());
        }
        Ok(VectorGroup { hv, lv, clock })
    }
}

impl fmt::Display for VectorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hv = match self.hv {
            Winding::Delta => "D",
            Winding::Star => "Y",
            Winding::StarNeutral => "YN",
            Winding::Single => "I",
        };
        let lv = match self.lv {
            Winding::Delta => "d",
            Winding::Star => "y",
            Winding::StarNeutral => "yn",
            Winding::Single => "i",
        };
        write!(f, "{hv}{lv}{}", self.clock)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformerParameters {
    pub id: String,
    pub vg: VectorGroup,
    /// Rated apparent power (VA).
    pub sn: f64,
    /// Rated line-to-line voltages (V).
    pub uhv: f64,
    pub ulv: f64,
    /// Series impedance, low-voltage star equivalent (Ω).
    pub z2: Complex64,
    /// Magnetizing admittance, high-voltage star equivalent (S).
    pub ym: Complex64,
}

impl TransformerParameters {
    pub fn new(
        id: impl Into<String>,
        vg: &str,
        sn: f64,
        uhv: f64,
        ulv: f64,
        z2: Complex64,
        ym: Complex64,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let vg: VectorGroup = vg.parse()?;
        let invalid = |message: &str| ConfigError::InvalidParameter {
            element: id.clone(),
            message: message.to_string(),
        };
        if !(sn > 0.0 && uhv > 0.0 && ulv > 0.0) {
            return Err(invalid("sn, uhv and ulv must be strictly positive"));
        }
        if !(z2.is_finite() && ym.is_finite()) {
            return Err(invalid("z2 and ym must be finite"));
        }
        Ok(Self {
            id,
            vg,
            sn,
            uhv,
            ulv,
            z2,
            ym,
        })
    }

    /// Parameters from the open-circuit (`i0` per unit, `p0` W) and short-circuit (`psc` W, `vsc`
    /// per unit) test results.
    #[allow(clippy::too_many_arguments)]
    pub fn from_open_and_short_circuit_tests(
        id: impl Into<String>,
        vg: &str,
        sn: f64,
        uhv: f64,
        ulv: f64,
        i0: f64,
        p0: f64,
        psc: f64,
        vsc: f64,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let invalid = |message: &str| ConfigError::InvalidParameter {
            element: id.clone(),
            message: message.to_string(),
        };
        if !(sn > 0.0 && uhv > 0.0 && ulv > 0.0) {
            return Err(invalid("sn, uhv and ulv must be strictly positive"));
        }
        if i0 < 0.0 || p0 < 0.0 || psc < 0.0 || vsc <= 0.0 {
            return Err(invalid("test results must be non-negative and vsc positive"));
        }

        let r2 = psc * (ulv / sn).powi(2);
        let z2_norm = vsc * ulv * ulv / sn;
        if r2 > z2_norm {
            return Err(invalid("short-circuit losses exceed the short-circuit impedance"));
        }
        let z2 = Complex64::new(r2, (z2_norm * z2_norm - r2 * r2).sqrt());

        let g = p0 / (uhv * uhv);
        let ym_norm = i0 * sn / (uhv * uhv);
        if g > ym_norm {
            return Err(invalid("no-load losses exceed the magnetizing current"));
        }
        let ym = Complex64::new(g, -(ym_norm * ym_norm - g * g).sqrt());

        Self::new(id, vg, sn, uhv, ulv, z2, ym)
    }

    pub fn default_phases(&self) -> Option<(Phases, Phases)> {
        let hv = self.vg.hv.default_phases()?;
        let lv = self.vg.lv.default_phases()?;
        Some((Phases::parse(hv).ok()?, Phases::parse(lv).ok()?))
    }

    /// Rated line-to-line voltage ratio `ulv / uhv`.
    pub fn ratio(&self) -> f64 {
        self.ulv / self.uhv
    }

    pub(crate) fn layout(
        &self,
        phases1: &Phases,
        phases2: &Phases,
        tap: f64,
    ) -> Result<WindingLayout, ConfigError> {
        let vg = &self.vg;
        let mismatch = |message: String| ConfigError::InvalidParameter {
            element: self.id.clone(),
            message,
        };

        let (limbs, hv_internal, lv_internal) = if vg.is_single_phase() {
            if phases1.len() != 2 || phases2.len() != 2 {
                return Err(mismatch(format!(
                    "single-phase vector group {vg} needs two phases on each side, \
                     got '{phases1}' and '{phases2}'"
                )));
            }
            let (h, l) = (phases1.as_slice(), phases2.as_slice());
            let lv = if vg.clock == 0 {
                (Terminal::Phase(l[0]), Terminal::Phase(l[1]))
            } else {
                (Terminal::Phase(l[1]), Terminal::Phase(l[0]))
            };
            let limb = Limb {
                hv: (Terminal::Phase(h[0]), Terminal::Phase(h[1])),
                lv,
            };
            (vec![limb], false, false)
        } else {
            for (winding, phases, side) in [(vg.hv, phases1, "high"), (vg.lv, phases2, "low")] {
                let expected = winding.default_phases().unwrap_or_default();
                if phases.to_string() != expected {
                    return Err(mismatch(format!(
                        "vector group {vg} needs phases '{expected}' on the {side}-voltage side, \
                         got '{phases}'"
                    )));
                }
            }
            let connection = lv_connection(vg).ok_or_else(|| {
                ConfigError::InvalidVectorGroup(vg.to_string())
            })?;
            let limbs = (0..3)
                .map(|k| Limb {
                    hv: hv_winding(vg.hv, k),
                    lv: connection.winding(vg.lv, k),
                })
                .collect();
            (
                limbs,
                vg.hv == Winding::Star,
                vg.lv == Winding::Star,
            )
        };

        let ratio = vg.lv.winding_voltage(self.ulv) / vg.hv.winding_voltage(self.uhv) * tap;
        let z2 = if vg.lv == Winding::Delta {
            self.z2 * 3.0
        } else {
            self.z2
        };
        let ym = if vg.hv == Winding::Delta {
            self.ym / 3.0
        } else {
            self.ym
        };
        Ok(WindingLayout {
            limbs,
            hv_internal_neutral: hv_internal,
            lv_internal_neutral: lv_internal,
            ratio,
            z2,
            ym,
        })
    }
}

/// End of a winding: a bus phase of the transformer's side or the side's internal star point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    Phase(Phase),
    InternalNeutral,
}

/// The two windings sharing one core limb, each as `(from, to)`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Limb {
    pub hv: (Terminal, Terminal),
    pub lv: (Terminal, Terminal),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WindingLayout {
    pub limbs: Vec<Limb>,
    pub hv_internal_neutral: bool,
    pub lv_internal_neutral: bool,
    /// Winding voltage ratio including the tap.
    pub ratio: f64,
    /// Series impedance of one low-voltage winding.
    pub z2: Complex64,
    /// Magnetizing admittance of one high-voltage winding.
    pub ym: Complex64,
}

fn star_point(winding: Winding) -> Terminal {
    if winding == Winding::StarNeutral {
        Terminal::Phase(Phase::N)
    } else {
        Terminal::InternalNeutral
    }
}

fn hv_winding(winding: Winding, k: usize) -> (Terminal, Terminal) {
    let phase = Terminal::Phase(THREE_PHASES[k]);
    match winding {
        Winding::Delta => (phase, Terminal::Phase(THREE_PHASES[(k + 1) % 3])),
        _ => (phase, star_point(winding)),
    }
}

/// How low-voltage winding `k` is wired: to phase `k + rotation`, reversed or not, and for deltas
/// closed towards the next (`+30` degrees) or the previous (`-30` degrees) phase.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LvConnection {
    rotation: usize,
    reversed: bool,
    delta_shift: i32,
}

impl LvConnection {
    fn winding(&self, winding: Winding, k: usize) -> (Terminal, Terminal) {
        let j = (k + self.rotation) % 3;
        let from = Terminal::Phase(THREE_PHASES[j]);
        let to = match winding {
            Winding::Delta if self.delta_shift > 0 => Terminal::Phase(THREE_PHASES[(j + 1) % 3]),
            Winding::Delta => Terminal::Phase(THREE_PHASES[(j + 2) % 3]),
            _ => star_point(winding),
        };
        if self.reversed { (to, from) } else { (from, to) }
    }
}

/// First connection, in a fixed search order, whose low-voltage phase voltages lag the
/// high-voltage ones by `clock * 30` degrees.
fn lv_connection(vg: &VectorGroup) -> Option<LvConnection> {
    let clock = i32::from(vg.clock);
    let shifts: &[i32] = if vg.lv == Winding::Delta { &[30, -30] } else { &[0] };
    for rotation in 0..3 {
        for reversed in [false, true] {
            for &delta_shift in shifts {
                let angle = -120 * rotation as i32 - 30 * clock + delta_shift
                    + if reversed { 180 } else { 0 }
                    - vg.hv.offset();
                if angle.rem_euclid(360) == 0 {
                    return Some(LvConnection {
                        rotation,
                        reversed,
                        delta_shift,
                    });
                }
            }
        }
    }
    None
}
