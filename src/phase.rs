use std::fmt;
use std::str::FromStr;

use num_complex::Complex64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    A,
    B,
    C,
    N,
}

impl Phase {
    pub fn from_char(c: char) -> Option<Phase> {
        match c {
            'a' => Some(Phase::A),
            'b' => Some(Phase::B),
            'c' => Some(Phase::C),
            'n' => Some(Phase::N),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Phase::A => 'a',
            Phase::B => 'b',
            Phase::C => 'c',
            Phase::N => 'n',
        }
    }

    pub fn is_neutral(self) -> bool {
        self == Phase::N
    }

    /// Angle of the balanced direct-sequence phasor of this phase, in radians. Zero for the
    /// neutral.
    pub fn angle(self) -> f64 {
        let third = 2.0 * std::f64::consts::PI / 3.0;
        match self {
            Phase::A | Phase::N => 0.0,
            Phase::B => -third,
            Phase::C => third,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Ordered set of phases drawn from `abcn`, stored in canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Phases(Vec<Phase>);

impl Phases {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPhases {
            phases: s.to_string(),
            reason: reason.to_string(),
        };
        if s.is_empty() {
            return Err(invalid("empty phase set"));
        }
        let mut phases = Vec::with_capacity(s.len());
        for c in s.chars() {
            let phase = Phase::from_char(c).ok_or_else(|| invalid("phases are drawn from 'abcn'"))?;
            if phases.contains(&phase) {
                return Err(invalid("duplicate phase"));
            }
            phases.push(phase);
        }
        phases.sort();
        Ok(Phases(phases))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Phase> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[Phase] {
        &self.0
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.0.contains(&phase)
    }

    pub fn has_neutral(&self) -> bool {
        self.contains(Phase::N)
    }

    pub fn position(&self, phase: Phase) -> Option<usize> {
        self.0.iter().position(|&p| p == phase)
    }

    pub fn non_neutral(&self) -> impl Iterator<Item = Phase> + '_ {
        self.iter().filter(|p| !p.is_neutral())
    }

    pub fn is_subset_of(&self, other: &Phases) -> bool {
        self.iter().all(|p| other.contains(p))
    }

    /// Phases of `self` that `other` lacks.
    pub fn missing_from(&self, other: &Phases) -> String {
        self.iter()
            .filter(|&p| !other.contains(p))
            .map(Phase::as_char)
            .collect()
    }
}

impl fmt::Display for Phases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: String = self.0.iter().map(|p| p.as_char()).collect();
        f.pad(&s)
    }
}

impl FromStr for Phases {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phases::parse(s)
    }
}

impl Serialize for Phases {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Phases {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Phases::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut chars = s.chars();
        match (chars.next().and_then(Phase::from_char), chars.next()) {
            (Some(phase), None) => Ok(phase),
            _ => Err(serde::de::Error::custom(format!("invalid phase '{s}'"))),
        }
    }
}

/// Balanced direct-sequence phase-to-neutral potentials of magnitude `u` for the given phases,
/// the neutral sitting at zero.
pub fn balanced_potentials(u: f64, phases: &Phases) -> Vec<Complex64> {
    phases
        .iter()
        .map(|p| {
            if p.is_neutral() {
                Complex64::new(0.0, 0.0)
            } else {
                Complex64::from_polar(u, p.angle())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_canonicalised() {
        let phases = Phases::parse("nba").unwrap();
        assert_eq!(phases.to_string(), "abn");
        assert_eq!(phases.position(Phase::N), Some(2));
        assert!(phases.has_neutral());
        assert_eq!(phases.non_neutral().collect::<Vec<_>>(), vec![Phase::A, Phase::B]);
    }

    #[test]
    fn invalid_phase_strings_are_rejected() {
        assert!(Phases::parse("").is_err());
        assert!(Phases::parse("abd").is_err());
        assert!(matches!(
            Phases::parse("aab"),
            Err(ConfigError::InvalidPhases { .. })
        ));
    }

    #[test]
    fn subset_and_missing() {
        let bus = Phases::parse("abc").unwrap();
        let load = Phases::parse("an").unwrap();
        assert!(!load.is_subset_of(&bus));
        assert_eq!(load.missing_from(&bus), "n");
        assert!(Phases::parse("ca").unwrap().is_subset_of(&bus));
    }

    #[test]
    fn phases_serialize_as_strings() {
        let phases: Phases = serde_json::from_str("\"cna\"").unwrap();
        assert_eq!(serde_json::to_string(&phases).unwrap(), "\"acn\"");
        let phase: Phase = serde_json::from_str("\"b\"").unwrap();
        assert_eq!(phase, Phase::B);
        assert!(serde_json::from_str::<Phase>("\"ab\"").is_err());
    }

    #[test]
    fn balanced_set_is_direct_sequence() {
        let v = balanced_potentials(230.0, &Phases::parse("abcn").unwrap());
        assert_eq!(v.len(), 4);
        assert!((v[0] - Complex64::new(230.0, 0.0)).norm() < 1e-9);
        assert!((v[1].arg() + 2.0 * std::f64::consts::PI / 3.0).abs() < 1e-12);
        assert!((v[0] + v[1] + v[2]).norm() < 1e-9);
        assert_eq!(v[3], Complex64::new(0.0, 0.0));
    }
}
