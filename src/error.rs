//! Error types for network construction, validation, assembly and solving.
//!
//! Configuration errors are raised when an element is built, topology errors when a network is
//! validated and assembly errors when the equation system turns out degenerate. [`Error`] wraps all
//! of them at the API boundary.

use thiserror::Error;

use crate::case::ElementKind;

/// Invalid element configuration, detected at construction time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid phases '{phases}': {reason}")]
    InvalidPhases { phases: String, reason: String },

    #[error("{control}: breakpoints must be strictly increasing ({breakpoints})")]
    BreakpointOrder {
        control: &'static str,
        breakpoints: String,
    },

    #[error("s_max must be strictly positive, got {0}")]
    NonPositiveSMax(f64),

    #[error("invalid smoothing parameters alpha={alpha}, epsilon={epsilon}")]
    InvalidSmoothing { alpha: f64, epsilon: f64 },

    #[error("{control}: steepness alpha must be strictly positive and finite, got {alpha}")]
    InvalidSteepness { control: &'static str, alpha: f64 },

    #[error(
        "reactive limits must satisfy -s_max <= q_min < q_max <= s_max, \
         got q_min={q_min}, q_max={q_max}, s_max={s_max}"
    )]
    ReactiveLimits { q_min: f64, q_max: f64, s_max: f64 },

    #[error("control '{control}' cannot be used for {usage}")]
    ControlMisuse {
        control: &'static str,
        usage: &'static str,
    },

    #[error("{element}: expected {expected} values, got {got}")]
    ValueCount {
        element: String,
        expected: usize,
        got: usize,
    },

    #[error("{element}: {message}")]
    InvalidParameter { element: String, message: String },

    #[error("invalid vector group '{0}'")]
    InvalidVectorGroup(String),

    #[error("unsupported winding in vector group '{0}'")]
    UnsupportedWinding(String),
}

/// Graph-level violation found by the topology validator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: ElementKind, id: String },

    #[error("{kind} '{element}' references unknown {target} '{reference}'")]
    UnknownReference {
        kind: ElementKind,
        element: String,
        target: ElementKind,
        reference: String,
    },

    #[error("{kind} '{element}' uses phases '{phases}' absent from bus '{bus}'")]
    PhaseMismatch {
        kind: ElementKind,
        element: String,
        bus: String,
        phases: String,
    },

    #[error(
        "ground connection '{element}': bus '{bus}' phase '{phase}' \
         is already connected to a ground"
    )]
    DuplicateGroundConnection {
        element: String,
        bus: String,
        phase: char,
    },

    #[error("isolated section [{}] has no potential reference", describe(.buses, .grounds))]
    MissingPotentialRef {
        buses: Vec<String>,
        grounds: Vec<String>,
    },

    #[error(
        "isolated section [{}] has {} potential references: {}",
        describe(.buses, .grounds),
        .refs.len(),
        .refs.join(", ")
    )]
    MultiplePotentialRefs {
        buses: Vec<String>,
        grounds: Vec<String>,
        refs: Vec<String>,
    },

    #[error("line '{0}' has a shunt admittance but no ground")]
    ShuntWithoutGround(String),

    #[error("switches form a loop: {}", .0.join(", "))]
    SwitchLoop(Vec<String>),

    #[error("no {kind} with id '{id}'")]
    UnknownElement { kind: ElementKind, id: String },
}

fn describe(buses: &[String], grounds: &[String]) -> String {
    buses
        .iter()
        .map(|b| format!("bus {b}"))
        .chain(grounds.iter().map(|g| format!("ground {g}")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Structural diagnostic of an assembled system.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("dimension mismatch: {variables} unknowns for {equations} equations")]
    DimensionMismatch { variables: usize, equations: usize },

    #[error("no unknown for {0}")]
    UnknownVariable(String),

    #[error(
        "singular system: rank {rank} of {dimension} \
         (smallest singular value {smallest_singular_value:.3e})"
    )]
    RankDeficient {
        rank: usize,
        dimension: usize,
        smallest_singular_value: f64,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error("linear solver failed: {0}")]
    Solver(String),

    #[error(
        "load flow did not converge after {iterations} iterations \
         (last change {distance:.3e} V)"
    )]
    DidNotConverge { iterations: usize, distance: f64 },

    #[error("unknown {kind} parameters '{id}'")]
    UnknownParameters { kind: &'static str, id: String },

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_errors_name_their_members() {
        let err = TopologyError::MultiplePotentialRefs {
            buses: vec!["b1".into(), "b2".into()],
            grounds: vec!["g".into()],
            refs: vec!["pref1".into(), "pref2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("bus b1, bus b2, ground g"));
        assert!(msg.contains("2 potential references: pref1, pref2"));
    }

    #[test]
    fn non_convergence_is_its_own_outcome() {
        let err: Error = Error::DidNotConverge {
            iterations: 50,
            distance: 0.25,
        };
        assert!(matches!(err, Error::DidNotConverge { .. }));
        assert!(err.to_string().contains("50 iterations"));

        let err: Error = TopologyError::ShuntWithoutGround("l1".into()).into();
        assert!(matches!(err, Error::Topology(_)));
    }
}
