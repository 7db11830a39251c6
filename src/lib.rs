//! Unbalanced multi-phase load flow.
//!
//! A [`Network`] of buses, lines, transformers, switches, sources and loads is validated into
//! isolated sections, assembled into a square complex equation system and solved by an outer loop
//! that re-linearizes power loads and re-evaluates flexible load controls until the bus potentials
//! settle.

pub mod case;
pub mod catalogue;
pub mod equations;
pub mod error;
pub mod flexible;
pub mod loadflow;
pub mod parse;
pub mod phase;
pub mod projection;
pub mod results;
pub mod topology;
pub mod transformer;

pub use case::{
    Bus, Element, ElementKey, ElementKind, Ground, GroundConnection, Line, LineParameters, Load,
    LoadModel, Network, OnConnected, PotentialRef, RefTarget, Switch, Transformer, VoltageSource,
};
pub use catalogue::{Catalogue, EmptyCatalogue, ParameterCatalogue};
pub use equations::{EquationSystem, Variable, assemble};
pub use error::{AssemblyError, ConfigError, Error, Result, TopologyError};
pub use flexible::{Control, FlexibleParameter};
pub use loadflow::{DenseLuSolver, LinearSolver, LoadFlowOptions, SparseLuSolver};
pub use parse::{network_from_json, read_network};
pub use phase::{Phase, Phases};
pub use projection::Projection;
pub use results::LoadFlowResults;
pub use transformer::{TransformerParameters, VectorGroup};
