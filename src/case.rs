use std::collections::HashMap;
use std::fmt;

use log::info;
use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TopologyError};
use crate::flexible::FlexibleParameter;
use crate::phase::{Phase, Phases};
use crate::topology::{self, Topology};
use crate::transformer::{TransformerParameters, WindingLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Bus,
    Ground,
    GroundConnection,
    PotentialRef,
    Line,
    Transformer,
    Switch,
    Source,
    Load,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Bus => write!(f, "bus"),
            ElementKind::Ground => write!(f, "ground"),
            ElementKind::GroundConnection => write!(f, "ground connection"),
            ElementKind::PotentialRef => write!(f, "potential reference"),
            ElementKind::Line => write!(f, "line"),
            ElementKind::Transformer => write!(f, "transformer"),
            ElementKind::Switch => write!(f, "switch"),
            ElementKind::Source => write!(f, "source"),
            ElementKind::Load => write!(f, "load"),
        }
    }
}

/// Identity of an element: ids are unique within their kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementKey {
    pub kind: ElementKind,
    pub id: String,
}

impl ElementKey {
    pub fn new(kind: ElementKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bus {
    pub id: String,
    pub phases: Phases,

    // Limits, used for violation reporting only
    pub min_voltage: Option<f64>,
    pub max_voltage: Option<f64>,

    // Starting point of the outer loop, one value per phase
    pub initial_potentials: Option<Vec<Complex64>>,
}

impl Bus {
    pub fn new(id: impl Into<String>, phases: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            id: id.into(),
            phases: Phases::parse(phases)?,
            min_voltage: None,
            max_voltage: None,
            initial_potentials: None,
        })
    }

    pub fn with_voltage_limits(
        mut self,
        min_voltage: Option<f64>,
        max_voltage: Option<f64>,
    ) -> Self {
        self.min_voltage = min_voltage;
        self.max_voltage = max_voltage;
        self
    }

    pub fn with_initial_potentials(
        mut self,
        potentials: Vec<Complex64>,
    ) -> Result<Self, ConfigError> {
        check_count(&self.id, self.phases.len(), potentials.len())?;
        self.initial_potentials = Some(potentials);
        Ok(self)
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus {:<16} phases={:<4}", self.id, self.phases)?;
        if let (Some(lo), Some(hi)) = (self.min_voltage, self.max_voltage) {
            write!(f, "  limits=[{lo:.1}, {hi:.1}] V")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ground {
    pub id: String,
}

impl Ground {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// What to do when a ground connection lands on an already grounded bus phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConnected {
    #[default]
    Raise,
    Ignore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundConnection {
    pub id: String,
    pub ground: String,
    pub bus: String,
    pub phase: Phase,
    pub impedance: Complex64,
    pub on_connected: OnConnected,
}

impl GroundConnection {
    pub fn new(
        id: impl Into<String>,
        ground: impl Into<String>,
        bus: impl Into<String>,
        phase: Phase,
    ) -> Self {
        Self {
            id: id.into(),
            ground: ground.into(),
            bus: bus.into(),
            phase,
            impedance: Complex64::new(0.0, 0.0),
            on_connected: OnConnected::Raise,
        }
    }

    pub fn with_impedance(mut self, impedance: Complex64) -> Self {
        self.impedance = impedance;
        self
    }

    pub fn on_connected(mut self, policy: OnConnected) -> Self {
        self.on_connected = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefTarget {
    /// A single phase of a bus, or the sum of all its phase potentials when `phase` is `None`.
    Bus { bus: String, phase: Option<Phase> },
    Ground(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PotentialRef {
    pub id: String,
    pub target: RefTarget,
}

impl PotentialRef {
    pub fn on_bus(id: impl Into<String>, bus: impl Into<String>, phase: Option<Phase>) -> Self {
        Self {
            id: id.into(),
            target: RefTarget::Bus {
                bus: bus.into(),
                phase,
            },
        }
    }

    pub fn on_ground(id: impl Into<String>, ground: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: RefTarget::Ground(ground.into()),
        }
    }
}

/// Per-kilometre line parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LineParameters {
    pub id: String,
    /// Series impedance matrix (Ω/km), off-diagonal terms are mutual couplings.
    pub z_line: DMatrix<Complex64>,
    /// Shunt admittance matrix (S/km).
    pub y_shunt: Option<DMatrix<Complex64>>,
}

impl LineParameters {
    pub fn new(
        id: impl Into<String>,
        z_line: DMatrix<Complex64>,
        y_shunt: Option<DMatrix<Complex64>>,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        if !z_line.is_square() || z_line.nrows() == 0 {
            return Err(ConfigError::InvalidParameter {
                element: id,
                message: format!(
                    "z_line must be square, got {}x{}",
                    z_line.nrows(),
                    z_line.ncols()
                ),
            });
        }
        if let Some(y) = &y_shunt {
            if y.shape() != z_line.shape() {
                return Err(ConfigError::InvalidParameter {
                    element: id,
                    message: format!(
                        "y_shunt must have the shape of z_line ({}x{}), got {}x{}",
                        z_line.nrows(),
                        z_line.ncols(),
                        y.nrows(),
                        y.ncols()
                    ),
                });
            }
        }
        Ok(Self { id, z_line, y_shunt })
    }

    pub fn size(&self) -> usize {
        self.z_line.nrows()
    }

    pub fn has_shunt(&self) -> bool {
        self.y_shunt
            .as_ref()
            .is_some_and(|y| y.iter().any(|v| v.norm() > 0.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub id: String,
    pub bus1: String,
    pub bus2: String,
    pub phases: Phases,
    pub parameters: LineParameters,
    /// Length in km.
    pub length: f64,
    pub ground: Option<String>,
}

impl Line {
    pub fn new(
        id: impl Into<String>,
        bus1: impl Into<String>,
        bus2: impl Into<String>,
        phases: &str,
        parameters: LineParameters,
        length: f64,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let phases = Phases::parse(phases)?;
        if parameters.size() != phases.len() {
            return Err(ConfigError::InvalidParameter {
                element: id,
                message: format!(
                    "parameters '{}' are {}-phase but the line has phases '{phases}'",
                    parameters.id,
                    parameters.size()
                ),
            });
        }
        if !(length.is_finite() && length > 0.0) {
            return Err(ConfigError::InvalidParameter {
                element: id,
                message: format!("length must be strictly positive, got {length}"),
            });
        }
        Ok(Self {
            id,
            bus1: bus1.into(),
            bus2: bus2.into(),
            phases,
            parameters,
            length,
            ground: None,
        })
    }

    pub fn with_ground(mut self, ground: impl Into<String>) -> Self {
        self.ground = Some(ground.into());
        self
    }

    /// Total series impedance.
    pub fn z(&self) -> DMatrix<Complex64> {
        &self.parameters.z_line * Complex64::new(self.length, 0.0)
    }

    /// Total shunt admittance, `None` when the line has no (or a zero) shunt.
    pub fn y(&self) -> Option<DMatrix<Complex64>> {
        if !self.parameters.has_shunt() {
            return None;
        }
        self.parameters
            .y_shunt
            .as_ref()
            .map(|y| y * Complex64::new(self.length, 0.0))
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Line {:<16} {:>8} -> {:<8} phases={:<4} params={:<12} length={:.3} km",
            self.id, self.bus1, self.bus2, self.phases, self.parameters.id, self.length
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transformer {
    pub id: String,
    pub bus1: String,
    pub bus2: String,
    pub phases1: Phases,
    pub phases2: Phases,
    pub parameters: TransformerParameters,
    pub tap: f64,
    pub(crate) layout: WindingLayout,
}

impl Transformer {
    /// Transformer on the vector group's default phases (`abc` or `abcn` on each side).
    pub fn new(
        id: impl Into<String>,
        bus1: impl Into<String>,
        bus2: impl Into<String>,
        parameters: TransformerParameters,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let (phases1, phases2) =
            parameters
                .default_phases()
                .ok_or_else(|| ConfigError::InvalidParameter {
                    element: id.clone(),
                    message: format!(
                        "vector group {} needs explicit phases on both sides",
                        parameters.vg
                    ),
                })?;
        Self::build(id, bus1.into(), bus2.into(), phases1, phases2, parameters, 1.0)
    }

    /// Transformer on explicit phases, required for single-phase vector groups.
    pub fn on_phases(
        id: impl Into<String>,
        bus1: impl Into<String>,
        bus2: impl Into<String>,
        parameters: TransformerParameters,
        phases1: &str,
        phases2: &str,
    ) -> Result<Self, ConfigError> {
        let phases1 = Phases::parse(phases1)?;
        let phases2 = Phases::parse(phases2)?;
        Self::build(id.into(), bus1.into(), bus2.into(), phases1, phases2, parameters, 1.0)
    }

    pub fn with_phases(self, phases1: &str, phases2: &str) -> Result<Self, ConfigError> {
        let phases1 = Phases::parse(phases1)?;
        let phases2 = Phases::parse(phases2)?;
        Self::build(self.id, self.bus1, self.bus2, phases1, phases2, self.parameters, self.tap)
    }

    pub fn with_tap(self, tap: f64) -> Result<Self, ConfigError> {
        if !(tap.is_finite() && tap > 0.0) {
            return Err(ConfigError::InvalidParameter {
                element: self.id,
                message: format!("tap must be strictly positive, got {tap}"),
            });
        }
        Self::build(self.id, self.bus1, self.bus2, self.phases1, self.phases2, self.parameters, tap)
    }

    fn build(
        id: String,
        bus1: String,
        bus2: String,
        phases1: Phases,
        phases2: Phases,
        parameters: TransformerParameters,
        tap: f64,
    ) -> Result<Self, ConfigError> {
        let layout = parameters
            .layout(&phases1, &phases2, tap)
            .map_err(|e| match e {
                ConfigError::InvalidParameter { message, .. } => ConfigError::InvalidParameter {
                    element: id.clone(),
                    message,
                },
                other => other,
            })?;
        Ok(Self {
            id,
            bus1,
            bus2,
            phases1,
            phases2,
            parameters,
            tap,
            layout,
        })
    }
}

impl fmt::Display for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Xfmr {:<16} {:>8} -> {:<8} {:<6} Sn={:>8.1} kVA  {:.0}/{:.0} V  Tap={:.4}",
            self.id,
            self.bus1,
            self.bus2,
            self.parameters.vg,
            self.parameters.sn / 1e3,
            self.parameters.uhv,
            self.parameters.ulv,
            self.tap,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Switch {
    pub id: String,
    pub bus1: String,
    pub bus2: String,
    pub phases: Phases,
}

impl Switch {
    pub fn new(
        id: impl Into<String>,
        bus1: impl Into<String>,
        bus2: impl Into<String>,
        phases: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            id: id.into(),
            bus1: bus1.into(),
            bus2: bus2.into(),
            phases: Phases::parse(phases)?,
        })
    }
}

/// Two-terminal branches of a source or load connected on `phases`.
///
/// Star connections (with `n`) give one `(p, n)` branch per phase. Delta connections give the
/// closed triangle `ab, bc, ca` for three phases, or the open chain `ab, bc` when `closed` is
/// false, and the single pair for two phases.
pub(crate) fn terminal_branches(phases: &Phases, closed: bool) -> Vec<(Phase, Phase)> {
    let p = phases.as_slice();
    if phases.has_neutral() {
        return phases.non_neutral().map(|ph| (ph, Phase::N)).collect();
    }
    match p.len() {
        3 if closed => vec![(p[0], p[1]), (p[1], p[2]), (p[2], p[0])],
        3 => vec![(p[0], p[1]), (p[1], p[2])],
        2 => vec![(p[0], p[1])],
        _ => Vec::new(),
    }
}

/// Number of configured values (voltages, powers...) a terminal element on `phases` takes.
fn terminal_values(element: &str, phases: &Phases) -> Result<usize, ConfigError> {
    let count = if phases.has_neutral() {
        phases.len() - 1
    } else if phases.len() == 3 {
        3
    } else if phases.len() == 2 {
        1
    } else {
        0
    };
    if count == 0 {
        return Err(ConfigError::InvalidPhases {
            phases: phases.to_string(),
            reason: format!("'{element}' needs two distinct conductors"),
        });
    }
    Ok(count)
}

fn check_count(element: &str, expected: usize, got: usize) -> Result<(), ConfigError> {
    if expected != got {
        return Err(ConfigError::ValueCount {
            element: element.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoltageSource {
    pub id: String,
    pub bus: String,
    pub phases: Phases,
    /// Phase-to-neutral voltages (star) or phase-to-phase voltages `ab, bc, ca` (delta).
    pub voltages: Vec<Complex64>,
}

impl VoltageSource {
    pub fn new(
        id: impl Into<String>,
        bus: impl Into<String>,
        phases: &str,
        voltages: Vec<Complex64>,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let phases = Phases::parse(phases)?;
        let expected = terminal_values(&id, &phases)?;
        check_count(&id, expected, voltages.len())?;
        Ok(Self {
            id,
            bus: bus.into(),
            phases,
            voltages,
        })
    }

    pub fn is_delta(&self) -> bool {
        !self.phases.has_neutral()
    }

    pub(crate) fn branches(&self) -> Vec<(Phase, Phase)> {
        terminal_branches(&self.phases, false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadModel {
    /// Constant power (VA) per branch.
    Power(Vec<Complex64>),
    /// Constant current (A) per branch.
    Current(Vec<Complex64>),
    /// Constant impedance (Ω) per branch.
    Impedance(Vec<Complex64>),
    /// Theoretical power per branch, adjusted by its control at every outer iteration.
    Flexible {
        powers: Vec<Complex64>,
        parameters: Vec<FlexibleParameter>,
    },
}

impl LoadModel {
    pub fn name(&self) -> &'static str {
        match self {
            LoadModel::Power(_) => "power",
            LoadModel::Current(_) => "current",
            LoadModel::Impedance(_) => "impedance",
            LoadModel::Flexible { .. } => "flexible",
        }
    }

    pub fn values(&self) -> &[Complex64] {
        match self {
            LoadModel::Power(v) | LoadModel::Current(v) | LoadModel::Impedance(v) => v,
            LoadModel::Flexible { powers, .. } => powers,
        }
    }

    /// Whether the load's equations depend on the previous potentials.
    pub fn is_voltage_dependent(&self) -> bool {
        matches!(self, LoadModel::Power(_) | LoadModel::Flexible { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Load {
    pub id: String,
    pub bus: String,
    pub phases: Phases,
    pub model: LoadModel,
}

impl Load {
    pub fn power(
        id: impl Into<String>,
        bus: impl Into<String>,
        phases: &str,
        powers: Vec<Complex64>,
    ) -> Result<Self, ConfigError> {
        Self::build(id.into(), bus.into(), phases, LoadModel::Power(powers))
    }

    pub fn current(
        id: impl Into<String>,
        bus: impl Into<String>,
        phases: &str,
        currents: Vec<Complex64>,
    ) -> Result<Self, ConfigError> {
        Self::build(id.into(), bus.into(), phases, LoadModel::Current(currents))
    }

    pub fn impedance(
        id: impl Into<String>,
        bus: impl Into<String>,
        phases: &str,
        impedances: Vec<Complex64>,
    ) -> Result<Self, ConfigError> {
        Self::build(id.into(), bus.into(), phases, LoadModel::Impedance(impedances))
    }

    pub fn flexible(
        id: impl Into<String>,
        bus: impl Into<String>,
        phases: &str,
        powers: Vec<Complex64>,
        parameters: Vec<FlexibleParameter>,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        check_count(&id, powers.len(), parameters.len())?;
        for (power, parameter) in powers.iter().zip(&parameters) {
            parameter.check_power(&id, *power)?;
        }
        Self::build(id, bus.into(), phases, LoadModel::Flexible { powers, parameters })
    }

    fn build(id: String, bus: String, phases: &str, model: LoadModel) -> Result<Self, ConfigError> {
        let phases = Phases::parse(phases)?;
        let expected = terminal_values(&id, &phases)?;
        check_count(&id, expected, model.values().len())?;
        Ok(Self {
            id,
            bus,
            phases,
            model,
        })
    }

    pub fn is_flexible(&self) -> bool {
        matches!(self.model, LoadModel::Flexible { .. })
    }

    pub(crate) fn branches(&self) -> Vec<(Phase, Phase)> {
        terminal_branches(&self.phases, true)
    }
}

impl fmt::Display for Load {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: Complex64 = self.model.values().iter().sum();
        write!(
            f,
            "Load {:<16} Bus {:<8} phases={:<4} {:<9}",
            self.id,
            self.bus,
            self.phases,
            self.model.name()
        )?;
        if matches!(self.model, LoadModel::Power(_) | LoadModel::Flexible { .. }) {
            write!(f, " P={:>10.3} kW  Q={:>10.3} kVAr", total.re / 1e3, total.im / 1e3)?;
        }
        Ok(())
    }
}

/// Closed set of network elements.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Bus(Bus),
    Ground(Ground),
    GroundConnection(GroundConnection),
    PotentialRef(PotentialRef),
    Line(Line),
    Transformer(Transformer),
    Switch(Switch),
    Source(VoltageSource),
    Load(Load),
}

impl Element {
    pub fn kind(&self) -> ElementKind {
        match self {
            Element::Bus(_) => ElementKind::Bus,
            Element::Ground(_) => ElementKind::Ground,
            Element::GroundConnection(_) => ElementKind::GroundConnection,
            Element::PotentialRef(_) => ElementKind::PotentialRef,
            Element::Line(_) => ElementKind::Line,
            Element::Transformer(_) => ElementKind::Transformer,
            Element::Switch(_) => ElementKind::Switch,
            Element::Source(_) => ElementKind::Source,
            Element::Load(_) => ElementKind::Load,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Element::Bus(e) => &e.id,
            Element::Ground(e) => &e.id,
            Element::GroundConnection(e) => &e.id,
            Element::PotentialRef(e) => &e.id,
            Element::Line(e) => &e.id,
            Element::Transformer(e) => &e.id,
            Element::Switch(e) => &e.id,
            Element::Source(e) => &e.id,
            Element::Load(e) => &e.id,
        }
    }

    pub fn key(&self) -> ElementKey {
        ElementKey::new(self.kind(), self.id())
    }
}

impl From<Bus> for Element {
    fn from(e: Bus) -> Self {
        Element::Bus(e)
    }
}

impl From<Ground> for Element {
    fn from(e: Ground) -> Self {
        Element::Ground(e)
    }
}

impl From<GroundConnection> for Element {
    fn from(e: GroundConnection) -> Self {
        Element::GroundConnection(e)
    }
}

impl From<PotentialRef> for Element {
    fn from(e: PotentialRef) -> Self {
        Element::PotentialRef(e)
    }
}

impl From<Line> for Element {
    fn from(e: Line) -> Self {
        Element::Line(e)
    }
}

impl From<Transformer> for Element {
    fn from(e: Transformer) -> Self {
        Element::Transformer(e)
    }
}

impl From<Switch> for Element {
    fn from(e: Switch) -> Self {
        Element::Switch(e)
    }
}

impl From<VoltageSource> for Element {
    fn from(e: VoltageSource) -> Self {
        Element::Source(e)
    }
}

impl From<Load> for Element {
    fn from(e: Load) -> Self {
        Element::Load(e)
    }
}

/// A validated network: every element references existing buses and phases, and every isolated
/// section carries exactly one potential reference.
#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    elements: Vec<Element>,
    bus_map: HashMap<String, usize>,    // bus id -> element index
    ground_map: HashMap<String, usize>, // ground id -> element index
    topology: Topology,
}

impl Network {
    pub fn new(name: impl Into<String>, elements: Vec<Element>) -> Result<Self, TopologyError> {
        let topology = topology::validate(&elements)?;
        let mut network = Self {
            name: name.into(),
            elements,
            bus_map: HashMap::new(),
            ground_map: HashMap::new(),
            topology,
        };
        network.rebuild_maps();
        info!(
            "Network '{}': {} elements, {} buses, {} isolated sections",
            network.name,
            network.elements.len(),
            network.bus_map.len(),
            network.topology.sections.len()
        );
        Ok(network)
    }

    /// Attaches an element. The network is left unchanged when the result fails validation.
    pub fn add(&mut self, element: impl Into<Element>) -> Result<(), TopologyError> {
        self.elements.push(element.into());
        match topology::validate(&self.elements) {
            Ok(topology) => {
                self.topology = topology;
                self.rebuild_maps();
                Ok(())
            }
            Err(e) => {
                self.elements.pop();
                Err(e)
            }
        }
    }

    /// Detaches an element. The network is left unchanged when the result fails validation, e.g.
    /// when removing a section's only potential reference.
    pub fn remove(&mut self, kind: ElementKind, id: &str) -> Result<Element, TopologyError> {
        let position = self
            .elements
            .iter()
            .position(|e| e.kind() == kind && e.id() == id)
            .ok_or_else(|| TopologyError::UnknownElement {
                kind,
                id: id.to_string(),
            })?;
        let element = self.elements.remove(position);
        match topology::validate(&self.elements) {
            Ok(topology) => {
                self.topology = topology;
                self.rebuild_maps();
                Ok(element)
            }
            Err(e) => {
                self.elements.insert(position, element);
                Err(e)
            }
        }
    }

    /// Rebuild the id lookups (must be called after any element change)
    fn rebuild_maps(&mut self) {
        self.bus_map.clear();
        self.ground_map.clear();
        for (idx, element) in self.elements.iter().enumerate() {
            match element {
                Element::Bus(bus) => {
                    self.bus_map.insert(bus.id.clone(), idx);
                }
                Element::Ground(ground) => {
                    self.ground_map.insert(ground.id.clone(), idx);
                }
                _ => {}
            }
        }
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn element(&self, kind: ElementKind, id: &str) -> Option<&Element> {
        self.elements
            .iter()
            .find(|e| e.kind() == kind && e.id() == id)
    }

    pub fn bus(&self, id: &str) -> Option<&Bus> {
        match self.bus_map.get(id).map(|&idx| &self.elements[idx]) {
            Some(Element::Bus(bus)) => Some(bus),
            _ => None,
        }
    }

    pub fn has_ground(&self, id: &str) -> bool {
        self.ground_map.contains_key(id)
    }

    pub fn buses(&self) -> impl Iterator<Item = &Bus> {
        self.elements.iter().filter_map(|e| match e {
            Element::Bus(bus) => Some(bus),
            _ => None,
        })
    }

    pub fn grounds(&self) -> impl Iterator<Item = &Ground> {
        self.elements.iter().filter_map(|e| match e {
            Element::Ground(ground) => Some(ground),
            _ => None,
        })
    }

    pub fn loads(&self) -> impl Iterator<Item = &Load> {
        self.elements.iter().filter_map(|e| match e {
            Element::Load(load) => Some(load),
            _ => None,
        })
    }

    pub fn sources(&self) -> impl Iterator<Item = &VoltageSource> {
        self.elements.iter().filter_map(|e| match e {
            Element::Source(source) => Some(source),
            _ => None,
        })
    }

    fn count(&self, kind: ElementKind) -> usize {
        self.elements.iter().filter(|e| e.kind() == kind).count()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Network: {}", self.name)?;
        writeln!(
            f,
            "{} buses, {} grounds, {} lines, {} transformers, {} switches, {} sources, {} loads, \
             {} isolated sections\n",
            self.count(ElementKind::Bus),
            self.count(ElementKind::Ground),
            self.count(ElementKind::Line),
            self.count(ElementKind::Transformer),
            self.count(ElementKind::Switch),
            self.count(ElementKind::Source),
            self.count(ElementKind::Load),
            self.topology.sections.len(),
        )?;

        writeln!(f, "=== Buses ===")?;
        for bus in self.buses() {
            writeln!(f, "  {}", bus)?;
        }

        writeln!(f, "\n=== Branches ===")?;
        for element in &self.elements {
            match element {
                Element::Line(line) => writeln!(f, "  {}", line)?,
                Element::Transformer(transformer) => writeln!(f, "  {}", transformer)?,
                Element::Switch(switch) => writeln!(
                    f,
                    "  Switch {:<14} {:>8} -> {:<8} phases={}",
                    switch.id, switch.bus1, switch.bus2, switch.phases
                )?,
                _ => {}
            }
        }

        writeln!(f, "\n=== Loads ===")?;
        for load in self.loads() {
            writeln!(f, "  {}", load)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flexible::FlexibleParameter;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn simple_network() -> Network {
        Network::new(
            "simple",
            vec![
                Bus::new("b1", "abcn").unwrap().into(),
                Bus::new("b2", "abcn").unwrap().into(),
                VoltageSource::new("src", "b1", "abcn", vec![c(230.0, 0.0); 3])
                    .unwrap()
                    .into(),
                Switch::new("sw", "b1", "b2", "abcn").unwrap().into(),
                PotentialRef::on_bus("pref", "b1", Some(Phase::N)).into(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn terminal_branches_follow_connection() {
        let star = Phases::parse("abcn").unwrap();
        assert_eq!(
            terminal_branches(&star, true),
            vec![(Phase::A, Phase::N), (Phase::B, Phase::N), (Phase::C, Phase::N)]
        );
        let delta = Phases::parse("abc").unwrap();
        assert_eq!(terminal_branches(&delta, true).len(), 3);
        assert_eq!(terminal_branches(&delta, true)[2], (Phase::C, Phase::A));
        assert_eq!(terminal_branches(&delta, false).len(), 2);
        let pair = Phases::parse("bc").unwrap();
        assert_eq!(terminal_branches(&pair, true), vec![(Phase::B, Phase::C)]);
    }

    #[test]
    fn value_counts_are_checked() {
        assert!(Load::power("l", "b", "abcn", vec![c(1.0, 0.0); 3]).is_ok());
        assert!(Load::power("l", "b", "abc", vec![c(1.0, 0.0); 3]).is_ok());
        assert!(Load::power("l", "b", "ab", vec![c(1.0, 0.0)]).is_ok());
        assert!(matches!(
            Load::current("l", "b", "an", vec![c(1.0, 0.0); 2]),
            Err(ConfigError::ValueCount {
                expected: 1,
                got: 2,
                ..
            })
        ));
        assert!(matches!(
            VoltageSource::new("s", "b", "n", vec![]),
            Err(ConfigError::InvalidPhases { .. })
        ));
        assert!(VoltageSource::new("s", "b", "a", vec![c(1.0, 0.0)]).is_err());
        let src = VoltageSource::new("s", "b", "abc", vec![c(400.0, 0.0); 3]).unwrap();
        assert!(src.is_delta());
        assert_eq!(src.branches().len(), 2);
    }

    #[test]
    fn flexible_load_checks_power_sign() {
        let production = FlexibleParameter::p_max_u_production(245.0, 250.0, 5000.0).unwrap();
        assert!(
            Load::flexible("pv", "b", "an", vec![c(-3000.0, 0.0)], vec![production.clone()])
                .is_ok()
        );
        assert!(
            Load::flexible("pv", "b", "an", vec![c(3000.0, 0.0)], vec![production.clone()])
                .is_err()
        );
        assert!(
            Load::flexible("pv", "b", "abcn", vec![c(-3000.0, 0.0); 3], vec![production]).is_err()
        );
    }

    #[test]
    fn line_parameters_shape_is_checked() {
        let z = DMatrix::from_element(2, 2, c(0.1, 0.05));
        let params = LineParameters::new("lp", z.clone(), None).unwrap();
        assert!(!params.has_shunt());
        assert!(Line::new("l", "b1", "b2", "abc", params.clone(), 1.0).is_err());
        let line = Line::new("l", "b1", "b2", "an", params.clone(), 2.0).unwrap();
        assert_eq!(line.z()[(0, 0)], c(0.2, 0.1));
        assert!(line.y().is_none());
        assert!(Line::new("l", "b1", "b2", "an", params, 0.0).is_err());

        let y = DMatrix::from_element(3, 3, c(0.0, 1e-6));
        assert!(LineParameters::new("lp", z, Some(y)).is_err());

        let zero = DMatrix::from_element(2, 2, c(0.0, 0.0));
        let params = LineParameters::new("lp", zero.clone(), Some(zero)).unwrap();
        assert!(!params.has_shunt());
    }

    #[test]
    fn transformer_phases_default_from_vector_group() {
        let params = TransformerParameters::new(
            "tp",
            "Dyn11",
            100e3,
            20e3,
            400.0,
            c(0.02, 0.06),
            c(1e-7, -1e-6),
        )
        .unwrap();
        let tr = Transformer::new("tr", "hv", "lv", params).unwrap();
        assert_eq!(tr.phases1.to_string(), "abc");
        assert_eq!(tr.phases2.to_string(), "abcn");
        assert!(tr.clone().with_tap(0.0).is_err());
        let tapped = tr.with_tap(1.025).unwrap();
        assert_eq!(tapped.tap, 1.025);

        let single = TransformerParameters::new(
            "tp1",
            "Ii0",
            50e3,
            20e3,
            230.0,
            c(0.02, 0.06),
            c(0.0, 0.0),
        )
        .unwrap();
        assert!(Transformer::new("t1", "hv", "lv", single.clone()).is_err());
    }

    #[test]
    fn add_rolls_back_on_failure() {
        let mut network = simple_network();
        let before = network.elements().len();

        // second reference on the same section
        let err = network
            .add(PotentialRef::on_bus("pref2", "b2", None))
            .unwrap_err();
        assert!(matches!(err, TopologyError::MultiplePotentialRefs { .. }));
        assert_eq!(network.elements().len(), before);

        network
            .add(Load::power("load", "b2", "abcn", vec![c(1000.0, 0.0); 3]).unwrap())
            .unwrap();
        assert_eq!(network.loads().count(), 1);
    }

    #[test]
    fn remove_rolls_back_on_failure() {
        let mut network = simple_network();
        let err = network.remove(ElementKind::PotentialRef, "pref").unwrap_err();
        assert!(matches!(err, TopologyError::MissingPotentialRef { .. }));
        assert!(network.element(ElementKind::PotentialRef, "pref").is_some());

        assert!(matches!(
            network.remove(ElementKind::Line, "nope"),
            Err(TopologyError::UnknownElement { .. })
        ));

        // splitting the section leaves b2 without a reference
        assert!(network.remove(ElementKind::Switch, "sw").is_err());
        assert!(network.element(ElementKind::Switch, "sw").is_some());

        let removed = network.remove(ElementKind::Source, "src").unwrap();
        assert_eq!(removed.kind(), ElementKind::Source);
        assert_eq!(network.sources().count(), 0);
    }

    #[test]
    fn network_summary_lists_elements() {
        let network = simple_network();
        let summary = network.to_string();
        assert!(summary.contains("2 buses"));
        assert!(summary.contains("1 isolated sections"));
        assert!(summary.contains("Switch sw"));
        assert_eq!(network.bus("b2").map(|b| b.phases.len()), Some(4));
        assert!(network.bus("src").is_none());
    }
}
