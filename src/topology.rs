//! Structural validation of an element set.
//!
//! Checks id uniqueness, references and phases, then partitions buses and grounds into isolated
//! sections (connected through lines, switches and ground connections; transformers separate
//! sections) and requires exactly one potential reference per section.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use petgraph::unionfind::UnionFind;

use crate::case::{Element, ElementKind, OnConnected, RefTarget};
use crate::error::TopologyError;
use crate::phase::{Phase, Phases};

/// A galvanically isolated part of the network and its potential reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub buses: Vec<String>,
    pub grounds: Vec<String>,
    pub potential_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub sections: Vec<Section>,
    /// Ground connections dropped by the `ignore` policy.
    pub ignored_ground_connections: HashSet<String>,
}

impl Topology {
    pub fn is_ignored(&self, ground_connection: &str) -> bool {
        self.ignored_ground_connections.contains(ground_connection)
    }

    /// Index of the section holding `bus`.
    pub fn section_of_bus(&self, bus: &str) -> Option<usize> {
        self.sections
            .iter()
            .position(|s| s.buses.iter().any(|b| b == bus))
    }
}

/// Node ids: buses first, then grounds. Conductors (bus phases) are numbered separately.
struct Nodes<'a> {
    buses: HashMap<&'a str, (usize, &'a Phases)>,
    grounds: HashMap<&'a str, usize>,
    names: Vec<(ElementKind, &'a str)>,
    conductors: HashMap<(&'a str, Phase), usize>,
}

impl<'a> Nodes<'a> {
    fn new(elements: &'a [Element]) -> Self {
        let mut nodes = Nodes {
            buses: HashMap::new(),
            grounds: HashMap::new(),
            names: Vec::new(),
            conductors: HashMap::new(),
        };
        for element in elements {
            if let Element::Bus(bus) = element {
                nodes.buses.insert(&bus.id, (nodes.names.len(), &bus.phases));
                nodes.names.push((ElementKind::Bus, bus.id.as_str()));
                for phase in bus.phases.iter() {
                    let next = nodes.conductors.len();
                    nodes.conductors.entry((bus.id.as_str(), phase)).or_insert(next);
                }
            }
        }
        for element in elements {
            if let Element::Ground(ground) = element {
                nodes.grounds.insert(&ground.id, nodes.names.len());
                nodes.names.push((ElementKind::Ground, ground.id.as_str()));
            }
        }
        nodes
    }

    fn bus(&self, element: &Element, bus: &str) -> Result<(usize, &'a Phases), TopologyError> {
        self.buses
            .get(bus)
            .copied()
            .ok_or_else(|| unknown(element, ElementKind::Bus, bus))
    }

    fn ground(&self, element: &Element, ground: &str) -> Result<usize, TopologyError> {
        self.grounds
            .get(ground)
            .copied()
            .ok_or_else(|| unknown(element, ElementKind::Ground, ground))
    }

    /// Looks up `bus` and checks that it carries `phases`.
    fn bus_with(
        &self,
        element: &Element,
        bus: &str,
        phases: &Phases,
    ) -> Result<usize, TopologyError> {
        let (node, bus_phases) = self.bus(element, bus)?;
        if !phases.is_subset_of(bus_phases) {
            return Err(TopologyError::PhaseMismatch {
                kind: element.kind(),
                element: element.id().to_string(),
                bus: bus.to_string(),
                phases: phases.missing_from(bus_phases),
            });
        }
        Ok(node)
    }

    fn bus_with_phase(
        &self,
        element: &Element,
        bus: &str,
        phase: Phase,
    ) -> Result<usize, TopologyError> {
        let (node, bus_phases) = self.bus(element, bus)?;
        if !bus_phases.contains(phase) {
            return Err(TopologyError::PhaseMismatch {
                kind: element.kind(),
                element: element.id().to_string(),
                bus: bus.to_string(),
                phases: phase.to_string(),
            });
        }
        Ok(node)
    }
}

fn unknown(element: &Element, target: ElementKind, reference: &str) -> TopologyError {
    TopologyError::UnknownReference {
        kind: element.kind(),
        element: element.id().to_string(),
        target,
        reference: reference.to_string(),
    }
}

/// Validates `elements` and returns their isolated sections. Read-only.
pub fn validate(elements: &[Element]) -> Result<Topology, TopologyError> {
    let mut seen = HashSet::new();
    for element in elements {
        if !seen.insert((element.kind(), element.id())) {
            return Err(TopologyError::DuplicateId {
                kind: element.kind(),
                id: element.id().to_string(),
            });
        }
    }

    let nodes = Nodes::new(elements);
    let mut sections = UnionFind::<usize>::new(nodes.names.len());
    // switch poles join conductors, a loop needs two paths between the same conductors
    let mut poles = UnionFind::<usize>::new(nodes.conductors.len());
    let mut switch_poles: Vec<(&str, Vec<usize>)> = Vec::new();
    let mut switch_loop: Option<usize> = None;
    let mut grounded: HashSet<(&str, Phase)> = HashSet::new();
    let mut ignored = HashSet::new();
    let mut references: Vec<(&str, usize)> = Vec::new();

    for element in elements {
        match element {
            Element::Bus(_) | Element::Ground(_) => {}
            Element::GroundConnection(gc) => {
                let bus = nodes.bus_with_phase(element, &gc.bus, gc.phase)?;
                let ground = nodes.ground(element, &gc.ground)?;
                if grounded.contains(&(gc.bus.as_str(), gc.phase)) {
                    match gc.on_connected {
                        OnConnected::Raise => {
                            return Err(TopologyError::DuplicateGroundConnection {
                                element: gc.id.clone(),
                                bus: gc.bus.clone(),
                                phase: gc.phase.as_char(),
                            });
                        }
                        OnConnected::Ignore => {
                            debug!("Ignoring ground connection '{}'", gc.id);
                            ignored.insert(gc.id.clone());
                            continue;
                        }
                    }
                }
                grounded.insert((gc.bus.as_str(), gc.phase));
                sections.union(bus, ground);
            }
            Element::PotentialRef(pref) => {
                let node = match &pref.target {
                    RefTarget::Bus {
                        bus,
                        phase: Some(phase),
                    } => nodes.bus_with_phase(element, bus, *phase)?,
                    RefTarget::Bus { bus, phase: None } => nodes.bus(element, bus)?.0,
                    RefTarget::Ground(ground) => nodes.ground(element, ground)?,
                };
                references.push((pref.id.as_str(), node));
            }
            Element::Line(line) => {
                let bus1 = nodes.bus_with(element, &line.bus1, &line.phases)?;
                let bus2 = nodes.bus_with(element, &line.bus2, &line.phases)?;
                sections.union(bus1, bus2);
                match (&line.ground, line.parameters.has_shunt()) {
                    (Some(ground), true) => {
                        let ground = nodes.ground(element, ground)?;
                        sections.union(bus1, ground);
                    }
                    (Some(ground), false) => {
                        nodes.ground(element, ground)?;
                        warn!(
                            "Line '{}' has a ground but no shunt admittance; \
                             the ground is not connected",
                            line.id
                        );
                    }
                    (None, true) => return Err(TopologyError::ShuntWithoutGround(line.id.clone())),
                    (None, false) => {}
                }
            }
            Element::Transformer(tr) => {
                nodes.bus_with(element, &tr.bus1, &tr.phases1)?;
                nodes.bus_with(element, &tr.bus2, &tr.phases2)?;
            }
            Element::Switch(switch) => {
                let bus1 = nodes.bus_with(element, &switch.bus1, &switch.phases)?;
                let bus2 = nodes.bus_with(element, &switch.bus2, &switch.phases)?;
                sections.union(bus1, bus2);
                let mut joined = Vec::with_capacity(switch.phases.len());
                for phase in switch.phases.iter() {
                    let (Some(&c1), Some(&c2)) = (
                        nodes.conductors.get(&(switch.bus1.as_str(), phase)),
                        nodes.conductors.get(&(switch.bus2.as_str(), phase)),
                    ) else {
                        continue;
                    };
                    if !poles.union(c1, c2) && switch_loop.is_none() {
                        switch_loop = Some(c1);
                    }
                    joined.push(c1);
                }
                switch_poles.push((switch.id.as_str(), joined));
            }
            Element::Source(source) => {
                nodes.bus_with(element, &source.bus, &source.phases)?;
            }
            Element::Load(load) => {
                nodes.bus_with(element, &load.bus, &load.phases)?;
            }
        }
    }

    if let Some(conductor) = switch_loop {
        let root = poles.find(conductor);
        let members = switch_poles
            .iter()
            .filter(|(_, joined)| joined.iter().any(|&c| poles.find(c) == root))
            .map(|&(id, _)| id.to_string())
            .collect();
        return Err(TopologyError::SwitchLoop(members));
    }

    // Group nodes by section in order of first appearance.
    let mut order: Vec<usize> = Vec::new();
    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for node in 0..nodes.names.len() {
        let root = sections.find(node);
        members
            .entry(root)
            .or_insert_with(|| {
                order.push(root);
                Vec::new()
            })
            .push(node);
    }

    let mut result = Vec::with_capacity(order.len());
    for root in order {
        let mut buses = Vec::new();
        let mut grounds = Vec::new();
        for &node in &members[&root] {
            match nodes.names[node] {
                (ElementKind::Bus, id) => buses.push(id.to_string()),
                (_, id) => grounds.push(id.to_string()),
            }
        }
        let refs: Vec<String> = references
            .iter()
            .filter(|&&(_, node)| sections.find(node) == root)
            .map(|&(id, _)| id.to_string())
            .collect();
        match refs.len() {
            0 => return Err(TopologyError::MissingPotentialRef { buses, grounds }),
            1 => result.push(Section {
                buses,
                grounds,
                potential_ref: refs[0].clone(),
            }),
            _ => {
                return Err(TopologyError::MultiplePotentialRefs {
                    buses,
                    grounds,
                    refs,
                });
            }
        }
    }

    debug!("Found {:>6} isolated sections", result.len());
    Ok(Topology {
        sections: result,
        ignored_ground_connections: ignored,
    })
}
