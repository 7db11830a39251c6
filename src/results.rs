//! Load flow results: potentials, currents and powers per element.
//!
//! Powers at a terminal are `V * conj(I)` with `I` the current leaving the bus into the element,
//! so loads report positive consumed power and sources negative power.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use num_complex::Complex64;
use serde::Serialize;

use crate::case::{Element, ElementKey, Network, terminal_branches};
use crate::equations::{CurrentRole, EquationSystem, Side, Variable};
use crate::error::{AssemblyError, Error, Result};
use crate::phase::{Phase, Phases};

#[derive(Debug, Clone, Serialize)]
pub struct BusResult {
    pub phases: Phases,
    pub potentials: Vec<Complex64>,
    /// Magnitudes of the phase-to-neutral voltages, or phase-to-phase when the bus has no neutral.
    pub voltages: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchResult {
    pub phases1: Phases,
    pub phases2: Phases,
    pub currents1: Vec<Complex64>,
    pub currents2: Vec<Complex64>,
    pub powers1: Vec<Complex64>,
    pub powers2: Vec<Complex64>,
}

impl BranchResult {
    /// Series losses: power entering at both ends.
    pub fn losses(&self) -> Complex64 {
        self.powers1.iter().chain(&self.powers2).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalResult {
    pub phases: Phases,
    pub potentials: Vec<Complex64>,
    pub currents: Vec<Complex64>,
    pub powers: Vec<Complex64>,
    /// Post-projection power of each branch, flexible loads only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flexible_powers: Option<Vec<Complex64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Under,
    Over,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoltageViolation {
    pub bus: String,
    /// Conductors the voltage is measured between, e.g. `an` or `ab`.
    pub between: String,
    pub voltage: f64,
    pub limit: f64,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadFlowResults {
    pub iterations: usize,
    /// Potential change of the last outer iteration (V).
    pub distance: f64,
    pub buses: BTreeMap<String, BusResult>,
    pub grounds: BTreeMap<String, Complex64>,
    pub lines: BTreeMap<String, BranchResult>,
    pub transformers: BTreeMap<String, BranchResult>,
    pub switches: BTreeMap<String, BranchResult>,
    pub sources: BTreeMap<String, TerminalResult>,
    pub loads: BTreeMap<String, TerminalResult>,
    pub ground_connections: BTreeMap<String, Complex64>,
    pub potential_refs: BTreeMap<String, Complex64>,
    pub violations: Vec<VoltageViolation>,
}

impl LoadFlowResults {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

struct Reader<'a> {
    system: &'a EquationSystem,
    x: &'a [Complex64],
}

impl Reader<'_> {
    fn get(&self, variable: Variable) -> Result<Complex64> {
        self.system
            .index_of(&variable)
            .map(|idx| self.x[idx])
            .ok_or_else(|| Error::from(AssemblyError::UnknownVariable(variable.to_string())))
    }

    fn potential(&self, bus: &str, phase: Phase) -> Result<Complex64> {
        self.get(Variable::BusPotential {
            bus: bus.to_string(),
            phase,
        })
    }

    fn potentials(&self, bus: &str, phases: &Phases) -> Result<Vec<Complex64>> {
        phases.iter().map(|p| self.potential(bus, p)).collect()
    }

    fn current(&self, owner: &ElementKey, role: CurrentRole) -> Result<Complex64> {
        self.get(Variable::Current {
            owner: owner.clone(),
            role,
        })
    }

    fn terminal_currents(
        &self,
        owner: &ElementKey,
        side: Side,
        phases: &Phases,
    ) -> Result<Vec<Complex64>> {
        phases
            .iter()
            .map(|phase| self.current(owner, CurrentRole::Terminal { side, phase }))
            .collect()
    }

    fn branch(
        &self,
        owner: &ElementKey,
        (bus1, phases1): (&str, &Phases),
        (bus2, phases2): (&str, &Phases),
    ) -> Result<BranchResult> {
        let v1 = self.potentials(bus1, phases1)?;
        let v2 = self.potentials(bus2, phases2)?;
        let currents1 = self.terminal_currents(owner, Side::One, phases1)?;
        let currents2 = self.terminal_currents(owner, Side::Two, phases2)?;
        Ok(BranchResult {
            phases1: phases1.clone(),
            phases2: phases2.clone(),
            powers1: powers(&v1, &currents1),
            powers2: powers(&v2, &currents2),
            currents1,
            currents2,
        })
    }

    fn terminal(&self, owner: &ElementKey, bus: &str, phases: &Phases) -> Result<TerminalResult> {
        let potentials = self.potentials(bus, phases)?;
        let currents = self.terminal_currents(owner, Side::One, phases)?;
        Ok(TerminalResult {
            phases: phases.clone(),
            powers: powers(&potentials, &currents),
            potentials,
            currents,
            flexible_powers: None,
        })
    }
}

fn powers(potentials: &[Complex64], currents: &[Complex64]) -> Vec<Complex64> {
    potentials
        .iter()
        .zip(currents)
        .map(|(v, i)| v * i.conj())
        .collect()
}

/// Voltages reported for a bus: `(between, magnitude)`.
fn bus_voltages(phases: &Phases, potentials: &[Complex64]) -> Vec<(String, f64)> {
    let value = |p: Phase| {
        phases
            .position(p)
            .and_then(|k| potentials.get(k))
            .copied()
            .unwrap_or_default()
    };
    terminal_branches(phases, true)
        .into_iter()
        .map(|(from, to)| (format!("{from}{to}"), (value(from) - value(to)).norm()))
        .collect()
}

pub(crate) fn collect(
    network: &Network,
    system: &EquationSystem,
    x: &[Complex64],
    flexible_powers: &HashMap<String, Vec<Complex64>>,
    iterations: usize,
    distance: f64,
) -> Result<LoadFlowResults> {
    let reader = Reader { system, x };
    let mut results = LoadFlowResults {
        iterations,
        distance,
        buses: BTreeMap::new(),
        grounds: BTreeMap::new(),
        lines: BTreeMap::new(),
        transformers: BTreeMap::new(),
        switches: BTreeMap::new(),
        sources: BTreeMap::new(),
        loads: BTreeMap::new(),
        ground_connections: BTreeMap::new(),
        potential_refs: BTreeMap::new(),
        violations: Vec::new(),
    };

    for element in network.elements() {
        let key = element.key();
        match element {
            Element::Bus(bus) => {
                let potentials = reader.potentials(&bus.id, &bus.phases)?;
                let voltages = bus_voltages(&bus.phases, &potentials);
                for (between, voltage) in &voltages {
                    let violation = match (bus.min_voltage, bus.max_voltage) {
                        (Some(min), _) if *voltage < min => Some((min, ViolationKind::Under)),
                        (_, Some(max)) if *voltage > max => Some((max, ViolationKind::Over)),
                        _ => None,
                    };
                    if let Some((limit, kind)) = violation {
                        results.violations.push(VoltageViolation {
                            bus: bus.id.clone(),
                            between: between.clone(),
                            voltage: *voltage,
                            limit,
                            kind,
                        });
                    }
                }
                results.buses.insert(
                    bus.id.clone(),
                    BusResult {
                        phases: bus.phases.clone(),
                        potentials,
                        voltages: voltages.into_iter().map(|(_, v)| v).collect(),
                    },
                );
            }
            Element::Ground(ground) => {
                let potential = reader.get(Variable::GroundPotential {
                    ground: ground.id.clone(),
                })?;
                results.grounds.insert(ground.id.clone(), potential);
            }
            Element::GroundConnection(gc) => {
                if network.topology().is_ignored(&gc.id) {
                    continue;
                }
                let current = reader.current(
                    &key,
                    CurrentRole::Terminal {
                        side: Side::One,
                        phase: gc.phase,
                    },
                )?;
                results.ground_connections.insert(gc.id.clone(), current);
            }
            Element::PotentialRef(pref) => {
                let current = reader.current(&key, CurrentRole::Reference)?;
                results.potential_refs.insert(pref.id.clone(), current);
            }
            Element::Line(line) => {
                let result = reader.branch(
                    &key,
                    (&line.bus1, &line.phases),
                    (&line.bus2, &line.phases),
                )?;
                results.lines.insert(line.id.clone(), result);
            }
            Element::Transformer(tr) => {
                let result =
                    reader.branch(&key, (&tr.bus1, &tr.phases1), (&tr.bus2, &tr.phases2))?;
                results.transformers.insert(tr.id.clone(), result);
            }
            Element::Switch(switch) => {
                let result = reader.branch(
                    &key,
                    (&switch.bus1, &switch.phases),
                    (&switch.bus2, &switch.phases),
                )?;
                results.switches.insert(switch.id.clone(), result);
            }
            Element::Source(source) => {
                let result = reader.terminal(&key, &source.bus, &source.phases)?;
                results.sources.insert(source.id.clone(), result);
            }
            Element::Load(load) => {
                let mut result = reader.terminal(&key, &load.bus, &load.phases)?;
                if load.is_flexible() {
                    result.flexible_powers = flexible_powers.get(&load.id).cloned();
                }
                results.loads.insert(load.id.clone(), result);
            }
        }
    }
    Ok(results)
}

impl fmt::Display for LoadFlowResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Converged in {} iterations (last change {:.3e} V)\n",
            self.iterations, self.distance
        )?;

        writeln!(f, "=== Buses ===")?;
        for (id, bus) in &self.buses {
            write!(f, "  Bus {:<16} {:<4}", id, bus.phases)?;
            for v in &bus.voltages {
                write!(f, " {:>9.3}", v)?;
            }
            writeln!(f, " V")?;
        }

        writeln!(f, "\n=== Lines ===")?;
        for (id, line) in &self.lines {
            let s: Complex64 = line.powers1.iter().sum();
            let losses = line.losses();
            writeln!(
                f,
                "  Line {:<16} P={:>10.3} kW  Q={:>10.3} kVAr  losses={:>8.3} kW",
                id,
                s.re / 1e3,
                s.im / 1e3,
                losses.re / 1e3
            )?;
        }

        writeln!(f, "\n=== Loads ===")?;
        for (id, load) in &self.loads {
            let s: Complex64 = load.powers.iter().sum();
            writeln!(
                f,
                "  Load {:<16} P={:>10.3} kW  Q={:>10.3} kVAr",
                id,
                s.re / 1e3,
                s.im / 1e3
            )?;
        }

        if !self.violations.is_empty() {
            writeln!(f, "\n=== Voltage violations ===")?;
            for v in &self.violations {
                writeln!(
                    f,
                    "  Bus {:<16} {:<3} {:>9.3} V  {:?} limit {:.3} V",
                    v.bus, v.between, v.voltage, v.kind, v.limit
                )?;
            }
        }
        Ok(())
    }
}
