//! Equation assembly.
//!
//! Every node (bus phase, ground, transformer internal neutral) carries a potential unknown and a
//! current-balance row summing the currents leaving it into elements. Each element then adds as
//! many unknowns as rows, so a validated network always yields a square system. Unknowns are
//! ordered with all bus and ground potentials first, followed by element unknowns in element order.

use std::collections::HashMap;
use std::fmt;

use log::debug;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use rsparse::data::Trpl;

use crate::case::{
    Element, ElementKey, ElementKind, GroundConnection, Line, Load, LoadModel, Network,
    PotentialRef, RefTarget, Switch, Transformer, VoltageSource,
};
use crate::error::AssemblyError;
use crate::phase::{Phase, Phases};
use crate::transformer::Terminal;

const ONE: Complex64 = Complex64::new(1.0, 0.0);
const ZERO: Complex64 = Complex64::new(0.0, 0.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CurrentRole {
    /// Current leaving the bus into the element on one of its phases.
    Terminal { side: Side, phase: Phase },
    /// Current through the k-th internal branch (load / source branch, line series branch).
    Branch(usize),
    /// Winding current of a transformer limb.
    Winding { side: Side, limb: usize },
    /// Total current injected into the ground by a line's shunt admittances.
    Shunt,
    /// Current of a potential reference; zero on a well-formed network.
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Variable {
    BusPotential { bus: String, phase: Phase },
    GroundPotential { ground: String },
    InternalPotential { owner: ElementKey, side: Side },
    Current { owner: ElementKey, role: CurrentRole },
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::BusPotential { bus, phase } => write!(f, "V[{bus}.{phase}]"),
            Variable::GroundPotential { ground } => write!(f, "V[{ground}]"),
            Variable::InternalPotential { owner, side } => {
                write!(f, "V[{owner} neutral {side:?}]")
            }
            Variable::Current { owner, role } => write!(f, "I[{owner} {role:?}]"),
        }
    }
}

/// One complex-linear row: `sum(coefficient * x[index]) = rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    pub terms: Vec<(Complex64, usize)>,
    pub rhs: Complex64,
    pub origin: ElementKey,
}

/// Equivalent admittance of each branch of the power and flexible loads, keyed by load id. Loads
/// missing from the map draw no current.
///
/// Each outer iteration re-linearizes a power `S` as the coefficient `conj(S) / |U|²` of the
/// branch row `J - Y·U = 0`, with a zero right-hand side. The alternative of a fixed current
/// `conj(S / U)` on the right-hand side reaches the same fixed point `U·conj(J) = S`.
pub type LoadAdmittances = HashMap<String, Vec<Complex64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct StructureReport {
    pub dimension: usize,
    pub rank: usize,
    /// Ratio of the largest to the smallest singular value.
    pub condition: f64,
}

#[derive(Debug, Clone)]
pub struct EquationSystem {
    variables: Vec<Variable>,
    equations: Vec<Equation>,
    index: HashMap<Variable, usize>,
}

impl EquationSystem {
    pub fn dimension(&self) -> usize {
        self.variables.len()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn index_of(&self, variable: &Variable) -> Option<usize> {
        self.index.get(variable).copied()
    }

    pub fn to_dense(&self) -> (DMatrix<Complex64>, DVector<Complex64>) {
        let n = self.dimension();
        let mut a = DMatrix::zeros(n, n);
        let b = DVector::from_iterator(n, self.equations.iter().map(|e| e.rhs));
        for (i, equation) in self.equations.iter().enumerate() {
            for &(coefficient, j) in &equation.terms {
                a[(i, j)] += coefficient;
            }
        }
        (a, b)
    }

    /// Equivalent real system `[[Re, -Im], [Im, Re]] [x_re; x_im] = [b_re; b_im]`.
    pub fn to_real_triplets(&self) -> (Trpl<f64>, Vec<f64>) {
        let n = self.dimension();
        let mut a = Trpl::<f64>::new();
        a.m = 2 * n;
        a.n = 2 * n;
        let mut b = vec![0.0; 2 * n];
        for (i, equation) in self.equations.iter().enumerate() {
            for &(coefficient, j) in &equation.terms {
                a.append(i, j, coefficient.re);
                a.append(i, n + j, -coefficient.im);
                a.append(n + i, j, coefficient.im);
                a.append(n + i, n + j, coefficient.re);
            }
            b[i] = equation.rhs.re;
            b[n + i] = equation.rhs.im;
        }
        a.sum_dupl();
        (a, b)
    }

    /// `A x - b` for a candidate solution `x`.
    pub fn residual(&self, x: &[Complex64]) -> Vec<Complex64> {
        self.equations
            .iter()
            .map(|e| {
                e.terms
                    .iter()
                    .map(|&(coefficient, j)| coefficient * x[j])
                    .sum::<Complex64>()
                    - e.rhs
            })
            .collect()
    }

    /// Dense rank check, skipped (`Ok(None)`) above `rank_limit` unknowns.
    pub fn diagnose(&self, rank_limit: usize) -> Result<Option<StructureReport>, AssemblyError> {
        let n = self.dimension();
        if n == 0 || n > rank_limit {
            return Ok(None);
        }
        let (a, _) = self.to_dense();
        let singular_values = a.singular_values();
        let largest = singular_values.max();
        let smallest = singular_values.min();
        let tolerance = largest * n as f64 * f64::EPSILON;
        let rank = singular_values.iter().filter(|&&s| s > tolerance).count();
        if rank < n {
            return Err(AssemblyError::RankDeficient {
                rank,
                dimension: n,
                smallest_singular_value: smallest,
            });
        }
        Ok(Some(StructureReport {
            dimension: n,
            rank,
            condition: largest / smallest,
        }))
    }
}

/// Assembles the equation system of a validated network.
pub fn assemble(
    network: &Network,
    admittances: &LoadAdmittances,
) -> Result<EquationSystem, AssemblyError> {
    let mut assembler = Assembler::new(network, admittances);
    for element in network.elements() {
        match element {
            Element::Bus(_) | Element::Ground(_) => {}
            Element::GroundConnection(gc) => {
                if !network.topology().is_ignored(&gc.id) {
                    assembler.ground_connection(gc)?;
                }
            }
            Element::PotentialRef(pref) => assembler.potential_ref(pref)?,
            Element::Line(line) => assembler.line(line)?,
            Element::Transformer(tr) => assembler.transformer(tr)?,
            Element::Switch(switch) => assembler.switch(switch)?,
            Element::Source(source) => assembler.source(source)?,
            Element::Load(load) => assembler.load(load)?,
        }
    }
    assembler.finish()
}

struct Assembler<'a> {
    network: &'a Network,
    admittances: &'a LoadAdmittances,
    variables: Vec<Variable>,
    index: HashMap<Variable, usize>,
    // current balance of every bus and ground node, indexed like their potentials
    balance: Vec<(ElementKey, Vec<(Complex64, usize)>)>,
    rows: Vec<Equation>,
}

impl<'a> Assembler<'a> {
    fn new(network: &'a Network, admittances: &'a LoadAdmittances) -> Self {
        let mut assembler = Assembler {
            network,
            admittances,
            variables: Vec::new(),
            index: HashMap::new(),
            balance: Vec::new(),
            rows: Vec::new(),
        };
        for bus in network.buses() {
            for phase in bus.phases.iter() {
                assembler.variable(Variable::BusPotential {
                    bus: bus.id.clone(),
                    phase,
                });
                assembler
                    .balance
                    .push((ElementKey::new(ElementKind::Bus, &bus.id), Vec::new()));
            }
        }
        for ground in network.grounds() {
            assembler.variable(Variable::GroundPotential {
                ground: ground.id.clone(),
            });
            assembler
                .balance
                .push((ElementKey::new(ElementKind::Ground, &ground.id), Vec::new()));
        }
        assembler
    }

    fn variable(&mut self, variable: Variable) -> usize {
        let idx = self.variables.len();
        self.index.insert(variable.clone(), idx);
        self.variables.push(variable);
        idx
    }

    fn current(&mut self, owner: &ElementKey, role: CurrentRole) -> usize {
        self.variable(Variable::Current {
            owner: owner.clone(),
            role,
        })
    }

    fn lookup(&self, variable: Variable) -> Result<usize, AssemblyError> {
        self.index
            .get(&variable)
            .copied()
            .ok_or_else(|| AssemblyError::UnknownVariable(variable.to_string()))
    }

    fn potential(&self, bus: &str, phase: Phase) -> Result<usize, AssemblyError> {
        self.lookup(Variable::BusPotential {
            bus: bus.to_string(),
            phase,
        })
    }

    fn ground_potential(&self, ground: &str) -> Result<usize, AssemblyError> {
        self.lookup(Variable::GroundPotential {
            ground: ground.to_string(),
        })
    }

    /// Adds a current leaving `node` to its balance.
    fn leave(&mut self, node: usize, coefficient: Complex64, current: usize) {
        if let Some((_, terms)) = self.balance.get_mut(node) {
            terms.push((coefficient, current));
        }
    }

    fn row(&mut self, origin: &ElementKey, terms: Vec<(Complex64, usize)>, rhs: Complex64) {
        let terms = terms.into_iter().filter(|(c, _)| *c != ZERO).collect();
        self.rows.push(Equation {
            terms,
            rhs,
            origin: origin.clone(),
        });
    }

    fn ground_connection(&mut self, gc: &GroundConnection) -> Result<(), AssemblyError> {
        let key = ElementKey::new(ElementKind::GroundConnection, &gc.id);
        let v_bus = self.potential(&gc.bus, gc.phase)?;
        let v_ground = self.ground_potential(&gc.ground)?;
        let i = self.current(
            &key,
            CurrentRole::Terminal {
                side: Side::One,
                phase: gc.phase,
            },
        );
        self.leave(v_bus, ONE, i);
        self.leave(v_ground, -ONE, i);
        self.row(&key, vec![(ONE, v_bus), (-ONE, v_ground), (-gc.impedance, i)], ZERO);
        Ok(())
    }

    fn potential_ref(&mut self, pref: &PotentialRef) -> Result<(), AssemblyError> {
        let key = ElementKey::new(ElementKind::PotentialRef, &pref.id);
        let nodes = match &pref.target {
            RefTarget::Bus {
                bus,
                phase: Some(phase),
            } => vec![self.potential(bus, *phase)?],
            RefTarget::Bus { bus, phase: None } => {
                let phases = self
                    .network
                    .bus(bus)
                    .map(|b| b.phases.clone())
                    .ok_or_else(|| AssemblyError::UnknownVariable(format!("bus '{bus}'")))?;
                phases
                    .iter()
                    .map(|p| self.potential(bus, p))
                    .collect::<Result<Vec<_>, _>>()?
            }
            RefTarget::Ground(ground) => vec![self.ground_potential(ground)?],
        };
        let i = self.current(&key, CurrentRole::Reference);
        for &node in &nodes {
            self.leave(node, ONE, i);
        }
        self.row(&key, nodes.iter().map(|&v| (ONE, v)).collect(), ZERO);
        Ok(())
    }

    /// Terminal currents of a two-bus element, one per phase and side, added to the bus balances.
    fn terminals(
        &mut self,
        key: &ElementKey,
        bus: &str,
        side: Side,
        phases: &Phases,
    ) -> Result<Vec<(usize, usize)>, AssemblyError> {
        let mut terminals = Vec::with_capacity(phases.len());
        for phase in phases.iter() {
            let v = self.potential(bus, phase)?;
            let i = self.current(key, CurrentRole::Terminal { side, phase });
            self.leave(v, ONE, i);
            terminals.push((v, i));
        }
        Ok(terminals)
    }

    fn switch(&mut self, switch: &Switch) -> Result<(), AssemblyError> {
        let key = ElementKey::new(ElementKind::Switch, &switch.id);
        let side1 = self.terminals(&key, &switch.bus1, Side::One, &switch.phases)?;
        let side2 = self.terminals(&key, &switch.bus2, Side::Two, &switch.phases)?;
        for (&(v1, i1), &(v2, i2)) in side1.iter().zip(&side2) {
            self.row(&key, vec![(ONE, v1), (-ONE, v2)], ZERO);
            self.row(&key, vec![(ONE, i1), (ONE, i2)], ZERO);
        }
        Ok(())
    }

    fn line(&mut self, line: &Line) -> Result<(), AssemblyError> {
        let key = ElementKey::new(ElementKind::Line, &line.id);
        let z = line.z();
        let side1 = self.terminals(&key, &line.bus1, Side::One, &line.phases)?;
        let side2 = self.terminals(&key, &line.bus2, Side::Two, &line.phases)?;
        let m = side1.len();

        let shunt = match (line.y(), &line.ground) {
            (Some(y), Some(ground)) => Some((y, self.ground_potential(ground)?)),
            _ => None,
        };
        let Some((y, vg)) = shunt else {
            for i in 0..m {
                let mut terms = vec![(ONE, side1[i].0), (-ONE, side2[i].0)];
                terms.extend((0..m).map(|j| (-z[(i, j)], side1[j].1)));
                self.row(&key, terms, ZERO);
                self.row(&key, vec![(ONE, side1[i].1), (ONE, side2[i].1)], ZERO);
            }
            return Ok(());
        };

        // pi model: half of the shunt admittance at each end
        let series: Vec<usize> = (0..m)
            .map(|k| self.current(&key, CurrentRole::Branch(k)))
            .collect();
        let ig = self.current(&key, CurrentRole::Shunt);
        self.leave(vg, -ONE, ig);
        let half = Complex64::new(0.5, 0.0);
        for i in 0..m {
            let mut terms = vec![(ONE, side1[i].0), (-ONE, side2[i].0)];
            terms.extend((0..m).map(|j| (-z[(i, j)], series[j])));
            self.row(&key, terms, ZERO);

            let row_sum: Complex64 = (0..m).map(|j| y[(i, j)]).sum::<Complex64>() * half;
            for (sign, side) in [(-ONE, &side1), (ONE, &side2)] {
                let mut terms = vec![(ONE, side[i].1), (sign, series[i]), (row_sum, vg)];
                terms.extend((0..m).map(|j| (-y[(i, j)] * half, side[j].0)));
                self.row(&key, terms, ZERO);
            }
        }
        let total: Complex64 = y.iter().sum();
        let mut terms = vec![(ONE, ig), (total, vg)];
        for j in 0..m {
            let column: Complex64 = (0..m).map(|i| y[(i, j)]).sum::<Complex64>() * half;
            terms.push((-column, side1[j].0));
            terms.push((-column, side2[j].0));
        }
        self.row(&key, terms, ZERO);
        Ok(())
    }

    fn transformer(&mut self, tr: &Transformer) -> Result<(), AssemblyError> {
        let key = ElementKey::new(ElementKind::Transformer, &tr.id);
        let layout = &tr.layout;
        let ratio = Complex64::new(layout.ratio, 0.0);
        let side1 = self.terminals(&key, &tr.bus1, Side::One, &tr.phases1)?;
        let side2 = self.terminals(&key, &tr.bus2, Side::Two, &tr.phases2)?;
        let limbs = layout.limbs.len();
        let w1: Vec<usize> = (0..limbs)
            .map(|limb| self.current(&key, CurrentRole::Winding { side: Side::One, limb }))
            .collect();
        let w2: Vec<usize> = (0..limbs)
            .map(|limb| self.current(&key, CurrentRole::Winding { side: Side::Two, limb }))
            .collect();
        let neutral1 = layout.hv_internal_neutral.then(|| {
            self.variable(Variable::InternalPotential {
                owner: key.clone(),
                side: Side::One,
            })
        });
        let neutral2 = layout.lv_internal_neutral.then(|| {
            self.variable(Variable::InternalPotential {
                owner: key.clone(),
                side: Side::Two,
            })
        });

        let node = |terminal: Terminal, bus: &str, internal: Option<usize>| match terminal {
            Terminal::Phase(phase) => self.potential(bus, phase),
            Terminal::InternalNeutral => internal.ok_or_else(|| {
                AssemblyError::UnknownVariable(format!("internal neutral of {key}"))
            }),
        };
        let mut windings = Vec::with_capacity(limbs);
        for limb in &layout.limbs {
            windings.push((
                node(limb.hv.0, &tr.bus1, neutral1)?,
                node(limb.hv.1, &tr.bus1, neutral1)?,
                node(limb.lv.0, &tr.bus2, neutral2)?,
                node(limb.lv.1, &tr.bus2, neutral2)?,
            ));
        }

        // signed incidence of each winding on a terminal
        let incidence = |winding: (Terminal, Terminal), terminal: Terminal| {
            if winding.0 == terminal {
                ONE
            } else if winding.1 == terminal {
                -ONE
            } else {
                ZERO
            }
        };

        for (phase, &(_, i1)) in tr.phases1.iter().zip(&side1) {
            let mut terms = vec![(ONE, i1)];
            for (k, limb) in layout.limbs.iter().enumerate() {
                terms.push((-incidence(limb.hv, Terminal::Phase(phase)), w1[k]));
            }
            self.row(&key, terms, ZERO);
        }
        for (phase, &(_, i2)) in tr.phases2.iter().zip(&side2) {
            let mut terms = vec![(ONE, i2)];
            for (k, limb) in layout.limbs.iter().enumerate() {
                terms.push((incidence(limb.lv, Terminal::Phase(phase)), w2[k]));
            }
            self.row(&key, terms, ZERO);
        }
        if neutral1.is_some() {
            let terms = (0..limbs)
                .map(|k| (incidence(layout.limbs[k].hv, Terminal::InternalNeutral), w1[k]))
                .collect();
            self.row(&key, terms, ZERO);
        }
        if neutral2.is_some() {
            let terms = (0..limbs)
                .map(|k| (-incidence(layout.limbs[k].lv, Terminal::InternalNeutral), w2[k]))
                .collect();
            self.row(&key, terms, ZERO);
        }

        for (k, &(h_from, h_to, l_from, l_to)) in windings.iter().enumerate() {
            self.row(
                &key,
                vec![
                    (ONE, l_from),
                    (-ONE, l_to),
                    (-ratio, h_from),
                    (ratio, h_to),
                    (layout.z2, w2[k]),
                ],
                ZERO,
            );
            self.row(
                &key,
                vec![
                    (ONE, w1[k]),
                    (-ratio, w2[k]),
                    (-layout.ym, h_from),
                    (layout.ym, h_to),
                ],
                ZERO,
            );
        }
        Ok(())
    }

    /// Terminal and branch currents of a source or load. Returns `(v_from, v_to, j)` per branch.
    fn branches(
        &mut self,
        key: &ElementKey,
        bus: &str,
        phases: &Phases,
        branches: &[(Phase, Phase)],
    ) -> Result<Vec<(usize, usize, usize)>, AssemblyError> {
        let terminals = self.terminals(key, bus, Side::One, phases)?;
        let mut result = Vec::with_capacity(branches.len());
        for (k, &(from, to)) in branches.iter().enumerate() {
            let j = self.current(key, CurrentRole::Branch(k));
            result.push((self.potential(bus, from)?, self.potential(bus, to)?, j));
        }
        for (phase, &(_, i)) in phases.iter().zip(&terminals) {
            let mut terms = vec![(ONE, i)];
            for (&(from, to), &(_, _, j)) in branches.iter().zip(&result) {
                if from == phase {
                    terms.push((-ONE, j));
                } else if to == phase {
                    terms.push((ONE, j));
                }
            }
            self.row(key, terms, ZERO);
        }
        Ok(result)
    }

    fn source(&mut self, source: &VoltageSource) -> Result<(), AssemblyError> {
        let key = ElementKey::new(ElementKind::Source, &source.id);
        let branches = self.branches(&key, &source.bus, &source.phases, &source.branches())?;
        for (&(v_from, v_to, _), &u) in branches.iter().zip(&source.voltages) {
            self.row(&key, vec![(ONE, v_from), (-ONE, v_to)], u);
        }
        Ok(())
    }

    fn load(&mut self, load: &Load) -> Result<(), AssemblyError> {
        let key = ElementKey::new(ElementKind::Load, &load.id);
        let branches = self.branches(&key, &load.bus, &load.phases, &load.branches())?;
        match &load.model {
            LoadModel::Current(currents) => {
                for (&(_, _, j), &i) in branches.iter().zip(currents) {
                    self.row(&key, vec![(ONE, j)], i);
                }
            }
            LoadModel::Impedance(impedances) => {
                for (&(v_from, v_to, j), &z) in branches.iter().zip(impedances) {
                    self.row(&key, vec![(ONE, v_from), (-ONE, v_to), (-z, j)], ZERO);
                }
            }
            LoadModel::Power(_) | LoadModel::Flexible { .. } => {
                let admittances = self.admittances.get(&load.id);
                for (k, &(v_from, v_to, j)) in branches.iter().enumerate() {
                    let y = admittances.and_then(|y| y.get(k)).copied().unwrap_or(ZERO);
                    self.row(&key, vec![(ONE, j), (-y, v_from), (y, v_to)], ZERO);
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<EquationSystem, AssemblyError> {
        let mut equations: Vec<Equation> = self
            .balance
            .into_iter()
            .map(|(origin, terms)| Equation {
                terms,
                rhs: ZERO,
                origin,
            })
            .collect();
        equations.extend(self.rows);
        if equations.len() != self.variables.len() {
            return Err(AssemblyError::DimensionMismatch {
                variables: self.variables.len(),
                equations: equations.len(),
            });
        }
        debug!(
            "Assembled {:>6} unknowns, {:>6} non-zeros",
            self.variables.len(),
            equations.iter().map(|e| e.terms.len()).sum::<usize>()
        );
        Ok(EquationSystem {
            variables: self.variables,
            equations,
            index: self.index,
        })
    }
}
