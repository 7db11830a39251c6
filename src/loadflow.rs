use std::collections::{HashMap, HashSet, VecDeque};
use std::f64::consts::PI;

use log::{debug, info, warn};
use num_complex::Complex64;
use rayon::prelude::*;
use rsparse::{lsolve, lu, sqr, usolve};
use serde::{Deserialize, Serialize};

use crate::case::*;
use crate::equations::{self, EquationSystem, LoadAdmittances, Variable};
use crate::error::{AssemblyError, Error, Result};
use crate::phase::{Phase, Phases};
use crate::results::{self, LoadFlowResults};

/// Solves one assembled system. Returns the unknowns in the system's variable order.
pub trait LinearSolver {
    fn solve(&mut self, system: &EquationSystem) -> Result<Vec<Complex64>>;
}

/// LU factorization of the real-expanded system with `rsparse`.
#[derive(Debug, Default)]
pub struct SparseLuSolver;

impl LinearSolver for SparseLuSolver {
    fn solve(&mut self, system: &EquationSystem) -> Result<Vec<Complex64>> {
        let n = system.dimension();
        if n == 0 {
            return Ok(Vec::new());
        }
        let (triplets, mut b) = system.to_real_triplets();
        let a = triplets.to_sprs();

        // symbolic analysis is redone every time: zero admittances drop entries
        let mut symbolic = sqr(&a, 1, false);
        let numeric = lu(&a, &mut symbolic, 1.0)
            .map_err(|_| Error::Solver("LU factorization failed (singular matrix)".into()))?;
        let mut x = vec![0.0; 2 * n];
        ipvec(&numeric.pinv, &b, &mut x); // x = P*b
        lsolve(&numeric.l, &mut x); // x = L\x
        usolve(&numeric.u, &mut x); // x = U\x
        ipvec(&symbolic.q, &x, &mut b); // b = Q*x

        if b.iter().any(|v| !v.is_finite()) {
            return Err(Error::Solver("non-finite solution".into()));
        }
        Ok((0..n).map(|k| Complex64::new(b[k], b[n + k])).collect())
    }
}

fn ipvec(p: &Option<Vec<isize>>, b: &[f64], x: &mut [f64]) {
    match p {
        Some(p) => {
            for k in 0..b.len() {
                x[p[k] as usize] = b[k];
            }
        }
        None => x.copy_from_slice(b),
    }
}

/// Dense complex LU with `nalgebra`, for small systems.
#[derive(Debug, Default)]
pub struct DenseLuSolver;

impl LinearSolver for DenseLuSolver {
    fn solve(&mut self, system: &EquationSystem) -> Result<Vec<Complex64>> {
        let (a, b) = system.to_dense();
        let x = a
            .lu()
            .solve(&b)
            .ok_or_else(|| Error::Solver("singular matrix".into()))?;
        Ok(x.iter().copied().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadFlowOptions {
    pub max_iterations: usize,
    /// Largest potential change (V) between two outer iterations at convergence.
    pub tolerance: f64,
    /// Run the dense rank diagnostic on systems up to this many unknowns (0 disables it).
    pub rank_check_limit: usize,
    /// Evaluate flexible loads on the rayon thread pool.
    pub parallel_controls: bool,
}

impl Default for LoadFlowOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            rank_check_limit: 512,
            parallel_controls: true,
        }
    }
}

/// Outer control/solve loop.
enum LoadFlowState {
    Assembling,
    Solving(EquationSystem),
    Converged(EquationSystem, Vec<Complex64>),
    MaxIterationsExceeded,
}

/// Potentials of every bus, ordered like the bus phases.
pub type Potentials = HashMap<String, Vec<Complex64>>;

impl Network {
    pub fn solve_load_flow<S: LinearSolver>(
        &self,
        solver: &mut S,
        options: &LoadFlowOptions,
    ) -> Result<LoadFlowResults> {
        let voltage_dependent = self.loads().any(|l| l.model.is_voltage_dependent());
        let mut potentials = initial_potentials(self);
        let mut flexible_powers = HashMap::new();
        let mut iterations = 0;
        let mut distance = f64::INFINITY;

        let mut state = LoadFlowState::Assembling;
        loop {
            state = match state {
                LoadFlowState::Assembling => {
                    flexible_powers =
                        evaluate_controls(self, &potentials, options.parallel_controls);
                    let admittances = load_admittances(self, &potentials, &flexible_powers);
                    let system = equations::assemble(self, &admittances)?;
                    if iterations == 0 {
                        if let Some(report) = system.diagnose(options.rank_check_limit)? {
                            debug!(
                                "System of {} unknowns has full rank, condition {:.3e}",
                                report.dimension, report.condition
                            );
                        }
                    }
                    LoadFlowState::Solving(system)
                }
                LoadFlowState::Solving(system) => {
                    let x = solver.solve(&system)?;
                    if x.len() != system.dimension() {
                        return Err(Error::Solver(format!(
                            "solution has {} values for {} unknowns",
                            x.len(),
                            system.dimension()
                        )));
                    }
                    iterations += 1;
                    let next = bus_potentials(self, &system, &x)?;
                    distance = max_distance(&potentials, &next);
                    potentials = next;
                    debug!("Iteration {:>4}: distance {:.3e} V", iterations, distance);

                    if !voltage_dependent || distance < options.tolerance {
                        LoadFlowState::Converged(system, x)
                    } else if iterations >= options.max_iterations {
                        LoadFlowState::MaxIterationsExceeded
                    } else {
                        LoadFlowState::Assembling
                    }
                }
                LoadFlowState::Converged(system, x) => {
                    info!(
                        "Load flow '{}' converged in {} iterations (distance {:.3e} V)",
                        self.name, iterations, distance
                    );
                    return results::collect(
                        self,
                        &system,
                        &x,
                        &flexible_powers,
                        iterations,
                        distance,
                    );
                }
                LoadFlowState::MaxIterationsExceeded => {
                    return Err(Error::DidNotConverge {
                        iterations,
                        distance,
                    });
                }
            }
        }
    }
}

fn bus_potentials(
    network: &Network,
    system: &EquationSystem,
    x: &[Complex64],
) -> Result<Potentials> {
    let mut potentials = HashMap::new();
    for bus in network.buses() {
        let values = bus
            .phases
            .iter()
            .map(|phase| {
                let variable = Variable::BusPotential {
                    bus: bus.id.clone(),
                    phase,
                };
                system
                    .index_of(&variable)
                    .map(|idx| x[idx])
                    .ok_or_else(|| {
                        Error::from(AssemblyError::UnknownVariable(variable.to_string()))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        potentials.insert(bus.id.clone(), values);
    }
    Ok(potentials)
}

fn max_distance(previous: &Potentials, next: &Potentials) -> f64 {
    next.iter()
        .flat_map(|(bus, values)| {
            let before = previous.get(bus);
            values.iter().enumerate().map(move |(k, v)| {
                let old = before.and_then(|b| b.get(k)).copied().unwrap_or_default();
                (v - old).norm()
            })
        })
        .fold(0.0, f64::max)
}

/// `V_from - V_to` of each branch of a load on the given potentials.
fn branch_voltages(
    load: &Load,
    phases: &Phases,
    potentials: &[Complex64],
) -> Vec<Complex64> {
    let potential = |phase: Phase| {
        phases
            .position(phase)
            .and_then(|k| potentials.get(k))
            .copied()
            .unwrap_or_default()
    };
    load.branches()
        .into_iter()
        .map(|(from, to)| potential(from) - potential(to))
        .collect()
}

fn load_voltages(network: &Network, load: &Load, potentials: &Potentials) -> Vec<Complex64> {
    match (network.bus(&load.bus), potentials.get(&load.bus)) {
        (Some(bus), Some(values)) => branch_voltages(load, &bus.phases, values),
        _ => vec![Complex64::default(); load.branches().len()],
    }
}

/// Post-projection power of every flexible load at the given potentials.
fn evaluate_controls(
    network: &Network,
    potentials: &Potentials,
    parallel: bool,
) -> HashMap<String, Vec<Complex64>> {
    let loads: Vec<&Load> = network.loads().filter(|l| l.is_flexible()).collect();
    let evaluate = |load: &&Load| {
        let voltages = load_voltages(network, load, potentials);
        let powers: Vec<Complex64> = match &load.model {
            LoadModel::Flexible { powers, parameters } => voltages
                .iter()
                .zip(powers.iter().zip(parameters))
                .map(|(u, (&s, parameter))| parameter.compute_power(u.norm(), s))
                .collect(),
            _ => Vec::new(),
        };
        (load.id.clone(), powers)
    };
    if parallel {
        loads.par_iter().map(evaluate).collect()
    } else {
        loads.iter().map(evaluate).collect()
    }
}

/// Equivalent admittances `conj(S) / |U|^2` of the power and flexible loads.
fn load_admittances(
    network: &Network,
    potentials: &Potentials,
    flexible_powers: &HashMap<String, Vec<Complex64>>,
) -> LoadAdmittances {
    let mut admittances = LoadAdmittances::new();
    for load in network.loads() {
        let powers = match &load.model {
            LoadModel::Power(powers) => powers.as_slice(),
            LoadModel::Flexible { .. } => match flexible_powers.get(&load.id) {
                Some(powers) => powers.as_slice(),
                None => continue,
            },
            LoadModel::Current(_) | LoadModel::Impedance(_) => continue,
        };
        let voltages = load_voltages(network, load, potentials);
        let y = voltages
            .iter()
            .zip(powers)
            .map(|(u, s)| {
                let u2 = u.norm_sqr();
                if u2 < 1e-18 {
                    warn!("Load '{}' has a zero branch voltage; it draws no current", load.id);
                    Complex64::default()
                } else {
                    s.conj() / u2
                }
            })
            .collect();
        admittances.insert(load.id.clone(), y);
    }
    admittances
}

/// Starting potentials: the buses' own guesses, otherwise the source voltages carried through
/// lines, switches and transformers.
pub fn initial_potentials(network: &Network) -> Potentials {
    let mut potentials: Potentials = HashMap::new();
    let mut queue = VecDeque::new();

    for bus in network.buses() {
        if let Some(values) = &bus.initial_potentials {
            potentials.insert(bus.id.clone(), values.clone());
            queue.push_back(bus.id.clone());
        }
    }
    for source in network.sources() {
        if potentials.contains_key(&source.bus) {
            continue;
        }
        if let Some(bus) = network.bus(&source.bus) {
            let values = source_potentials(source);
            potentials.insert(bus.id.clone(), project(&source.phases, &values, &bus.phases));
            queue.push_back(bus.id.clone());
        }
    }

    // bus -> (neighbour, map from this bus's potentials to the neighbour's)
    let mut edges: HashMap<&str, Vec<(&str, Propagation)>> = HashMap::new();
    for element in network.elements() {
        match element {
            Element::Line(Line { bus1, bus2, .. }) | Element::Switch(Switch { bus1, bus2, .. }) => {
                edges.entry(bus1).or_default().push((bus2.as_str(), Propagation::Copy));
                edges.entry(bus2).or_default().push((bus1.as_str(), Propagation::Copy));
            }
            Element::Transformer(tr) => {
                let clock = f64::from(tr.parameters.vg.clock);
                let shift = Complex64::from_polar(1.0, -clock * PI / 6.0);
                let factor = shift * (tr.parameters.ratio() * tr.tap);
                edges
                    .entry(&tr.bus1)
                    .or_default()
                    .push((tr.bus2.as_str(), Propagation::Scale(factor, tr)));
                edges
                    .entry(&tr.bus2)
                    .or_default()
                    .push((tr.bus1.as_str(), Propagation::Scale(1.0 / factor, tr)));
            }
            _ => {}
        }
    }

    let mut reached: HashSet<String> = potentials.keys().cloned().collect();
    while let Some(id) = queue.pop_front() {
        let (Some(from_bus), Some(values)) = (network.bus(&id), potentials.get(&id).cloned()) else {
            continue;
        };
        let neighbours = edges.get(id.as_str()).map(Vec::as_slice).unwrap_or_default();
        for &(neighbour, propagation) in neighbours {
            if reached.contains(neighbour) {
                continue;
            }
            let Some(to_bus) = network.bus(neighbour) else {
                continue;
            };
            let next = match propagation {
                Propagation::Copy => project(&from_bus.phases, &values, &to_bus.phases),
                Propagation::Scale(factor, tr) => {
                    let (from_phases, to_phases) = if tr.bus1 == id {
                        (&tr.phases1, &tr.phases2)
                    } else {
                        (&tr.phases2, &tr.phases1)
                    };
                    let local = project(&from_bus.phases, &values, from_phases);
                    let reference = star_point(from_phases, &local);
                    let shifted: Vec<Complex64> = to_phases
                        .iter()
                        .map(|p| match from_phases.position(p) {
                            Some(k) if !p.is_neutral() => (local[k] - reference) * factor,
                            _ => Complex64::default(),
                        })
                        .collect();
                    project(to_phases, &shifted, &to_bus.phases)
                }
            };
            reached.insert(neighbour.to_string());
            potentials.insert(neighbour.to_string(), next);
            queue.push_back(neighbour.to_string());
        }
    }

    for bus in network.buses() {
        if !potentials.contains_key(&bus.id) {
            warn!("Bus '{}' is not reachable from a source; starting from zero", bus.id);
            potentials.insert(bus.id.clone(), vec![Complex64::default(); bus.phases.len()]);
        }
    }
    potentials
}

#[derive(Clone, Copy)]
enum Propagation<'a> {
    Copy,
    Scale(Complex64, &'a Transformer),
}

/// Phase potentials imposed by a source, ordered like its phases.
fn source_potentials(source: &VoltageSource) -> Vec<Complex64> {
    let u = &source.voltages;
    if !source.is_delta() {
        let mut star = u.clone();
        star.push(Complex64::default()); // neutral
        return star;
    }
    if u.len() == 3 {
        vec![(u[0] - u[2]) / 3.0, (u[1] - u[0]) / 3.0, (u[2] - u[1]) / 3.0]
    } else {
        vec![u[0] / 2.0, -u[0] / 2.0]
    }
}

/// Re-indexes `values` (ordered like `from`) onto the phases `to`; missing phases are zero.
fn project(from: &Phases, values: &[Complex64], to: &Phases) -> Vec<Complex64> {
    to.iter()
        .map(|p| {
            from.position(p)
                .and_then(|k| values.get(k))
                .copied()
                .unwrap_or_default()
        })
        .collect()
}

/// Neutral potential if present, otherwise the mean of the phase potentials.
fn star_point(phases: &Phases, values: &[Complex64]) -> Complex64 {
    if let Some(k) = phases.position(Phase::N) {
        return values[k];
    }
    let sum: Complex64 = values.iter().sum();
    sum / values.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flexible::FlexibleParameter;
    use crate::transformer::TransformerParameters;
    use approx::assert_abs_diff_eq;
    use nalgebra::DMatrix;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn line_voltages(u: &[Complex64]) -> Vec<Complex64> {
        vec![u[0] - u[1], u[1] - u[2], u[2] - u[0]]
    }

    fn single_phase(load: Load) -> Network {
        let z = DMatrix::from_diagonal_element(2, 2, c(0.05, 0.0));
        let params = LineParameters::new("lp", z, None).unwrap();
        Network::new(
            "single",
            vec![
                Bus::new("b1", "an").unwrap().into(),
                Bus::new("b2", "an").unwrap().into(),
                VoltageSource::new("src", "b1", "an", vec![c(230.0, 0.0)])
                    .unwrap()
                    .into(),
                PotentialRef::on_bus("pref", "b1", Some(Phase::N)).into(),
                Line::new("l", "b1", "b2", "an", params, 1.0).unwrap().into(),
                load.into(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn delta_source_initial_potentials_are_balanced() {
        let abc = Phases::parse("abc").unwrap();
        let u = crate::phase::balanced_potentials(400.0 / 3f64.sqrt(), &abc);
        let source = VoltageSource::new("s", "b", "abc", line_voltages(&u)).unwrap();
        let v = source_potentials(&source);
        for k in 0..3 {
            assert_abs_diff_eq!((v[k] - u[k]).norm(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn transformer_propagates_shifted_voltages() {
        let z2 = c(0.01, 0.04);
        let tp = TransformerParameters::new("tp", "Dyn11", 160e3, 20e3, 400.0, z2, c(0.0, 0.0))
            .unwrap();
        let abc = Phases::parse("abc").unwrap();
        let u = crate::phase::balanced_potentials(20e3 / 3f64.sqrt(), &abc);
        let network = Network::new(
            "tr",
            vec![
                Bus::new("hv", "abc").unwrap().into(),
                Bus::new("lv", "abcn").unwrap().into(),
                VoltageSource::new("src", "hv", "abc", line_voltages(&u))
                    .unwrap()
                    .into(),
                PotentialRef::on_bus("p1", "hv", None).into(),
                PotentialRef::on_bus("p2", "lv", Some(Phase::N)).into(),
                Transformer::new("tr", "hv", "lv", tp).unwrap().into(),
            ],
        )
        .unwrap();
        let potentials = initial_potentials(&network);
        let lv = &potentials["lv"];
        assert_abs_diff_eq!(lv[0].norm(), 400.0 / 3f64.sqrt(), epsilon = 1e-6);
        assert_abs_diff_eq!(lv[0].arg(), PI / 6.0, epsilon = 1e-9);
        assert_eq!(lv[3], Complex64::default());
    }

    #[test]
    fn constant_impedance_converges_in_one_solve() {
        init();
        let load = Load::impedance("load", "b2", "an", vec![c(10.0, 0.0)]).unwrap();
        let network = single_phase(load);
        let results = network
            .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
            .unwrap();
        assert_eq!(results.iterations, 1);
        let b2 = &results.buses["b2"];
        assert_abs_diff_eq!(b2.voltages[0], 230.0 * 10.0 / 10.1, epsilon = 1e-9);
    }

    #[test]
    fn constant_power_reaches_its_setpoint() {
        init();
        let load = Load::power("load", "b2", "an", vec![c(5000.0, 1000.0)]).unwrap();
        let network = single_phase(load);
        let results = network
            .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
            .unwrap();
        assert!(results.iterations > 1);
        let load = &results.loads["load"];
        let power: Complex64 = load.powers.iter().sum();
        assert_abs_diff_eq!(power.re, 5000.0, epsilon = 1e-2);
        assert_abs_diff_eq!(power.im, 1000.0, epsilon = 1e-2);
    }

    #[test]
    fn sparse_and_dense_solvers_agree() {
        let load = Load::power("load", "b2", "an", vec![c(3000.0, -500.0)]).unwrap();
        let network = single_phase(load);
        let options = LoadFlowOptions {
            parallel_controls: false,
            ..Default::default()
        };
        let sparse = network.solve_load_flow(&mut SparseLuSolver, &options).unwrap();
        let dense = network.solve_load_flow(&mut DenseLuSolver, &options).unwrap();
        for (a, b) in sparse.buses["b2"].potentials.iter().zip(&dense.buses["b2"].potentials) {
            assert_abs_diff_eq!((a - b).norm(), 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn iteration_cap_is_a_distinct_outcome() {
        let load = Load::power("load", "b2", "an", vec![c(5000.0, 0.0)]).unwrap();
        let network = single_phase(load);
        let options = LoadFlowOptions {
            max_iterations: 2,
            tolerance: 1e-12,
            ..Default::default()
        };
        match network.solve_load_flow(&mut SparseLuSolver, &options) {
            Err(Error::DidNotConverge { iterations, .. }) => assert_eq!(iterations, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn flexible_production_is_curtailed() {
        init();
        let parameter = FlexibleParameter::p_max_u_production(232.0, 252.0, 25000.0).unwrap();
        let network = single_phase(
            Load::flexible("pv", "b2", "an", vec![c(-20000.0, 0.0)], vec![parameter]).unwrap(),
        );
        let results = network
            .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
            .unwrap();
        let u = results.buses["b2"].voltages[0];
        let flexible = results.loads["pv"].flexible_powers.as_ref().unwrap()[0];
        assert!(u > 232.0 && u < 252.0, "u = {u}");
        assert_abs_diff_eq!(flexible.re, -20000.0 * (1.0 - (u - 232.0) / 20.0), epsilon = 0.5);
        assert!(flexible.re > -19000.0);
        let power: Complex64 = results.loads["pv"].powers.iter().sum();
        assert_abs_diff_eq!(power.re, flexible.re, epsilon = 0.5);
    }

    struct Truncating;

    impl LinearSolver for Truncating {
        fn solve(&mut self, system: &EquationSystem) -> Result<Vec<Complex64>> {
            Ok(vec![Complex64::default(); system.dimension() - 1])
        }
    }

    #[test]
    fn short_solution_is_a_solver_error() {
        let load = Load::impedance("load", "b2", "an", vec![c(50.0, 0.0)]).unwrap();
        let network = single_phase(load);
        match network.solve_load_flow(&mut Truncating, &LoadFlowOptions::default()) {
            Err(Error::Solver(message)) => assert!(message.contains("unknowns"), "{message}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: LoadFlowOptions = serde_json::from_str(r#"{"max_iterations": 20}"#).unwrap();
        assert_eq!(options.max_iterations, 20);
        assert_eq!(options.tolerance, 1e-6);
        assert!(options.parallel_controls);
    }
}
