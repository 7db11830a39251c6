use std::f64::consts::PI;

use approx::assert_abs_diff_eq;
use nalgebra::DMatrix;
use num_complex::Complex64;
use polyphase::phase::balanced_potentials;
use polyphase::results::{BranchResult, ViolationKind};
use polyphase::*;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn c(re: f64, im: f64) -> Complex64 {
    Complex64::new(re, im)
}

#[test]
fn switches_reproduce_the_source_voltages() {
    init();
    let phases = Phases::parse("abcn").unwrap();
    let u = balanced_potentials(230.0, &phases);
    let network = Network::new(
        "switches",
        vec![
            Bus::new("b1", "abcn").unwrap().into(),
            Bus::new("b2", "abcn").unwrap().into(),
            Bus::new("b3", "abcn").unwrap().into(),
            VoltageSource::new("vs", "b1", "abcn", u[..3].to_vec()).unwrap().into(),
            PotentialRef::on_bus("pref", "b1", Some(Phase::N)).into(),
            Switch::new("s1", "b1", "b2", "abcn").unwrap().into(),
            Switch::new("s2", "b2", "b3", "abcn").unwrap().into(),
        ],
    )
    .unwrap();

    let results = network
        .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    assert_eq!(results.iterations, 1);
    for bus in ["b1", "b2", "b3"] {
        let potentials = &results.buses[bus].potentials;
        for (v, expected) in potentials.iter().zip(&u) {
            assert_abs_diff_eq!((v - expected).norm(), 0.0, epsilon = 1e-9);
        }
    }
    for current in &results.switches["s2"].currents1 {
        assert_abs_diff_eq!(current.norm(), 0.0, epsilon = 1e-9);
    }
    assert_abs_diff_eq!(results.potential_refs["pref"].norm(), 0.0, epsilon = 1e-9);
}

#[test]
fn transformer_without_load_shifts_by_its_clock() {
    init();
    let tp = TransformerParameters::from_open_and_short_circuit_tests(
        "160kVA", "Dyn11", 160e3, 20e3, 400.0, 0.023, 460.0, 2350.0, 0.04,
    )
    .unwrap();
    let u = balanced_potentials(20e3 / 3f64.sqrt(), &Phases::parse("abc").unwrap());
    let network = Network::new(
        "mv/lv",
        vec![
            Bus::new("hv", "abc").unwrap().into(),
            Bus::new("lv", "abcn").unwrap().into(),
            VoltageSource::new("vs", "hv", "abc", vec![u[0] - u[1], u[1] - u[2], u[2] - u[0]])
                .unwrap()
                .into(),
            PotentialRef::on_bus("p_hv", "hv", None).into(),
            PotentialRef::on_bus("p_lv", "lv", Some(Phase::N)).into(),
            Transformer::new("tr", "hv", "lv", tp).unwrap().into(),
        ],
    )
    .unwrap();

    let results = network
        .solve_load_flow(&mut DenseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    let lv = &results.buses["lv"];
    for v in &lv.voltages {
        assert_abs_diff_eq!(*v, 400.0 / 3f64.sqrt(), epsilon = 1e-6);
    }
    assert_abs_diff_eq!(lv.potentials[0].arg(), PI / 6.0, epsilon = 1e-6);

    // only the magnetizing current flows, drawing the open-circuit test losses
    let tr = &results.transformers["tr"];
    assert_abs_diff_eq!(tr.losses().re, 460.0, epsilon = 1e-6);
    for current in &tr.currents2 {
        assert_abs_diff_eq!(current.norm(), 0.0, epsilon = 1e-9);
    }
}

/// Source, load and series powers of a solved network. Zero when every element is counted.
fn power_balance(results: &LoadFlowResults) -> Complex64 {
    let terminals = results
        .sources
        .values()
        .chain(results.loads.values())
        .flat_map(|terminal| terminal.powers.iter())
        .sum::<Complex64>();
    let branches = results
        .lines
        .values()
        .chain(results.transformers.values())
        .map(BranchResult::losses)
        .sum::<Complex64>();
    terminals + branches
}

fn supplied(results: &LoadFlowResults) -> f64 {
    results
        .sources
        .values()
        .flat_map(|source| source.powers.iter())
        .sum::<Complex64>()
        .norm()
}

/// Delta source on a three-wire 20 kV bus, a transformer and the given low-voltage elements.
fn mv_lv(tp: TransformerParameters, lv_phases: &str, lv: Vec<Element>) -> Network {
    let u = balanced_potentials(20e3 / 3f64.sqrt(), &Phases::parse("abc").unwrap());
    let lv_ref = if lv_phases.contains('n') {
        Some(Phase::N)
    } else {
        None
    };
    let mut elements: Vec<Element> = vec![
        Bus::new("hv", "abc").unwrap().into(),
        Bus::new("lv", lv_phases).unwrap().into(),
        VoltageSource::new("vs", "hv", "abc", vec![u[0] - u[1], u[1] - u[2], u[2] - u[0]])
            .unwrap()
            .into(),
        PotentialRef::on_bus("p_hv", "hv", None).into(),
        PotentialRef::on_bus("p_lv", "lv", lv_ref).into(),
        Transformer::new("tr", "hv", "lv", tp).unwrap().into(),
    ];
    elements.extend(lv);
    Network::new("mv/lv", elements).unwrap()
}

#[test]
fn star_delta_transformer_leads_by_thirty_degrees() {
    init();
    let tp = TransformerParameters::from_open_and_short_circuit_tests(
        "160kVA", "Yd11", 160e3, 20e3, 400.0, 0.023, 460.0, 2350.0, 0.04,
    )
    .unwrap();
    let results = mv_lv(tp, "abc", Vec::new())
        .solve_load_flow(&mut DenseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    let lv = &results.buses["lv"];
    for v in &lv.voltages {
        assert_abs_diff_eq!(*v, 400.0, epsilon = 1e-6);
    }
    assert_abs_diff_eq!(lv.potentials[0].arg(), PI / 6.0, epsilon = 1e-6);
    assert_abs_diff_eq!(results.transformers["tr"].losses().re, 460.0, epsilon = 1e-6);
}

#[test]
fn delta_secondary_losses_use_the_winding_impedance() {
    init();
    let z2 = c(0.0235, 0.04);
    let tp = TransformerParameters::new("tp", "Yd11", 160e3, 20e3, 400.0, z2, c(0.0, 0.0))
        .unwrap();
    let load = Load::impedance("load", "lv", "abc", vec![c(10.0, 0.0); 3]).unwrap();
    let results = mv_lv(tp, "abc", vec![load.into()])
        .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
        .unwrap();

    // each winding carries z2 tripled, its current is the line current over sqrt(3)
    let tr = &results.transformers["tr"];
    let squared: f64 = tr.currents2.iter().map(|i| i.norm_sqr()).sum();
    assert!(squared > 0.0);
    assert_abs_diff_eq!((tr.losses() - z2 * squared).norm(), 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(power_balance(&results).norm(), 0.0, epsilon = 1e-6);
    let line = results.buses["lv"].voltages[0];
    assert!(line > 380.0 && line < 400.0, "u = {line}");
}

#[test]
fn star_star_transformer_keeps_the_phase() {
    init();
    let tp = TransformerParameters::from_open_and_short_circuit_tests(
        "160kVA", "Yyn0", 160e3, 20e3, 400.0, 0.023, 460.0, 2350.0, 0.04,
    )
    .unwrap();
    let results = mv_lv(tp, "abcn", Vec::new())
        .solve_load_flow(&mut DenseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    let lv = &results.buses["lv"];
    for v in &lv.voltages {
        assert_abs_diff_eq!(*v, 400.0 / 3f64.sqrt(), epsilon = 1e-6);
    }
    assert_abs_diff_eq!(lv.potentials[0].arg(), 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(results.transformers["tr"].losses().re, 460.0, epsilon = 1e-6);
}

#[test]
fn grounded_star_transformer_balances_an_unbalanced_load() {
    init();
    let tp = TransformerParameters::from_open_and_short_circuit_tests(
        "160kVA", "YNyn0", 160e3, 20e3, 400.0, 0.023, 460.0, 2350.0, 0.04,
    )
    .unwrap();
    let u = balanced_potentials(20e3 / 3f64.sqrt(), &Phases::parse("abcn").unwrap());
    let network = Network::new(
        "ynyn",
        vec![
            Bus::new("hv", "abcn").unwrap().into(),
            Bus::new("lv", "abcn").unwrap().into(),
            VoltageSource::new("vs", "hv", "abcn", u[..3].to_vec()).unwrap().into(),
            PotentialRef::on_bus("p_hv", "hv", Some(Phase::N)).into(),
            PotentialRef::on_bus("p_lv", "lv", Some(Phase::N)).into(),
            Transformer::new("tr", "hv", "lv", tp).unwrap().into(),
            Load::power("house", "lv", "abcn", vec![c(30e3, 5e3), c(10e3, 0.0), c(0.0, 0.0)])
                .unwrap()
                .into(),
            Load::impedance("heater", "lv", "cn", vec![c(20.0, 0.0)]).unwrap().into(),
        ],
    )
    .unwrap();

    let results = network
        .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    assert!(results.iterations > 1);
    let total = supplied(&results);
    assert_abs_diff_eq!(power_balance(&results).norm() / total, 0.0, epsilon = 1e-6);

    // the zero-sequence current returns through both neutrals
    let tr = &results.transformers["tr"];
    let n1 = tr.currents1[3];
    let n2 = tr.currents2[3];
    assert!(n1.norm() > 0.1 && n2.norm() > 1.0, "n1 = {n1}, n2 = {n2}");
    for side in [&tr.currents1, &tr.currents2] {
        assert_abs_diff_eq!(side.iter().sum::<Complex64>().norm(), 0.0, epsilon = 1e-6);
    }
    let house: Complex64 = results.loads["house"].powers.iter().sum();
    assert_abs_diff_eq!(house.re, 40e3, epsilon = 1e-2);
}

#[test]
fn single_phase_transformer_feeds_a_phase_to_neutral_load() {
    init();
    let tp = TransformerParameters::from_open_and_short_circuit_tests(
        "50kVA", "Ii0", 50e3, 20e3, 230.0, 0.02, 100.0, 500.0, 0.04,
    )
    .unwrap();
    let network = Network::new(
        "single",
        vec![
            Bus::new("hv", "ab").unwrap().into(),
            Bus::new("lv", "an").unwrap().into(),
            VoltageSource::new("vs", "hv", "ab", vec![c(20e3, 0.0)]).unwrap().into(),
            PotentialRef::on_bus("p_hv", "hv", None).into(),
            PotentialRef::on_bus("p_lv", "lv", Some(Phase::N)).into(),
            Transformer::on_phases("tr", "hv", "lv", tp, "ab", "an").unwrap().into(),
            Load::power("load", "lv", "an", vec![c(10e3, 2e3)]).unwrap().into(),
        ],
    )
    .unwrap();

    let results = network
        .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    let u = results.buses["lv"].voltages[0];
    assert!(u > 220.0 && u < 230.0, "u = {u}");
    let total = supplied(&results);
    assert_abs_diff_eq!(power_balance(&results).norm() / total, 0.0, epsilon = 1e-6);
    let load: Complex64 = results.loads["load"].powers.iter().sum();
    assert_abs_diff_eq!((load - c(10e3, 2e3)).norm(), 0.0, epsilon = 1e-2);
    assert!(results.transformers["tr"].losses().re > 0.0);
}

#[test]
fn single_pole_switches_carry_their_phase() {
    init();
    let phases = Phases::parse("abcn").unwrap();
    let u = balanced_potentials(230.0, &phases);
    let impedances = vec![c(10.0, 0.0), c(20.0, 0.0), c(30.0, 0.0)];
    let network = Network::new(
        "poles",
        vec![
            Bus::new("b1", "abcn").unwrap().into(),
            Bus::new("b2", "abcn").unwrap().into(),
            VoltageSource::new("vs", "b1", "abcn", u[..3].to_vec()).unwrap().into(),
            PotentialRef::on_bus("pref", "b1", Some(Phase::N)).into(),
            Switch::new("sw_an", "b1", "b2", "an").unwrap().into(),
            Switch::new("sw_b", "b1", "b2", "b").unwrap().into(),
            Switch::new("sw_c", "b1", "b2", "c").unwrap().into(),
            Load::impedance("load", "b2", "abcn", impedances.clone()).unwrap().into(),
        ],
    )
    .unwrap();

    let results = network
        .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    for (v, expected) in results.buses["b2"].potentials.iter().zip(&u) {
        assert_abs_diff_eq!((v - expected).norm(), 0.0, epsilon = 1e-9);
    }
    let b = results.switches["sw_b"].currents1[0];
    assert_abs_diff_eq!((b - u[1] / impedances[1]).norm(), 0.0, epsilon = 1e-9);
}

#[test]
fn q_u_control_stays_idle_in_its_dead_band() {
    init();
    let z = DMatrix::from_diagonal_element(2, 2, c(0.1, 0.05));
    let lp = LineParameters::new("lp", z, None).unwrap();
    let parameter = FlexibleParameter::q_u(215.0, 220.0, 240.0, 245.0, 5000.0).unwrap();
    let network = Network::new(
        "q_u",
        vec![
            Bus::new("b1", "an").unwrap().into(),
            Bus::new("b2", "an").unwrap().into(),
            VoltageSource::new("vs", "b1", "an", vec![c(232.0, 0.0)]).unwrap().into(),
            PotentialRef::on_bus("pref", "b1", Some(Phase::N)).into(),
            Line::new("line", "b1", "b2", "an", lp, 1.0).unwrap().into(),
            Load::flexible("pv", "b2", "an", vec![c(-1000.0, 0.0)], vec![parameter])
                .unwrap()
                .into(),
        ],
    )
    .unwrap();

    let results = network
        .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    let u = results.buses["b2"].voltages[0];
    assert!(u > 220.0 && u < 240.0, "u = {u}");
    let pv = &results.loads["pv"];
    let flexible = pv.flexible_powers.as_ref().unwrap()[0];
    assert_abs_diff_eq!(flexible.re, -1000.0, epsilon = 1e-3);
    assert_abs_diff_eq!(flexible.im, 0.0, epsilon = 1e-3);
    let power: Complex64 = pv.powers.iter().sum();
    assert_abs_diff_eq!(power.re, -1000.0, epsilon = 1e-2);
}

const FEEDER: &str = r#"{
    "version": 2,
    "name": "feeder",
    "buses": [
        {"id": "source", "phases": "abcn", "min_voltage": 240.0},
        {"id": "load", "phases": "abcn", "max_voltage": 200.0}
    ],
    "grounds": [{"id": "g"}],
    "ground_connections": [{"id": "gc", "ground": "g", "element": "source", "phase": "n"}],
    "potential_refs": [{"id": "pref", "element": "g"}],
    "lines": [
        {"id": "line", "bus1": "source", "bus2": "load", "phases": "abcn",
         "params_id": "lp", "length": 0.5}
    ],
    "sources": [
        {"id": "vs", "bus": "source", "phases": "abcn",
         "voltages": [[230.0, 0.0], [-115.0, -199.18584287042088],
                      [-115.0, 199.18584287042088]]}
    ],
    "loads": [
        {"id": "house", "bus": "load", "phases": "abcn", "type": "power",
         "powers": [[1000.0, 300.0], [1000.0, 0.0], [500.0, 0.0]]},
        {"id": "heater", "bus": "load", "phases": "bn", "type": "impedance",
         "impedances": [[50.0, 0.0]]},
        {"id": "pv", "bus": "load", "phases": "an", "type": "power",
         "powers": [[-3000.0, 0.0]],
         "flexible_params": [{
            "control_p": {"type": "p_max_u_production", "u_up": 245.0, "u_max": 250.0},
            "control_q": {"type": "q_u", "u_min": 210.0, "u_down": 220.0,
                          "u_up": 240.0, "u_max": 245.0, "alpha": 100.0},
            "projection": {"type": "euclidean"},
            "s_max": 4000.0
         }]}
    ],
    "lines_params": [
        {"id": "lp",
         "z_line": [[[0.2, 0.0, 0.0, 0.0], [0.0, 0.2, 0.0, 0.0],
                      [0.0, 0.0, 0.2, 0.0], [0.0, 0.0, 0.0, 0.2]],
                     [[0.1, 0.0, 0.0, 0.0], [0.0, 0.1, 0.0, 0.0],
                      [0.0, 0.0, 0.1, 0.0], [0.0, 0.0, 0.0, 0.1]]]}
    ]
}"#;

#[test]
fn json_feeder_solves_and_reports() {
    init();
    let network = network_from_json(FEEDER, &EmptyCatalogue).unwrap();
    let results = network
        .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
        .unwrap();

    // power balance: the source supplies the loads and the line losses
    let supplied: Complex64 = results.sources["vs"].powers.iter().sum();
    let consumed: Complex64 = results
        .loads
        .values()
        .flat_map(|load| load.powers.iter())
        .sum();
    let losses = results.lines["line"].losses();
    assert_abs_diff_eq!((supplied + consumed + losses).norm(), 0.0, epsilon = 1e-6);
    assert!(losses.re > 0.0);

    // the neutral is grounded at the source through a zero impedance
    assert_abs_diff_eq!(results.grounds["g"].norm(), 0.0, epsilon = 1e-9);
    let neutral = results.buses["source"].potentials[3];
    assert_abs_diff_eq!(neutral.norm(), 0.0, epsilon = 1e-9);

    let pv = results.loads["pv"].flexible_powers.as_ref().unwrap()[0];
    assert_abs_diff_eq!(pv.re, -3000.0, epsilon = 1e-3);
    assert!(results.loads["house"].flexible_powers.is_none());

    let under = results
        .violations
        .iter()
        .filter(|v| v.bus == "source" && v.kind == ViolationKind::Under)
        .count();
    let over = results
        .violations
        .iter()
        .filter(|v| v.bus == "load" && v.kind == ViolationKind::Over)
        .count();
    assert_eq!((under, over), (3, 3));

    let json = results.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value["loads"]["pv"]["flexible_powers"].is_array());
    assert_eq!(value["buses"]["load"]["phases"], "abcn");
    assert!(results.to_string().contains("Voltage violations"));
}

#[test]
fn network_edits_are_validated() {
    init();
    let mut network = network_from_json(FEEDER, &EmptyCatalogue).unwrap();
    let before = network.elements().len();

    let err = network
        .add(PotentialRef::on_bus("pref2", "load", None))
        .unwrap_err();
    assert!(matches!(err, TopologyError::MultiplePotentialRefs { .. }));
    assert_eq!(network.elements().len(), before);

    let err = network.remove(ElementKind::PotentialRef, "pref").unwrap_err();
    assert!(matches!(err, TopologyError::MissingPotentialRef { .. }));
    assert!(network.element(ElementKind::PotentialRef, "pref").is_some());

    let removed = network.remove(ElementKind::Load, "heater").unwrap();
    assert_eq!(removed.id(), "heater");
    network
        .add(Load::current("heater", "load", "cn", vec![c(2.0, 0.0)]).unwrap())
        .unwrap();
    let results = network
        .solve_load_flow(&mut SparseLuSolver, &LoadFlowOptions::default())
        .unwrap();
    assert_abs_diff_eq!(results.loads["heater"].currents[0].norm(), 2.0, epsilon = 1e-9);
}
