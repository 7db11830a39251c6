//! Reader for the persisted JSON network format.
//!
//! Complex numbers are `[re, im]` pairs and matrices are `[real_rows, imag_rows]`. Line and
//! transformer parameters are referenced by `params_id`, looked up first in the document's own
//! `lines_params` / `transformers_params` and then in the injected catalogue.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use log::{debug, info};
use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::Deserialize;

use crate::case::*;
use crate::catalogue::ParameterCatalogue;
use crate::error::{ConfigError, Error, Result};
use crate::flexible::{Control, DEFAULT_ALPHA, DEFAULT_EPSILON, FlexibleParameter};
use crate::phase::Phase;
use crate::projection::Projection;
use crate::transformer::TransformerParameters;

type ComplexData = [f64; 2];
type MatrixData = [Vec<Vec<f64>>; 2];

fn complex([re, im]: ComplexData) -> Complex64 {
    Complex64::new(re, im)
}

fn complexes(values: &[ComplexData]) -> Vec<Complex64> {
    values.iter().copied().map(complex).collect()
}

fn matrix(
    owner: &str,
    name: &str,
    [re, im]: &MatrixData,
) -> std::result::Result<DMatrix<Complex64>, ConfigError> {
    let n = re.len();
    let square = |rows: &Vec<Vec<f64>>| rows.len() == n && rows.iter().all(|r| r.len() == n);
    if n == 0 || !square(re) || !square(im) {
        return Err(ConfigError::InvalidParameter {
            element: owner.to_string(),
            message: format!("{name} must be a pair of square matrices of the same size"),
        });
    }
    Ok(DMatrix::from_fn(n, n, |i, j| Complex64::new(re[i][j], im[i][j])))
}

fn default_alpha() -> f64 {
    DEFAULT_ALPHA
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

fn default_tap() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct NetworkData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    buses: Vec<BusData>,
    #[serde(default)]
    grounds: Vec<GroundData>,
    #[serde(default)]
    ground_connections: Vec<GroundConnectionData>,
    #[serde(default)]
    potential_refs: Vec<PotentialRefData>,
    #[serde(default)]
    lines: Vec<LineData>,
    #[serde(default)]
    transformers: Vec<TransformerData>,
    #[serde(default)]
    switches: Vec<SwitchData>,
    #[serde(default)]
    sources: Vec<SourceData>,
    #[serde(default)]
    loads: Vec<LoadData>,
    #[serde(default)]
    lines_params: Vec<LineParametersData>,
    #[serde(default)]
    transformers_params: Vec<TransformerParametersData>,
}

#[derive(Debug, Deserialize)]
struct BusData {
    id: String,
    phases: String,
    min_voltage: Option<f64>,
    max_voltage: Option<f64>,
    initial_potentials: Option<Vec<ComplexData>>,
}

#[derive(Debug, Deserialize)]
struct GroundData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GroundConnectionData {
    id: String,
    ground: String,
    /// Bus id.
    element: String,
    phase: Phase,
    impedance: Option<ComplexData>,
    #[serde(default)]
    on_connected: OnConnected,
}

#[derive(Debug, Deserialize)]
struct PotentialRefData {
    id: String,
    /// Bus or ground id. A ground of that id wins unless a phase is given.
    element: String,
    phase: Option<Phase>,
}

#[derive(Debug, Deserialize)]
struct LineData {
    id: String,
    bus1: String,
    bus2: String,
    phases: String,
    params_id: String,
    length: f64,
    ground: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransformerData {
    id: String,
    bus1: String,
    bus2: String,
    phases1: Option<String>,
    phases2: Option<String>,
    params_id: String,
    #[serde(default = "default_tap")]
    tap: f64,
}

#[derive(Debug, Deserialize)]
struct SwitchData {
    id: String,
    bus1: String,
    bus2: String,
    phases: String,
}

#[derive(Debug, Deserialize)]
struct SourceData {
    id: String,
    bus: String,
    phases: String,
    voltages: Vec<ComplexData>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LoadData {
    Power {
        id: String,
        bus: String,
        phases: String,
        powers: Vec<ComplexData>,
        #[serde(default, alias = "flexible_param")]
        flexible_params: Option<Vec<FlexibleParameterData>>,
    },
    Current {
        id: String,
        bus: String,
        phases: String,
        currents: Vec<ComplexData>,
    },
    Impedance {
        id: String,
        bus: String,
        phases: String,
        impedances: Vec<ComplexData>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlData {
    Constant,
    PMaxUProduction {
        u_up: f64,
        u_max: f64,
        #[serde(default = "default_alpha")]
        alpha: f64,
    },
    PMaxUConsumption {
        u_min: f64,
        u_down: f64,
        #[serde(default = "default_alpha")]
        alpha: f64,
    },
    QU {
        u_min: f64,
        u_down: f64,
        u_up: f64,
        u_max: f64,
        #[serde(default = "default_alpha")]
        alpha: f64,
    },
}

impl ControlData {
    fn build(&self) -> std::result::Result<Control, ConfigError> {
        match *self {
            ControlData::Constant => Ok(Control::Constant),
            ControlData::PMaxUProduction { u_up, u_max, alpha } => {
                Control::p_max_u_production(u_up, u_max, alpha)
            }
            ControlData::PMaxUConsumption {
                u_min,
                u_down,
                alpha,
            } => Control::p_max_u_consumption(u_min, u_down, alpha),
            ControlData::QU {
                u_min,
                u_down,
                u_up,
                u_max,
                alpha,
            } => Control::q_u(u_min, u_down, u_up, u_max, alpha),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ProjectionData {
    Euclidean {
        #[serde(default = "default_alpha")]
        alpha: f64,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
}

#[derive(Debug, Deserialize)]
struct FlexibleParameterData {
    control_p: ControlData,
    control_q: ControlData,
    projection: Option<ProjectionData>,
    s_max: f64,
    q_min: Option<f64>,
    q_max: Option<f64>,
}

impl FlexibleParameterData {
    fn build(&self) -> std::result::Result<FlexibleParameter, ConfigError> {
        let projection = match self.projection {
            Some(ProjectionData::Euclidean { alpha, epsilon }) => {
                Projection::euclidean(alpha, epsilon)?
            }
            None => Projection::default(),
        };
        FlexibleParameter::new(
            self.control_p.build()?,
            self.control_q.build()?,
            projection,
            self.s_max,
            self.q_min,
            self.q_max,
        )
    }
}

#[derive(Debug, Deserialize)]
struct LineParametersData {
    id: String,
    z_line: MatrixData,
    y_shunt: Option<MatrixData>,
}

impl LineParametersData {
    fn build(&self) -> std::result::Result<LineParameters, ConfigError> {
        let z_line = matrix(&self.id, "z_line", &self.z_line)?;
        let y_shunt = self
            .y_shunt
            .as_ref()
            .map(|y| matrix(&self.id, "y_shunt", y))
            .transpose()?;
        LineParameters::new(self.id.clone(), z_line, y_shunt)
    }
}

/// Either the equivalent impedances or the open/short-circuit test results.
#[derive(Debug, Deserialize)]
struct TransformerParametersData {
    id: String,
    #[serde(alias = "type")]
    vg: String,
    sn: f64,
    uhv: f64,
    ulv: f64,
    z2: Option<ComplexData>,
    ym: Option<ComplexData>,
    i0: Option<f64>,
    p0: Option<f64>,
    psc: Option<f64>,
    vsc: Option<f64>,
}

impl TransformerParametersData {
    fn build(&self) -> std::result::Result<TransformerParameters, ConfigError> {
        let id = self.id.clone();
        match (self.z2, self.ym, self.i0, self.p0, self.psc, self.vsc) {
            (Some(z2), Some(ym), ..) => {
                let (z2, ym) = (complex(z2), complex(ym));
                TransformerParameters::new(id, &self.vg, self.sn, self.uhv, self.ulv, z2, ym)
            }
            (_, _, Some(i0), Some(p0), Some(psc), Some(vsc)) => {
                TransformerParameters::from_open_and_short_circuit_tests(
                    id, &self.vg, self.sn, self.uhv, self.ulv, i0, p0, psc, vsc,
                )
            }
            _ => Err(ConfigError::InvalidParameter {
                element: id,
                message: "either z2 and ym or i0, p0, psc and vsc are required".to_string(),
            }),
        }
    }
}

struct ParameterLookup<'a> {
    lines: HashMap<String, LineParameters>,
    transformers: HashMap<String, TransformerParameters>,
    catalogue: &'a dyn ParameterCatalogue,
}

impl ParameterLookup<'_> {
    fn line(&self, id: &str) -> Result<LineParameters> {
        self.lines
            .get(id)
            .cloned()
            .or_else(|| self.catalogue.line_parameters(id))
            .ok_or_else(|| Error::UnknownParameters {
                kind: "line",
                id: id.to_string(),
            })
    }

    fn transformer(&self, id: &str) -> Result<TransformerParameters> {
        self.transformers
            .get(id)
            .cloned()
            .or_else(|| self.catalogue.transformer_parameters(id))
            .ok_or_else(|| Error::UnknownParameters {
                kind: "transformer",
                id: id.to_string(),
            })
    }
}

/// Builds a network from its JSON document, validating every element and the topology.
pub fn network_from_json(text: &str, catalogue: &dyn ParameterCatalogue) -> Result<Network> {
    let data: NetworkData = serde_json::from_str(text)?;

    let mut lookup = ParameterLookup {
        lines: HashMap::new(),
        transformers: HashMap::new(),
        catalogue,
    };
    for params in &data.lines_params {
        lookup.lines.insert(params.id.clone(), params.build()?);
    }
    for params in &data.transformers_params {
        lookup.transformers.insert(params.id.clone(), params.build()?);
    }
    debug!(
        "Embedded parameters: {} line, {} transformer",
        lookup.lines.len(),
        lookup.transformers.len()
    );

    let ground_ids: HashSet<&str> = data.grounds.iter().map(|g| g.id.as_str()).collect();
    let mut elements: Vec<Element> = Vec::new();

    for bus in &data.buses {
        let mut b = Bus::new(bus.id.clone(), &bus.phases)?
            .with_voltage_limits(bus.min_voltage, bus.max_voltage);
        if let Some(potentials) = &bus.initial_potentials {
            b = b.with_initial_potentials(complexes(potentials))?;
        }
        elements.push(b.into());
    }
    for ground in &data.grounds {
        elements.push(Ground::new(ground.id.clone()).into());
    }
    for gc in &data.ground_connections {
        let connection =
            GroundConnection::new(gc.id.clone(), gc.ground.clone(), gc.element.clone(), gc.phase)
                .with_impedance(gc.impedance.map(complex).unwrap_or_default())
                .on_connected(gc.on_connected);
        elements.push(connection.into());
    }
    for pref in &data.potential_refs {
        let reference = if pref.phase.is_none() && ground_ids.contains(pref.element.as_str()) {
            PotentialRef::on_ground(pref.id.clone(), pref.element.clone())
        } else {
            PotentialRef::on_bus(pref.id.clone(), pref.element.clone(), pref.phase)
        };
        elements.push(reference.into());
    }
    for line in &data.lines {
        let params = lookup.line(&line.params_id)?;
        let mut l = Line::new(
            line.id.clone(),
            line.bus1.clone(),
            line.bus2.clone(),
            &line.phases,
            params,
            line.length,
        )?;
        if let Some(ground) = &line.ground {
            l = l.with_ground(ground.clone());
        }
        elements.push(l.into());
    }
    for tr in &data.transformers {
        let params = lookup.transformer(&tr.params_id)?;
        let mut t = match (&tr.phases1, &tr.phases2) {
            (Some(p1), Some(p2)) => {
                let (id, bus1, bus2) = (tr.id.clone(), tr.bus1.clone(), tr.bus2.clone());
                Transformer::on_phases(id, bus1, bus2, params, p1, p2)?
            }
            _ => Transformer::new(tr.id.clone(), tr.bus1.clone(), tr.bus2.clone(), params)?,
        };
        if tr.tap != 1.0 {
            t = t.with_tap(tr.tap)?;
        }
        elements.push(t.into());
    }
    for switch in &data.switches {
        let (id, bus1, bus2) = (switch.id.clone(), switch.bus1.clone(), switch.bus2.clone());
        elements.push(Switch::new(id, bus1, bus2, &switch.phases)?.into());
    }
    for source in &data.sources {
        elements.push(
            VoltageSource::new(
                source.id.clone(),
                source.bus.clone(),
                &source.phases,
                complexes(&source.voltages),
            )?
            .into(),
        );
    }
    for load in &data.loads {
        let l = match load {
            LoadData::Power {
                id,
                bus,
                phases,
                powers,
                flexible_params: Some(params),
            } => {
                let parameters = params
                    .iter()
                    .map(FlexibleParameterData::build)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Load::flexible(id.clone(), bus.clone(), phases, complexes(powers), parameters)?
            }
            LoadData::Power {
                id,
                bus,
                phases,
                powers,
                flexible_params: None,
            } => Load::power(id.clone(), bus.clone(), phases, complexes(powers))?,
            LoadData::Current {
                id,
                bus,
                phases,
                currents,
            } => Load::current(id.clone(), bus.clone(), phases, complexes(currents))?,
            LoadData::Impedance {
                id,
                bus,
                phases,
                impedances,
            } => Load::impedance(id.clone(), bus.clone(), phases, complexes(impedances))?,
        };
        elements.push(l.into());
    }

    info!(
        "Parsed {} buses, {} lines, {} transformers, {} switches, {} sources, {} loads",
        data.buses.len(),
        data.lines.len(),
        data.transformers.len(),
        data.switches.len(),
        data.sources.len(),
        data.loads.len(),
    );

    Ok(Network::new(data.name, elements)?)
}

/// Reads a JSON network file.
pub fn read_network(path: impl AsRef<Path>, catalogue: &dyn ParameterCatalogue) -> Result<Network> {
    let text = fs::read_to_string(path.as_ref())?;
    network_from_json(&text, catalogue)
}
