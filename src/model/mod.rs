//! Nonlinear cost/load optimisation model over the land decision space.

pub mod builder;
pub mod expr;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::Pollutant;
use crate::error::{OptError, Result};
pub use builder::ModelBuilder;
pub use expr::{GroupTerm, LoadExpr, MemberTerm, PerPollutant, TOTAL_UNITS_EPS};

/// Unit of every model variable: land practices are sized in acres of the cell.
pub const MODEL_UNIT: &str = "acres";

/// Build stages, in order. Each builder step moves exactly one stage forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuildState {
    Unbuilt,
    SetsLoaded,
    ParametersLoaded,
    VariablesDeclared,
    ConstraintsLoaded,
    ObjectiveLoaded,
    Built,
}

impl BuildState {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Unbuilt => Some(Self::SetsLoaded),
            Self::SetsLoaded => Some(Self::ParametersLoaded),
            Self::ParametersLoaded => Some(Self::VariablesDeclared),
            Self::VariablesDeclared => Some(Self::ConstraintsLoaded),
            Self::ConstraintsLoaded => Some(Self::ObjectiveLoaded),
            Self::ObjectiveLoaded => Some(Self::Built),
            Self::Built => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectiveMode {
    CostMinimizing,
    LoadMaximizing,
}

impl fmt::Display for ObjectiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CostMinimizing => f.write_str("cost-minimizing"),
            Self::LoadMaximizing => f.write_str("load-maximizing"),
        }
    }
}

/// A percent-reduction target. `segment: None` applies to every modelled segment;
/// a segment-specific target overrides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub segment: Option<String>,
    pub pollutant: Pollutant,
    pub percent: f64,
}

/// Objective mode plus its parameters, chosen when the model is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ObjectiveSpec {
    CostMinimizing { targets: Vec<Target> },
    LoadMaximizing { pollutant: Pollutant, cost_ceiling: f64 },
}

impl ObjectiveSpec {
    pub fn mode(&self) -> ObjectiveMode {
        match self {
            Self::CostMinimizing { .. } => ObjectiveMode::CostMinimizing,
            Self::LoadMaximizing { .. } => ObjectiveMode::LoadMaximizing,
        }
    }

    /// Rejects targets and ceilings no model could honour, and segment targets
    /// naming a segment outside `segments`.
    pub fn validate(&self, segments: &[String]) -> Result<()> {
        match self {
            Self::CostMinimizing { targets } => {
                for target in targets {
                    let scope = match &target.segment {
                        Some(segment) => format!("segment '{segment}'"),
                        None => "every segment".to_string(),
                    };
                    check_target(&scope, target.pollutant, target.percent)?;
                    if let Some(segment) = &target.segment {
                        if !segments.contains(segment) {
                            return Err(OptError::invalid(format!(
                                "{} target names segment '{segment}', which is not in the model",
                                target.pollutant
                            )));
                        }
                    }
                }
                Ok(())
            }
            Self::LoadMaximizing { cost_ceiling, .. } => check_cost_ceiling(*cost_ceiling),
        }
    }

    /// Target for one segment and pollutant; 0 when nothing targets it.
    pub fn target_for(&self, segment: &str, pollutant: Pollutant) -> f64 {
        let Self::CostMinimizing { targets } = self else {
            return 0.0;
        };
        let specific = targets
            .iter()
            .find(|t| t.pollutant == pollutant && t.segment.as_deref() == Some(segment));
        let general = targets
            .iter()
            .find(|t| t.pollutant == pollutant && t.segment.is_none());
        specific.or(general).map_or(0.0, |t| t.percent)
    }

    /// Mode-specific constraints, added after the shared non-exceedance rows.
    /// Cost mode: one reduction constraint per segment and pollutant, active when
    /// its target is positive. Load mode: the cost ceiling.
    fn constraints(&self, segments: &[String], targets: &BTreeMap<(String, Pollutant), f64>) -> Vec<Constraint> {
        match self {
            Self::CostMinimizing { .. } => segments
                .iter()
                .flat_map(|segment| {
                    Pollutant::ALL.into_iter().map(move |pollutant| {
                        let target = targets
                            .get(&(segment.clone(), pollutant))
                            .copied()
                            .unwrap_or(0.0);
                        Constraint {
                            name: format!("reduction[{segment},{}]", pollutant.code()),
                            kind: ConstraintKind::PercentReduction {
                                segment: segment.clone(),
                                pollutant,
                            },
                            active: target > 0.0,
                        }
                    })
                })
                .collect(),
            Self::LoadMaximizing { .. } => vec![Constraint {
                name: "cost_ceiling".to_string(),
                kind: ConstraintKind::CostCeiling,
                active: true,
            }],
        }
    }

    /// Cost mode has one active total-cost objective. Load mode has one objective per
    /// pollutant with only the designated one active.
    fn objectives(&self) -> Vec<Objective> {
        match self {
            Self::CostMinimizing { .. } => vec![Objective {
                name: "total_cost".to_string(),
                kind: ObjectiveKind::TotalCost,
                sense: Sense::Minimize,
                active: true,
            }],
            Self::LoadMaximizing { pollutant, .. } => Pollutant::ALL
                .into_iter()
                .map(|p| Objective {
                    name: format!("percent_reduction[{}]", p.code()),
                    kind: ObjectiveKind::PercentReduction { pollutant: p },
                    sense: Sense::Maximize,
                    active: p == *pollutant,
                })
                .collect(),
        }
    }
}

fn check_target(scope: &str, pollutant: Pollutant, percent: f64) -> Result<()> {
    if !percent.is_finite() || percent < 0.0 {
        return Err(OptError::invalid(format!(
            "invalid {pollutant} target {percent} for {scope}"
        )));
    }
    Ok(())
}

fn check_cost_ceiling(ceiling: f64) -> Result<()> {
    if !ceiling.is_finite() || ceiling < 0.0 {
        return Err(OptError::invalid(format!("invalid cost ceiling {ceiling}")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarKey {
    pub bmp: String,
    pub segment: String,
    pub loadsource: String,
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x[{},{},{}]", self.bmp, self.segment, self.loadsource)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub key: VarKey,
    pub lower: f64,
    pub upper: f64,
    pub unit_cost: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSets {
    pub pollutants: Vec<Pollutant>,
    pub segments: Vec<String>,
    pub bmps: Vec<String>,
    pub bmp_groups: Vec<String>,
    pub group_members: BTreeMap<String, BTreeSet<String>>,
    pub loadsources: Vec<String>,
    pub bmp_loadsource_links: BTreeSet<(String, String)>,
    pub group_loadsource_links: BTreeSet<(String, String)>,
    /// (bmp, segment, loadsource) triples; one variable each.
    pub links: BTreeSet<VarKey>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelParameters {
    pub unit_cost: BTreeMap<String, f64>,
    pub effectiveness: BTreeMap<VarKey, PerPollutant>,
    pub base_load: BTreeMap<(String, String), PerPollutant>,
    pub total_units: BTreeMap<(String, String), f64>,
    pub original_load: BTreeMap<(String, Pollutant), f64>,
    pub targets: BTreeMap<(String, Pollutant), f64>,
    pub cost_ceiling: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConstraintKind {
    /// `percent_reduction(segment, pollutant) >= target(segment, pollutant)`
    PercentReduction { segment: String, pollutant: Pollutant },
    /// `total_cost <= cost_ceiling`
    CostCeiling,
    /// `sum(vars) <= capacity`: practices of one group share the cell's units.
    UnitNonExceedance {
        group: String,
        segment: String,
        loadsource: String,
        vars: Vec<usize>,
        capacity: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sense {
    Minimize,
    Maximize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ObjectiveKind {
    TotalCost,
    PercentReduction { pollutant: Pollutant },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub kind: ObjectiveKind,
    pub sense: Sense,
    pub active: bool,
}

/// JSON form of a built model, as handed to an external solver.
#[derive(Debug, Clone, Serialize)]
pub struct ModelPayload<'a> {
    pub mode: ObjectiveMode,
    pub pollutants: &'a [Pollutant],
    pub segments: &'a [String],
    pub variables: &'a [Variable],
    pub loads: &'a [LoadExpr],
    pub original_loads: Vec<OriginalLoadEntry<'a>>,
    pub targets: Vec<TargetEntry<'a>>,
    pub cost_ceiling: Option<f64>,
    pub constraints: &'a [Constraint],
    pub objectives: &'a [Objective],
}

#[derive(Debug, Clone, Serialize)]
pub struct OriginalLoadEntry<'a> {
    pub segment: &'a str,
    pub pollutant: Pollutant,
    pub load: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetEntry<'a> {
    pub segment: &'a str,
    pub pollutant: Pollutant,
    pub percent: f64,
}

/// Built by [`ModelBuilder`]; owned by one caller at a time.
///
/// Evaluation methods take `x` indexed like [`OptimizationModel::variables`].
#[derive(Debug, Clone)]
pub struct OptimizationModel {
    spec: ObjectiveSpec,
    state: BuildState,
    sets: ModelSets,
    params: ModelParameters,
    variables: Vec<Variable>,
    var_index: BTreeMap<VarKey, usize>,
    loads: Vec<LoadExpr>,
    loads_by_segment: BTreeMap<String, Vec<usize>>,
    constraints: Vec<Constraint>,
    objectives: Vec<Objective>,
}

impl OptimizationModel {
    fn empty(spec: ObjectiveSpec) -> Self {
        Self {
            spec,
            state: BuildState::Unbuilt,
            sets: ModelSets::default(),
            params: ModelParameters::default(),
            variables: Vec::new(),
            var_index: BTreeMap::new(),
            loads: Vec::new(),
            loads_by_segment: BTreeMap::new(),
            constraints: Vec::new(),
            objectives: Vec::new(),
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn mode(&self) -> ObjectiveMode {
        self.spec.mode()
    }

    pub fn spec(&self) -> &ObjectiveSpec {
        &self.spec
    }

    pub fn ensure_built(&self) -> Result<()> {
        if self.state == BuildState::Built {
            Ok(())
        } else {
            Err(OptError::ModelNotReady {
                expected: BuildState::Built,
                found: self.state,
            })
        }
    }

    pub fn sets(&self) -> &ModelSets {
        &self.sets
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.params
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable_index(&self, key: &VarKey) -> Option<usize> {
        self.var_index.get(key).copied()
    }

    pub fn loads(&self) -> &[LoadExpr] {
        &self.loads
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn constraint(&self, name: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.name == name)
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    pub fn active_objective(&self) -> Option<&Objective> {
        self.objectives.iter().find(|o| o.active)
    }

    pub fn segments(&self) -> &[String] {
        &self.sets.segments
    }

    pub fn zero_point(&self) -> Vec<f64> {
        vec![0.0; self.variables.len()]
    }

    /// Sum of `base_load * total_units` over the segment's load sources.
    pub fn original_load(&self, segment: &str, pollutant: Pollutant) -> f64 {
        self.params
            .original_load
            .get(&(segment.to_string(), pollutant))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn reduced_load(&self, segment: &str, pollutant: Pollutant, x: &[f64]) -> f64 {
        self.loads_by_segment
            .get(segment)
            .into_iter()
            .flatten()
            .map(|&i| self.loads[i].reduced_load(pollutant, x))
            .sum()
    }

    /// Fixed at 0 when the segment has no original load for `pollutant`.
    pub fn percent_reduction(&self, segment: &str, pollutant: Pollutant, x: &[f64]) -> f64 {
        let original = self.original_load(segment, pollutant);
        if original == 0.0 {
            return 0.0;
        }
        (original - self.reduced_load(segment, pollutant, x)) / original * 100.0
    }

    /// Percent reduction over every modelled segment together.
    pub fn aggregate_percent_reduction(&self, pollutant: Pollutant, x: &[f64]) -> f64 {
        let original: f64 = self
            .sets
            .segments
            .iter()
            .map(|s| self.original_load(s, pollutant))
            .sum();
        if original == 0.0 {
            return 0.0;
        }
        let reduced: f64 = self
            .sets
            .segments
            .iter()
            .map(|s| self.reduced_load(s, pollutant, x))
            .sum();
        (original - reduced) / original * 100.0
    }

    pub fn total_cost(&self, x: &[f64]) -> f64 {
        self.variables
            .iter()
            .zip(x)
            .map(|(v, value)| v.unit_cost * value)
            .sum()
    }

    /// Value of the active objective at `x`.
    pub fn objective_value(&self, x: &[f64]) -> Option<f64> {
        self.active_objective().map(|o| match o.kind {
            ObjectiveKind::TotalCost => self.total_cost(x),
            ObjectiveKind::PercentReduction { pollutant } => {
                self.aggregate_percent_reduction(pollutant, x)
            }
        })
    }

    pub fn target(&self, segment: &str, pollutant: Pollutant) -> f64 {
        self.params
            .targets
            .get(&(segment.to_string(), pollutant))
            .copied()
            .unwrap_or(0.0)
    }

    /// How far `x` is from satisfying `constraint`; 0 when satisfied.
    pub fn violation(&self, constraint: &Constraint, x: &[f64]) -> f64 {
        match &constraint.kind {
            ConstraintKind::PercentReduction { segment, pollutant } => {
                if self.original_load(segment, *pollutant) == 0.0 {
                    return 0.0;
                }
                let target = self.target(segment, *pollutant);
                (target - self.percent_reduction(segment, *pollutant, x)).max(0.0)
            }
            ConstraintKind::CostCeiling => {
                let ceiling = self.params.cost_ceiling.unwrap_or(0.0);
                (self.total_cost(x) - ceiling).max(0.0)
            }
            ConstraintKind::UnitNonExceedance { vars, capacity, .. } => {
                let used: f64 = vars.iter().map(|&i| x[i]).sum();
                (used - capacity).max(0.0)
            }
        }
    }

    /// Largest violation over variable bounds and active constraints.
    pub fn max_violation(&self, x: &[f64]) -> f64 {
        let bounds = self
            .variables
            .iter()
            .zip(x)
            .map(|(v, &value)| (v.lower - value).max(value - v.upper).max(0.0));
        let rows = self
            .constraints
            .iter()
            .filter(|c| c.active)
            .map(|c| self.violation(c, x));
        bounds.chain(rows).fold(0.0, f64::max)
    }

    pub fn is_feasible(&self, x: &[f64], tolerance: f64) -> bool {
        x.len() == self.variables.len() && self.max_violation(x) <= tolerance
    }

    fn reduction_constraint_mut(
        &mut self,
        segment: &str,
        pollutant: Pollutant,
    ) -> Result<&mut Constraint> {
        let mode = self.mode();
        self.constraints
            .iter_mut()
            .find(|c| {
                matches!(
                    &c.kind,
                    ConstraintKind::PercentReduction { segment: s, pollutant: p }
                        if s == segment && *p == pollutant
                )
            })
            .ok_or_else(|| {
                OptError::invalid(format!(
                    "no {pollutant} reduction constraint for segment '{segment}' in {mode} model"
                ))
            })
    }

    /// Sets a reduction target; a positive target activates the constraint, zero deactivates it.
    /// Zero-load segments accept any target and stay vacuously satisfied.
    pub fn set_target(&mut self, segment: &str, pollutant: Pollutant, percent: f64) -> Result<()> {
        self.ensure_built()?;
        check_target(&format!("segment '{segment}'"), pollutant, percent)?;
        let constraint = self.reduction_constraint_mut(segment, pollutant)?;
        constraint.active = percent > 0.0;
        self.params
            .targets
            .insert((segment.to_string(), pollutant), percent);
        tracing::debug!(segment, %pollutant, percent, "target updated");
        Ok(())
    }

    /// Deactivates the constraint but keeps it and its target in place.
    pub fn deactivate_target(&mut self, segment: &str, pollutant: Pollutant) -> Result<()> {
        self.ensure_built()?;
        self.reduction_constraint_mut(segment, pollutant)?.active = false;
        Ok(())
    }

    pub fn set_cost_ceiling(&mut self, ceiling: f64) -> Result<()> {
        self.ensure_built()?;
        if self.mode() != ObjectiveMode::LoadMaximizing {
            return Err(OptError::invalid(
                "cost ceiling only applies to load-maximizing models",
            ));
        }
        check_cost_ceiling(ceiling)?;
        self.params.cost_ceiling = Some(ceiling);
        if let ObjectiveSpec::LoadMaximizing { cost_ceiling, .. } = &mut self.spec {
            *cost_ceiling = ceiling;
        }
        Ok(())
    }

    /// Switches which pollutant's reduction objective is active.
    pub fn set_objective_pollutant(&mut self, pollutant: Pollutant) -> Result<()> {
        self.ensure_built()?;
        let ObjectiveSpec::LoadMaximizing { pollutant: current, .. } = &mut self.spec else {
            return Err(OptError::invalid(
                "objective pollutant only applies to load-maximizing models",
            ));
        };
        *current = pollutant;
        for objective in &mut self.objectives {
            objective.active = matches!(
                objective.kind,
                ObjectiveKind::PercentReduction { pollutant: p } if p == pollutant
            );
        }
        Ok(())
    }

    pub fn payload(&self) -> ModelPayload<'_> {
        ModelPayload {
            mode: self.mode(),
            pollutants: &self.sets.pollutants,
            segments: &self.sets.segments,
            variables: &self.variables,
            loads: &self.loads,
            original_loads: self
                .params
                .original_load
                .iter()
                .map(|((segment, pollutant), &load)| OriginalLoadEntry {
                    segment,
                    pollutant: *pollutant,
                    load,
                })
                .collect(),
            targets: self
                .params
                .targets
                .iter()
                .map(|((segment, pollutant), &percent)| TargetEntry {
                    segment,
                    pollutant: *pollutant,
                    percent,
                })
                .collect(),
            cost_ceiling: self.params.cost_ceiling,
            constraints: &self.constraints,
            objectives: &self.objectives,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        self.ensure_built()?;
        Ok(serde_json::to_string_pretty(&self.payload())?)
    }
}
