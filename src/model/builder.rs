use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::{Category, Pollutant, ReferenceCatalog};
use crate::decision_space::DecisionSpace;
use crate::eligibility::RowKey;
use crate::error::{OptError, Result};

use super::expr::{GroupTerm, LoadExpr, MemberTerm, PerPollutant};
use super::{
    BuildState, Constraint, ConstraintKind, ObjectiveSpec, OptimizationModel, VarKey, Variable,
    MODEL_UNIT,
};

/// Staged construction of an [`OptimizationModel`] from a decision space's land cells.
///
/// Stages must run in [`BuildState`] order; calling one out of turn fails with
/// `ModelNotReady` and leaves the builder unchanged.
pub struct ModelBuilder<'a> {
    catalog: &'a ReferenceCatalog,
    space: &'a DecisionSpace,
    model: OptimizationModel,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(catalog: &'a ReferenceCatalog, space: &'a DecisionSpace, spec: ObjectiveSpec) -> Self {
        Self {
            catalog,
            space,
            model: OptimizationModel::empty(spec),
        }
    }

    pub fn state(&self) -> BuildState {
        self.model.state
    }

    /// Runs every stage in order.
    pub fn build(mut self) -> Result<OptimizationModel> {
        self.load_sets()?;
        self.load_parameters()?;
        self.declare_variables()?;
        self.load_constraints()?;
        self.load_objective()?;
        self.finish()
    }

    fn require(&self, expected: BuildState) -> Result<()> {
        if self.model.state == expected {
            Ok(())
        } else {
            Err(OptError::ModelNotReady {
                expected,
                found: self.model.state,
            })
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.model.state.next() {
            tracing::debug!(from = ?self.model.state, to = ?next, "model stage");
            self.model.state = next;
        }
    }

    pub fn load_sets(&mut self) -> Result<()> {
        self.require(BuildState::Unbuilt)?;
        let eligibility = self.space.eligibility(Category::Land)?;

        let mut segments = BTreeSet::new();
        let mut loadsources = BTreeSet::new();
        let mut links = BTreeSet::new();
        for row in &eligibility.rows {
            let RowKey::Land {
                segment,
                loadsource,
                ..
            } = &row.key
            else {
                continue;
            };
            segments.insert(segment.clone());
            loadsources.insert(loadsource.clone());
            for bmp in &row.bmps {
                links.insert(VarKey {
                    bmp: bmp.clone(),
                    segment: segment.clone(),
                    loadsource: loadsource.clone(),
                });
            }
        }
        if links.is_empty() {
            return Err(OptError::EmptyDecisionSpace {
                pollutant: None,
                reason: format!(
                    "no eligible land BMPs in {} selected segment(s)",
                    self.space.geography().segments.len()
                ),
            });
        }

        let mut bmps = BTreeSet::new();
        let mut group_members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut bmp_loadsource_links = BTreeSet::new();
        let mut group_loadsource_links = BTreeSet::new();
        for link in &links {
            let record = self.catalog.bmp(&link.bmp).ok_or_else(|| {
                OptError::reference(format!("eligible bmp '{}' missing from catalog", link.bmp))
            })?;
            bmps.insert(link.bmp.clone());
            group_members
                .entry(record.bmp_group.clone())
                .or_default()
                .insert(link.bmp.clone());
            bmp_loadsource_links.insert((link.bmp.clone(), link.loadsource.clone()));
            group_loadsource_links.insert((record.bmp_group.clone(), link.loadsource.clone()));
        }

        let sets = &mut self.model.sets;
        sets.pollutants = Pollutant::ALL.to_vec();
        sets.segments = segments.into_iter().collect();
        sets.bmps = bmps.into_iter().collect();
        sets.bmp_groups = group_members.keys().cloned().collect();
        sets.group_members = group_members;
        sets.loadsources = loadsources.into_iter().collect();
        sets.bmp_loadsource_links = bmp_loadsource_links;
        sets.group_loadsource_links = group_loadsource_links;
        sets.links = links;

        tracing::info!(
            segments = sets.segments.len(),
            bmps = sets.bmps.len(),
            groups = sets.bmp_groups.len(),
            links = sets.links.len(),
            "model sets loaded"
        );
        self.advance();
        Ok(())
    }

    pub fn load_parameters(&mut self) -> Result<()> {
        self.require(BuildState::SetsLoaded)?;
        let eligibility = self.space.eligibility(Category::Land)?;

        // Agencies collapse: a cell's units are the sum over the selected agencies.
        let mut total_units: BTreeMap<(String, String), f64> = BTreeMap::new();
        for row in &eligibility.rows {
            if let RowKey::Land {
                segment,
                loadsource,
                ..
            } = &row.key
            {
                *total_units
                    .entry((segment.clone(), loadsource.clone()))
                    .or_insert(0.0) += row.total_units;
            }
        }

        let base_load: BTreeMap<(String, String), PerPollutant> = total_units
            .keys()
            .map(|(segment, loadsource)| {
                let loads = Pollutant::ALL.map(|p| self.catalog.base_load(segment, loadsource, p));
                ((segment.clone(), loadsource.clone()), loads)
            })
            .collect();

        let effectiveness: BTreeMap<VarKey, PerPollutant> = self
            .model
            .sets
            .links
            .iter()
            .map(|key| {
                let eff = Pollutant::ALL.map(|p| {
                    self.catalog
                        .effectiveness(&key.bmp, p, &key.segment, &key.loadsource)
                });
                (key.clone(), eff)
            })
            .collect();

        let mut unit_cost = BTreeMap::new();
        for bmp in &self.model.sets.bmps {
            if let Some(record) = self.catalog.bmp(bmp) {
                unit_cost.insert(bmp.clone(), record.cost_per_unit);
            }
        }

        let spec = &self.model.spec;
        spec.validate(&self.model.sets.segments)?;
        let mut targets = BTreeMap::new();
        for segment in &self.model.sets.segments {
            for pollutant in Pollutant::ALL {
                targets.insert(
                    (segment.clone(), pollutant),
                    spec.target_for(segment, pollutant),
                );
            }
        }
        let cost_ceiling = match spec {
            ObjectiveSpec::LoadMaximizing { cost_ceiling, .. } => Some(*cost_ceiling),
            ObjectiveSpec::CostMinimizing { .. } => None,
        };

        let params = &mut self.model.params;
        params.unit_cost = unit_cost;
        params.effectiveness = effectiveness;
        params.base_load = base_load;
        params.total_units = total_units;
        params.targets = targets;
        params.cost_ceiling = cost_ceiling;

        tracing::info!(
            cells = params.total_units.len(),
            "model parameters loaded"
        );
        self.advance();
        Ok(())
    }

    pub fn declare_variables(&mut self) -> Result<()> {
        self.require(BuildState::ParametersLoaded)?;
        let model = &mut self.model;

        for key in &model.sets.links {
            let capacity = model
                .params
                .total_units
                .get(&(key.segment.clone(), key.loadsource.clone()))
                .copied()
                .unwrap_or(0.0);
            let unit_cost = model.params.unit_cost.get(&key.bmp).copied().unwrap_or(0.0);
            model.var_index.insert(key.clone(), model.variables.len());
            model.variables.push(Variable {
                key: key.clone(),
                lower: 0.0,
                upper: capacity,
                unit_cost,
                unit: MODEL_UNIT.to_string(),
            });
        }

        // One reduced-load expression per (segment, loadsource) cell, groups in name order.
        for ((segment, loadsource), &total) in &model.params.total_units {
            let mut groups = Vec::new();
            for (group, members) in &model.sets.group_members {
                if !model
                    .sets
                    .group_loadsource_links
                    .contains(&(group.clone(), loadsource.clone()))
                {
                    continue;
                }
                let terms: Vec<MemberTerm> = members
                    .iter()
                    .filter_map(|bmp| {
                        let key = VarKey {
                            bmp: bmp.clone(),
                            segment: segment.clone(),
                            loadsource: loadsource.clone(),
                        };
                        let var = *model.var_index.get(&key)?;
                        let effectiveness = model.params.effectiveness.get(&key).copied()?;
                        Some(MemberTerm { var, effectiveness })
                    })
                    .collect();
                if !terms.is_empty() {
                    groups.push(GroupTerm {
                        group: group.clone(),
                        members: terms,
                    });
                }
            }
            let base_load = model
                .params
                .base_load
                .get(&(segment.clone(), loadsource.clone()))
                .copied()
                .unwrap_or([0.0; 3]);
            model
                .loads_by_segment
                .entry(segment.clone())
                .or_default()
                .push(model.loads.len());
            model.loads.push(LoadExpr {
                segment: segment.clone(),
                loadsource: loadsource.clone(),
                total_units: total,
                base_load,
                groups,
            });
        }

        // Original load is the same expression at x = 0, summed in the same order.
        let zero = vec![0.0; model.variables.len()];
        let mut original_load = BTreeMap::new();
        for (segment, indices) in &model.loads_by_segment {
            for pollutant in Pollutant::ALL {
                let load: f64 = indices
                    .iter()
                    .map(|&i| model.loads[i].reduced_load(pollutant, &zero))
                    .sum();
                original_load.insert((segment.clone(), pollutant), load);
            }
        }
        model.params.original_load = original_load;

        tracing::info!(
            variables = model.variables.len(),
            load_cells = model.loads.len(),
            "model variables declared"
        );
        self.advance();
        Ok(())
    }

    pub fn load_constraints(&mut self) -> Result<()> {
        self.require(BuildState::VariablesDeclared)?;
        self.check_pollutant_coverage()?;
        let model = &mut self.model;

        let mut constraints = Vec::new();
        for load in &model.loads {
            for group in &load.groups {
                constraints.push(Constraint {
                    name: format!(
                        "units[{},{},{}]",
                        group.group, load.segment, load.loadsource
                    ),
                    kind: ConstraintKind::UnitNonExceedance {
                        group: group.group.clone(),
                        segment: load.segment.clone(),
                        loadsource: load.loadsource.clone(),
                        vars: group.members.iter().map(|m| m.var).collect(),
                        capacity: load.total_units,
                    },
                    active: true,
                });
            }
        }
        constraints.extend(
            model
                .spec
                .constraints(&model.sets.segments, &model.params.targets),
        );

        let active = constraints.iter().filter(|c| c.active).count();
        tracing::info!(
            constraints = constraints.len(),
            active,
            mode = %model.spec.mode(),
            "model constraints loaded"
        );
        model.constraints = constraints;
        self.advance();
        Ok(())
    }

    /// Every pollutant the mode must reduce needs at least one variable with nonzero
    /// effectiveness. Segments with no original load are vacuous and skipped.
    fn check_pollutant_coverage(&self) -> Result<()> {
        let model = &self.model;
        let reduces = |segment: Option<&str>, pollutant: Pollutant| {
            model.variables.iter().any(|v| {
                segment.map_or(true, |s| v.key.segment == s)
                    && model
                        .params
                        .effectiveness
                        .get(&v.key)
                        .map_or(false, |eff| eff[pollutant.index()] != 0.0)
            })
        };

        match &model.spec {
            ObjectiveSpec::CostMinimizing { .. } => {
                for ((segment, pollutant), &target) in &model.params.targets {
                    if target <= 0.0 || model.original_load(segment, *pollutant) == 0.0 {
                        continue;
                    }
                    if !reduces(Some(segment.as_str()), *pollutant) {
                        return Err(OptError::EmptyDecisionSpace {
                            pollutant: Some(*pollutant),
                            reason: format!(
                                "{target}% target on segment '{segment}' but no eligible BMP reduces it"
                            ),
                        });
                    }
                }
            }
            ObjectiveSpec::LoadMaximizing { pollutant, .. } => {
                if !reduces(None, *pollutant) {
                    return Err(OptError::EmptyDecisionSpace {
                        pollutant: Some(*pollutant),
                        reason: "no eligible BMP reduces the objective pollutant".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn load_objective(&mut self) -> Result<()> {
        self.require(BuildState::ConstraintsLoaded)?;
        self.model.objectives = self.model.spec.objectives();
        self.advance();
        Ok(())
    }

    pub fn finish(mut self) -> Result<OptimizationModel> {
        self.require(BuildState::ObjectiveLoaded)?;
        self.advance();
        tracing::info!(
            mode = %self.model.mode(),
            variables = self.model.variables.len(),
            constraints = self.model.constraints.len(),
            "model built"
        );
        Ok(self.model)
    }
}
