use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{OptimizationModel, VarKey};
use crate::solver::SolverOutput;

/// Values at or below this magnitude are treated as "not implemented".
pub const MATERIALITY_TOL: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub bmp: String,
    #[serde(rename = "segment_or_county")]
    pub segment: String,
    pub loadsource: String,
    pub amount: f64,
    pub unit: String,
    pub unit_cost: f64,
    pub total_cost: f64,
    pub objective_value: Option<f64>,
    pub dual: Option<f64>,
}

pub struct ResultExtractor<'a> {
    model: &'a OptimizationModel,
}

impl<'a> ResultExtractor<'a> {
    pub fn new(model: &'a OptimizationModel) -> Self {
        Self { model }
    }

    /// Flat table of the material, non-stale solved values.
    ///
    /// Values for variables the model does not know are skipped with a warning.
    pub fn extract(&self, output: &SolverOutput) -> Vec<ResultRow> {
        let duals: BTreeMap<VarKey, f64> = output
            .duals
            .iter()
            .map(|d| {
                (
                    VarKey {
                        bmp: d.bmp.clone(),
                        segment: d.segment.clone(),
                        loadsource: d.loadsource.clone(),
                    },
                    d.value,
                )
            })
            .collect();
        let objective_value = output
            .objective
            .or_else(|| self.model.objective_value(&output.point(self.model)));

        let mut rows = Vec::new();
        let mut unknown = 0usize;
        for value in &output.variables {
            if value.stale || value.value.abs() <= MATERIALITY_TOL {
                continue;
            }
            let key = value.key();
            let Some(index) = self.model.variable_index(&key) else {
                unknown += 1;
                continue;
            };
            let variable = &self.model.variables()[index];
            rows.push(ResultRow {
                bmp: key.bmp.clone(),
                segment: key.segment.clone(),
                loadsource: key.loadsource.clone(),
                amount: value.value,
                unit: variable.unit.clone(),
                unit_cost: variable.unit_cost,
                total_cost: variable.unit_cost * value.value,
                objective_value,
                dual: duals.get(&key).copied(),
            });
        }
        rows.sort_by(|a, b| {
            (&a.bmp, &a.segment, &a.loadsource).cmp(&(&b.bmp, &b.segment, &b.loadsource))
        });

        if unknown > 0 {
            tracing::warn!(unknown, "solver reported variables missing from the model");
        }
        tracing::info!(
            rows = rows.len(),
            reported = output.variables.len(),
            "extracted results"
        );
        rows
    }
}

pub fn write_csv<W: Write>(writer: W, rows: &[ResultRow]) -> Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    for row in rows {
        out.serialize(row)?;
    }
    out.flush()?;
    Ok(())
}
