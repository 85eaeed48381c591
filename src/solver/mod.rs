//! Boundary to external nonlinear solvers.

pub mod subprocess;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{OptimizationModel, VarKey};
pub use subprocess::SubprocessSolver;

pub const DEFAULT_SOLVE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolveOptions {
    pub timeout: Duration,
    pub want_duals: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_SOLVE_TIMEOUT_SECS),
            want_duals: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    pub bmp: String,
    pub segment: String,
    pub loadsource: String,
    pub value: f64,
    /// Set when the solver never touched the variable.
    #[serde(default)]
    pub stale: bool,
}

impl VariableValue {
    pub fn key(&self) -> VarKey {
        VarKey {
            bmp: self.bmp.clone(),
            segment: self.segment.clone(),
            loadsource: self.loadsource.clone(),
        }
    }
}

/// Bound multiplier reported for one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualValue {
    pub bmp: String,
    pub segment: String,
    pub loadsource: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOutput {
    pub status: String,
    #[serde(default)]
    pub objective: Option<f64>,
    #[serde(default)]
    pub variables: Vec<VariableValue>,
    #[serde(default)]
    pub duals: Vec<DualValue>,
}

impl SolverOutput {
    /// Solved values laid out like the model's variables. Unreported variables are 0.
    pub fn point(&self, model: &OptimizationModel) -> Vec<f64> {
        let mut x = model.zero_point();
        for value in &self.variables {
            if let Some(i) = model.variable_index(&value.key()) {
                x[i] = value.value;
            }
        }
        x
    }
}

pub fn is_infeasible_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "infeasible" | "locally_infeasible" | "locally-infeasible" | "infeasible_problem_detected"
    )
}

pub fn is_success_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "optimal" | "locally_optimal" | "locally-optimal" | "solve_succeeded" | "feasible"
    )
}

/// Solves a built model. Implementations must honour `options.timeout` and leave the
/// model untouched so it can be solved again.
pub trait SolverAdapter {
    fn name(&self) -> &str;

    fn solve(
        &self,
        model: &OptimizationModel,
        options: &SolveOptions,
    ) -> impl Future<Output = Result<SolverOutput>> + Send;
}
