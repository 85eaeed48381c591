//! Decision space and nonlinear model construction for watershed BMP optimisation.
//!
//! A fixed [`ReferenceCatalog`] is resolved against a [`Selection`] into a
//! [`DecisionSpace`] of eligible (row, BMP) cells with bounds. From there callers either
//! draw [`sampler::Scenario`]s or build an [`OptimizationModel`] and hand it to a
//! [`solver::SolverAdapter`].

pub mod bounds;
pub mod catalog;
pub mod config;
pub mod decision_space;
pub mod eligibility;
pub mod error;
pub mod geography;
pub mod model;
pub mod results;
pub mod sampler;
pub mod solver;

pub use catalog::{Category, Pollutant, ReferenceCatalog};
pub use decision_space::{DecisionSpace, Selection};
pub use error::{OptError, Result};
pub use model::{ModelBuilder, ObjectiveMode, ObjectiveSpec, OptimizationModel};

#[cfg(test)]
mod tests;
