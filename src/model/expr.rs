//! Reduced-load expression for one (segment, load source) cell.
//!
//! ```text
//! reduced(l,u,p) = base(l,u,p) * total(l,u)
//!     * prod_g ( 1 - sum_{b in g} x[b,l,u] / total(l,u) * eff(b,p,l,u) )
//! ```
//! Groups not applicable to `u` or with no variable on this cell contribute a factor of 1.

use serde::{Deserialize, Serialize};

use crate::catalog::Pollutant;

/// At or below this many available units a cell's BMP terms contribute nothing.
pub const TOTAL_UNITS_EPS: f64 = 1e-6;

/// Per-pollutant values indexed by [`Pollutant::index`].
pub type PerPollutant = [f64; 3];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberTerm {
    pub var: usize,
    pub effectiveness: PerPollutant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTerm {
    pub group: String,
    pub members: Vec<MemberTerm>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadExpr {
    pub segment: String,
    pub loadsource: String,
    pub total_units: f64,
    pub base_load: PerPollutant,
    pub groups: Vec<GroupTerm>,
}

impl LoadExpr {
    /// Load with no BMPs applied.
    pub fn original_load(&self, pollutant: Pollutant) -> f64 {
        self.base_load[pollutant.index()] * self.total_units
    }

    /// Fractional reduction one group applies at `x`. Zero when the cell has no units.
    pub fn group_reduction(&self, group: &GroupTerm, pollutant: Pollutant, x: &[f64]) -> f64 {
        if self.total_units <= TOTAL_UNITS_EPS {
            return 0.0;
        }
        group
            .members
            .iter()
            .map(|m| x[m.var] / self.total_units * m.effectiveness[pollutant.index()])
            .sum()
    }

    pub fn reduced_load(&self, pollutant: Pollutant, x: &[f64]) -> f64 {
        let mut load = self.original_load(pollutant);
        for group in &self.groups {
            load *= 1.0 - self.group_reduction(group, pollutant, x);
        }
        load
    }

    pub fn variables(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups
            .iter()
            .flat_map(|g| g.members.iter().map(|m| m.var))
    }
}
