use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::catalog::{BmpUnitRecord, Category, ReferenceCatalog};
use crate::eligibility::{EligibilityCell, EligibilityRow, EligibilityTable};
use crate::error::{OptError, Result};

pub const PERCENT_UNIT: &str = "percent";

/// Unit precedence, highest first. The first unit a cell supports wins and every other
/// declared unit on that cell is discarded.
pub const UNIT_PRECEDENCE: [&str; 13] = [
    PERCENT_UNIT,
    "acres",
    "feet",
    "acre-feet",
    "animal units",
    "dry tons",
    "wet tons",
    "lbs n",
    "lbs p",
    "lbs",
    "gallons",
    "systems",
    "oysters",
];

/// Units whose upper bound is the quantity available on the row itself.
pub const CAPACITY_UNITS: [&str; 3] = ["acres", "animal units", "dry tons"];

pub fn normalize_unit(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

pub fn is_capacity_unit(unit: &str) -> bool {
    CAPACITY_UNITS.contains(&unit)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub unit: String,
    pub lower: f64,
    pub upper: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn is_degenerate(&self) -> bool {
        self.lower == self.upper
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundsTable {
    pub category: Category,
    pub cells: BTreeMap<EligibilityCell, Bounds>,
}

/// Flat form of one bounds cell. JSON maps need string keys, so tables serialize as lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsEntry {
    pub cell: EligibilityCell,
    pub unit: String,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BoundsTableRecord {
    category: Category,
    cells: Vec<BoundsEntry>,
}

impl BoundsTable {
    pub fn entries(&self) -> Vec<BoundsEntry> {
        self.cells
            .iter()
            .map(|(cell, b)| BoundsEntry {
                cell: cell.clone(),
                unit: b.unit.clone(),
                lower: b.lower,
                upper: b.upper,
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        let record = BoundsTableRecord {
            category: self.category,
            cells: self.entries(),
        };
        Ok(serde_json::to_string(&record)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let record: BoundsTableRecord = serde_json::from_str(raw)?;
        let cells = record
            .cells
            .into_iter()
            .map(|e| {
                (
                    e.cell,
                    Bounds {
                        unit: e.unit,
                        lower: e.lower,
                        upper: e.upper,
                    },
                )
            })
            .collect();
        Ok(Self {
            category: record.category,
            cells,
        })
    }

    pub fn get(&self, cell: &EligibilityCell) -> Option<&Bounds> {
        self.cells.get(cell)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

pub struct BoundsCalculator<'a> {
    catalog: &'a ReferenceCatalog,
}

impl<'a> BoundsCalculator<'a> {
    pub fn new(catalog: &'a ReferenceCatalog) -> Self {
        Self { catalog }
    }

    pub fn compute(&self, table: &EligibilityTable) -> Result<BoundsTable> {
        let mut cells = BTreeMap::new();
        let mut by_unit: BTreeMap<String, usize> = BTreeMap::new();
        for row in &table.rows {
            for bmp in &row.bmps {
                let bounds = self.cell_bounds(row, bmp)?;
                *by_unit.entry(bounds.unit.clone()).or_insert(0) += 1;
                cells.insert(
                    EligibilityCell {
                        row: row.key.clone(),
                        bmp: bmp.clone(),
                    },
                    bounds,
                );
            }
        }
        tracing::info!(
            category = %table.category,
            cells = cells.len(),
            units = ?by_unit,
            "resolved cell bounds"
        );
        Ok(BoundsTable {
            category: table.category,
            cells,
        })
    }

    pub fn cell_bounds(&self, row: &EligibilityRow, bmp: &str) -> Result<Bounds> {
        let rules = self.catalog.unit_rules_for(bmp, row.key.loadsource());
        let (unit, declared_max) = select_unit(bmp, &row.key.to_string(), &rules)?;

        let (lower, upper): (f64, f64) = if unit == PERCENT_UNIT {
            (0.0, 100.0)
        } else if is_capacity_unit(&unit) {
            (0.0, row.total_units)
        } else {
            let max = declared_max.ok_or_else(|| {
                OptError::reference(format!(
                    "no upper bound for bmp '{bmp}' in unit '{unit}' on {}",
                    row.key
                ))
            })?;
            (0.0, max)
        };

        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            return Err(OptError::reference(format!(
                "invalid bounds [{lower}, {upper}] for bmp '{bmp}' in unit '{unit}' on {}",
                row.key
            )));
        }
        Ok(Bounds { unit, lower, upper })
    }
}

/// Apply unit precedence to the required rules of one cell.
/// Returns the surviving unit and its declared maximum, if any.
fn select_unit(bmp: &str, cell: &str, rules: &[&BmpUnitRecord]) -> Result<(String, Option<f64>)> {
    let required: Vec<(String, Option<f64>)> = rules
        .iter()
        .filter(|r| r.required)
        .map(|r| (normalize_unit(&r.unit), r.max_value))
        .collect();
    if required.is_empty() {
        return Err(OptError::reference(format!(
            "bmp '{bmp}' declares no required unit on {cell}"
        )));
    }

    let chosen = UNIT_PRECEDENCE
        .iter()
        .find(|unit| required.iter().any(|(u, _)| u.as_str() == **unit))
        .map(|unit| unit.to_string());

    let survivors: Vec<&(String, Option<f64>)> = match &chosen {
        Some(unit) => required.iter().filter(|(u, _)| u == unit).collect(),
        None => required.iter().collect(),
    };

    let distinct: BTreeSet<(String, Option<u64>)> = survivors
        .iter()
        .map(|(u, max)| (u.clone(), max.map(f64::to_bits)))
        .collect();
    if distinct.len() > 1 {
        return Err(OptError::AmbiguousUnit {
            bmp: bmp.to_string(),
            cell: cell.to_string(),
            units: distinct
                .into_iter()
                .map(|(u, max)| match max {
                    Some(bits) => format!("{u} (max {})", f64::from_bits(bits)),
                    None => u,
                })
                .collect(),
        });
    }

    let (unit, max) = survivors[0];
    Ok((unit.clone(), *max))
}
