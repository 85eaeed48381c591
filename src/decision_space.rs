use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bounds::{Bounds, BoundsCalculator, BoundsTable};
pub use crate::catalog::Category;
use crate::catalog::ReferenceCatalog;
use crate::eligibility::{EligibilityCell, EligibilityResolver, EligibilityTable};
use crate::error::{OptError, Result};
use crate::geography::{GeographyResolver, ResolvedGeography};

/// The geography/agency/sector part of a user selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub scale: String,
    pub area_names: Vec<String>,
    pub agency_codes: Vec<String>,
    pub sector_names: Vec<String>,
}

impl Selection {
    /// Checks that every dimension `category` needs was supplied.
    /// Land practices need agencies; animal and manure practices do not.
    pub fn validate_for(&self, category: Category) -> Result<()> {
        if self.scale.trim().is_empty() {
            return Err(OptError::IncompleteSelection {
                category,
                dimension: "scale",
            });
        }
        if self.area_names.is_empty() {
            return Err(OptError::IncompleteSelection {
                category,
                dimension: "area_names",
            });
        }
        if self.sector_names.is_empty() {
            return Err(OptError::IncompleteSelection {
                category,
                dimension: "sector_names",
            });
        }
        if category == Category::Land && self.agency_codes.is_empty() {
            return Err(OptError::IncompleteSelection {
                category,
                dimension: "agency_codes",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategorySpace {
    pub eligibility: EligibilityTable,
    pub bounds: BoundsTable,
}

/// Eligible cells and their bounds for one fixed selection.
///
/// Never mutated after `build`; a different selection means a new instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionSpace {
    selection: Selection,
    geography: ResolvedGeography,
    spaces: BTreeMap<Category, CategorySpace>,
}

impl DecisionSpace {
    pub fn build(
        catalog: &ReferenceCatalog,
        selection: &Selection,
        categories: &[Category],
    ) -> Result<Self> {
        for &category in categories {
            selection.validate_for(category)?;
        }

        let geography =
            GeographyResolver::new(catalog).resolve_named(&selection.scale, &selection.area_names)?;
        let resolver = EligibilityResolver::new(catalog, &selection.sector_names)?;
        let calculator = BoundsCalculator::new(catalog);

        let mut spaces = BTreeMap::new();
        for &category in categories {
            if spaces.contains_key(&category) {
                continue;
            }
            let eligibility = match category {
                Category::Land => resolver.resolve_land(&geography, &selection.agency_codes)?,
                Category::Animal => resolver.resolve_animal(&geography)?,
                Category::Manure => resolver.resolve_manure(&geography)?,
            };
            let bounds = calculator.compute(&eligibility)?;
            spaces.insert(
                category,
                CategorySpace {
                    eligibility,
                    bounds,
                },
            );
        }

        Ok(Self {
            selection: selection.clone(),
            geography,
            spaces,
        })
    }

    /// Builds every category the selection has the dimensions for.
    pub fn build_available(catalog: &ReferenceCatalog, selection: &Selection) -> Result<Self> {
        let categories: Vec<Category> = Category::ALL
            .into_iter()
            .filter(|&c| selection.validate_for(c).is_ok())
            .collect();
        if categories.is_empty() {
            // Surface the reason the narrowest category fails.
            selection.validate_for(Category::Animal)?;
        }
        Self::build(catalog, selection, &categories)
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn geography(&self) -> &ResolvedGeography {
        &self.geography
    }

    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.spaces.keys().copied()
    }

    pub fn space(&self, category: Category) -> Result<&CategorySpace> {
        if let Some(space) = self.spaces.get(&category) {
            return Ok(space);
        }
        self.selection.validate_for(category)?;
        Err(OptError::reference(format!(
            "{category} practices were not built for this decision space"
        )))
    }

    pub fn eligibility(&self, category: Category) -> Result<&EligibilityTable> {
        Ok(&self.space(category)?.eligibility)
    }

    pub fn eligible_bmps(&self, category: Category) -> Result<Vec<String>> {
        Ok(self.space(category)?.eligibility.eligible_bmps())
    }

    pub fn bounds(&self, category: Category) -> Result<&BoundsTable> {
        Ok(&self.space(category)?.bounds)
    }

    pub fn cell_bounds(&self, cell: &EligibilityCell) -> Result<&Bounds> {
        self.bounds(cell.row.category())?
            .get(cell)
            .ok_or_else(|| OptError::reference(format!("cell {cell} is not in the decision space")))
    }

    /// Cells in a stable order (the bounds table's key order).
    pub fn enumerate_cells(&self, category: Category) -> Result<Vec<EligibilityCell>> {
        Ok(self.bounds(category)?.cells.keys().cloned().collect())
    }

    pub fn bounds_json(&self, category: Category) -> Result<String> {
        self.bounds(category)?.to_json()
    }
}
