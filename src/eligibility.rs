//! Which BMPs may be applied on which (location, agency, load source) rows.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::{Category, LoadSourceKind, ReferenceCatalog};
use crate::error::{OptError, Result};
use crate::geography::ResolvedGeography;

/// BMPs redundant with the land-conversion and upland practices the model does not allocate.
pub const LAND_CONVERSION_EXCLUSIONS: &[&str] = &[
    "AbandonedMineReclamation",
    "AgStormwater",
    "ForestBuffers",
    "ForestBuffersNarrow",
    "ForestBuffersStreamside",
    "GrassBuffers",
    "GrassBuffersNarrow",
    "GrassBuffersStreamside",
    "ImperviousDisconnection",
    "ImperviousSurfaceReduction",
    "LandRetireHyoAg",
    "LandRetireOtherAg",
    "LandRetirePasture",
    "TreePlant",
    "UrbanForestBuffers",
    "UrbanForestPlantings",
    "UrbanTreePlanting",
    "WetlandCreation",
    "WetlandEnhancement",
    "WetlandRehabilitation",
    "WetlandRestoration",
];

/// Stream-restoration credit protocols; credited per protocol, not per acre.
pub const STREAM_RESTORATION_PROTOCOL_EXCLUSIONS: &[&str] = &[
    "NonUrbStrmRestPro1",
    "NonUrbStrmRestPro2",
    "NonUrbStrmRestPro3",
    "NonUrbStrmRestPro4",
    "UrbStrmRestPro1",
    "UrbStrmRestPro2",
    "UrbStrmRestPro3",
    "UrbStrmRestPro4",
];

/// Policy-category BMPs (permits, programs, ordinances) that are not field practices.
pub const POLICY_EXCLUSIONS: &[&str] = &[
    "ErosionSedimentControlLevel1",
    "ErosionSedimentControlLevel2",
    "ErosionSedimentControlLevel3",
    "MS4Permit",
    "NutrientManagementPolicy",
    "SepticConnect",
    "SepticDenitrification",
    "SepticPumping",
    "StormwaterPerformanceStandard",
    "UrbanNutrientManagementLaw",
];

pub fn is_excluded_bmp(bmp: &str) -> bool {
    LAND_CONVERSION_EXCLUSIONS.contains(&bmp)
        || STREAM_RESTORATION_PROTOCOL_EXCLUSIONS.contains(&bmp)
        || POLICY_EXCLUSIONS.contains(&bmp)
}

/// Row of a decision-space category.
///
/// Animal and manure rows carry no agency: those practices are filtered by county only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RowKey {
    Land {
        segment: String,
        agency: String,
        loadsource: String,
    },
    Animal {
        county: String,
        animal_group: String,
        loadsource: String,
    },
    Manure {
        county_from: String,
        /// None is transport out of the watershed.
        county_to: Option<String>,
        animal_group: String,
        loadsource: String,
    },
}

impl RowKey {
    pub fn category(&self) -> Category {
        match self {
            Self::Land { .. } => Category::Land,
            Self::Animal { .. } => Category::Animal,
            Self::Manure { .. } => Category::Manure,
        }
    }

    pub fn loadsource(&self) -> &str {
        match self {
            Self::Land { loadsource, .. }
            | Self::Animal { loadsource, .. }
            | Self::Manure { loadsource, .. } => loadsource,
        }
    }

    /// Segment for land rows, source county otherwise.
    pub fn location(&self) -> &str {
        match self {
            Self::Land { segment, .. } => segment,
            Self::Animal { county, .. } => county,
            Self::Manure { county_from, .. } => county_from,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Land {
                segment,
                agency,
                loadsource,
            } => write!(f, "land({segment}, {agency}, {loadsource})"),
            Self::Animal {
                county,
                animal_group,
                loadsource,
            } => write!(f, "animal({county}, {animal_group}, {loadsource})"),
            Self::Manure {
                county_from,
                county_to,
                animal_group,
                loadsource,
            } => write!(
                f,
                "manure({county_from} -> {}, {animal_group}, {loadsource})",
                county_to.as_deref().unwrap_or("<out of watershed>")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EligibilityCell {
    pub row: RowKey,
    pub bmp: String,
}

impl fmt::Display for EligibilityCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}", self.row, self.bmp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityRow {
    pub key: RowKey,
    /// Sorted and de-duplicated. May be empty.
    pub bmps: Vec<String>,
    /// Quantity available on the row in its category's capacity unit.
    pub total_units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityTable {
    pub category: Category,
    pub rows: Vec<EligibilityRow>,
}

impl EligibilityTable {
    pub fn cells(&self) -> impl Iterator<Item = EligibilityCell> + '_ {
        self.rows.iter().flat_map(|row| {
            row.bmps.iter().map(move |bmp| EligibilityCell {
                row: row.key.clone(),
                bmp: bmp.clone(),
            })
        })
    }

    pub fn cell_count(&self) -> usize {
        self.rows.iter().map(|row| row.bmps.len()).sum()
    }

    pub fn eligible_bmps(&self) -> Vec<String> {
        let set: BTreeSet<&String> = self.rows.iter().flat_map(|row| row.bmps.iter()).collect();
        set.into_iter().cloned().collect()
    }
}

pub struct EligibilityResolver<'a> {
    catalog: &'a ReferenceCatalog,
    sectors: BTreeSet<String>,
}

impl<'a> EligibilityResolver<'a> {
    pub fn new(catalog: &'a ReferenceCatalog, sectors: &[String]) -> Result<Self> {
        let mut selected = BTreeSet::new();
        for sector in sectors {
            if !catalog.has_sector(sector) {
                return Err(OptError::reference(format!("unknown sector '{sector}'")));
            }
            selected.insert(sector.clone());
        }
        Ok(Self {
            catalog,
            sectors: selected,
        })
    }

    /// Union of the BMPs mapped to every group of `loadsource`, restricted to `category`
    /// and with the fixed exclusion lists removed.
    fn bmps_for(&self, loadsource: &str, category: Category) -> Result<Vec<String>> {
        let mut bmps = BTreeSet::new();
        for group in self.catalog.loadsource_groups(loadsource)? {
            for bmp in self.catalog.bmps_for_loadsource_group(group) {
                if bmp.category == category && !is_excluded_bmp(&bmp.bmp) {
                    bmps.insert(bmp.bmp.clone());
                }
            }
        }
        Ok(bmps.into_iter().collect())
    }

    fn loadsource_selected(&self, loadsource: &str, kind: LoadSourceKind) -> Result<bool> {
        let record = self.catalog.loadsource(loadsource)?;
        Ok(record.kind == kind && self.sectors.contains(&record.sector))
    }

    pub fn resolve_land(
        &self,
        geography: &ResolvedGeography,
        agencies: &[String],
    ) -> Result<EligibilityTable> {
        for agency in agencies {
            if !self.catalog.has_agency(agency) {
                return Err(OptError::reference(format!("unknown agency '{agency}'")));
            }
        }
        let selected: BTreeSet<&str> = agencies.iter().map(String::as_str).collect();

        // Only the pairs listed in the segment-agency table, not the cross product.
        let mut pairs: BTreeSet<(&str, &str)> = BTreeSet::new();
        for segment in &geography.segments {
            for agency in self.catalog.agencies_in_segment(segment) {
                if selected.contains(agency) {
                    pairs.insert((segment.as_str(), agency));
                }
            }
        }
        if pairs.is_empty() {
            return Err(OptError::reference(format!(
                "segment-agency join is empty for {} segments and agencies [{}]",
                geography.segments.len(),
                agencies.join(", ")
            )));
        }

        let mut cache: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut rows = Vec::new();
        for ((segment, agency, loadsource), &amount) in self.catalog.land_use() {
            if !pairs.contains(&(segment.as_str(), agency.as_str())) {
                continue;
            }
            if !self.loadsource_selected(loadsource, LoadSourceKind::Land)? {
                continue;
            }
            let bmps = match cache.get(loadsource) {
                Some(bmps) => bmps.clone(),
                None => {
                    let bmps = self.bmps_for(loadsource, Category::Land)?;
                    cache.insert(loadsource.clone(), bmps.clone());
                    bmps
                }
            };
            rows.push(EligibilityRow {
                key: RowKey::Land {
                    segment: segment.clone(),
                    agency: agency.clone(),
                    loadsource: loadsource.clone(),
                },
                bmps,
                total_units: amount,
            });
        }

        let table = EligibilityTable {
            category: Category::Land,
            rows,
        };
        tracing::info!(
            pairs = pairs.len(),
            rows = table.rows.len(),
            cells = table.cell_count(),
            "resolved land eligibility"
        );
        Ok(table)
    }

    pub fn resolve_animal(&self, geography: &ResolvedGeography) -> Result<EligibilityTable> {
        let mut rows = Vec::new();
        for ((county, animal_group, loadsource), &amount) in self.catalog.animal_counts() {
            if !geography.counties.contains(county) {
                continue;
            }
            if !self.loadsource_selected(loadsource, LoadSourceKind::Animal)? {
                continue;
            }
            rows.push(EligibilityRow {
                key: RowKey::Animal {
                    county: county.clone(),
                    animal_group: animal_group.clone(),
                    loadsource: loadsource.clone(),
                },
                bmps: self.bmps_for(loadsource, Category::Animal)?,
                total_units: amount,
            });
        }

        let table = EligibilityTable {
            category: Category::Animal,
            rows,
        };
        tracing::info!(
            rows = table.rows.len(),
            cells = table.cell_count(),
            "resolved animal eligibility"
        );
        Ok(table)
    }

    /// Every ordered pair of distinct selected counties plus transport out of the
    /// watershed, for each feeding-space load source with manure in the source county.
    pub fn resolve_manure(&self, geography: &ResolvedGeography) -> Result<EligibilityTable> {
        let mut rows = Vec::new();
        for ((county_from, animal_group, loadsource), &dry_tons) in
            self.catalog.manure_quantities()
        {
            if !geography.counties.contains(county_from) {
                continue;
            }
            if !self.loadsource_selected(loadsource, LoadSourceKind::Animal)?
                || !self.catalog.loadsource(loadsource)?.feeding_space
            {
                continue;
            }
            let bmps = self.bmps_for(loadsource, Category::Manure)?;
            let destinations = geography
                .counties
                .iter()
                .filter(|to| *to != county_from)
                .map(|to| Some(to.clone()))
                .chain(std::iter::once(None));
            for county_to in destinations {
                rows.push(EligibilityRow {
                    key: RowKey::Manure {
                        county_from: county_from.clone(),
                        county_to,
                        animal_group: animal_group.clone(),
                        loadsource: loadsource.clone(),
                    },
                    bmps: bmps.clone(),
                    total_units: dry_tons,
                });
            }
        }

        let table = EligibilityTable {
            category: Category::Manure,
            rows,
        };
        tracing::info!(
            rows = table.rows.len(),
            cells = table.cell_count(),
            "resolved manure eligibility"
        );
        Ok(table)
    }
}
