//! Read-only reference tables and the lookup indexes built over them.

pub mod cache;
pub mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OptError, Result};
pub use schema::{
    AgencyRecord, AnimalCountRecord, BaseLoadRecord, BmpGroupRecord, BmpRecord, BmpUnitRecord,
    CatalogTables, EffectivenessRecord, GeographyRecord, GroupBmpRecord, LandUseRecord,
    LoadSourceGroupRecord, LoadSourceRecord, ManureQuantityRecord, SectorRecord,
    SegmentAgencyRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Pollutant {
    #[serde(rename = "N", alias = "n", alias = "nitrogen", alias = "Nitrogen")]
    Nitrogen,
    #[serde(rename = "P", alias = "p", alias = "phosphorus", alias = "Phosphorus")]
    Phosphorus,
    #[serde(rename = "S", alias = "s", alias = "sediment", alias = "Sediment")]
    Sediment,
}

impl Pollutant {
    pub const ALL: [Pollutant; 3] = [Self::Nitrogen, Self::Phosphorus, Self::Sediment];

    pub fn code(self) -> &'static str {
        match self {
            Self::Nitrogen => "N",
            Self::Phosphorus => "P",
            Self::Sediment => "S",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "n" | "nitrogen" => Some(Self::Nitrogen),
            "p" | "phosphorus" => Some(Self::Phosphorus),
            "s" | "sediment" => Some(Self::Sediment),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Nitrogen => 0,
            Self::Phosphorus => 1,
            Self::Sediment => 2,
        }
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nitrogen => "nitrogen",
            Self::Phosphorus => "phosphorus",
            Self::Sediment => "sediment",
        };
        f.write_str(name)
    }
}

/// Practice category. Each category has its own row shape in the decision space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Land,
    Animal,
    Manure,
}

impl Category {
    pub const ALL: [Category; 3] = [Self::Land, Self::Animal, Self::Manure];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Land => "land",
            Self::Animal => "animal",
            Self::Manure => "manure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSourceKind {
    Land,
    Animal,
}

/// Key of a (segment, agency, loadsource) land-use cell.
pub type LandKey = (String, String, String);
/// Key of a (county, animal group, loadsource) animal/manure cell.
pub type CountyKey = (String, String, String);

/// Immutable reference catalog. Built once per process and shared by reference.
#[derive(Debug, Clone)]
pub struct ReferenceCatalog {
    tables: CatalogTables,
    segments: BTreeMap<String, GeographyRecord>,
    agencies: BTreeSet<String>,
    agencies_by_segment: BTreeMap<String, BTreeSet<String>>,
    sectors: BTreeSet<String>,
    loadsources: BTreeMap<String, LoadSourceRecord>,
    groups_by_loadsource: BTreeMap<String, BTreeSet<String>>,
    bmps: BTreeMap<String, BmpRecord>,
    bmp_groups: BTreeSet<String>,
    bmps_by_ls_group: BTreeMap<String, BTreeSet<String>>,
    unit_rules: BTreeMap<String, Vec<BmpUnitRecord>>,
    land_use: BTreeMap<LandKey, f64>,
    animal_counts: BTreeMap<CountyKey, f64>,
    manure_quantities: BTreeMap<CountyKey, f64>,
    base_loads: BTreeMap<(String, String, Pollutant), f64>,
    effectiveness: BTreeMap<(String, Pollutant, String, String), f64>,
}

impl ReferenceCatalog {
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let tables = CatalogTables::read_dir(dir)?;
        let catalog = Self::from_tables(tables)?;
        tracing::info!(
            dir = %dir.display(),
            segments = catalog.segments.len(),
            bmps = catalog.bmps.len(),
            loadsources = catalog.loadsources.len(),
            "loaded reference catalog"
        );
        Ok(catalog)
    }

    /// Index and validate raw tables. Foreign keys that point nowhere are rejected here
    /// so that later stages can rely on every lookup succeeding.
    pub fn from_tables(tables: CatalogTables) -> Result<Self> {
        let mut segments = BTreeMap::new();
        for row in &tables.geography {
            if segments.insert(row.segment.clone(), row.clone()).is_some() {
                return Err(OptError::reference(format!(
                    "segment '{}' appears twice in geography table",
                    row.segment
                )));
            }
        }

        let agencies: BTreeSet<String> = tables.agencies.iter().map(|a| a.code.clone()).collect();
        let mut agencies_by_segment: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in &tables.segment_agencies {
            if !segments.contains_key(&row.segment) {
                return Err(OptError::reference(format!(
                    "segment-agency row references unknown segment '{}'",
                    row.segment
                )));
            }
            if !agencies.contains(&row.agency) {
                return Err(OptError::reference(format!(
                    "segment-agency row references unknown agency '{}'",
                    row.agency
                )));
            }
            agencies_by_segment
                .entry(row.segment.clone())
                .or_default()
                .insert(row.agency.clone());
        }

        let sectors: BTreeSet<String> = tables.sectors.iter().map(|s| s.sector.clone()).collect();
        let mut loadsources = BTreeMap::new();
        for row in &tables.load_sources {
            if !sectors.contains(&row.sector) {
                return Err(OptError::reference(format!(
                    "load source '{}' references unknown sector '{}'",
                    row.loadsource, row.sector
                )));
            }
            loadsources.insert(row.loadsource.clone(), row.clone());
        }

        let mut groups_by_loadsource: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in &tables.load_source_groups {
            require_loadsource(&loadsources, &row.loadsource, "load source group membership")?;
            groups_by_loadsource
                .entry(row.loadsource.clone())
                .or_default()
                .insert(row.group.clone());
        }

        let bmp_groups: BTreeSet<String> = tables
            .bmp_groups
            .iter()
            .map(|g| g.bmp_group.clone())
            .collect();
        let mut bmps = BTreeMap::new();
        for row in &tables.bmps {
            if !bmp_groups.contains(&row.bmp_group) {
                return Err(OptError::reference(format!(
                    "bmp '{}' references unknown bmp group '{}'",
                    row.bmp, row.bmp_group
                )));
            }
            if !row.cost_per_unit.is_finite() {
                return Err(OptError::reference(format!(
                    "bmp '{}' has non-finite cost per unit",
                    row.bmp
                )));
            }
            bmps.insert(row.bmp.clone(), row.clone());
        }

        let mut bmps_by_ls_group: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in &tables.group_bmps {
            require_bmp(&bmps, &row.bmp, "load source group eligibility")?;
            bmps_by_ls_group
                .entry(row.group.clone())
                .or_default()
                .insert(row.bmp.clone());
        }

        let mut unit_rules: BTreeMap<String, Vec<BmpUnitRecord>> = BTreeMap::new();
        for row in &tables.bmp_units {
            require_bmp(&bmps, &row.bmp, "bmp unit rule")?;
            if let Some(ls) = &row.loadsource {
                require_loadsource(&loadsources, ls, "bmp unit rule")?;
            }
            unit_rules.entry(row.bmp.clone()).or_default().push(row.clone());
        }

        let mut land_use: BTreeMap<LandKey, f64> = BTreeMap::new();
        for row in &tables.land_use {
            require_loadsource(&loadsources, &row.loadsource, "land use")?;
            *land_use
                .entry((row.segment.clone(), row.agency.clone(), row.loadsource.clone()))
                .or_insert(0.0) += row.amount;
        }

        let mut animal_counts: BTreeMap<CountyKey, f64> = BTreeMap::new();
        for row in &tables.animal_counts {
            require_loadsource(&loadsources, &row.loadsource, "animal counts")?;
            *animal_counts
                .entry((row.county.clone(), row.animal_group.clone(), row.loadsource.clone()))
                .or_insert(0.0) += row.amount;
        }

        let mut manure_quantities: BTreeMap<CountyKey, f64> = BTreeMap::new();
        for row in &tables.manure_quantities {
            require_loadsource(&loadsources, &row.loadsource, "manure quantities")?;
            *manure_quantities
                .entry((row.county.clone(), row.animal_group.clone(), row.loadsource.clone()))
                .or_insert(0.0) += row.dry_tons;
        }

        let mut base_loads = BTreeMap::new();
        for row in &tables.base_loads {
            require_loadsource(&loadsources, &row.loadsource, "base loads")?;
            base_loads.insert(
                (row.segment.clone(), row.loadsource.clone(), row.pollutant),
                row.load_per_unit,
            );
        }

        let mut effectiveness = BTreeMap::new();
        for row in &tables.effectiveness {
            require_bmp(&bmps, &row.bmp, "effectiveness")?;
            require_loadsource(&loadsources, &row.loadsource, "effectiveness")?;
            effectiveness.insert(
                (
                    row.bmp.clone(),
                    row.pollutant,
                    row.segment.clone().unwrap_or_default(),
                    row.loadsource.clone(),
                ),
                row.value,
            );
        }

        Ok(Self {
            tables,
            segments,
            agencies,
            agencies_by_segment,
            sectors,
            loadsources,
            groups_by_loadsource,
            bmps,
            bmp_groups,
            bmps_by_ls_group,
            unit_rules,
            land_use,
            animal_counts,
            manure_quantities,
            base_loads,
            effectiveness,
        })
    }

    pub fn tables(&self) -> &CatalogTables {
        &self.tables
    }

    pub fn segments(&self) -> impl Iterator<Item = &GeographyRecord> {
        self.segments.values()
    }

    pub fn segment(&self, name: &str) -> Option<&GeographyRecord> {
        self.segments.get(name)
    }

    pub fn has_agency(&self, code: &str) -> bool {
        self.agencies.contains(code)
    }

    pub fn has_sector(&self, sector: &str) -> bool {
        self.sectors.contains(sector)
    }

    /// Agencies the segment-agency join table lists for `segment`.
    pub fn agencies_in_segment(&self, segment: &str) -> impl Iterator<Item = &str> {
        self.agencies_by_segment
            .get(segment)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn loadsource(&self, name: &str) -> Result<&LoadSourceRecord> {
        self.loadsources
            .get(name)
            .ok_or_else(|| OptError::UnknownLoadSource {
                loadsource: name.to_string(),
                context: "load source table lookup".to_string(),
            })
    }

    pub fn loadsources(&self) -> impl Iterator<Item = &LoadSourceRecord> {
        self.loadsources.values()
    }

    /// Load-source groups `loadsource` belongs to. Unknown names are a hard error.
    pub fn loadsource_groups(&self, loadsource: &str) -> Result<impl Iterator<Item = &str>> {
        self.loadsource(loadsource)?;
        Ok(self
            .groups_by_loadsource
            .get(loadsource)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str)))
    }

    pub fn bmps_for_loadsource_group(&self, group: &str) -> impl Iterator<Item = &BmpRecord> {
        self.bmps_by_ls_group
            .get(group)
            .into_iter()
            .flat_map(|set| set.iter())
            .filter_map(|bmp| self.bmps.get(bmp))
    }

    pub fn bmp(&self, name: &str) -> Option<&BmpRecord> {
        self.bmps.get(name)
    }

    pub fn bmp_groups(&self) -> impl Iterator<Item = &str> {
        self.bmp_groups.iter().map(String::as_str)
    }

    /// Unit rules declared for `bmp` that apply on `loadsource`.
    pub fn unit_rules_for(&self, bmp: &str, loadsource: &str) -> Vec<&BmpUnitRecord> {
        self.unit_rules
            .get(bmp)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| r.loadsource.as_deref().map_or(true, |ls| ls == loadsource))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn land_use(&self) -> &BTreeMap<LandKey, f64> {
        &self.land_use
    }

    pub fn land_units(&self, segment: &str, agency: &str, loadsource: &str) -> f64 {
        self.land_use
            .get(&(segment.to_string(), agency.to_string(), loadsource.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn animal_counts(&self) -> &BTreeMap<CountyKey, f64> {
        &self.animal_counts
    }

    pub fn manure_quantities(&self) -> &BTreeMap<CountyKey, f64> {
        &self.manure_quantities
    }

    pub fn base_load(&self, segment: &str, loadsource: &str, pollutant: Pollutant) -> f64 {
        self.base_loads
            .get(&(segment.to_string(), loadsource.to_string(), pollutant))
            .copied()
            .unwrap_or(0.0)
    }

    /// Segment-specific effectiveness first, then the segment-independent value.
    pub fn effectiveness(
        &self,
        bmp: &str,
        pollutant: Pollutant,
        segment: &str,
        loadsource: &str,
    ) -> f64 {
        let exact = (
            bmp.to_string(),
            pollutant,
            segment.to_string(),
            loadsource.to_string(),
        );
        if let Some(&value) = self.effectiveness.get(&exact) {
            return value;
        }
        let wildcard = (bmp.to_string(), pollutant, String::new(), loadsource.to_string());
        self.effectiveness.get(&wildcard).copied().unwrap_or(0.0)
    }
}

fn require_loadsource(
    loadsources: &BTreeMap<String, LoadSourceRecord>,
    name: &str,
    context: &str,
) -> Result<()> {
    if loadsources.contains_key(name) {
        Ok(())
    } else {
        Err(OptError::UnknownLoadSource {
            loadsource: name.to_string(),
            context: context.to_string(),
        })
    }
}

fn require_bmp(bmps: &BTreeMap<String, BmpRecord>, name: &str, context: &str) -> Result<()> {
    if bmps.contains_key(name) {
        Ok(())
    } else {
        Err(OptError::reference(format!(
            "{context} references unknown bmp '{name}'"
        )))
    }
}
