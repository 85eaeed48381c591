//! Typed rows for every reference table and the fixed file layout of a catalog directory.
//!
//! Column names are mapped once here through serde aliases. A source file that carries
//! two columns resolving to the same field is rejected at load time.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Category, LoadSourceKind, Pollutant};
use crate::error::{OptError, Result};

/// Bumped whenever a record layout below changes; part of the cache key.
pub const SCHEMA_VERSION: &str = "bayopt-catalog-v3";

pub const GEOGRAPHY_FILE: &str = "geography.csv";
pub const AGENCIES_FILE: &str = "agencies.csv";
pub const SEGMENT_AGENCIES_FILE: &str = "segment_agencies.csv";
pub const SECTORS_FILE: &str = "sectors.csv";
pub const LOAD_SOURCES_FILE: &str = "load_sources.csv";
pub const LOAD_SOURCE_GROUPS_FILE: &str = "load_source_groups.csv";
pub const BMPS_FILE: &str = "bmps.csv";
pub const BMP_GROUPS_FILE: &str = "bmp_groups.csv";
pub const GROUP_BMPS_FILE: &str = "group_bmps.csv";
pub const BMP_UNITS_FILE: &str = "bmp_units.csv";
pub const LAND_USE_FILE: &str = "land_use.csv";
pub const ANIMAL_COUNTS_FILE: &str = "animal_counts.csv";
pub const MANURE_QUANTITIES_FILE: &str = "manure_quantities.csv";
pub const BASE_LOADS_FILE: &str = "base_loads.csv";
pub const EFFECTIVENESS_FILE: &str = "effectiveness.csv";

/// Every file a catalog directory may hold, in cache-hash order.
pub const CATALOG_FILES: [&str; 15] = [
    AGENCIES_FILE,
    ANIMAL_COUNTS_FILE,
    BASE_LOADS_FILE,
    BMP_GROUPS_FILE,
    BMP_UNITS_FILE,
    BMPS_FILE,
    EFFECTIVENESS_FILE,
    GEOGRAPHY_FILE,
    GROUP_BMPS_FILE,
    LAND_USE_FILE,
    LOAD_SOURCE_GROUPS_FILE,
    LOAD_SOURCES_FILE,
    MANURE_QUANTITIES_FILE,
    SECTORS_FILE,
    SEGMENT_AGENCIES_FILE,
];

/// Files that only matter for animal/manure practices.
const OPTIONAL_FILES: [&str; 2] = [ANIMAL_COUNTS_FILE, MANURE_QUANTITIES_FILE];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeographyRecord {
    #[serde(alias = "LandRiverSegment", alias = "lrseg")]
    pub segment: String,
    #[serde(alias = "CountyName")]
    pub county: String,
    #[serde(alias = "StateAbbreviation", alias = "state_abbr")]
    pub state: String,
    #[serde(alias = "Watershed")]
    pub watershed: String,
    #[serde(alias = "StateBasin")]
    pub state_basin: String,
    #[serde(alias = "MajorBasin")]
    pub major_basin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgencyRecord {
    #[serde(alias = "AgencyCode")]
    pub code: String,
    #[serde(default, alias = "AgencyName")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentAgencyRecord {
    #[serde(alias = "LandRiverSegment", alias = "lrseg")]
    pub segment: String,
    #[serde(alias = "AgencyCode")]
    pub agency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorRecord {
    #[serde(alias = "Sector")]
    pub sector: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSourceRecord {
    #[serde(alias = "LoadSource")]
    pub loadsource: String,
    #[serde(alias = "Sector")]
    pub sector: String,
    pub kind: LoadSourceKind,
    #[serde(default, alias = "IsFeedingSpace")]
    pub feeding_space: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSourceGroupRecord {
    #[serde(alias = "LoadSource")]
    pub loadsource: String,
    #[serde(alias = "LoadSourceGroup")]
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmpRecord {
    #[serde(alias = "BmpShortName")]
    pub bmp: String,
    #[serde(alias = "BmpGroup")]
    pub bmp_group: String,
    pub category: Category,
    #[serde(alias = "CostPerUnit", alias = "TotalAnnualizedCostPerUnit")]
    pub cost_per_unit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmpGroupRecord {
    #[serde(alias = "BmpGroup")]
    pub bmp_group: String,
    #[serde(default)]
    pub description: String,
}

/// Eligibility mapping: a BMP may be applied on every load source of `group`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBmpRecord {
    #[serde(alias = "LoadSourceGroup")]
    pub group: String,
    #[serde(alias = "BmpShortName")]
    pub bmp: String,
}

/// One declared unit for a BMP. A blank `loadsource` applies to every cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmpUnitRecord {
    #[serde(alias = "BmpShortName")]
    pub bmp: String,
    #[serde(alias = "Unit")]
    pub unit: String,
    #[serde(default, alias = "LoadSource")]
    pub loadsource: Option<String>,
    #[serde(default = "default_required", alias = "IsRequired")]
    pub required: bool,
    #[serde(default, alias = "MaxValue")]
    pub max_value: Option<f64>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandUseRecord {
    #[serde(alias = "LandRiverSegment", alias = "lrseg")]
    pub segment: String,
    #[serde(alias = "AgencyCode")]
    pub agency: String,
    #[serde(alias = "LoadSource")]
    pub loadsource: String,
    #[serde(alias = "Amount", alias = "acres")]
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimalCountRecord {
    #[serde(alias = "CountyName")]
    pub county: String,
    #[serde(alias = "AnimalGroup")]
    pub animal_group: String,
    #[serde(alias = "LoadSource")]
    pub loadsource: String,
    #[serde(alias = "AnimalUnits")]
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManureQuantityRecord {
    #[serde(alias = "CountyName")]
    pub county: String,
    #[serde(alias = "AnimalGroup")]
    pub animal_group: String,
    #[serde(alias = "LoadSource")]
    pub loadsource: String,
    #[serde(alias = "DryTons")]
    pub dry_tons: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseLoadRecord {
    #[serde(alias = "LandRiverSegment", alias = "lrseg")]
    pub segment: String,
    #[serde(alias = "LoadSource")]
    pub loadsource: String,
    pub pollutant: Pollutant,
    #[serde(alias = "LoadPerUnit", alias = "loadingrate")]
    pub load_per_unit: f64,
}

/// Fractional (0..=1) reduction. A blank `segment` applies to every segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessRecord {
    #[serde(alias = "BmpShortName")]
    pub bmp: String,
    pub pollutant: Pollutant,
    #[serde(default, alias = "LandRiverSegment", alias = "lrseg")]
    pub segment: Option<String>,
    #[serde(alias = "LoadSource")]
    pub loadsource: String,
    #[serde(alias = "Effectiveness")]
    pub value: f64,
}

/// Raw reference tables as handed over by the data-loading side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogTables {
    pub geography: Vec<GeographyRecord>,
    pub agencies: Vec<AgencyRecord>,
    pub segment_agencies: Vec<SegmentAgencyRecord>,
    pub sectors: Vec<SectorRecord>,
    pub load_sources: Vec<LoadSourceRecord>,
    pub load_source_groups: Vec<LoadSourceGroupRecord>,
    pub bmps: Vec<BmpRecord>,
    pub bmp_groups: Vec<BmpGroupRecord>,
    pub group_bmps: Vec<GroupBmpRecord>,
    pub bmp_units: Vec<BmpUnitRecord>,
    pub land_use: Vec<LandUseRecord>,
    pub animal_counts: Vec<AnimalCountRecord>,
    pub manure_quantities: Vec<ManureQuantityRecord>,
    pub base_loads: Vec<BaseLoadRecord>,
    pub effectiveness: Vec<EffectivenessRecord>,
}

impl CatalogTables {
    pub fn read_dir(dir: &Path) -> Result<Self> {
        Ok(Self {
            geography: read_table(dir, GEOGRAPHY_FILE)?,
            agencies: read_table(dir, AGENCIES_FILE)?,
            segment_agencies: read_table(dir, SEGMENT_AGENCIES_FILE)?,
            sectors: read_table(dir, SECTORS_FILE)?,
            load_sources: read_table(dir, LOAD_SOURCES_FILE)?,
            load_source_groups: read_table(dir, LOAD_SOURCE_GROUPS_FILE)?,
            bmps: read_table(dir, BMPS_FILE)?,
            bmp_groups: read_table(dir, BMP_GROUPS_FILE)?,
            group_bmps: read_table(dir, GROUP_BMPS_FILE)?,
            bmp_units: read_table(dir, BMP_UNITS_FILE)?,
            land_use: read_table(dir, LAND_USE_FILE)?,
            animal_counts: read_table(dir, ANIMAL_COUNTS_FILE)?,
            manure_quantities: read_table(dir, MANURE_QUANTITIES_FILE)?,
            base_loads: read_table(dir, BASE_LOADS_FILE)?,
            effectiveness: read_table(dir, EFFECTIVENESS_FILE)?,
        })
    }
}

fn read_table<T: DeserializeOwned>(dir: &Path, file_name: &'static str) -> Result<Vec<T>> {
    let path = dir.join(file_name);
    if !path.exists() {
        if OPTIONAL_FILES.contains(&file_name) {
            tracing::debug!(file = file_name, "optional catalog table absent");
            return Ok(Vec::new());
        }
        return Err(OptError::io_at(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "catalog table not found"),
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(&path)?;
    let mut rows = Vec::new();
    for (i, result) in reader.deserialize().enumerate() {
        // 1-indexed, skip header
        let row = i + 2;
        let record: T = result
            .map_err(|err| OptError::reference(format!("{file_name} row {row}: {err}")))?;
        rows.push(record);
    }
    tracing::debug!(file = file_name, rows = rows.len(), "loaded catalog table");
    Ok(rows)
}
