use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{GeographyRecord, ReferenceCatalog};
use crate::error::{OptError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scale {
    Watershed,
    State,
    County,
    StateBasin,
    MajorBasin,
    LandRiverSegment,
}

impl Scale {
    pub const ALL: [Scale; 6] = [
        Self::Watershed,
        Self::State,
        Self::County,
        Self::StateBasin,
        Self::MajorBasin,
        Self::LandRiverSegment,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Watershed => "watershed",
            Self::State => "state",
            Self::County => "county",
            Self::StateBasin => "state-basin",
            Self::MajorBasin => "major-basin",
            Self::LandRiverSegment => "land-river-segment",
        }
    }

    fn matches(self, record: &GeographyRecord, area: &str) -> bool {
        match self {
            Self::Watershed => record.watershed.eq_ignore_ascii_case(area),
            Self::State => record.state.eq_ignore_ascii_case(area),
            Self::County => {
                record.county.eq_ignore_ascii_case(area)
                    || county_key(record).eq_ignore_ascii_case(area)
            }
            Self::StateBasin => record.state_basin.eq_ignore_ascii_case(area),
            Self::MajorBasin => record.major_basin.eq_ignore_ascii_case(area),
            Self::LandRiverSegment => record.segment.eq_ignore_ascii_case(area),
        }
    }
}

impl FromStr for Scale {
    type Err = OptError;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "watershed" => Ok(Self::Watershed),
            "state" => Ok(Self::State),
            "county" => Ok(Self::County),
            "statebasin" => Ok(Self::StateBasin),
            "majorbasin" => Ok(Self::MajorBasin),
            "landriversegment" | "lrseg" => Ok(Self::LandRiverSegment),
            _ => Err(OptError::UnknownScale {
                scale: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key animal and manure tables use for a county: `"<County>, <ST>"`.
pub fn county_key(record: &GeographyRecord) -> String {
    format!("{}, {}", record.county, record.state)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedGeography {
    pub segments: BTreeSet<String>,
    pub counties: BTreeSet<String>,
}

/// Stateless: every call resolves from the catalog alone.
#[derive(Debug, Clone, Copy)]
pub struct GeographyResolver<'a> {
    catalog: &'a ReferenceCatalog,
}

impl<'a> GeographyResolver<'a> {
    pub fn new(catalog: &'a ReferenceCatalog) -> Self {
        Self { catalog }
    }

    pub fn resolve_named(&self, scale: &str, areas: &[String]) -> Result<ResolvedGeography> {
        self.resolve(scale.parse()?, areas)
    }

    /// Segments whose containing geography matches any of `areas` at `scale`.
    pub fn resolve(&self, scale: Scale, areas: &[String]) -> Result<ResolvedGeography> {
        let mut resolved = ResolvedGeography::default();
        for record in self.catalog.segments() {
            if areas.iter().any(|area| scale.matches(record, area.trim())) {
                resolved.segments.insert(record.segment.clone());
                resolved.counties.insert(county_key(record));
            }
        }

        if resolved.segments.is_empty() {
            return Err(OptError::reference(format!(
                "no land-river segments match {scale} selection [{}]",
                areas.join("; ")
            )));
        }

        tracing::info!(
            scale = %scale,
            areas = areas.len(),
            segments = resolved.segments.len(),
            counties = resolved.counties.len(),
            "resolved geography"
        );
        Ok(resolved)
    }
}
