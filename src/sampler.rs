//! Random scenarios drawn inside the decision-space bounds.
//!
//! Every sample (uniform) or column (Latin hypercube) gets its own ChaCha stream derived
//! from one seed, so results are identical however rayon schedules the work.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::catalog::Category;
use crate::decision_space::DecisionSpace;
use crate::eligibility::EligibilityCell;
use crate::error::{OptError, Result};

pub const DEFAULT_SAMPLE_SEED: u64 = 0x5EED_BA7B_0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleMode {
    Uniform,
    LatinHypercube,
}

impl FromStr for SampleMode {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "uniform" | "random" => Ok(Self::Uniform),
            "lhs" | "latin-hypercube" | "latinhypercube" => Ok(Self::LatinHypercube),
            other => Err(format!("unknown sample mode '{other}'")),
        }
    }
}

impl fmt::Display for SampleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform => f.write_str("uniform"),
            Self::LatinHypercube => f.write_str("latin-hypercube"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    pub mode: SampleMode,
    pub samples: usize,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            mode: SampleMode::Uniform,
            samples: 1,
            seed: DEFAULT_SAMPLE_SEED,
        }
    }
}

/// One value per eligibility cell, each inside the cell's bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub category: Category,
    pub index: usize,
    pub values: BTreeMap<EligibilityCell, f64>,
}

impl Scenario {
    pub fn value(&self, cell: &EligibilityCell) -> Option<f64> {
        self.values.get(cell).copied()
    }
}

fn stream_rng(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}

/// `samples` x `dims` points, independently uniform on [0, 1).
pub fn uniform_design(samples: usize, dims: usize, seed: u64) -> Vec<Vec<f64>> {
    (0..samples)
        .into_par_iter()
        .map(|i| {
            let mut rng = stream_rng(seed, i as u64);
            (0..dims).map(|_| rng.gen::<f64>()).collect()
        })
        .collect()
}

/// `samples` x `dims` Latin-hypercube design on [0, 1): in every column each of the
/// `samples` equal-width strata holds exactly one point.
pub fn latin_hypercube_design(samples: usize, dims: usize, seed: u64) -> Vec<Vec<f64>> {
    let n = samples as f64;
    let columns: Vec<Vec<f64>> = (0..dims)
        .into_par_iter()
        .map(|j| {
            let mut rng = stream_rng(seed, j as u64);
            let mut strata: Vec<usize> = (0..samples).collect();
            strata.shuffle(&mut rng);
            strata
                .into_iter()
                .map(|k| stratum_point(k, rng.gen::<f64>(), n))
                .collect()
        })
        .collect();

    (0..samples)
        .map(|i| columns.iter().map(|col| col[i]).collect())
        .collect()
}

/// `(k + jitter) / n`, nudged by single ulps so that `floor(t * n) == k` holds exactly.
fn stratum_point(k: usize, jitter: f64, n: f64) -> f64 {
    let kf = k as f64;
    let mut t = (kf + jitter) / n;
    while (t * n).floor() > kf {
        t = f64::from_bits(t.to_bits() - 1);
    }
    while (t * n).floor() < kf {
        t = f64::from_bits(t.to_bits() + 1);
    }
    t
}

/// Affine map of a unit-interval value onto the cell's bounds.
/// Degenerate bounds return the fixed value exactly.
pub fn rescale(bounds: &Bounds, t: f64) -> f64 {
    if bounds.is_degenerate() {
        return bounds.lower;
    }
    (bounds.lower + t * bounds.width()).clamp(bounds.lower, bounds.upper)
}

pub struct ScenarioSampler<'a> {
    space: &'a DecisionSpace,
    config: SamplerConfig,
}

impl<'a> ScenarioSampler<'a> {
    pub fn new(space: &'a DecisionSpace, config: SamplerConfig) -> Self {
        Self { space, config }
    }

    pub fn sample(&self, category: Category) -> Result<Vec<Scenario>> {
        let bounds = self.space.bounds(category)?;
        if self.config.samples == 0 {
            return Ok(Vec::new());
        }
        if bounds.is_empty() {
            return Err(OptError::EmptyDecisionSpace {
                pollutant: None,
                reason: format!("no {category} cells to sample"),
            });
        }

        let cells: Vec<(&EligibilityCell, &Bounds)> = bounds.cells.iter().collect();
        let design = match self.config.mode {
            SampleMode::Uniform => uniform_design(self.config.samples, cells.len(), self.config.seed),
            SampleMode::LatinHypercube => {
                latin_hypercube_design(self.config.samples, cells.len(), self.config.seed)
            }
        };

        let scenarios: Vec<Scenario> = design
            .into_iter()
            .enumerate()
            .map(|(index, point)| Scenario {
                category,
                index,
                values: cells
                    .iter()
                    .zip(point)
                    .map(|((cell, b), t)| ((*cell).clone(), rescale(b, t)))
                    .collect(),
            })
            .collect();

        tracing::info!(
            category = %category,
            mode = %self.config.mode,
            samples = scenarios.len(),
            cells = cells.len(),
            "sampled scenarios"
        );
        Ok(scenarios)
    }
}

#[derive(Debug, Serialize)]
struct ScenarioCsvRow<'a> {
    scenario: usize,
    category: Category,
    location: &'a str,
    row: String,
    loadsource: &'a str,
    bmp: &'a str,
    value: f64,
}

pub fn write_scenarios_csv<W: Write>(writer: W, scenarios: &[Scenario]) -> Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    for scenario in scenarios {
        for (cell, &value) in &scenario.values {
            out.serialize(ScenarioCsvRow {
                scenario: scenario.index,
                category: scenario.category,
                location: cell.row.location(),
                row: cell.row.to_string(),
                loadsource: cell.row.loadsource(),
                bmp: &cell.bmp,
                value,
            })?;
        }
    }
    out.flush()?;
    Ok(())
}
