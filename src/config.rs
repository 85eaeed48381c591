use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::catalog::Pollutant;
use crate::decision_space::Selection;
use crate::model::{ObjectiveSpec, Target};
use crate::sampler::{SampleMode, SamplerConfig, DEFAULT_SAMPLE_SEED};
use crate::solver::{SolveOptions, DEFAULT_SOLVE_TIMEOUT_SECS};

pub const DEFAULT_SCALE: &str = "county";
pub const DEFAULT_OUTPUT_DIR: &str = "out";
pub const DEFAULT_LOAD_POLLUTANT: Pollutant = Pollutant::Nitrogen;

/// Everything one run of the binary needs, read from `BAYOPT_*` variables.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub catalog_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub selection: Selection,
    pub objective: ObjectiveSpec,
    pub solver_cmd: Option<String>,
    pub solve: SolveOptions,
    pub sampler: SamplerConfig,
    pub output_dir: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingEnv(&'static str),
    InvalidEnvValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingEnv(name) => write!(f, "required env var {name} is not set"),
            Self::InvalidEnvValue { name, value } => {
                write!(f, "invalid env var {name}={value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl RunConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let catalog_dir = PathBuf::from(required_env("BAYOPT_CATALOG_DIR")?);
        let cache_dir = optional_env("BAYOPT_CACHE_DIR").map(PathBuf::from);

        let scale = optional_env("BAYOPT_SCALE").unwrap_or_else(|| DEFAULT_SCALE.to_string());
        let area_names = split_list(&required_env("BAYOPT_AREAS")?, ';');
        if area_names.is_empty() {
            return Err(ConfigError::InvalidEnvValue {
                name: "BAYOPT_AREAS",
                value: "<empty>".to_string(),
            });
        }
        let selection = Selection {
            scale,
            area_names,
            agency_codes: optional_env("BAYOPT_AGENCIES")
                .map(|raw| split_list(&raw, ','))
                .unwrap_or_default(),
            sector_names: optional_env("BAYOPT_SECTORS")
                .map(|raw| split_list(&raw, ','))
                .unwrap_or_default(),
        };

        let objective = match optional_env("BAYOPT_OBJECTIVE")
            .map(|raw| raw.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("cost") | Some("cost-min") => {
                let targets = match optional_env("BAYOPT_TARGETS") {
                    Some(raw) => parse_targets(&raw).ok_or(ConfigError::InvalidEnvValue {
                        name: "BAYOPT_TARGETS",
                        value: raw,
                    })?,
                    None => Vec::new(),
                };
                ObjectiveSpec::CostMinimizing { targets }
            }
            Some("load") | Some("load-max") => {
                let pollutant = match optional_env("BAYOPT_LOAD_POLLUTANT") {
                    Some(raw) => Pollutant::parse(&raw).ok_or(ConfigError::InvalidEnvValue {
                        name: "BAYOPT_LOAD_POLLUTANT",
                        value: raw,
                    })?,
                    None => DEFAULT_LOAD_POLLUTANT,
                };
                let cost_ceiling = parse_env_f64("BAYOPT_COST_CEILING", 0.0)?;
                if !cost_ceiling.is_finite() || cost_ceiling < 0.0 {
                    return Err(ConfigError::InvalidEnvValue {
                        name: "BAYOPT_COST_CEILING",
                        value: cost_ceiling.to_string(),
                    });
                }
                ObjectiveSpec::LoadMaximizing {
                    pollutant,
                    cost_ceiling,
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidEnvValue {
                    name: "BAYOPT_OBJECTIVE",
                    value: other.to_string(),
                })
            }
        };

        let solve = SolveOptions {
            timeout: Duration::from_secs(parse_env_u64(
                "BAYOPT_SOLVE_TIMEOUT_SECS",
                DEFAULT_SOLVE_TIMEOUT_SECS,
            )?),
            want_duals: parse_env_bool("BAYOPT_WANT_DUALS", false)?,
        };

        let mode = match optional_env("BAYOPT_SAMPLE_MODE") {
            Some(raw) => SampleMode::from_str(&raw).map_err(|_| ConfigError::InvalidEnvValue {
                name: "BAYOPT_SAMPLE_MODE",
                value: raw,
            })?,
            None => SampleMode::Uniform,
        };
        let sampler = SamplerConfig {
            mode,
            samples: parse_env_usize("BAYOPT_SAMPLES", 0)?,
            seed: parse_env_u64("BAYOPT_SEED", DEFAULT_SAMPLE_SEED)?,
        };

        Ok(Self {
            catalog_dir,
            cache_dir,
            selection,
            objective,
            solver_cmd: optional_env("BAYOPT_SOLVER_CMD"),
            solve,
            sampler,
            output_dir: optional_env("BAYOPT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        })
    }
}

/// `N=12,P=0,S=5` style list of statewide percent targets.
pub fn parse_targets(raw: &str) -> Option<Vec<Target>> {
    split_list(raw, ',')
        .into_iter()
        .map(|item| {
            let (code, value) = item.split_once('=')?;
            let percent = value.trim().parse::<f64>().ok()?;
            if !percent.is_finite() || percent < 0.0 {
                return None;
            }
            Some(Target {
                segment: None,
                pollutant: Pollutant::parse(code)?,
                percent,
            })
        })
        .collect()
}

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn optional_env(name: &'static str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn required_env(name: &'static str) -> Result<String, ConfigError> {
    optional_env(name).ok_or(ConfigError::MissingEnv(name))
}

fn parse_env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = optional_env(name) else {
        return Ok(default);
    };
    parse_bool_literal(&raw).ok_or(ConfigError::InvalidEnvValue { name, value: raw })
}

fn parse_env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = optional_env(name) else {
        return Ok(default);
    };
    raw.parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnvValue { name, value: raw })
}

fn parse_env_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let Some(raw) = optional_env(name) else {
        return Ok(default);
    };
    raw.parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnvValue { name, value: raw })
}

fn parse_env_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let Some(raw) = optional_env(name) else {
        return Ok(default);
    };
    raw.parse::<f64>()
        .map_err(|_| ConfigError::InvalidEnvValue { name, value: raw })
}

fn parse_bool_literal(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
