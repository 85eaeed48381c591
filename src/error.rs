use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::{Category, Pollutant};
use crate::model::BuildState;

pub type Result<T> = std::result::Result<T, OptError>;

#[derive(Debug)]
pub enum OptError {
    UnknownScale {
        scale: String,
    },
    UnknownLoadSource {
        loadsource: String,
        context: String,
    },
    AmbiguousUnit {
        bmp: String,
        cell: String,
        units: Vec<String>,
    },
    ReferenceData {
        message: String,
    },
    IncompleteSelection {
        category: Category,
        dimension: &'static str,
    },
    EmptyDecisionSpace {
        pollutant: Option<Pollutant>,
        reason: String,
    },
    InvalidParameter {
        message: String,
    },
    ModelNotReady {
        expected: BuildState,
        found: BuildState,
    },
    SolveTimeout {
        solver: String,
        timeout: Duration,
    },
    SolveInfeasible {
        solver: String,
        status: String,
    },
    SolverFailed {
        solver: String,
        message: String,
    },
    Io {
        path: Option<PathBuf>,
        source: std::io::Error,
    },
    Csv(csv::Error),
    Json(serde_json::Error),
}

impl OptError {
    pub(crate) fn reference(message: impl Into<String>) -> Self {
        Self::ReferenceData {
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: Some(path.into()),
            source,
        }
    }

    /// Solve-time failures are reported to the caller as typed outcomes rather
    /// than structural build errors.
    pub fn is_solve_failure(&self) -> bool {
        matches!(
            self,
            Self::SolveTimeout { .. } | Self::SolveInfeasible { .. } | Self::SolverFailed { .. }
        )
    }
}

impl fmt::Display for OptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownScale { scale } => write!(
                f,
                "unknown geography scale '{scale}'; expected one of watershed, state, county, \
                 state-basin, major-basin, land-river-segment"
            ),
            Self::UnknownLoadSource {
                loadsource,
                context,
            } => write!(f, "unknown load source '{loadsource}' ({context})"),
            Self::AmbiguousUnit { bmp, cell, units } => write!(
                f,
                "bmp '{bmp}' keeps more than one required unit on {cell} after precedence: [{}]",
                units.join(", ")
            ),
            Self::ReferenceData { message } => write!(f, "reference data error: {message}"),
            Self::IncompleteSelection {
                category,
                dimension,
            } => write!(
                f,
                "selection is missing '{dimension}', required for {category} practices"
            ),
            Self::EmptyDecisionSpace { pollutant, reason } => match pollutant {
                Some(p) => write!(f, "empty decision space for {p}: {reason}"),
                None => write!(f, "empty decision space: {reason}"),
            },
            Self::InvalidParameter { message } => write!(f, "invalid parameter: {message}"),
            Self::ModelNotReady { expected, found } => write!(
                f,
                "model not ready: operation requires state {expected:?}, model is {found:?}"
            ),
            Self::SolveTimeout { solver, timeout } => write!(
                f,
                "solver '{solver}' did not finish within {:.1}s",
                timeout.as_secs_f64()
            ),
            Self::SolveInfeasible { solver, status } => {
                write!(f, "solver '{solver}' reported infeasible problem (status={status})")
            }
            Self::SolverFailed { solver, message } => {
                write!(f, "solver '{solver}' failed: {message}")
            }
            Self::Io { path, source } => match path {
                Some(path) => write!(f, "io error at {}: {source}", path.display()),
                None => write!(f, "io error: {source}"),
            },
            Self::Csv(err) => write!(f, "csv error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
        }
    }
}

impl std::error::Error for OptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Csv(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for OptError {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            path: None,
            source: value,
        }
    }
}

impl From<csv::Error> for OptError {
    fn from(value: csv::Error) -> Self {
        Self::Csv(value)
    }
}

impl From<serde_json::Error> for OptError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
