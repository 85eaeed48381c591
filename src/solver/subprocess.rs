use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::timeout;

use super::{is_infeasible_status, is_success_status, SolveOptions, SolverAdapter, SolverOutput};
use crate::error::{OptError, Result};
use crate::model::OptimizationModel;

pub const MODEL_FILE: &str = "model.json";
pub const RESULT_FILE: &str = "result.json";
const STDERR_TAIL: usize = 2_000;

/// Runs `<command> [args..] <model.json> <result.json>` and reads the result file.
///
/// `BAYOPT_WANT_DUALS=1` is set in the child's environment when duals are requested.
#[derive(Debug, Clone)]
pub struct SubprocessSolver {
    command: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl SubprocessSolver {
    pub fn new(command: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn failed(&self, message: impl Into<String>) -> OptError {
        OptError::SolverFailed {
            solver: self.command.clone(),
            message: message.into(),
        }
    }

    async fn run(
        &self,
        model: &OptimizationModel,
        options: &SolveOptions,
    ) -> Result<SolverOutput> {
        model.ensure_built()?;
        let payload = model.to_json()?;

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|err| OptError::io_at(&self.work_dir, err))?;
        let model_path = self.work_dir.join(MODEL_FILE);
        let result_path = self.work_dir.join(RESULT_FILE);
        tokio::fs::write(&model_path, payload)
            .await
            .map_err(|err| OptError::io_at(&model_path, err))?;
        match tokio::fs::remove_file(&result_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(OptError::io_at(&result_path, err)),
        }

        let child = Command::new(&self.command)
            .args(&self.args)
            .arg(&model_path)
            .arg(&result_path)
            .env("BAYOPT_WANT_DUALS", if options.want_duals { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| self.failed(format!("spawn failed: {err}")))?;
        tracing::info!(
            solver = %self.command,
            variables = model.variables().len(),
            timeout_secs = options.timeout.as_secs_f64(),
            "solver started"
        );

        // Dropping the timed-out future drops the child, which kills it.
        let output = match timeout(options.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(self.failed(format!("wait failed: {err}"))),
            Err(_) => {
                tracing::warn!(solver = %self.command, "solver timed out");
                return Err(OptError::SolveTimeout {
                    solver: self.command.clone(),
                    timeout: options.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let tail = stderr.get(start..).unwrap_or(&stderr);
            return Err(self.failed(format!("exited with {}: {}", output.status, tail.trim())));
        }

        // A clean exit without a readable result is still a failed solve.
        let raw = tokio::fs::read_to_string(&result_path).await.map_err(|err| {
            self.failed(format!("no result at {}: {err}", result_path.display()))
        })?;
        let result: SolverOutput = serde_json::from_str(&raw).map_err(|err| {
            self.failed(format!("unreadable result at {}: {err}", result_path.display()))
        })?;
        tracing::info!(
            solver = %self.command,
            status = %result.status,
            objective = ?result.objective,
            "solver finished"
        );

        if is_infeasible_status(&result.status) {
            return Err(OptError::SolveInfeasible {
                solver: self.command.clone(),
                status: result.status,
            });
        }
        if !is_success_status(&result.status) {
            return Err(self.failed(format!("unrecognised status '{}'", result.status)));
        }
        Ok(result)
    }
}

impl SolverAdapter for SubprocessSolver {
    fn name(&self) -> &str {
        &self.command
    }

    async fn solve(
        &self,
        model: &OptimizationModel,
        options: &SolveOptions,
    ) -> Result<SolverOutput> {
        self.run(model, options).await
    }
}
