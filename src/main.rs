use std::error::Error;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use bayopt::catalog::cache::CatalogCache;
use bayopt::config::RunConfig;
use bayopt::results::{self, ResultExtractor};
use bayopt::sampler::{self, ScenarioSampler};
use bayopt::solver::{SolverAdapter, SubprocessSolver};
use bayopt::{DecisionSpace, ModelBuilder, ReferenceCatalog};

fn create_file(path: &Path) -> Result<BufWriter<File>, Box<dyn Error>> {
    let file = File::create(path).map_err(|err| format!("{}: {err}", path.display()))?;
    Ok(BufWriter::new(file))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RunConfig::from_env()?;
    fs::create_dir_all(&config.output_dir)?;

    let catalog = match &config.cache_dir {
        Some(dir) => CatalogCache::new(dir).load_or_build(&config.catalog_dir)?,
        None => ReferenceCatalog::from_dir(&config.catalog_dir)?,
    };

    let space = DecisionSpace::build_available(&catalog, &config.selection)?;
    for category in space.categories() {
        let path = config.output_dir.join(format!("bounds-{category}.json"));
        fs::write(&path, space.bounds_json(category)?)?;
        tracing::info!(category = %category, path = %path.display(), "wrote bounds");
    }

    if config.sampler.samples > 0 {
        let scenario_sampler = ScenarioSampler::new(&space, config.sampler);
        for category in space.categories() {
            let scenarios = match scenario_sampler.sample(category) {
                Ok(scenarios) => scenarios,
                Err(err) => {
                    tracing::warn!(category = %category, error = %err, "skipping sampling");
                    continue;
                }
            };
            let path = config.output_dir.join(format!("scenarios-{category}.csv"));
            sampler::write_scenarios_csv(create_file(&path)?, &scenarios)?;
        }
    }

    let model = ModelBuilder::new(&catalog, &space, config.objective.clone()).build()?;
    let model_path = config.output_dir.join("model.json");
    fs::write(&model_path, model.to_json()?)?;

    let Some(command) = config.solver_cmd.as_deref() else {
        tracing::info!(path = %model_path.display(), "no solver configured; wrote model only");
        return Ok(());
    };

    let solver = SubprocessSolver::new(command, config.output_dir.join("solve"));
    let output = match solver.solve(&model, &config.solve).await {
        Ok(output) => output,
        Err(err) if err.is_solve_failure() => {
            tracing::error!(solver = solver.name(), error = %err, "solve did not produce a solution");
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let rows = ResultExtractor::new(&model).extract(&output);
    let results_path = config.output_dir.join("results.csv");
    results::write_csv(create_file(&results_path)?, &rows)?;
    tracing::info!(
        rows = rows.len(),
        objective = ?output.objective,
        path = %results_path.display(),
        "wrote results"
    );
    Ok(())
}
