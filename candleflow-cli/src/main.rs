//! candleflow CLI: run the crypto price ELT pipeline or a single stage.
//!
//! Commands:
//! - `run`: extract, load, transform, test and visualize in order
//! - `extract` / `load` / `transform` / `test` / `visualize`: one stage
//! - `status`: stored rows per entity and the last run
//! - `graph`: print the stage graph

use anyhow::{Context, Result};
use candleflow_core::data::{CircuitBreaker, CoinGeckoSource, PriceSource, SyntheticSource};
use candleflow_core::{PipelineConfig, PriceStore, TransformConfig};
use candleflow_runner::report::last_run_for;
use candleflow_runner::{
    cancel_flag, runner_for, standard_graph, EntityLock, ExtractStage, LoadStage, LogObserver,
    Pipeline, Stage, TestStage, TransformStage, VisualizeStage,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "candleflow",
    version,
    about = "candleflow: daily crypto price ELT with candlestick charts"
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Entity to track (CoinGecko coin id).
    #[arg(long, global = true)]
    entity: Option<String>,

    /// Trailing window in days.
    #[arg(long, global = true)]
    days: Option<u32>,

    /// Root directory for the database, staging, charts and run reports.
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    /// Staging artifact path. Defaults to <storage-root>/staging/extracted_<entity>.json.
    #[arg(long, global = true)]
    staging_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline.
    Run {
        /// Use deterministic synthetic prices instead of CoinGecko.
        #[arg(long, default_value_t = false)]
        synthetic: bool,

        /// Transform implementation (overrides the config file).
        #[arg(long, value_enum)]
        transform: Option<TransformMode>,
    },
    /// Fetch prices and write the staging artifact.
    Extract {
        /// Use deterministic synthetic prices instead of CoinGecko.
        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Replace the entity's stored rows with the staging artifact.
    Load,
    /// Rebuild the daily candlestick model.
    Transform {
        #[arg(long, value_enum)]
        transform: Option<TransformMode>,
    },
    /// Run the data tests.
    Test {
        #[arg(long, value_enum)]
        transform: Option<TransformMode>,
    },
    /// Draw the candlestick chart.
    Visualize,
    /// Show stored rows per entity and the last run.
    Status,
    /// Print the stage graph in execution order.
    Graph,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransformMode {
    /// Built-in SQL models inside the SQLite store.
    Builtin,
    /// External tool (dbt) in <storage-root>/dbt unless configured otherwise.
    Command,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    let config = effective_config(config, &cli.command);
    config.log_effective();

    match cli.command {
        Commands::Run { synthetic, .. } => run_pipeline(config, synthetic),
        Commands::Extract { synthetic } => {
            let stage = ExtractStage::new(price_source(&config, synthetic)?);
            run_stage(&config, &stage)
        }
        Commands::Load => run_stage(&config, &LoadStage),
        Commands::Transform { .. } => {
            let stage = TransformStage::new(runner_for(&config.transform));
            run_stage(&config, &stage)
        }
        Commands::Test { .. } => {
            let stage = TestStage::new(runner_for(&config.transform));
            run_stage(&config, &stage)
        }
        Commands::Visualize => run_stage(&config, &VisualizeStage),
        Commands::Status => run_status(&config),
        Commands::Graph => run_graph(),
    }
}

/// Defaults, then the config file, then flags. Storage must be usable
/// before any command runs.
fn resolve_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    if let Some(entity) = &cli.entity {
        config.entity_id = entity.clone();
    }
    if let Some(days) = cli.days {
        config.window_days = days;
    }
    if let Some(root) = &cli.storage_root {
        config.storage_root = root.clone();
    }
    if let Some(staging) = &cli.staging_file {
        config.staging_file = Some(staging.clone());
    }

    config
        .prepare()
        .context("storage is not usable; refusing to start")?;
    Ok(config)
}

/// Apply the command's own overrides on top of the resolved config.
fn effective_config(config: PipelineConfig, command: &Commands) -> PipelineConfig {
    match command {
        Commands::Run { transform, .. }
        | Commands::Transform { transform }
        | Commands::Test { transform } => with_transform(config, *transform),
        _ => config,
    }
}

fn with_transform(mut config: PipelineConfig, mode: Option<TransformMode>) -> PipelineConfig {
    match mode {
        Some(TransformMode::Builtin) => config.transform = TransformConfig::Builtin,
        Some(TransformMode::Command) => {
            if !matches!(config.transform, TransformConfig::Command { .. }) {
                config.transform = TransformConfig::dbt(config.storage_root.join("dbt"));
            }
        }
        None => {}
    }
    config
}

fn price_source(config: &PipelineConfig, synthetic: bool) -> Result<Arc<dyn PriceSource>> {
    if synthetic {
        log::info!("using synthetic prices");
        return Ok(Arc::new(SyntheticSource::default()));
    }
    let breaker = Arc::new(CircuitBreaker::default_source());
    let source = CoinGeckoSource::new(&config.source, &config.vs_currency, breaker)
        .context("failed to set up the CoinGecko client")?;
    Ok(Arc::new(source))
}

fn run_pipeline(config: PipelineConfig, synthetic: bool) -> Result<()> {
    let lock = EntityLock::acquire(&config.locks_dir(), &config.entity_id)?;

    let source = price_source(&config, synthetic)?;
    let pipeline = Pipeline::standard(source, runner_for(&config.transform))?;
    // Nothing sets the flag yet; the pipeline checks it between stages.
    let cancel = cancel_flag();

    let report = pipeline.run(&config, &LogObserver, &cancel);
    let path = report
        .persist(&config.runs_dir())
        .context("failed to save run report")?;

    for line in report.summary_lines() {
        println!("{line}");
    }
    println!("Report saved to: {}", path.display());

    if !report.succeeded() {
        // exit() skips destructors.
        drop(lock);
        std::process::exit(1);
    }
    Ok(())
}

fn run_stage(config: &PipelineConfig, stage: &dyn Stage) -> Result<()> {
    let _lock = EntityLock::acquire(&config.locks_dir(), &config.entity_id)?;

    let kind = stage.kind();
    let detail = stage
        .run(config)
        .with_context(|| format!("{kind} failed for {}", config.entity_id))?;
    println!("{kind}: {detail}");
    Ok(())
}

fn run_status(config: &PipelineConfig) -> Result<()> {
    let database = config.database_path();
    match PriceStore::open_read_only(&database)? {
        None => println!("No database at {}", database.display()),
        Some(store) => {
            let summaries = store.summaries()?;
            if summaries.is_empty() {
                println!("Database {} holds no prices", database.display());
            } else {
                println!(
                    "{:<16} {:>8} {:>6}  {:<27} {:<27}",
                    "entity", "raw rows", "days", "first", "last"
                );
            }
            for s in summaries {
                println!(
                    "{:<16} {:>8} {:>6}  {:<27} {:<27}",
                    s.entity_id,
                    s.raw_rows,
                    s.daily_rows,
                    s.first_timestamp.unwrap_or_default(),
                    s.last_timestamp.unwrap_or_default()
                );
            }
        }
    }

    match last_run_for(&config.runs_dir(), &config.entity_id)? {
        Some(report) => {
            println!();
            for line in report.summary_lines() {
                println!("{line}");
            }
        }
        None => println!("\nNo runs recorded for {}", config.entity_id),
    }
    Ok(())
}

fn run_graph() -> Result<()> {
    let graph = standard_graph()?;
    let order = graph.topological_order()?;
    println!("{}", candleflow_runner::PIPELINE_NAME);
    print!("{}", graph.render());
    println!("order: {}", order.join(" -> "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> Commands {
        Cli::try_parse_from(args).unwrap().command
    }

    fn config_at(root: &str) -> PipelineConfig {
        PipelineConfig {
            storage_root: PathBuf::from(root),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn run_transform_flag_is_in_the_effective_config() {
        let effective = effective_config(
            config_at("/srv/candleflow"),
            &command(&["candleflow", "run", "--transform", "command"]),
        );
        assert_eq!(
            effective.transform,
            TransformConfig::dbt(PathBuf::from("/srv/candleflow").join("dbt"))
        );
    }

    #[test]
    fn test_command_can_switch_back_to_builtin() {
        let mut config = config_at("/srv/candleflow");
        config.transform = TransformConfig::dbt("dbt_project");

        let effective = effective_config(
            config,
            &command(&["candleflow", "test", "--transform", "builtin"]),
        );
        assert_eq!(effective.transform, TransformConfig::Builtin);
    }

    #[test]
    fn commands_without_the_flag_keep_the_configured_transform() {
        let mut config = config_at("/srv/candleflow");
        config.transform = TransformConfig::dbt("dbt_project");

        for args in [
            &["candleflow", "status"][..],
            &["candleflow", "run", "--synthetic"][..],
        ] {
            let effective = effective_config(config.clone(), &command(args));
            assert_eq!(effective.transform, TransformConfig::dbt("dbt_project"));
        }
    }
}
