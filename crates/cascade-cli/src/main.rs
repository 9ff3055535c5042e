//! `cascade` — stage commands for calibrated early-exit policies.
//!
//! Every command works on an explicit run directory. Machine-readable JSON
//! goes to stdout; logs go to stderr (`RUST_LOG`, default `cascade=info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cascade::analysis::{aggregate_variants, classification_per_exit, ExitReport};
use cascade::{
    pipeline, EvaluationVariant, LogitCache, PipelineConfig, PolicyObjective, PolicyRunRecord,
    PolicySummary, RunFlags, RunLayout,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every stage
#[derive(Args, Debug)]
struct RunArgs {
    /// Run directory holding calibration, thresholds and records
    #[arg(long)]
    run_dir: PathBuf,

    /// Optional TOML pipeline config
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit one temperature per exit on a labeled logit cache
    Calibrate {
        #[command(flatten)]
        run: RunArgs,
        /// Held-out calibration split
        #[arg(long)]
        cache: PathBuf,
        /// Override calibration.min_samples
        #[arg(long)]
        min_samples: Option<usize>,
    },
    /// Select per-exit thresholds under the persisted calibration
    Select {
        #[command(flatten)]
        run: RunArgs,
        /// Labeled validation split
        #[arg(long)]
        cache: PathBuf,
        /// Minimize cost subject to accuracy >= this
        #[arg(long, conflicts_with = "cost_ceiling", required_unless_present = "cost_ceiling")]
        accuracy_floor: Option<f64>,
        /// Maximize accuracy subject to mean cost <= this
        #[arg(long)]
        cost_ceiling: Option<f64>,
        /// Override selection.grid_steps
        #[arg(long)]
        grid_steps: Option<usize>,
    },
    /// Evaluate the persisted policy and write a run record
    Evaluate {
        #[command(flatten)]
        run: RunArgs,
        /// Test split
        #[arg(long)]
        cache: PathBuf,
        /// Deepest reachable exit (0-based); defaults to the last exit
        #[arg(long)]
        max_exit: Option<usize>,
        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Evaluate one variant per reachable max exit
    Profile {
        #[command(flatten)]
        run: RunArgs,
        /// Test split
        #[arg(long)]
        cache: PathBuf,
        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Print a record's summary, plus per-exit reports when a cache is given
    Summarize {
        #[command(flatten)]
        run: RunArgs,
        /// Record to read (defaults to `<run>/policy_run.json`)
        #[arg(long)]
        record: Option<PathBuf>,
        /// Labeled split for per-exit classification reports
        #[arg(long)]
        cache: Option<PathBuf>,
    },
    /// Aggregate several records by variant
    Compare {
        /// Records to aggregate
        #[arg(long, num_args = 1.., required = true)]
        records: Vec<PathBuf>,
    },
}

#[derive(Serialize)]
struct SummaryOutput<'a> {
    run_id: String,
    variant: &'a str,
    summary: &'a PolicySummary,
    flags: &'a RunFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    classification_per_exit: Option<Vec<ExitReport>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Calibrate {
            run,
            cache,
            min_samples,
        } => {
            let (layout, mut config) = setup(&run)?;
            if let Some(n) = min_samples {
                config.calibration.min_samples = n;
            }
            config.validate()?;
            let cache = load_cache(&cache)?;
            let outcome = pipeline::calibrate(&layout, &cache, &config)
                .context("calibration stage failed")?;
            for warning in &outcome.warnings {
                tracing::warn!(%warning, "recovered");
            }
            print_json(&outcome.params)
        }
        Command::Select {
            run,
            cache,
            accuracy_floor,
            cost_ceiling,
            grid_steps,
        } => {
            let (layout, mut config) = setup(&run)?;
            if let Some(n) = grid_steps {
                config.selection.grid_steps = n;
            }
            config.validate()?;
            let objective = match (accuracy_floor, cost_ceiling) {
                (Some(floor), None) => PolicyObjective::MinCostWithAccuracyFloor { floor },
                (None, Some(ceiling)) => PolicyObjective::MaxAccuracyWithCostCeiling { ceiling },
                _ => bail!("exactly one of --accuracy-floor or --cost-ceiling is required"),
            };
            let cache = load_cache(&cache)?;
            let outcome = pipeline::select(&layout, &cache, objective, &config)
                .context("selection stage failed")?;
            print_json(&outcome.thresholds)
        }
        Command::Evaluate {
            run,
            cache,
            max_exit,
            workers,
        } => {
            let (layout, mut config) = setup(&run)?;
            if workers.is_some() {
                config.evaluation.workers = workers;
            }
            config.validate()?;
            let cache = Arc::new(load_cache(&cache)?);
            if let Some(j) = max_exit.filter(|&j| j > cache.profile.last_exit()) {
                bail!(
                    "--max-exit {} beyond last exit {}",
                    j,
                    cache.profile.last_exit()
                );
            }
            let variant = match max_exit {
                Some(j) => EvaluationVariant::up_to(&cache.profile, j),
                None => EvaluationVariant::default(),
            };
            let cancel = install_ctrl_c();
            let record = pipeline::evaluate(&layout, cache, variant, &config, cancel)
                .await
                .context("evaluation stage failed")?;
            print_json(&record.summary)
        }
        Command::Profile {
            run,
            cache,
            workers,
        } => {
            let (layout, mut config) = setup(&run)?;
            if workers.is_some() {
                config.evaluation.workers = workers;
            }
            config.validate()?;
            let cache = Arc::new(load_cache(&cache)?);
            let cancel = install_ctrl_c();
            let records = pipeline::profile(&layout, cache, &config, cancel)
                .await
                .context("profiling failed")?;
            print_json(&aggregate_variants(&records))
        }
        Command::Summarize { run, record, cache } => {
            let layout = RunLayout::new(&run.run_dir);
            let path = record.unwrap_or_else(|| layout.policy_run_path());
            let record = load_record(&path)?;
            let reports = match cache {
                Some(cache) => {
                    let cache = load_cache(&cache)?;
                    Some(
                        classification_per_exit(&cache, &record.calibration)
                            .context("per-exit classification report failed")?,
                    )
                }
                None => None,
            };
            print_json(&SummaryOutput {
                run_id: record.run_id.to_string(),
                variant: &record.variant.label,
                summary: &record.summary,
                flags: &record.flags,
                classification_per_exit: reports,
            })
        }
        Command::Compare { records } => {
            let loaded = records
                .iter()
                .map(|p| load_record(p))
                .collect::<Result<Vec<_>>>()?;
            info!(records = loaded.len(), "comparing variants");
            print_json(&aggregate_variants(&loaded))
        }
    }
}

fn setup(run: &RunArgs) -> Result<(RunLayout, PipelineConfig)> {
    let config = PipelineConfig::load(run.config.as_deref()).context("loading pipeline config")?;
    Ok((RunLayout::new(&run.run_dir), config))
}

fn load_cache(path: &Path) -> Result<LogitCache> {
    LogitCache::load(path).with_context(|| format!("loading logit cache {}", path.display()))
}

fn load_record(path: &Path) -> Result<PolicyRunRecord> {
    PolicyRunRecord::load(path).with_context(|| format!("loading run record {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on the first Ctrl-C, so a batch is discarded rather than
/// persisted half-done.
fn install_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling evaluation");
            trigger.cancel();
        }
    });
    token
}
