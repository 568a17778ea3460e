//! Hypolab CLI: offline access to the gate evaluators and the statistics.
//!
//! Commands:
//! - `gate backtest|optimization|validation`: evaluate one gate against JSON input
//! - `aggregate`: robustness summary of a JSON list of Monte Carlo runs
//! - `split`: preview the seeded train/test splits of a hypothesis
//! - `thresholds`: print the effective threshold config and its fingerprint
//! - `check-config`: validate a run config TOML

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use hypolab_core::{
    aggregate, evaluate_backtest, evaluate_optimization, evaluate_validation, generate_split,
    select_parameters, Decision, MonteCarloRun, ParameterCandidate, ParameterSet,
    PerformanceMetrics, PhaseCounters, RobustnessSummary, SeedHierarchy, ThresholdConfig,
};
use hypolab_runner::RunConfig;

#[derive(Parser)]
#[command(
    name = "hypolab",
    version,
    about = "Hypolab CLI: gate evaluation and walk-forward statistics for trading hypotheses"
)]
struct Cli {
    /// Debug logging (RUST_LOG overrides).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one gate.
    Gate {
        #[command(subcommand)]
        gate: GateCommand,
    },
    /// Aggregate a JSON array of Monte Carlo runs into a robustness summary.
    Aggregate {
        /// JSON file holding an array of runs.
        #[arg(long)]
        runs: PathBuf,

        /// Threshold config TOML. Defaults apply when omitted.
        #[arg(long)]
        thresholds: Option<PathBuf>,
    },
    /// Preview the randomized train/test splits a validation pass would draw.
    Split {
        /// First date with data (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// Last date with data (YYYY-MM-DD).
        #[arg(long)]
        end: String,

        #[arg(long, default_value_t = 730)]
        train_days: u32,

        #[arg(long, default_value_t = 180)]
        test_days: u32,

        /// Hypothesis id the split seeds are derived from.
        #[arg(long, default_value = "preview")]
        hypothesis: String,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long, default_value_t = 10)]
        runs: usize,

        /// Validation pass (0 = first pass, retries draw fresh splits).
        #[arg(long, default_value_t = 0)]
        pass: u32,
    },
    /// Print the effective threshold config as TOML.
    Thresholds {
        /// Threshold config TOML. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON document of per-hypothesis overrides.
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// Validate a run config TOML and print what it resolves to.
    CheckConfig {
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum GateCommand {
    /// Backtest gate over a metrics JSON file.
    Backtest {
        #[arg(long)]
        metrics: PathBuf,

        #[arg(long)]
        thresholds: Option<PathBuf>,

        /// Print the full decision as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Optimization gate over baseline and optimized metrics.
    Optimization {
        #[arg(long)]
        baseline: PathBuf,

        #[arg(long)]
        optimized: PathBuf,

        /// Best parameters (JSON object), required with --candidates.
        #[arg(long)]
        parameters: Option<PathBuf>,

        /// Evaluated candidates (JSON array) for the sensitivity check.
        #[arg(long)]
        candidates: Option<PathBuf>,

        #[arg(long)]
        thresholds: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Validation gate over a robustness summary JSON file.
    Validation {
        #[arg(long)]
        summary: PathBuf,

        /// RETRY_VALIDATION decisions already taken.
        #[arg(long, default_value_t = 0)]
        retries: u32,

        #[arg(long)]
        thresholds: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Gate { gate } => run_gate(gate),
        Commands::Aggregate { runs, thresholds } => run_aggregate(&runs, thresholds.as_deref()),
        Commands::Split {
            start,
            end,
            train_days,
            test_days,
            hypothesis,
            seed,
            runs,
            pass,
        } => run_split(&start, &end, train_days, test_days, &hypothesis, seed, runs, pass),
        Commands::Thresholds { config, overrides } => {
            run_thresholds(config.as_deref(), overrides.as_deref())
        }
        Commands::CheckConfig { config } => run_check_config(&config),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ─── Input helpers ───────────────────────────────────────────────────

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_thresholds(path: Option<&Path>) -> Result<ThresholdConfig> {
    match path {
        Some(p) => {
            let config = ThresholdConfig::load(p)
                .with_context(|| format!("threshold config {}", p.display()))?;
            debug!(path = %p.display(), fingerprint = %config.fingerprint(), "loaded thresholds");
            Ok(config)
        }
        None => Ok(ThresholdConfig::default()),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

fn print_decision(decision: &Decision, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(decision)?);
    } else {
        println!("{}", decision.action);
        println!("  {}", decision.rationale);
    }
    Ok(())
}

// ─── Commands ────────────────────────────────────────────────────────

fn run_gate(gate: GateCommand) -> Result<()> {
    match gate {
        GateCommand::Backtest {
            metrics,
            thresholds,
            json,
        } => {
            let m: PerformanceMetrics = read_json(&metrics)?;
            let t = load_thresholds(thresholds.as_deref())?;
            let decision = evaluate_backtest(&m, &t, &PhaseCounters::default())?;
            print_decision(&decision, json)
        }
        GateCommand::Optimization {
            baseline,
            optimized,
            parameters,
            candidates,
            thresholds,
            json,
        } => {
            let base: PerformanceMetrics = read_json(&baseline)?;
            let opt: PerformanceMetrics = read_json(&optimized)?;
            let t = load_thresholds(thresholds.as_deref())?;
            let decision = evaluate_optimization(&base, &opt, &t, &PhaseCounters::default())?;
            print_decision(&decision, json)?;

            if let Some(candidates) = candidates {
                let Some(parameters) = parameters else {
                    bail!("--candidates requires --parameters");
                };
                let best: ParameterSet = read_json(&parameters)?;
                let list: Vec<ParameterCandidate> = read_json(&candidates)?;
                let choice = select_parameters(&best, &list, &t.optimization);
                println!(
                    "parameters ({:?}, spread {:.3?}): {}",
                    choice.source,
                    choice.spread,
                    serde_json::to_string(&choice.parameters)?
                );
            }
            Ok(())
        }
        GateCommand::Validation {
            summary,
            retries,
            thresholds,
            json,
        } => {
            let s: RobustnessSummary = read_json(&summary)?;
            let t = load_thresholds(thresholds.as_deref())?;
            let history = PhaseCounters {
                validation_retries: retries,
                ..PhaseCounters::default()
            };
            let decision = evaluate_validation(&s, &t, &history)?;
            print_decision(&decision, json)
        }
    }
}

fn run_aggregate(runs_path: &Path, thresholds: Option<&Path>) -> Result<()> {
    let runs: Vec<MonteCarloRun> = read_json(runs_path)?;
    let t = load_thresholds(thresholds)?;
    let summary = aggregate(&runs, &t).context("no runs to aggregate")?;
    info!(
        runs = summary.runs_used,
        mean_degradation = summary.mean_degradation,
        dsr = summary.dsr,
        "aggregated"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_split(
    start: &str,
    end: &str,
    train_days: u32,
    test_days: u32,
    hypothesis: &str,
    seed: u64,
    runs: usize,
    pass: u32,
) -> Result<()> {
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    let seeds = SeedHierarchy::new(seed);

    println!(
        "{:>4}  {:<10}  {:<10}  {:<10}  {:<10}  {:>6}  {:>5}",
        "run", "train", "", "test", "", "train", "test"
    );
    for i in 0..runs {
        let split = generate_split(
            start,
            end,
            train_days,
            test_days,
            seeds.pass_split_seed(hypothesis, pass, i as u64),
        )?;
        println!(
            "{:>4}  {}  {}  {}  {}  {:>6}  {:>5}",
            i,
            split.train_start,
            split.train_end,
            split.test_start,
            split.test_end,
            split.train_days(),
            split.test_days()
        );
    }
    Ok(())
}

fn run_thresholds(config: Option<&Path>, overrides: Option<&Path>) -> Result<()> {
    let mut t = load_thresholds(config)?;
    if let Some(path) = overrides {
        let doc: serde_json::Value = read_json(path)?;
        t = t
            .apply_overrides(&doc)
            .with_context(|| format!("overrides {}", path.display()))?;
    }
    print!("{}", toml::to_string_pretty(&t)?);
    println!("# fingerprint = \"{}\"", t.fingerprint());
    Ok(())
}

fn run_check_config(path: &Path) -> Result<()> {
    let config = RunConfig::load(path).with_context(|| format!("run config {}", path.display()))?;
    let mc = &config.monte_carlo;
    println!("hypothesis   {}", config.hypothesis.id);
    println!("dataset      {} .. {}", config.dataset.start, config.dataset.end);
    println!(
        "monte carlo  {} runs, train >= {}d, test >= {}d, {} workers, seed {}",
        mc.runs_requested, mc.min_train_days, mc.min_test_days, mc.workers, mc.master_seed
    );
    println!("thresholds   {}", config.thresholds.fingerprint());
    Ok(())
}
