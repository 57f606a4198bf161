//! quotefeed CLI: refresh index and holding series for publishing.
//!
//! Commands:
//! - `refresh`: fetch, merge and write every target, then the summaries
//! - `targets`: print the resolved target list without fetching

mod logging;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use quotefeed_core::data::{
    CircuitBreaker, DataProvider, EastmoneyProvider, FlowProvider, HttpFetcher, SourceResolver,
    YahooProvider,
};
use quotefeed_runner::{load_targets, refresh_targets, RefreshConfig, RefreshPipeline};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "quotefeed",
    about = "Scheduled refresh of market-index and holdings daily series"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArgs {
    /// TOML config file. Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output (publish) directory.
    #[arg(long, env = "OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// Holdings CSV with a ticker/symbol column.
    #[arg(long = "holdings", env = "HOLDINGS_CSV")]
    holdings_csv: Option<PathBuf>,

    /// Years of history fetched for any target with no stored data.
    #[arg(long, env = "N_YEARS")]
    years: Option<u32>,

    /// History window for indices only; wins over `--years`.
    #[arg(long = "index-years")]
    index_history_years: Option<u32>,

    /// History window for holdings only; wins over `--years`.
    #[arg(long = "holding-years")]
    holding_history_years: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new rows for every target and rewrite the output directory.
    Refresh {
        #[command(flatten)]
        config: ConfigArgs,

        /// Refresh only these target ids; the summary still covers all.
        #[arg(long, num_args = 1..)]
        only: Vec<String>,

        /// Worker threads (1 = sequential).
        #[arg(long)]
        workers: Option<usize>,

        /// Ignore stored series and fetch full history.
        #[arg(long, default_value_t = false)]
        full: bool,

        /// Skip the capital-flow sub-fetch for holdings.
        #[arg(long, default_value_t = false)]
        no_flow: bool,

        /// Where to write the JSON run log.
        #[arg(long)]
        run_log: Option<PathBuf>,
    },
    /// Print the target list a refresh would use.
    Targets {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_logging();

    match cli.command {
        Commands::Refresh {
            config,
            only,
            workers,
            full,
            no_flow,
            run_log,
        } => {
            let mut cfg = load_config(&config)?;
            if let Some(workers) = workers {
                cfg.max_workers = workers;
            }
            if no_flow {
                cfg.fetch_capital_flow = false;
            }
            if let Some(run_log) = run_log {
                cfg.run_log = run_log;
            }
            cfg.validate()?;
            run_refresh(&cfg, only, full)
        }
        Commands::Targets { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            run_targets(&cfg)
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<RefreshConfig> {
    let mut cfg = match &args.config {
        Some(path) => RefreshConfig::from_file(path)?,
        None => RefreshConfig::default(),
    };
    if let Some(out_dir) = &args.out_dir {
        cfg.out_dir = out_dir.clone();
    }
    if let Some(holdings) = &args.holdings_csv {
        cfg.holdings_csv = holdings.clone();
    }
    if let Some(years) = args.years {
        cfg.index_history_years = years;
        cfg.holding_history_years = years;
    }
    if let Some(years) = args.index_history_years {
        cfg.index_history_years = years;
    }
    if let Some(years) = args.holding_history_years {
        cfg.holding_history_years = years;
    }
    Ok(cfg)
}

/// Yahoo first; Eastmoney as index fallback and capital-flow source. Each
/// host gets its own breaker so a ban on one leaves the other usable.
fn build_resolver(cfg: &RefreshConfig) -> Result<SourceResolver> {
    let http = || {
        HttpFetcher::new(
            Arc::new(CircuitBreaker::for_scheduled_run()),
            cfg.retry_policy(),
            cfg.request_timeout(),
        )
        .context("build HTTP client")
    };
    let yahoo: Arc<dyn DataProvider> = Arc::new(YahooProvider::new(http()?));
    let eastmoney = Arc::new(EastmoneyProvider::new(http()?));
    let fallback: Arc<dyn DataProvider> = eastmoney.clone();
    let flow: Arc<dyn FlowProvider> = eastmoney;

    Ok(
        SourceResolver::new(yahoo, cfg.resolver_settings(), Local::now().date_naive())
            .with_index_fallback(fallback)
            .with_flow_provider(flow),
    )
}

fn run_refresh(cfg: &RefreshConfig, only: Vec<String>, full: bool) -> Result<ExitCode> {
    let list = refresh_targets(cfg);
    let resolver = build_resolver(cfg)?;

    let run = RefreshPipeline::new(cfg, &resolver)
        .full_refresh(full)
        .only(only)
        .holdings_failure(list.holdings_failure)
        .run(&list.targets);

    print!("{}", run.summary_table());
    if let Err(e) = run.write_log(&cfg.run_log) {
        error!(error = %format!("{e:#}"), "run log not written");
    } else {
        info!(path = %cfg.run_log.display(), "run log written");
    }

    if run.is_total_failure() {
        error!("no target was refreshed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_targets(cfg: &RefreshConfig) -> Result<ExitCode> {
    let targets = load_targets(cfg)
        .with_context(|| format!("load holdings {}", cfg.holdings_csv.display()))?;

    println!("{:<12} {:<8} {}", "Id", "Kind", "Name");
    println!("{}", "-".repeat(36));
    for t in &targets {
        println!("{:<12} {:<8} {}", t.id, t.kind.label(), t.display_name);
    }
    println!("\n{} targets", targets.len());
    Ok(ExitCode::SUCCESS)
}
