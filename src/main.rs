//! Referral engine CLI
//!
//! Usage:
//!   referral --config referral.toml reconcile 0xabc... 0xdef...
//!   referral reconcile --file addresses.txt
//!   referral retry-failed
//!   referral invest --investor 0xabc... --amount 1500 --event-id 0xtx...
//!   referral recompute
//!   referral rewards 0xabc... --invest 1000 --profit 250
//!   referral downline 0xabc... --level 2 --invested true --page 1 --limit 50
//!   referral tree 0xabc... --depth 5
//!
//! Environment Variables:
//!   REFERRAL_CONFIG - Path to TOML config file
//!   REFERRAL_DB_PATH - SQLite database path
//!   LEDGER_RPC_URL / REFERRAL_CONTRACT - JSON-RPC ledger
//!   LEDGER_SNAPSHOT_PATH - offline `{address: referrer}` JSON ledger
//!   RUST_LOG - log filter (default: referral_backend=info,referral=info)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use referral_backend::ledger::{self, LedgerSource};
use referral_backend::models::{scaled_to_decimal, Address, InvestmentEvent};
use referral_backend::reconcile::{BatchProgress, BatchRun};
use referral_backend::store::DownlineQuery;
use referral_backend::tree::build_tree;
use referral_backend::{Engine, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "referral")]
#[command(about = "Referral graph reconciliation, volume aggregation and reward quotes")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, env = "REFERRAL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync referrer pointers from the ledger
    Reconcile {
        addresses: Vec<String>,

        /// File with one address per line
        #[arg(long)]
        file: Option<PathBuf>,

        /// Every address already in the store
        #[arg(long)]
        all: bool,
    },
    /// Re-run addresses whose last reconcile failed
    RetryFailed,
    /// Apply one investment event and propagate volumes upline
    Invest {
        #[arg(long)]
        investor: String,

        /// Human-denominated amount, e.g. 1500.25
        #[arg(long, conflicts_with = "raw_amount")]
        amount: Option<String>,

        /// Ledger integer amount scaled by 10^amount_decimals
        #[arg(long)]
        raw_amount: Option<String>,

        /// Replay key, usually the transaction hash
        #[arg(long)]
        event_id: String,
    },
    /// Recompute volumes for every stored node
    Recompute,
    /// Rank, bonus and optional commission/profit-share quotes
    Rewards {
        address: String,

        /// Quote direct commissions for this invested amount
        #[arg(long)]
        invest: Option<String>,

        /// Quote profit sharing for this realised profit
        #[arg(long)]
        profit: Option<String>,
    },
    /// Paged downline listing
    Downline {
        root: String,

        #[arg(long)]
        level: Option<u32>,

        #[arg(long)]
        invested: Option<bool>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// Nested tree under a root
    Tree {
        root: String,

        #[arg(long)]
        depth: Option<usize>,
    },
    /// Mark a node inactive; nodes are never removed
    Deactivate { address: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    let engine = Engine::open(config).context("Failed to open referral engine")?;

    match cli.command {
        Command::Reconcile {
            addresses,
            file,
            all,
        } => {
            let mut targets = parse_addresses(&addresses)?;
            if let Some(path) = file {
                targets.extend(read_address_file(&path)?);
            }
            if all {
                targets.extend(engine.store().addresses()?);
            }
            if targets.is_empty() {
                bail!("Nothing to reconcile: pass addresses, --file or --all");
            }

            let driver = engine.batch_driver(ledger_source(&engine)?);
            let mut run = BatchRun::new();
            spawn_stop_on_ctrl_c(&run);
            let progress = driver.run(targets, &mut run).await;
            report_batch(&progress)?;
        }
        Command::RetryFailed => {
            let driver = engine.batch_driver(ledger_source(&engine)?);
            let mut run = BatchRun::new();
            spawn_stop_on_ctrl_c(&run);
            let progress = driver.retry_recorded(&mut run).await?;
            report_batch(&progress)?;
        }
        Command::Invest {
            investor,
            amount,
            raw_amount,
            event_id,
        } => {
            let event = match (amount, raw_amount) {
                (Some(amount), None) => InvestmentEvent {
                    event_id: event_id.trim().to_string(),
                    investor: Address::parse(&investor)?,
                    amount: parse_decimal(&amount)?,
                    occurred_at: Utc::now(),
                },
                (None, Some(raw)) => InvestmentEvent::from_raw(
                    &event_id,
                    &investor,
                    &raw,
                    engine.config().amount_decimals,
                    Utc::now(),
                )?,
                _ => bail!("Pass exactly one of --amount or --raw-amount"),
            };
            let outcome = engine.ingestor().ingest(&event)?;
            print_json(&outcome)?;
        }
        Command::Recompute => {
            let summary = engine.aggregator().recompute_all()?;
            print_json(&summary)?;
        }
        Command::Rewards {
            address,
            invest,
            profit,
        } => {
            let address = Address::parse(&address)?;
            let rewards = engine.rewards();
            print_json(&rewards.eligibility(&address)?)?;
            if let Some(amount) = invest {
                print_json(&rewards.quote_investment(&address, parse_decimal(&amount)?)?)?;
            }
            if let Some(amount) = profit {
                print_json(&rewards.quote_profit(&address, parse_decimal(&amount)?)?)?;
            }
        }
        Command::Downline {
            root,
            level,
            invested,
            page,
            limit,
        } => {
            let query = DownlineQuery {
                level,
                invested,
                page,
                limit,
            };
            let page = engine
                .store()
                .get_downline(&Address::parse(&root)?, &query)?;
            print_json(&page)?;
        }
        Command::Tree { root, depth } => {
            let root = Address::parse(&root)?;
            let depth = depth.unwrap_or(engine.config().max_upline_depth);
            let nodes = engine.store().snapshot()?;
            match build_tree(&nodes, &root, depth) {
                Some(tree) => print_json(&tree)?,
                None => bail!("{root} is not in the store"),
            }
        }
        Command::Deactivate { address } => {
            let address = Address::parse(&address)?;
            if !engine.store().deactivate(&address)? {
                warn!(%address, "No such node");
            }
        }
    }

    Ok(())
}

fn ledger_source(engine: &Engine) -> Result<Arc<dyn LedgerSource>> {
    let ledger_config = &engine.config().ledger;
    let http = reqwest::Client::builder()
        .timeout(ledger_config.call_timeout() + Duration::from_secs(1))
        .build()
        .context("Failed to build HTTP client")?;
    let source = ledger::source_from_config(ledger_config, http)?;
    info!("📡 Ledger source: {}", source.name());
    Ok(source)
}

fn spawn_stop_on_ctrl_c(run: &BatchRun) {
    let stop = run.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current batch");
            stop.stop();
        }
    });
}

fn report_batch(progress: &BatchProgress) -> Result<()> {
    print_json(progress)?;
    if progress.failed > 0 {
        warn!(
            failed = progress.failed,
            "Some addresses failed; run `referral retry-failed` to retry them"
        );
    }
    Ok(())
}

fn parse_addresses(raw: &[String]) -> Result<Vec<Address>> {
    raw.iter()
        .map(|a| Address::parse(a).map_err(anyhow::Error::from))
        .collect()
}

fn read_address_file(path: &Path) -> Result<Vec<Address>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read address file {}", path.display()))?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            Address::parse(line).with_context(|| format!("Bad address in {}", path.display()))
        })
        .collect()
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim()).with_context(|| format!("Not a decimal amount: {raw:?}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "referral_backend=info,referral=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
