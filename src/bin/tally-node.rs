//! tally-node - standalone development ledger served over TCP.

use std::{net::TcpListener, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tally_deploy::{
    client::{LedgerClient, LocalLedger, Mining},
    config,
    ledger::{LedgerSettings, DEFAULT_CALL_GAS_CAP},
    rpc,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tally-node")]
#[command(version, about = "Development ledger node", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8545")]
    bind: String,

    /// Seal a block this often when transactions are waiting
    #[arg(long, default_value_t = 500)]
    block_interval_ms: u64,

    /// Seed the development accounts are derived from
    #[arg(long, default_value_t = 8545)]
    dev_seed: u64,

    /// Number of development accounts
    #[arg(long, default_value_t = 10)]
    dev_accounts: u32,

    /// Gas cap for read-only calls
    #[arg(long, default_value_t = DEFAULT_CALL_GAS_CAP)]
    call_gas_cap: u64,

    /// Log level (trace, debug, info, warn, error); overrides `RUST_LOG`
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = config::log_filter(args.log_level.as_deref(), env.as_deref(), "info");
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let settings = LedgerSettings {
        dev_seed: args.dev_seed,
        dev_accounts: args.dev_accounts,
        call_gas_cap: args.call_gas_cap,
    };
    let ledger = Arc::new(LocalLedger::open(
        &settings,
        Mining::Interval(Duration::from_millis(args.block_interval_ms.max(1))),
    ));

    println!("Available accounts (seed {}):", args.dev_seed);
    for (idx, account) in ledger.accounts()?.iter().enumerate() {
        println!("({idx}) {account}");
    }
    info!(
        accounts = args.dev_accounts,
        block_interval_ms = args.block_interval_ms,
        "development ledger ready"
    );

    let listener =
        TcpListener::bind(&args.bind).with_context(|| format!("failed to bind {}", args.bind))?;
    println!("listening on {}", listener.local_addr()?);
    let shared: Arc<dyn LedgerClient> = ledger;
    rpc::serve(listener, shared).context("ledger node stopped")
}
