//! tally - deploy the vote tally machine and talk to it.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tally_deploy::{
    abi::{Bytes32, Value},
    artifact,
    client::{LedgerClient, LocalLedger, Mining},
    config::{self, Endpoint, TallyConfig, DEFAULT_CONFIG_PATH},
    deploy::Deployer,
    descriptor::{Descriptor, DescriptorStore},
    handle::Outcome,
    proxy::{self, BindOptions, ProxyError},
    rpc::RpcClient,
    tally::{TallyBinding, TOTAL_VOTES_OP},
    view::{TallyView, TerminalSurface},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Ledger endpoint: "local" or host:port of a tally-node
    #[arg(long)]
    endpoint: Option<String>,

    /// Descriptor file
    #[arg(long)]
    descriptor: Option<PathBuf>,

    /// Development account index used to sign
    #[arg(long)]
    account: Option<u32>,

    /// Log level (trace, debug, info, warn, error); overrides `RUST_LOG`
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the ledger's development accounts
    Accounts,

    /// Compile a machine definition and print its bytecode and interface
    Compile {
        /// Source file (defaults to deploy.source)
        source: Option<PathBuf>,
        /// Also write the artifact as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Deploy the machine and save its descriptor
    Deploy {
        /// Source file (defaults to deploy.source)
        #[arg(long)]
        source: Option<PathBuf>,
        /// Comma separated candidate names (defaults to deploy.candidates)
        #[arg(long, value_delimiter = ',')]
        candidates: Vec<String>,
        /// Gas ceiling for the construction transaction
        #[arg(long)]
        gas_limit: Option<u64>,
    },

    /// Read-only call against the deployed machine
    Call {
        /// Operation name
        operation: String,
        /// Arguments, parsed by the operation's declared types
        args: Vec<String>,
    },

    /// Vote for a candidate and wait for the ledger's verdict
    Vote {
        candidate: String,
        /// Ask validCandidate before submitting
        #[arg(long)]
        precheck: bool,
    },

    /// Show the current tally, optionally casting one vote first
    Tally {
        /// Candidate to vote for
        #[arg(long)]
        vote: Option<String>,
    },

    /// Compile, deploy, vote once and save the descriptor
    Demo {
        /// Candidate to vote for
        #[arg(long, default_value = "Rama")]
        vote: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = config::log_filter(cli.log_level.as_deref(), env.as_deref(), "warn");
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = TallyConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(endpoint) = &cli.endpoint {
        config.ledger.endpoint = endpoint.parse()?;
    }
    if let Some(descriptor) = &cli.descriptor {
        config.deploy.descriptor = descriptor.clone();
    }
    if let Some(account) = cli.account {
        config.deploy.account = account;
        config.deploy.secret_hex = None;
    }

    match cli.command {
        Commands::Accounts => accounts_cmd(&config),
        Commands::Compile { source, out } => compile_cmd(&config, source, out),
        Commands::Deploy {
            source,
            candidates,
            gas_limit,
        } => {
            if let Some(source) = source {
                config.deploy.source = source;
            }
            if !candidates.is_empty() {
                config.deploy.candidates = candidates;
            }
            if let Some(gas_limit) = gas_limit {
                config.deploy.gas_limit = gas_limit;
            }
            deploy_cmd(&config)
        }
        Commands::Call { operation, args } => call_cmd(&config, &operation, &args),
        Commands::Vote {
            candidate,
            precheck,
        } => vote_cmd(&config, &candidate, precheck),
        Commands::Tally { vote } => tally_cmd(&config, vote.as_deref()),
        Commands::Demo { vote } => demo_cmd(&config, &vote),
    }
}

fn open_client(config: &TallyConfig) -> Result<Arc<dyn LedgerClient>> {
    match &config.ledger.endpoint {
        Endpoint::Local => {
            info!("using an in-process development ledger");
            Ok(Arc::new(LocalLedger::open(
                &config.ledger.settings(),
                Mining::Interval(config.ledger.block_interval()),
            )))
        }
        Endpoint::Rpc(addr) => {
            let client = RpcClient::connect(addr.as_str())
                .with_context(|| format!("failed to connect to ledger node at {addr}"))?;
            Ok(Arc::new(client))
        }
    }
}

fn warn_if_local(config: &TallyConfig) {
    if config.ledger.endpoint == Endpoint::Local {
        warn!("the in-process ledger starts empty; point --endpoint at a tally-node to reach an earlier deployment");
    }
}

fn bind_options(config: &TallyConfig) -> BindOptions {
    BindOptions {
        poll_interval: config.ledger.poll_interval(),
        ..BindOptions::default()
    }
}

fn load_descriptor(config: &TallyConfig) -> Result<Descriptor> {
    let store = DescriptorStore::new(&config.deploy.descriptor);
    store
        .load()
        .with_context(|| format!("no usable descriptor at {}", store.path().display()))
}

fn parse_candidate(name: &str) -> Result<Bytes32> {
    name.parse()
        .with_context(|| format!("invalid candidate name {name:?}"))
}

fn accounts_cmd(config: &TallyConfig) -> Result<()> {
    let client = open_client(config)?;
    for (idx, account) in client.accounts()?.iter().enumerate() {
        println!("({idx}) {account}");
    }
    client.close()?;
    Ok(())
}

fn compile_cmd(config: &TallyConfig, source: Option<PathBuf>, out: Option<PathBuf>) -> Result<()> {
    let source = source.unwrap_or_else(|| config.deploy.source.clone());
    let artifact = artifact::produce_file(&source)?;
    println!("machine:  {}", artifact.name);
    println!("bytecode: 0x{}", hex::encode(&artifact.bytecode));
    println!("abi:      {}", serde_json::to_string_pretty(&artifact.abi)?);
    if let Some(out) = out {
        std::fs::write(&out, serde_json::to_vec_pretty(&artifact)?)
            .with_context(|| format!("failed to write {}", out.display()))?;
        println!("artifact written to {}", out.display());
    }
    Ok(())
}

fn deploy_with(config: &TallyConfig, client: Arc<dyn LedgerClient>) -> Result<Descriptor> {
    let artifact = artifact::produce_file(&config.deploy.source)?;
    let candidates = Value::Bytes32List(config.deploy.candidate_ids()?);
    let identity = config.deploy.identity(config.ledger.dev_seed)?;
    let deployer = Deployer::new(client, config.ledger.poll_interval());
    let pending = deployer
        .submit(&artifact, &[candidates], &identity, config.deploy.gas_limit)
        .context("deployment was not accepted")?;
    println!("submitted {} from {}", pending.tx_id(), identity.account());
    println!("waiting for confirmation...");
    let descriptor = pending.wait().context("deployment failed")?;
    println!("deployed at {}", descriptor.address);
    DescriptorStore::new(&config.deploy.descriptor).save(&descriptor)?;
    println!("descriptor saved to {}", config.deploy.descriptor.display());
    Ok(descriptor)
}

fn deploy_cmd(config: &TallyConfig) -> Result<()> {
    warn_if_local(config);
    let client = open_client(config)?;
    deploy_with(config, client.clone())?;
    client.close()?;
    Ok(())
}

fn call_cmd(config: &TallyConfig, operation: &str, args: &[String]) -> Result<()> {
    warn_if_local(config);
    let descriptor = load_descriptor(config)?;
    let op = descriptor
        .abi
        .get(operation)
        .ok_or_else(|| ProxyError::UnknownOperation(operation.to_string()))?;
    if op.inputs.len() != args.len() {
        bail!("{} takes {} arguments, got {}", op.signature(), op.inputs.len(), args.len());
    }
    let values = op
        .inputs
        .iter()
        .zip(args)
        .map(|(param, text)| Value::parse(param.ty, text))
        .collect::<Result<Vec<_>, _>>()?;
    let client = open_client(config)?;
    let proxy = proxy::bind(&descriptor, client.clone(), bind_options(config))?;
    let value = proxy.call(operation, &values)?;
    println!("{value}");
    proxy.close();
    client.close()?;
    Ok(())
}

fn report(outcome: &Outcome) -> Result<()> {
    match outcome {
        Outcome::Confirmed(receipt) => {
            println!(
                "confirmed {} in block {} ({} gas)",
                receipt.tx_id, receipt.block, receipt.gas_used
            );
            Ok(())
        }
        Outcome::Rejected { block, reason } => {
            bail!("rejected in block {block}: {}", ProxyError::from_rejection(reason))
        }
    }
}

fn vote_cmd(config: &TallyConfig, candidate: &str, precheck: bool) -> Result<()> {
    warn_if_local(config);
    let candidate = parse_candidate(candidate)?;
    let descriptor = load_descriptor(config)?;
    let identity = config.deploy.identity(config.ledger.dev_seed)?;
    let client = open_client(config)?;
    let binding = TallyBinding::new(proxy::bind(&descriptor, client.clone(), bind_options(config))?)
        .with_precheck(precheck);
    let handle = binding.vote(&candidate, &identity)?;
    println!("submitted {}", handle.id());
    let result = report(&handle.wait());
    if result.is_ok() {
        println!("{candidate}: {}", binding.total_votes_for(&candidate)?);
    }
    binding.proxy().close();
    client.close()?;
    result
}

fn tally_cmd(config: &TallyConfig, vote: Option<&str>) -> Result<()> {
    warn_if_local(config);
    let descriptor = load_descriptor(config)?;
    let client = open_client(config)?;
    let binding = TallyBinding::new(proxy::bind(&descriptor, client.clone(), bind_options(config))?);
    let view = TallyView::new(binding.clone(), config.slots()?, Arc::new(TerminalSurface));
    println!("-- loaded --");
    view.load();
    let mut result = Ok(());
    if let Some(candidate) = vote {
        let identity = config.deploy.identity(config.ledger.dev_seed)?;
        let handle = view.vote_for(parse_candidate(candidate)?, &identity)?;
        println!("-- vote {} --", handle.id());
        result = report(&handle.wait());
    }
    binding.proxy().close();
    client.close()?;
    result
}

fn demo_cmd(config: &TallyConfig, vote: &str) -> Result<()> {
    let client = open_client(config)?;
    println!("accounts:");
    for (idx, account) in client.accounts()?.iter().enumerate() {
        println!("  ({idx}) {account}");
    }

    let artifact = artifact::produce_file(&config.deploy.source)?;
    println!("bytecode: 0x{}", hex::encode(&artifact.bytecode));
    println!("abi: {}", serde_json::to_string(&artifact.abi)?);

    let descriptor = deploy_with(config, client.clone())?;
    let binding = TallyBinding::new(proxy::bind(&descriptor, client.clone(), bind_options(config))?);
    let candidate = parse_candidate(vote)?;
    let identity = config.deploy.identity(config.ledger.dev_seed)?;

    let before = binding.total_votes_for(&candidate)?;
    println!("{TOTAL_VOTES_OP}({candidate}) before vote: {before}");
    let handle = binding.vote(&candidate, &identity)?;
    println!("vote submitted: {}", handle.id());
    let result = report(&handle.wait());
    if result.is_ok() {
        let after = binding.total_votes_for(&candidate)?;
        println!("{TOTAL_VOTES_OP}({candidate}) after vote: {after}");
    }

    binding.proxy().close();
    client.close()?;
    result
}
