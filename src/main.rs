use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use keeper_operator::automation::{HttpAutomationClient, RetryConfig};
use keeper_operator::chain::EvmClient;
use keeper_operator::executer::UpkeepExecuter;
use keeper_operator::store::{KeeperStore, PgStore, Registry};
use keeper_operator::sync::RegistrySynchronizer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch registered keeper registries and trigger upkeeps
    Run(RunArgs),
    /// Register a keeper registry to watch
    Register {
        /// Registry contract address
        #[arg(long)]
        address: Address,

        /// Keeper operator address within the registry's keeper list
        #[arg(long)]
        from: Address,

        /// Job on the automation node to trigger for this registry
        #[arg(long)]
        job_id: Uuid,
    },
    /// Delete a registry and all of its upkeeps
    Unregister {
        #[arg(long)]
        job_id: Uuid,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Websocket RPC URL for the chain
    #[arg(long, env = "KEEPER_ETH_ENDPOINT")]
    rpc: String,

    /// Automation node base URL
    #[arg(long, env = "AUTOMATION_URL")]
    automation_url: String,

    /// Access key for the automation node
    #[arg(long, env = "AUTOMATION_ACCESS_KEY", default_value = "")]
    automation_access_key: String,

    /// Secret for the automation node
    #[arg(long, env = "AUTOMATION_SECRET", default_value = "")]
    automation_secret: String,

    /// Interval between registry sync passes, in seconds
    #[arg(long, default_value = "30")]
    sync_interval: u64,

    /// Per-attempt timeout for job triggers, in seconds
    #[arg(long, default_value = "5")]
    trigger_timeout: u64,

    /// Maximum number of job trigger attempts
    #[arg(long, default_value = "3")]
    trigger_attempts: usize,

    /// Delay between job trigger attempts, in seconds
    #[arg(long, default_value = "1")]
    trigger_delay: u64,
}

async fn connect_store() -> Result<PgStore> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let store = PgStore::connect(&database_url).await?;
    store.apply_migrations().await?;
    Ok(store)
}

async fn run(args: RunArgs) -> Result<()> {
    let store = connect_store().await?;

    let chain = EvmClient::connect(&args.rpc)
        .await
        .context("Failed to connect to the chain RPC")?;

    let automation = HttpAutomationClient::new(
        args.automation_url,
        args.automation_access_key,
        args.automation_secret,
        RetryConfig {
            timeout: Duration::from_secs(args.trigger_timeout),
            attempts: args.trigger_attempts,
            delay: Duration::from_secs(args.trigger_delay),
        },
    )?;

    let synchronizer = RegistrySynchronizer::new(
        chain.clone(),
        store.clone(),
        Duration::from_secs(args.sync_interval),
    );
    synchronizer
        .start()
        .context("Failed to start registry synchronizer")?;

    let executer = UpkeepExecuter::new(chain, store, automation);
    executer
        .start()
        .await
        .context("Failed to start upkeep executer")?;

    info!("keeper operator started");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");

    executer.stop().await;
    synchronizer.stop().await;

    Ok(())
}

async fn register(address: Address, from: Address, job_id: Uuid) -> Result<()> {
    let store = connect_store().await?;
    let registry = store
        .create_registry(&Registry::new(address, from, job_id))
        .await?;
    info!(id = registry.id, registry = %registry.address, "registry registered");
    Ok(())
}

async fn unregister(job_id: Uuid) -> Result<()> {
    let store = connect_store().await?;
    let deleted = store.delete_registry_by_job_id(job_id).await?;
    info!(deleted, %job_id, "registries deleted");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let mut filter = EnvFilter::new("info");
    if let Ok(var) = std::env::var("RUST_LOG") {
        filter = filter.add_directive(var.parse()?);
    }
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .with_env_filter(filter)
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await.context("run error"),
        Command::Register {
            address,
            from,
            job_id,
        } => register(address, from, job_id).await.context("register error"),
        Command::Unregister { job_id } => unregister(job_id).await.context("unregister error"),
    }
}
