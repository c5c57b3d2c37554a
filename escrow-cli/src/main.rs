//! Escrow operator daemon.
//!
//! `escrowd run` starts the ingestion, payout-flush and payout-watch loops
//! against PostgreSQL and the configured chain nodes. The other commands
//! work on the pending-payment log and the chain wallets directly.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use escrow_engine::{
    chain::ChainRegistry,
    config::AppConfig,
    models::Currency,
    node::EscrowNode,
    payout_pool::WithdrawalGate,
    pending_log::PendingLog,
    settlement::{SettlementOutcome, Settler},
    store::PgLedgerStore,
};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "escrowd", about = "Escrow and wallet-settlement daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background loops until Ctrl-C
    Run,
    /// Broadcast queued payouts
    Settle {
        /// Only this currency (BTC or XMR); all configured by default
        #[arg(long)]
        currency: Option<Currency>,
        /// Print what would be paid without broadcasting
        #[arg(long)]
        dry_run: bool,
    },
    /// Summarize the pending-payment log by status
    Pending,
    /// Return an in-doubt payout record to the queue once it is known not
    /// to have reached the network
    Requeue {
        /// Record id as shown by `escrowd pending`
        record: Uuid,
    },
    /// Show the chain-side wallet balance per currency
    Balance,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load().context("loading configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Settle { currency, dry_run } => settle(config, currency, dry_run).await,
        Command::Pending => pending(config).await,
        Command::Requeue { record } => requeue(config, record).await,
        Command::Balance => balance(config).await,
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = PgLedgerStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;

    let node = EscrowNode::from_config(Arc::new(store), &config)?;
    let unflushed = node.pool().log().unflushed_outputs().await?;
    if !unflushed.is_empty() {
        warn!(
            "{} payout outputs from a previous run are still awaiting settlement",
            unflushed.len()
        );
    }

    let health = node.health_check().await?;
    for issue in &health.issues {
        warn!("Health: {}", issue);
    }

    node.start().await;
    info!("escrowd running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    node.shutdown().await?;
    Ok(())
}

async fn settle(config: AppConfig, currency: Option<Currency>, dry_run: bool) -> anyhow::Result<()> {
    let settler = Settler::new(
        Arc::new(PendingLog::new(config.payouts.pending_log_path.clone())),
        ChainRegistry::from_config(&config)?,
        Arc::new(WithdrawalGate::new()),
    );

    let results = match currency {
        Some(currency) => vec![(currency, settler.settle(currency, dry_run).await)],
        None => settler.settle_all(dry_run).await,
    };

    let mut failed = false;
    for (currency, result) in results {
        match result {
            Ok(SettlementOutcome::Idle) => println!("{}: nothing pending", currency),
            Ok(SettlementOutcome::Planned { outputs, total }) => {
                println!("{}: would pay {} to {} outputs", currency, total, outputs.len());
                for output in outputs {
                    println!("  {} {}", output.address, output.amount);
                }
            }
            Ok(SettlementOutcome::Broadcast { txid, records, total }) => {
                println!("{}: broadcast {} ({} records, {})", currency, txid, records, total);
            }
            Ok(SettlementOutcome::Reverted { records, error }) => {
                failed = true;
                println!("{}: {} records returned to queue: {}", currency, records, error);
            }
            Ok(SettlementOutcome::Failed { records, error }) => {
                failed = true;
                println!("{}: {} records marked failed: {}", currency, records, error);
            }
            Ok(SettlementOutcome::InDoubt { records, txid, error }) => {
                failed = true;
                println!(
                    "{}: {} records in doubt (txid {}), check the wallet before requeueing: {}",
                    currency,
                    records,
                    txid.as_deref().unwrap_or("unknown"),
                    error
                );
            }
            Err(e) => {
                failed = true;
                error!("{} settlement failed: {}", currency, e);
            }
        }
    }

    if failed {
        anyhow::bail!("settlement did not complete for every currency");
    }
    Ok(())
}

async fn pending(config: AppConfig) -> anyhow::Result<()> {
    let log = PendingLog::new(config.payouts.pending_log_path.clone());
    let summary = log.summary().await?;
    if summary.is_empty() {
        println!("{}: empty", log.path().display());
        return Ok(());
    }

    println!("{:<6} {:<12} {:>8} {:>20}", "COIN", "STATUS", "RECORDS", "TOTAL");
    for row in summary {
        println!(
            "{:<6} {:<12} {:>8} {:>20}",
            row.currency.code(),
            format!("{:?}", row.status).to_lowercase(),
            row.records,
            row.total
        );
    }

    for record in log.load().await?.into_iter().filter(|r| r.in_doubt) {
        println!(
            "in doubt: {} {} txid {} ({})",
            record.id,
            record.currency.code(),
            record.txid.as_deref().unwrap_or("unknown"),
            record.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn requeue(config: AppConfig, record: Uuid) -> anyhow::Result<()> {
    let log = PendingLog::new(config.payouts.pending_log_path.clone());
    if !log.requeue(record).await? {
        anyhow::bail!("record {} is not in doubt", record);
    }
    info!("Requeued payout record {}", record);
    Ok(())
}

async fn balance(config: AppConfig) -> anyhow::Result<()> {
    let chains = ChainRegistry::from_config(&config)?;
    for currency in chains.currencies() {
        match chains.get(currency)?.balance().await {
            Ok(balance) => println!(
                "{}: confirmed {} unconfirmed {}",
                currency, balance.confirmed, balance.unconfirmed
            ),
            Err(e) => error!("{} balance unavailable: {}", currency, e),
        }
    }
    Ok(())
}
