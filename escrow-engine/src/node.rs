//! Escrow node
//!
//! Owns every service of the engine and the background loops that drive
//! them: wallet ingestion, payout-pool flushing and the payout watch.
//! Callers build one node, start it, and reach the services through it.

use crate::{
    chain::ChainRegistry,
    config::AppConfig,
    escrow_ledger::EscrowLedger,
    ingestion::{IngestionConfig, IngestionLoop},
    models::Currency,
    payout_pool::{PayoutPool, PayoutPoolConfig, WithdrawalGate},
    pending_log::PendingLog,
    settlement::Settler,
    store::LedgerStore,
    wallet_store::WalletStore,
    withdrawal::{WithdrawalPolicy, WithdrawalService},
    EscrowResult,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

/// Configuration for the escrow node
#[derive(Debug, Clone)]
pub struct EscrowNodeConfig {
    pub ingestion: IngestionConfig,
    pub pool: PayoutPoolConfig,
    pub payout_watch_interval: Duration,
    pub pending_log_path: PathBuf,
    /// Currencies without a policy reject withdrawals
    pub policies: HashMap<Currency, WithdrawalPolicy>,
}

impl Default for EscrowNodeConfig {
    fn default() -> Self {
        Self {
            ingestion: IngestionConfig::default(),
            pool: PayoutPoolConfig::default(),
            payout_watch_interval: Duration::from_secs(3600), // 1 hour
            pending_log_path: PathBuf::from("pending_payments.json"),
            policies: HashMap::new(),
        }
    }
}

impl EscrowNodeConfig {
    pub fn from_app(config: &AppConfig) -> EscrowResult<Self> {
        let mut policies = HashMap::new();
        for currency in Currency::ALL {
            policies.insert(currency, WithdrawalPolicy::from(config.terms(currency)?));
        }

        Ok(Self {
            ingestion: IngestionConfig {
                interval: config.wallet_sync_interval(),
                max_decode_failures: config.ingestion.max_decode_failures,
            },
            pool: PayoutPoolConfig {
                flush_interval: config.pool_flush_interval(),
                max_outputs: config.intervals.max_outputs_per_batch,
            },
            payout_watch_interval: config.payout_watch_interval(),
            pending_log_path: config.payouts.pending_log_path.clone(),
            policies,
        })
    }
}

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    store: Arc<dyn LedgerStore>,
    chains: ChainRegistry,
    wallets: Arc<WalletStore>,
    escrow: Arc<EscrowLedger>,
    ingestion: Arc<IngestionLoop>,
    pool: Arc<PayoutPool>,
    gate: Arc<WithdrawalGate>,
    withdrawals: Arc<WithdrawalService>,
    settler: Arc<Settler>,
    payout_watch_interval: Duration,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EscrowNode {
    pub fn new(store: Arc<dyn LedgerStore>, chains: ChainRegistry, config: EscrowNodeConfig) -> Self {
        info!(
            "Initializing escrow node for {:?}",
            chains.currencies().iter().map(|c| c.code()).collect::<Vec<_>>()
        );

        let log = Arc::new(PendingLog::new(config.pending_log_path));
        let gate = Arc::new(WithdrawalGate::new());
        let wallets = Arc::new(WalletStore::new(store.clone(), chains.clone()));
        let escrow = Arc::new(EscrowLedger::new(store.clone(), wallets.clone()));
        let ingestion = Arc::new(IngestionLoop::new(
            store.clone(),
            chains.clone(),
            config.ingestion,
        ));
        let pool = Arc::new(PayoutPool::new(log.clone(), config.pool));
        let withdrawals = Arc::new(WithdrawalService::new(
            store.clone(),
            wallets.clone(),
            pool.clone(),
            gate.clone(),
            config.policies,
        ));
        let settler = Arc::new(Settler::new(log, chains.clone(), gate.clone()));
        let (shutdown, _) = watch::channel(false);

        Self {
            store,
            chains,
            wallets,
            escrow,
            ingestion,
            pool,
            gate,
            withdrawals,
            settler,
            payout_watch_interval: config.payout_watch_interval,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the node from application configuration and live chain adapters
    pub fn from_config(store: Arc<dyn LedgerStore>, config: &AppConfig) -> EscrowResult<Self> {
        let chains = ChainRegistry::from_config(config)?;
        Ok(Self::new(store, chains, EscrowNodeConfig::from_app(config)?))
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    pub fn wallets(&self) -> &Arc<WalletStore> {
        &self.wallets
    }

    pub fn escrow(&self) -> &Arc<EscrowLedger> {
        &self.escrow
    }

    pub fn ingestion(&self) -> &Arc<IngestionLoop> {
        &self.ingestion
    }

    pub fn pool(&self) -> &Arc<PayoutPool> {
        &self.pool
    }

    pub fn gate(&self) -> &Arc<WithdrawalGate> {
        &self.gate
    }

    pub fn withdrawals(&self) -> &Arc<WithdrawalService> {
        &self.withdrawals
    }

    pub fn settler(&self) -> &Arc<Settler> {
        &self.settler
    }

    /// Spawn the ingestion, flusher and payout-watch loops
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Escrow node already started");
            return;
        }

        tasks.push(self.ingestion.clone().spawn(self.shutdown.subscribe()));
        tasks.push(self.pool.clone().spawn_flusher(self.shutdown.subscribe()));
        tasks.push(
            self.settler
                .clone()
                .spawn_watch(self.payout_watch_interval, self.shutdown.subscribe()),
        );
        info!("Escrow node started {} background loops", tasks.len());
    }

    /// Health check for the escrow node
    pub async fn health_check(&self) -> EscrowResult<NodeHealth> {
        let mut issues = Vec::new();

        if let Err(e) = self.store.list_wallets().await {
            issues.push(format!("Ledger store error: {}", e));
        }

        for currency in self.chains.currencies() {
            let chain = self.chains.get(currency)?;
            if let Err(e) = chain.balance().await {
                issues.push(format!("{} chain client error: {}", currency, e));
            }
        }

        match self.pool.log().load().await {
            Ok(records) => {
                for record in records.iter().filter(|r| r.in_doubt) {
                    issues.push(format!(
                        "{} payout record {} in doubt (txid {})",
                        record.currency,
                        record.id,
                        record.txid.as_deref().unwrap_or("unknown")
                    ));
                }
            }
            Err(e) => issues.push(format!("Pending payment log error: {}", e)),
        }

        for txid in self.ingestion.quarantined().await {
            issues.push(format!("Transaction {} quarantined", txid));
        }

        if self.gate.is_blocked().await {
            issues.push("Withdrawals blocked pending payout confirmation".to_string());
        }

        Ok(NodeHealth {
            healthy: issues.is_empty(),
            issues,
            timestamp: Utc::now(),
        })
    }

    /// Stop the loops; the flusher writes whatever is still queued
    pub async fn shutdown(&self) -> EscrowResult<()> {
        info!("Shutting down escrow node");
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background loop ended abnormally: {}", e);
            }
        }

        info!("Escrow node shutdown complete");
        Ok(())
    }
}

/// Node health status
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
