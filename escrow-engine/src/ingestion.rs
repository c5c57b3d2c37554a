//! Transaction ingestion loop
//!
//! Polls every wallet's address history and credits confirmed inbound
//! payments exactly once. The dedup row keyed by txid is the only gate,
//! so overlapping cycles are harmless. Failures are logged per wallet and
//! per transaction and never leave the loop; a transaction that keeps
//! failing to decode is quarantined after a bounded number of attempts.

use crate::{
    chain::{ChainRegistry, IncomingCheck},
    error::EscrowError,
    models::Wallet,
    store::{InboundCredit, LedgerStore},
    EscrowResult,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

/// Configuration for the ingestion loop
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub interval: Duration,
    /// Consecutive decode failures before a txid is quarantined
    pub max_decode_failures: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_decode_failures: 5,
        }
    }
}

#[derive(Default)]
struct FailureTracker {
    counts: HashMap<String, u32>,
    quarantined: HashSet<String>,
}

/// Outcome of one pass over all wallets
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub wallets_scanned: usize,
    pub wallets_failed: usize,
    pub credited: usize,
    pub unconfirmed: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct WalletSync {
    credited: usize,
    unconfirmed: usize,
    skipped: usize,
}

pub struct IngestionLoop {
    store: Arc<dyn LedgerStore>,
    chains: ChainRegistry,
    config: IngestionConfig,
    failures: Mutex<FailureTracker>,
}

impl IngestionLoop {
    pub fn new(store: Arc<dyn LedgerStore>, chains: ChainRegistry, config: IngestionConfig) -> Self {
        Self {
            store,
            chains,
            config,
            failures: Mutex::new(FailureTracker::default()),
        }
    }

    /// Scan every wallet once
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let wallets = match self.store.list_wallets().await {
            Ok(wallets) => wallets,
            Err(e) => {
                error!("Ingestion cycle could not list wallets: {}", e);
                return report;
            }
        };

        for wallet in wallets {
            report.wallets_scanned += 1;
            match self.sync_wallet(&wallet).await {
                Ok(sync) => {
                    report.credited += sync.credited;
                    report.unconfirmed += sync.unconfirmed;
                    report.skipped += sync.skipped;
                }
                Err(e) => {
                    report.wallets_failed += 1;
                    warn!(
                        "Skipping {} wallet {} this cycle: {}",
                        wallet.currency, wallet.id, e
                    );
                }
            }
        }

        debug!("Ingestion cycle finished: {:?}", report);
        report
    }

    async fn sync_wallet(&self, wallet: &Wallet) -> EscrowResult<WalletSync> {
        let chain = self.chains.get(wallet.currency)?;
        let txids = chain.list_transaction_ids(&wallet.address).await?;

        let mut sync = WalletSync::default();
        let mut credits = Vec::new();
        for txid in txids {
            if self.is_quarantined(&txid).await || self.store.is_ingested(&txid).await? {
                continue;
            }

            match chain.check_incoming(&wallet.address, &txid).await {
                Ok(IncomingCheck::Unconfirmed) => sync.unconfirmed += 1,
                Ok(IncomingCheck::Confirmed(amount)) => {
                    self.clear_failures(&txid).await;
                    credits.push(InboundCredit { txid, amount });
                }
                Err(e @ EscrowError::Decode(_)) => {
                    sync.skipped += 1;
                    self.record_decode_failure(&txid, &e).await;
                }
                Err(e) => {
                    sync.skipped += 1;
                    warn!("Failed to check tx {} for wallet {}: {}", txid, wallet.id, e);
                }
            }
        }

        if !credits.is_empty() {
            let applied = self.store.ingest_credits(wallet.id, &credits).await?;
            for credit in &applied {
                info!(
                    "Credited {} {} to wallet {} from tx {}",
                    credit.amount,
                    credit.amount.currency(),
                    wallet.id,
                    credit.txid
                );
            }
            sync.credited = applied.len();
        }
        Ok(sync)
    }

    async fn is_quarantined(&self, txid: &str) -> bool {
        self.failures.lock().await.quarantined.contains(txid)
    }

    async fn clear_failures(&self, txid: &str) {
        self.failures.lock().await.counts.remove(txid);
    }

    async fn record_decode_failure(&self, txid: &str, err: &EscrowError) {
        let mut failures = self.failures.lock().await;
        let count = {
            let count = failures.counts.entry(txid.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if count >= self.config.max_decode_failures {
            failures.counts.remove(txid);
            failures.quarantined.insert(txid.to_string());
            error!(
                "Quarantined tx {} after {} decode failures, operator attention needed: {}",
                txid, count, err
            );
        } else {
            warn!("Decode failure {} for tx {}: {}", count, txid, err);
        }
    }

    /// Txids no longer fetched until restart
    pub async fn quarantined(&self) -> Vec<String> {
        let mut txids: Vec<String> = self
            .failures
            .lock()
            .await
            .quarantined
            .iter()
            .cloned()
            .collect();
        txids.sort();
        txids
    }

    /// Run cycles on the configured interval until `shutdown` flips
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                "Starting ingestion loop (interval {}s)",
                self.config.interval.as_secs()
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_cycle().await;
                        if report.credited > 0 {
                            info!("Ingestion credited {} transactions", report.credited);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Ingestion loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
