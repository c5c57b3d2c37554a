//! Settlement of queued payouts
//!
//! Drains the pending-payment log into on-chain batch transactions and
//! watches the last broadcast per currency. While a payout is unconfirmed,
//! its status cannot be read, or a broadcast outcome is unknown, new
//! withdrawals are held at the gate.

use crate::{
    chain::ChainRegistry,
    error::EscrowError,
    models::{Currency, PayoutOutput},
    payout_pool::WithdrawalGate,
    pending_log::{PaymentStatus, PendingLog},
    EscrowResult,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, warn};

/// What a settlement attempt did for one currency
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SettlementOutcome {
    /// Nothing pending
    Idle,
    /// Dry run: these outputs would be paid
    Planned { outputs: Vec<PayoutOutput>, total: Decimal },
    Broadcast {
        txid: String,
        records: usize,
        total: Decimal,
    },
    /// Broadcast failed; records were returned to `pending`
    Reverted { records: usize, error: String },
    /// The node rejected the outputs themselves; records parked as `failed`
    Failed { records: usize, error: String },
    /// The broadcast may have gone out; records stay `processing` until the
    /// watch sees the txid confirm or an operator requeues them
    InDoubt {
        records: usize,
        txid: Option<String>,
        error: String,
    },
}

/// Result of one payout-watch pass for one currency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchStatus {
    NothingInFlight,
    Unconfirmed { txid: String },
    Confirmed { txid: String, records: usize },
    Unavailable { txid: String, error: String },
    /// Records whose broadcast outcome is still unknown
    InDoubt { records: usize },
}

pub struct Settler {
    log: Arc<PendingLog>,
    chains: ChainRegistry,
    gate: Arc<WithdrawalGate>,
}

impl Settler {
    pub fn new(log: Arc<PendingLog>, chains: ChainRegistry, gate: Arc<WithdrawalGate>) -> Self {
        Self { log, chains, gate }
    }

    /// Broadcast every pending record of `currency` as one transaction
    pub async fn settle(&self, currency: Currency, dry_run: bool) -> EscrowResult<SettlementOutcome> {
        if dry_run {
            let mut outputs: Vec<PayoutOutput> = self
                .log
                .load()
                .await?
                .into_iter()
                .filter(|r| r.currency == currency && r.status == PaymentStatus::Pending)
                .flat_map(|r| r.outputs)
                .collect();
            if outputs.is_empty() {
                return Ok(SettlementOutcome::Idle);
            }
            outputs.sort_by(|a, b| a.address.cmp(&b.address));
            let total = outputs.iter().map(|o| o.amount).sum();
            return Ok(SettlementOutcome::Planned { outputs, total });
        }

        let chain = self.chains.get(currency)?;
        let claim = match self.log.claim_pending(currency).await? {
            Some(claim) => claim,
            None => return Ok(SettlementOutcome::Idle),
        };
        info!(
            "Settling {} {} across {} outputs from {} records",
            claim.total(),
            currency,
            claim.outputs.len(),
            claim.record_ids.len()
        );

        match chain.pay_to_many(&claim.outputs).await {
            Ok(txid) => {
                self.log.mark_broadcast(&claim.record_ids, &txid).await?;
                info!("Broadcast {} payout {}", currency, txid);
                Ok(SettlementOutcome::Broadcast {
                    txid,
                    records: claim.record_ids.len(),
                    total: claim.total(),
                })
            }
            Err(e @ EscrowError::Validation(_)) => {
                let message = e.to_string();
                error!("{} payout rejected, records marked failed: {}", currency, message);
                self.log.mark_failed(&claim.record_ids, &message).await?;
                Ok(SettlementOutcome::Failed {
                    records: claim.record_ids.len(),
                    error: message,
                })
            }
            Err(EscrowError::BroadcastUnknown { txid, message }) => {
                error!(
                    "{} payout outcome unknown (txid {}), records held for reconciliation: {}",
                    currency,
                    txid.as_deref().unwrap_or("unknown"),
                    message
                );
                self.log
                    .mark_in_doubt(&claim.record_ids, txid.as_deref(), &message)
                    .await?;
                Ok(SettlementOutcome::InDoubt {
                    records: claim.record_ids.len(),
                    txid,
                    error: message,
                })
            }
            Err(e) => {
                let message = e.to_string();
                error!("{} payout failed, records returned to queue: {}", currency, message);
                self.log.revert_pending(&claim.record_ids, &message).await?;
                Ok(SettlementOutcome::Reverted {
                    records: claim.record_ids.len(),
                    error: message,
                })
            }
        }
    }

    /// Settle every configured currency
    pub async fn settle_all(&self, dry_run: bool) -> Vec<(Currency, EscrowResult<SettlementOutcome>)> {
        let mut results = Vec::new();
        for currency in self.chains.currencies() {
            results.push((currency, self.settle(currency, dry_run).await));
        }
        results
    }

    /// Check the latest broadcast per currency and set the withdrawal gate
    pub async fn watch_payouts(&self) -> EscrowResult<Vec<(Currency, WatchStatus)>> {
        let mut statuses = Vec::new();
        let mut block = false;

        for currency in self.chains.currencies() {
            if let Some(status) = self.reconcile_in_doubt(currency).await? {
                block = true;
                statuses.push((currency, status));
            }

            let txid = match self.log.latest_broadcast(currency).await? {
                Some(txid) => txid,
                None => {
                    statuses.push((currency, WatchStatus::NothingInFlight));
                    continue;
                }
            };

            let status = match self.chains.get(currency)?.confirmations(&txid).await {
                Ok(0) => {
                    block = true;
                    WatchStatus::Unconfirmed { txid }
                }
                Ok(confirmations) => {
                    let records = self.log.mark_confirmed(&txid).await?;
                    info!(
                        "{} payout {} confirmed ({} confirmations)",
                        currency, txid, confirmations
                    );
                    WatchStatus::Confirmed { txid, records }
                }
                Err(e) => {
                    block = true;
                    warn!("Could not check {} payout {}: {}", currency, txid, e);
                    WatchStatus::Unavailable {
                        txid,
                        error: e.to_string(),
                    }
                }
            };
            statuses.push((currency, status));
        }

        let in_flight = statuses
            .iter()
            .any(|(_, s)| *s != WatchStatus::NothingInFlight);
        if in_flight {
            self.gate.set_blocked(block).await;
        }
        Ok(statuses)
    }

    /// Confirm in-doubt records whose txid the chain now shows as mined;
    /// returns the status for whatever remains in doubt
    async fn reconcile_in_doubt(&self, currency: Currency) -> EscrowResult<Option<WatchStatus>> {
        let records = self.log.in_doubt(currency).await?;
        if records.is_empty() {
            return Ok(None);
        }

        let chain = self.chains.get(currency)?;
        let mut txids: Vec<String> = records.iter().filter_map(|r| r.txid.clone()).collect();
        txids.sort();
        txids.dedup();

        let mut remaining = records.len();
        for txid in txids {
            match chain.confirmations(&txid).await {
                Ok(confirmations) if confirmations > 0 => {
                    let resolved = self.log.resolve_in_doubt(&txid).await?;
                    remaining = remaining.saturating_sub(resolved);
                    info!(
                        "In-doubt {} payout {} found on chain, {} records confirmed",
                        currency, txid, resolved
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Could not check in-doubt {} payout {}: {}", currency, txid, e),
            }
        }

        if remaining == 0 {
            return Ok(None);
        }
        warn!(
            "{} {} payout records still in doubt, withdrawals held",
            remaining, currency
        );
        Ok(Some(WatchStatus::InDoubt { records: remaining }))
    }

    pub fn spawn_watch(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Starting payout watch (interval {}s)", interval.as_secs());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.watch_payouts().await {
                            error!("Payout watch failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Payout watch stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
