//! Payout batching pool
//!
//! Outgoing payments accumulate in memory per `(currency, address)` and are
//! flushed as one [`PendingPayment`] per currency. The flush is
//! write-ahead: the durable log is appended first and the in-memory
//! entries are cleared only after that write succeeded, all while holding
//! the pool lock so no concurrent add can slip between snapshot and clear.

use crate::{
    error::EscrowError,
    ledger::Amount,
    models::{Currency, PayoutOutput},
    pending_log::{PendingLog, PendingPayment},
    EscrowResult,
};
use rust_decimal::Decimal;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex, Notify, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{error, info, warn};

/// Configuration for the payout pool
#[derive(Debug, Clone)]
pub struct PayoutPoolConfig {
    pub flush_interval: Duration,
    /// Distinct outputs that trigger an immediate flush
    pub max_outputs: usize,
}

impl Default for PayoutPoolConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(15),
            max_outputs: 100,
        }
    }
}

pub struct PayoutPool {
    entries: Mutex<BTreeMap<(Currency, String), Decimal>>,
    log: Arc<PendingLog>,
    config: PayoutPoolConfig,
    full: Notify,
}

impl PayoutPool {
    pub fn new(log: Arc<PendingLog>, config: PayoutPoolConfig) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            log,
            config,
            full: Notify::new(),
        }
    }

    pub fn log(&self) -> &Arc<PendingLog> {
        &self.log
    }

    /// Queue `amount` to `address`, summing with anything already queued
    pub async fn add(&self, address: &str, amount: &Amount) -> EscrowResult<()> {
        if address.is_empty() {
            return Err(EscrowError::validation("payout address is empty"));
        }
        if amount.is_zero() {
            return Ok(());
        }

        let len = {
            let mut entries = self.entries.lock().await;
            *entries
                .entry((amount.currency(), address.to_string()))
                .or_default() += amount.value();
            entries.len()
        };
        info!("Queued {} {} to {}", amount, amount.currency(), address);

        if len >= self.config.max_outputs {
            self.full.notify_one();
        }
        Ok(())
    }

    /// Currently queued outputs, sorted by currency then address
    pub async fn snapshot(&self) -> Vec<(Currency, PayoutOutput)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|((currency, address), amount)| {
                (
                    *currency,
                    PayoutOutput {
                        address: address.clone(),
                        amount: *amount,
                    },
                )
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Persist everything queued and clear it; returns records written
    pub async fn flush(&self) -> EscrowResult<usize> {
        let mut entries = self.entries.lock().await;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut by_currency: BTreeMap<Currency, Vec<PayoutOutput>> = BTreeMap::new();
        for ((currency, address), amount) in entries.iter() {
            by_currency.entry(*currency).or_default().push(PayoutOutput {
                address: address.clone(),
                amount: *amount,
            });
        }

        let mut written = 0;
        for (currency, outputs) in by_currency {
            let count = outputs.len();
            self.log.append(PendingPayment::new(currency, outputs)).await?;
            entries.retain(|(c, _), _| *c != currency);
            written += 1;
            info!("Flushed {} {} payout outputs to pending log", count, currency);
        }
        Ok(written)
    }

    /// Flush on the configured interval, or as soon as the pool is full
    pub fn spawn_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                "Starting payout flusher (interval {}s, early flush at {} outputs)",
                self.config.flush_interval.as_secs(),
                self.config.max_outputs
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.full.notified() => {
                        info!("Payout pool full, flushing early");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if let Err(e) = self.flush().await {
                    error!("Payout flush failed, entries kept in memory: {}", e);
                }
            }

            if let Err(e) = self.flush().await {
                error!("Final payout flush failed: {}", e);
            }
            info!("Payout flusher stopped");
        })
    }
}

/// Operator switch that suspends new withdrawal requests
#[derive(Default)]
pub struct WithdrawalGate {
    blocked: RwLock<bool>,
}

impl WithdrawalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_blocked(&self) -> bool {
        *self.blocked.read().await
    }

    pub async fn set_blocked(&self, blocked: bool) {
        let mut current = self.blocked.write().await;
        if *current != blocked {
            if blocked {
                warn!("Withdrawals blocked");
            } else {
                info!("Withdrawals unblocked");
            }
        }
        *current = blocked;
    }

    pub async fn ensure_open(&self) -> EscrowResult<()> {
        if self.is_blocked().await {
            return Err(EscrowError::WithdrawalsBlocked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn pool_in(dir: &tempfile::TempDir, max_outputs: usize) -> PayoutPool {
        PayoutPool::new(
            Arc::new(PendingLog::new(dir.path().join("pending.json"))),
            PayoutPoolConfig {
                flush_interval: Duration::from_secs(3600),
                max_outputs,
            },
        )
    }

    fn btc(s: &str) -> Amount {
        Amount::parse(s, Currency::Btc).unwrap()
    }

    #[tokio::test]
    async fn test_add_sums_same_address() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir, 100);
        pool.add("addr1", &btc("0.001")).await.unwrap();
        pool.add("addr1", &btc("0.002")).await.unwrap();
        pool.flush().await.unwrap();

        let records = pool.log().load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].outputs,
            vec![PayoutOutput {
                address: "addr1".to_string(),
                amount: dec!(0.003)
            }]
        );
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_flush_splits_by_currency() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir, 100);
        pool.add("addr1", &btc("0.5")).await.unwrap();
        pool.add("xmr1", &Amount::parse("1.5", Currency::Xmr).unwrap())
            .await
            .unwrap();

        assert_eq!(pool.flush().await.unwrap(), 2);
        let records = pool.log().load().await.unwrap();
        assert_eq!(records[0].currency, Currency::Btc);
        assert_eq!(records[1].currency, Currency::Xmr);
        assert_eq!(pool.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_amount_is_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir, 100);
        pool.add("addr1", &Amount::zero(Currency::Btc)).await.unwrap();
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PayoutPool::new(
            Arc::new(PendingLog::new(dir.path().join("missing").join("pending.json"))),
            PayoutPoolConfig::default(),
        );
        pool.add("addr1", &btc("0.25")).await.unwrap();

        assert_eq!(pool.flush().await.unwrap_err().kind(), "persistence_failure");
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_full_pool_triggers_early_flush() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(pool_in(&dir, 2));
        let (tx, rx) = watch::channel(false);
        let handle = pool.clone().spawn_flusher(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.add("addr1", &btc("0.1")).await.unwrap();
        pool.add("addr2", &btc("0.2")).await.unwrap();

        let mut flushed = false;
        for _ in 0..50 {
            if pool.is_empty().await {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(flushed);
        assert_eq!(pool.log().load().await.unwrap().len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_gate_toggles() {
        let gate = WithdrawalGate::new();
        assert!(gate.ensure_open().await.is_ok());
        gate.set_blocked(true).await;
        assert!(matches!(
            gate.ensure_open().await,
            Err(EscrowError::WithdrawalsBlocked)
        ));
        gate.set_blocked(false).await;
        assert!(!gate.is_blocked().await);
    }

    proptest! {
        #[test]
        fn prop_flush_preserves_per_address_totals(
            adds in proptest::collection::vec((0usize..4, 1u64..1_000_000), 1..40)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let pool = pool_in(&dir, 1_000);
                let mut expected: BTreeMap<String, Decimal> = BTreeMap::new();
                for (slot, sats) in &adds {
                    let address = format!("addr{}", slot);
                    let amount = Amount::from_atomic(*sats, Currency::Btc);
                    *expected.entry(address.clone()).or_default() += amount.value();
                    pool.add(&address, &amount).await.unwrap();
                }
                pool.flush().await.unwrap();

                let records = pool.log().load().await.unwrap();
                assert_eq!(records.len(), 1);
                let flushed: BTreeMap<String, Decimal> = records[0]
                    .outputs
                    .iter()
                    .map(|o| (o.address.clone(), o.amount))
                    .collect();
                assert_eq!(flushed, expected);
            });
        }
    }
}
