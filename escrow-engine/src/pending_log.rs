//! Durable pending-payment log
//!
//! A JSON array of [`PendingPayment`] records. Every change rewrites the
//! whole file through a uniquely named temp file, `fsync` and rename, so a
//! crash leaves either the old or the new array on disk and never a torn
//! one. Read-modify-write cycles hold an exclusive lock on `<log>.lock`,
//! which serializes the daemon's flusher with `escrowd settle` running in
//! another process.

use crate::{
    error::EscrowError,
    models::{Currency, PayoutOutput},
    EscrowResult,
};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tokio::{fs, sync::Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Queued, not yet picked up by a settler
    Pending,
    /// Claimed by a settler, broadcast in progress
    Processing,
    Broadcast,
    Confirmed,
    Failed,
}

impl PaymentStatus {
    /// Not yet on chain
    pub fn is_unflushed(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPayment {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub currency: Currency,
    pub outputs: Vec<PayoutOutput>,
    #[serde(default)]
    pub fee: Option<Decimal>,
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Left `processing` after a broadcast whose outcome is unknown; never
    /// reclaimed automatically
    #[serde(default, skip_serializing_if = "is_false")]
    pub in_doubt: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl PendingPayment {
    pub fn new(currency: Currency, outputs: Vec<PayoutOutput>) -> Self {
        Self {
            id: Uuid::new_v4(),
            time: Utc::now(),
            currency,
            outputs,
            fee: None,
            status: PaymentStatus::Pending,
            txid: None,
            error: None,
            in_doubt: false,
        }
    }

    pub fn total(&self) -> Decimal {
        self.outputs.iter().map(|o| o.amount).sum()
    }
}

/// Records moved to `processing` and their outputs merged per address
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentClaim {
    pub currency: Currency,
    pub record_ids: Vec<Uuid>,
    pub outputs: Vec<PayoutOutput>,
}

impl PaymentClaim {
    pub fn total(&self) -> Decimal {
        self.outputs.iter().map(|o| o.amount).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub currency: Currency,
    pub status: PaymentStatus,
    pub records: usize,
    pub total: Decimal,
}

/// Held exclusive lock on the log's sidecar file
struct FileLock(File);

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

pub struct PendingLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PendingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> EscrowResult<Vec<PendingPayment>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn append(&self, record: PendingPayment) -> EscrowResult<()> {
        self.update(|records| records.push(record)).await
    }

    /// Move every pending record of `currency` to `processing`
    pub async fn claim_pending(&self, currency: Currency) -> EscrowResult<Option<PaymentClaim>> {
        self.update(|records| {
            let mut record_ids = Vec::new();
            let mut merged: BTreeMap<String, Decimal> = BTreeMap::new();
            for record in records
                .iter_mut()
                .filter(|r| r.currency == currency && r.status == PaymentStatus::Pending)
            {
                record.status = PaymentStatus::Processing;
                record_ids.push(record.id);
                for output in &record.outputs {
                    *merged.entry(output.address.clone()).or_default() += output.amount;
                }
            }

            if record_ids.is_empty() {
                return None;
            }
            Some(PaymentClaim {
                currency,
                record_ids,
                outputs: merged
                    .into_iter()
                    .map(|(address, amount)| PayoutOutput { address, amount })
                    .collect(),
            })
        })
        .await
    }

    pub async fn mark_broadcast(&self, ids: &[Uuid], txid: &str) -> EscrowResult<()> {
        self.update(|records| {
            for record in records.iter_mut().filter(|r| ids.contains(&r.id)) {
                record.status = PaymentStatus::Broadcast;
                record.txid = Some(txid.to_string());
                record.error = None;
            }
        })
        .await
    }

    /// Return claimed records to the queue after a failed broadcast
    pub async fn revert_pending(&self, ids: &[Uuid], error: &str) -> EscrowResult<()> {
        self.update(|records| {
            for record in records
                .iter_mut()
                .filter(|r| {
                    ids.contains(&r.id) && r.status == PaymentStatus::Processing && !r.in_doubt
                })
            {
                record.status = PaymentStatus::Pending;
                record.error = Some(error.to_string());
            }
        })
        .await
    }

    pub async fn mark_failed(&self, ids: &[Uuid], error: &str) -> EscrowResult<()> {
        self.update(|records| {
            for record in records.iter_mut().filter(|r| ids.contains(&r.id)) {
                record.status = PaymentStatus::Failed;
                record.error = Some(error.to_string());
            }
        })
        .await
    }

    /// Keep claimed records in `processing` after a broadcast that may have
    /// gone out, remembering the txid when it is known
    pub async fn mark_in_doubt(&self, ids: &[Uuid], txid: Option<&str>, error: &str) -> EscrowResult<()> {
        self.update(|records| {
            for record in records
                .iter_mut()
                .filter(|r| ids.contains(&r.id) && r.status == PaymentStatus::Processing)
            {
                record.in_doubt = true;
                record.txid = txid.map(str::to_string);
                record.error = Some(error.to_string());
            }
        })
        .await
    }

    /// In-doubt records of `currency`
    pub async fn in_doubt(&self, currency: Currency) -> EscrowResult<Vec<PendingPayment>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|r| r.currency == currency && r.in_doubt)
            .collect())
    }

    /// The chain shows `txid`; confirm the in-doubt records broadcast under it
    pub async fn resolve_in_doubt(&self, txid: &str) -> EscrowResult<usize> {
        self.update(|records| {
            let mut resolved = 0;
            for record in records
                .iter_mut()
                .filter(|r| r.in_doubt && r.txid.as_deref() == Some(txid))
            {
                record.status = PaymentStatus::Confirmed;
                record.in_doubt = false;
                record.error = None;
                resolved += 1;
            }
            resolved
        })
        .await
    }

    /// Operator decision that an in-doubt payout never reached the network:
    /// put the record back in the queue. Returns false if `id` is not in doubt.
    pub async fn requeue(&self, id: Uuid) -> EscrowResult<bool> {
        self.update(|records| {
            match records.iter_mut().find(|r| r.id == id && r.in_doubt) {
                Some(record) => {
                    record.status = PaymentStatus::Pending;
                    record.in_doubt = false;
                    record.txid = None;
                    record.error = Some("requeued by operator".to_string());
                    true
                }
                None => false,
            }
        })
        .await
    }

    /// Mark every record broadcast under `txid` confirmed; returns the count
    pub async fn mark_confirmed(&self, txid: &str) -> EscrowResult<usize> {
        self.update(|records| {
            let mut confirmed = 0;
            for record in records.iter_mut().filter(|r| {
                r.status == PaymentStatus::Broadcast && r.txid.as_deref() == Some(txid)
            }) {
                record.status = PaymentStatus::Confirmed;
                confirmed += 1;
            }
            confirmed
        })
        .await
    }

    /// Most recent txid still awaiting confirmation for `currency`
    pub async fn latest_broadcast(&self, currency: Currency) -> EscrowResult<Option<String>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|r| r.currency == currency && r.status == PaymentStatus::Broadcast)
            .max_by_key(|r| r.time)
            .and_then(|r| r.txid))
    }

    /// Every output whose record has not reached the chain
    pub async fn unflushed_outputs(&self) -> EscrowResult<Vec<(Currency, PayoutOutput)>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|r| r.status.is_unflushed())
            .flat_map(|r| {
                let currency = r.currency;
                r.outputs.into_iter().map(move |o| (currency, o))
            })
            .collect())
    }

    pub async fn summary(&self) -> EscrowResult<Vec<StatusSummary>> {
        let mut rows: BTreeMap<(Currency, PaymentStatus), StatusSummary> = BTreeMap::new();
        for record in self.load().await? {
            let row = rows
                .entry((record.currency, record.status))
                .or_insert_with(|| StatusSummary {
                    currency: record.currency,
                    status: record.status,
                    records: 0,
                    total: Decimal::ZERO,
                });
            row.records += 1;
            row.total += record.total();
        }
        Ok(rows.into_values().collect())
    }

    /// Read-modify-write under the in-process and cross-process locks; the
    /// file is only rewritten when `apply` changed something
    async fn update<T, F>(&self, apply: F) -> EscrowResult<T>
    where
        F: FnOnce(&mut Vec<PendingPayment>) -> T,
    {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_file().await?;
        let mut records = self.read().await?;
        let before = records.clone();
        let out = apply(&mut records);
        if records != before {
            self.write(&records).await?;
        }
        Ok(out)
    }

    async fn read(&self) -> EscrowResult<Vec<PendingPayment>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EscrowError::persistence(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&data).map_err(|e| {
            EscrowError::persistence(format!("corrupt pending log {}: {}", self.path.display(), e))
        })
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("pending_payments.json"));
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    async fn lock_file(&self) -> EscrowResult<FileLock> {
        let lock_path = self.sibling(".lock");
        let display = lock_path.display().to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<FileLock> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(FileLock(file))
        })
        .await
        .map_err(|e| EscrowError::internal(format!("pending log lock task failed: {}", e)))?
        .map_err(|e| EscrowError::persistence(format!("failed to lock {}: {}", display, e)))
    }

    async fn write(&self, records: &[PendingPayment]) -> EscrowResult<()> {
        let data = serde_json::to_vec_pretty(records)?;
        let path = self.path.clone();
        let dir = self.directory();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| EscrowError::internal(format!("pending log write task failed: {}", e)))?
        .map_err(|e| {
            EscrowError::persistence(format!("failed to write {}: {}", self.path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn output(address: &str, amount: Decimal) -> PayoutOutput {
        PayoutOutput {
            address: address.to_string(),
            amount,
        }
    }

    fn temp_log() -> (tempfile::TempDir, PendingLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = PendingLog::new(dir.path().join("pending_payments.json"));
        (dir, log)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_log() {
        let (_dir, log) = temp_log();
        assert!(log.load().await.unwrap().is_empty());
        assert!(log.claim_pending(Currency::Btc).await.unwrap().is_none());
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_append_survives_reopen() {
        let (dir, log) = temp_log();
        log.append(PendingPayment::new(
            Currency::Btc,
            vec![output("addr1", dec!(0.003))],
        ))
        .await
        .unwrap();

        let reopened = PendingLog::new(dir.path().join("pending_payments.json"));
        let records = reopened.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PaymentStatus::Pending);
        assert_eq!(records[0].outputs, vec![output("addr1", dec!(0.003))]);

        let mut leftovers: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        leftovers.sort();
        assert_eq!(
            leftovers,
            vec!["pending_payments.json", "pending_payments.json.lock"]
        );
    }

    #[tokio::test]
    async fn test_claim_merges_outputs_and_is_exclusive() {
        let (_dir, log) = temp_log();
        log.append(PendingPayment::new(
            Currency::Btc,
            vec![output("addr1", dec!(0.001)), output("op", dec!(0.0005))],
        ))
        .await
        .unwrap();
        log.append(PendingPayment::new(
            Currency::Btc,
            vec![output("addr1", dec!(0.002))],
        ))
        .await
        .unwrap();
        log.append(PendingPayment::new(
            Currency::Xmr,
            vec![output("xmr1", dec!(1))],
        ))
        .await
        .unwrap();

        let claim = log.claim_pending(Currency::Btc).await.unwrap().unwrap();
        assert_eq!(claim.record_ids.len(), 2);
        assert_eq!(
            claim.outputs,
            vec![output("addr1", dec!(0.003)), output("op", dec!(0.0005))]
        );
        assert!(log.claim_pending(Currency::Btc).await.unwrap().is_none());

        let xmr = log.claim_pending(Currency::Xmr).await.unwrap().unwrap();
        assert_eq!(xmr.total(), dec!(1));
    }

    #[tokio::test]
    async fn test_revert_and_broadcast_lifecycle() {
        let (_dir, log) = temp_log();
        log.append(PendingPayment::new(
            Currency::Btc,
            vec![output("addr1", dec!(0.01))],
        ))
        .await
        .unwrap();

        let claim = log.claim_pending(Currency::Btc).await.unwrap().unwrap();
        log.revert_pending(&claim.record_ids, "node offline").await.unwrap();
        let records = log.load().await.unwrap();
        assert_eq!(records[0].status, PaymentStatus::Pending);
        assert_eq!(records[0].error.as_deref(), Some("node offline"));
        assert_eq!(log.unflushed_outputs().await.unwrap().len(), 1);

        let claim = log.claim_pending(Currency::Btc).await.unwrap().unwrap();
        log.mark_broadcast(&claim.record_ids, "txid-1").await.unwrap();
        assert_eq!(
            log.latest_broadcast(Currency::Btc).await.unwrap().as_deref(),
            Some("txid-1")
        );
        assert!(log.unflushed_outputs().await.unwrap().is_empty());

        assert_eq!(log.mark_confirmed("txid-1").await.unwrap(), 1);
        assert!(log.latest_broadcast(Currency::Btc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_doubt_records_are_not_reclaimed() {
        let (_dir, log) = temp_log();
        log.append(PendingPayment::new(Currency::Btc, vec![output("addr1", dec!(0.01))]))
            .await
            .unwrap();

        let claim = log.claim_pending(Currency::Btc).await.unwrap().unwrap();
        log.mark_in_doubt(&claim.record_ids, Some("local-txid"), "read timed out")
            .await
            .unwrap();
        assert!(log.claim_pending(Currency::Btc).await.unwrap().is_none());
        // a plain revert must not release it either
        log.revert_pending(&claim.record_ids, "retry").await.unwrap();

        let in_doubt = log.in_doubt(Currency::Btc).await.unwrap();
        assert_eq!(in_doubt.len(), 1);
        assert_eq!(in_doubt[0].status, PaymentStatus::Processing);
        assert_eq!(in_doubt[0].txid.as_deref(), Some("local-txid"));
        assert!(log.in_doubt(Currency::Xmr).await.unwrap().is_empty());

        assert_eq!(log.resolve_in_doubt("other").await.unwrap(), 0);
        assert_eq!(log.resolve_in_doubt("local-txid").await.unwrap(), 1);
        let records = log.load().await.unwrap();
        assert_eq!(records[0].status, PaymentStatus::Confirmed);
        assert!(!records[0].in_doubt);
    }

    #[tokio::test]
    async fn test_requeue_only_touches_in_doubt_records() {
        let (_dir, log) = temp_log();
        let record = PendingPayment::new(Currency::Xmr, vec![output("xmr1", dec!(1))]);
        let id = record.id;
        log.append(record).await.unwrap();
        assert!(!log.requeue(id).await.unwrap());

        let claim = log.claim_pending(Currency::Xmr).await.unwrap().unwrap();
        log.mark_in_doubt(&claim.record_ids, None, "transfer timed out")
            .await
            .unwrap();
        assert!(log.requeue(id).await.unwrap());

        let records = log.load().await.unwrap();
        assert_eq!(records[0].status, PaymentStatus::Pending);
        assert!(records[0].txid.is_none());
        assert!(log.claim_pending(Currency::Xmr).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_handles_on_one_file_lose_no_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_payments.json");
        let daemon = Arc::new(PendingLog::new(path.clone()));
        let settler = Arc::new(PendingLog::new(path.clone()));
        daemon
            .append(PendingPayment::new(Currency::Btc, vec![output("addr0", dec!(0.01))]))
            .await
            .unwrap();

        let appender = {
            let daemon = daemon.clone();
            tokio::spawn(async move {
                for i in 1..=20 {
                    daemon
                        .append(PendingPayment::new(
                            Currency::Btc,
                            vec![output(&format!("addr{}", i), dec!(0.01))],
                        ))
                        .await
                        .unwrap();
                }
            })
        };
        let claimer = {
            let settler = settler.clone();
            tokio::spawn(async move {
                let mut claimed = 0;
                for i in 0..20 {
                    if let Some(claim) = settler.claim_pending(Currency::Btc).await.unwrap() {
                        claimed += claim.record_ids.len();
                        settler
                            .mark_broadcast(&claim.record_ids, &format!("tx{}", i))
                            .await
                            .unwrap();
                    }
                }
                claimed
            })
        };
        appender.await.unwrap();
        let claimed = claimer.await.unwrap();

        let records = PendingLog::new(path).load().await.unwrap();
        assert_eq!(records.len(), 21);
        let broadcast = records
            .iter()
            .filter(|r| r.status == PaymentStatus::Broadcast)
            .count();
        let pending = records
            .iter()
            .filter(|r| r.status == PaymentStatus::Pending)
            .count();
        assert_eq!(broadcast, claimed);
        assert_eq!(broadcast + pending, 21);
        for i in 0..=20 {
            let address = format!("addr{}", i);
            assert!(records.iter().any(|r| r.outputs[0].address == address));
        }
    }

    #[tokio::test]
    async fn test_summary_groups_by_currency_and_status() {
        let (_dir, log) = temp_log();
        for amount in [dec!(0.1), dec!(0.2)] {
            log.append(PendingPayment::new(Currency::Btc, vec![output("a", amount)]))
                .await
                .unwrap();
        }
        let summary = log.summary().await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].records, 2);
        assert_eq!(summary[0].total, dec!(0.3));
    }

    #[tokio::test]
    async fn test_corrupt_log_is_persistence_failure() {
        let (_dir, log) = temp_log();
        std::fs::write(log.path(), b"[{\"id\": ").unwrap();
        assert_eq!(log.load().await.unwrap_err().kind(), "persistence_failure");
        assert!(log
            .append(PendingPayment::new(Currency::Btc, vec![output("a", dec!(1))]))
            .await
            .is_err());
    }
}
