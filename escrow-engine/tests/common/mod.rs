#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use escrow_engine::{
    chain::{ChainAdapter, ChainBalance, ChainRegistry, IncomingCheck},
    error::EscrowError,
    ingestion::IngestionConfig,
    ledger::{Amount, Ledger},
    models::{Currency, PayoutOutput, Wallet},
    node::{EscrowNode, EscrowNodeConfig},
    payout_pool::PayoutPoolConfig,
    store::{LedgerStore, MemoryLedgerStore},
    withdrawal::WithdrawalPolicy,
    EscrowResult,
};
use rust_decimal::Decimal;

pub const BTC_OPERATOR: &str = "mock_operator_btc";
pub const XMR_OPERATOR: &str = "mock_operator_xmr";
pub const MAX_DECODE_FAILURES: u32 = 3;
/// Passes address validation but is refused by `pay_to_many`
pub const REJECTED_ADDRESS: &str = "mock_rejected";

/// How the mock answers `check_incoming` for one txid
#[derive(Debug, Clone)]
pub enum Scripted {
    Confirmed(Decimal),
    Unconfirmed,
    Malformed,
}

#[derive(Default)]
struct MockState {
    created: usize,
    history: HashMap<String, Vec<String>>,
    incoming: HashMap<String, Scripted>,
    fetches: HashMap<String, usize>,
    failing_addresses: HashSet<String>,
    fail_payouts: bool,
    lose_broadcast_answer: Option<Option<String>>,
    payouts: Vec<Vec<PayoutOutput>>,
    confirmations: HashMap<String, Option<u64>>,
}

/// Scripted chain node. Addresses are `mock_<coin>_<n>`, numbered from 1.
pub struct MockChain {
    currency: Currency,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(currency: Currency) -> Self {
        Self {
            currency,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Address the next `create_address` call will return
    pub fn next_address(&self) -> String {
        let created = self.state.lock().unwrap().created;
        self.address_for(created + 1)
    }

    fn address_for(&self, n: usize) -> String {
        format!("mock_{}_{}", self.currency.code().to_lowercase(), n)
    }

    pub fn created_addresses(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn add_history(&self, address: &str, txid: &str) {
        self.state
            .lock()
            .unwrap()
            .history
            .entry(address.to_string())
            .or_default()
            .push(txid.to_string());
    }

    pub fn script(&self, txid: &str, answer: Scripted) {
        self.state
            .lock()
            .unwrap()
            .incoming
            .insert(txid.to_string(), answer);
    }

    /// Times `check_incoming` was asked about `txid`
    pub fn fetches(&self, txid: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .fetches
            .get(txid)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_address(&self, address: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_addresses
            .insert(address.to_string());
    }

    pub fn fail_payouts(&self, fail: bool) {
        self.state.lock().unwrap().fail_payouts = fail;
    }

    /// Next payouts report an unknown outcome, carrying `txid` when set
    pub fn lose_broadcast_answer(&self, txid: Option<&str>) {
        self.state.lock().unwrap().lose_broadcast_answer = Some(txid.map(str::to_string));
    }

    pub fn answer_broadcasts(&self) {
        self.state.lock().unwrap().lose_broadcast_answer = None;
    }

    pub fn payouts(&self) -> Vec<Vec<PayoutOutput>> {
        self.state.lock().unwrap().payouts.clone()
    }

    /// `None` makes the confirmation lookup fail
    pub fn set_confirmations(&self, txid: &str, confirmations: Option<u64>) {
        self.state
            .lock()
            .unwrap()
            .confirmations
            .insert(txid.to_string(), confirmations);
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    fn currency(&self) -> Currency {
        self.currency
    }

    fn validate_address(&self, address: &str) -> bool {
        address.starts_with("mock_")
    }

    async fn create_address(&self, _label: &str) -> EscrowResult<String> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut state = self.state.lock().unwrap();
        state.created += 1;
        Ok(self.address_for(state.created))
    }

    async fn list_transaction_ids(&self, address: &str) -> EscrowResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.failing_addresses.contains(address) {
            return Err(EscrowError::chain_unavailable("connection refused"));
        }
        Ok(state.history.get(address).cloned().unwrap_or_default())
    }

    async fn check_incoming(&self, _address: &str, txid: &str) -> EscrowResult<IncomingCheck> {
        let answer = {
            let mut state = self.state.lock().unwrap();
            *state.fetches.entry(txid.to_string()).or_insert(0) += 1;
            state.incoming.get(txid).cloned()
        };
        match answer {
            Some(Scripted::Confirmed(value)) => {
                Ok(IncomingCheck::Confirmed(Amount::new(value, self.currency)?))
            }
            Some(Scripted::Unconfirmed) => Ok(IncomingCheck::Unconfirmed),
            Some(Scripted::Malformed) => Err(EscrowError::decode("truncated transaction")),
            None => Ok(IncomingCheck::Confirmed(Amount::zero(self.currency))),
        }
    }

    async fn pay_to_many(&self, outputs: &[PayoutOutput]) -> EscrowResult<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_payouts {
            return Err(EscrowError::ChainRpc {
                code: -4,
                message: "insufficient funds".to_string(),
            });
        }
        if let Some(txid) = state.lose_broadcast_answer.clone() {
            return Err(EscrowError::broadcast_unknown(txid, "operation timed out"));
        }
        if let Some(rejected) = outputs.iter().find(|o| o.address == REJECTED_ADDRESS) {
            return Err(EscrowError::validation(format!(
                "node rejected output to {}",
                rejected.address
            )));
        }
        state.payouts.push(outputs.to_vec());
        Ok(format!("payout_{}", state.payouts.len()))
    }

    async fn confirmations(&self, txid: &str) -> EscrowResult<u64> {
        match self.state.lock().unwrap().confirmations.get(txid) {
            Some(Some(confirmations)) => Ok(*confirmations),
            Some(None) => Err(EscrowError::chain_unavailable("timeout")),
            None => Ok(0),
        }
    }

    async fn balance(&self) -> EscrowResult<ChainBalance> {
        Ok(ChainBalance {
            currency: self.currency,
            confirmed: Decimal::ZERO,
            unconfirmed: Decimal::ZERO,
        })
    }
}

/// A node over an in-memory store and two scripted chains
pub struct Harness {
    pub store: Arc<MemoryLedgerStore>,
    pub btc: Arc<MockChain>,
    pub xmr: Arc<MockChain>,
    pub node: EscrowNode,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryLedgerStore::new());
        let btc = Arc::new(MockChain::new(Currency::Btc));
        let xmr = Arc::new(MockChain::new(Currency::Xmr));
        let chains = ChainRegistry::new()
            .with(btc.clone() as Arc<dyn ChainAdapter>)
            .with(xmr.clone() as Arc<dyn ChainAdapter>);

        let mut policies = HashMap::new();
        policies.insert(
            Currency::Btc,
            WithdrawalPolicy {
                min_amount: amount("0.001", Currency::Btc),
                commission_percent: Decimal::from(25),
                operator_address: BTC_OPERATOR.to_string(),
            },
        );
        policies.insert(
            Currency::Xmr,
            WithdrawalPolicy {
                min_amount: amount("0.01", Currency::Xmr),
                commission_percent: Decimal::from(5),
                operator_address: XMR_OPERATOR.to_string(),
            },
        );

        let node = EscrowNode::new(
            store.clone() as Arc<dyn LedgerStore>,
            chains,
            EscrowNodeConfig {
                ingestion: IngestionConfig {
                    interval: Duration::from_secs(3600),
                    max_decode_failures: MAX_DECODE_FAILURES,
                },
                pool: PayoutPoolConfig {
                    flush_interval: Duration::from_secs(3600),
                    max_outputs: 100,
                },
                payout_watch_interval: Duration::from_secs(3600),
                pending_log_path: dir.path().join("pending_payments.json"),
                policies,
            },
        );

        Self {
            store,
            btc,
            xmr,
            node,
            _dir: dir,
        }
    }

    /// Create the user's wallet and credit it `balance`
    pub async fn funded_wallet(&self, user_id: i64, currency: Currency, balance: &str) -> Wallet {
        let wallet = self
            .node
            .wallets()
            .get_or_create_wallet(user_id, currency)
            .await
            .unwrap();
        Ledger::new(self.store.clone() as Arc<dyn LedgerStore>)
            .add_balance(&wallet, &amount(balance, currency))
            .await
            .unwrap()
    }

    /// Ledger balance, zero when the user has no wallet yet
    pub async fn balance(&self, user_id: i64, currency: Currency) -> Decimal {
        self.store
            .wallet_for_user(user_id, currency)
            .await
            .unwrap()
            .map_or(Decimal::ZERO, |w| w.balance)
    }
}

pub fn amount(value: &str, currency: Currency) -> Amount {
    Amount::parse(value, currency).unwrap()
}
