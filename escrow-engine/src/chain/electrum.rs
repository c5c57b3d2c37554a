//! Bitcoin adapter backed by an Electrum daemon's JSON-RPC interface

use super::{
    classify_payout_rejection,
    rpc::{JsonRpcClient, RpcAuth},
    ChainAdapter, ChainBalance, IncomingCheck,
};
use crate::{
    config::BitcoinSettings,
    error::EscrowError,
    ledger::Amount,
    models::{Currency, PayoutOutput},
    EscrowResult,
};
use async_trait::async_trait;
use bitcoin::{hex::FromHex, Address, Network, Transaction};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::Deserialize;
use serde_json::json;
use std::{str::FromStr, time::Duration};
use tracing::{info, warn};

/// Fee schedule for `paytomany`, in sat/vB
const MIN_FEE_RATE: Decimal = Decimal::from_parts(15, 0, 0, false, 1); // 1.5
const MAX_FEE_RATE: Decimal = Decimal::from_parts(112, 0, 0, false, 1); // 11.2
const FEE_BUMP_BUILD: Decimal = Decimal::from_parts(24, 0, 0, false, 1); // 2.4
const FEE_BUMP_BROADCAST: Decimal = Decimal::from_parts(12, 0, 0, false, 1); // 1.2
const TX_BASE_VBYTES: u64 = 200;
const TX_OUTPUT_VBYTES: u64 = 34;

/// Configuration for the Electrum adapter
#[derive(Debug, Clone)]
pub struct ElectrumConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub network: Network,
    pub timeout: Duration,
}

impl Default for ElectrumConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:7777".to_string(),
            rpc_user: "Electrum".to_string(),
            rpc_password: "Electrum".to_string(),
            network: Network::Testnet,
            timeout: Duration::from_secs(10),
        }
    }
}

impl TryFrom<&BitcoinSettings> for ElectrumConfig {
    type Error = EscrowError;

    fn try_from(settings: &BitcoinSettings) -> EscrowResult<Self> {
        Ok(Self {
            rpc_url: settings.rpc_url.clone(),
            rpc_user: settings.rpc_user.clone(),
            rpc_password: settings.rpc_password.clone(),
            network: parse_network(&settings.network)?,
            timeout: Duration::from_secs(settings.rpc_timeout_secs),
        })
    }
}

pub fn parse_network(name: &str) -> EscrowResult<Network> {
    match name.trim().to_ascii_lowercase().as_str() {
        "mainnet" | "main" => Ok(Network::Bitcoin),
        other => Network::from_str(other)
            .map_err(|_| EscrowError::config(format!("unknown bitcoin network: {}", name))),
    }
}

pub fn validate_bitcoin_address(address: &str, network: Network) -> bool {
    Address::from_str(address)
        .map(|unchecked| unchecked.is_valid_for_network(network))
        .unwrap_or(false)
}

/// Sum every output of a raw transaction that pays `address`.
///
/// Outputs to other scripts are ignored, so a tx with change back to the
/// sender credits only our share. Returns zero if nothing pays us.
pub fn incoming_amount(raw_hex: &str, address: &str, network: Network) -> EscrowResult<Amount> {
    let tx = decode_transaction(raw_hex)?;

    let ours = Address::from_str(address)
        .map_err(|e| EscrowError::validation(format!("wallet address {}: {}", address, e)))?
        .require_network(network)
        .map_err(|e| EscrowError::validation(format!("wallet address {}: {}", address, e)))?
        .script_pubkey();

    let sats = tx
        .output
        .iter()
        .filter(|out| out.script_pubkey == ours)
        .try_fold(0u64, |acc, out| acc.checked_add(out.value.to_sat()))
        .ok_or_else(|| EscrowError::decode("output values overflow"))?;

    Ok(Amount::from_atomic(sats, Currency::Btc))
}

/// Txid of a signed transaction, computed before it is broadcast
pub fn local_txid(raw_hex: &str) -> EscrowResult<String> {
    Ok(decode_transaction(raw_hex)?.compute_txid().to_string())
}

fn decode_transaction(raw_hex: &str) -> EscrowResult<Transaction> {
    let bytes = Vec::<u8>::from_hex(raw_hex.trim())
        .map_err(|e| EscrowError::decode(format!("raw transaction is not hex: {}", e)))?;
    bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| EscrowError::decode(format!("raw transaction: {}", e)))
}

/// Estimated fee for a payout with `outputs` destinations
fn estimate_fee(rate: Decimal, outputs: usize) -> EscrowResult<Amount> {
    let vbytes = TX_BASE_VBYTES + TX_OUTPUT_VBYTES * outputs as u64;
    let sats = (rate * Decimal::from(vbytes))
        .ceil()
        .to_u64()
        .ok_or_else(|| EscrowError::internal("fee out of range"))?;
    Ok(Amount::from_atomic(sats, Currency::Btc))
}

fn is_fee_error(err: &EscrowError) -> bool {
    matches!(err, EscrowError::ChainRpc { message, .. } if message.to_lowercase().contains("fee"))
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct TxStatus {
    #[serde(default)]
    confirmations: i64,
}

/// `gettransaction` answers with bare hex on older daemons
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTransaction {
    Hex(String),
    Wrapped { hex: String },
}

impl RawTransaction {
    fn into_hex(self) -> String {
        match self {
            Self::Hex(hex) | Self::Wrapped { hex } => hex,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WalletBalance {
    confirmed: String,
    #[serde(default)]
    unconfirmed: Option<String>,
}

pub struct ElectrumAdapter {
    client: JsonRpcClient,
    network: Network,
}

impl ElectrumAdapter {
    pub fn new(config: ElectrumConfig) -> EscrowResult<Self> {
        let client = JsonRpcClient::new(
            config.rpc_url,
            Some(RpcAuth {
                user: config.rpc_user,
                password: config.rpc_password,
            }),
            config.timeout,
        )?;

        Ok(Self {
            client,
            network: config.network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    async fn raw_transaction(&self, txid: &str) -> EscrowResult<String> {
        let raw: RawTransaction = self.client.call("gettransaction", json!([txid])).await?;
        Ok(raw.into_hex())
    }
}

#[async_trait]
impl ChainAdapter for ElectrumAdapter {
    fn currency(&self) -> Currency {
        Currency::Btc
    }

    fn validate_address(&self, address: &str) -> bool {
        validate_bitcoin_address(address, self.network)
    }

    async fn create_address(&self, _label: &str) -> EscrowResult<String> {
        let address: String = self.client.call("createnewaddress", json!([])).await?;
        info!("Electrum created address {}", address);
        Ok(address)
    }

    async fn list_transaction_ids(&self, address: &str) -> EscrowResult<Vec<String>> {
        let history: Vec<HistoryEntry> =
            self.client.call("getaddresshistory", json!([address])).await?;
        Ok(history.into_iter().map(|entry| entry.tx_hash).collect())
    }

    async fn check_incoming(&self, address: &str, txid: &str) -> EscrowResult<IncomingCheck> {
        if self.confirmations(txid).await? == 0 {
            return Ok(IncomingCheck::Unconfirmed);
        }
        let raw = self.raw_transaction(txid).await?;
        Ok(IncomingCheck::Confirmed(incoming_amount(
            &raw,
            address,
            self.network,
        )?))
    }

    async fn pay_to_many(&self, outputs: &[PayoutOutput]) -> EscrowResult<String> {
        if outputs.is_empty() {
            return Err(EscrowError::validation("payout has no outputs"));
        }
        let out_list: Vec<(String, String)> = outputs
            .iter()
            .map(|o| Ok((o.address.clone(), Amount::new(o.amount, Currency::Btc)?.to_string())))
            .collect::<EscrowResult<_>>()?;

        let mut rate = MIN_FEE_RATE;
        loop {
            let fee = estimate_fee(rate, outputs.len())?;
            let built: EscrowResult<String> = self
                .client
                .call(
                    "paytomany",
                    json!({ "outputs": out_list, "rbf": true, "fee": fee.to_string() }),
                )
                .await;

            let raw_tx = match built {
                Ok(raw_tx) => raw_tx,
                Err(e) if is_fee_error(&e) => {
                    rate *= FEE_BUMP_BUILD;
                    if rate > MAX_FEE_RATE {
                        return Err(EscrowError::chain_unavailable(format!(
                            "fee rate exceeded {} sat/vB",
                            MAX_FEE_RATE
                        )));
                    }
                    warn!("paytomany rejected fee {}, retrying at {} sat/vB", fee, rate);
                    continue;
                }
                // paytomany only builds and signs, nothing has left the wallet yet
                Err(e) => return Err(classify_payout_rejection(e, &[])),
            };
            let txid = local_txid(&raw_tx)?;

            match self.client.call::<String>("broadcast", json!([raw_tx])).await {
                Ok(broadcast) => {
                    if broadcast != txid {
                        warn!("Daemon reported txid {} for locally built {}", broadcast, txid);
                    }
                    info!(
                        "Broadcast payout {} with {} outputs, fee {} BTC",
                        broadcast,
                        outputs.len(),
                        fee
                    );
                    return Ok(broadcast);
                }
                Err(e) if is_fee_error(&e) => {
                    rate *= FEE_BUMP_BROADCAST;
                    if rate > MAX_FEE_RATE {
                        return Err(EscrowError::chain_unavailable(format!(
                            "broadcast fee rate exceeded {} sat/vB",
                            MAX_FEE_RATE
                        )));
                    }
                    warn!("Broadcast rejected fee {}, retrying at {} sat/vB", fee, rate);
                }
                // the daemon may have relayed the tx before the answer was lost
                Err(EscrowError::ChainClientUnavailable(message)) => {
                    return Err(EscrowError::broadcast_unknown(Some(txid), message));
                }
                Err(e) => return Err(classify_payout_rejection(e, &[])),
            }
        }
    }

    async fn confirmations(&self, txid: &str) -> EscrowResult<u64> {
        let status: TxStatus = self.client.call("get_tx_status", json!([txid])).await?;
        u64::try_from(status.confirmations)
            .map_err(|_| EscrowError::decode(format!("negative confirmations for {}", txid)))
    }

    async fn balance(&self) -> EscrowResult<ChainBalance> {
        let balance: WalletBalance = self.client.call("getbalance", json!([])).await?;
        let parse = |s: &str| {
            Decimal::from_str(s)
                .map_err(|e| EscrowError::decode(format!("getbalance value {:?}: {}", s, e)))
        };
        Ok(ChainBalance {
            currency: Currency::Btc,
            confirmed: parse(&balance.confirmed)?,
            unconfirmed: balance.unconfirmed.as_deref().map(parse).transpose()?.unwrap_or_default(),
        })
    }
}
