//! Monero adapter backed by `monero-wallet-rpc`
//!
//! Every user wallet is a subaddress of one wallet account. Inbound
//! transfers are looked up by subaddress index, so the address-to-index
//! mapping is resolved through the RPC on each call rather than cached.

use super::{
    classify_payout_rejection,
    rpc::{JsonRpcClient, RpcAuth},
    ChainAdapter, ChainBalance, IncomingCheck,
};
use crate::{
    config::MoneroSettings,
    error::EscrowError,
    ledger::Amount,
    models::{Currency, PayoutOutput},
    EscrowResult,
};
use async_trait::async_trait;
use base58_monero::decode_check;
use serde::Deserialize;
use serde_json::json;
use std::{fmt, str::FromStr, time::Duration};
use tracing::{info, warn};

/// wallet-rpc codes for a destination the wallet refuses outright:
/// WRONG_ADDRESS and ZERO_DESTINATION
const REJECT_CODES: [i64; 2] = [-2, -20];

const STANDARD_ADDRESS_LEN: usize = 95;
const INTEGRATED_ADDRESS_LEN: usize = 106;
const STANDARD_DECODED_LEN: usize = 65;
const INTEGRATED_DECODED_LEN: usize = 73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoneroNetwork {
    Mainnet,
    Stagenet,
    Testnet,
}

impl MoneroNetwork {
    /// Standard, subaddress and integrated network bytes
    fn network_bytes(&self) -> [u8; 3] {
        match self {
            Self::Mainnet => [18, 42, 19],
            Self::Stagenet => [24, 36, 25],
            Self::Testnet => [53, 63, 54],
        }
    }
}

impl fmt::Display for MoneroNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Stagenet => write!(f, "stagenet"),
            Self::Testnet => write!(f, "testnet"),
        }
    }
}

impl FromStr for MoneroNetwork {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "stagenet" | "stage" => Ok(Self::Stagenet),
            "testnet" | "test" => Ok(Self::Testnet),
            other => Err(EscrowError::config(format!("unknown monero network: {}", other))),
        }
    }
}

/// Full checksum validation of a Monero address for `network`
pub fn validate_monero_address(address: &str, network: MoneroNetwork) -> EscrowResult<()> {
    if address.len() != STANDARD_ADDRESS_LEN && address.len() != INTEGRATED_ADDRESS_LEN {
        return Err(EscrowError::validation(format!(
            "invalid address length: {}",
            address.len()
        )));
    }

    let decoded = decode_check(address)
        .map_err(|e| EscrowError::validation(format!("invalid monero address: {:?}", e)))?;
    if decoded.len() != STANDARD_DECODED_LEN && decoded.len() != INTEGRATED_DECODED_LEN {
        return Err(EscrowError::validation(format!(
            "invalid decoded length: {}",
            decoded.len()
        )));
    }

    if !network.network_bytes().contains(&decoded[0]) {
        return Err(EscrowError::validation(format!(
            "address is not a {} address (network byte {:#04x})",
            network, decoded[0]
        )));
    }
    Ok(())
}

/// Configuration for the Monero adapter
#[derive(Debug, Clone)]
pub struct MoneroConfig {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub network: MoneroNetwork,
    pub account_index: u32,
    pub ring_size: u32,
    pub min_confirmations: u64,
    pub timeout: Duration,
}

impl Default for MoneroConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:28088/json_rpc".to_string(),
            rpc_user: None,
            rpc_password: None,
            network: MoneroNetwork::Testnet,
            account_index: 0,
            ring_size: 16,
            min_confirmations: 10,
            timeout: Duration::from_secs(10),
        }
    }
}

impl TryFrom<&MoneroSettings> for MoneroConfig {
    type Error = EscrowError;

    fn try_from(settings: &MoneroSettings) -> EscrowResult<Self> {
        Ok(Self {
            rpc_url: settings.rpc_url.clone(),
            rpc_user: settings.rpc_user.clone(),
            rpc_password: settings.rpc_password.clone(),
            network: settings.network.parse()?,
            account_index: settings.account_index,
            ring_size: settings.ring_size,
            min_confirmations: settings.min_confirmations,
            timeout: Duration::from_secs(settings.rpc_timeout_secs),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SubaddressIndex {
    major: u32,
    minor: u32,
}

#[derive(Debug, Deserialize)]
struct AddressIndexResponse {
    index: SubaddressIndex,
}

#[derive(Debug, Clone, Deserialize)]
struct TransferEntry {
    txid: String,
    amount: u64,
    #[serde(default)]
    confirmations: u64,
    #[serde(rename = "type", default)]
    kind: String,
    subaddr_index: Option<SubaddressIndex>,
}

#[derive(Debug, Deserialize)]
struct TransfersResponse {
    #[serde(rename = "in", default)]
    incoming: Vec<TransferEntry>,
    #[serde(default)]
    pool: Vec<TransferEntry>,
}

#[derive(Debug, Deserialize)]
struct TransferByTxidResponse {
    transfer: TransferEntry,
    #[serde(default)]
    transfers: Vec<TransferEntry>,
}

#[derive(Debug, Deserialize)]
struct CreateAddressResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    tx_hash: String,
    #[serde(default)]
    fee: u64,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: u64,
    unlocked_balance: u64,
}

/// Incoming entries of one tx that pay `minor`, and whether all are mature
fn incoming_for_subaddress(
    entries: &[TransferEntry],
    minor: u32,
    min_confirmations: u64,
) -> EscrowResult<IncomingCheck> {
    let ours: Vec<&TransferEntry> = entries
        .iter()
        .filter(|t| matches!(t.kind.as_str(), "in" | "pool"))
        .filter(|t| t.subaddr_index.as_ref().map(|i| i.minor) == Some(minor))
        .collect();

    if ours
        .iter()
        .any(|t| t.kind == "pool" || t.confirmations < min_confirmations)
    {
        return Ok(IncomingCheck::Unconfirmed);
    }

    let piconero = ours
        .iter()
        .try_fold(0u64, |acc, t| acc.checked_add(t.amount))
        .ok_or_else(|| EscrowError::decode("transfer amounts overflow"))?;
    Ok(IncomingCheck::Confirmed(Amount::from_atomic(
        piconero,
        Currency::Xmr,
    )))
}

pub struct MoneroAdapter {
    client: JsonRpcClient,
    config: MoneroConfig,
}

impl MoneroAdapter {
    pub fn new(config: MoneroConfig) -> EscrowResult<Self> {
        let auth = match (&config.rpc_user, &config.rpc_password) {
            (Some(user), Some(password)) => Some(RpcAuth {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        let client = JsonRpcClient::new(config.rpc_url.clone(), auth, config.timeout)?;
        Ok(Self { client, config })
    }

    async fn address_index(&self, address: &str) -> EscrowResult<SubaddressIndex> {
        let response: AddressIndexResponse = self
            .client
            .call("get_address_index", json!({ "address": address }))
            .await?;
        Ok(response.index)
    }

    async fn transfer_by_txid(
        &self,
        txid: &str,
        account_index: u32,
    ) -> EscrowResult<Vec<TransferEntry>> {
        let response: TransferByTxidResponse = self
            .client
            .call(
                "get_transfer_by_txid",
                json!({ "txid": txid, "account_index": account_index }),
            )
            .await?;
        if response.transfers.is_empty() {
            Ok(vec![response.transfer])
        } else {
            Ok(response.transfers)
        }
    }
}

#[async_trait]
impl ChainAdapter for MoneroAdapter {
    fn currency(&self) -> Currency {
        Currency::Xmr
    }

    fn validate_address(&self, address: &str) -> bool {
        validate_monero_address(address, self.config.network).is_ok()
    }

    async fn create_address(&self, label: &str) -> EscrowResult<String> {
        let response: CreateAddressResponse = self
            .client
            .call(
                "create_address",
                json!({ "account_index": self.config.account_index, "label": label }),
            )
            .await?;
        info!("Monero created subaddress {} ({})", response.address, label);
        Ok(response.address)
    }

    async fn list_transaction_ids(&self, address: &str) -> EscrowResult<Vec<String>> {
        let index = self.address_index(address).await?;
        let response: TransfersResponse = self
            .client
            .call(
                "get_transfers",
                json!({
                    "in": true,
                    "pool": true,
                    "account_index": index.major,
                    "subaddr_indices": [index.minor],
                }),
            )
            .await?;

        let mut txids: Vec<String> = Vec::new();
        for transfer in response.incoming.into_iter().chain(response.pool) {
            if !txids.contains(&transfer.txid) {
                txids.push(transfer.txid);
            }
        }
        Ok(txids)
    }

    async fn check_incoming(&self, address: &str, txid: &str) -> EscrowResult<IncomingCheck> {
        let index = self.address_index(address).await?;
        let entries = self.transfer_by_txid(txid, index.major).await?;
        incoming_for_subaddress(&entries, index.minor, self.config.min_confirmations)
    }

    async fn pay_to_many(&self, outputs: &[PayoutOutput]) -> EscrowResult<String> {
        if outputs.is_empty() {
            return Err(EscrowError::validation("payout has no outputs"));
        }
        let destinations = outputs
            .iter()
            .map(|o| {
                let atomic = Amount::new(o.amount, Currency::Xmr)?.to_atomic()?;
                Ok(json!({ "amount": atomic, "address": o.address }))
            })
            .collect::<EscrowResult<Vec<_>>>()?;

        let response: TransferResponse = self
            .client
            .call(
                "transfer",
                json!({
                    "destinations": destinations,
                    "account_index": self.config.account_index,
                    "ring_size": self.config.ring_size,
                }),
            )
            .await
            .map_err(|e| match e {
                // transfer signs and relays in one call, so a lost answer
                // says nothing about whether the funds moved
                EscrowError::ChainClientUnavailable(message) => {
                    warn!("Monero transfer outcome unknown: {}", message);
                    EscrowError::broadcast_unknown(None, message)
                }
                e => classify_payout_rejection(e, &REJECT_CODES),
            })?;
        info!(
            "Monero transfer {} with {} outputs, fee {} XMR",
            response.tx_hash,
            outputs.len(),
            Amount::from_atomic(response.fee, Currency::Xmr)
        );
        Ok(response.tx_hash)
    }

    async fn confirmations(&self, txid: &str) -> EscrowResult<u64> {
        let entries = self
            .transfer_by_txid(txid, self.config.account_index)
            .await?;
        Ok(entries.iter().map(|t| t.confirmations).min().unwrap_or(0))
    }

    async fn balance(&self) -> EscrowResult<ChainBalance> {
        let response: BalanceResponse = self
            .client
            .call(
                "get_balance",
                json!({ "account_index": self.config.account_index }),
            )
            .await?;
        let unlocked = Amount::from_atomic(response.unlocked_balance, Currency::Xmr).value();
        let total = Amount::from_atomic(response.balance, Currency::Xmr).value();
        Ok(ChainBalance {
            currency: Currency::Xmr,
            confirmed: unlocked,
            unconfirmed: total - unlocked,
        })
    }
}
