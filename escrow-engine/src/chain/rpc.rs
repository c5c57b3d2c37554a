//! Minimal JSON-RPC 2.0 client over HTTP

use crate::{error::EscrowError, EscrowResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::debug;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone)]
pub struct RpcAuth {
    pub user: String,
    pub password: String,
}

pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    auth: Option<RpcAuth>,
    request_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, auth: Option<RpcAuth>, timeout: Duration) -> EscrowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| EscrowError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: url.into(),
            auth,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and deserialize its `result`.
    ///
    /// Transport failures, HTTP status errors and bodies that are not a
    /// JSON-RPC envelope are `ChainClientUnavailable`. An `error` object in
    /// the envelope is `ChainRpc`. Only a result that does not fit `T` is
    /// `Decode`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> EscrowResult<T> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        debug!("[RPC] >>> {} id={}", method, id);

        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(auth) = &self.auth {
            builder = builder.basic_auth(&auth.user, Some(&auth.password));
        }

        let response = builder.send().await.map_err(|e| {
            EscrowError::chain_unavailable(format!("{} to {} failed: {}", method, self.url, e))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(EscrowError::chain_unavailable(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        // A body that is not an envelope at all comes from a proxy or a node
        // mid-restart, not from the payload we asked about
        let body = response.bytes().await.map_err(|e| {
            EscrowError::chain_unavailable(format!("{} body from {}: {}", method, self.url, e))
        })?;
        let envelope: JsonRpcResponse = serde_json::from_slice(&body).map_err(|e| {
            EscrowError::chain_unavailable(format!("{} returned a non-JSON-RPC body: {}", method, e))
        })?;

        if let Some(err) = envelope.error {
            return Err(EscrowError::ChainRpc {
                code: err.code,
                message: err.message,
            });
        }

        let result = envelope.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| EscrowError::decode(format!("{} result: {}", method, e)))
    }
}
