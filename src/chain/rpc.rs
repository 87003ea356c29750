//! JSON-RPC transport for the registry chain.
//!
//! One client serves every chain consumer (ledger poll, registry calls,
//! oracle sync, settlement transfers): a primary URL with an optional
//! fallback, a clamped `max_response_bytes`, and cycle-admission checks in
//! front of every outcall. On wasm32 requests go through the management
//! canister's `http_request`; native builds use a `ureq` transport that can
//! be swapped for a canned stub via an environment gate so the full pipeline
//! runs under `cargo test` without a network.

use crate::domain::cycle_admission::{
    demand_for, estimate_cost, is_covered, PaidOperation, RESERVE_FLOOR_CYCLES, SAFETY_MARGIN_BPS,
};
use crate::domain::types::RuntimeSnapshot;
use alloy_primitives::U256;
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};
use serde::Deserialize;
use serde_json::{json, Value};
#[cfg(not(target_arch = "wasm32"))]
use std::io::Read;

#[cfg(target_arch = "wasm32")]
use candid::Nat;
#[cfg(target_arch = "wasm32")]
use ic_cdk::management_canister::{http_request, HttpHeader, HttpMethod, HttpRequestArgs};

pub const MAX_RPC_RESPONSE_BYTES: u64 = 2 * 1024 * 1024;
pub const MIN_RPC_RESPONSE_BYTES: u64 = 256;
pub const DEFAULT_RPC_MAX_RESPONSE_BYTES: u64 = 64 * 1024;
const CONTROL_PLANE_MAX_RESPONSE_BYTES: u64 = 4 * 1024;
#[cfg(not(target_arch = "wasm32"))]
pub const HOST_RPC_MODE_ENV: &str = "IC_DELEGATOR_RPC_HOST_MODE";

#[derive(Clone, Copy, Debug, LogPriorityLevels)]
pub enum ChainLogPriority {
    #[log_level(capacity = 1000, name = "CHAIN_INFO")]
    Info,
    #[log_level(capacity = 500, name = "CHAIN_ERROR")]
    Error,
}

impl GetLogFilter for ChainLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// One decoded entry of an `eth_getLogs` result or a receipt's `logs` array.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcLog {
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    #[serde(rename = "logIndex")]
    pub log_index: Option<String>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub data: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpcReceipt {
    pub status: Option<String>,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl RpcReceipt {
    pub fn succeeded(&self) -> bool {
        matches!(self.status.as_deref(), Some("0x1") | Some("0x01"))
    }
}

#[derive(Clone, Debug)]
pub struct RpcClient {
    rpc_url: String,
    fallback_rpc_url: Option<String>,
    max_response_bytes: u64,
}

impl RpcClient {
    pub fn from_snapshot(snapshot: &RuntimeSnapshot) -> Result<Self, String> {
        let rpc_url = snapshot.rpc_url.trim();
        if rpc_url.is_empty() {
            return Err("rpc url is not configured".to_string());
        }
        Ok(Self {
            rpc_url: rpc_url.to_string(),
            fallback_rpc_url: snapshot.fallback_rpc_url.clone(),
            max_response_bytes: clamp_response_bytes(
                snapshot
                    .max_response_bytes
                    .unwrap_or(DEFAULT_RPC_MAX_RESPONSE_BYTES),
            ),
        })
    }

    /// Response cap for the bulk `eth_getLogs` lane. Control-plane calls use
    /// a small fixed cap instead so a tuned-up log limit never inflates the
    /// cycle cost of a nonce fetch or a broadcast.
    pub fn max_response_bytes(&self) -> u64 {
        self.max_response_bytes
    }

    pub fn control_plane_max_response_bytes(&self) -> u64 {
        CONTROL_PLANE_MAX_RESPONSE_BYTES
    }

    pub async fn eth_block_number(&self) -> Result<u64, String> {
        let result = self
            .rpc_call(
                "eth_blockNumber",
                json!([]),
                self.control_plane_max_response_bytes(),
            )
            .await
            .map_err(|error| format!("eth_blockNumber failed: {error}"))?;
        let raw = result
            .as_str()
            .ok_or_else(|| "eth_blockNumber response is missing result field".to_string())?;
        parse_hex_u64(raw, "eth_blockNumber")
    }

    pub async fn eth_get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        address_filter: Option<&str>,
        topics_filter: Option<Value>,
        max_response_bytes: u64,
    ) -> Result<Vec<RpcLog>, String> {
        let mut filter = serde_json::Map::new();
        filter.insert(
            "fromBlock".to_string(),
            Value::String(format!("0x{from_block:x}")),
        );
        filter.insert(
            "toBlock".to_string(),
            Value::String(format!("0x{to_block:x}")),
        );
        if let Some(address) = address_filter {
            filter.insert("address".to_string(), Value::String(address.to_string()));
        }
        if let Some(topics) = topics_filter {
            filter.insert("topics".to_string(), topics);
        }

        let result = self
            .rpc_call(
                "eth_getLogs",
                Value::Array(vec![Value::Object(filter)]),
                max_response_bytes,
            )
            .await
            .map_err(|error| format!("eth_getLogs failed: {error}"))?;

        serde_json::from_value::<Vec<RpcLog>>(result)
            .map_err(|error| format!("failed to decode eth_getLogs result: {error}"))
    }

    pub async fn eth_get_balance(&self, address: &str) -> Result<String, String> {
        let result = self
            .rpc_call(
                "eth_getBalance",
                json!([address, "latest"]),
                self.control_plane_max_response_bytes(),
            )
            .await
            .map_err(|error| format!("eth_getBalance failed: {error}"))?;
        let raw = result
            .as_str()
            .ok_or_else(|| "eth_getBalance response is missing result field".to_string())?;
        normalize_hex_quantity(raw, "eth_getBalance result")
    }

    pub async fn eth_call(&self, address: &str, calldata: &str) -> Result<String, String> {
        let result = self
            .rpc_call(
                "eth_call",
                json!([{"to": address, "data": calldata}, "latest"]),
                self.control_plane_max_response_bytes(),
            )
            .await
            .map_err(|error| format!("eth_call failed: {error}"))?;
        let raw = result
            .as_str()
            .ok_or_else(|| "eth_call response is missing result field".to_string())?;
        normalize_hex_blob(raw, "eth_call result")
    }

    pub async fn eth_get_transaction_count(&self, address: &str) -> Result<u64, String> {
        let result = self
            .rpc_call(
                "eth_getTransactionCount",
                json!([address, "pending"]),
                self.control_plane_max_response_bytes(),
            )
            .await
            .map_err(|error| format!("eth_getTransactionCount failed: {error}"))?;
        let raw = result.as_str().ok_or_else(|| {
            "eth_getTransactionCount response is missing result field".to_string()
        })?;
        parse_hex_u64(raw, "eth_getTransactionCount")
    }

    pub async fn eth_gas_price(&self) -> Result<U256, String> {
        let result = self
            .rpc_call(
                "eth_gasPrice",
                json!([]),
                self.control_plane_max_response_bytes(),
            )
            .await
            .map_err(|error| format!("eth_gasPrice failed: {error}"))?;
        let raw = result
            .as_str()
            .ok_or_else(|| "eth_gasPrice response is missing result field".to_string())?;
        parse_hex_u256(raw, "eth_gasPrice")
    }

    pub async fn eth_estimate_gas(
        &self,
        from: &str,
        to: &str,
        value_wei: U256,
        data_hex: &str,
    ) -> Result<u64, String> {
        let value_hex = format!("0x{:x}", value_wei);
        let result = self
            .rpc_call(
                "eth_estimateGas",
                json!([{
                    "from": from,
                    "to": to,
                    "value": value_hex,
                    "data": data_hex
                }]),
                self.control_plane_max_response_bytes(),
            )
            .await
            .map_err(|error| format!("eth_estimateGas failed: {error}"))?;
        let raw = result
            .as_str()
            .ok_or_else(|| "eth_estimateGas response is missing result field".to_string())?;
        parse_hex_u64(raw, "eth_estimateGas")
    }

    pub async fn eth_send_raw_transaction(&self, raw_tx: &[u8]) -> Result<String, String> {
        let payload = format!("0x{}", hex::encode(raw_tx));
        let result = self
            .rpc_call(
                "eth_sendRawTransaction",
                json!([payload]),
                self.control_plane_max_response_bytes(),
            )
            .await
            .map_err(|error| format!("eth_sendRawTransaction failed: {error}"))?;
        let raw = result.as_str().ok_or_else(|| {
            "eth_sendRawTransaction response is missing result field".to_string()
        })?;
        normalize_hex_blob(raw, "eth_sendRawTransaction result")
    }

    /// Returns `Ok(None)` while the transaction is still unmined; the JSON-RPC
    /// result is `null` in that window rather than an error.
    pub async fn eth_get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<RpcReceipt>, String> {
        let result = self
            .rpc_call(
                "eth_getTransactionReceipt",
                json!([tx_hash]),
                self.control_plane_max_response_bytes(),
            )
            .await
            .map_err(|error| format!("eth_getTransactionReceipt failed: {error}"))?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value::<RpcReceipt>(result)
            .map(Some)
            .map_err(|error| format!("failed to decode eth_getTransactionReceipt result: {error}"))
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: Value,
        max_response_bytes: u64,
    ) -> Result<Value, String> {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .map_err(|error| format!("failed to serialize {method} request: {error}"))?;

        let request_size_bytes = u64::try_from(body.len()).unwrap_or(u64::MAX);
        ensure_rpc_affordable(request_size_bytes, max_response_bytes)?;

        let raw = self.http_post(&body, max_response_bytes).await?;
        let value: Value = serde_json::from_slice(&raw)
            .map_err(|error| format!("failed to parse {method} response JSON: {error}"))?;
        if let Some(error) = value.get("error") {
            return Err(format!("json-rpc error for {method}: {error}"));
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| format!("{method} response is missing result field"))
    }

    async fn http_post(&self, body: &[u8], max_response_bytes: u64) -> Result<Vec<u8>, String> {
        let normalized_max = clamp_response_bytes(max_response_bytes);
        match self
            .try_http_post(&self.rpc_url, body, normalized_max)
            .await
        {
            Ok(body) => Ok(body),
            Err(primary_error) => {
                if let Some(fallback_url) = self.fallback_rpc_url.as_deref() {
                    let served = self
                        .try_http_post(fallback_url, body, normalized_max)
                        .await
                        .map_err(|fallback_error| {
                            format!(
                                "primary rpc failed: {primary_error}; fallback rpc failed: {fallback_error}"
                            )
                        })?;
                    log!(
                        ChainLogPriority::Info,
                        "rpc_fallback_served primary_err={primary_error}"
                    );
                    Ok(served)
                } else {
                    Err(primary_error)
                }
            }
        }
    }

    #[cfg(target_arch = "wasm32")]
    async fn try_http_post(
        &self,
        url: &str,
        body: &[u8],
        max_response_bytes: u64,
    ) -> Result<Vec<u8>, String> {
        let request = HttpRequestArgs {
            url: url.to_string(),
            max_response_bytes: Some(max_response_bytes),
            method: HttpMethod::POST,
            headers: vec![HttpHeader {
                name: "content-type".to_string(),
                value: "application/json".to_string(),
            }],
            body: Some(body.to_vec()),
            transform: None,
            is_replicated: Some(false),
        };

        let response = http_request(&request)
            .await
            .map_err(|error| format!("rpc outcall failed: {error}"))?;
        let status = nat_to_u16(&response.status)?;
        if !(200..300).contains(&status) {
            return Err(format!("rpc endpoint returned status {status}"));
        }
        Ok(response.body)
    }

    #[cfg(not(target_arch = "wasm32"))]
    async fn try_http_post(
        &self,
        url: &str,
        body: &[u8],
        max_response_bytes: u64,
    ) -> Result<Vec<u8>, String> {
        if !host_rpc_real_mode_enabled() {
            return host_rpc_stub_response(body);
        }

        let normalized_max = clamp_response_bytes(max_response_bytes);
        let response = ureq::post(url)
            .set("content-type", "application/json")
            .send_bytes(body)
            .map_err(|error| match error {
                ureq::Error::Status(status, _) => {
                    format!("rpc endpoint returned status {status}")
                }
                ureq::Error::Transport(transport) => {
                    format!("rpc host transport failed: {transport}")
                }
            })?;

        let mut raw = Vec::new();
        response
            .into_reader()
            .take(normalized_max.saturating_add(1))
            .read_to_end(&mut raw)
            .map_err(|error| format!("failed to read host rpc response body: {error}"))?;
        if u64::try_from(raw.len()).unwrap_or(u64::MAX) > normalized_max {
            return Err(format!(
                "host rpc response exceeded max_response_bytes={normalized_max}"
            ));
        }
        Ok(raw)
    }
}

#[cfg(target_arch = "wasm32")]
fn nat_to_u16(status: &Nat) -> Result<u16, String> {
    status
        .to_string()
        .parse::<u16>()
        .map_err(|error| format!("invalid HTTP status {status}: {error}"))
}

pub fn clamp_response_bytes(max_response_bytes: u64) -> u64 {
    max_response_bytes.clamp(MIN_RPC_RESPONSE_BYTES, MAX_RPC_RESPONSE_BYTES)
}

fn ensure_rpc_affordable(request_size_bytes: u64, max_response_bytes: u64) -> Result<(), String> {
    let operation = PaidOperation::RpcOutcall {
        request_bytes: request_size_bytes,
        response_bytes: clamp_response_bytes(max_response_bytes),
    };
    let demand = demand_for(
        estimate_cost(&operation)?,
        SAFETY_MARGIN_BPS,
        RESERVE_FLOOR_CYCLES,
    );
    let liquid = liquid_cycle_balance();
    if !is_covered(liquid, &demand) {
        log!(
            ChainLogPriority::Error,
            "rpc_outcall_unaffordable required_cycles={} liquid_cycles={liquid}",
            demand.required_cycles
        );
        return Err(format!(
            "insufficient cycles for rpc outcall: need {} liquid, have {}",
            demand.required_cycles, liquid
        ));
    }
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn liquid_cycle_balance() -> u128 {
    ic_cdk::api::canister_liquid_cycle_balance()
}

#[cfg(not(target_arch = "wasm32"))]
fn liquid_cycle_balance() -> u128 {
    u128::MAX
}

#[cfg(not(target_arch = "wasm32"))]
fn host_rpc_real_mode_enabled() -> bool {
    std::env::var(HOST_RPC_MODE_ENV)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "real" | "1" | "true" | "yes")
        })
        .unwrap_or(false)
}

#[cfg(not(target_arch = "wasm32"))]
fn host_rpc_stub_response(body: &[u8]) -> Result<Vec<u8>, String> {
    let request: Value = serde_json::from_slice(body)
        .map_err(|error| format!("host rpc stub could not parse request JSON: {error}"))?;
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| "host rpc stub request is missing method".to_string())?;

    let response = match method {
        "eth_blockNumber" => json!({"jsonrpc":"2.0","id":1,"result":"0x0"}),
        "eth_getLogs" => json!({"jsonrpc":"2.0","id":1,"result":[]}),
        "eth_getBalance" => json!({"jsonrpc":"2.0","id":1,"result":"0x1"}),
        "eth_call" => json!({"jsonrpc":"2.0","id":1,"result":"0x"}),
        "eth_getTransactionCount" => json!({"jsonrpc":"2.0","id":1,"result":"0x0"}),
        "eth_gasPrice" => json!({"jsonrpc":"2.0","id":1,"result":"0x3b9aca00"}),
        "eth_estimateGas" => json!({"jsonrpc":"2.0","id":1,"result":"0x5208"}),
        "eth_sendRawTransaction" => json!({
            "jsonrpc":"2.0",
            "id":1,
            "result":"0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        }),
        "eth_getTransactionReceipt" => json!({
            "jsonrpc":"2.0",
            "id":1,
            "result":{
                "status":"0x1",
                "blockNumber":"0x1",
                "transactionHash":"0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "logs":[]
            }
        }),
        unsupported => {
            return Err(format!(
                "host rpc stub does not support method {unsupported}"
            ));
        }
    };

    serde_json::to_vec(&response)
        .map_err(|error| format!("host rpc stub failed to serialize response: {error}"))
}

pub fn parse_hex_u64(raw: &str, field: &str) -> Result<u64, String> {
    let value = raw.trim();
    let without_prefix = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    u64::from_str_radix(without_prefix, 16)
        .map_err(|error| format!("failed to parse {field} as hex u64: {error}"))
}

pub fn parse_hex_u256(raw: &str, field: &str) -> Result<U256, String> {
    let value = raw.trim();
    let without_prefix = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    if without_prefix.is_empty() || without_prefix.len() > 64 {
        return Err(format!("{field} must be between 1 and 32 bytes of hex"));
    }
    let padded = if without_prefix.len() % 2 == 1 {
        format!("0{without_prefix}")
    } else {
        without_prefix.to_string()
    };
    let bytes =
        hex::decode(&padded).map_err(|error| format!("failed to parse {field} as hex: {error}"))?;
    Ok(U256::from_be_slice(&bytes))
}

pub fn normalize_address(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let valid = trimmed.len() == 42
        && trimmed.starts_with("0x")
        && trimmed
            .as_bytes()
            .iter()
            .skip(2)
            .all(|byte| byte.is_ascii_hexdigit());
    if !valid {
        return Err("address must be a 0x-prefixed 20-byte hex string".to_string());
    }
    Ok(trimmed)
}

pub fn normalize_hex_blob(raw: &str, field: &str) -> Result<String, String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    if without_prefix.len() % 2 != 0 {
        return Err(format!("{field} hex length must be even"));
    }
    if !without_prefix
        .as_bytes()
        .iter()
        .all(|byte| byte.is_ascii_hexdigit())
    {
        return Err(format!("{field} must be valid hex"));
    }
    Ok(trimmed)
}

pub fn normalize_hex_quantity(raw: &str, field: &str) -> Result<String, String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    if !without_prefix
        .as_bytes()
        .iter()
        .all(|byte| byte.is_ascii_hexdigit())
    {
        return Err(format!("{field} must be valid hex"));
    }
    Ok(trimmed)
}
