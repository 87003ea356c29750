//! EIP-1559 transaction assembly, signing, and broadcast.
//!
//! Every on-chain write (registry logging, delegation redemption, settlement
//! transfers, oracle pushes) funnels through `sign_and_broadcast`: nonce and
//! fee discovery, RLP encoding, threshold signature with y-parity recovery,
//! then `eth_sendRawTransaction`. `broadcast_and_confirm` adds bounded
//! receipt polling so callers only record state once the chain has accepted
//! the transaction.

use crate::chain::rpc::{normalize_address, parse_hex_u256, RpcClient, RpcReceipt};
use crate::chain::signer::SignerPort;
use crate::domain::cycle_admission::{
    demand_for, estimate_signed_broadcast_cost, is_covered, RESERVE_FLOOR_CYCLES,
    SAFETY_MARGIN_BPS,
};
use crate::domain::types::SurvivalOperationClass;
use crate::storage::stable;
use crate::timing::current_time_ns;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{length_of_length, BufMut, Encodable, Header};
use std::str::FromStr;

const EMPTY_ACCESS_LIST_RLP_LEN: usize = 1;
const PLAIN_TRANSFER_GAS_LIMIT: u64 = 21_000;
const FALLBACK_CALL_GAS_LIMIT: u64 = 300_000;
const DEFAULT_PRIORITY_FEE_WEI: u64 = 1_000_000_000;
const FALLBACK_GAS_PRICE_WEI: u64 = 1_000_000_000;
pub const RECEIPT_CONFIRM_ATTEMPTS: u32 = 10;

/// A transaction to submit: target, native value, and calldata.
#[derive(Clone, Debug)]
pub struct TxRequest {
    pub to: String,
    pub value_wei: U256,
    pub data_hex: String,
}

impl TxRequest {
    pub fn call(to: &str, data_hex: String) -> Self {
        Self {
            to: to.to_string(),
            value_wei: U256::ZERO,
            data_hex,
        }
    }

    pub fn native_transfer(to: &str, value_wei: U256) -> Self {
        Self {
            to: to.to_string(),
            value_wei,
            data_hex: "0x".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConfirmedTx {
    pub tx_hash: String,
    pub receipt: RpcReceipt,
}

#[derive(Clone, Debug)]
struct Eip1559UnsignedTx {
    chain_id: U256,
    nonce: U256,
    max_priority_fee_per_gas: U256,
    max_fee_per_gas: U256,
    gas_limit: U256,
    to: Address,
    value: U256,
    data: Bytes,
}

impl Eip1559UnsignedTx {
    fn payload_length(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.max_priority_fee_per_gas.length()
            + self.max_fee_per_gas.length()
            + self.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.data.length()
            + EMPTY_ACCESS_LIST_RLP_LEN
    }
}

impl Encodable for Eip1559UnsignedTx {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.max_priority_fee_per_gas.encode(out);
        self.max_fee_per_gas.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + length_of_length(payload_length)
    }
}

struct Eip1559SignedTx<'a> {
    tx: &'a Eip1559UnsignedTx,
    y_parity: u8,
    r: U256,
    s: U256,
}

impl Eip1559SignedTx<'_> {
    fn payload_length(&self) -> usize {
        self.tx.payload_length() + self.y_parity.length() + self.r.length() + self.s.length()
    }
}

impl Encodable for Eip1559SignedTx<'_> {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.tx.chain_id.encode(out);
        self.tx.nonce.encode(out);
        self.tx.max_priority_fee_per_gas.encode(out);
        self.tx.max_fee_per_gas.encode(out);
        self.tx.gas_limit.encode(out);
        self.tx.to.encode(out);
        self.tx.value.encode(out);
        self.tx.data.encode(out);
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(out);
        self.y_parity.encode(out);
        self.r.encode(out);
        self.s.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + length_of_length(payload_length)
    }
}

/// Build, sign, and broadcast one EIP-1559 transaction from `from_address`.
/// Returns the broadcast transaction hash without waiting for a receipt.
pub async fn sign_and_broadcast(
    rpc: &RpcClient,
    signer: &dyn SignerPort,
    from_address: &str,
    request: &TxRequest,
) -> Result<String, String> {
    let now = current_time_ns();
    if !stable::can_run_survival_operation(&SurvivalOperationClass::ChainBroadcast, now) {
        return Err("chain_broadcast blocked by survival backoff".to_string());
    }

    let snapshot = stable::runtime_snapshot();
    ensure_broadcast_affordable(&snapshot.ecdsa_key_name)?;

    let from = normalize_address(from_address)?;
    let to_hex = normalize_address(&request.to)?;
    let to = Address::from_str(&to_hex)
        .map_err(|error| format!("invalid transaction target address: {error}"))?;
    let data_bytes = decode_data_hex(&request.data_hex)?;

    if request.value_wei > U256::ZERO {
        let balance = parse_hex_u256(
            &rpc.eth_get_balance(&from).await?,
            "eth_getBalance result",
        )?;
        if balance < request.value_wei {
            return Err(format!(
                "insufficient balance for transfer: balance={} value={}",
                balance, request.value_wei
            ));
        }
    }

    let nonce = rpc.eth_get_transaction_count(&from).await?;
    let gas_limit = if data_bytes.is_empty() {
        PLAIN_TRANSFER_GAS_LIMIT
    } else {
        rpc.eth_estimate_gas(&from, &to_hex, request.value_wei, &request.data_hex)
            .await
            .unwrap_or(FALLBACK_CALL_GAS_LIMIT)
    };

    let base_fee = rpc
        .eth_gas_price()
        .await
        .unwrap_or_else(|_| U256::from(FALLBACK_GAS_PRICE_WEI));
    let max_priority_fee_per_gas = U256::from(DEFAULT_PRIORITY_FEE_WEI);
    let max_fee_per_gas = base_fee + max_priority_fee_per_gas;

    let tx = Eip1559UnsignedTx {
        chain_id: U256::from(snapshot.chain_id),
        nonce: U256::from(nonce),
        max_priority_fee_per_gas,
        max_fee_per_gas,
        gas_limit: U256::from(gas_limit),
        to,
        value: request.value_wei,
        data: Bytes::from(data_bytes),
    };

    let unsigned = encode_eip1559_unsigned(&tx);
    let tx_hash = keccak256(&unsigned);
    let message_hash = format!("0x{}", hex::encode(tx_hash.as_slice()));
    let signature = parse_compact_signature(&signer.sign_message(&message_hash).await?)?;
    let y_parity = recover_y_parity(&tx_hash, &signature, &from)?;
    let r = U256::from_be_slice(&signature[..32]);
    let s = U256::from_be_slice(&signature[32..]);
    let signed = encode_eip1559_signed(&tx, y_parity, r, s);

    rpc.eth_send_raw_transaction(&signed).await
}

/// `sign_and_broadcast`, then poll for the receipt a bounded number of
/// times. Errors if the receipt never appears or reports a revert.
pub async fn broadcast_and_confirm(
    rpc: &RpcClient,
    signer: &dyn SignerPort,
    from_address: &str,
    request: &TxRequest,
) -> Result<ConfirmedTx, String> {
    let tx_hash = sign_and_broadcast(rpc, signer, from_address, request).await?;
    let receipt = confirm_transaction(rpc, &tx_hash).await?;
    Ok(ConfirmedTx { tx_hash, receipt })
}

/// Each poll is its own consensus round on the IC, so the attempt bound also
/// bounds wall-clock waiting.
pub async fn confirm_transaction(rpc: &RpcClient, tx_hash: &str) -> Result<RpcReceipt, String> {
    for _attempt in 0..RECEIPT_CONFIRM_ATTEMPTS {
        if let Some(receipt) = rpc.eth_get_transaction_receipt(tx_hash).await? {
            if receipt.succeeded() {
                return Ok(receipt);
            }
            return Err(format!("transaction {tx_hash} reverted on chain"));
        }
    }
    Err(format!(
        "transaction {tx_hash} was not confirmed after {RECEIPT_CONFIRM_ATTEMPTS} receipt polls"
    ))
}

fn ensure_broadcast_affordable(key_name: &str) -> Result<(), String> {
    let estimated = estimate_signed_broadcast_cost(key_name, 0, 512, 4_096)?;
    let demand = demand_for(estimated, SAFETY_MARGIN_BPS, RESERVE_FLOOR_CYCLES);
    let liquid = liquid_cycle_balance();
    if !is_covered(liquid, &demand) {
        return Err(format!(
            "insufficient cycles for signed broadcast: need {} liquid, have {}",
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

fn decode_data_hex(data_hex: &str) -> Result<Vec<u8>, String> {
    let trimmed = data_hex.trim();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| "transaction data must be 0x-prefixed hex".to_string())?;
    hex::decode(without_prefix)
        .map_err(|error| format!("transaction data is not valid hex: {error}"))
}

fn parse_compact_signature(raw: &str) -> Result<[u8; 64], String> {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| "signature must be 0x-prefixed hex".to_string())?;
    if without_prefix.len() != 128 {
        return Err("signature must be exactly 64 bytes".to_string());
    }
    let mut out = [0u8; 64];
    hex::decode_to_slice(without_prefix, &mut out)
        .map_err(|error| format!("failed to decode signature: {error}"))?;
    Ok(out)
}

fn encode_eip1559_unsigned(tx: &Eip1559UnsignedTx) -> Vec<u8> {
    let payload = alloy_rlp::encode(tx);
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(0x02);
    out.extend_from_slice(&payload);
    out
}

fn encode_eip1559_signed(tx: &Eip1559UnsignedTx, y_parity: u8, r: U256, s: U256) -> Vec<u8> {
    let payload = alloy_rlp::encode(Eip1559SignedTx { tx, y_parity, r, s });
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(0x02);
    out.extend_from_slice(&payload);
    out
}

#[cfg(not(target_arch = "wasm32"))]
fn recover_y_parity(
    _tx_hash: &B256,
    _signature_compact: &[u8; 64],
    _expected_address: &str,
) -> Result<u8, String> {
    Ok(0)
}

#[cfg(target_arch = "wasm32")]
fn recover_y_parity(
    tx_hash: &B256,
    signature_compact: &[u8; 64],
    expected_address: &str,
) -> Result<u8, String> {
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use sha3::{Digest, Keccak256};

    let signature = Signature::from_slice(signature_compact)
        .map_err(|error| format!("invalid compact signature bytes: {error}"))?;
    let expected = expected_address.trim().to_ascii_lowercase();

    for candidate in [0u8, 1u8] {
        let Some(recovery_id) = RecoveryId::from_byte(candidate) else {
            continue;
        };
        let recovered =
            match VerifyingKey::recover_from_prehash(tx_hash.as_slice(), &signature, recovery_id) {
                Ok(key) => key,
                Err(_) => continue,
            };
        let uncompressed = recovered.to_encoded_point(false);
        let bytes = uncompressed.as_bytes();
        if bytes.len() != 65 || bytes.first().copied() != Some(0x04) {
            continue;
        }
        let digest = Keccak256::digest(&bytes[1..]);
        let address = format!("0x{}", hex::encode(&digest[12..32]));
        if address == expected {
            return Ok(candidate);
        }
    }

    Err("failed to recover EIP-1559 y_parity for broadcast signature".to_string())
}
