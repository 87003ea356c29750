//! Registry-contract event decoding.
//!
//! The registry emits seven event kinds covering the agent lifecycle,
//! execution logging, and redelegation creation. Topic hashes are recomputed
//! from the canonical signatures at call time, and every decoder validates
//! the indexed-topic count before touching the data payload, so a log that
//! does not match its claimed shape fails as one item instead of poisoning
//! the whole poll batch.

use crate::chain::abi::{
    decode_address_word, decode_bool_word, decode_hex_payload, decode_int256_word,
    decode_string_word, decode_u256_word, decode_u64_word, event_topic0,
};
use crate::chain::rpc::{parse_hex_u64, RpcLog, RpcReceipt};
use crate::domain::types::{LedgerEvent, ObservedEvent};
use crate::timing::NANOS_PER_SEC;

pub const AGENT_REGISTERED_SIGNATURE: &str = "AgentRegistered(address,string,uint8)";
pub const AGENT_UPDATED_SIGNATURE: &str = "AgentUpdated(address,string,uint8)";
pub const AGENT_DEACTIVATED_SIGNATURE: &str = "AgentDeactivated(address)";
pub const AGENT_REACTIVATED_SIGNATURE: &str = "AgentReactivated(address)";
pub const EXECUTION_STARTED_SIGNATURE: &str =
    "ExecutionStarted(uint256,address,address,uint256,address,address)";
pub const EXECUTION_COMPLETED_SIGNATURE: &str =
    "ExecutionCompleted(uint256,address,uint256,int256,bool)";
pub const REDELEGATION_CREATED_SIGNATURE: &str =
    "RedelegationCreated(bytes32,address,address,address,uint256,uint256)";

/// Topic0 filter list for the ledger poll: one entry per registry event.
pub fn registry_event_topics() -> Vec<String> {
    vec![
        event_topic0(AGENT_REGISTERED_SIGNATURE),
        event_topic0(AGENT_UPDATED_SIGNATURE),
        event_topic0(AGENT_DEACTIVATED_SIGNATURE),
        event_topic0(AGENT_REACTIVATED_SIGNATURE),
        event_topic0(EXECUTION_STARTED_SIGNATURE),
        event_topic0(EXECUTION_COMPLETED_SIGNATURE),
        event_topic0(REDELEGATION_CREATED_SIGNATURE),
    ]
}

/// Decode one raw log into an `ObservedEvent` carrying its chain position.
pub fn decode_registry_log(
    log: &RpcLog,
    chain_id: u64,
    observed_at_ns: u64,
) -> Result<ObservedEvent, String> {
    let block_number = parse_hex_u64(
        log.block_number
            .as_deref()
            .ok_or_else(|| "rpc log is missing blockNumber".to_string())?,
        "blockNumber",
    )?;
    let log_index = parse_hex_u64(
        log.log_index
            .as_deref()
            .ok_or_else(|| "rpc log is missing logIndex".to_string())?,
        "logIndex",
    )?;
    let tx_hash = log
        .transaction_hash
        .clone()
        .ok_or_else(|| "rpc log is missing transactionHash".to_string())?;

    let event = decode_registry_event(log)?;
    Ok(ObservedEvent {
        chain_id,
        block_number,
        log_index,
        tx_hash,
        observed_at_ns,
        event,
    })
}

fn decode_registry_event(log: &RpcLog) -> Result<LedgerEvent, String> {
    let topic0 = log
        .topics
        .first()
        .ok_or_else(|| "rpc log has no topics".to_string())?
        .to_ascii_lowercase();

    if topic0 == event_topic0(AGENT_REGISTERED_SIGNATURE) {
        let agent_id = indexed_address(log, 1, "AgentRegistered agent")?;
        let data = decode_hex_payload(&log.data, "AgentRegistered data")?;
        Ok(LedgerEvent::AgentRegistered {
            agent_id: agent_id.clone(),
            wallet_address: agent_id,
            strategy: decode_string_word(&data, 0, "AgentRegistered strategy")?,
            risk_level: decode_risk_level(&data, 1, "AgentRegistered riskLevel")?,
        })
    } else if topic0 == event_topic0(AGENT_UPDATED_SIGNATURE) {
        let data = decode_hex_payload(&log.data, "AgentUpdated data")?;
        Ok(LedgerEvent::AgentUpdated {
            agent_id: indexed_address(log, 1, "AgentUpdated agent")?,
            strategy: decode_string_word(&data, 0, "AgentUpdated strategy")?,
            risk_level: decode_risk_level(&data, 1, "AgentUpdated riskLevel")?,
        })
    } else if topic0 == event_topic0(AGENT_DEACTIVATED_SIGNATURE) {
        Ok(LedgerEvent::AgentDeactivated {
            agent_id: indexed_address(log, 1, "AgentDeactivated agent")?,
        })
    } else if topic0 == event_topic0(AGENT_REACTIVATED_SIGNATURE) {
        Ok(LedgerEvent::AgentReactivated {
            agent_id: indexed_address(log, 1, "AgentReactivated agent")?,
        })
    } else if topic0 == event_topic0(EXECUTION_STARTED_SIGNATURE) {
        let data = decode_hex_payload(&log.data, "ExecutionStarted data")?;
        Ok(LedgerEvent::ExecutionStarted {
            execution_id: indexed_u64(log, 1, "ExecutionStarted executionId")?,
            agent_id: indexed_address(log, 2, "ExecutionStarted agent")?,
            user_address: indexed_address(log, 3, "ExecutionStarted user")?,
            amount_in_wei: decode_u256_word(&data, 0, "ExecutionStarted amountIn")?.to_string(),
            token_in: decode_address_word(&data, 1, "ExecutionStarted tokenIn")?,
            token_out: decode_address_word(&data, 2, "ExecutionStarted tokenOut")?,
        })
    } else if topic0 == event_topic0(EXECUTION_COMPLETED_SIGNATURE) {
        let data = decode_hex_payload(&log.data, "ExecutionCompleted data")?;
        Ok(LedgerEvent::ExecutionCompleted {
            execution_id: indexed_u64(log, 1, "ExecutionCompleted executionId")?,
            agent_id: indexed_address(log, 2, "ExecutionCompleted agent")?,
            amount_out_wei: decode_u256_word(&data, 0, "ExecutionCompleted amountOut")?
                .to_string(),
            profit_loss_wei: decode_int256_word(&data, 1, "ExecutionCompleted profitLoss")?,
            success: decode_bool_word(&data, 2, "ExecutionCompleted success")?,
        })
    } else if topic0 == event_topic0(REDELEGATION_CREATED_SIGNATURE) {
        let data = decode_hex_payload(&log.data, "RedelegationCreated data")?;
        let expires_at_secs = decode_u64_word(&data, 2, "RedelegationCreated expiresAt")?;
        Ok(LedgerEvent::RedelegationCreated {
            delegation_hash: indexed_topic(log, 1, "RedelegationCreated delegationHash")?,
            parent_agent_id: indexed_address(log, 2, "RedelegationCreated parentAgent")?,
            child_agent_id: indexed_address(log, 3, "RedelegationCreated childAgent")?,
            user_address: decode_address_word(&data, 0, "RedelegationCreated user")?,
            amount_wei: decode_u256_word(&data, 1, "RedelegationCreated amount")?.to_string(),
            expires_at_ns: expires_at_secs.saturating_mul(NANOS_PER_SEC),
        })
    } else {
        Err(format!("unrecognized registry event topic {topic0}"))
    }
}

/// Chain-assigned execution id from a `logExecutionStart` receipt.
pub fn execution_id_from_receipt(receipt: &RpcReceipt) -> Result<u64, String> {
    let topic0 = event_topic0(EXECUTION_STARTED_SIGNATURE);
    for log in &receipt.logs {
        if log
            .topics
            .first()
            .map(|topic| topic.eq_ignore_ascii_case(&topic0))
            .unwrap_or(false)
        {
            return indexed_u64(log, 1, "ExecutionStarted executionId");
        }
    }
    Err("receipt does not contain an ExecutionStarted event log".to_string())
}

/// Delegation hash from a `logRedelegation` receipt.
pub fn delegation_hash_from_receipt(receipt: &RpcReceipt) -> Result<String, String> {
    let topic0 = event_topic0(REDELEGATION_CREATED_SIGNATURE);
    for log in &receipt.logs {
        if log
            .topics
            .first()
            .map(|topic| topic.eq_ignore_ascii_case(&topic0))
            .unwrap_or(false)
        {
            return indexed_topic(log, 1, "RedelegationCreated delegationHash");
        }
    }
    Err("receipt does not contain a RedelegationCreated event log".to_string())
}

fn indexed_topic(log: &RpcLog, index: usize, field: &str) -> Result<String, String> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| format!("{field}: log is missing topic {index}"))?
        .trim()
        .to_ascii_lowercase();
    if topic.len() != 66 || !topic.starts_with("0x") {
        return Err(format!("{field}: topic {index} is not a 32-byte hex word"));
    }
    Ok(topic)
}

fn indexed_address(log: &RpcLog, index: usize, field: &str) -> Result<String, String> {
    let topic = indexed_topic(log, index, field)?;
    let word = decode_hex_payload(&topic, field)?;
    decode_address_word(&word, 0, field)
}

fn indexed_u64(log: &RpcLog, index: usize, field: &str) -> Result<u64, String> {
    let topic = indexed_topic(log, index, field)?;
    let word = decode_hex_payload(&topic, field)?;
    decode_u64_word(&word, 0, field)
}

fn decode_risk_level(data: &[u8], index: usize, field: &str) -> Result<u8, String> {
    let value = decode_u64_word(data, index, field)?;
    u8::try_from(value).map_err(|_| format!("{field} exceeds u8 range"))
}
