//! Adapter for the on-chain agent registry contract.
//!
//! The registry is the audit surface of the pipeline: execution starts and
//! completions, redelegations, and delegation redemptions all land there as
//! transactions. Each write is signed with the threshold key of the wallet
//! role that must appear as the contract's `msg.sender`, and chain-assigned
//! identifiers are read back out of the confirmed receipt's event logs.

use crate::chain::abi::{encode_call, AbiToken};
use crate::chain::rpc::{normalize_address, normalize_hex_blob, RpcClient};
use crate::chain::signer::{wallet_address_for_role, ThresholdSigner};
use crate::chain::tx::{broadcast_and_confirm, ConfirmedTx, TxRequest};
use crate::domain::amount::parse_wei;
use crate::domain::types::{RuntimeSnapshot, WalletRole};
use crate::ledger::events::{delegation_hash_from_receipt, execution_id_from_receipt};
use crate::timing::NANOS_PER_SEC;
use alloy_primitives::U256;
use async_trait::async_trait;
use std::cell::{Cell, RefCell};

const LOG_EXECUTION_START_SIGNATURE: &str = "logExecutionStart(address,uint256,address,address)";
const LOG_EXECUTION_COMPLETE_SIGNATURE: &str = "logExecutionComplete(uint256,uint256,bool)";
const LOG_REDELEGATION_SIGNATURE: &str = "logRedelegation(address,address,address,uint256,uint256)";

/// Write surface of the registry contract, one method per logged operation.
#[async_trait(?Send)]
pub trait RegistryPort {
    /// Log an execution start from the specialist's wallet. Returns the
    /// chain-assigned execution id together with the transaction hash.
    async fn log_execution_start(
        &self,
        agent_id: &str,
        user_address: &str,
        amount_in_wei: &str,
        token_in: &str,
        token_out: &str,
    ) -> Result<(u64, String), String>;

    /// Log the outcome of a previously started execution.
    async fn log_execution_complete(
        &self,
        agent_id: &str,
        execution_id: u64,
        amount_out_wei: &str,
        success: bool,
    ) -> Result<String, String>;

    /// Log a redelegation from the manager's wallet. Returns the delegation
    /// hash assigned on chain together with the transaction hash.
    async fn log_redelegation(
        &self,
        child_agent_id: &str,
        user_address: &str,
        token_address: &str,
        amount_wei: &str,
        expires_at_ns: u64,
    ) -> Result<(String, String), String>;

    /// Submit an opaque signed delegation payload for redemption from the
    /// claiming specialist's wallet.
    async fn redeem_delegation(&self, agent_id: &str, payload_hex: &str)
        -> Result<String, String>;
}

#[derive(Debug)]
pub struct RegistryContractAdapter {
    rpc: RpcClient,
    registry_address: String,
    key_name: String,
}

impl RegistryContractAdapter {
    pub fn from_snapshot(snapshot: &RuntimeSnapshot) -> Result<Self, String> {
        let registry_address = snapshot
            .registry_address
            .as_deref()
            .ok_or_else(|| "registry address is not configured".to_string())?;
        if snapshot.ecdsa_key_name.is_empty() {
            return Err("ecdsa key name is not configured".to_string());
        }
        Ok(Self {
            rpc: RpcClient::from_snapshot(snapshot)?,
            registry_address: normalize_address(registry_address)?,
            key_name: snapshot.ecdsa_key_name.clone(),
        })
    }

    /// Broadcast `request` signed by `role`'s wallet and wait for the receipt.
    async fn submit_as(&self, role: WalletRole, request: &TxRequest) -> Result<ConfirmedTx, String> {
        let from_address = wallet_address_for_role(&role)?;
        let signer = ThresholdSigner::new(self.key_name.clone(), role);
        broadcast_and_confirm(&self.rpc, &signer, &from_address, request).await
    }
}

#[async_trait(?Send)]
impl RegistryPort for RegistryContractAdapter {
    async fn log_execution_start(
        &self,
        agent_id: &str,
        user_address: &str,
        amount_in_wei: &str,
        token_in: &str,
        token_out: &str,
    ) -> Result<(u64, String), String> {
        let calldata = encode_call(
            LOG_EXECUTION_START_SIGNATURE,
            &[
                AbiToken::Address(user_address.to_string()),
                AbiToken::Uint(parse_wei(amount_in_wei, "amount_in_wei")?),
                AbiToken::Address(token_in.to_string()),
                AbiToken::Address(token_out.to_string()),
            ],
        )?;
        let request = TxRequest::call(&self.registry_address, calldata);
        let confirmed = self
            .submit_as(WalletRole::Specialist(agent_id.to_string()), &request)
            .await?;
        let execution_id = execution_id_from_receipt(&confirmed.receipt)?;
        Ok((execution_id, confirmed.tx_hash))
    }

    async fn log_execution_complete(
        &self,
        agent_id: &str,
        execution_id: u64,
        amount_out_wei: &str,
        success: bool,
    ) -> Result<String, String> {
        let calldata = encode_call(
            LOG_EXECUTION_COMPLETE_SIGNATURE,
            &[
                AbiToken::Uint(U256::from(execution_id)),
                AbiToken::Uint(parse_wei(amount_out_wei, "amount_out_wei")?),
                AbiToken::Bool(success),
            ],
        )?;
        let request = TxRequest::call(&self.registry_address, calldata);
        let confirmed = self
            .submit_as(WalletRole::Specialist(agent_id.to_string()), &request)
            .await?;
        Ok(confirmed.tx_hash)
    }

    async fn log_redelegation(
        &self,
        child_agent_id: &str,
        user_address: &str,
        token_address: &str,
        amount_wei: &str,
        expires_at_ns: u64,
    ) -> Result<(String, String), String> {
        let child_address =
            wallet_address_for_role(&WalletRole::Specialist(child_agent_id.to_string()))?;
        let calldata = encode_call(
            LOG_REDELEGATION_SIGNATURE,
            &[
                AbiToken::Address(child_address),
                AbiToken::Address(user_address.to_string()),
                AbiToken::Address(token_address.to_string()),
                AbiToken::Uint(parse_wei(amount_wei, "amount_wei")?),
                // The registry stores expiry as unix seconds.
                AbiToken::Uint(U256::from(expires_at_ns / NANOS_PER_SEC)),
            ],
        )?;
        let request = TxRequest::call(&self.registry_address, calldata);
        let confirmed = self.submit_as(WalletRole::Manager, &request).await?;
        let delegation_hash = delegation_hash_from_receipt(&confirmed.receipt)?;
        Ok((delegation_hash, confirmed.tx_hash))
    }

    async fn redeem_delegation(
        &self,
        agent_id: &str,
        payload_hex: &str,
    ) -> Result<String, String> {
        let calldata = normalize_hex_blob(payload_hex, "delegation payload")
            .map_err(|error| format!("delegation payload is malformed: {error}"))?;
        // A redemption call carries at least a 4-byte function selector.
        if calldata.len() < 10 {
            return Err(
                "delegation payload is malformed: shorter than a function selector".to_string(),
            );
        }
        let request = TxRequest::call(&self.registry_address, calldata);
        let confirmed = self
            .submit_as(WalletRole::Specialist(agent_id.to_string()), &request)
            .await?;
        Ok(confirmed.tx_hash)
    }
}

/// Recording mock for dispatcher and executor tests. Calls are rendered to
/// strings for assertion; ids and hashes are deterministic counters.
#[allow(dead_code)]
pub struct MockRegistryAdapter {
    pub calls: RefCell<Vec<String>>,
    pub next_execution_id: Cell<u64>,
    pub redelegations_logged: Cell<u64>,
    /// When set, the next call consumes the error and fails with it.
    pub fail_next_with: RefCell<Option<String>>,
}

#[allow(dead_code)]
impl MockRegistryAdapter {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            next_execution_id: Cell::new(1),
            redelegations_logged: Cell::new(0),
            fail_next_with: RefCell::new(None),
        }
    }

    fn take_scripted_failure(&self) -> Option<String> {
        self.fail_next_with.borrow_mut().take()
    }

    fn mock_tx_hash(tag: u64, sequence: u64) -> String {
        format!("0x{tag:032x}{sequence:032x}")
    }
}

impl Default for MockRegistryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl RegistryPort for MockRegistryAdapter {
    async fn log_execution_start(
        &self,
        agent_id: &str,
        user_address: &str,
        amount_in_wei: &str,
        token_in: &str,
        token_out: &str,
    ) -> Result<(u64, String), String> {
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        let execution_id = self.next_execution_id.get();
        self.next_execution_id.set(execution_id + 1);
        self.calls.borrow_mut().push(format!(
            "start agent={agent_id} user={user_address} in={amount_in_wei} {token_in}->{token_out}"
        ));
        Ok((execution_id, Self::mock_tx_hash(0xe5, execution_id)))
    }

    async fn log_execution_complete(
        &self,
        agent_id: &str,
        execution_id: u64,
        amount_out_wei: &str,
        success: bool,
    ) -> Result<String, String> {
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        self.calls.borrow_mut().push(format!(
            "complete agent={agent_id} id={execution_id} out={amount_out_wei} success={success}"
        ));
        Ok(Self::mock_tx_hash(0xec, execution_id))
    }

    async fn log_redelegation(
        &self,
        child_agent_id: &str,
        user_address: &str,
        token_address: &str,
        amount_wei: &str,
        expires_at_ns: u64,
    ) -> Result<(String, String), String> {
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        let sequence = self.redelegations_logged.get() + 1;
        self.redelegations_logged.set(sequence);
        self.calls.borrow_mut().push(format!(
            "redelegate child={child_agent_id} user={user_address} token={token_address} \
             amount={amount_wei} expires={expires_at_ns}"
        ));
        let delegation_hash = format!("0x{:064x}", 0xd000_0000_0000u64 + sequence);
        Ok((delegation_hash, Self::mock_tx_hash(0xde, sequence)))
    }

    async fn redeem_delegation(
        &self,
        agent_id: &str,
        payload_hex: &str,
    ) -> Result<String, String> {
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        let sequence = self.calls.borrow().len() as u64 + 1;
        self.calls.borrow_mut().push(format!(
            "redeem agent={agent_id} payload_bytes={}",
            payload_hex.trim_start_matches("0x").len() / 2
        ));
        Ok(Self::mock_tx_hash(0xed, sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::stable;
    use crate::test_support::block_on_with_spin;

    fn registry_snapshot() -> RuntimeSnapshot {
        stable::init_storage();
        stable::set_rpc_url("https://rpc.example".to_string()).expect("rpc url should accept");
        stable::set_ecdsa_key_name("dfx_test_key".to_string()).expect("key name should accept");
        stable::set_registry_address("0x00000000000000000000000000000000000000aa".to_string())
            .expect("registry address should accept");
        stable::runtime_snapshot()
    }

    #[test]
    fn adapter_requires_a_registry_address() {
        stable::init_storage();
        stable::set_rpc_url("https://rpc.example".to_string()).expect("rpc url should accept");
        stable::set_ecdsa_key_name("dfx_test_key".to_string()).expect("key name should accept");
        let error = RegistryContractAdapter::from_snapshot(&stable::runtime_snapshot())
            .expect_err("missing registry address should be rejected");
        assert!(error.contains("registry address is not configured"), "got: {error}");
    }

    #[test]
    fn redemption_rejects_payloads_that_are_not_calldata() {
        let adapter = RegistryContractAdapter::from_snapshot(&registry_snapshot())
            .expect("adapter should build");

        for payload in ["deadbeef", "0xabc", "0x", "0xzz"] {
            let error = block_on_with_spin(adapter.redeem_delegation("specialist-alpha", payload))
                .expect_err("non-calldata payload should be rejected");
            assert!(
                error.contains("delegation payload is malformed"),
                "payload {payload} gave: {error}"
            );
        }
    }

    #[test]
    fn execution_start_fails_without_a_derived_specialist_wallet() {
        let adapter = RegistryContractAdapter::from_snapshot(&registry_snapshot())
            .expect("adapter should build");
        let error = block_on_with_spin(adapter.log_execution_start(
            "specialist-alpha",
            "0x2222222222222222222222222222222222222222",
            "1000000000000000000",
            "0x4444444444444444444444444444444444444444",
            "0x5555555555555555555555555555555555555555",
        ))
        .expect_err("signing role without a wallet should be rejected");
        assert!(error.contains("is not derived yet"), "got: {error}");
    }

    #[test]
    fn mock_registry_assigns_sequential_execution_ids() {
        let mock = MockRegistryAdapter::new();
        let (first, first_tx) = block_on_with_spin(mock.log_execution_start(
            "specialist-alpha",
            "0x2222222222222222222222222222222222222222",
            "1000",
            "0x4444444444444444444444444444444444444444",
            "0x5555555555555555555555555555555555555555",
        ))
        .expect("mock start should succeed");
        let (second, second_tx) = block_on_with_spin(mock.log_execution_start(
            "specialist-beta",
            "0x2222222222222222222222222222222222222222",
            "2000",
            "0x4444444444444444444444444444444444444444",
            "0x5555555555555555555555555555555555555555",
        ))
        .expect("mock start should succeed");

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_ne!(first_tx, second_tx);
        assert_eq!(mock.calls.borrow().len(), 2);
    }

    #[test]
    fn mock_registry_scripted_failure_fires_once() {
        let mock = MockRegistryAdapter::new();
        *mock.fail_next_with.borrow_mut() = Some("status 429 rate limited".to_string());

        let error = block_on_with_spin(mock.log_redelegation(
            "specialist-alpha",
            "0x2222222222222222222222222222222222222222",
            "0x4444444444444444444444444444444444444444",
            "1000",
            1_700_000_000_000_000_000,
        ))
        .expect_err("scripted failure should surface");
        assert!(error.contains("429"), "got: {error}");

        let (hash, _tx) = block_on_with_spin(mock.log_redelegation(
            "specialist-alpha",
            "0x2222222222222222222222222222222222222222",
            "0x4444444444444444444444444444444444444444",
            "1000",
            1_700_000_000_000_000_000,
        ))
        .expect("retry should succeed");
        assert!(hash.starts_with("0x"));
        assert_eq!(mock.redelegations_logged.get(), 1);
    }
}
