//! Adapter for the reputation oracle contract.
//!
//! The oracle holds the authoritative on-chain copy of agent reputation.
//! Reads go through `eth_call`; batch score pushes are transactions signed
//! with the manager wallet, which must be registered on the contract's
//! updater allowlist.

use crate::chain::abi::{decode_bool_result, decode_u256_result, encode_call, AbiToken};
use crate::chain::rpc::{normalize_address, RpcClient};
use crate::chain::signer::{wallet_address_for_role, ThresholdSigner};
use crate::chain::tx::{broadcast_and_confirm, TxRequest};
use crate::domain::types::{RuntimeSnapshot, WalletRole};
use alloy_primitives::U256;
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

const IS_AUTHORIZED_UPDATER_SIGNATURE: &str = "isAuthorizedUpdater(address)";
const GET_REPUTATION_SIGNATURE: &str = "getReputation(address)";
const UPDATE_REPUTATION_BATCH_SIGNATURE: &str = "updateReputationBatch(address[],uint256[])";

#[async_trait(?Send)]
pub trait OraclePort {
    /// Whether `pusher_address` is on the contract's updater allowlist.
    async fn is_authorized_updater(&self, pusher_address: &str) -> Result<bool, String>;

    /// Current on-chain score for one agent wallet. Unknown agents read as 0.
    async fn reputation_of(&self, agent_address: &str) -> Result<u64, String>;

    /// Push one batch of `(agent wallet, score)` pairs from the manager
    /// wallet. Returns the transaction hash of the confirmed update.
    async fn push_reputation_batch(&self, entries: &[(String, u64)]) -> Result<String, String>;
}

#[derive(Debug)]
pub struct OracleContractAdapter {
    rpc: RpcClient,
    oracle_address: String,
    key_name: String,
}

impl OracleContractAdapter {
    pub fn from_snapshot(snapshot: &RuntimeSnapshot) -> Result<Self, String> {
        let oracle_address = snapshot
            .oracle_address
            .as_deref()
            .ok_or_else(|| "oracle address is not configured".to_string())?;
        if snapshot.ecdsa_key_name.is_empty() {
            return Err("ecdsa key name is not configured".to_string());
        }
        Ok(Self {
            rpc: RpcClient::from_snapshot(snapshot)?,
            oracle_address: normalize_address(oracle_address)?,
            key_name: snapshot.ecdsa_key_name.clone(),
        })
    }
}

#[async_trait(?Send)]
impl OraclePort for OracleContractAdapter {
    async fn is_authorized_updater(&self, pusher_address: &str) -> Result<bool, String> {
        let calldata = encode_call(
            IS_AUTHORIZED_UPDATER_SIGNATURE,
            &[AbiToken::Address(pusher_address.to_string())],
        )?;
        let raw = self.rpc.eth_call(&self.oracle_address, &calldata).await?;
        decode_bool_result(&raw, "isAuthorizedUpdater")
    }

    async fn reputation_of(&self, agent_address: &str) -> Result<u64, String> {
        let calldata = encode_call(
            GET_REPUTATION_SIGNATURE,
            &[AbiToken::Address(agent_address.to_string())],
        )?;
        let raw = self.rpc.eth_call(&self.oracle_address, &calldata).await?;
        let score = decode_u256_result(&raw, "getReputation")?;
        u64::try_from(score).map_err(|_| "getReputation returned a value above u64".to_string())
    }

    async fn push_reputation_batch(&self, entries: &[(String, u64)]) -> Result<String, String> {
        if entries.is_empty() {
            return Err("reputation batch cannot be empty".to_string());
        }
        let addresses = entries
            .iter()
            .map(|(address, _)| address.clone())
            .collect::<Vec<_>>();
        let scores = entries
            .iter()
            .map(|(_, score)| U256::from(*score))
            .collect::<Vec<_>>();
        let calldata = encode_call(
            UPDATE_REPUTATION_BATCH_SIGNATURE,
            &[
                AbiToken::AddressArray(addresses),
                AbiToken::UintArray(scores),
            ],
        )?;
        let request = TxRequest::call(&self.oracle_address, calldata);
        let from_address = wallet_address_for_role(&WalletRole::Manager)?;
        let signer = ThresholdSigner::new(self.key_name.clone(), WalletRole::Manager);
        let confirmed = broadcast_and_confirm(&self.rpc, &signer, &from_address, &request).await?;
        Ok(confirmed.tx_hash)
    }
}

/// In-memory oracle for sync tests: an updater flag, a score table, and a
/// record of every pushed batch.
/// `fail_next_with` fails the next call of any kind; `fail_push_with` fails
/// only the next batch push, letting the auth and score reads succeed.
#[allow(dead_code)]
pub struct MockOracleAdapter {
    pub authorized: Cell<bool>,
    pub scores: RefCell<BTreeMap<String, u64>>,
    pub batches: RefCell<Vec<Vec<(String, u64)>>>,
    pub fail_next_with: RefCell<Option<String>>,
    pub fail_push_with: RefCell<Option<String>>,
}

#[allow(dead_code)]
impl MockOracleAdapter {
    pub fn new(authorized: bool) -> Self {
        Self {
            authorized: Cell::new(authorized),
            scores: RefCell::new(BTreeMap::new()),
            batches: RefCell::new(Vec::new()),
            fail_next_with: RefCell::new(None),
            fail_push_with: RefCell::new(None),
        }
    }

    fn take_scripted_failure(&self) -> Option<String> {
        self.fail_next_with.borrow_mut().take()
    }
}

#[async_trait(?Send)]
impl OraclePort for MockOracleAdapter {
    async fn is_authorized_updater(&self, _pusher_address: &str) -> Result<bool, String> {
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        Ok(self.authorized.get())
    }

    async fn reputation_of(&self, agent_address: &str) -> Result<u64, String> {
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        Ok(self
            .scores
            .borrow()
            .get(&agent_address.to_ascii_lowercase())
            .copied()
            .unwrap_or(0))
    }

    async fn push_reputation_batch(&self, entries: &[(String, u64)]) -> Result<String, String> {
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        if let Some(error) = self.fail_push_with.borrow_mut().take() {
            return Err(error);
        }
        let mut scores = self.scores.borrow_mut();
        for (address, score) in entries {
            scores.insert(address.to_ascii_lowercase(), *score);
        }
        let mut batches = self.batches.borrow_mut();
        batches.push(entries.to_vec());
        Ok(format!("0x{:064x}", 0xacc0u64 + batches.len() as u64))
    }
}
