//! Settlement transfer execution.
//!
//! Settlement legs move value between the role wallets, the delegating user,
//! and the treasury. A leg naming a token rides that token's ERC-20
//! `transfer` and checks the sender's `balanceOf` before broadcasting; a leg
//! without one moves native value. Either way the sending wallet is addressed
//! by role and signs with its threshold-key derivation.

use crate::chain::abi::{decode_u256_result, encode_call, AbiToken};
use crate::chain::rpc::RpcClient;
use crate::chain::signer::{wallet_address_for_role, ThresholdSigner};
use crate::chain::tx::{broadcast_and_confirm, TxRequest};
use crate::domain::amount::parse_wei;
use crate::domain::types::{RuntimeSnapshot, WalletRole};
use alloy_primitives::U256;
use async_trait::async_trait;
use std::cell::{Cell, RefCell};

const ERC20_TRANSFER_SIGNATURE: &str = "transfer(address,uint256)";
const ERC20_BALANCE_OF_SIGNATURE: &str = "balanceOf(address)";

#[async_trait(?Send)]
pub trait TransferPort {
    /// Execute one transfer and return its transaction hash.
    async fn transfer(
        &self,
        from_role: &WalletRole,
        to_address: &str,
        token_address: Option<&str>,
        amount_wei: &str,
    ) -> Result<String, String>;
}

#[derive(Debug)]
pub struct ChainTransferAdapter {
    rpc: RpcClient,
    key_name: String,
}

impl ChainTransferAdapter {
    pub fn from_snapshot(snapshot: &RuntimeSnapshot) -> Result<Self, String> {
        if snapshot.ecdsa_key_name.is_empty() {
            return Err("ecdsa key name is not configured".to_string());
        }
        Ok(Self {
            rpc: RpcClient::from_snapshot(snapshot)?,
            key_name: snapshot.ecdsa_key_name.clone(),
        })
    }

    async fn token_balance(&self, token_address: &str, holder: &str) -> Result<U256, String> {
        let raw = self
            .rpc
            .eth_call(token_address, &erc20_balance_of_calldata(holder)?)
            .await?;
        decode_u256_result(&raw, "balanceOf result")
    }
}

pub(crate) fn erc20_transfer_calldata(
    to_address: &str,
    amount_wei: &str,
) -> Result<String, String> {
    encode_call(
        ERC20_TRANSFER_SIGNATURE,
        &[
            AbiToken::Address(to_address.to_string()),
            AbiToken::Uint(parse_wei(amount_wei, "amount_wei")?),
        ],
    )
}

pub(crate) fn erc20_balance_of_calldata(holder: &str) -> Result<String, String> {
    encode_call(
        ERC20_BALANCE_OF_SIGNATURE,
        &[AbiToken::Address(holder.to_string())],
    )
}

#[async_trait(?Send)]
impl TransferPort for ChainTransferAdapter {
    async fn transfer(
        &self,
        from_role: &WalletRole,
        to_address: &str,
        token_address: Option<&str>,
        amount_wei: &str,
    ) -> Result<String, String> {
        let from_address = wallet_address_for_role(from_role)?;
        let request = match token_address {
            Some(token) => {
                let amount = parse_wei(amount_wei, "amount_wei")?;
                let balance = self.token_balance(token, &from_address).await?;
                if balance < amount {
                    return Err(format!(
                        "insufficient token balance for transfer: balance={balance} amount={amount}"
                    ));
                }
                TxRequest::call(token, erc20_transfer_calldata(to_address, amount_wei)?)
            }
            None => TxRequest::native_transfer(to_address, parse_wei(amount_wei, "amount_wei")?),
        };
        let signer = ThresholdSigner::new(self.key_name.clone(), from_role.clone());
        let confirmed = broadcast_and_confirm(&self.rpc, &signer, &from_address, &request).await?;
        Ok(confirmed.tx_hash)
    }
}

#[allow(dead_code)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedTransfer {
    pub from_role: WalletRole,
    pub to_address: String,
    pub token_address: Option<String>,
    pub amount_wei: String,
}

/// Recording transfer mock. `fail_call_with` makes the Nth attempt
/// (zero-based) fail, which is how settlement abort paths are exercised.
#[allow(dead_code)]
pub struct MockTransferAdapter {
    pub transfers: RefCell<Vec<RecordedTransfer>>,
    pub attempts: Cell<usize>,
    pub fail_call_with: RefCell<Option<(usize, String)>>,
}

#[allow(dead_code)]
impl MockTransferAdapter {
    pub fn new() -> Self {
        Self {
            transfers: RefCell::new(Vec::new()),
            attempts: Cell::new(0),
            fail_call_with: RefCell::new(None),
        }
    }

    pub fn failing_on(call_index: usize, error: &str) -> Self {
        let mock = Self::new();
        *mock.fail_call_with.borrow_mut() = Some((call_index, error.to_string()));
        mock
    }
}

impl Default for MockTransferAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TransferPort for MockTransferAdapter {
    async fn transfer(
        &self,
        from_role: &WalletRole,
        to_address: &str,
        token_address: Option<&str>,
        amount_wei: &str,
    ) -> Result<String, String> {
        let attempt = self.attempts.get();
        self.attempts.set(attempt + 1);
        if let Some((index, error)) = self.fail_call_with.borrow().as_ref() {
            if *index == attempt {
                return Err(error.clone());
            }
        }
        self.transfers.borrow_mut().push(RecordedTransfer {
            from_role: from_role.clone(),
            to_address: to_address.to_string(),
            token_address: token_address.map(str::to_string),
            amount_wei: amount_wei.to_string(),
        });
        Ok(format!("0x{:064x}", 0xba00u64 + attempt as u64))
    }
}
