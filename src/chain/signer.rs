//! Threshold ECDSA signing with per-role key derivation.
//!
//! The canister controls three kinds of EVM identity from one subnet key:
//! the fund manager, the treasury, and one wallet per roster specialist.
//! Each maps to its own BIP-32 derivation path, so `sign_with_ecdsa` and
//! `ecdsa_public_key` always agree on which address a signature belongs to.
//!
//! On non-wasm32 targets the signer produces a deterministic mock signature
//! and mock addresses derived from the key name and role, so the signing
//! path is testable without an IC replica.

use crate::domain::types::WalletRole;
use crate::storage::stable;
use async_trait::async_trait;
use sha3::{Digest, Keccak256};

#[cfg(target_arch = "wasm32")]
use crate::domain::cycle_admission::{
    demand_for, estimate_cost, is_covered, PaidOperation, RESERVE_FLOOR_CYCLES, SAFETY_MARGIN_BPS,
};
#[cfg(target_arch = "wasm32")]
use ic_cdk::management_canister::{
    ecdsa_public_key, sign_with_ecdsa, EcdsaCurve, EcdsaKeyId, EcdsaPublicKeyArgs,
    SignWithEcdsaArgs,
};

#[async_trait(?Send)]
pub trait SignerPort {
    /// Sign a 32-byte digest, passed as 0x-prefixed hex. Returns the compact
    /// 64-byte signature (r || s) as a 0x-prefixed hex string.
    async fn sign_message(&self, message_hash: &str) -> Result<String, String>;
}

/// Derivation path for a wallet role. The same path feeds both
/// `ecdsa_public_key` and `sign_with_ecdsa` so the derived address and the
/// signing key never diverge.
pub fn derivation_path(role: &WalletRole) -> Vec<Vec<u8>> {
    match role {
        WalletRole::Manager => vec![b"manager".to_vec()],
        WalletRole::Treasury => vec![b"treasury".to_vec()],
        WalletRole::Specialist(agent_id) => {
            vec![b"specialist".to_vec(), agent_id.as_bytes().to_vec()]
        }
    }
}

/// Production `SignerPort` backed by IC threshold ECDSA, bound to one role.
#[derive(Clone, Debug)]
pub struct ThresholdSigner {
    key_name: String,
    role: WalletRole,
}

impl ThresholdSigner {
    pub fn new(key_name: String, role: WalletRole) -> Self {
        Self { key_name, role }
    }
}

#[async_trait(?Send)]
impl SignerPort for ThresholdSigner {
    async fn sign_message(&self, message_hash: &str) -> Result<String, String> {
        wallet_address_for_role(&self.role)?;
        let parsed_hash = parse_message_hash(message_hash)?;

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = &self.key_name;
            let mut mock_signature = vec![0u8; 64];
            mock_signature[..32].copy_from_slice(&parsed_hash);
            return Ok(format!("0x{}", hex::encode(mock_signature)));
        }

        #[cfg(target_arch = "wasm32")]
        {
            let operation = PaidOperation::ThresholdSignature {
                key_name: self.key_name.clone(),
                curve: u32::from(EcdsaCurve::Secp256k1),
            };
            let demand = demand_for(
                estimate_cost(&operation)?,
                SAFETY_MARGIN_BPS,
                RESERVE_FLOOR_CYCLES,
            );
            let liquid = ic_cdk::api::canister_liquid_cycle_balance();
            if !is_covered(liquid, &demand) {
                return Err(format!(
                    "insufficient cycles for threshold sign: need {} liquid, have {}",
                    demand.required_cycles, liquid
                ));
            }

            let response = sign_with_ecdsa(&SignWithEcdsaArgs {
                message_hash: parsed_hash.to_vec(),
                derivation_path: derivation_path(&self.role),
                key_id: EcdsaKeyId {
                    curve: EcdsaCurve::Secp256k1,
                    name: self.key_name.clone(),
                },
            })
            .await
            .map_err(|error| format!("sign_with_ecdsa failed: {error}"))?;

            Ok(format!("0x{}", hex::encode(response.signature)))
        }
    }
}

/// Mock signer for pipeline tests: the compact signature is the digest
/// repeated, which round-trips through the signature parser.
#[allow(dead_code)]
pub struct MockSigner;

#[async_trait(?Send)]
impl SignerPort for MockSigner {
    async fn sign_message(&self, message_hash: &str) -> Result<String, String> {
        let parsed_hash = parse_message_hash(message_hash)?;
        let mut signature = vec![0u8; 64];
        signature[..32].copy_from_slice(&parsed_hash);
        signature[32..].copy_from_slice(&parsed_hash);
        Ok(format!("0x{}", hex::encode(signature)))
    }
}

// ── Address derivation ───────────────────────────────────────────────────────

/// Resolve the cached EVM address for a role, failing if the derivation
/// pass has not run yet.
pub fn wallet_address_for_role(role: &WalletRole) -> Result<String, String> {
    let snapshot = stable::runtime_snapshot();
    match role {
        WalletRole::Manager => snapshot
            .manager_address
            .clone()
            .ok_or_else(|| "manager wallet address is not derived yet".to_string()),
        WalletRole::Treasury => snapshot
            .treasury_address
            .clone()
            .ok_or_else(|| "treasury wallet address is not derived yet".to_string()),
        WalletRole::Specialist(agent_id) => snapshot
            .roster
            .iter()
            .find(|profile| profile.agent_id == *agent_id)
            .map(|profile| profile.wallet_address.clone())
            .filter(|address| !address.trim().is_empty())
            .ok_or_else(|| format!("specialist {agent_id} wallet address is not derived yet")),
    }
}

/// Derive the EVM address for one role.
///
/// - wasm32: `ecdsa_public_key` with the role's derivation path, then
///   Keccak256(uncompressed_pubkey[1..])[12..].
/// - non-wasm32: a deterministic digest of the key name and path, so tests
///   get stable, role-distinct addresses.
pub async fn derive_wallet_address(key_name: &str, role: &WalletRole) -> Result<String, String> {
    if key_name.trim().is_empty() {
        return Err("ecdsa key name cannot be empty".to_string());
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        let mut hasher = Keccak256::new();
        hasher.update(key_name.as_bytes());
        for component in derivation_path(role) {
            hasher.update(&component);
        }
        let digest = hasher.finalize();
        Ok(format!("0x{}", hex::encode(&digest[12..32])))
    }

    #[cfg(target_arch = "wasm32")]
    {
        let response = ecdsa_public_key(&EcdsaPublicKeyArgs {
            canister_id: None,
            derivation_path: derivation_path(role),
            key_id: EcdsaKeyId {
                curve: EcdsaCurve::Secp256k1,
                name: key_name.to_string(),
            },
        })
        .await
        .map_err(|error| format!("ecdsa_public_key failed: {error}"))?;

        ethereum_address_from_sec1_public_key(&response.public_key)
    }
}

/// Derive and cache every role address: manager, treasury, and one per
/// roster specialist. Runs at `init`/`post_upgrade` so addresses are
/// available synchronously to later jobs.
pub async fn derive_and_cache_wallet_addresses(key_name: &str) -> Result<(), String> {
    let manager = derive_wallet_address(key_name, &WalletRole::Manager).await?;
    let treasury = derive_wallet_address(key_name, &WalletRole::Treasury).await?;
    stable::set_wallet_addresses(manager, treasury);

    let roster = stable::runtime_snapshot().roster;
    for profile in roster {
        let role = WalletRole::Specialist(profile.agent_id.clone());
        let address = derive_wallet_address(key_name, &role).await?;
        stable::set_roster_wallet_address(&profile.agent_id, address)?;
    }
    Ok(())
}

fn parse_message_hash(raw: &str) -> Result<[u8; 32], String> {
    let hash = raw.trim();
    let without_prefix = hash
        .strip_prefix("0x")
        .or_else(|| hash.strip_prefix("0X"))
        .ok_or_else(|| "message_hash must be 0x-prefixed hex".to_string())?;
    if without_prefix.len() != 64 {
        return Err("message_hash must be exactly 32 bytes".to_string());
    }

    let mut out = [0u8; 32];
    hex::decode_to_slice(without_prefix, &mut out)
        .map_err(|error| format!("message_hash is not valid hex: {error}"))?;
    Ok(out)
}

#[cfg(target_arch = "wasm32")]
fn ethereum_address_from_sec1_public_key(sec1: &[u8]) -> Result<String, String> {
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use k256::PublicKey;

    let public_key = PublicKey::from_sec1_bytes(sec1)
        .map_err(|error| format!("invalid sec1 public key from ecdsa_public_key: {error}"))?;
    let uncompressed = public_key.to_encoded_point(false);
    let bytes = uncompressed.as_bytes();
    if bytes.len() != 65 || bytes.first().copied() != Some(0x04) {
        return Err("unexpected uncompressed public key format".to_string());
    }

    let digest = Keccak256::digest(&bytes[1..]);
    Ok(format!("0x{}", hex::encode(&digest[12..32])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SpecialistProfile;
    use crate::test_support::block_on_with_spin;

    fn sample_roster() -> Vec<SpecialistProfile> {
        vec![
            SpecialistProfile {
                agent_id: "specialist-alpha".to_string(),
                wallet_address: String::new(),
                strategy: "momentum".to_string(),
                allocation_bps: 3500,
                sim_win_rate_bps: 6000,
                sim_profit_bps_min: 10,
                sim_profit_bps_max: 300,
                sim_loss_bps_min: 10,
                sim_loss_bps_max: 200,
            },
            SpecialistProfile {
                agent_id: "specialist-beta".to_string(),
                wallet_address: String::new(),
                strategy: "arbitrage".to_string(),
                allocation_bps: 6500,
                sim_win_rate_bps: 5500,
                sim_profit_bps_min: 5,
                sim_profit_bps_max: 150,
                sim_loss_bps_min: 5,
                sim_loss_bps_max: 100,
            },
        ]
    }

    #[test]
    fn parse_message_hash_requires_prefixed_32_byte_hex() {
        assert!(parse_message_hash("deadbeef").is_err());
        assert!(parse_message_hash("0xdeadbeef").is_err());
        assert!(parse_message_hash(
            "0xzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
        )
        .is_err());
        assert!(parse_message_hash(
            "0x1111111111111111111111111111111111111111111111111111111111111111"
        )
        .is_ok());
    }

    #[test]
    fn derivation_paths_are_distinct_per_role() {
        let manager = derivation_path(&WalletRole::Manager);
        let treasury = derivation_path(&WalletRole::Treasury);
        let alpha = derivation_path(&WalletRole::Specialist("specialist-alpha".to_string()));
        let beta = derivation_path(&WalletRole::Specialist("specialist-beta".to_string()));

        assert_ne!(manager, treasury);
        assert_ne!(alpha, beta);
        assert_eq!(alpha[0], b"specialist".to_vec());
        assert_eq!(alpha[1], b"specialist-alpha".to_vec());
    }

    #[test]
    fn host_derivation_is_deterministic_and_role_distinct() {
        let manager_one =
            block_on_with_spin(derive_wallet_address("dfx_test_key", &WalletRole::Manager))
                .expect("manager derivation should succeed");
        let manager_two =
            block_on_with_spin(derive_wallet_address("dfx_test_key", &WalletRole::Manager))
                .expect("manager derivation should repeat");
        let treasury =
            block_on_with_spin(derive_wallet_address("dfx_test_key", &WalletRole::Treasury))
                .expect("treasury derivation should succeed");

        assert_eq!(manager_one, manager_two);
        assert_ne!(manager_one, treasury);
        assert_eq!(manager_one.len(), 42);
        assert!(manager_one.starts_with("0x"));
    }

    #[test]
    fn derive_and_cache_fills_manager_treasury_and_roster_wallets() {
        stable::init_storage();
        stable::set_roster(sample_roster()).expect("roster should be accepted");

        block_on_with_spin(derive_and_cache_wallet_addresses("dfx_test_key"))
            .expect("derivation pass should succeed");

        let snapshot = stable::runtime_snapshot();
        assert!(snapshot.manager_address.is_some());
        assert!(snapshot.treasury_address.is_some());
        for profile in &snapshot.roster {
            assert!(
                profile.wallet_address.starts_with("0x"),
                "wallet for {} should be derived",
                profile.agent_id
            );
        }

        let alpha = wallet_address_for_role(&WalletRole::Specialist(
            "specialist-alpha".to_string(),
        ))
        .expect("derived specialist address should resolve");
        assert_eq!(alpha, snapshot.roster[0].wallet_address);
    }

    #[test]
    fn signing_is_rejected_until_the_role_address_is_derived() {
        stable::init_storage();
        let signer = ThresholdSigner::new("dfx_test_key".to_string(), WalletRole::Manager);
        let error = block_on_with_spin(signer.sign_message(
            "0x1111111111111111111111111111111111111111111111111111111111111111",
        ))
        .expect_err("signing before derivation should fail");
        assert!(error.contains("not derived yet"), "got: {error}");
    }

    #[test]
    fn host_signature_embeds_the_digest() {
        stable::init_storage();
        stable::set_wallet_addresses(
            "0x1111111111111111111111111111111111111111".to_string(),
            "0x2222222222222222222222222222222222222222".to_string(),
        );

        let signer = ThresholdSigner::new("dfx_test_key".to_string(), WalletRole::Manager);
        let digest = format!("0x{}", "ab".repeat(32));
        let signature =
            block_on_with_spin(signer.sign_message(&digest)).expect("mock signing should succeed");

        assert_eq!(signature.len(), 2 + 128);
        assert!(signature.starts_with("0xabababab"));
        assert!(signature.ends_with(&"00".repeat(32)));
    }
}
