//! Cycle affordability checks for paid platform operations.
//!
//! Every chain interaction burns cycles before it can fail: HTTPS outcalls
//! are charged up front and threshold signatures are metered by the signing
//! subnet. Callers ask this module whether the canister can cover the
//! estimated cost plus a proportional safety margin without eating into the
//! long-term reserve floor that keeps the scheduler alive.

/// A cycle-metered operation the chain layer is about to perform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaidOperation {
    RpcOutcall {
        request_bytes: u64,
        response_bytes: u64,
    },
    ThresholdSignature {
        key_name: String,
        curve: u32,
    },
    /// A pre-computed cost envelope, used when the caller has already summed
    /// the parts of a multi-step workflow.
    FixedEnvelope { cycles: u128 },
}

/// The cycle bill for one operation, broken out so callers can log it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleDemand {
    pub estimated_cycles: u128,
    pub margin_bps: u32,
    pub margin_cycles: u128,
    pub reserve_floor_cycles: u128,
    pub required_cycles: u128,
}

pub const SAFETY_MARGIN_BPS: u32 = 2_500;
pub const RESERVE_FLOOR_CYCLES: u128 = 200_000_000_000;

// Non-replicated outcalls are priced for a 13-node subnet.
const REFERENCE_SUBNET_SIZE: u128 = 13;

pub fn estimate_cost(operation: &PaidOperation) -> Result<u128, String> {
    match operation {
        PaidOperation::RpcOutcall {
            request_bytes,
            response_bytes,
        } => Ok(outcall_cost(*request_bytes, *response_bytes)),
        PaidOperation::ThresholdSignature { key_name, curve } => {
            threshold_signature_cost(key_name, *curve)
        }
        PaidOperation::FixedEnvelope { cycles } => Ok(*cycles),
    }
}

/// Combined envelope for a sign-then-broadcast step: one threshold
/// signature plus the `eth_sendRawTransaction` outcall that follows it.
pub fn estimate_signed_broadcast_cost(
    key_name: &str,
    curve: u32,
    request_bytes: u64,
    response_bytes: u64,
) -> Result<u128, String> {
    let sign_cycles = threshold_signature_cost(key_name, curve)?;
    Ok(sign_cycles.saturating_add(outcall_cost(request_bytes, response_bytes)))
}

pub fn demand_for(
    estimated_cycles: u128,
    margin_bps: u32,
    reserve_floor_cycles: u128,
) -> CycleDemand {
    let margin_bps = margin_bps.min(10_000);
    let margin_cycles = estimated_cycles.saturating_mul(u128::from(margin_bps)) / 10_000;
    CycleDemand {
        estimated_cycles,
        margin_bps,
        margin_cycles,
        reserve_floor_cycles,
        required_cycles: estimated_cycles
            .saturating_add(margin_cycles)
            .saturating_add(reserve_floor_cycles),
    }
}

pub fn is_covered(liquid_cycles: u128, demand: &CycleDemand) -> bool {
    liquid_cycles >= demand.required_cycles
}

/// Coverage check against a total balance: the reserve floor is carved out
/// first, then the remainder must cover the operation plus margin.
pub fn covers_above_floor(
    total_cycles: u128,
    operation: &PaidOperation,
    margin_bps: u32,
    reserve_floor_cycles: u128,
) -> Result<bool, String> {
    let liquid = total_cycles.saturating_sub(reserve_floor_cycles);
    let demand = demand_for(estimate_cost(operation)?, margin_bps, 0);
    Ok(is_covered(liquid, &demand))
}

#[cfg(target_arch = "wasm32")]
fn outcall_cost(request_bytes: u64, response_bytes: u64) -> u128 {
    ic_cdk::api::cost_http_request(request_bytes, response_bytes)
}

// Host-side mirror of the replica's non-replicated outcall pricing, so unit
// tests exercise the same admission arithmetic the canister runs.
#[cfg(not(target_arch = "wasm32"))]
fn outcall_cost(request_bytes: u64, response_bytes: u64) -> u128 {
    let byte_fee = 400u128
        .saturating_mul(u128::from(request_bytes))
        .saturating_add(800u128.saturating_mul(u128::from(response_bytes)));
    let base_fee = 3_000_000u128 + 60_000u128.saturating_mul(REFERENCE_SUBNET_SIZE);
    REFERENCE_SUBNET_SIZE.saturating_mul(base_fee.saturating_add(byte_fee))
}

#[cfg(target_arch = "wasm32")]
fn threshold_signature_cost(key_name: &str, curve: u32) -> Result<u128, String> {
    ic_cdk::api::cost_sign_with_ecdsa(key_name, curve).map_err(|error| {
        format!("failed to estimate threshold signature cost with key_name={key_name}, curve={curve}: {error}")
    })
}

#[cfg(not(target_arch = "wasm32"))]
fn threshold_signature_cost(key_name: &str, _curve: u32) -> Result<u128, String> {
    if key_name.trim().is_empty() {
        return Err("threshold signature key_name cannot be empty".to_string());
    }
    Ok(26_153_846_153)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_and_floor_inflate_the_required_cycles() {
        let demand = demand_for(100, 2_500, 10);
        assert_eq!(demand.margin_cycles, 25);
        assert_eq!(demand.required_cycles, 135);
        assert!(is_covered(135, &demand));
        assert!(!is_covered(134, &demand));
    }

    #[test]
    fn a_zero_margin_demand_is_estimate_plus_floor() {
        let demand = demand_for(200, 0, 50);
        assert_eq!(demand.required_cycles, 250);
        assert!(is_covered(250, &demand));
        assert!(!is_covered(249, &demand));
    }

    #[test]
    fn margin_bps_clamps_at_one_whole_estimate() {
        let demand = demand_for(100, 12_000, 0);
        assert_eq!(demand.margin_bps, 10_000);
        assert_eq!(demand.margin_cycles, 100);
        assert_eq!(demand.required_cycles, 200);
    }

    #[test]
    fn fixed_envelopes_pass_their_cost_through() {
        let estimate = estimate_cost(&PaidOperation::FixedEnvelope { cycles: 42_000 })
            .expect("fixed envelope should estimate");
        assert_eq!(estimate, 42_000);
    }

    #[test]
    fn the_floor_is_carved_out_of_the_total_before_coverage() {
        let operation = PaidOperation::FixedEnvelope { cycles: 10 };
        let covered = covers_above_floor(55, &operation, 0, 50)
            .expect("floor-aware coverage should evaluate");
        assert!(!covered);

        let covered = covers_above_floor(60, &operation, 0, 50)
            .expect("floor-aware coverage should evaluate");
        assert!(covered);
    }

    #[test]
    fn a_blank_signing_key_fails_estimation_on_the_host() {
        let error = estimate_cost(&PaidOperation::ThresholdSignature {
            key_name: "".to_string(),
            curve: 0,
        })
        .expect_err("empty key should be invalid");
        assert!(error.contains("key_name cannot be empty"));
    }

    #[test]
    fn host_outcall_estimates_follow_replica_pricing() {
        let estimate = estimate_cost(&PaidOperation::RpcOutcall {
            request_bytes: 2_048,
            response_bytes: 16_000,
        })
        .expect("host estimate should be computable");

        let byte_fee = 400u128 * 2_048 + 800u128 * 16_000;
        let base_fee = 3_000_000u128 + 60_000u128 * REFERENCE_SUBNET_SIZE;
        assert_eq!(
            estimate,
            REFERENCE_SUBNET_SIZE * (base_fee + byte_fee)
        );
    }

    #[test]
    fn signed_broadcast_estimates_sum_signature_and_outcall() {
        let combined = estimate_signed_broadcast_cost("dfx_test_key", 0, 1_024, 8_192)
            .expect("broadcast estimate should be computable");
        let sign_only = estimate_cost(&PaidOperation::ThresholdSignature {
            key_name: "dfx_test_key".to_string(),
            curve: 0,
        })
        .expect("signature estimate should be computable");
        let outcall_only = estimate_cost(&PaidOperation::RpcOutcall {
            request_bytes: 1_024,
            response_bytes: 8_192,
        })
        .expect("outcall estimate should be computable");
        assert_eq!(combined, sign_only + outcall_only);
    }
}
