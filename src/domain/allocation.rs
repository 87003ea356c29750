use crate::domain::amount::{mul_bps, BPS_DENOMINATOR};
use crate::domain::types::SpecialistProfile;
use alloy_primitives::U256;

/// One specialist's share of a fan-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationShare {
    pub agent_id: String,
    pub wallet_address: String,
    pub amount_wei: U256,
}

/// Split `total` across the roster by allocation basis points.
///
/// Shares are floored; the final roster entry absorbs the rounding
/// remainder, so the shares always sum to exactly `total`.  The roster must
/// allocate exactly 10_000 bps; anything else is a configuration fault.
pub fn split_allocation(
    total: U256,
    roster: &[SpecialistProfile],
) -> Result<Vec<AllocationShare>, String> {
    if roster.is_empty() {
        return Err("specialist roster is empty".to_string());
    }
    let bps_sum: u64 = roster
        .iter()
        .map(|profile| u64::from(profile.allocation_bps))
        .sum();
    if bps_sum != BPS_DENOMINATOR {
        return Err(format!(
            "roster allocation must sum to {BPS_DENOMINATOR} bps, got {bps_sum}"
        ));
    }

    let mut shares = Vec::with_capacity(roster.len());
    let mut allocated = U256::ZERO;
    for (index, profile) in roster.iter().enumerate() {
        let amount = if index == roster.len() - 1 {
            total.saturating_sub(allocated)
        } else {
            mul_bps(total, profile.allocation_bps)
        };
        allocated = allocated.saturating_add(amount);
        shares.push(AllocationShare {
            agent_id: profile.agent_id.clone(),
            wallet_address: profile.wallet_address.clone(),
            amount_wei: amount,
        });
    }
    Ok(shares)
}

/// Clamp a candidate trade size between the configured floor and ceiling.
/// Returns `None` when the available amount is below the floor; such trades
/// are skipped without logging an execution.
pub fn clamp_trade_size(available: U256, floor: U256, ceiling: U256) -> Option<U256> {
    if available < floor {
        return None;
    }
    Some(available.min(ceiling))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<SpecialistProfile> {
        let template = |agent_id: &str, wallet: &str, bps: u32| SpecialistProfile {
            agent_id: agent_id.to_string(),
            wallet_address: wallet.to_string(),
            strategy: "momentum".to_string(),
            allocation_bps: bps,
            sim_win_rate_bps: 6_000,
            sim_profit_bps_min: 50,
            sim_profit_bps_max: 300,
            sim_loss_bps_min: 20,
            sim_loss_bps_max: 200,
        };
        vec![
            template("alpha", "0x00000000000000000000000000000000000000a1", 3_500),
            template("beta", "0x00000000000000000000000000000000000000b2", 2_500),
            template("gamma", "0x00000000000000000000000000000000000000c3", 2_500),
            template("delta", "0x00000000000000000000000000000000000000d4", 1_500),
        ]
    }

    #[test]
    fn thousand_units_split_without_remainder_loss() {
        let shares =
            split_allocation(U256::from(1_000u64), &roster()).expect("split should succeed");
        let amounts: Vec<u64> = shares
            .iter()
            .map(|share| share.amount_wei.to::<u64>())
            .collect();
        assert_eq!(amounts, vec![350, 250, 250, 150]);
    }

    #[test]
    fn final_specialist_absorbs_the_rounding_remainder() {
        let shares =
            split_allocation(U256::from(1_001u64), &roster()).expect("split should succeed");
        let amounts: Vec<u64> = shares
            .iter()
            .map(|share| share.amount_wei.to::<u64>())
            .collect();
        assert_eq!(amounts, vec![350, 250, 250, 151]);
        assert_eq!(amounts.iter().sum::<u64>(), 1_001);
    }

    #[test]
    fn tiny_totals_still_sum_exactly() {
        let shares = split_allocation(U256::from(3u64), &roster()).expect("split should succeed");
        let total: u64 = shares.iter().map(|share| share.amount_wei.to::<u64>()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn rejects_roster_not_summing_to_full_allocation() {
        let mut short = roster();
        short.pop();
        let error = split_allocation(U256::from(1_000u64), &short)
            .expect_err("partial roster should be rejected");
        assert!(error.contains("must sum to 10000"));
    }

    #[test]
    fn rejects_empty_roster() {
        assert!(split_allocation(U256::from(1_000u64), &[]).is_err());
    }

    #[test]
    fn trade_size_clamps_between_floor_and_ceiling() {
        let floor = U256::from(10u64);
        let ceiling = U256::from(100u64);
        assert_eq!(clamp_trade_size(U256::from(5u64), floor, ceiling), None);
        assert_eq!(
            clamp_trade_size(U256::from(50u64), floor, ceiling),
            Some(U256::from(50u64))
        );
        assert_eq!(
            clamp_trade_size(U256::from(500u64), floor, ceiling),
            Some(U256::from(100u64))
        );
    }
}
