//! Post-execution settlement.
//!
//! Settlement reconciles a completed execution's funds between the
//! specialist wallet, the delegating user, and the treasury. Planning is
//! pure and total over the execution record; execution walks the planned
//! legs through the transfer port one at a time, each awaited to
//! confirmation before the next is submitted. A failed leg aborts the
//! remainder and the report carries both the error and the legs that did
//! land, since there is no compensating rollback for value already moved.

use crate::chain::bank::TransferPort;
use crate::domain::amount::{parse_signed_wei, parse_wei};
use crate::domain::types::{
    CompletedLeg, Execution, ExecutionResult, SettlementKind, SettlementLeg, SettlementReport,
    WalletRole,
};
use alloy_primitives::U256;
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};

#[derive(Clone, Copy, Debug, LogPriorityLevels)]
enum SettlementLogPriority {
    #[log_level(capacity = 1000, name = "SETTLEMENT_INFO")]
    Info,
    #[log_level(capacity = 500, name = "SETTLEMENT_ERROR")]
    Error,
}

impl GetLogFilter for SettlementLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// Build the ordered transfer legs for one completed execution.
///
/// PROFIT pays the principal back from the specialist, then the profit from
/// the treasury. LOSS pays the surviving principal back, then forwards the
/// loss to the treasury; a loss beyond the principal is clamped to it.
/// NEUTRAL is a single principal round-trip. Zero-amount legs are omitted.
pub fn plan_settlement(
    execution: &Execution,
    agent_role: &WalletRole,
    treasury_address: &str,
    token_address: Option<&str>,
) -> Result<(SettlementKind, Vec<SettlementLeg>), String> {
    if execution.result != ExecutionResult::Success {
        return Err(format!(
            "execution {} is not settleable: result is {:?}",
            execution.id, execution.result
        ));
    }
    let principal = parse_wei(&execution.amount_in_wei, "amount_in_wei")?;
    if principal.is_zero() {
        return Err(format!(
            "execution {} has no principal to settle",
            execution.id
        ));
    }
    let (negative, magnitude) = parse_signed_wei(&execution.profit_loss_wei, "profit_loss_wei")?;

    let user = execution.user_address.as_str();
    if magnitude.is_zero() {
        let legs = vec![leg(
            agent_role.clone(),
            user,
            token_address,
            principal,
            "principal round-trip",
        )];
        return Ok((SettlementKind::Neutral, legs));
    }

    if negative {
        let loss = magnitude.min(principal);
        let mut legs = Vec::new();
        let surviving = principal - loss;
        if !surviving.is_zero() {
            legs.push(leg(
                agent_role.clone(),
                user,
                token_address,
                surviving,
                "principal less loss",
            ));
        }
        legs.push(leg(
            agent_role.clone(),
            treasury_address,
            token_address,
            loss,
            "loss to treasury",
        ));
        return Ok((SettlementKind::Loss, legs));
    }

    let legs = vec![
        leg(
            agent_role.clone(),
            user,
            token_address,
            principal,
            "principal return",
        ),
        leg(
            WalletRole::Treasury,
            user,
            token_address,
            magnitude,
            "profit payout",
        ),
    ];
    Ok((SettlementKind::Profit, legs))
}

/// Run the planned legs in order. The first failure stops the walk; the
/// report carries every leg that confirmed before it.
pub async fn execute_settlement(
    transfers: &dyn TransferPort,
    execution_id: u64,
    kind: SettlementKind,
    legs: Vec<SettlementLeg>,
) -> SettlementReport {
    let mut report = SettlementReport {
        execution_id,
        kind,
        completed: Vec::new(),
        error: None,
    };
    for planned in legs {
        let result = transfers
            .transfer(
                &planned.from_role,
                &planned.to_address,
                planned.token_address.as_deref(),
                &planned.amount_wei,
            )
            .await;
        match result {
            Ok(tx_hash) => {
                log!(
                    SettlementLogPriority::Info,
                    "settlement_leg_confirmed execution_id={execution_id} label={} amount_wei={} tx={tx_hash}",
                    planned.label,
                    planned.amount_wei
                );
                report.completed.push(CompletedLeg {
                    leg: planned,
                    tx_hash,
                });
            }
            Err(error) => {
                log!(
                    SettlementLogPriority::Error,
                    "settlement_leg_failed execution_id={execution_id} label={} confirmed_legs={} err={error}",
                    planned.label,
                    report.completed.len()
                );
                report.error = Some(format!("leg '{}' failed: {error}", planned.label));
                break;
            }
        }
    }
    report
}

fn leg(
    from_role: WalletRole,
    to_address: &str,
    token_address: Option<&str>,
    amount_wei: U256,
    label: &str,
) -> SettlementLeg {
    SettlementLeg {
        from_role,
        to_address: to_address.to_string(),
        token_address: token_address.map(str::to_string),
        amount_wei: amount_wei.to_string(),
        label: label.to_string(),
    }
}
