//! Strategy cycle execution engine.
//!
//! One cycle consumes its inputs in a fixed order: redelegations delivered
//! through the intake channel, pending delegation records found by the
//! store scan, then directly granted permissions still active. Every trade
//! follows the strict execution protocol: log the start on chain, run the
//! trade, log the completion. A failed trade step still completes the
//! execution with zero output so nothing is left dangling in PENDING.
//!
//! Specialist trades on redeemed delegations draw simulated outcomes from
//! the roster profile. Direct permission trades run against the swap venue
//! and settle afterwards; simulated trades move no funds and are never
//! settled.

use crate::chain::bank::TransferPort;
use crate::chain::registry::RegistryPort;
use crate::chain::venue::SwapVenue;
use crate::domain::allocation::clamp_trade_size;
use crate::domain::amount::{format_signed_wei, mul_bps, parse_wei};
use crate::domain::recovery_policy::classify_chain_failure;
use crate::domain::types::{
    DelegationRecord, DelegationStatus, IntakeKind, LedgerEvent, ObservedEvent, OperationFailure,
    OperationFailureKind, RecoveryFailure, RuntimeSnapshot, SpecialistProfile, WalletRole,
};
use crate::ledger;
use crate::settlement::{execute_settlement, plan_settlement};
use crate::storage::stable;
use crate::timing::current_time_ns;
use alloy_primitives::U256;
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};
use sha3::{Digest, Keccak256};

const INTAKE_BATCH_LIMIT: usize = 16;
const RECORD_SCAN_LIMIT: usize = 16;
const DIRECT_GRANT_SCAN_LIMIT: usize = 32;
/// Redemption-plus-trade sequences per cycle; each one is several awaited
/// chain calls, so the cap keeps a cycle inside the job budget.
const MAX_RECORDS_PER_CYCLE: usize = 2;
const MAX_DIRECT_TRADES_PER_CYCLE: usize = 1;

#[derive(Clone, Copy, Debug, LogPriorityLevels)]
enum ExecutorLogPriority {
    #[log_level(capacity = 1000, name = "EXECUTOR_INFO")]
    Info,
    #[log_level(capacity = 500, name = "EXECUTOR_ERROR")]
    Error,
}

impl GetLogFilter for ExecutorLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// Counters from one strategy cycle, rendered into the scheduler's log line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub redemptions_completed: u32,
    pub trades_executed: u32,
    pub trades_failed: u32,
    pub trades_skipped: u32,
    pub settlements_completed: u32,
    pub notes: Vec<String>,
}

pub async fn strategy_cycle(
    registry: &dyn RegistryPort,
    venue: &dyn SwapVenue,
    transfers: &dyn TransferPort,
) -> Result<CycleOutcome, String> {
    let snapshot = stable::runtime_snapshot();
    if snapshot.roster.is_empty() {
        return Err("specialist roster is empty".to_string());
    }
    let mut outcome = CycleOutcome::default();
    process_pending_records(registry, &snapshot, &mut outcome).await?;
    process_direct_grants(registry, venue, transfers, &snapshot, &mut outcome).await?;
    Ok(outcome)
}

/// Failures that would hit every remaining item in the cycle too.
fn aborts_the_cycle(error: &str) -> bool {
    matches!(
        classify_chain_failure(error),
        RecoveryFailure::Operation(OperationFailure {
            kind: OperationFailureKind::BlockedBySurvivalPolicy
                | OperationFailureKind::InsufficientCycles,
        })
    )
}

// ── A2A redemption lane ─────────────────────────────────────────────────────

async fn process_pending_records(
    registry: &dyn RegistryPort,
    snapshot: &RuntimeSnapshot,
    outcome: &mut CycleOutcome,
) -> Result<(), String> {
    let mut hashes: Vec<String> = stable::drain_intake(&IntakeKind::Redelegation, INTAKE_BATCH_LIMIT)
        .into_iter()
        .map(|message| message.record_id)
        .collect();
    // The store scan backstops intake messages that never arrived and
    // retries records that failed an earlier attempt.
    for record in stable::list_records_by_status(&DelegationStatus::Pending, RECORD_SCAN_LIMIT) {
        if !hashes.contains(&record.delegation_hash) {
            hashes.push(record.delegation_hash);
        }
    }

    let mut advanced = 0usize;
    for delegation_hash in hashes {
        if advanced == MAX_RECORDS_PER_CYCLE {
            break;
        }
        let now = current_time_ns();
        if process_one_record(registry, snapshot, &delegation_hash, now, outcome).await? {
            advanced += 1;
        }
    }
    Ok(())
}

/// Redeem one pending record and trade its delegated amount. Returns true
/// when chain calls were spent on the record, whatever their outcome.
async fn process_one_record(
    registry: &dyn RegistryPort,
    snapshot: &RuntimeSnapshot,
    delegation_hash: &str,
    now: u64,
    outcome: &mut CycleOutcome,
) -> Result<bool, String> {
    let record = match stable::get_delegation_record(delegation_hash) {
        Some(record) => record,
        None => {
            outcome
                .notes
                .push(format!("record {delegation_hash} no longer exists"));
            return Ok(false);
        }
    };
    if record.status != DelegationStatus::Pending {
        return Ok(false);
    }
    if record.expires_at_ns <= now {
        outcome
            .notes
            .push(format!("record {delegation_hash}: expired before redemption"));
        return Ok(false);
    }
    let profile = match roster_profile(snapshot, &record.child_agent_id) {
        Some(profile) => profile,
        None => {
            let note = format!(
                "record {delegation_hash}: specialist {} is not on the roster",
                record.child_agent_id
            );
            stable::set_record_error(delegation_hash, Some(note.clone()));
            outcome.notes.push(note);
            return Ok(false);
        }
    };
    // The redeeming identity must be the delegate the record designates.
    if profile.wallet_address != record.child_address {
        let note = format!(
            "record {delegation_hash}: delegate address does not match the roster wallet"
        );
        stable::set_record_error(delegation_hash, Some(note.clone()));
        outcome.notes.push(note);
        return Ok(false);
    }

    match registry
        .redeem_delegation(&profile.agent_id, &record.payload_hex)
        .await
    {
        Ok(tx_hash) => {
            stable::mark_record_redeemed(delegation_hash, &tx_hash, now)?;
            outcome.redemptions_completed += 1;
            log!(
                ExecutorLogPriority::Info,
                "record_redeemed delegation_hash={delegation_hash} specialist={} tx={tx_hash}",
                profile.agent_id
            );
        }
        Err(error) => {
            if aborts_the_cycle(&error) {
                return Err(error);
            }
            // The record stays pending and the next scan retries it.
            log!(
                ExecutorLogPriority::Error,
                "redemption_failed delegation_hash={delegation_hash} err={error}"
            );
            stable::set_record_error(delegation_hash, Some(error.clone()));
            outcome
                .notes
                .push(format!("record {delegation_hash}: redemption failed: {error}"));
            return Ok(true);
        }
    }

    run_simulated_execution(registry, snapshot, &profile, &record, outcome).await?;
    Ok(true)
}

fn roster_profile(snapshot: &RuntimeSnapshot, agent_id: &str) -> Option<SpecialistProfile> {
    snapshot
        .roster
        .iter()
        .find(|profile| profile.agent_id == agent_id)
        .cloned()
}

async fn run_simulated_execution(
    registry: &dyn RegistryPort,
    snapshot: &RuntimeSnapshot,
    profile: &SpecialistProfile,
    record: &DelegationRecord,
    outcome: &mut CycleOutcome,
) -> Result<(), String> {
    let amount_in = parse_wei(&record.amount_wei, "record amount")?;
    let started_at = current_time_ns();
    let started = registry
        .log_execution_start(
            &profile.agent_id,
            &record.user_address,
            &record.amount_wei,
            &record.token_address,
            &record.token_address,
        )
        .await;
    let (execution_id, start_tx_hash) = match started {
        Ok(confirmed) => confirmed,
        Err(error) => {
            if aborts_the_cycle(&error) {
                return Err(error);
            }
            outcome.notes.push(format!(
                "execution start failed for {}: {error}",
                profile.agent_id
            ));
            return Ok(());
        }
    };
    apply_started_event(
        snapshot,
        execution_id,
        &profile.wallet_address,
        &record.user_address,
        &record.amount_wei,
        &record.token_address,
        &record.token_address,
        &start_tx_hash,
        started_at,
    )?;

    let (amount_out, success) = simulated_outcome(profile, execution_id, started_at, amount_in);
    complete_execution(
        registry,
        snapshot,
        &profile.agent_id,
        &profile.wallet_address,
        execution_id,
        amount_in,
        amount_out,
        success,
        outcome,
    )
    .await
}

/// Draw a win or loss from the profile's configured rates. The seed is
/// deterministic over (execution id, wallet, start time), so replaying a
/// cycle reproduces the same outcome.
fn simulated_outcome(
    profile: &SpecialistProfile,
    execution_id: u64,
    started_at_ns: u64,
    amount_in: U256,
) -> (U256, bool) {
    let mut hasher = Keccak256::new();
    hasher.update(execution_id.to_be_bytes());
    hasher.update(profile.wallet_address.as_bytes());
    hasher.update(started_at_ns.to_be_bytes());
    let digest = hasher.finalize();
    let roll = u64::from_be_bytes(digest[0..8].try_into().unwrap_or_default()) % 10_000;
    let magnitude = u64::from_be_bytes(digest[8..16].try_into().unwrap_or_default());

    if (roll as u32) < profile.sim_win_rate_bps {
        let span = profile
            .sim_profit_bps_max
            .saturating_sub(profile.sim_profit_bps_min)
            .saturating_add(1);
        let bps = profile.sim_profit_bps_min + (magnitude % u64::from(span)) as u32;
        (amount_in.saturating_add(mul_bps(amount_in, bps)), true)
    } else {
        let span = profile
            .sim_loss_bps_max
            .saturating_sub(profile.sim_loss_bps_min)
            .saturating_add(1);
        let bps = profile.sim_loss_bps_min + (magnitude % u64::from(span)) as u32;
        (amount_in.saturating_sub(mul_bps(amount_in, bps)), false)
    }
}

// ── Direct permission lane ──────────────────────────────────────────────────

async fn process_direct_grants(
    registry: &dyn RegistryPort,
    venue: &dyn SwapVenue,
    transfers: &dyn TransferPort,
    snapshot: &RuntimeSnapshot,
    outcome: &mut CycleOutcome,
) -> Result<(), String> {
    let token_out = match snapshot.settlement_token_address.as_deref() {
        Some(token) => token,
        None => {
            outcome
                .notes
                .push("direct trades skipped: settlement token address is not configured".to_string());
            return Ok(());
        }
    };
    let manager = snapshot.manager_address.as_deref().unwrap_or_default();
    let floor = parse_wei(&snapshot.trade_floor_wei, "trade_floor_wei")?;
    let ceiling = parse_wei(&snapshot.trade_ceiling_wei, "trade_ceiling_wei")?;

    let mut traded = 0usize;
    for grant in stable::list_grants_by_status(&DelegationStatus::Pending, DIRECT_GRANT_SCAN_LIMIT) {
        if traded == MAX_DIRECT_TRADES_PER_CYCLE {
            break;
        }
        let now = current_time_ns();
        if !grant.active || grant.expires_at_ns <= now {
            continue;
        }
        // Grants addressed to the fund manager belong to the dispatcher.
        if grant.delegate_address == manager {
            continue;
        }
        let profile = match snapshot
            .roster
            .iter()
            .find(|profile| profile.wallet_address == grant.delegate_address)
        {
            Some(profile) => profile.clone(),
            None => continue,
        };

        let total = parse_wei(&grant.total_amount_wei, "total_amount_wei")?;
        let used = parse_wei(&grant.amount_used_wei, "amount_used_wei")?;
        let size = match clamp_trade_size(total.saturating_sub(used), floor, ceiling) {
            Some(size) => size,
            None => continue,
        };
        let required = size.saturating_add(mul_bps(size, snapshot.min_profit_bps));

        let quoted = match venue
            .quote(&grant.token_address, token_out, &size.to_string())
            .await
        {
            Ok(quoted) => parse_wei(&quoted, "quoted amount")?,
            Err(error) => {
                if aborts_the_cycle(&error) {
                    return Err(error);
                }
                outcome.notes.push(format!("venue quote failed: {error}"));
                break;
            }
        };
        if quoted < required {
            outcome.trades_skipped += 1;
            outcome.notes.push(format!(
                "grant {}: quote {quoted} below the profit threshold {required}",
                grant.permission_id
            ));
            continue;
        }

        run_venue_execution(
            registry,
            venue,
            transfers,
            snapshot,
            &profile,
            &grant.permission_id,
            &grant.user_address,
            &grant.token_address,
            token_out,
            size,
            required,
            outcome,
        )
        .await?;
        traded += 1;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_venue_execution(
    registry: &dyn RegistryPort,
    venue: &dyn SwapVenue,
    transfers: &dyn TransferPort,
    snapshot: &RuntimeSnapshot,
    profile: &SpecialistProfile,
    permission_id: &str,
    user_address: &str,
    token_in: &str,
    token_out: &str,
    amount_in: U256,
    min_amount_out: U256,
    outcome: &mut CycleOutcome,
) -> Result<(), String> {
    let started_at = current_time_ns();
    let amount_in_wei = amount_in.to_string();
    let started = registry
        .log_execution_start(
            &profile.agent_id,
            user_address,
            &amount_in_wei,
            token_in,
            token_out,
        )
        .await;
    let (execution_id, start_tx_hash) = match started {
        Ok(confirmed) => confirmed,
        Err(error) => {
            if aborts_the_cycle(&error) {
                return Err(error);
            }
            outcome.notes.push(format!(
                "execution start failed for {}: {error}",
                profile.agent_id
            ));
            return Ok(());
        }
    };
    apply_started_event(
        snapshot,
        execution_id,
        &profile.wallet_address,
        user_address,
        &amount_in_wei,
        token_in,
        token_out,
        &start_tx_hash,
        started_at,
    )?;

    let trade = venue
        .execute_swap(
            token_in,
            token_out,
            &amount_in_wei,
            &min_amount_out.to_string(),
        )
        .await;
    let (amount_out, success) = match trade {
        Ok(swap) => (parse_wei(&swap.amount_out_wei, "swap amount out")?, true),
        Err(error) => {
            if aborts_the_cycle(&error) {
                return Err(error);
            }
            outcome.notes.push(format!(
                "trade for execution {execution_id} failed: {error}"
            ));
            (U256::ZERO, false)
        }
    };

    complete_execution(
        registry,
        snapshot,
        &profile.agent_id,
        &profile.wallet_address,
        execution_id,
        amount_in,
        amount_out,
        success,
        outcome,
    )
    .await?;

    if !success {
        return Ok(());
    }
    stable::record_grant_usage(permission_id, &amount_in_wei)?;
    settle_execution(transfers, snapshot, profile, execution_id, token_out, outcome).await;
    Ok(())
}

async fn settle_execution(
    transfers: &dyn TransferPort,
    snapshot: &RuntimeSnapshot,
    profile: &SpecialistProfile,
    execution_id: u64,
    settlement_token: &str,
    outcome: &mut CycleOutcome,
) {
    let treasury = match snapshot.treasury_address.as_deref() {
        Some(treasury) => treasury,
        None => {
            outcome.notes.push(format!(
                "settlement for execution {execution_id} skipped: treasury wallet address is not derived yet"
            ));
            return;
        }
    };
    let execution = match stable::get_execution(execution_id) {
        Some(execution) => execution,
        None => {
            outcome.notes.push(format!(
                "settlement for execution {execution_id} skipped: execution record is missing"
            ));
            return;
        }
    };
    let agent_role = WalletRole::Specialist(profile.agent_id.clone());
    let planned = plan_settlement(&execution, &agent_role, treasury, Some(settlement_token));
    let (kind, legs) = match planned {
        Ok(planned) => planned,
        Err(error) => {
            outcome.notes.push(format!(
                "settlement for execution {execution_id} skipped: {error}"
            ));
            return;
        }
    };
    let report = execute_settlement(transfers, execution_id, kind, legs).await;
    match report.error {
        None => outcome.settlements_completed += 1,
        Some(error) => outcome.notes.push(format!(
            "settlement for execution {execution_id}: {error} after {} confirmed legs",
            report.completed.len()
        )),
    }
}

// ── Shared protocol steps ───────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn apply_started_event(
    snapshot: &RuntimeSnapshot,
    execution_id: u64,
    agent_address: &str,
    user_address: &str,
    amount_in_wei: &str,
    token_in: &str,
    token_out: &str,
    tx_hash: &str,
    observed_at_ns: u64,
) -> Result<(), String> {
    ledger::apply_observed_event(&ObservedEvent {
        chain_id: snapshot.chain_id,
        block_number: 0,
        log_index: 0,
        tx_hash: tx_hash.to_string(),
        observed_at_ns,
        event: LedgerEvent::ExecutionStarted {
            execution_id,
            agent_id: agent_address.to_string(),
            user_address: user_address.to_string(),
            amount_in_wei: amount_in_wei.to_string(),
            token_in: token_in.to_string(),
            token_out: token_out.to_string(),
        },
    })
    .map(|_| ())
}

/// Log the completion on chain and funnel the outcome into the ledger. A
/// completion-call failure leaves the execution pending; the stale-pending
/// view surfaces it for operator attention.
#[allow(clippy::too_many_arguments)]
async fn complete_execution(
    registry: &dyn RegistryPort,
    snapshot: &RuntimeSnapshot,
    agent_label: &str,
    agent_address: &str,
    execution_id: u64,
    amount_in: U256,
    amount_out: U256,
    success: bool,
    outcome: &mut CycleOutcome,
) -> Result<(), String> {
    let completed = registry
        .log_execution_complete(agent_label, execution_id, &amount_out.to_string(), success)
        .await;
    let complete_tx_hash = match completed {
        Ok(tx_hash) => tx_hash,
        Err(error) => {
            if aborts_the_cycle(&error) {
                return Err(error);
            }
            log!(
                ExecutorLogPriority::Error,
                "execution_completion_failed id={execution_id} agent={agent_label} err={error}"
            );
            outcome.notes.push(format!(
                "execution {execution_id} completion failed: {error}"
            ));
            return Ok(());
        }
    };

    let (negative, magnitude) = if amount_out >= amount_in {
        (false, amount_out - amount_in)
    } else {
        (true, amount_in - amount_out)
    };
    ledger::apply_observed_event(&ObservedEvent {
        chain_id: snapshot.chain_id,
        block_number: 0,
        log_index: 0,
        tx_hash: complete_tx_hash,
        observed_at_ns: current_time_ns(),
        event: LedgerEvent::ExecutionCompleted {
            execution_id,
            agent_id: agent_address.to_string(),
            amount_out_wei: amount_out.to_string(),
            profit_loss_wei: format_signed_wei(negative, magnitude),
            success,
        },
    })?;
    if success {
        outcome.trades_executed += 1;
    } else {
        outcome.trades_failed += 1;
    }
    log!(
        ExecutorLogPriority::Info,
        "execution_completed id={execution_id} agent={agent_label} success={success} amount_out_wei={amount_out}"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::bank::MockTransferAdapter;
    use crate::chain::registry::MockRegistryAdapter;
    use crate::chain::venue::MockSwapVenue;
    use crate::domain::types::{ExecutionResult, PermissionGrant};
    use crate::test_support::block_on_with_spin;
    use crate::timing::{set_test_time_ns, NANOS_PER_SEC};

    const MANAGER: &str = "0x00000000000000000000000000000000000000aa";
    const TREASURY: &str = "0x00000000000000000000000000000000000000ab";
    const USER: &str = "0x2222222222222222222222222222222222222222";
    const TOKEN: &str = "0x4444444444444444444444444444444444444444";
    const SETTLEMENT_TOKEN: &str = "0x5555555555555555555555555555555555555555";
    const ALPHA_WALLET: &str = "0x00000000000000000000000000000000000000a1";
    const BETA_WALLET: &str = "0x00000000000000000000000000000000000000b2";

    fn roster() -> Vec<SpecialistProfile> {
        vec![
            // Always wins exactly one percent.
            SpecialistProfile {
                agent_id: "alpha".to_string(),
                wallet_address: ALPHA_WALLET.to_string(),
                strategy: "momentum".to_string(),
                allocation_bps: 6_000,
                sim_win_rate_bps: 10_000,
                sim_profit_bps_min: 100,
                sim_profit_bps_max: 100,
                sim_loss_bps_min: 100,
                sim_loss_bps_max: 100,
            },
            // Always loses exactly five percent.
            SpecialistProfile {
                agent_id: "beta".to_string(),
                wallet_address: BETA_WALLET.to_string(),
                strategy: "carry".to_string(),
                allocation_bps: 4_000,
                sim_win_rate_bps: 0,
                sim_profit_bps_min: 100,
                sim_profit_bps_max: 100,
                sim_loss_bps_min: 500,
                sim_loss_bps_max: 500,
            },
        ]
    }

    fn cycle_ready(now: u64) {
        stable::init_storage();
        set_test_time_ns(now);
        stable::set_wallet_addresses(MANAGER.to_string(), TREASURY.to_string());
        stable::set_roster(roster()).expect("roster should accept");
        stable::set_settlement_token_address(SETTLEMENT_TOKEN.to_string())
            .expect("token should accept");
        stable::set_trade_bounds("100".to_string(), "1000000".to_string())
            .expect("bounds should accept");
        stable::set_min_profit_bps(50).expect("threshold should accept");
    }

    fn pending_record(delegation_hash: &str, agent_id: &str, wallet: &str, now: u64) -> DelegationRecord {
        DelegationRecord {
            delegation_hash: delegation_hash.to_string(),
            parent_agent_id: MANAGER.to_string(),
            child_agent_id: agent_id.to_string(),
            child_address: wallet.to_string(),
            user_address: USER.to_string(),
            token_address: TOKEN.to_string(),
            amount_wei: "1000".to_string(),
            created_at_ns: now,
            expires_at_ns: now + 3_600 * NANOS_PER_SEC,
            payload_hex: format!("0x{}", "ab".repeat(68)),
            status: DelegationStatus::Pending,
            redeemed_at_ns: None,
            redemption_tx_hash: None,
            last_error: None,
        }
    }

    fn direct_grant(permission_id: &str, delegate: &str, total: &str, now: u64) -> PermissionGrant {
        PermissionGrant {
            permission_id: permission_id.to_string(),
            user_address: USER.to_string(),
            agent_id: "alpha".to_string(),
            delegate_address: delegate.to_string(),
            token_address: TOKEN.to_string(),
            amount_per_period_wei: total.to_string(),
            period_secs: 86_400,
            total_amount_wei: total.to_string(),
            amount_used_wei: "0".to_string(),
            granted_at_ns: now,
            expires_at_ns: now + 3_600 * NANOS_PER_SEC,
            revoked_at_ns: None,
            active: true,
            payload_hex: format!("0x{}", "cd".repeat(68)),
            status: DelegationStatus::Pending,
            claimed_at_ns: None,
            claim_tx_hash: None,
        }
    }

    fn run_cycle(
        registry: &MockRegistryAdapter,
        venue: &MockSwapVenue,
        transfers: &MockTransferAdapter,
    ) -> CycleOutcome {
        block_on_with_spin(strategy_cycle(registry, venue, transfers))
            .expect("cycle should succeed")
    }

    #[test]
    fn intake_redelegation_is_redeemed_then_traded() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        let hash = format!("0x{}", "11".repeat(32));
        stable::upsert_delegation_record(&pending_record(&hash, "alpha", ALPHA_WALLET, start));
        stable::push_intake(IntakeKind::Redelegation, &hash, start);
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.redemptions_completed, 1);
        assert_eq!(outcome.trades_executed, 1);

        let record = stable::get_delegation_record(&hash).expect("record should exist");
        assert_eq!(record.status, DelegationStatus::Redeemed);
        assert!(record.redemption_tx_hash.is_some());
        assert_eq!(record.redeemed_at_ns, Some(start));

        // Alpha always wins one percent, so 1000 in comes back as 1010.
        let execution = stable::get_execution(1).expect("execution should exist");
        assert_eq!(execution.result, ExecutionResult::Success);
        assert_eq!(execution.amount_out_wei, "1010");
        assert_eq!(execution.profit_loss_wei, "10");

        let agent = stable::get_agent(ALPHA_WALLET).expect("agent aggregate should exist");
        assert_eq!(agent.successful_executions, 1);

        // Simulated trades never settle.
        assert!(transfers.transfers.borrow().is_empty());
        let calls = registry.calls.borrow();
        assert!(calls[0].starts_with("redeem"), "got: {calls:?}");
        assert!(calls[1].starts_with("start"), "got: {calls:?}");
        assert!(calls[2].starts_with("complete"), "got: {calls:?}");
    }

    #[test]
    fn failed_redemption_keeps_the_record_pending_for_retry() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        let hash = format!("0x{}", "22".repeat(32));
        stable::upsert_delegation_record(&pending_record(&hash, "alpha", ALPHA_WALLET, start));
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        *registry.fail_next_with.borrow_mut() =
            Some("rpc endpoint returned status 503".to_string());
        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.redemptions_completed, 0);
        let record = stable::get_delegation_record(&hash).expect("record should exist");
        assert_eq!(record.status, DelegationStatus::Pending);
        assert!(record.last_error.as_deref().unwrap_or_default().contains("503"));

        // The next scan retries and succeeds.
        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.redemptions_completed, 1);
        assert_eq!(
            stable::get_delegation_record(&hash).expect("record should exist").status,
            DelegationStatus::Redeemed
        );
    }

    #[test]
    fn mismatched_delegate_wallet_is_never_redeemed() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        let hash = format!("0x{}", "33".repeat(32));
        let mut record = pending_record(&hash, "alpha", ALPHA_WALLET, start);
        record.child_address = "0x00000000000000000000000000000000000000ff".to_string();
        stable::upsert_delegation_record(&record);
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.redemptions_completed, 0);
        assert!(registry.calls.borrow().is_empty());
        assert!(outcome
            .notes
            .iter()
            .any(|note| note.contains("does not match")));
        assert_eq!(
            stable::get_delegation_record(&hash).expect("record should exist").status,
            DelegationStatus::Pending
        );
    }

    #[test]
    fn expired_record_is_skipped_before_redemption() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        let hash = format!("0x{}", "44".repeat(32));
        let mut record = pending_record(&hash, "alpha", ALPHA_WALLET, start);
        record.expires_at_ns = start;
        stable::upsert_delegation_record(&record);
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert!(registry.calls.borrow().is_empty());
        assert!(outcome.notes.iter().any(|note| note.contains("expired")));
    }

    #[test]
    fn record_budget_carries_the_third_record_to_the_next_cycle() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        for index in 1..=3u8 {
            let hash = format!("0x{}", format!("{index:02}").repeat(32));
            stable::upsert_delegation_record(&pending_record(&hash, "alpha", ALPHA_WALLET, start));
        }
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.redemptions_completed, 2);
        let remaining = stable::list_records_by_status(&DelegationStatus::Pending, 10);
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].last_error.is_none());

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.redemptions_completed, 1);
        assert!(stable::list_records_by_status(&DelegationStatus::Pending, 10).is_empty());
    }

    #[test]
    fn losing_simulation_completes_the_execution_as_a_failure() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        let hash = format!("0x{}", "55".repeat(32));
        stable::upsert_delegation_record(&pending_record(&hash, "beta", BETA_WALLET, start));
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.trades_failed, 1);
        assert_eq!(outcome.trades_executed, 0);

        // Beta always loses five percent of the thousand it was delegated.
        let execution = stable::get_execution(1).expect("execution should exist");
        assert_eq!(execution.result, ExecutionResult::Failure);
        assert_eq!(execution.amount_out_wei, "950");
        assert_eq!(execution.profit_loss_wei, "-50");
        let agent = stable::get_agent(BETA_WALLET).expect("agent aggregate should exist");
        assert_eq!(agent.failed_executions, 1);
        assert!(transfers.transfers.borrow().is_empty());
    }

    #[test]
    fn direct_grant_trades_through_the_venue_and_settles() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        stable::upsert_grant(&direct_grant("perm-d1", ALPHA_WALLET, "10000", start));
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.trades_executed, 1);
        assert_eq!(outcome.settlements_completed, 1);
        assert_eq!(venue.swaps.borrow().len(), 1);

        let execution = stable::get_execution(1).expect("execution should exist");
        assert_eq!(execution.result, ExecutionResult::Success);
        assert_eq!(execution.amount_out_wei, "10200");
        assert_eq!(execution.profit_loss_wei, "200");

        let grant = stable::get_grant("perm-d1").expect("grant should exist");
        assert_eq!(grant.amount_used_wei, "10000");

        // Principal from the specialist, profit from the treasury.
        let legs = transfers.transfers.borrow();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].amount_wei, "10000");
        assert_eq!(
            legs[0].from_role,
            WalletRole::Specialist("alpha".to_string())
        );
        assert_eq!(legs[0].to_address, USER);
        assert_eq!(legs[1].amount_wei, "200");
        assert_eq!(legs[1].from_role, WalletRole::Treasury);
        assert_eq!(legs[1].token_address.as_deref(), Some(SETTLEMENT_TOKEN));
        drop(legs);

        // The budget is exhausted, so the next cycle stays below the floor
        // and trades nothing.
        let calls_before = registry.calls.borrow().len();
        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.trades_executed, 0);
        assert_eq!(registry.calls.borrow().len(), calls_before);
    }

    #[test]
    fn unprofitable_quote_skips_without_logging_an_execution() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        stable::upsert_grant(&direct_grant("perm-d2", ALPHA_WALLET, "10000", start));
        let registry = MockRegistryAdapter::new();
        // Twenty basis points of profit against a fifty point threshold.
        let venue = MockSwapVenue::with_rate_bps(10_020);
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.trades_skipped, 1);
        assert!(registry.calls.borrow().is_empty());
        assert!(outcome
            .notes
            .iter()
            .any(|note| note.contains("below the profit threshold")));
    }

    #[test]
    fn failed_swap_still_completes_the_execution_with_zero_out() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        stable::upsert_grant(&direct_grant("perm-d3", ALPHA_WALLET, "10000", start));
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        *venue.fail_swap_with.borrow_mut() = Some("swap reverted: insufficient liquidity".to_string());
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.trades_failed, 1);
        assert_eq!(outcome.settlements_completed, 0);

        let execution = stable::get_execution(1).expect("execution should exist");
        assert_eq!(execution.result, ExecutionResult::Failure);
        assert_eq!(execution.amount_out_wei, "0");
        assert_eq!(execution.profit_loss_wei, "-10000");

        // Nothing was spent and nothing settles.
        assert_eq!(
            stable::get_grant("perm-d3").expect("grant should exist").amount_used_wei,
            "0"
        );
        assert!(transfers.transfers.borrow().is_empty());
        let calls = registry.calls.borrow();
        assert!(calls.last().map(String::as_str).unwrap_or_default().contains("success=false"));
    }

    #[test]
    fn manager_addressed_grants_are_left_to_the_dispatcher() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        stable::upsert_grant(&direct_grant("perm-d4", MANAGER, "10000", start));
        let registry = MockRegistryAdapter::new();
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        let outcome = run_cycle(&registry, &venue, &transfers);
        assert_eq!(outcome.trades_executed, 0);
        assert!(registry.calls.borrow().is_empty());
        assert!(venue.swaps.borrow().is_empty());
    }

    #[test]
    fn survival_block_aborts_the_whole_cycle() {
        let start = 1_000 * NANOS_PER_SEC;
        cycle_ready(start);
        let hash = format!("0x{}", "66".repeat(32));
        stable::upsert_delegation_record(&pending_record(&hash, "alpha", ALPHA_WALLET, start));
        let registry = MockRegistryAdapter::new();
        *registry.fail_next_with.borrow_mut() =
            Some("operation blocked by survival policy".to_string());
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let transfers = MockTransferAdapter::new();

        let error = block_on_with_spin(strategy_cycle(&registry, &venue, &transfers))
            .expect_err("survival block should abort the cycle");
        assert!(error.contains("survival"), "got: {error}");
        let record = stable::get_delegation_record(&hash).expect("record should exist");
        assert_eq!(record.status, DelegationStatus::Pending);
        assert!(record.last_error.is_none());
    }
}
