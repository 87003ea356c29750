//! Permission fan-out dispatcher.
//!
//! One dispatch pass has two phases. Intake collects fresh permission grants
//! from the push channel and from a store poll that backstops lost
//! notifications, with a persisted processed-set keeping the two sources from
//! double-enqueueing. The drain phase then walks the allocation queue in slot
//! order and logs one redelegation per ready item, so at most one registry
//! transaction is in flight per wallet at any time.

use crate::chain::registry::RegistryPort;
use crate::domain::allocation::split_allocation;
use crate::domain::amount::parse_wei;
use crate::domain::recovery_policy::classify_chain_failure;
use crate::domain::types::{
    AllocationItem, AllocationStatus, DelegationRecord, DelegationStatus, IntakeKind, LedgerEvent,
    ObservedEvent, OperationFailure, OperationFailureKind, OutcallFailure, OutcallFailureKind,
    RecoveryFailure, SpecialistProfile,
};
use crate::ledger;
use crate::storage::stable;
use crate::timing::{
    current_time_ns, FANOUT_CALL_SPACING_SECS, MAX_FANOUT_ATTEMPTS, NANOS_PER_SEC,
    RATE_LIMIT_COOLDOWN_SECS,
};
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};

const INTAKE_BATCH_LIMIT: usize = 32;
const STORE_POLL_LIMIT: usize = 32;
/// Registry calls per pass; keeps one pass inside the pipeline job budget.
const MAX_DRAINS_PER_PASS: usize = 3;

#[derive(Clone, Copy, Debug, LogPriorityLevels)]
enum DispatchLogPriority {
    #[log_level(capacity = 1000, name = "DISPATCH_INFO")]
    Info,
    #[log_level(capacity = 500, name = "DISPATCH_ERROR")]
    Error,
}

impl GetLogFilter for DispatchLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// Counters from one dispatch pass, rendered into the scheduler's log line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub grants_fanned_out: u32,
    pub grants_skipped: u32,
    pub allocations_funded: u32,
    pub allocations_requeued: u32,
    pub allocations_abandoned: u32,
    pub allocations_cancelled: u32,
    /// Reasons for grants and items that did not fund, one line each.
    pub notes: Vec<String>,
}

enum GrantDisposition {
    Fanned,
    Skipped(String),
    AlreadyProcessed,
}

struct FanoutContext {
    chain_id: u64,
    manager_address: String,
}

pub async fn dispatch_pass(registry: &dyn RegistryPort) -> Result<DispatchOutcome, String> {
    let snapshot = stable::runtime_snapshot();
    let manager_address = snapshot
        .manager_address
        .clone()
        .ok_or_else(|| "manager wallet address is not derived yet".to_string())?;
    if snapshot.roster.is_empty() {
        return Err("specialist roster is empty".to_string());
    }
    let context = FanoutContext {
        chain_id: snapshot.chain_id,
        manager_address,
    };

    let mut outcome = DispatchOutcome::default();
    collect_fresh_grants(&snapshot.roster, &context, current_time_ns(), &mut outcome)?;
    drain_allocation_queue(registry, &context, &mut outcome).await?;
    Ok(outcome)
}

fn collect_fresh_grants(
    roster: &[SpecialistProfile],
    context: &FanoutContext,
    now: u64,
    outcome: &mut DispatchOutcome,
) -> Result<(), String> {
    let mut candidates: Vec<String> =
        stable::drain_intake(&IntakeKind::PermissionGrant, INTAKE_BATCH_LIMIT)
            .into_iter()
            .map(|message| message.record_id)
            .collect();
    // The store poll backstops push notifications that never arrived; the
    // processed-set below collapses duplicates between the two sources.
    candidates.extend(
        stable::list_grants_by_status(&DelegationStatus::Pending, STORE_POLL_LIMIT)
            .into_iter()
            .map(|grant| grant.permission_id),
    );

    for permission_id in candidates {
        match enqueue_grant_fanout(roster, context, &permission_id, now)? {
            GrantDisposition::Fanned => outcome.grants_fanned_out += 1,
            GrantDisposition::Skipped(reason) => {
                outcome.grants_skipped += 1;
                outcome.notes.push(format!("grant {permission_id}: {reason}"));
            }
            GrantDisposition::AlreadyProcessed => {}
        }
    }
    Ok(())
}

/// Queue one allocation item per roster specialist for a fresh grant.
///
/// Every final verdict on a grant marks it in the processed set, whether it
/// fanned out or not, so the store poll stops revisiting it. Conditions that
/// can still change (a missing record, a roster fault) leave the grant
/// unmarked. `Err` is reserved for roster faults that no grant can get past.
fn enqueue_grant_fanout(
    roster: &[SpecialistProfile],
    context: &FanoutContext,
    permission_id: &str,
    now: u64,
) -> Result<GrantDisposition, String> {
    if stable::is_permission_processed(permission_id) {
        return Ok(GrantDisposition::AlreadyProcessed);
    }
    let grant = match stable::get_grant(permission_id) {
        Some(grant) => grant,
        None => return Ok(GrantDisposition::Skipped("grant no longer exists".to_string())),
    };
    if grant.status != DelegationStatus::Pending {
        return Ok(GrantDisposition::Skipped(format!(
            "status is {:?}",
            grant.status
        )));
    }
    if grant.expires_at_ns <= now {
        stable::try_mark_permission_processed(permission_id, now);
        return Ok(GrantDisposition::Skipped(
            "expired before fan-out".to_string(),
        ));
    }
    // One fan-out per user per grant epoch: while earlier redelegations for
    // this user are still live, the grant is consumed without allocating.
    if stable::count_active_redelegations_for_user(&context.manager_address, &grant.user_address, now)
        > 0
    {
        stable::try_mark_permission_processed(permission_id, now);
        return Ok(GrantDisposition::Skipped(
            "user already holds live redelegations".to_string(),
        ));
    }
    let total = match parse_wei(&grant.total_amount_wei, "grant total amount") {
        Ok(total) => total,
        Err(error) => {
            stable::try_mark_permission_processed(permission_id, now);
            return Ok(GrantDisposition::Skipped(error));
        }
    };
    if total.is_zero() {
        stable::try_mark_permission_processed(permission_id, now);
        return Ok(GrantDisposition::Skipped("total amount is zero".to_string()));
    }

    let shares = split_allocation(total, roster)?;
    if !stable::try_mark_permission_processed(permission_id, now) {
        return Ok(GrantDisposition::AlreadyProcessed);
    }

    let spacing_ns = FANOUT_CALL_SPACING_SECS * NANOS_PER_SEC;
    let mut queued = 0usize;
    for share in shares {
        if share.amount_wei.is_zero() {
            continue;
        }
        stable::upsert_allocation(&AllocationItem {
            id: stable::next_allocation_id(),
            permission_id: permission_id.to_string(),
            user_address: grant.user_address.clone(),
            specialist_agent_id: share.agent_id,
            specialist_address: share.wallet_address,
            token_address: grant.token_address.clone(),
            amount_wei: share.amount_wei.to_string(),
            attempts: 0,
            not_before_ns: stable::next_fanout_slot(now, spacing_ns),
            status: AllocationStatus::Queued,
            delegation_hash: None,
            tx_hash: None,
            error: None,
            created_at_ns: now,
            updated_at_ns: now,
        });
        queued += 1;
    }
    log!(
        DispatchLogPriority::Info,
        "grant_fanned_out permission_id={permission_id} allocations={queued} total_wei={total}"
    );
    Ok(GrantDisposition::Fanned)
}

async fn drain_allocation_queue(
    registry: &dyn RegistryPort,
    context: &FanoutContext,
    outcome: &mut DispatchOutcome,
) -> Result<(), String> {
    for _ in 0..MAX_DRAINS_PER_PASS {
        let now = current_time_ns();
        let item = match stable::next_ready_allocation(now) {
            Some(item) => item,
            None => break,
        };
        drain_one_allocation(registry, context, item, now, outcome).await?;
    }
    Ok(())
}

async fn drain_one_allocation(
    registry: &dyn RegistryPort,
    context: &FanoutContext,
    mut item: AllocationItem,
    now: u64,
    outcome: &mut DispatchOutcome,
) -> Result<(), String> {
    let grant = match stable::get_grant(&item.permission_id) {
        Some(grant) => grant,
        None => {
            cancel_allocation(&mut item, "grant no longer exists", now, outcome);
            return Ok(());
        }
    };
    match grant.status {
        DelegationStatus::Pending | DelegationStatus::Claimed => {}
        ref status => {
            let reason = format!("grant is {status:?}");
            cancel_allocation(&mut item, &reason, now, outcome);
            return Ok(());
        }
    }
    if grant.expires_at_ns <= now {
        cancel_allocation(&mut item, "grant expired before funding", now, outcome);
        return Ok(());
    }

    let result = registry
        .log_redelegation(
            &item.specialist_agent_id,
            &item.user_address,
            &item.token_address,
            &item.amount_wei,
            grant.expires_at_ns,
        )
        .await;
    item.updated_at_ns = now;

    let (delegation_hash, tx_hash) = match result {
        Ok(confirmed) => confirmed,
        Err(error) => return record_drain_failure(item, error, now, outcome),
    };

    item.attempts += 1;
    stable::upsert_delegation_record(&DelegationRecord {
        delegation_hash: delegation_hash.clone(),
        parent_agent_id: context.manager_address.clone(),
        child_agent_id: item.specialist_agent_id.clone(),
        child_address: item.specialist_address.clone(),
        user_address: item.user_address.clone(),
        token_address: item.token_address.clone(),
        amount_wei: item.amount_wei.clone(),
        created_at_ns: now,
        expires_at_ns: grant.expires_at_ns,
        payload_hex: grant.payload_hex.clone(),
        status: DelegationStatus::Pending,
        redeemed_at_ns: None,
        redemption_tx_hash: None,
        last_error: None,
    });
    if grant.status == DelegationStatus::Pending {
        stable::mark_grant_claimed(&item.permission_id, &tx_hash, now)?;
    }
    stable::record_grant_usage(&item.permission_id, &item.amount_wei)?;
    stable::push_intake(IntakeKind::Redelegation, &delegation_hash, now);

    item.status = AllocationStatus::Funded;
    item.delegation_hash = Some(delegation_hash.clone());
    item.tx_hash = Some(tx_hash.clone());
    item.error = None;
    stable::upsert_allocation(&item);
    outcome.allocations_funded += 1;
    log!(
        DispatchLogPriority::Info,
        "allocation_funded id={} specialist={} amount_wei={} delegation_hash={}",
        item.id,
        item.specialist_agent_id,
        item.amount_wei,
        delegation_hash
    );

    // Funnel the event into the ledger now instead of waiting for the
    // poller; the semantic dedup key absorbs the later polled copy.
    ledger::apply_observed_event(&ObservedEvent {
        chain_id: context.chain_id,
        block_number: 0,
        log_index: 0,
        tx_hash,
        observed_at_ns: now,
        event: LedgerEvent::RedelegationCreated {
            delegation_hash,
            parent_agent_id: context.manager_address.clone(),
            child_agent_id: item.specialist_address.clone(),
            user_address: item.user_address.clone(),
            amount_wei: item.amount_wei.clone(),
            expires_at_ns: grant.expires_at_ns,
        },
    })?;
    Ok(())
}

fn record_drain_failure(
    mut item: AllocationItem,
    error: String,
    now: u64,
    outcome: &mut DispatchOutcome,
) -> Result<(), String> {
    match classify_chain_failure(&error) {
        // Nothing else will succeed this pass either; leave the item queued
        // with its attempt budget intact.
        RecoveryFailure::Operation(OperationFailure {
            kind:
                OperationFailureKind::BlockedBySurvivalPolicy | OperationFailureKind::InsufficientCycles,
        }) => Err(error),
        RecoveryFailure::Outcall(OutcallFailure {
            kind: OutcallFailureKind::RateLimited,
            ..
        }) if item.attempts + 1 < MAX_FANOUT_ATTEMPTS => {
            item.attempts += 1;
            item.not_before_ns = now + RATE_LIMIT_COOLDOWN_SECS * NANOS_PER_SEC;
            item.error = Some(error.clone());
            stable::upsert_allocation(&item);
            outcome.allocations_requeued += 1;
            log!(
                DispatchLogPriority::Error,
                "allocation_requeued id={} err={}",
                item.id,
                error
            );
            outcome
                .notes
                .push(format!("allocation {}: requeued after {error}", item.id));
            Ok(())
        }
        _ => {
            item.attempts += 1;
            item.status = AllocationStatus::NotFunded;
            item.error = Some(error.clone());
            stable::upsert_allocation(&item);
            outcome.allocations_abandoned += 1;
            log!(
                DispatchLogPriority::Error,
                "allocation_abandoned id={} attempts={} err={}",
                item.id,
                item.attempts,
                error
            );
            outcome
                .notes
                .push(format!("allocation {}: abandoned after {error}", item.id));
            Ok(())
        }
    }
}

fn cancel_allocation(
    item: &mut AllocationItem,
    reason: &str,
    now: u64,
    outcome: &mut DispatchOutcome,
) {
    item.status = AllocationStatus::NotFunded;
    item.error = Some(reason.to_string());
    item.updated_at_ns = now;
    stable::upsert_allocation(item);
    outcome.allocations_cancelled += 1;
    outcome
        .notes
        .push(format!("allocation {}: {reason}", item.id));
}
