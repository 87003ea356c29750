//! Timer-driven job scheduler.
//!
//! Every tick: recover the stale mutating lease, reap abandoned jobs,
//! materialize due task slots into the persisted job queue, then drain the
//! observational lane and up to `MAX_MUTATING_JOBS_PER_TICK` mutating jobs.
//! Mutating jobs run one at a time under a lease; task failures flow through
//! the recovery policy and stamp per-task backoff windows.

use crate::chain::bank::ChainTransferAdapter;
use crate::chain::oracle::OracleContractAdapter;
use crate::chain::poller::{HttpLedgerPoller, LedgerPoller};
use crate::chain::registry::RegistryContractAdapter;
use crate::chain::rpc::{
    DEFAULT_RPC_MAX_RESPONSE_BYTES, MAX_RPC_RESPONSE_BYTES, MIN_RPC_RESPONSE_BYTES,
};
use crate::chain::signer;
use crate::chain::venue::StubSwapVenue;
use crate::dispatcher;
use crate::domain::cycle_admission::{
    covers_above_floor, demand_for, estimate_cost, CycleDemand, PaidOperation,
    RESERVE_FLOOR_CYCLES, SAFETY_MARGIN_BPS,
};
use crate::domain::recovery_policy::{classify_chain_failure, decide_recovery_action};
use crate::domain::types::{
    DelegationStatus, JobStatus, RecoveryContext, RecoveryPolicyAction, ResponseLimitPolicy,
    RuntimeSnapshot, ScheduledJob, SurvivalOperationClass, SurvivalTier, TaskKind, TaskLane,
};
use crate::executor;
use crate::ledger::apply::{apply_observed_event, ApplyOutcome};
use crate::oracle_sync;
use crate::storage::stable;
use crate::timing::{
    current_time_ns, BASE_TICK_SECS, EMPTY_POLL_BACKOFF_SCHEDULE_SECS, LIGHTWEIGHT_LEASE_TTL_NS,
    NANOS_PER_SEC, PIPELINE_LEASE_TTL_NS,
};
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};

const MAX_MUTATING_JOBS_PER_TICK: u8 = 4;
const MAX_OBSERVATIONAL_JOBS_PER_TICK: u8 = 2;
const JOB_HISTORY_KEEP: usize = 200;
const DEFAULT_TASK_MAX_BACKOFF_SECS: u64 = 3_600;
const LEDGER_POLL_FAILURE_MAX_BACKOFF_SECS: u64 = 600;

const CHECKCYCLES_REFERENCE_ENVELOPE_CYCLES: u128 = 5_000_000_000;
const CHECKCYCLES_LOW_TIER_MULTIPLIER: u128 = 4;

#[cfg(not(target_arch = "wasm32"))]
const HOST_FALLBACK_TOTAL_CYCLES: u128 = 2_000_000_000_000;
#[cfg(not(target_arch = "wasm32"))]
const HOST_FALLBACK_LIQUID_CYCLES: u128 = 1_800_000_000_000;

#[derive(Clone, Copy, Debug, LogPriorityLevels)]
enum SchedulerLogPriority {
    #[log_level(capacity = 2000, name = "SCHEDULER_INFO")]
    Info,
    #[log_level(capacity = 500, name = "SCHEDULER_WARN")]
    Warn,
    #[log_level(capacity = 500, name = "SCHEDULER_ERROR")]
    Error,
}

impl GetLogFilter for SchedulerLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

pub async fn scheduler_tick() {
    let now_ns = current_time_ns();
    stable::record_scheduler_tick_start(now_ns);
    log!(
        SchedulerLogPriority::Info,
        "scheduler_tick_start now={now_ns}"
    );

    if let Some(job_id) = stable::recover_stale_lease(now_ns) {
        log!(
            SchedulerLogPriority::Warn,
            "scheduler_lease_recovered job_id={job_id}"
        );
    }
    for job_id in stable::reap_stuck_jobs(now_ns, PIPELINE_LEASE_TTL_NS) {
        log!(
            SchedulerLogPriority::Warn,
            "scheduler_stuck_job_reaped job_id={job_id}"
        );
    }

    if !stable::scheduler_enabled() {
        log!(
            SchedulerLogPriority::Info,
            "scheduler_tick_end disabled now={now_ns}"
        );
        stable::record_scheduler_tick_end(current_time_ns(), None);
        return;
    }

    maybe_derive_wallet_addresses().await;
    refresh_due_jobs(now_ns);

    let mut observational_jobs = 0u8;
    while observational_jobs < MAX_OBSERVATIONAL_JOBS_PER_TICK {
        if !run_one_observational_job(current_time_ns()).await {
            break;
        }
        observational_jobs = observational_jobs.saturating_add(1);
    }

    let mut mutating_jobs = 0u8;
    let mut terminal_error: Option<String> = None;
    while mutating_jobs < MAX_MUTATING_JOBS_PER_TICK {
        match run_one_pending_mutating_job(current_time_ns()).await {
            Ok(true) => mutating_jobs = mutating_jobs.saturating_add(1),
            Ok(false) => break,
            Err(error) => {
                terminal_error = Some(error);
                break;
            }
        }
    }

    stable::prune_job_history(JOB_HISTORY_KEEP);

    log!(
        SchedulerLogPriority::Info,
        "scheduler_tick_end observational_jobs={} mutating_jobs={} now={}",
        observational_jobs,
        mutating_jobs,
        current_time_ns()
    );
    stable::record_scheduler_tick_end(current_time_ns(), terminal_error);
}

/// `init` cannot await the management canister, so the first enabled tick
/// fills in any wallet address the threshold key has not yet produced.
async fn maybe_derive_wallet_addresses() {
    let snapshot = stable::runtime_snapshot();
    if snapshot.ecdsa_key_name.trim().is_empty() {
        return;
    }
    let roster_incomplete = snapshot
        .roster
        .iter()
        .any(|profile| profile.wallet_address.trim().is_empty());
    if snapshot.manager_address.is_some() && !roster_incomplete {
        return;
    }
    match signer::derive_and_cache_wallet_addresses(&snapshot.ecdsa_key_name).await {
        Ok(()) => log!(
            SchedulerLogPriority::Info,
            "wallet_addresses_derived roster={}",
            snapshot.roster.len()
        ),
        Err(error) => log!(
            SchedulerLogPriority::Error,
            "wallet_address_derivation_failed err={error}"
        ),
    }
}

/// Materialize a pending job for every enabled task whose slot has arrived.
///
/// Slots are aligned to the task interval and deduped on
/// `{kind}:{slot_start_ns}`, so a re-entrant tick cannot double-enqueue.
/// `next_due_ns` advances one interval but never trails the current slot,
/// which keeps a long-stalled task from firing a catch-up burst.
pub fn refresh_due_jobs(now_ns: u64) {
    let mut schedules = stable::list_task_configs();
    schedules.sort_by_key(|(kind, config)| (config.priority, kind.as_str()));
    let low_cycles = stable::scheduler_low_cycles_mode();

    for (kind, config) in schedules {
        if !config.enabled {
            continue;
        }
        if low_cycles && !config.essential {
            continue;
        }
        let interval_ns = config.interval_secs.saturating_mul(NANOS_PER_SEC);
        if interval_ns == 0 {
            continue;
        }

        let Some(mut runtime) = stable::get_task_runtime(&kind) else {
            continue;
        };
        if let Some(job_id) = runtime.pending_job_id.clone() {
            let still_pending = stable::get_job(&job_id)
                .map(|job| job.status == JobStatus::Pending)
                .unwrap_or(false);
            if still_pending {
                continue;
            }
            // The job finished or was pruned without clearing the marker.
            runtime.pending_job_id = None;
        }
        if runtime.backoff_until_ns.is_some_and(|until| until > now_ns) {
            continue;
        }
        if runtime.next_due_ns > now_ns {
            continue;
        }

        let slot_start_ns = now_ns - (now_ns % interval_ns);
        let dedupe_key = format!("{}:{}", kind.as_str(), slot_start_ns);
        if let Some(job_id) = stable::enqueue_job_if_absent(
            kind.clone(),
            task_lane(&kind),
            &dedupe_key,
            slot_start_ns,
            config.priority,
        ) {
            runtime.pending_job_id = Some(job_id.clone());
            log!(
                SchedulerLogPriority::Info,
                "scheduler_job_enqueued kind={} job_id={} slot={} priority={}",
                kind.as_str(),
                job_id,
                slot_start_ns,
                config.priority,
            );
        }

        // Prevent bursty catch-up after a long pause: advance by one interval
        // but never behind the slot that was just scheduled.
        let advanced_due_ns = runtime.next_due_ns.saturating_add(interval_ns);
        let aligned_due_ns = slot_start_ns.saturating_add(interval_ns);
        runtime.next_due_ns = advanced_due_ns.max(aligned_due_ns);
        stable::save_task_runtime(&runtime);
    }
}

async fn run_one_observational_job(now_ns: u64) -> bool {
    let Some(job) = stable::pop_next_pending_job(&TaskLane::Observational, now_ns) else {
        return false;
    };
    log!(
        SchedulerLogPriority::Info,
        "scheduler_job_dequeued job_id={} kind={} lane=observational",
        job.id,
        job.kind.as_str(),
    );
    mark_task_started(&job.kind, now_ns);
    let result = run_task_job(&job).await;
    finish_job(&job, result, current_time_ns());
    true
}

async fn run_one_pending_mutating_job(now_ns: u64) -> Result<bool, String> {
    if stable::mutating_lease_active(now_ns) {
        log!(
            SchedulerLogPriority::Info,
            "scheduler_mutating_lease_active now={now_ns}",
        );
        return Ok(false);
    }

    let Some(job) = stable::pop_next_pending_job(&TaskLane::Mutating, now_ns) else {
        return Ok(false);
    };
    log!(
        SchedulerLogPriority::Info,
        "scheduler_job_dequeued job_id={} kind={} lane=mutating",
        job.id,
        job.kind.as_str(),
    );

    if !stable::acquire_mutating_lease(&job.id, now_ns, lease_ttl_ns(&job.kind)) {
        let error = "mutating lease is already held".to_string();
        log!(
            SchedulerLogPriority::Error,
            "scheduler_lease_error job_id={} err={}",
            job.id,
            error
        );
        stable::complete_job(
            &job.id,
            JobStatus::Failed,
            Some(error.clone()),
            current_time_ns(),
        );
        return Err(error);
    }

    if let Some(operation_class) = operation_class_for_task(&job.kind) {
        let tier = stable::scheduler_survival_tier();
        if !survival_tier_allows(&tier, &operation_class)
            || !stable::can_run_survival_operation(&operation_class, now_ns)
        {
            let reason = "operation blocked by survival policy";
            stable::complete_job(
                &job.id,
                JobStatus::Skipped,
                Some(reason.to_string()),
                current_time_ns(),
            );
            log!(
                SchedulerLogPriority::Info,
                "scheduler_job_skipped job_id={} kind={} class={} tier={:?} reason={reason}",
                job.id,
                job.kind.as_str(),
                operation_class.as_str(),
                tier
            );
            return Ok(true);
        }
    }

    mark_task_started(&job.kind, now_ns);
    let result = run_task_job(&job).await;
    finish_job(&job, result, current_time_ns());
    Ok(true)
}

async fn run_task_job(job: &ScheduledJob) -> Result<(), String> {
    match job.kind {
        TaskKind::LedgerPoll => run_ledger_poll_job(current_time_ns()).await,
        TaskKind::Dispatch => run_dispatch_job().await,
        TaskKind::StrategyCycle => run_strategy_cycle_job().await,
        TaskKind::OracleSync => run_oracle_sync_job().await,
        TaskKind::DelegationSweep => run_delegation_sweep(current_time_ns()),
        TaskKind::CheckCycles => run_check_cycles().await,
    }
}

fn finish_job(job: &ScheduledJob, result: Result<(), String>, now: u64) {
    match result {
        Ok(()) => {
            stable::complete_job(&job.id, JobStatus::Succeeded, None, now);
            record_task_success(&job.kind, now);
        }
        Err(error) => {
            let status = record_task_failure(&job.kind, &error, now);
            stable::complete_job(&job.id, status, Some(error), now);
        }
    }
}

fn mark_task_started(kind: &TaskKind, now: u64) {
    if let Some(mut runtime) = stable::get_task_runtime(kind) {
        runtime.last_started_ns = Some(now);
        stable::save_task_runtime(&runtime);
    }
}

fn record_task_success(kind: &TaskKind, now: u64) {
    if let Some(mut runtime) = stable::get_task_runtime(kind) {
        runtime.consecutive_failures = 0;
        runtime.backoff_until_ns = None;
        runtime.pending_job_id = None;
        runtime.last_finished_ns = Some(now);
        runtime.last_error = None;
        stable::save_task_runtime(&runtime);
    }
}

/// Classify a task failure and apply the recovery decision. Returns the
/// status to record on the job: `Skipped` when the run was blocked rather
/// than broken, `Failed` otherwise.
fn record_task_failure(kind: &TaskKind, error: &str, now: u64) -> JobStatus {
    let Some(mut runtime) = stable::get_task_runtime(kind) else {
        log!(
            SchedulerLogPriority::Error,
            "scheduler_task_failed kind={} err={} runtime=uninitialized",
            kind.as_str(),
            error
        );
        return JobStatus::Failed;
    };

    let max_backoff_secs = stable::get_task_config(kind)
        .map(|config| config.max_backoff_secs)
        .unwrap_or(DEFAULT_TASK_MAX_BACKOFF_SECS);
    let failure = classify_chain_failure(error);
    let context = RecoveryContext {
        consecutive_failures: runtime.consecutive_failures,
        backoff_base_secs: BASE_TICK_SECS,
        backoff_max_secs: max_backoff_secs,
        response_limit: response_limit_policy(kind),
    };
    let decision = decide_recovery_action(&failure, &context);

    runtime.pending_job_id = None;
    runtime.last_finished_ns = Some(now);
    runtime.last_error = Some(error.to_string());

    let status = match decision.action {
        RecoveryPolicyAction::Skip => JobStatus::Skipped,
        RecoveryPolicyAction::RetryImmediate => {
            runtime.consecutive_failures = runtime.consecutive_failures.saturating_add(1);
            JobStatus::Failed
        }
        RecoveryPolicyAction::Backoff => {
            runtime.consecutive_failures = runtime.consecutive_failures.saturating_add(1);
            let backoff_secs = decision.backoff_secs.unwrap_or(BASE_TICK_SECS);
            runtime.backoff_until_ns =
                Some(now.saturating_add(backoff_secs.saturating_mul(NANOS_PER_SEC)));
            JobStatus::Failed
        }
        RecoveryPolicyAction::TuneResponseLimit => {
            runtime.consecutive_failures = runtime.consecutive_failures.saturating_add(1);
            if let Some(adjustment) = decision.response_limit_adjustment.as_ref() {
                stable::set_max_response_bytes(Some(adjustment.to_bytes));
                log!(
                    SchedulerLogPriority::Warn,
                    "scheduler_response_limit_tuned kind={} from={} to={}",
                    kind.as_str(),
                    adjustment.from_bytes,
                    adjustment.to_bytes
                );
            }
            JobStatus::Failed
        }
        RecoveryPolicyAction::EscalateFault => {
            runtime.consecutive_failures = runtime.consecutive_failures.saturating_add(1);
            if let Err(disable_error) = stable::set_task_enabled(kind, false) {
                log!(
                    SchedulerLogPriority::Error,
                    "scheduler_task_disable_error kind={} err={}",
                    kind.as_str(),
                    disable_error
                );
            }
            JobStatus::Failed
        }
    };

    log!(
        SchedulerLogPriority::Error,
        "scheduler_task_failed kind={} action={:?} failures={} err={}",
        kind.as_str(),
        decision.action,
        runtime.consecutive_failures,
        error
    );
    stable::save_task_runtime(&runtime);
    status
}

fn response_limit_policy(kind: &TaskKind) -> Option<ResponseLimitPolicy> {
    // Only the log scan pulls responses large enough to hit the outcall cap.
    if !matches!(kind, TaskKind::LedgerPoll) {
        return None;
    }
    Some(ResponseLimitPolicy {
        current_bytes: stable::runtime_snapshot()
            .max_response_bytes
            .unwrap_or(DEFAULT_RPC_MAX_RESPONSE_BYTES),
        min_bytes: MIN_RPC_RESPONSE_BYTES,
        max_bytes: MAX_RPC_RESPONSE_BYTES,
        tune_multiplier: 2,
    })
}

async fn run_ledger_poll_job(now_ns: u64) -> Result<(), String> {
    let snapshot = stable::runtime_snapshot();
    if snapshot.rpc_url.trim().is_empty() {
        log!(
            SchedulerLogPriority::Info,
            "ledger_poll_skipped reason=rpc_unconfigured"
        );
        return Ok(());
    }
    if snapshot.registry_address.is_none() {
        log!(
            SchedulerLogPriority::Info,
            "ledger_poll_skipped reason=registry_unconfigured"
        );
        return Ok(());
    }

    let cursor = snapshot.ledger_cursor.clone();
    if !ledger_poll_due(now_ns, cursor.last_poll_at_ns, cursor.consecutive_empty_polls) {
        log!(
            SchedulerLogPriority::Info,
            "ledger_poll_backoff_skip now={} last_poll_at={} empty_polls={}",
            now_ns,
            cursor.last_poll_at_ns,
            cursor.consecutive_empty_polls
        );
        return Ok(());
    }

    let poller = HttpLedgerPoller::from_snapshot(&snapshot)?;
    let poll = poller.poll(&cursor).await.inspect_err(|_| {
        stable::record_survival_operation_failure(
            &SurvivalOperationClass::LedgerPoll,
            now_ns,
            LEDGER_POLL_FAILURE_MAX_BACKOFF_SECS,
        );
    })?;

    let mut applied = 0usize;
    let mut duplicates = 0usize;
    let mut integrity_skips = 0usize;
    for event in &poll.events {
        match apply_observed_event(event) {
            Ok(ApplyOutcome::Applied) => applied += 1,
            Ok(ApplyOutcome::AlreadyApplied) => duplicates += 1,
            Ok(ApplyOutcome::Skipped(reason)) => {
                integrity_skips += 1;
                log!(
                    SchedulerLogPriority::Warn,
                    "ledger_event_skipped tx={} reason={}",
                    event.tx_hash,
                    reason
                );
            }
            Err(error) => {
                log!(
                    SchedulerLogPriority::Error,
                    "ledger_apply_error tx={} err={}",
                    event.tx_hash,
                    error
                );
            }
        }
    }
    for reason in &poll.skipped {
        log!(SchedulerLogPriority::Warn, "ledger_log_undecodable {reason}");
    }

    stable::save_ledger_cursor(&poll.cursor);
    stable::record_survival_operation_success(&SurvivalOperationClass::LedgerPoll);
    log!(
        SchedulerLogPriority::Info,
        "ledger_poll_done fetched={} applied={} duplicate={} integrity_skipped={} next_block={} empty_polls={}",
        poll.events.len(),
        applied,
        duplicates,
        integrity_skips,
        poll.cursor.next_block,
        poll.cursor.consecutive_empty_polls
    );
    Ok(())
}

async fn run_dispatch_job() -> Result<(), String> {
    let snapshot = stable::runtime_snapshot();
    if !chain_write_config_ready(&snapshot) {
        log!(
            SchedulerLogPriority::Info,
            "dispatch_skipped reason=chain_config_incomplete"
        );
        return Ok(());
    }
    let registry = RegistryContractAdapter::from_snapshot(&snapshot)?;
    let outcome = dispatcher::dispatch_pass(&registry).await?;
    for note in &outcome.notes {
        log!(SchedulerLogPriority::Info, "dispatch_note {note}");
    }
    log!(
        SchedulerLogPriority::Info,
        "dispatch_pass_done fanned={} skipped={} funded={} requeued={} abandoned={} cancelled={}",
        outcome.grants_fanned_out,
        outcome.grants_skipped,
        outcome.allocations_funded,
        outcome.allocations_requeued,
        outcome.allocations_abandoned,
        outcome.allocations_cancelled
    );
    Ok(())
}

async fn run_strategy_cycle_job() -> Result<(), String> {
    let snapshot = stable::runtime_snapshot();
    if !chain_write_config_ready(&snapshot) {
        log!(
            SchedulerLogPriority::Info,
            "strategy_cycle_skipped reason=chain_config_incomplete"
        );
        return Ok(());
    }
    let registry = RegistryContractAdapter::from_snapshot(&snapshot)?;
    let transfers = ChainTransferAdapter::from_snapshot(&snapshot)?;
    let venue = StubSwapVenue;
    let outcome = executor::strategy_cycle(&registry, &venue, &transfers).await?;
    for note in &outcome.notes {
        log!(SchedulerLogPriority::Info, "strategy_note {note}");
    }
    log!(
        SchedulerLogPriority::Info,
        "strategy_cycle_done redeemed={} traded={} failed={} skipped={} settled={}",
        outcome.redemptions_completed,
        outcome.trades_executed,
        outcome.trades_failed,
        outcome.trades_skipped,
        outcome.settlements_completed
    );
    Ok(())
}

async fn run_oracle_sync_job() -> Result<(), String> {
    let snapshot = stable::runtime_snapshot();
    if snapshot.rpc_url.trim().is_empty()
        || snapshot.oracle_address.is_none()
        || snapshot.ecdsa_key_name.trim().is_empty()
    {
        log!(
            SchedulerLogPriority::Info,
            "oracle_sync_skipped reason=oracle_config_incomplete"
        );
        return Ok(());
    }
    let oracle = OracleContractAdapter::from_snapshot(&snapshot)?;
    let outcome = oracle_sync::sync_pass(&oracle).await?;
    for note in &outcome.notes {
        log!(SchedulerLogPriority::Info, "oracle_sync_note {note}");
    }
    if outcome.deferred {
        log!(SchedulerLogPriority::Info, "oracle_sync_deferred");
    } else {
        log!(
            SchedulerLogPriority::Info,
            "oracle_sync_done pushed={} skipped={} batches={}",
            outcome.pushed,
            outcome.skipped,
            outcome.batches_sent
        );
    }
    Ok(())
}

/// Move past-due `Pending` grants and records to `Expired` and deactivate
/// lapsed redelegation rows. Claimed and redeemed rows are left alone; their
/// expiry is enforced by timestamp checks at the point of use.
fn run_delegation_sweep(now_ns: u64) -> Result<(), String> {
    let mut grants_expired = 0u32;
    for grant in stable::list_expired_pending_grants(now_ns) {
        match stable::transition_grant_status(&grant.permission_id, DelegationStatus::Expired, now_ns)
        {
            Ok(_) => grants_expired += 1,
            Err(error) => log!(
                SchedulerLogPriority::Warn,
                "sweep_grant_error permission_id={} err={}",
                grant.permission_id,
                error
            ),
        }
    }

    let mut records_expired = 0u32;
    for record in stable::list_expired_pending_records(now_ns) {
        match stable::transition_record_status(
            &record.delegation_hash,
            DelegationStatus::Expired,
            now_ns,
        ) {
            Ok(_) => records_expired += 1,
            Err(error) => log!(
                SchedulerLogPriority::Warn,
                "sweep_record_error delegation_hash={} err={}",
                record.delegation_hash,
                error
            ),
        }
    }

    let redelegations_deactivated = stable::deactivate_expired_redelegations(now_ns);
    log!(
        SchedulerLogPriority::Info,
        "delegation_sweep_done grants_expired={} records_expired={} redelegations_deactivated={}",
        grants_expired,
        records_expired,
        redelegations_deactivated
    );
    Ok(())
}

async fn run_check_cycles() -> Result<(), String> {
    let (total_cycles, liquid_cycles) = cycle_balances();
    let observed = classify_survival_tier(total_cycles, liquid_cycles)?;
    let demand = check_cycles_demand()?;

    stable::set_scheduler_survival_tier(observed.clone());
    let runtime_tier = stable::scheduler_survival_tier();
    let recovery_checks = stable::scheduler_survival_tier_recovery_checks();

    log!(
        SchedulerLogPriority::Info,
        "check_cycles total={} liquid={} required={} low_tier_limit={} observed_tier={:?} runtime_tier={:?} recovery_checks={}",
        total_cycles,
        liquid_cycles,
        demand.required_cycles,
        demand
            .required_cycles
            .saturating_mul(CHECKCYCLES_LOW_TIER_MULTIPLIER),
        observed,
        runtime_tier,
        recovery_checks
    );
    Ok(())
}

fn cycle_balances() -> (u128, u128) {
    #[cfg(target_arch = "wasm32")]
    return (
        ic_cdk::api::canister_cycle_balance(),
        ic_cdk::api::canister_liquid_cycle_balance(),
    );

    #[cfg(not(target_arch = "wasm32"))]
    (HOST_FALLBACK_TOTAL_CYCLES, HOST_FALLBACK_LIQUID_CYCLES)
}

fn check_cycles_demand() -> Result<CycleDemand, String> {
    let operation_cost = estimate_cost(&PaidOperation::FixedEnvelope {
        cycles: CHECKCYCLES_REFERENCE_ENVELOPE_CYCLES,
    })?;
    Ok(demand_for(operation_cost, SAFETY_MARGIN_BPS, 0))
}

fn classify_survival_tier(total_cycles: u128, liquid_cycles: u128) -> Result<SurvivalTier, String> {
    let can_cover_critical_floor = covers_above_floor(
        total_cycles,
        &PaidOperation::FixedEnvelope {
            cycles: CHECKCYCLES_REFERENCE_ENVELOPE_CYCLES,
        },
        SAFETY_MARGIN_BPS,
        RESERVE_FLOOR_CYCLES,
    )?;
    if !can_cover_critical_floor {
        return Ok(SurvivalTier::Critical);
    }

    let demand = check_cycles_demand()?;
    if liquid_cycles < demand.required_cycles {
        return Ok(SurvivalTier::Critical);
    }

    let low_threshold = demand
        .required_cycles
        .saturating_mul(CHECKCYCLES_LOW_TIER_MULTIPLIER);
    if liquid_cycles < low_threshold {
        return Ok(SurvivalTier::LowCycles);
    }

    Ok(SurvivalTier::Normal)
}

fn chain_write_config_ready(snapshot: &RuntimeSnapshot) -> bool {
    !snapshot.rpc_url.trim().is_empty()
        && snapshot.registry_address.is_some()
        && !snapshot.ecdsa_key_name.trim().is_empty()
}

fn empty_poll_backoff_delay_ns(consecutive_empty_polls: u32) -> u64 {
    if consecutive_empty_polls == 0 {
        return 0;
    }
    let index = (consecutive_empty_polls - 1) as usize;
    let secs = EMPTY_POLL_BACKOFF_SCHEDULE_SECS
        .get(index)
        .or_else(|| EMPTY_POLL_BACKOFF_SCHEDULE_SECS.last())
        .copied()
        .unwrap_or(BASE_TICK_SECS);
    secs.saturating_mul(NANOS_PER_SEC)
}

fn ledger_poll_due(now_ns: u64, last_poll_at_ns: u64, consecutive_empty_polls: u32) -> bool {
    if last_poll_at_ns == 0 {
        return true;
    }
    now_ns >= last_poll_at_ns.saturating_add(empty_poll_backoff_delay_ns(consecutive_empty_polls))
}

/// Which survival classes a tier still permits. Reads keep running on low
/// cycles so the ledger stays current; anything that signs or broadcasts
/// waits for recovery.
fn survival_tier_allows(tier: &SurvivalTier, class: &SurvivalOperationClass) -> bool {
    match tier {
        SurvivalTier::Normal => true,
        SurvivalTier::LowCycles => matches!(
            class,
            SurvivalOperationClass::LedgerPoll | SurvivalOperationClass::ChainRead
        ),
        SurvivalTier::Critical | SurvivalTier::OutOfCycles => false,
    }
}

fn operation_class_for_task(kind: &TaskKind) -> Option<SurvivalOperationClass> {
    match kind {
        TaskKind::LedgerPoll => Some(SurvivalOperationClass::LedgerPoll),
        TaskKind::Dispatch | TaskKind::StrategyCycle | TaskKind::OracleSync => {
            Some(SurvivalOperationClass::ChainBroadcast)
        }
        TaskKind::DelegationSweep | TaskKind::CheckCycles => None,
    }
}

fn task_lane(kind: &TaskKind) -> TaskLane {
    match kind {
        TaskKind::CheckCycles => TaskLane::Observational,
        _ => TaskLane::Mutating,
    }
}

fn lease_ttl_ns(kind: &TaskKind) -> u64 {
    match kind {
        TaskKind::Dispatch | TaskKind::StrategyCycle | TaskKind::OracleSync => PIPELINE_LEASE_TTL_NS,
        TaskKind::LedgerPoll | TaskKind::DelegationSweep | TaskKind::CheckCycles => {
            LIGHTWEIGHT_LEASE_TTL_NS
        }
    }
}
