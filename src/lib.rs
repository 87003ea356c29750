mod chain;
mod dispatcher;
mod domain;
mod executor;
mod ledger;
mod oracle_sync;
mod scheduler;
mod settlement;
mod storage;
#[cfg(test)]
mod test_support;
mod timing;

use crate::domain::amount::parse_wei;
use crate::domain::reputation::compute_score;
use crate::domain::types::{
    Agent, AllocationItem, DailyAgentStats, DelegationRecord, DelegationStatus, Execution,
    GlobalStats, IntakeKind, LedgerPollCursor, OracleSyncState, PermissionGrant, Redelegation,
    ReputationView, RuntimeView, ScheduledJob, SchedulerRuntimeView, SpecialistProfile,
    StaleExecution, TaskKind, TaskScheduleConfig, TaskScheduleRuntime, UserAccount,
};
use crate::ledger::apply::score_inputs;
use crate::scheduler::scheduler_tick;
use crate::storage::stable;
use crate::timing::{current_time_ns, NANOS_PER_SEC, SCHEDULER_TICK_INTERVAL_SECS};
use candid::CandidType;
use ic_cdk_timers::set_timer_interval_serial;
use serde::Deserialize;
use std::time::Duration;

#[derive(CandidType, Deserialize)]
struct InitArgs {
    #[serde(default)]
    chain_id: Option<u64>,
    #[serde(default)]
    rpc_url: Option<String>,
    #[serde(default)]
    fallback_rpc_url: Option<String>,
    #[serde(default)]
    registry_address: Option<String>,
    #[serde(default)]
    oracle_address: Option<String>,
    #[serde(default)]
    settlement_token_address: Option<String>,
    #[serde(default)]
    ecdsa_key_name: Option<String>,
    #[serde(default)]
    roster: Option<Vec<SpecialistProfile>>,
    #[serde(default)]
    min_profit_bps: Option<u32>,
    #[serde(default)]
    trade_floor_wei: Option<String>,
    #[serde(default)]
    trade_ceiling_wei: Option<String>,
    #[serde(default)]
    oracle_batch_size: Option<u32>,
    #[serde(default)]
    max_response_bytes: Option<u64>,
    #[serde(default)]
    scheduler_enabled: Option<bool>,
}

#[derive(CandidType, Deserialize)]
struct SubmitPermissionGrantArgs {
    permission_id: String,
    user_address: String,
    agent_id: String,
    delegate_address: String,
    token_address: String,
    amount_per_period_wei: String,
    period_secs: u64,
    total_amount_wei: String,
    expires_at_ns: u64,
    payload_hex: String,
}

#[derive(CandidType, Deserialize)]
struct SubmitRedelegationArgs {
    delegation_hash: String,
    parent_agent_id: String,
    child_agent_id: String,
    child_address: String,
    user_address: String,
    token_address: String,
    amount_wei: String,
    expires_at_ns: u64,
    payload_hex: String,
}

fn ensure_controller() -> Result<(), String> {
    #[cfg(target_arch = "wasm32")]
    {
        let caller = ic_cdk::api::msg_caller();
        if !ic_cdk::api::is_controller(&caller) {
            return Err("caller is not a controller".to_string());
        }
        Ok(())
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        Ok(())
    }
}

fn ensure_controller_or_trap() {
    if let Err(error) = ensure_controller() {
        ic_cdk::trap(&error);
    }
}

fn normalized_address(raw: &str, label: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(format!("{label} cannot be empty"));
    }
    Ok(trimmed.to_lowercase())
}

#[ic_cdk::init]
fn init(args: InitArgs) {
    apply_init_args(args);
    stable::init_scheduler_defaults(current_time_ns());
    arm_timer();
}

fn apply_init_args(args: InitArgs) {
    stable::init_storage();
    if let Some(chain_id) = args.chain_id {
        let _ = stable::set_chain_id(chain_id).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if let Some(rpc_url) = args.rpc_url {
        let _ = stable::set_rpc_url(rpc_url).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if args.fallback_rpc_url.is_some() {
        stable::set_fallback_rpc_url(args.fallback_rpc_url);
    }
    if let Some(address) = args.registry_address {
        let _ = stable::set_registry_address(address).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if let Some(address) = args.oracle_address {
        let _ = stable::set_oracle_address(address).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if let Some(address) = args.settlement_token_address {
        let _ = stable::set_settlement_token_address(address)
            .unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if let Some(key_name) = args.ecdsa_key_name {
        let _ = stable::set_ecdsa_key_name(key_name).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if let Some(roster) = args.roster {
        let _ = stable::set_roster(roster).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if let Some(bps) = args.min_profit_bps {
        let _ = stable::set_min_profit_bps(bps).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    match (args.trade_floor_wei, args.trade_ceiling_wei) {
        (Some(floor), Some(ceiling)) => {
            stable::set_trade_bounds(floor, ceiling).unwrap_or_else(|error| ic_cdk::trap(&error));
        }
        (None, None) => {}
        _ => ic_cdk::trap("trade_floor_wei and trade_ceiling_wei must be set together"),
    }
    if let Some(size) = args.oracle_batch_size {
        let _ = stable::set_oracle_batch_size(size).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if args.max_response_bytes.is_some() {
        stable::set_max_response_bytes(args.max_response_bytes);
    }
    if let Some(enabled) = args.scheduler_enabled {
        stable::set_scheduler_enabled(enabled);
    }
}

#[ic_cdk::post_upgrade]
fn post_upgrade() {
    stable::init_storage();
    // Fills in any task schedule a prior version never wrote; existing
    // configs and runtimes are left untouched.
    stable::init_scheduler_defaults(current_time_ns());
    arm_timer();
}

fn arm_timer() {
    set_timer_interval_serial(
        Duration::from_secs(SCHEDULER_TICK_INTERVAL_SECS),
        scheduler_tick,
    );
}

// ── Configuration ───────────────────────────────────────────────────────────

#[ic_cdk::update]
fn set_rpc_url(url: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_rpc_url(url)
}

#[ic_cdk::update]
fn set_fallback_rpc_url(url: Option<String>) -> Result<Option<String>, String> {
    ensure_controller()?;
    stable::set_fallback_rpc_url(url.clone());
    Ok(url)
}

#[ic_cdk::update]
fn set_chain_id(chain_id: u64) -> Result<u64, String> {
    ensure_controller()?;
    stable::set_chain_id(chain_id)
}

#[ic_cdk::update]
fn set_registry_address(address: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_registry_address(address)
}

#[ic_cdk::update]
fn set_oracle_address(address: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_oracle_address(address)
}

#[ic_cdk::update]
fn set_settlement_token_address(address: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_settlement_token_address(address)
}

#[ic_cdk::update]
fn set_ecdsa_key_name(key_name: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_ecdsa_key_name(key_name)
}

#[ic_cdk::update]
fn set_wallet_addresses_admin(manager: String, treasury: String) -> Result<String, String> {
    ensure_controller()?;
    let manager = normalized_address(&manager, "manager address")?;
    let treasury = normalized_address(&treasury, "treasury address")?;
    stable::set_wallet_addresses(manager, treasury);
    Ok("wallet_addresses_updated".to_string())
}

#[ic_cdk::update]
fn set_roster(roster: Vec<SpecialistProfile>) -> Result<usize, String> {
    ensure_controller()?;
    stable::set_roster(roster)
}

#[ic_cdk::update]
fn set_min_profit_bps(bps: u32) -> Result<u32, String> {
    ensure_controller()?;
    stable::set_min_profit_bps(bps)
}

#[ic_cdk::update]
fn set_trade_bounds(floor_wei: String, ceiling_wei: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_trade_bounds(floor_wei, ceiling_wei)?;
    Ok("trade_bounds_updated".to_string())
}

#[ic_cdk::update]
fn set_oracle_batch_size(size: u32) -> Result<u32, String> {
    ensure_controller()?;
    stable::set_oracle_batch_size(size)
}

#[ic_cdk::update]
fn set_max_response_bytes(bytes: Option<u64>) -> Result<Option<u64>, String> {
    ensure_controller()?;
    stable::set_max_response_bytes(bytes);
    Ok(bytes)
}

#[ic_cdk::update]
fn set_scheduler_enabled(enabled: bool) -> String {
    ensure_controller_or_trap();
    stable::set_scheduler_enabled(enabled);
    format!("scheduler_enabled={enabled}")
}

#[ic_cdk::update]
fn set_task_enabled(kind: TaskKind, enabled: bool) -> Result<TaskScheduleConfig, String> {
    ensure_controller()?;
    stable::set_task_enabled(&kind, enabled)
}

#[ic_cdk::update]
fn set_task_interval_secs(kind: TaskKind, interval_secs: u64) -> Result<TaskScheduleConfig, String> {
    ensure_controller()?;
    stable::set_task_interval_secs(&kind, interval_secs)
}

#[ic_cdk::update]
fn set_ledger_cursor_block(next_block: u64) -> Result<u64, String> {
    ensure_controller()?;
    let mut cursor = stable::ledger_cursor();
    cursor.next_block = next_block;
    cursor.consecutive_empty_polls = 0;
    stable::save_ledger_cursor(&cursor);
    Ok(next_block)
}

// ── Delegation intake ───────────────────────────────────────────────────────

#[ic_cdk::update]
fn submit_permission_grant(args: SubmitPermissionGrantArgs) -> Result<String, String> {
    let permission_id = args.permission_id.trim().to_string();
    if permission_id.is_empty() {
        return Err("permission id cannot be empty".to_string());
    }
    if stable::get_grant(&permission_id).is_some() {
        return Err(format!("permission grant {permission_id} already exists"));
    }
    if args.agent_id.trim().is_empty() {
        return Err("agent id cannot be empty".to_string());
    }
    let user_address = normalized_address(&args.user_address, "user address")?;
    let delegate_address = normalized_address(&args.delegate_address, "delegate address")?;
    let token_address = normalized_address(&args.token_address, "token address")?;
    let total = parse_wei(&args.total_amount_wei, "total amount")?;
    if total.is_zero() {
        return Err("total amount must be greater than zero".to_string());
    }
    let per_period = parse_wei(&args.amount_per_period_wei, "amount per period")?;
    let now = current_time_ns();
    if args.expires_at_ns <= now {
        return Err("permission grant is already expired".to_string());
    }

    stable::upsert_grant(&PermissionGrant {
        permission_id: permission_id.clone(),
        user_address,
        agent_id: args.agent_id.trim().to_string(),
        delegate_address,
        token_address,
        amount_per_period_wei: per_period.to_string(),
        period_secs: args.period_secs,
        total_amount_wei: total.to_string(),
        amount_used_wei: "0".to_string(),
        granted_at_ns: now,
        expires_at_ns: args.expires_at_ns,
        revoked_at_ns: None,
        active: true,
        payload_hex: args.payload_hex.trim().to_string(),
        status: DelegationStatus::Pending,
        claimed_at_ns: None,
        claim_tx_hash: None,
    });
    stable::push_intake(IntakeKind::PermissionGrant, &permission_id, now);

    let mut stats = stable::global_stats();
    stats.total_permissions += 1;
    stats.updated_at_ns = now;
    stable::save_global_stats(&stats);
    Ok(permission_id)
}

#[ic_cdk::update]
fn submit_redelegation(args: SubmitRedelegationArgs) -> Result<String, String> {
    let delegation_hash = normalized_address(&args.delegation_hash, "delegation hash")?;
    if stable::get_delegation_record(&delegation_hash).is_some() {
        return Err(format!("delegation record {delegation_hash} already exists"));
    }
    if args.parent_agent_id.trim().is_empty() || args.child_agent_id.trim().is_empty() {
        return Err("parent and child agent ids cannot be empty".to_string());
    }
    let child_address = normalized_address(&args.child_address, "child address")?;
    let user_address = normalized_address(&args.user_address, "user address")?;
    let token_address = normalized_address(&args.token_address, "token address")?;
    let amount = parse_wei(&args.amount_wei, "redelegation amount")?;
    if amount.is_zero() {
        return Err("redelegation amount must be greater than zero".to_string());
    }
    let now = current_time_ns();
    if args.expires_at_ns <= now {
        return Err("redelegation is already expired".to_string());
    }

    stable::upsert_delegation_record(&DelegationRecord {
        delegation_hash: delegation_hash.clone(),
        parent_agent_id: args.parent_agent_id.trim().to_string(),
        child_agent_id: args.child_agent_id.trim().to_string(),
        child_address,
        user_address,
        token_address,
        amount_wei: amount.to_string(),
        created_at_ns: now,
        expires_at_ns: args.expires_at_ns,
        payload_hex: args.payload_hex.trim().to_string(),
        status: DelegationStatus::Pending,
        redeemed_at_ns: None,
        redemption_tx_hash: None,
        last_error: None,
    });
    stable::push_intake(IntakeKind::Redelegation, &delegation_hash, now);
    Ok(delegation_hash)
}

#[ic_cdk::update]
fn revoke_permission(permission_id: String) -> Result<PermissionGrant, String> {
    stable::transition_grant_status(
        permission_id.trim(),
        DelegationStatus::Revoked,
        current_time_ns(),
    )
}

#[ic_cdk::update]
fn revoke_redelegation(delegation_hash: String) -> Result<DelegationRecord, String> {
    stable::transition_record_status(
        delegation_hash.trim().to_lowercase().as_str(),
        DelegationStatus::Revoked,
        current_time_ns(),
    )
}

// ── Queries ─────────────────────────────────────────────────────────────────

#[ic_cdk::query]
fn get_runtime_view() -> RuntimeView {
    stable::runtime_view()
}

#[ic_cdk::query]
fn get_scheduler_view() -> SchedulerRuntimeView {
    stable::scheduler_runtime_view()
}

#[ic_cdk::query]
fn get_global_stats() -> GlobalStats {
    stable::global_stats()
}

#[ic_cdk::query]
fn get_agent(agent_id: String) -> Option<Agent> {
    stable::get_agent(&agent_id)
}

#[ic_cdk::query]
fn list_agents() -> Vec<Agent> {
    stable::list_agents()
}

#[ic_cdk::query]
fn get_execution(execution_id: u64) -> Option<Execution> {
    stable::get_execution(execution_id)
}

#[ic_cdk::query]
fn list_executions(limit: u32) -> Vec<Execution> {
    stable::list_recent_executions(limit as usize)
}

#[ic_cdk::query]
fn list_agent_executions(agent_id: String, limit: u32) -> Vec<Execution> {
    stable::list_agent_executions(&agent_id, limit as usize)
}

#[ic_cdk::query]
fn list_stale_pending_executions(max_age_secs: u64) -> Vec<StaleExecution> {
    stable::list_stale_pending_executions(
        current_time_ns(),
        max_age_secs.saturating_mul(NANOS_PER_SEC),
    )
}

#[ic_cdk::query]
fn get_user_account(address: String) -> Option<UserAccount> {
    stable::get_user_account(&address.trim().to_lowercase())
}

#[ic_cdk::query]
fn get_permission_grant(permission_id: String) -> Option<PermissionGrant> {
    stable::get_grant(permission_id.trim())
}

#[ic_cdk::query]
fn list_grants_by_status(status: DelegationStatus, limit: u32) -> Vec<PermissionGrant> {
    stable::list_grants_by_status(&status, limit as usize)
}

#[ic_cdk::query]
fn get_delegation_record(delegation_hash: String) -> Option<DelegationRecord> {
    stable::get_delegation_record(delegation_hash.trim().to_lowercase().as_str())
}

#[ic_cdk::query]
fn list_delegation_records(limit: u32) -> Vec<DelegationRecord> {
    stable::list_delegation_records(limit as usize)
}

#[ic_cdk::query]
fn list_records_by_status(status: DelegationStatus, limit: u32) -> Vec<DelegationRecord> {
    stable::list_records_by_status(&status, limit as usize)
}

#[ic_cdk::query]
fn list_allocations(limit: u32) -> Vec<AllocationItem> {
    stable::list_recent_allocations(limit as usize)
}

#[ic_cdk::query]
fn list_redelegations(limit: u32) -> Vec<Redelegation> {
    stable::list_recent_redelegations(limit as usize)
}

#[ic_cdk::query]
fn list_agent_daily_stats(agent_id: String, limit: u32) -> Vec<DailyAgentStats> {
    stable::list_agent_daily_stats(&agent_id, limit as usize)
}

#[ic_cdk::query]
fn get_reputation_breakdown(agent_id: String) -> Result<ReputationView, String> {
    let agent = stable::get_agent(&agent_id)
        .ok_or_else(|| format!("agent {agent_id} is not registered"))?;
    let breakdown = compute_score(&score_inputs(&agent)?);
    Ok(ReputationView {
        agent_id: agent.id,
        win_rate_score: breakdown.win_rate_score,
        profitability_score: breakdown.profitability_score,
        volume_score: breakdown.volume_score,
        experience_score: breakdown.experience_score,
        efficiency_score: breakdown.efficiency_score,
        score: breakdown.score,
    })
}

#[ic_cdk::query]
fn get_oracle_sync_status() -> OracleSyncState {
    stable::oracle_sync_state()
}

#[ic_cdk::query]
fn get_ledger_cursor() -> LedgerPollCursor {
    stable::ledger_cursor()
}

#[ic_cdk::query]
fn list_scheduler_jobs(limit: u32) -> Vec<ScheduledJob> {
    stable::list_recent_jobs(limit as usize)
}

#[ic_cdk::query]
fn list_task_schedules() -> Vec<(TaskScheduleConfig, TaskScheduleRuntime)> {
    stable::list_task_configs()
        .into_iter()
        .filter_map(|(kind, config)| {
            stable::get_task_runtime(&kind).map(|runtime| (config, runtime))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::set_test_time_ns;

    const USER: &str = "0x2222222222222222222222222222222222222222";
    const TOKEN: &str = "0x4444444444444444444444444444444444444444";

    fn blank_init_args() -> InitArgs {
        InitArgs {
            chain_id: None,
            rpc_url: None,
            fallback_rpc_url: None,
            registry_address: None,
            oracle_address: None,
            settlement_token_address: None,
            ecdsa_key_name: None,
            roster: None,
            min_profit_bps: None,
            trade_floor_wei: None,
            trade_ceiling_wei: None,
            oracle_batch_size: None,
            max_response_bytes: None,
            scheduler_enabled: None,
        }
    }

    fn specialist(agent_id: &str, bps: u32) -> SpecialistProfile {
        SpecialistProfile {
            agent_id: agent_id.to_string(),
            wallet_address: String::new(),
            strategy: "momentum".to_string(),
            allocation_bps: bps,
            sim_win_rate_bps: 7_000,
            sim_profit_bps_min: 50,
            sim_profit_bps_max: 300,
            sim_loss_bps_min: 30,
            sim_loss_bps_max: 200,
        }
    }

    fn grant_args(id: &str, expires_at_ns: u64) -> SubmitPermissionGrantArgs {
        SubmitPermissionGrantArgs {
            permission_id: id.to_string(),
            user_address: USER.to_string(),
            agent_id: "manager".to_string(),
            delegate_address: "0x00000000000000000000000000000000000000aa".to_string(),
            token_address: TOKEN.to_string(),
            amount_per_period_wei: "1000000000000000000".to_string(),
            period_secs: 86_400,
            total_amount_wei: "4000000000000000000".to_string(),
            expires_at_ns,
            payload_hex: "0xdeadbeef".to_string(),
        }
    }

    #[test]
    fn apply_init_args_seeds_chain_configuration() {
        apply_init_args(InitArgs {
            chain_id: Some(8453),
            rpc_url: Some("https://mainnet.base.org/".to_string()),
            registry_address: Some("0x9999999999999999999999999999999999999999".to_string()),
            ecdsa_key_name: Some("dfx_test_key".to_string()),
            min_profit_bps: Some(150),
            scheduler_enabled: Some(false),
            ..blank_init_args()
        });

        let snapshot = stable::runtime_snapshot();
        assert_eq!(snapshot.chain_id, 8453);
        assert_eq!(snapshot.rpc_url, "https://mainnet.base.org");
        assert_eq!(
            snapshot.registry_address.as_deref(),
            Some("0x9999999999999999999999999999999999999999")
        );
        assert_eq!(snapshot.ecdsa_key_name, "dfx_test_key");
        assert_eq!(snapshot.min_profit_bps, 150);
        assert!(!stable::scheduler_enabled());
    }

    #[test]
    fn apply_init_args_seeds_the_specialist_roster() {
        apply_init_args(InitArgs {
            roster: Some(vec![
                specialist("alpha", 3_500),
                specialist("beta", 2_500),
                specialist("gamma", 2_500),
                specialist("delta", 1_500),
            ]),
            ..blank_init_args()
        });

        let snapshot = stable::runtime_snapshot();
        assert_eq!(snapshot.roster.len(), 4);
        assert_eq!(snapshot.roster[0].agent_id, "alpha");
        assert!(snapshot.roster[0].wallet_address.is_empty());
    }

    #[test]
    fn a_submitted_grant_lands_pending_with_an_intake_message() {
        stable::init_storage();
        set_test_time_ns(1_000 * NANOS_PER_SEC);

        let id = submit_permission_grant(grant_args("perm-1", 2_000 * NANOS_PER_SEC))
            .expect("grant should be accepted");

        let grant = stable::get_grant(&id).expect("grant should be stored");
        assert_eq!(grant.status, DelegationStatus::Pending);
        assert_eq!(grant.amount_used_wei, "0");
        assert_eq!(grant.granted_at_ns, 1_000 * NANOS_PER_SEC);
        assert_eq!(
            stable::drain_intake(&IntakeKind::PermissionGrant, 10).len(),
            1
        );
        assert_eq!(stable::global_stats().total_permissions, 1);
    }

    #[test]
    fn a_duplicate_grant_submission_is_rejected() {
        stable::init_storage();
        set_test_time_ns(1_000 * NANOS_PER_SEC);
        submit_permission_grant(grant_args("perm-1", 2_000 * NANOS_PER_SEC))
            .expect("first submission should be accepted");

        let error = submit_permission_grant(grant_args("perm-1", 2_000 * NANOS_PER_SEC))
            .expect_err("duplicate submission should be rejected");
        assert!(error.contains("already exists"), "got: {error}");
        assert_eq!(stable::global_stats().total_permissions, 1);
    }

    #[test]
    fn an_already_expired_grant_submission_is_rejected() {
        stable::init_storage();
        set_test_time_ns(2_000 * NANOS_PER_SEC);

        let error = submit_permission_grant(grant_args("perm-1", 1_000 * NANOS_PER_SEC))
            .expect_err("expired grant should be rejected");
        assert!(error.contains("expired"), "got: {error}");
        assert!(stable::get_grant("perm-1").is_none());
    }

    #[test]
    fn submitted_addresses_are_normalized_to_lowercase() {
        stable::init_storage();
        set_test_time_ns(1_000 * NANOS_PER_SEC);
        let mut args = grant_args("perm-1", 2_000 * NANOS_PER_SEC);
        args.user_address = "0x2222222222222222222222222222222222222BBB".to_string();

        submit_permission_grant(args).expect("grant should be accepted");

        let grant = stable::get_grant("perm-1").expect("grant should be stored");
        assert_eq!(
            grant.user_address,
            "0x2222222222222222222222222222222222222bbb"
        );
    }

    #[test]
    fn revoking_a_pending_grant_is_terminal() {
        stable::init_storage();
        set_test_time_ns(1_000 * NANOS_PER_SEC);
        submit_permission_grant(grant_args("perm-1", 2_000 * NANOS_PER_SEC))
            .expect("grant should be accepted");

        let revoked = revoke_permission("perm-1".to_string()).expect("revocation should succeed");
        assert_eq!(revoked.status, DelegationStatus::Revoked);
        assert!(!revoked.active);
        assert_eq!(revoked.revoked_at_ns, Some(1_000 * NANOS_PER_SEC));

        let error = revoke_permission("perm-1".to_string())
            .expect_err("a terminal grant cannot be revoked again");
        assert!(error.contains("Revoked"), "got: {error}");
    }

    #[test]
    fn a_submitted_redelegation_queues_executor_intake() {
        stable::init_storage();
        set_test_time_ns(1_000 * NANOS_PER_SEC);

        let hash = submit_redelegation(SubmitRedelegationArgs {
            delegation_hash: "0xABCDEF0000000000000000000000000000000000000000000000000000000001"
                .to_string(),
            parent_agent_id: "manager".to_string(),
            child_agent_id: "alpha".to_string(),
            child_address: "0x1111111111111111111111111111111111111111".to_string(),
            user_address: USER.to_string(),
            token_address: TOKEN.to_string(),
            amount_wei: "1000000000000000000".to_string(),
            expires_at_ns: 2_000 * NANOS_PER_SEC,
            payload_hex: "0xdeadbeef".to_string(),
        })
        .expect("redelegation should be accepted");

        let record = stable::get_delegation_record(&hash).expect("record should be stored");
        assert_eq!(record.status, DelegationStatus::Pending);
        assert_eq!(
            hash,
            "0xabcdef0000000000000000000000000000000000000000000000000000000001"
        );
        assert_eq!(stable::drain_intake(&IntakeKind::Redelegation, 10).len(), 1);
    }

    #[test]
    fn reputation_breakdown_requires_a_registered_agent() {
        stable::init_storage();

        let error = get_reputation_breakdown("0xmissing".to_string())
            .expect_err("unknown agent should be rejected");
        assert!(error.contains("not registered"), "got: {error}");
    }
}

ic_cdk::export_candid!();
