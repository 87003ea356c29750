use crate::domain::amount::parse_wei;
use crate::domain::status::validate_transition;
use crate::domain::types::{
    Agent, AllocationItem, AllocationStatus, DailyAgentStats, DelegationRecord, DelegationStatus,
    Execution, ExecutionResult, GlobalStats, IntakeKind, IntakeMessage, JobStatus,
    LedgerPollCursor, OracleSyncState, PermissionGrant, Redelegation, RuntimeSnapshot,
    RuntimeView, ScheduledJob, SchedulerLease, SchedulerRuntimeView, SchedulerState,
    SpecialistProfile, StaleExecution, SurvivalOperationClass, SurvivalOperationState,
    SurvivalTier, TaskKind, TaskLane, TaskScheduleConfig, TaskScheduleRuntime, UserAccount,
};
use crate::timing::{
    current_time_ns, CYCLE_CHECK_INTERVAL_SECS, DELEGATION_SWEEP_INTERVAL_SECS,
    DISPATCH_INTERVAL_SECS, LEDGER_POLL_INTERVAL_SECS, NANOS_PER_SEC,
    ORACLE_SYNC_INTERVAL_SECS, STRATEGY_CYCLE_INTERVAL_SECS,
};
use ic_stable_structures::{
    memory_manager::{MemoryId, MemoryManager, VirtualMemory},
    DefaultMemoryImpl, StableBTreeMap,
};
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;

const RUNTIME_KEY: &str = "runtime.snapshot";
const SCHEDULER_KEY: &str = "scheduler.state";
const GLOBAL_STATS_KEY: &str = "stats.global";

const SURVIVAL_TIER_RECOVERY_CHECKS: u8 = 3;

type Memory = VirtualMemory<DefaultMemoryImpl>;

thread_local! {
    static MEMORY_MANAGER: RefCell<MemoryManager<DefaultMemoryImpl>> =
        RefCell::new(MemoryManager::init(DefaultMemoryImpl::default()));
    static RUNTIME_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(0)))
        ));
    static AGENT_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(1)))
        ));
    static EXECUTION_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(2)))
        ));
    static USER_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(3)))
        ));
    static REDELEGATION_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(4)))
        ));
    static DAILY_STATS_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(5)))
        ));
    static GRANT_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(6)))
        ));
    static RECORD_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(7)))
        ));
    static PROCESSED_PERMISSION_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(8)))
        ));
    static APPLIED_EVENT_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(9)))
        ));
    static ALLOCATION_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(10)))
        ));
    static INTAKE_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(11)))
        ));
    static JOB_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(12)))
        ));
    static JOB_DEDUPE_MAP: RefCell<StableBTreeMap<String, String, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(13)))
        ));
    static TASK_CONFIG_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(14)))
        ));
    static TASK_RUNTIME_MAP: RefCell<StableBTreeMap<String, Vec<u8>, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(15)))
        ));
}

pub fn init_storage() {
    let _ = runtime_snapshot();
    let _ = scheduler_state();
}

// ── Runtime configuration snapshot ──────────────────────────────────────────

pub fn runtime_snapshot() -> RuntimeSnapshot {
    let payload = RUNTIME_MAP.with(|map| map.borrow().get(&RUNTIME_KEY.to_string()));
    read_json(payload.as_deref()).unwrap_or_default()
}

pub fn save_runtime_snapshot(snapshot: &RuntimeSnapshot) {
    RUNTIME_MAP.with(|map| {
        map.borrow_mut()
            .insert(RUNTIME_KEY.to_string(), encode_json(snapshot));
    });
}

fn mutate_snapshot<T>(mutate: impl FnOnce(&mut RuntimeSnapshot) -> T) -> T {
    let mut snapshot = runtime_snapshot();
    let out = mutate(&mut snapshot);
    snapshot.updated_at_ns = current_time_ns();
    save_runtime_snapshot(&snapshot);
    out
}

pub fn set_rpc_url(url: String) -> Result<String, String> {
    if url.trim().is_empty() {
        return Err("rpc url cannot be empty".to_string());
    }
    Ok(mutate_snapshot(|snapshot| {
        snapshot.rpc_url = url.trim().trim_end_matches('/').to_string();
        snapshot.rpc_url.clone()
    }))
}

pub fn set_fallback_rpc_url(url: Option<String>) {
    mutate_snapshot(|snapshot| {
        snapshot.fallback_rpc_url = url.and_then(|raw| {
            let trimmed = raw.trim().trim_end_matches('/').to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        });
    });
}

pub fn set_chain_id(chain_id: u64) -> Result<u64, String> {
    if chain_id == 0 {
        return Err("chain id must be > 0".to_string());
    }
    Ok(mutate_snapshot(|snapshot| {
        snapshot.chain_id = chain_id;
        snapshot.ledger_cursor.chain_id = chain_id;
        chain_id
    }))
}

pub fn set_registry_address(address: String) -> Result<String, String> {
    if address.trim().is_empty() {
        return Err("registry address cannot be empty".to_string());
    }
    Ok(mutate_snapshot(|snapshot| {
        snapshot.registry_address = Some(address.clone());
        address
    }))
}

pub fn set_oracle_address(address: String) -> Result<String, String> {
    if address.trim().is_empty() {
        return Err("oracle address cannot be empty".to_string());
    }
    Ok(mutate_snapshot(|snapshot| {
        snapshot.oracle_address = Some(address.clone());
        address
    }))
}

pub fn set_settlement_token_address(address: String) -> Result<String, String> {
    if address.trim().is_empty() {
        return Err("settlement token address cannot be empty".to_string());
    }
    Ok(mutate_snapshot(|snapshot| {
        snapshot.settlement_token_address = Some(address.clone());
        address
    }))
}

pub fn set_ecdsa_key_name(key_name: String) -> Result<String, String> {
    if key_name.trim().is_empty() {
        return Err("ecdsa key name cannot be empty".to_string());
    }
    Ok(mutate_snapshot(|snapshot| {
        snapshot.ecdsa_key_name = key_name.trim().to_string();
        snapshot.ecdsa_key_name.clone()
    }))
}

pub fn set_wallet_addresses(manager: String, treasury: String) {
    mutate_snapshot(|snapshot| {
        snapshot.manager_address = Some(manager);
        snapshot.treasury_address = Some(treasury);
    });
}

/// Wallet addresses may be left empty here; the threshold-key derivation pass
/// at init fills them in per specialist role.
pub fn set_roster(roster: Vec<SpecialistProfile>) -> Result<usize, String> {
    if roster.is_empty() {
        return Err("specialist roster cannot be empty".to_string());
    }
    let bps_sum: u64 = roster
        .iter()
        .map(|profile| u64::from(profile.allocation_bps))
        .sum();
    if bps_sum != 10_000 {
        return Err(format!(
            "roster allocation must sum to 10000 bps, got {bps_sum}"
        ));
    }
    for profile in &roster {
        if profile.agent_id.trim().is_empty() {
            return Err("roster agent id cannot be empty".to_string());
        }
    }
    Ok(mutate_snapshot(|snapshot| {
        let size = roster.len();
        snapshot.roster = roster;
        size
    }))
}

pub fn set_roster_wallet_address(agent_id: &str, wallet_address: String) -> Result<(), String> {
    mutate_snapshot(|snapshot| {
        let entry = snapshot
            .roster
            .iter_mut()
            .find(|profile| profile.agent_id == agent_id);
        match entry {
            Some(profile) => {
                profile.wallet_address = wallet_address;
                Ok(())
            }
            None => Err(format!("roster entry {agent_id} is not configured")),
        }
    })
}

pub fn set_min_profit_bps(bps: u32) -> Result<u32, String> {
    if bps > 10_000 {
        return Err(format!("min profit bps must be <= 10000, got {bps}"));
    }
    Ok(mutate_snapshot(|snapshot| {
        snapshot.min_profit_bps = bps;
        bps
    }))
}

pub fn set_trade_bounds(floor_wei: String, ceiling_wei: String) -> Result<(), String> {
    let floor = parse_wei(&floor_wei, "trade floor")?;
    let ceiling = parse_wei(&ceiling_wei, "trade ceiling")?;
    if floor > ceiling {
        return Err(format!(
            "trade floor {floor_wei} exceeds trade ceiling {ceiling_wei}"
        ));
    }
    mutate_snapshot(|snapshot| {
        snapshot.trade_floor_wei = floor_wei;
        snapshot.trade_ceiling_wei = ceiling_wei;
    });
    Ok(())
}

pub fn set_oracle_batch_size(size: u32) -> Result<u32, String> {
    if size == 0 || size > 100 {
        return Err(format!("oracle batch size must be 1..=100, got {size}"));
    }
    Ok(mutate_snapshot(|snapshot| {
        snapshot.oracle_batch_size = size;
        size
    }))
}

pub fn set_max_response_bytes(bytes: Option<u64>) {
    mutate_snapshot(|snapshot| {
        snapshot.max_response_bytes = bytes;
    });
}

pub fn ledger_cursor() -> LedgerPollCursor {
    runtime_snapshot().ledger_cursor
}

pub fn save_ledger_cursor(cursor: &LedgerPollCursor) {
    mutate_snapshot(|snapshot| {
        snapshot.ledger_cursor = cursor.clone();
    });
}

pub fn oracle_sync_state() -> OracleSyncState {
    runtime_snapshot().oracle_sync
}

pub fn save_oracle_sync_state(state: &OracleSyncState) {
    mutate_snapshot(|snapshot| {
        snapshot.oracle_sync = state.clone();
    });
}

/// Reserve the next send slot on the serialized fan-out lane. Slots are
/// spaced `spacing_ns` apart so queued transfers never race each other.
pub fn next_fanout_slot(now: u64, spacing_ns: u64) -> u64 {
    mutate_snapshot(|snapshot| {
        let slot = snapshot.fanout_watermark_ns.max(now);
        snapshot.fanout_watermark_ns = slot.saturating_add(spacing_ns);
        slot
    })
}

pub fn runtime_view() -> RuntimeView {
    let snapshot = runtime_snapshot();
    RuntimeView {
        chain_id: snapshot.chain_id,
        rpc_configured: !snapshot.rpc_url.is_empty(),
        registry_address: snapshot.registry_address.clone(),
        oracle_address: snapshot.oracle_address.clone(),
        manager_address: snapshot.manager_address.clone(),
        treasury_address: snapshot.treasury_address.clone(),
        roster_size: snapshot.roster.len() as u32,
        queued_allocations: queued_allocation_count(),
        ledger_next_block: snapshot.ledger_cursor.next_block,
        consecutive_empty_polls: snapshot.ledger_cursor.consecutive_empty_polls,
        oracle_last_synced_at_ns: snapshot.oracle_sync.last_synced_at_ns,
        oracle_last_error: snapshot.oracle_sync.last_error.clone(),
        global_stats: global_stats(),
        updated_at_ns: snapshot.updated_at_ns,
    }
}

// ── Global stats ────────────────────────────────────────────────────────────

pub fn global_stats() -> GlobalStats {
    let payload = RUNTIME_MAP.with(|map| map.borrow().get(&GLOBAL_STATS_KEY.to_string()));
    read_json(payload.as_deref()).unwrap_or_default()
}

pub fn save_global_stats(stats: &GlobalStats) {
    RUNTIME_MAP.with(|map| {
        map.borrow_mut()
            .insert(GLOBAL_STATS_KEY.to_string(), encode_json(stats));
    });
}

// ── Agents ──────────────────────────────────────────────────────────────────

pub fn upsert_agent(agent: &Agent) {
    AGENT_MAP.with(|map| {
        map.borrow_mut().insert(agent.id.clone(), encode_json(agent));
    });
}

pub fn get_agent(agent_id: &str) -> Option<Agent> {
    AGENT_MAP.with(|map| read_json(map.borrow().get(&agent_id.to_string()).as_deref()))
}

pub fn list_agents() -> Vec<Agent> {
    AGENT_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json(Some(entry.value().as_slice())))
            .collect()
    })
}

pub fn list_active_agents() -> Vec<Agent> {
    list_agents()
        .into_iter()
        .filter(|agent| agent.active)
        .collect()
}

// ── Executions ──────────────────────────────────────────────────────────────

fn execution_key(execution_id: u64) -> String {
    format!("{execution_id:020}")
}

pub fn upsert_execution(execution: &Execution) {
    EXECUTION_MAP.with(|map| {
        map.borrow_mut()
            .insert(execution_key(execution.id), encode_json(execution));
    });
}

pub fn get_execution(execution_id: u64) -> Option<Execution> {
    EXECUTION_MAP.with(|map| read_json(map.borrow().get(&execution_key(execution_id)).as_deref()))
}

pub fn list_recent_executions(limit: usize) -> Vec<Execution> {
    if limit == 0 {
        return Vec::new();
    }
    EXECUTION_MAP.with(|map| {
        map.borrow()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|entry| read_json(Some(entry.value().as_slice())))
            .collect()
    })
}

pub fn list_agent_executions(agent_id: &str, limit: usize) -> Vec<Execution> {
    if limit == 0 {
        return Vec::new();
    }
    EXECUTION_MAP.with(|map| {
        map.borrow()
            .iter()
            .rev()
            .filter_map(|entry| read_json::<Execution>(Some(entry.value().as_slice())))
            .filter(|execution| execution.agent_id == agent_id)
            .take(limit)
            .collect()
    })
}

pub fn list_stale_pending_executions(now: u64, max_age_ns: u64) -> Vec<StaleExecution> {
    EXECUTION_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<Execution>(Some(entry.value().as_slice())))
            .filter(|execution| execution.result == ExecutionResult::Pending)
            .filter(|execution| now.saturating_sub(execution.started_at_ns) >= max_age_ns)
            .map(|execution| StaleExecution {
                execution_id: execution.id,
                agent_id: execution.agent_id,
                pending_since_ns: execution.started_at_ns,
                age_ns: now.saturating_sub(execution.started_at_ns),
            })
            .collect()
    })
}

// ── Users ───────────────────────────────────────────────────────────────────

pub fn upsert_user_account(account: &UserAccount) {
    USER_MAP.with(|map| {
        map.borrow_mut()
            .insert(account.address.clone(), encode_json(account));
    });
}

pub fn get_user_account(address: &str) -> Option<UserAccount> {
    USER_MAP.with(|map| read_json(map.borrow().get(&address.to_string()).as_deref()))
}

// ── Redelegations ───────────────────────────────────────────────────────────

pub fn upsert_redelegation(redelegation: &Redelegation) {
    REDELEGATION_MAP.with(|map| {
        map.borrow_mut()
            .insert(redelegation.id.clone(), encode_json(redelegation));
    });
}

pub fn list_recent_redelegations(limit: usize) -> Vec<Redelegation> {
    if limit == 0 {
        return Vec::new();
    }
    REDELEGATION_MAP.with(|map| {
        map.borrow()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|entry| read_json(Some(entry.value().as_slice())))
            .collect()
    })
}

/// Fan-out idempotency read: live redelegations already standing between a
/// parent agent and a user.
pub fn count_active_redelegations_for_user(
    parent_agent_id: &str,
    user_address: &str,
    now: u64,
) -> u64 {
    REDELEGATION_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<Redelegation>(Some(entry.value().as_slice())))
            .filter(|redelegation| {
                redelegation.parent_agent_id == parent_agent_id
                    && redelegation.user_address == user_address
            })
            .filter(|redelegation| redelegation.active && now < redelegation.expires_at_ns)
            .count() as u64
    })
}

pub fn deactivate_expired_redelegations(now: u64) -> u64 {
    let expired: Vec<Redelegation> = REDELEGATION_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<Redelegation>(Some(entry.value().as_slice())))
            .filter(|redelegation| redelegation.active && redelegation.expires_at_ns <= now)
            .collect()
    });
    let count = expired.len() as u64;
    for mut redelegation in expired {
        redelegation.active = false;
        upsert_redelegation(&redelegation);
    }
    count
}

// ── Daily rollups ───────────────────────────────────────────────────────────

fn daily_stats_key(day_index: u64, agent_id: &str) -> String {
    format!("{day_index:010}:{agent_id}")
}

pub fn get_daily_stats(agent_id: &str, day_index: u64) -> Option<DailyAgentStats> {
    DAILY_STATS_MAP
        .with(|map| read_json(map.borrow().get(&daily_stats_key(day_index, agent_id)).as_deref()))
}

pub fn upsert_daily_stats(stats: &DailyAgentStats) {
    DAILY_STATS_MAP.with(|map| {
        map.borrow_mut().insert(
            daily_stats_key(stats.day_index, &stats.agent_id),
            encode_json(stats),
        );
    });
}

pub fn list_agent_daily_stats(agent_id: &str, limit: usize) -> Vec<DailyAgentStats> {
    if limit == 0 {
        return Vec::new();
    }
    DAILY_STATS_MAP.with(|map| {
        map.borrow()
            .iter()
            .rev()
            .filter_map(|entry| read_json::<DailyAgentStats>(Some(entry.value().as_slice())))
            .filter(|stats| stats.agent_id == agent_id)
            .take(limit)
            .collect()
    })
}

// ── Delegation store ────────────────────────────────────────────────────────

pub fn upsert_grant(grant: &PermissionGrant) {
    GRANT_MAP.with(|map| {
        map.borrow_mut()
            .insert(grant.permission_id.clone(), encode_json(grant));
    });
}

pub fn get_grant(permission_id: &str) -> Option<PermissionGrant> {
    GRANT_MAP.with(|map| read_json(map.borrow().get(&permission_id.to_string()).as_deref()))
}

pub fn list_grants_by_status(status: &DelegationStatus, limit: usize) -> Vec<PermissionGrant> {
    if limit == 0 {
        return Vec::new();
    }
    GRANT_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<PermissionGrant>(Some(entry.value().as_slice())))
            .filter(|grant| &grant.status == status)
            .take(limit)
            .collect()
    })
}

pub fn list_expired_pending_grants(now: u64) -> Vec<PermissionGrant> {
    GRANT_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<PermissionGrant>(Some(entry.value().as_slice())))
            .filter(|grant| grant.status == DelegationStatus::Pending)
            .filter(|grant| grant.expires_at_ns <= now)
            .collect()
    })
}

/// Transition a grant's status, enforcing the one-way lifecycle. The read,
/// validation, and write all happen inside one canister message.
pub fn transition_grant_status(
    permission_id: &str,
    to: DelegationStatus,
    now: u64,
) -> Result<PermissionGrant, String> {
    let mut grant = get_grant(permission_id)
        .ok_or_else(|| format!("permission grant {permission_id} not found"))?;
    validate_transition(&grant.status, &to).map_err(|error| error.to_string())?;
    grant.status = to;
    match grant.status {
        DelegationStatus::Claimed => grant.claimed_at_ns = Some(now),
        DelegationStatus::Revoked => {
            grant.revoked_at_ns = Some(now);
            grant.active = false;
        }
        DelegationStatus::Expired => grant.active = false,
        DelegationStatus::Redeemed | DelegationStatus::Pending => {}
    }
    upsert_grant(&grant);
    Ok(grant)
}

pub fn mark_grant_claimed(
    permission_id: &str,
    claim_tx_hash: &str,
    now: u64,
) -> Result<PermissionGrant, String> {
    let mut grant = transition_grant_status(permission_id, DelegationStatus::Claimed, now)?;
    grant.claim_tx_hash = Some(claim_tx_hash.to_string());
    upsert_grant(&grant);
    Ok(grant)
}

/// Add spent value to a grant's usage. Usage never decreases and never
/// exceeds the granted total.
pub fn record_grant_usage(
    permission_id: &str,
    spent_wei: &str,
) -> Result<PermissionGrant, String> {
    let mut grant = get_grant(permission_id)
        .ok_or_else(|| format!("permission grant {permission_id} not found"))?;
    let total = parse_wei(&grant.total_amount_wei, "total_amount_wei")?;
    let used = parse_wei(&grant.amount_used_wei, "amount_used_wei")?;
    let spent = parse_wei(spent_wei, "spent_wei")?;
    grant.amount_used_wei = used.saturating_add(spent).min(total).to_string();
    upsert_grant(&grant);
    Ok(grant)
}

pub fn upsert_delegation_record(record: &DelegationRecord) {
    RECORD_MAP.with(|map| {
        map.borrow_mut()
            .insert(record.delegation_hash.clone(), encode_json(record));
    });
}

pub fn get_delegation_record(delegation_hash: &str) -> Option<DelegationRecord> {
    RECORD_MAP.with(|map| read_json(map.borrow().get(&delegation_hash.to_string()).as_deref()))
}

pub fn list_delegation_records(limit: usize) -> Vec<DelegationRecord> {
    if limit == 0 {
        return Vec::new();
    }
    RECORD_MAP.with(|map| {
        map.borrow()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|entry| read_json(Some(entry.value().as_slice())))
            .collect()
    })
}

pub fn list_records_by_status(status: &DelegationStatus, limit: usize) -> Vec<DelegationRecord> {
    if limit == 0 {
        return Vec::new();
    }
    RECORD_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<DelegationRecord>(Some(entry.value().as_slice())))
            .filter(|record| &record.status == status)
            .take(limit)
            .collect()
    })
}

pub fn list_expired_pending_records(now: u64) -> Vec<DelegationRecord> {
    RECORD_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<DelegationRecord>(Some(entry.value().as_slice())))
            .filter(|record| record.status == DelegationStatus::Pending)
            .filter(|record| record.expires_at_ns <= now)
            .collect()
    })
}

pub fn transition_record_status(
    delegation_hash: &str,
    to: DelegationStatus,
    now: u64,
) -> Result<DelegationRecord, String> {
    let mut record = get_delegation_record(delegation_hash)
        .ok_or_else(|| format!("delegation record {delegation_hash} not found"))?;
    validate_transition(&record.status, &to).map_err(|error| error.to_string())?;
    record.status = to;
    if record.status == DelegationStatus::Redeemed {
        record.redeemed_at_ns = Some(now);
    }
    upsert_delegation_record(&record);
    Ok(record)
}

pub fn mark_record_redeemed(
    delegation_hash: &str,
    redemption_tx_hash: &str,
    now: u64,
) -> Result<DelegationRecord, String> {
    let mut record = transition_record_status(delegation_hash, DelegationStatus::Redeemed, now)?;
    record.redemption_tx_hash = Some(redemption_tx_hash.to_string());
    record.last_error = None;
    upsert_delegation_record(&record);
    Ok(record)
}

pub fn set_record_error(delegation_hash: &str, error: Option<String>) {
    if let Some(mut record) = get_delegation_record(delegation_hash) {
        record.last_error = error;
        upsert_delegation_record(&record);
    }
}

// ── Idempotency sets ────────────────────────────────────────────────────────

pub fn is_permission_processed(permission_id: &str) -> bool {
    PROCESSED_PERMISSION_MAP.with(|map| map.borrow().contains_key(&permission_id.to_string()))
}

/// Returns true exactly once per permission id. Survives upgrades, so a
/// grant observed again after a restart is never dispatched twice.
pub fn try_mark_permission_processed(permission_id: &str, now: u64) -> bool {
    PROCESSED_PERMISSION_MAP.with(|map| {
        let mut map = map.borrow_mut();
        let key = permission_id.to_string();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, encode_json(&now));
        true
    })
}

/// Returns true exactly once per event key. Push-delivered receipts and
/// overlapping poll windows both funnel through this set, so the key must
/// identify the event itself, not the delivery path.
pub fn try_mark_event_applied(event_key: &str, now: u64) -> bool {
    APPLIED_EVENT_MAP.with(|map| {
        let mut map = map.borrow_mut();
        let key = event_key.to_string();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, encode_json(&now));
        true
    })
}

// ── Fan-out allocation queue ────────────────────────────────────────────────

pub fn next_allocation_id() -> String {
    mutate_snapshot(|snapshot| {
        snapshot.allocation_seq = snapshot.allocation_seq.saturating_add(1);
        format!("alloc-{:020}", snapshot.allocation_seq)
    })
}

pub fn upsert_allocation(item: &AllocationItem) {
    ALLOCATION_MAP.with(|map| {
        map.borrow_mut().insert(item.id.clone(), encode_json(item));
    });
}

pub fn get_allocation(id: &str) -> Option<AllocationItem> {
    ALLOCATION_MAP.with(|map| read_json(map.borrow().get(&id.to_string()).as_deref()))
}

/// Oldest queued item whose send slot has arrived, if any.
pub fn next_ready_allocation(now: u64) -> Option<AllocationItem> {
    ALLOCATION_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<AllocationItem>(Some(entry.value().as_slice())))
            .find(|item| item.status == AllocationStatus::Queued && item.not_before_ns <= now)
    })
}

pub fn queued_allocation_count() -> u64 {
    ALLOCATION_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<AllocationItem>(Some(entry.value().as_slice())))
            .filter(|item| item.status == AllocationStatus::Queued)
            .count() as u64
    })
}

pub fn list_recent_allocations(limit: usize) -> Vec<AllocationItem> {
    if limit == 0 {
        return Vec::new();
    }
    ALLOCATION_MAP.with(|map| {
        map.borrow()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|entry| read_json(Some(entry.value().as_slice())))
            .collect()
    })
}

// ── Push intake channel ─────────────────────────────────────────────────────

pub fn push_intake(kind: IntakeKind, record_id: &str, now: u64) -> IntakeMessage {
    let id = mutate_snapshot(|snapshot| {
        snapshot.intake_seq = snapshot.intake_seq.saturating_add(1);
        format!("intake-{:020}", snapshot.intake_seq)
    });
    let message = IntakeMessage {
        id: id.clone(),
        kind,
        record_id: record_id.to_string(),
        received_at_ns: now,
        consumed: false,
    };
    INTAKE_MAP.with(|map| {
        map.borrow_mut().insert(id, encode_json(&message));
    });
    message
}

/// Consume up to `limit` unread messages of one kind, oldest first. The two
/// kinds have different consumers, so a drain never touches the other lane.
pub fn drain_intake(kind: &IntakeKind, limit: usize) -> Vec<IntakeMessage> {
    if limit == 0 {
        return Vec::new();
    }
    let pending: Vec<IntakeMessage> = INTAKE_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<IntakeMessage>(Some(entry.value().as_slice())))
            .filter(|message| !message.consumed && &message.kind == kind)
            .take(limit)
            .collect()
    });
    INTAKE_MAP.with(|map| {
        let mut map = map.borrow_mut();
        for message in &pending {
            let consumed = IntakeMessage {
                consumed: true,
                ..message.clone()
            };
            map.insert(consumed.id.clone(), encode_json(&consumed));
        }
    });
    pending
}

pub fn prune_consumed_intake(keep: usize) {
    let consumed: Vec<String> = INTAKE_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<IntakeMessage>(Some(entry.value().as_slice())))
            .filter(|message| message.consumed)
            .map(|message| message.id)
            .collect()
    });
    if consumed.len() <= keep {
        return;
    }
    let drop_count = consumed.len() - keep;
    INTAKE_MAP.with(|map| {
        let mut map = map.borrow_mut();
        for id in consumed.iter().take(drop_count) {
            map.remove(id);
        }
    });
}

// ── Scheduler state ─────────────────────────────────────────────────────────

pub fn scheduler_state() -> SchedulerState {
    let payload = RUNTIME_MAP.with(|map| map.borrow().get(&SCHEDULER_KEY.to_string()));
    read_json(payload.as_deref()).unwrap_or_default()
}

fn save_scheduler_state(state: &SchedulerState) {
    RUNTIME_MAP.with(|map| {
        map.borrow_mut()
            .insert(SCHEDULER_KEY.to_string(), encode_json(state));
    });
}

pub fn scheduler_enabled() -> bool {
    scheduler_state().enabled
}

pub fn set_scheduler_enabled(enabled: bool) {
    let mut state = scheduler_state();
    state.enabled = enabled;
    save_scheduler_state(&state);
}

pub fn record_scheduler_tick_start(now: u64) {
    let mut state = scheduler_state();
    state.last_tick_start_ns = now;
    save_scheduler_state(&state);
}

pub fn record_scheduler_tick_end(now: u64, error: Option<String>) {
    let mut state = scheduler_state();
    state.last_tick_end_ns = now;
    state.last_tick_error = error;
    save_scheduler_state(&state);
}

pub fn scheduler_runtime_view() -> SchedulerRuntimeView {
    let state = scheduler_state();
    SchedulerRuntimeView {
        enabled: state.enabled,
        survival_tier: state.survival_tier.clone(),
        survival_tier_recovery_checks: state.tier_recovery_checks,
        lease_active: mutating_lease_active(current_time_ns()),
        last_tick_start_ns: state.last_tick_start_ns,
        last_tick_end_ns: state.last_tick_end_ns,
        last_tick_error: state.last_tick_error,
    }
}

// ── Survival tiers ──────────────────────────────────────────────────────────

fn tier_rank(tier: &SurvivalTier) -> u8 {
    match tier {
        SurvivalTier::Normal => 0,
        SurvivalTier::LowCycles => 1,
        SurvivalTier::Critical => 2,
        SurvivalTier::OutOfCycles => 3,
    }
}

/// Apply an observed tier. Worsening applies immediately; recovery out of
/// Critical or OutOfCycles requires three consecutive Normal observations.
pub fn set_scheduler_survival_tier(observed: SurvivalTier) {
    let mut state = scheduler_state();
    let current_rank = tier_rank(&state.survival_tier);
    let observed_rank = tier_rank(&observed);
    if observed_rank >= current_rank {
        state.survival_tier = observed;
        state.tier_recovery_checks = 0;
    } else if current_rank >= tier_rank(&SurvivalTier::Critical) {
        if observed == SurvivalTier::Normal {
            state.tier_recovery_checks = state.tier_recovery_checks.saturating_add(1);
            if state.tier_recovery_checks >= SURVIVAL_TIER_RECOVERY_CHECKS {
                state.survival_tier = SurvivalTier::Normal;
                state.tier_recovery_checks = 0;
            }
        } else {
            state.tier_recovery_checks = 0;
        }
    } else {
        state.survival_tier = observed;
        state.tier_recovery_checks = 0;
    }
    save_scheduler_state(&state);
}

pub fn scheduler_survival_tier() -> SurvivalTier {
    scheduler_state().survival_tier
}

pub fn scheduler_survival_tier_recovery_checks() -> u8 {
    scheduler_state().tier_recovery_checks
}

pub fn scheduler_low_cycles_mode() -> bool {
    scheduler_state().survival_tier != SurvivalTier::Normal
}

pub fn can_run_survival_operation(class: &SurvivalOperationClass, now: u64) -> bool {
    let state = scheduler_state();
    state
        .operation_states
        .iter()
        .find(|operation| &operation.class == class)
        .and_then(|operation| operation.backoff_until_ns)
        .map(|until| now >= until)
        .unwrap_or(true)
}

pub fn record_survival_operation_failure(
    class: &SurvivalOperationClass,
    now: u64,
    max_backoff_secs: u64,
) {
    let mut state = scheduler_state();
    let index = match state
        .operation_states
        .iter()
        .position(|operation| &operation.class == class)
    {
        Some(index) => index,
        None => {
            state.operation_states.push(SurvivalOperationState {
                class: class.clone(),
                consecutive_failures: 0,
                backoff_until_ns: None,
            });
            state.operation_states.len() - 1
        }
    };
    let operation = &mut state.operation_states[index];
    operation.consecutive_failures = operation.consecutive_failures.saturating_add(1);
    let shift = operation.consecutive_failures.min(16);
    let delay_secs = 1u64
        .checked_shl(shift)
        .unwrap_or(u64::MAX)
        .min(max_backoff_secs.max(1));
    operation.backoff_until_ns = Some(now.saturating_add(delay_secs.saturating_mul(NANOS_PER_SEC)));
    save_scheduler_state(&state);
}

pub fn record_survival_operation_success(class: &SurvivalOperationClass) {
    let mut state = scheduler_state();
    if let Some(operation) = state
        .operation_states
        .iter_mut()
        .find(|operation| &operation.class == class)
    {
        operation.consecutive_failures = 0;
        operation.backoff_until_ns = None;
        save_scheduler_state(&state);
    }
}

pub fn survival_operation_consecutive_failures(class: &SurvivalOperationClass) -> u32 {
    scheduler_state()
        .operation_states
        .iter()
        .find(|operation| &operation.class == class)
        .map(|operation| operation.consecutive_failures)
        .unwrap_or(0)
}

pub fn survival_operation_backoff_until(class: &SurvivalOperationClass) -> Option<u64> {
    scheduler_state()
        .operation_states
        .iter()
        .find(|operation| &operation.class == class)
        .and_then(|operation| operation.backoff_until_ns)
}

// ── Mutating lease ──────────────────────────────────────────────────────────

pub fn acquire_mutating_lease(job_id: &str, now: u64, ttl_ns: u64) -> bool {
    let mut state = scheduler_state();
    if let Some(lease) = &state.lease {
        if now < lease.acquired_at_ns.saturating_add(lease.ttl_ns) {
            return false;
        }
    }
    state.lease = Some(SchedulerLease {
        job_id: job_id.to_string(),
        acquired_at_ns: now,
        ttl_ns,
    });
    save_scheduler_state(&state);
    true
}

pub fn mutating_lease_active(now: u64) -> bool {
    scheduler_state()
        .lease
        .map(|lease| now < lease.acquired_at_ns.saturating_add(lease.ttl_ns))
        .unwrap_or(false)
}

pub fn release_mutating_lease() {
    let mut state = scheduler_state();
    state.lease = None;
    save_scheduler_state(&state);
}

/// If the held lease has outlived its ttl, fail the abandoned job and free
/// the lane. Returns the reaped job id.
pub fn recover_stale_lease(now: u64) -> Option<String> {
    let state = scheduler_state();
    let lease = state.lease?;
    if now < lease.acquired_at_ns.saturating_add(lease.ttl_ns) {
        return None;
    }
    complete_job(
        &lease.job_id,
        JobStatus::Failed,
        Some("mutating lease expired before the job finished".to_string()),
        now,
    );
    release_mutating_lease();
    Some(lease.job_id)
}

// ── Job queue ───────────────────────────────────────────────────────────────

pub fn enqueue_job_if_absent(
    kind: TaskKind,
    lane: TaskLane,
    dedupe_key: &str,
    scheduled_for_ns: u64,
    priority: u8,
) -> Option<String> {
    let already_enqueued =
        JOB_DEDUPE_MAP.with(|map| map.borrow().contains_key(&dedupe_key.to_string()));
    if already_enqueued {
        return None;
    }
    let mut state = scheduler_state();
    state.job_seq = state.job_seq.saturating_add(1);
    let id = format!("job-{:020}", state.job_seq);
    let job = ScheduledJob {
        id: id.clone(),
        kind,
        lane,
        dedupe_key: dedupe_key.to_string(),
        scheduled_for_ns,
        priority,
        status: JobStatus::Pending,
        attempts: 0,
        created_at_ns: current_time_ns(),
        started_at_ns: None,
        finished_at_ns: None,
        error: None,
    };
    JOB_MAP.with(|map| {
        map.borrow_mut().insert(id.clone(), encode_json(&job));
    });
    JOB_DEDUPE_MAP.with(|map| {
        map.borrow_mut().insert(dedupe_key.to_string(), id.clone());
    });
    save_scheduler_state(&state);
    Some(id)
}

pub fn get_job(job_id: &str) -> Option<ScheduledJob> {
    JOB_MAP.with(|map| read_json(map.borrow().get(&job_id.to_string()).as_deref()))
}

fn save_job(job: &ScheduledJob) {
    JOB_MAP.with(|map| {
        map.borrow_mut().insert(job.id.clone(), encode_json(job));
    });
}

/// Highest-priority due job on the lane, oldest first among equals. The
/// returned job is stamped started so a re-entrant tick will not pick it
/// up again.
pub fn pop_next_pending_job(lane: &TaskLane, now: u64) -> Option<ScheduledJob> {
    let mut candidates: Vec<ScheduledJob> = JOB_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<ScheduledJob>(Some(entry.value().as_slice())))
            .filter(|job| job.status == JobStatus::Pending)
            .filter(|job| &job.lane == lane)
            .filter(|job| job.scheduled_for_ns <= now)
            .filter(|job| job.started_at_ns.is_none())
            .collect()
    });
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    let mut job = candidates.into_iter().next()?;
    job.started_at_ns = Some(now);
    job.attempts = job.attempts.saturating_add(1);
    save_job(&job);
    Some(job)
}

pub fn complete_job(job_id: &str, status: JobStatus, error: Option<String>, now: u64) {
    if let Some(mut job) = get_job(job_id) {
        job.status = status;
        job.error = error;
        job.finished_at_ns = Some(now);
        save_job(&job);
    }
    let state = scheduler_state();
    if state
        .lease
        .as_ref()
        .map(|lease| lease.job_id == job_id)
        .unwrap_or(false)
    {
        release_mutating_lease();
    }
}

pub fn list_recent_jobs(limit: usize) -> Vec<ScheduledJob> {
    if limit == 0 {
        return Vec::new();
    }
    JOB_MAP.with(|map| {
        map.borrow()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|entry| read_json(Some(entry.value().as_slice())))
            .collect()
    })
}

/// Fail pending jobs whose run was cut short by a trap. Without this a job
/// stamped started but never completed would block its slot forever.
pub fn reap_stuck_jobs(now: u64, ttl_ns: u64) -> Vec<String> {
    let stuck: Vec<ScheduledJob> = JOB_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<ScheduledJob>(Some(entry.value().as_slice())))
            .filter(|job| job.status == JobStatus::Pending)
            .filter(|job| {
                job.started_at_ns
                    .map(|started| now.saturating_sub(started) >= ttl_ns)
                    .unwrap_or(false)
            })
            .collect()
    });
    let mut reaped = Vec::with_capacity(stuck.len());
    for job in stuck {
        complete_job(
            &job.id,
            JobStatus::Failed,
            Some("job was abandoned mid-run".to_string()),
            now,
        );
        reaped.push(job.id);
    }
    reaped
}

/// Drop the oldest finished jobs beyond `keep`, along with their dedupe
/// markers, so the history stays bounded.
pub fn prune_job_history(keep: usize) {
    let finished: Vec<ScheduledJob> = JOB_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<ScheduledJob>(Some(entry.value().as_slice())))
            .filter(|job| job.status != JobStatus::Pending)
            .collect()
    });
    if finished.len() <= keep {
        return;
    }
    let drop_count = finished.len() - keep;
    for job in finished.iter().take(drop_count) {
        JOB_MAP.with(|map| {
            map.borrow_mut().remove(&job.id);
        });
        JOB_DEDUPE_MAP.with(|map| {
            let mut map = map.borrow_mut();
            let points_here = map
                .get(&job.dedupe_key)
                .map(|id| id == job.id)
                .unwrap_or(false);
            if points_here {
                map.remove(&job.dedupe_key);
            }
        });
    }
}

// ── Task schedules ──────────────────────────────────────────────────────────

fn default_task_config(kind: &TaskKind) -> TaskScheduleConfig {
    let (enabled, essential, interval_secs, priority, max_backoff_secs) = match kind {
        TaskKind::LedgerPoll => (true, true, LEDGER_POLL_INTERVAL_SECS, 40, 600),
        TaskKind::Dispatch => (true, true, DISPATCH_INTERVAL_SECS, 50, 600),
        TaskKind::StrategyCycle => (true, false, STRATEGY_CYCLE_INTERVAL_SECS, 30, 1_800),
        TaskKind::OracleSync => (true, false, ORACLE_SYNC_INTERVAL_SECS, 20, 7_200),
        TaskKind::DelegationSweep => (true, false, DELEGATION_SWEEP_INTERVAL_SECS, 10, 3_600),
        TaskKind::CheckCycles => (true, true, CYCLE_CHECK_INTERVAL_SECS, 60, 600),
    };
    TaskScheduleConfig {
        kind: kind.clone(),
        enabled,
        essential,
        interval_secs,
        priority,
        max_backoff_secs,
    }
}

pub fn init_scheduler_defaults(now: u64) {
    for kind in TaskKind::all() {
        if get_task_config(kind).is_none() {
            upsert_task_config(&default_task_config(kind));
        }
        if get_task_runtime(kind).is_none() {
            save_task_runtime(&TaskScheduleRuntime {
                kind: kind.clone(),
                next_due_ns: now,
                backoff_until_ns: None,
                consecutive_failures: 0,
                pending_job_id: None,
                last_started_ns: None,
                last_finished_ns: None,
                last_error: None,
            });
        }
    }
}

pub fn get_task_config(kind: &TaskKind) -> Option<TaskScheduleConfig> {
    TASK_CONFIG_MAP.with(|map| read_json(map.borrow().get(&kind.as_str().to_string()).as_deref()))
}

pub fn upsert_task_config(config: &TaskScheduleConfig) {
    TASK_CONFIG_MAP.with(|map| {
        map.borrow_mut()
            .insert(config.kind.as_str().to_string(), encode_json(config));
    });
}

pub fn list_task_configs() -> Vec<(TaskKind, TaskScheduleConfig)> {
    TASK_CONFIG_MAP.with(|map| {
        map.borrow()
            .iter()
            .filter_map(|entry| read_json::<TaskScheduleConfig>(Some(entry.value().as_slice())))
            .map(|config| (config.kind.clone(), config))
            .collect()
    })
}

pub fn set_task_enabled(kind: &TaskKind, enabled: bool) -> Result<TaskScheduleConfig, String> {
    let mut config = get_task_config(kind)
        .ok_or_else(|| format!("task config for {} is not initialized", kind.as_str()))?;
    config.enabled = enabled;
    upsert_task_config(&config);
    Ok(config)
}

pub fn set_task_interval_secs(
    kind: &TaskKind,
    interval_secs: u64,
) -> Result<TaskScheduleConfig, String> {
    if interval_secs == 0 {
        return Err("task interval must be at least one second".to_string());
    }
    let mut config = get_task_config(kind)
        .ok_or_else(|| format!("task config for {} is not initialized", kind.as_str()))?;
    config.interval_secs = interval_secs;
    upsert_task_config(&config);
    Ok(config)
}

pub fn get_task_runtime(kind: &TaskKind) -> Option<TaskScheduleRuntime> {
    TASK_RUNTIME_MAP.with(|map| read_json(map.borrow().get(&kind.as_str().to_string()).as_deref()))
}

pub fn save_task_runtime(runtime: &TaskScheduleRuntime) {
    TASK_RUNTIME_MAP.with(|map| {
        map.borrow_mut()
            .insert(runtime.kind.as_str().to_string(), encode_json(runtime));
    });
}

// ── JSON codec ──────────────────────────────────────────────────────────────

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn read_json<T: DeserializeOwned>(value: Option<&[u8]>) -> Option<T> {
    value.and_then(|raw| serde_json::from_slice(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::set_test_time_ns;

    fn sample_grant(permission_id: &str) -> PermissionGrant {
        PermissionGrant {
            permission_id: permission_id.to_string(),
            user_address: "0x00000000000000000000000000000000000000aa".to_string(),
            agent_id: "agent-manager".to_string(),
            delegate_address: "0x00000000000000000000000000000000000000bb".to_string(),
            token_address: "0x00000000000000000000000000000000000000cc".to_string(),
            amount_per_period_wei: "1000000000000000000".to_string(),
            period_secs: 86_400,
            total_amount_wei: "1000000000000000000".to_string(),
            amount_used_wei: "0".to_string(),
            granted_at_ns: 1_000,
            expires_at_ns: 2_000_000,
            revoked_at_ns: None,
            active: true,
            payload_hex: "0xdeadbeef".to_string(),
            status: DelegationStatus::Pending,
            claimed_at_ns: None,
            claim_tx_hash: None,
        }
    }

    #[test]
    fn grant_status_transition_rejects_terminal_reversal() {
        set_test_time_ns(10);
        upsert_grant(&sample_grant("perm-1"));

        let claimed = transition_grant_status("perm-1", DelegationStatus::Claimed, 50)
            .expect("pending grant should claim");
        assert_eq!(claimed.claimed_at_ns, Some(50));

        let error = transition_grant_status("perm-1", DelegationStatus::Revoked, 60)
            .expect_err("claimed grant should refuse revocation");
        assert!(error.contains("terminal records are immutable"));
    }

    #[test]
    fn grant_revocation_clears_active_flag() {
        set_test_time_ns(10);
        upsert_grant(&sample_grant("perm-2"));

        let revoked = transition_grant_status("perm-2", DelegationStatus::Revoked, 99)
            .expect("pending grant should revoke");
        assert!(!revoked.active);
        assert_eq!(revoked.revoked_at_ns, Some(99));
    }

    #[test]
    fn grant_usage_accumulates_and_clamps_at_the_total() {
        set_test_time_ns(10);
        let mut grant = sample_grant("perm-8");
        grant.total_amount_wei = "1000".to_string();
        grant.amount_used_wei = "0".to_string();
        upsert_grant(&grant);

        let updated = record_grant_usage("perm-8", "400").expect("usage should record");
        assert_eq!(updated.amount_used_wei, "400");
        let updated = record_grant_usage("perm-8", "700").expect("usage should record");
        assert_eq!(updated.amount_used_wei, "1000");
    }

    #[test]
    fn permission_processing_marker_fires_once() {
        set_test_time_ns(10);
        assert!(try_mark_permission_processed("perm-3", 10));
        assert!(!try_mark_permission_processed("perm-3", 20));
    }

    #[test]
    fn applied_event_marker_fires_once_per_key() {
        set_test_time_ns(10);
        assert!(try_mark_event_applied("execution-started:7", 10));
        assert!(try_mark_event_applied("execution-completed:7", 10));
        assert!(!try_mark_event_applied("execution-started:7", 20));
    }

    #[test]
    fn enqueue_job_dedupes_on_slot_key() {
        set_test_time_ns(10);
        let first = enqueue_job_if_absent(
            TaskKind::LedgerPoll,
            TaskLane::Observational,
            "LedgerPoll:1000",
            1_000,
            40,
        );
        assert!(first.is_some());
        let second = enqueue_job_if_absent(
            TaskKind::LedgerPoll,
            TaskLane::Observational,
            "LedgerPoll:1000",
            1_000,
            40,
        );
        assert!(second.is_none());
    }

    #[test]
    fn pop_prefers_higher_priority_then_older_jobs() {
        set_test_time_ns(10);
        enqueue_job_if_absent(
            TaskKind::DelegationSweep,
            TaskLane::Observational,
            "DelegationSweep:100",
            100,
            10,
        );
        enqueue_job_if_absent(
            TaskKind::CheckCycles,
            TaskLane::Observational,
            "CheckCycles:100",
            100,
            60,
        );

        let popped = pop_next_pending_job(&TaskLane::Observational, 200)
            .expect("a due job should be popped");
        assert_eq!(popped.kind, TaskKind::CheckCycles);
        assert_eq!(popped.attempts, 1);
        assert!(popped.started_at_ns.is_some());

        let next = pop_next_pending_job(&TaskLane::Observational, 200)
            .expect("the sweep job should follow");
        assert_eq!(next.kind, TaskKind::DelegationSweep);
    }

    #[test]
    fn pop_skips_jobs_scheduled_in_the_future() {
        set_test_time_ns(10);
        enqueue_job_if_absent(
            TaskKind::Dispatch,
            TaskLane::Mutating,
            "Dispatch:900",
            900,
            50,
        );
        assert!(pop_next_pending_job(&TaskLane::Mutating, 800).is_none());
        assert!(pop_next_pending_job(&TaskLane::Mutating, 900).is_some());
    }

    #[test]
    fn lease_blocks_second_acquire_until_expiry() {
        set_test_time_ns(10);
        assert!(acquire_mutating_lease("job-1", 1_000, 500));
        assert!(!acquire_mutating_lease("job-2", 1_200, 500));
        assert!(mutating_lease_active(1_400));
        assert!(acquire_mutating_lease("job-2", 1_500, 500));
    }

    #[test]
    fn stale_lease_recovery_fails_the_abandoned_job() {
        set_test_time_ns(10);
        let job_id = enqueue_job_if_absent(
            TaskKind::Dispatch,
            TaskLane::Mutating,
            "Dispatch:1",
            1,
            50,
        )
        .expect("job should enqueue");
        assert!(acquire_mutating_lease(&job_id, 1_000, 500));

        assert!(recover_stale_lease(1_200).is_none());
        let reaped = recover_stale_lease(2_000).expect("expired lease should be reaped");
        assert_eq!(reaped, job_id);
        assert!(!mutating_lease_active(2_000));

        let job = get_job(&job_id).expect("job should still be listed");
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn survival_tier_recovers_after_three_normal_observations() {
        set_test_time_ns(10);
        set_scheduler_survival_tier(SurvivalTier::Critical);
        assert_eq!(scheduler_survival_tier(), SurvivalTier::Critical);

        set_scheduler_survival_tier(SurvivalTier::Normal);
        assert_eq!(scheduler_survival_tier(), SurvivalTier::Critical);
        assert_eq!(scheduler_survival_tier_recovery_checks(), 1);

        set_scheduler_survival_tier(SurvivalTier::Normal);
        assert_eq!(scheduler_survival_tier_recovery_checks(), 2);

        set_scheduler_survival_tier(SurvivalTier::Normal);
        assert_eq!(scheduler_survival_tier(), SurvivalTier::Normal);
        assert_eq!(scheduler_survival_tier_recovery_checks(), 0);
    }

    #[test]
    fn survival_tier_recovery_resets_on_relapse() {
        set_test_time_ns(10);
        set_scheduler_survival_tier(SurvivalTier::Critical);
        set_scheduler_survival_tier(SurvivalTier::Normal);
        set_scheduler_survival_tier(SurvivalTier::Normal);
        assert_eq!(scheduler_survival_tier_recovery_checks(), 2);

        set_scheduler_survival_tier(SurvivalTier::LowCycles);
        assert_eq!(scheduler_survival_tier(), SurvivalTier::Critical);
        assert_eq!(scheduler_survival_tier_recovery_checks(), 0);
    }

    #[test]
    fn low_cycles_tier_recovers_immediately() {
        set_test_time_ns(10);
        set_scheduler_survival_tier(SurvivalTier::LowCycles);
        assert!(scheduler_low_cycles_mode());
        set_scheduler_survival_tier(SurvivalTier::Normal);
        assert!(!scheduler_low_cycles_mode());
    }

    #[test]
    fn survival_operation_backoff_doubles_and_clears_on_success() {
        set_test_time_ns(10);
        let class = SurvivalOperationClass::ChainBroadcast;
        assert!(can_run_survival_operation(&class, 0));

        record_survival_operation_failure(&class, 0, 600);
        assert_eq!(survival_operation_consecutive_failures(&class), 1);
        let first_backoff =
            survival_operation_backoff_until(&class).expect("backoff should be set");
        assert_eq!(first_backoff, 2 * NANOS_PER_SEC);
        assert!(!can_run_survival_operation(&class, NANOS_PER_SEC));
        assert!(can_run_survival_operation(&class, 2 * NANOS_PER_SEC));

        record_survival_operation_failure(&class, 0, 600);
        let second_backoff =
            survival_operation_backoff_until(&class).expect("backoff should extend");
        assert_eq!(second_backoff, 4 * NANOS_PER_SEC);

        record_survival_operation_success(&class);
        assert_eq!(survival_operation_consecutive_failures(&class), 0);
        assert!(can_run_survival_operation(&class, 0));
    }

    #[test]
    fn fanout_slots_are_spaced_and_never_rewind() {
        set_test_time_ns(10);
        let spacing = 2 * NANOS_PER_SEC;
        let first = next_fanout_slot(1_000, spacing);
        assert_eq!(first, 1_000);
        let second = next_fanout_slot(1_000, spacing);
        assert_eq!(second, 1_000 + spacing);
        let third = next_fanout_slot(1_000, spacing);
        assert_eq!(third, 1_000 + 2 * spacing);

        let far_future = 100 * NANOS_PER_SEC;
        let fourth = next_fanout_slot(far_future, spacing);
        assert_eq!(fourth, far_future);
    }

    #[test]
    fn intake_drain_consumes_only_its_own_lane() {
        set_test_time_ns(10);
        push_intake(IntakeKind::PermissionGrant, "perm-9", 100);
        push_intake(IntakeKind::Redelegation, "0xhash", 110);

        let drained = drain_intake(&IntakeKind::PermissionGrant, 10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].record_id, "perm-9");
        assert!(drain_intake(&IntakeKind::PermissionGrant, 10).is_empty());

        let redelegations = drain_intake(&IntakeKind::Redelegation, 10);
        assert_eq!(redelegations.len(), 1);
        assert_eq!(redelegations[0].record_id, "0xhash");
    }

    #[test]
    fn job_history_prune_drops_finished_jobs_and_dedupe_markers() {
        set_test_time_ns(10);
        for slot in 0..5u64 {
            let id = enqueue_job_if_absent(
                TaskKind::LedgerPoll,
                TaskLane::Observational,
                &format!("LedgerPoll:{slot}"),
                slot,
                40,
            )
            .expect("job should enqueue");
            complete_job(&id, JobStatus::Succeeded, None, slot + 1);
        }
        prune_job_history(2);
        assert_eq!(list_recent_jobs(10).len(), 2);

        let re_enqueued = enqueue_job_if_absent(
            TaskKind::LedgerPoll,
            TaskLane::Observational,
            "LedgerPoll:0",
            0,
            40,
        );
        assert!(re_enqueued.is_some());
    }

    #[test]
    fn scheduler_defaults_seed_every_task_once() {
        set_test_time_ns(10);
        init_scheduler_defaults(5_000);
        let configs = list_task_configs();
        assert_eq!(configs.len(), TaskKind::all().len());

        let dispatch = get_task_config(&TaskKind::Dispatch).expect("dispatch should be seeded");
        assert!(dispatch.enabled);
        assert!(dispatch.essential);

        set_task_enabled(&TaskKind::OracleSync, false).expect("oracle sync should toggle");
        init_scheduler_defaults(9_000);
        let oracle = get_task_config(&TaskKind::OracleSync).expect("oracle config should persist");
        assert!(!oracle.enabled);
    }

    #[test]
    fn stale_pending_executions_report_age() {
        set_test_time_ns(10);
        upsert_execution(&Execution {
            id: 7,
            agent_id: "agent-alpha".to_string(),
            user_address: "0x00000000000000000000000000000000000000aa".to_string(),
            amount_in_wei: "1000".to_string(),
            amount_out_wei: "0".to_string(),
            token_in: "0x00000000000000000000000000000000000000cc".to_string(),
            token_out: "0x00000000000000000000000000000000000000dd".to_string(),
            profit_loss_wei: "0".to_string(),
            profit_loss_percent: 0.0,
            result: ExecutionResult::Pending,
            started_at_ns: 1_000,
            completed_at_ns: None,
            duration_ns: None,
            start_tx_hash: "0xstart".to_string(),
            complete_tx_hash: None,
        });

        assert!(list_stale_pending_executions(1_500, 1_000).is_empty());
        let stale = list_stale_pending_executions(2_500, 1_000);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].execution_id, 7);
        assert_eq!(stale[0].age_ns, 1_500);
    }
}
