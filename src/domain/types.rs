use candid::CandidType;
use serde::{Deserialize, Serialize};

// ── Ledger aggregates ───────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Agent {
    pub id: String,
    pub wallet_address: String,
    pub strategy: String,
    pub risk_level: u8,
    pub active: bool,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub pending_executions: u64,
    pub total_volume_in_wei: String,
    pub total_volume_out_wei: String,
    pub profit_loss_wei: String,
    pub win_rate: f64,
    pub reputation_score: u8,
    pub last_execution_at_ns: Option<u64>,
    pub registered_at_ns: u64,
    pub updated_at_ns: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    Pending,
    Success,
    Failure,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Execution {
    pub id: u64,
    pub agent_id: String,
    pub user_address: String,
    pub amount_in_wei: String,
    pub amount_out_wei: String,
    pub token_in: String,
    pub token_out: String,
    pub profit_loss_wei: String,
    pub profit_loss_percent: f64,
    pub result: ExecutionResult,
    pub started_at_ns: u64,
    pub completed_at_ns: Option<u64>,
    pub duration_ns: Option<u64>,
    pub start_tx_hash: String,
    pub complete_tx_hash: Option<String>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserAccount {
    pub address: String,
    pub total_executions: u64,
    pub cumulative_profit_wei: String,
    pub first_seen_at_ns: u64,
    pub last_activity_at_ns: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Redelegation {
    pub id: String,
    pub parent_agent_id: String,
    pub child_agent_id: String,
    pub user_address: String,
    pub amount_wei: String,
    pub created_at_ns: u64,
    pub expires_at_ns: u64,
    pub active: bool,
    pub delegation_hash: String,
    pub tx_hash: String,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GlobalStats {
    pub total_agents: u64,
    pub active_agents: u64,
    pub total_users: u64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_permissions: u64,
    pub total_redelegations: u64,
    pub total_volume_wei: String,
    pub total_profit_wei: String,
    pub updated_at_ns: u64,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            total_agents: 0,
            active_agents: 0,
            total_users: 0,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            total_permissions: 0,
            total_redelegations: 0,
            total_volume_wei: "0".to_string(),
            total_profit_wei: "0".to_string(),
            updated_at_ns: 0,
        }
    }
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DailyAgentStats {
    pub agent_id: String,
    pub day_index: u64,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub volume_wei: String,
    pub profit_wei: String,
    pub win_rate: f64,
}

// ── Delegation store records ────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum DelegationStatus {
    Pending,
    Claimed,
    Redeemed,
    Expired,
    Revoked,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PermissionGrant {
    pub permission_id: String,
    pub user_address: String,
    pub agent_id: String,
    pub delegate_address: String,
    pub token_address: String,
    pub amount_per_period_wei: String,
    pub period_secs: u64,
    pub total_amount_wei: String,
    pub amount_used_wei: String,
    pub granted_at_ns: u64,
    pub expires_at_ns: u64,
    pub revoked_at_ns: Option<u64>,
    pub active: bool,
    pub payload_hex: String,
    pub status: DelegationStatus,
    pub claimed_at_ns: Option<u64>,
    pub claim_tx_hash: Option<String>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DelegationRecord {
    pub delegation_hash: String,
    pub parent_agent_id: String,
    pub child_agent_id: String,
    pub child_address: String,
    pub user_address: String,
    pub token_address: String,
    pub amount_wei: String,
    pub created_at_ns: u64,
    pub expires_at_ns: u64,
    pub payload_hex: String,
    pub status: DelegationStatus,
    pub redeemed_at_ns: Option<u64>,
    pub redemption_tx_hash: Option<String>,
    pub last_error: Option<String>,
}

// ── Specialist roster ───────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SpecialistProfile {
    pub agent_id: String,
    pub wallet_address: String,
    pub strategy: String,
    pub allocation_bps: u32,
    pub sim_win_rate_bps: u32,
    pub sim_profit_bps_min: u32,
    pub sim_profit_bps_max: u32,
    pub sim_loss_bps_min: u32,
    pub sim_loss_bps_max: u32,
}

// ── On-chain event stream ───────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum LedgerEvent {
    AgentRegistered {
        agent_id: String,
        wallet_address: String,
        strategy: String,
        risk_level: u8,
    },
    AgentUpdated {
        agent_id: String,
        strategy: String,
        risk_level: u8,
    },
    AgentDeactivated {
        agent_id: String,
    },
    AgentReactivated {
        agent_id: String,
    },
    ExecutionStarted {
        execution_id: u64,
        agent_id: String,
        user_address: String,
        amount_in_wei: String,
        token_in: String,
        token_out: String,
    },
    ExecutionCompleted {
        execution_id: u64,
        agent_id: String,
        amount_out_wei: String,
        profit_loss_wei: String,
        success: bool,
    },
    RedelegationCreated {
        parent_agent_id: String,
        child_agent_id: String,
        user_address: String,
        amount_wei: String,
        expires_at_ns: u64,
        delegation_hash: String,
    },
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObservedEvent {
    pub chain_id: u64,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: String,
    pub observed_at_ns: u64,
    pub event: LedgerEvent,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LedgerPollCursor {
    pub chain_id: u64,
    pub next_block: u64,
    pub last_poll_at_ns: u64,
    pub consecutive_empty_polls: u32,
}

impl Default for LedgerPollCursor {
    fn default() -> Self {
        Self {
            chain_id: 8453,
            next_block: 0,
            last_poll_at_ns: 0,
            consecutive_empty_polls: 0,
        }
    }
}

// ── Fan-out allocation queue ────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum AllocationStatus {
    Queued,
    Funded,
    NotFunded,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AllocationItem {
    pub id: String,
    pub permission_id: String,
    pub user_address: String,
    pub specialist_agent_id: String,
    pub specialist_address: String,
    pub token_address: String,
    pub amount_wei: String,
    pub attempts: u32,
    pub not_before_ns: u64,
    pub status: AllocationStatus,
    pub delegation_hash: Option<String>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub created_at_ns: u64,
    pub updated_at_ns: u64,
}

// ── Push intake channel ─────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum IntakeKind {
    PermissionGrant,
    Redelegation,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IntakeMessage {
    pub id: String,
    pub kind: IntakeKind,
    pub record_id: String,
    pub received_at_ns: u64,
    pub consumed: bool,
}

// ── Settlement ──────────────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum SettlementKind {
    Profit,
    Loss,
    Neutral,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum WalletRole {
    Manager,
    Treasury,
    Specialist(String),
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SettlementLeg {
    pub from_role: WalletRole,
    pub to_address: String,
    pub token_address: Option<String>,
    pub amount_wei: String,
    pub label: String,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedLeg {
    pub leg: SettlementLeg,
    pub tx_hash: String,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SettlementReport {
    pub execution_id: u64,
    pub kind: SettlementKind,
    pub completed: Vec<CompletedLeg>,
    pub error: Option<String>,
}

// ── Oracle sync ─────────────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OracleSyncState {
    pub authorized: Option<bool>,
    pub last_synced_at_ns: Option<u64>,
    pub pushed_total: u64,
    pub skipped_total: u64,
    pub failed_batches: u64,
    pub consecutive_failures: u32,
    pub next_retry_at_ns: Option<u64>,
    pub batch_cursor: u64,
    pub last_error: Option<String>,
}

impl Default for OracleSyncState {
    fn default() -> Self {
        Self {
            authorized: None,
            last_synced_at_ns: None,
            pushed_total: 0,
            skipped_total: 0,
            failed_batches: 0,
            consecutive_failures: 0,
            next_retry_at_ns: None,
            batch_cursor: 0,
            last_error: None,
        }
    }
}

// ── Runtime configuration snapshot ──────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RuntimeSnapshot {
    pub chain_id: u64,
    pub rpc_url: String,
    pub fallback_rpc_url: Option<String>,
    pub max_response_bytes: Option<u64>,
    pub registry_address: Option<String>,
    pub oracle_address: Option<String>,
    pub settlement_token_address: Option<String>,
    pub ecdsa_key_name: String,
    pub manager_address: Option<String>,
    pub treasury_address: Option<String>,
    pub roster: Vec<SpecialistProfile>,
    pub min_profit_bps: u32,
    pub trade_floor_wei: String,
    pub trade_ceiling_wei: String,
    pub oracle_batch_size: u32,
    pub ledger_cursor: LedgerPollCursor,
    pub oracle_sync: OracleSyncState,
    pub allocation_seq: u64,
    pub intake_seq: u64,
    pub fanout_watermark_ns: u64,
    pub updated_at_ns: u64,
}

impl Default for RuntimeSnapshot {
    fn default() -> Self {
        Self {
            chain_id: 8453,
            rpc_url: String::new(),
            fallback_rpc_url: None,
            max_response_bytes: None,
            registry_address: None,
            oracle_address: None,
            settlement_token_address: None,
            ecdsa_key_name: String::new(),
            manager_address: None,
            treasury_address: None,
            roster: Vec::new(),
            min_profit_bps: 50,
            trade_floor_wei: "1000000000000000".to_string(),
            trade_ceiling_wei: "1000000000000000000".to_string(),
            oracle_batch_size: 10,
            ledger_cursor: LedgerPollCursor::default(),
            oracle_sync: OracleSyncState::default(),
            allocation_seq: 0,
            intake_seq: 0,
            fanout_watermark_ns: 0,
            updated_at_ns: 0,
        }
    }
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct RuntimeView {
    pub chain_id: u64,
    pub rpc_configured: bool,
    pub registry_address: Option<String>,
    pub oracle_address: Option<String>,
    pub manager_address: Option<String>,
    pub treasury_address: Option<String>,
    pub roster_size: u32,
    pub queued_allocations: u64,
    pub ledger_next_block: u64,
    pub consecutive_empty_polls: u32,
    pub oracle_last_synced_at_ns: Option<u64>,
    pub oracle_last_error: Option<String>,
    pub global_stats: GlobalStats,
    pub updated_at_ns: u64,
}

/// Per-component reputation breakdown for one agent, produced from the same
/// formula the stored score uses.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct ReputationView {
    pub agent_id: String,
    pub win_rate_score: f64,
    pub profitability_score: f64,
    pub volume_score: f64,
    pub experience_score: f64,
    pub efficiency_score: f64,
    pub score: u8,
}

// ── Scheduler ───────────────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    LedgerPoll,
    Dispatch,
    StrategyCycle,
    OracleSync,
    DelegationSweep,
    CheckCycles,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::LedgerPoll => "LedgerPoll",
            TaskKind::Dispatch => "Dispatch",
            TaskKind::StrategyCycle => "StrategyCycle",
            TaskKind::OracleSync => "OracleSync",
            TaskKind::DelegationSweep => "DelegationSweep",
            TaskKind::CheckCycles => "CheckCycles",
        }
    }

    pub fn all() -> &'static [TaskKind] {
        &[
            TaskKind::LedgerPoll,
            TaskKind::Dispatch,
            TaskKind::StrategyCycle,
            TaskKind::OracleSync,
            TaskKind::DelegationSweep,
            TaskKind::CheckCycles,
        ]
    }
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum TaskLane {
    Mutating,
    Observational,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ScheduledJob {
    pub id: String,
    pub kind: TaskKind,
    pub lane: TaskLane,
    pub dedupe_key: String,
    pub scheduled_for_ns: u64,
    pub priority: u8,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at_ns: u64,
    pub started_at_ns: Option<u64>,
    pub finished_at_ns: Option<u64>,
    pub error: Option<String>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskScheduleConfig {
    pub kind: TaskKind,
    pub enabled: bool,
    pub essential: bool,
    pub interval_secs: u64,
    pub priority: u8,
    pub max_backoff_secs: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskScheduleRuntime {
    pub kind: TaskKind,
    pub next_due_ns: u64,
    pub backoff_until_ns: Option<u64>,
    pub consecutive_failures: u32,
    pub pending_job_id: Option<String>,
    pub last_started_ns: Option<u64>,
    pub last_finished_ns: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum SurvivalTier {
    Normal,
    LowCycles,
    Critical,
    OutOfCycles,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum SurvivalOperationClass {
    LedgerPoll,
    ChainRead,
    ChainBroadcast,
    ThresholdSign,
}

impl SurvivalOperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurvivalOperationClass::LedgerPoll => "LedgerPoll",
            SurvivalOperationClass::ChainRead => "ChainRead",
            SurvivalOperationClass::ChainBroadcast => "ChainBroadcast",
            SurvivalOperationClass::ThresholdSign => "ThresholdSign",
        }
    }
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SurvivalOperationState {
    pub class: SurvivalOperationClass,
    pub consecutive_failures: u32,
    pub backoff_until_ns: Option<u64>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SchedulerLease {
    pub job_id: String,
    pub acquired_at_ns: u64,
    pub ttl_ns: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SchedulerState {
    pub enabled: bool,
    pub survival_tier: SurvivalTier,
    pub tier_recovery_checks: u8,
    pub lease: Option<SchedulerLease>,
    pub operation_states: Vec<SurvivalOperationState>,
    pub last_tick_start_ns: u64,
    pub last_tick_end_ns: u64,
    pub last_tick_error: Option<String>,
    pub job_seq: u64,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            enabled: true,
            survival_tier: SurvivalTier::Normal,
            tier_recovery_checks: 0,
            lease: None,
            operation_states: Vec::new(),
            last_tick_start_ns: 0,
            last_tick_end_ns: 0,
            last_tick_error: None,
            job_seq: 0,
        }
    }
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct SchedulerRuntimeView {
    pub enabled: bool,
    pub survival_tier: SurvivalTier,
    pub survival_tier_recovery_checks: u8,
    pub lease_active: bool,
    pub last_tick_start_ns: u64,
    pub last_tick_end_ns: u64,
    pub last_tick_error: Option<String>,
}

// ── Recovery / failure classification ───────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum OutcallFailureKind {
    Timeout,
    Transport,
    UpstreamUnavailable,
    RateLimited,
    InvalidRequest,
    RejectedByPolicy,
    InvalidResponse,
    ResponseTooLarge,
    Unknown,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OutcallFailure {
    pub kind: OutcallFailureKind,
    pub retry_after_secs: Option<u64>,
    pub observed_response_bytes: Option<u64>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum OperationFailureKind {
    InsufficientCycles,
    MissingConfiguration,
    InvalidConfiguration,
    Unauthorized,
    BlockedBySurvivalPolicy,
    Deterministic,
    Unknown,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OperationFailure {
    pub kind: OperationFailureKind,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryFailure {
    Outcall(OutcallFailure),
    Operation(OperationFailure),
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryPolicyAction {
    RetryImmediate,
    Backoff,
    Skip,
    EscalateFault,
    TuneResponseLimit,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryDecisionReason {
    TransientOutcallFailure,
    OutcallRateLimited,
    NonRetriableOutcallFailure,
    ResponseTooLarge,
    ResponseLimitAlreadyMaxed,
    SurvivalPolicyBlocked,
    InsufficientCycles,
    NonRetriableOperationFailure,
    UnknownFailure,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub action: RecoveryPolicyAction,
    pub reason: RecoveryDecisionReason,
    pub backoff_secs: Option<u64>,
    pub response_limit_adjustment: Option<ResponseLimitAdjustment>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RecoveryContext {
    pub consecutive_failures: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub response_limit: Option<ResponseLimitPolicy>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResponseLimitPolicy {
    pub current_bytes: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub tune_multiplier: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResponseLimitAdjustment {
    pub from_bytes: u64,
    pub to_bytes: u64,
}

// ── Anomaly views ───────────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StaleExecution {
    pub execution_id: u64,
    pub agent_id: String,
    pub pending_since_ns: u64,
    pub age_ns: u64,
}
