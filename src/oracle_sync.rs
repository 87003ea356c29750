//! Reputation oracle synchronization.
//!
//! One sync pass verifies write authorization, diffs every active agent's
//! ledger score against the on-chain copy, and pushes only the diverging
//! entries in fixed-size batches. An unauthorized pusher is a configuration
//! fault: the pass records it and disables its own task until an operator
//! reconfigures the oracle. Batch failures follow the recovery policy, and
//! the cursor and counters live in stable memory so a pass interrupted by
//! an upgrade resumes from a fresh diff.

use crate::chain::oracle::OraclePort;
use crate::domain::recovery_policy::{classify_chain_failure, decide_recovery_action};
use crate::domain::types::{RecoveryContext, RecoveryPolicyAction, TaskKind};
use crate::storage::stable;
use crate::timing::{current_time_ns, NANOS_PER_SEC};
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};

const PUSH_BACKOFF_BASE_SECS: u64 = 30;
const PUSH_BACKOFF_MAX_SECS: u64 = 3_600;

#[derive(Clone, Copy, Debug, LogPriorityLevels)]
pub enum OracleSyncLogPriority {
    #[log_level(capacity = 1000, name = "ORACLE_SYNC_INFO")]
    Info,
    #[log_level(capacity = 500, name = "ORACLE_SYNC_ERROR")]
    Error,
}

impl GetLogFilter for OracleSyncLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// Counters from one sync pass, rendered into the scheduler's log line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub pushed: u32,
    pub skipped: u32,
    pub batches_sent: u32,
    pub deferred: bool,
    pub notes: Vec<String>,
}

pub async fn sync_pass(oracle: &dyn OraclePort) -> Result<SyncOutcome, String> {
    let snapshot = stable::runtime_snapshot();
    let manager = snapshot
        .manager_address
        .clone()
        .ok_or_else(|| "manager wallet address is not derived yet".to_string())?;
    let now = current_time_ns();
    let mut state = stable::oracle_sync_state();
    let mut outcome = SyncOutcome::default();

    if let Some(retry_at) = state.next_retry_at_ns {
        if now < retry_at {
            outcome.deferred = true;
            outcome
                .notes
                .push("sync deferred until the batch backoff expires".to_string());
            return Ok(outcome);
        }
    }

    if !oracle.is_authorized_updater(&manager).await? {
        let fault = "oracle rejected pusher: not authorized".to_string();
        state.authorized = Some(false);
        state.last_error = Some(fault.clone());
        stable::save_oracle_sync_state(&state);
        stable::set_task_enabled(&TaskKind::OracleSync, false)?;
        log!(
            OracleSyncLogPriority::Error,
            "oracle_pusher_unauthorized manager={manager} task_disabled=true"
        );
        return Err(fault);
    }
    state.authorized = Some(true);

    // Push only agents whose on-chain score diverges from the ledger.
    let mut diff: Vec<(String, u64)> = Vec::new();
    for agent in stable::list_active_agents() {
        let ledger_score = u64::from(agent.reputation_score);
        if oracle.reputation_of(&agent.wallet_address).await? == ledger_score {
            state.skipped_total += 1;
            outcome.skipped += 1;
        } else {
            diff.push((agent.wallet_address, ledger_score));
        }
    }

    let batch_size = snapshot.oracle_batch_size.max(1) as usize;
    for (index, batch) in diff.chunks(batch_size).enumerate() {
        state.batch_cursor = index as u64;
        loop {
            match oracle.push_reputation_batch(batch).await {
                Ok(tx_hash) => {
                    state.pushed_total += batch.len() as u64;
                    state.consecutive_failures = 0;
                    state.next_retry_at_ns = None;
                    state.last_error = None;
                    outcome.pushed += batch.len() as u32;
                    outcome.batches_sent += 1;
                    log!(
                        OracleSyncLogPriority::Info,
                        "reputation_batch_pushed batch={index} entries={} tx={tx_hash}",
                        batch.len()
                    );
                    break;
                }
                Err(error) => {
                    let failures_before = state.consecutive_failures;
                    state.failed_batches += 1;
                    state.consecutive_failures = failures_before.saturating_add(1);
                    state.last_error = Some(error.clone());
                    let decision = decide_recovery_action(
                        &classify_chain_failure(&error),
                        &RecoveryContext {
                            consecutive_failures: failures_before,
                            backoff_base_secs: PUSH_BACKOFF_BASE_SECS,
                            backoff_max_secs: PUSH_BACKOFF_MAX_SECS,
                            response_limit: None,
                        },
                    );
                    match decision.action {
                        RecoveryPolicyAction::RetryImmediate => continue,
                        RecoveryPolicyAction::EscalateFault => {
                            stable::save_oracle_sync_state(&state);
                            stable::set_task_enabled(&TaskKind::OracleSync, false)?;
                            return Err(error);
                        }
                        _ => {
                            let delay =
                                decision.backoff_secs.unwrap_or(PUSH_BACKOFF_BASE_SECS);
                            state.next_retry_at_ns =
                                Some(now.saturating_add(delay.saturating_mul(NANOS_PER_SEC)));
                            stable::save_oracle_sync_state(&state);
                            log!(
                                OracleSyncLogPriority::Error,
                                "reputation_batch_failed batch={index} backoff_secs={delay} err={error}"
                            );
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    state.batch_cursor = 0;
    state.last_synced_at_ns = Some(now);
    stable::save_oracle_sync_state(&state);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::oracle::MockOracleAdapter;
    use crate::domain::types::Agent;
    use crate::test_support::block_on_with_spin;
    use crate::timing::set_test_time_ns;

    const MANAGER: &str = "0x00000000000000000000000000000000000000aa";
    const TREASURY: &str = "0x00000000000000000000000000000000000000ab";

    fn agent_with_score(index: u8, score: u8, now: u64) -> Agent {
        let address = format!("0x{:040x}", 0x1000 + u64::from(index));
        Agent {
            id: address.clone(),
            wallet_address: address,
            strategy: "momentum".to_string(),
            risk_level: 2,
            active: true,
            total_executions: 10,
            successful_executions: 7,
            failed_executions: 3,
            pending_executions: 0,
            total_volume_in_wei: "0".to_string(),
            total_volume_out_wei: "0".to_string(),
            profit_loss_wei: "0".to_string(),
            win_rate: 0.7,
            reputation_score: score,
            last_execution_at_ns: Some(now),
            registered_at_ns: now,
            updated_at_ns: now,
        }
    }

    fn sync_ready(now: u64) {
        stable::init_storage();
        set_test_time_ns(now);
        stable::init_scheduler_defaults(now);
        stable::set_wallet_addresses(MANAGER.to_string(), TREASURY.to_string());
    }

    fn run_sync(oracle: &MockOracleAdapter) -> SyncOutcome {
        block_on_with_spin(sync_pass(oracle)).expect("sync pass should succeed")
    }

    #[test]
    fn unauthorized_pusher_records_the_fault_and_disables_the_task() {
        let start = 1_000 * NANOS_PER_SEC;
        sync_ready(start);
        stable::upsert_agent(&agent_with_score(1, 76, start));
        let oracle = MockOracleAdapter::new(false);

        let error = block_on_with_spin(sync_pass(&oracle))
            .expect_err("unauthorized pusher should fail the pass");
        assert!(error.contains("not authorized"), "got: {error}");

        let state = stable::oracle_sync_state();
        assert_eq!(state.authorized, Some(false));
        assert!(state.last_error.as_deref().unwrap_or_default().contains("not authorized"));
        let config = stable::get_task_config(&TaskKind::OracleSync)
            .expect("task config should be initialized");
        assert!(!config.enabled);
        assert!(oracle.batches.borrow().is_empty());
    }

    #[test]
    fn only_diverging_scores_are_pushed() {
        let start = 1_000 * NANOS_PER_SEC;
        sync_ready(start);
        let diverging = agent_with_score(1, 76, start);
        let matching = agent_with_score(2, 50, start);
        stable::upsert_agent(&diverging);
        stable::upsert_agent(&matching);
        let oracle = MockOracleAdapter::new(true);
        oracle
            .scores
            .borrow_mut()
            .insert(matching.wallet_address.clone(), 50);

        let outcome = run_sync(&oracle);
        assert_eq!(outcome.pushed, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.batches_sent, 1);
        assert_eq!(
            oracle.scores.borrow().get(&diverging.wallet_address).copied(),
            Some(76)
        );

        let state = stable::oracle_sync_state();
        assert_eq!(state.authorized, Some(true));
        assert_eq!(state.pushed_total, 1);
        assert_eq!(state.skipped_total, 1);
        assert_eq!(state.last_synced_at_ns, Some(start));
    }

    #[test]
    fn batches_split_at_the_configured_size() {
        let start = 1_000 * NANOS_PER_SEC;
        sync_ready(start);
        stable::set_oracle_batch_size(2).expect("batch size should accept");
        for index in 1..=5u8 {
            stable::upsert_agent(&agent_with_score(index, 60 + index, start));
        }
        let oracle = MockOracleAdapter::new(true);

        let outcome = run_sync(&oracle);
        assert_eq!(outcome.pushed, 5);
        assert_eq!(outcome.batches_sent, 3);
        let batches = oracle.batches.borrow();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn rate_limited_batch_backs_off_and_resumes_on_a_later_pass() {
        let start = 1_000 * NANOS_PER_SEC;
        sync_ready(start);
        for index in 1..=3u8 {
            stable::upsert_agent(&agent_with_score(index, 70 + index, start));
        }
        let oracle = MockOracleAdapter::new(true);
        *oracle.fail_push_with.borrow_mut() =
            Some("rpc endpoint returned status 429".to_string());

        let error = block_on_with_spin(sync_pass(&oracle))
            .expect_err("rate limited batch should fail the pass");
        assert!(error.contains("429"), "got: {error}");
        let state = stable::oracle_sync_state();
        assert_eq!(state.failed_batches, 1);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(
            state.next_retry_at_ns,
            Some(start + PUSH_BACKOFF_BASE_SECS * NANOS_PER_SEC)
        );
        assert!(oracle.batches.borrow().is_empty());

        // Inside the backoff window the pass defers without touching chain.
        let outcome = run_sync(&oracle);
        assert!(outcome.deferred);
        assert!(oracle.batches.borrow().is_empty());

        // Past the window the recomputed diff pushes everything.
        set_test_time_ns(start + (PUSH_BACKOFF_BASE_SECS + 1) * NANOS_PER_SEC);
        let outcome = run_sync(&oracle);
        assert_eq!(outcome.pushed, 3);
        let state = stable::oracle_sync_state();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.next_retry_at_ns, None);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn transient_upstream_failure_retries_the_batch_within_the_pass() {
        let start = 1_000 * NANOS_PER_SEC;
        sync_ready(start);
        stable::upsert_agent(&agent_with_score(1, 76, start));
        let oracle = MockOracleAdapter::new(true);
        *oracle.fail_push_with.borrow_mut() =
            Some("rpc endpoint returned status 503".to_string());

        let outcome = run_sync(&oracle);
        assert_eq!(outcome.pushed, 1);
        let state = stable::oracle_sync_state();
        assert_eq!(state.failed_batches, 1);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(oracle.batches.borrow().len(), 1);
    }

    #[test]
    fn policy_rejection_disables_the_task() {
        let start = 1_000 * NANOS_PER_SEC;
        sync_ready(start);
        stable::upsert_agent(&agent_with_score(1, 76, start));
        let oracle = MockOracleAdapter::new(true);
        *oracle.fail_push_with.borrow_mut() =
            Some("transaction rejected by policy".to_string());

        let error = block_on_with_spin(sync_pass(&oracle))
            .expect_err("policy rejection should fail the pass");
        assert!(error.contains("rejected"), "got: {error}");
        let config = stable::get_task_config(&TaskKind::OracleSync)
            .expect("task config should be initialized");
        assert!(!config.enabled);
    }
}
