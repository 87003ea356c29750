//! Ledger event application.
//!
//! Every observed registry event funnels through [`apply_observed_event`],
//! whether the block poller delivered it or the canister decoded it out of a
//! receipt for a transaction it broadcast itself. A persisted dedup set keyed
//! on event identity collapses the two delivery paths, and the mark plus all
//! aggregate updates run in one synchronous span so a trap rolls them back
//! together.

use crate::domain::amount::{
    format_signed_wei, parse_signed_wei, parse_wei, signed_wei_add, signed_wei_to_f64, wei_add,
    wei_to_f64,
};
use crate::domain::reputation::{compute_score, ScoreInputs, NEUTRAL_SCORE};
use crate::domain::types::{
    Agent, DailyAgentStats, Execution, ExecutionResult, LedgerEvent, ObservedEvent, Redelegation,
    UserAccount,
};
use crate::storage::stable;
use crate::timing::NANOS_PER_SEC;
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};

const NANOS_PER_DAY: u64 = 86_400 * NANOS_PER_SEC;

#[derive(Clone, Copy, Debug, LogPriorityLevels)]
pub enum LedgerLogPriority {
    #[log_level(capacity = 1000, name = "LEDGER_INFO")]
    Info,
    #[log_level(capacity = 500, name = "LEDGER_WARN")]
    Warn,
}

impl GetLogFilter for LedgerLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// What happened to one delivered event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The dedup set already holds this event's key.
    AlreadyApplied,
    /// The event is well-formed but contradicts stored state; it is marked
    /// applied so redelivery cannot retry it.
    Skipped(String),
}

/// Apply one observed event to the ledger aggregates, exactly once.
///
/// `Err` is reserved for stored aggregates that no longer parse; integrity
/// faults in the event stream itself come back as [`ApplyOutcome::Skipped`].
pub fn apply_observed_event(observed: &ObservedEvent) -> Result<ApplyOutcome, String> {
    let key = event_dedup_key(observed);
    if !stable::try_mark_event_applied(&key, observed.observed_at_ns) {
        return Ok(ApplyOutcome::AlreadyApplied);
    }

    let now = observed.observed_at_ns;
    let outcome = match &observed.event {
        LedgerEvent::AgentRegistered {
            agent_id,
            wallet_address,
            strategy,
            risk_level,
        } => {
            log!(
                LedgerLogPriority::Info,
                "agent_registered agent={agent_id} wallet={wallet_address} strategy={strategy}"
            );
            Ok(apply_agent_profile(agent_id, now, |agent| {
                agent.wallet_address = wallet_address.clone();
                agent.strategy = strategy.clone();
                agent.risk_level = *risk_level;
                agent.active = true;
            }))
        }
        LedgerEvent::AgentUpdated {
            agent_id,
            strategy,
            risk_level,
        } => Ok(apply_agent_profile(agent_id, now, |agent| {
            agent.strategy = strategy.clone();
            agent.risk_level = *risk_level;
        })),
        LedgerEvent::AgentDeactivated { agent_id } => {
            Ok(apply_agent_profile(agent_id, now, |agent| {
                agent.active = false;
            }))
        }
        LedgerEvent::AgentReactivated { agent_id } => {
            Ok(apply_agent_profile(agent_id, now, |agent| {
                agent.active = true;
            }))
        }
        LedgerEvent::ExecutionStarted {
            execution_id,
            agent_id,
            user_address,
            amount_in_wei,
            token_in,
            token_out,
        } => apply_execution_started(
            observed,
            *execution_id,
            agent_id,
            user_address,
            amount_in_wei,
            token_in,
            token_out,
        ),
        LedgerEvent::ExecutionCompleted {
            execution_id,
            amount_out_wei,
            profit_loss_wei,
            success,
            ..
        } => apply_execution_completed(observed, *execution_id, amount_out_wei, profit_loss_wei, *success),
        LedgerEvent::RedelegationCreated {
            delegation_hash,
            parent_agent_id,
            child_agent_id,
            user_address,
            amount_wei,
            expires_at_ns,
        } => Ok(apply_redelegation_created(
            observed,
            delegation_hash,
            parent_agent_id,
            child_agent_id,
            user_address,
            amount_wei,
            *expires_at_ns,
        )),
    };
    if let Ok(ApplyOutcome::Skipped(reason)) = &outcome {
        log!(
            LedgerLogPriority::Warn,
            "event_integrity_skip key={key} reason={reason}"
        );
    }
    outcome
}

/// Identity of an event for exactly-once application.
///
/// Execution and redelegation events key on their chain-assigned ids, so the
/// copy synthesized from a broadcast receipt and the copy the poller finds
/// later collapse to one key even though their log positions differ. Agent
/// lifecycle events only ever arrive through the poller and key on position.
fn event_dedup_key(observed: &ObservedEvent) -> String {
    match &observed.event {
        LedgerEvent::ExecutionStarted { execution_id, .. } => {
            format!("execution-started:{execution_id}")
        }
        LedgerEvent::ExecutionCompleted { execution_id, .. } => {
            format!("execution-completed:{execution_id}")
        }
        LedgerEvent::RedelegationCreated {
            delegation_hash, ..
        } => format!("redelegation-created:{delegation_hash}"),
        _ => format!("{}:{:010}", observed.tx_hash, observed.log_index),
    }
}

/// Score inputs derived from an agent's stored lifetime totals. Completed
/// executions only; pending ones have no outcome to score.
pub fn score_inputs(agent: &Agent) -> Result<ScoreInputs, String> {
    let completed = agent.successful_executions + agent.failed_executions;
    let profit_loss = signed_wei_to_f64(&agent.profit_loss_wei, "agent profitLoss")?;
    Ok(ScoreInputs {
        win_rate: agent.win_rate,
        total_volume_wei: wei_to_f64(&agent.total_volume_in_wei, "agent volumeIn")?,
        profit_loss_wei: profit_loss,
        execution_count: completed,
        avg_profit_per_trade_wei: if completed == 0 {
            0.0
        } else {
            profit_loss / completed as f64
        },
    })
}

fn blank_agent(agent_id: &str, now: u64) -> Agent {
    Agent {
        id: agent_id.to_string(),
        // Agent ids are wallet addresses, so an auto-created profile starts
        // with its id as the payout address until a registration event lands.
        wallet_address: agent_id.to_string(),
        strategy: String::new(),
        risk_level: 0,
        active: true,
        total_executions: 0,
        successful_executions: 0,
        failed_executions: 0,
        pending_executions: 0,
        total_volume_in_wei: "0".to_string(),
        total_volume_out_wei: "0".to_string(),
        profit_loss_wei: "0".to_string(),
        win_rate: 0.0,
        reputation_score: NEUTRAL_SCORE,
        last_execution_at_ns: None,
        registered_at_ns: now,
        updated_at_ns: now,
    }
}

/// Lifecycle events mutate the profile fields and never the counters, so a
/// re-registration cannot erase an agent's history.
fn apply_agent_profile(agent_id: &str, now: u64, update: impl FnOnce(&mut Agent)) -> ApplyOutcome {
    let mut agent = stable::get_agent(agent_id).unwrap_or_else(|| blank_agent(agent_id, now));
    update(&mut agent);
    agent.updated_at_ns = now;
    stable::upsert_agent(&agent);
    refresh_global_agent_counts(now);
    ApplyOutcome::Applied
}

// Lifecycle events are rare enough that recounting the whole agent table is
// cheaper than keeping increments correct across re-registrations.
fn refresh_global_agent_counts(now: u64) {
    let agents = stable::list_agents();
    let mut stats = stable::global_stats();
    stats.total_agents = agents.len() as u64;
    stats.active_agents = agents.iter().filter(|agent| agent.active).count() as u64;
    stats.updated_at_ns = now;
    stable::save_global_stats(&stats);
}

fn apply_execution_started(
    observed: &ObservedEvent,
    execution_id: u64,
    agent_id: &str,
    user_address: &str,
    amount_in_wei: &str,
    token_in: &str,
    token_out: &str,
) -> Result<ApplyOutcome, String> {
    if stable::get_execution(execution_id).is_some() {
        return Ok(ApplyOutcome::Skipped(format!(
            "execution {execution_id} is already recorded"
        )));
    }

    let now = observed.observed_at_ns;
    let amount_in = parse_wei(amount_in_wei, "execution amountIn")?;

    let stored_agent = stable::get_agent(agent_id);
    let is_new_agent = stored_agent.is_none();
    let mut agent = stored_agent.unwrap_or_else(|| blank_agent(agent_id, now));
    agent.total_executions += 1;
    agent.pending_executions += 1;
    agent.total_volume_in_wei = wei_add(&agent.total_volume_in_wei, amount_in, "agent volumeIn")?;
    agent.last_execution_at_ns = Some(now);
    agent.updated_at_ns = now;

    let stored_account = stable::get_user_account(user_address);
    let is_new_user = stored_account.is_none();
    let mut account = stored_account.unwrap_or_else(|| UserAccount {
        address: user_address.to_string(),
        total_executions: 0,
        cumulative_profit_wei: "0".to_string(),
        first_seen_at_ns: now,
        last_activity_at_ns: now,
    });
    account.total_executions += 1;
    account.last_activity_at_ns = now;

    let mut stats = stable::global_stats();
    stats.total_executions += 1;
    stats.total_volume_wei = wei_add(&stats.total_volume_wei, amount_in, "global volume")?;
    if is_new_agent {
        stats.total_agents += 1;
        stats.active_agents += 1;
    }
    if is_new_user {
        stats.total_users += 1;
    }
    stats.updated_at_ns = now;

    stable::upsert_execution(&Execution {
        id: execution_id,
        agent_id: agent_id.to_string(),
        user_address: user_address.to_string(),
        amount_in_wei: amount_in.to_string(),
        amount_out_wei: "0".to_string(),
        token_in: token_in.to_string(),
        token_out: token_out.to_string(),
        profit_loss_wei: "0".to_string(),
        profit_loss_percent: 0.0,
        result: ExecutionResult::Pending,
        started_at_ns: now,
        completed_at_ns: None,
        duration_ns: None,
        start_tx_hash: observed.tx_hash.clone(),
        complete_tx_hash: None,
    });
    stable::upsert_agent(&agent);
    stable::upsert_user_account(&account);
    stable::save_global_stats(&stats);
    Ok(ApplyOutcome::Applied)
}

fn apply_execution_completed(
    observed: &ObservedEvent,
    execution_id: u64,
    amount_out_wei: &str,
    profit_loss_wei: &str,
    success: bool,
) -> Result<ApplyOutcome, String> {
    let mut execution = match stable::get_execution(execution_id) {
        Some(execution) => execution,
        None => {
            return Ok(ApplyOutcome::Skipped(format!(
                "completion for unknown execution {execution_id}"
            )))
        }
    };
    if execution.result != ExecutionResult::Pending {
        return Ok(ApplyOutcome::Skipped(format!(
            "execution {execution_id} is no longer pending"
        )));
    }

    let mut agent = stable::get_agent(&execution.agent_id).ok_or_else(|| {
        format!(
            "agent {} is missing for execution {execution_id}",
            execution.agent_id
        )
    })?;
    let mut account = stable::get_user_account(&execution.user_address).ok_or_else(|| {
        format!(
            "user account {} is missing for execution {execution_id}",
            execution.user_address
        )
    })?;

    let now = observed.observed_at_ns;
    let amount_in = parse_wei(&execution.amount_in_wei, "execution amountIn")?;
    let amount_out = parse_wei(amount_out_wei, "execution amountOut")?;
    let (profit_negative, profit_magnitude) =
        parse_signed_wei(profit_loss_wei, "execution profitLoss")?;
    let profit_loss = format_signed_wei(profit_negative, profit_magnitude);
    let amount_in_value = wei_to_f64(&execution.amount_in_wei, "execution amountIn")?;
    let profit_value = signed_wei_to_f64(&profit_loss, "execution profitLoss")?;

    execution.amount_out_wei = amount_out.to_string();
    execution.profit_loss_wei = profit_loss;
    execution.profit_loss_percent = if amount_in_value == 0.0 {
        0.0
    } else {
        profit_value / amount_in_value * 100.0
    };
    execution.result = if success {
        ExecutionResult::Success
    } else {
        ExecutionResult::Failure
    };
    execution.completed_at_ns = Some(now);
    execution.duration_ns = Some(now.saturating_sub(execution.started_at_ns));
    execution.complete_tx_hash = Some(observed.tx_hash.clone());

    agent.pending_executions = agent.pending_executions.saturating_sub(1);
    if success {
        agent.successful_executions += 1;
    } else {
        agent.failed_executions += 1;
    }
    agent.total_volume_out_wei =
        wei_add(&agent.total_volume_out_wei, amount_out, "agent volumeOut")?;
    agent.profit_loss_wei = signed_wei_add(
        &agent.profit_loss_wei,
        profit_negative,
        profit_magnitude,
        "agent profitLoss",
    )?;
    let completed = agent.successful_executions + agent.failed_executions;
    agent.win_rate = agent.successful_executions as f64 / completed as f64;
    agent.reputation_score = compute_score(&score_inputs(&agent)?).score;
    agent.updated_at_ns = now;

    account.cumulative_profit_wei = signed_wei_add(
        &account.cumulative_profit_wei,
        profit_negative,
        profit_magnitude,
        "user cumulativeProfit",
    )?;
    account.last_activity_at_ns = now;

    let mut stats = stable::global_stats();
    if success {
        stats.successful_executions += 1;
    } else {
        stats.failed_executions += 1;
    }
    stats.total_profit_wei = signed_wei_add(
        &stats.total_profit_wei,
        profit_negative,
        profit_magnitude,
        "global profit",
    )?;
    stats.updated_at_ns = now;

    // Rollup day is the completion day; an execution spanning midnight counts
    // where its outcome landed.
    let day_index = now / NANOS_PER_DAY;
    let mut daily =
        stable::get_daily_stats(&execution.agent_id, day_index).unwrap_or(DailyAgentStats {
            agent_id: execution.agent_id.clone(),
            day_index,
            executions: 0,
            successes: 0,
            failures: 0,
            volume_wei: "0".to_string(),
            profit_wei: "0".to_string(),
            win_rate: 0.0,
        });
    daily.executions += 1;
    if success {
        daily.successes += 1;
    } else {
        daily.failures += 1;
    }
    daily.volume_wei = wei_add(&daily.volume_wei, amount_in, "daily volume")?;
    daily.profit_wei = signed_wei_add(
        &daily.profit_wei,
        profit_negative,
        profit_magnitude,
        "daily profit",
    )?;
    daily.win_rate = daily.successes as f64 / daily.executions as f64;

    stable::upsert_execution(&execution);
    stable::upsert_agent(&agent);
    stable::upsert_user_account(&account);
    stable::save_global_stats(&stats);
    stable::upsert_daily_stats(&daily);
    Ok(ApplyOutcome::Applied)
}

/// Entity id for a redelegation row: the parent, child, and creation-time
/// composite. A replayed observation derives the same id and overwrites its
/// own row instead of minting a fresh one.
pub fn redelegation_entity_id(
    parent_agent_id: &str,
    child_agent_id: &str,
    created_at_ns: u64,
) -> String {
    format!("{parent_agent_id}:{child_agent_id}:{created_at_ns}")
}

fn apply_redelegation_created(
    observed: &ObservedEvent,
    delegation_hash: &str,
    parent_agent_id: &str,
    child_agent_id: &str,
    user_address: &str,
    amount_wei: &str,
    expires_at_ns: u64,
) -> ApplyOutcome {
    let now = observed.observed_at_ns;
    stable::upsert_redelegation(&Redelegation {
        id: redelegation_entity_id(parent_agent_id, child_agent_id, now),
        parent_agent_id: parent_agent_id.to_string(),
        child_agent_id: child_agent_id.to_string(),
        user_address: user_address.to_string(),
        amount_wei: amount_wei.to_string(),
        created_at_ns: now,
        expires_at_ns,
        active: expires_at_ns > now,
        delegation_hash: delegation_hash.to_string(),
        tx_hash: observed.tx_hash.clone(),
    });

    let mut stats = stable::global_stats();
    stats.total_redelegations += 1;
    stats.updated_at_ns = now;
    stable::save_global_stats(&stats);

    log!(
        LedgerLogPriority::Info,
        "redelegation_observed hash={delegation_hash} parent={parent_agent_id} child={child_agent_id} amount_wei={amount_wei}"
    );
    ApplyOutcome::Applied
}
