//! Centralised timing constants for the scheduler, pipeline jobs, and related
//! subsystems.
//!
//! Most values are derived from a small set of **base constants** so that the
//! entire cadence can be scaled coherently, e.g. for unit tests or to adapt
//! throughput to the current cycles balance.
//!
//! # Base constants
//!
//! | Constant                    | Production | Test   |
//! |-----------------------------|-----------|--------|
//! | `BASE_TICK_SECS`            | 30 s      | 2 s    |
//! | `TICKS_PER_STRATEGY_CYCLE`  | 10        | 3      |
//! | `PIPELINE_JOB_BUDGET_SECS`  | 90 s      | 6 s    |

// ── Base constants ──────────────────────────────────────────────────────────

/// Scheduler heartbeat, the "clock resolution" of the system.
/// Every `BASE_TICK_SECS` the scheduler wakes, recovers stale leases,
/// refreshes due jobs, and dispatches up to the per-tick mutating budget.
#[cfg(not(test))]
pub const BASE_TICK_SECS: u64 = 30;
#[cfg(test)]
pub const BASE_TICK_SECS: u64 = 2;

/// How many ticks between consecutive strategy cycles per agent.
/// `STRATEGY_CYCLE_INTERVAL_SECS = BASE_TICK_SECS × TICKS_PER_STRATEGY_CYCLE`.
#[cfg(not(test))]
pub const TICKS_PER_STRATEGY_CYCLE: u64 = 10;
#[cfg(test)]
pub const TICKS_PER_STRATEGY_CYCLE: u64 = 3;

/// Hard wall-clock cap for one pipeline job (fan-out pass, strategy cycle,
/// oracle batch push); these jobs chain several RPC outcalls.
#[cfg(not(test))]
pub const PIPELINE_JOB_BUDGET_SECS: u64 = 90;
#[cfg(test)]
pub const PIPELINE_JOB_BUDGET_SECS: u64 = 6;

// ── Scheduler cadence ───────────────────────────────────────────────────────

/// Interval at which the IC canister timer fires `scheduler_tick`.
pub const SCHEDULER_TICK_INTERVAL_SECS: u64 = BASE_TICK_SECS;

/// Ledger poll recurrence: every tick unless the empty-poll backoff is in
/// effect.
pub const LEDGER_POLL_INTERVAL_SECS: u64 = BASE_TICK_SECS;

/// Dispatcher recurrence: grant intake plus one serialized drain of the
/// allocation queue.  Doubles as the store-poll fallback for grants that
/// arrived without a push notification.
pub const DISPATCH_INTERVAL_SECS: u64 = BASE_TICK_SECS;

/// Per-agent strategy cycle recurrence.
pub const STRATEGY_CYCLE_INTERVAL_SECS: u64 = BASE_TICK_SECS * TICKS_PER_STRATEGY_CYCLE;

/// Oracle score mirroring recurrence (hourly in production).
pub const ORACLE_SYNC_INTERVAL_SECS: u64 = BASE_TICK_SECS * 120;

/// Expiry sweep recurrence: moves past-due `pending` records to `expired`.
pub const DELEGATION_SWEEP_INTERVAL_SECS: u64 = BASE_TICK_SECS * 20;

/// Cycle balance check recurrence.
pub const CYCLE_CHECK_INTERVAL_SECS: u64 = BASE_TICK_SECS * 10;

// ── Lease TTLs ──────────────────────────────────────────────────────────────

/// Lease TTL for pipeline jobs. Must comfortably exceed
/// `PIPELINE_JOB_BUDGET_SECS` to allow for receipt-confirmation polling.
/// Ratio: ~2.67× the job budget.
pub const PIPELINE_LEASE_TTL_SECS: u64 = PIPELINE_JOB_BUDGET_SECS * 8 / 3;
pub const PIPELINE_LEASE_TTL_NS: u64 = PIPELINE_LEASE_TTL_SECS * NANOS_PER_SEC;

/// Lease TTL for lightweight jobs (ledger poll, sweep, cycle check).
/// Two ticks gives one full retry window before the lease expires.
pub const LIGHTWEIGHT_LEASE_TTL_SECS: u64 = BASE_TICK_SECS * 2;
pub const LIGHTWEIGHT_LEASE_TTL_NS: u64 = LIGHTWEIGHT_LEASE_TTL_SECS * NANOS_PER_SEC;

// ── Fan-out pacing ──────────────────────────────────────────────────────────

/// Fixed spacing between consecutive redelegation-logging calls, stamped on
/// the next allocation item after each completes.  Respects upstream RPC
/// rate limits and keeps one outstanding transaction per wallet role.
#[cfg(not(test))]
pub const FANOUT_CALL_SPACING_SECS: u64 = 2;
#[cfg(test)]
pub const FANOUT_CALL_SPACING_SECS: u64 = 1;

/// Extended cooldown applied to an allocation item after a rate-limit
/// failure; the item retries exactly once after this window.
#[cfg(not(test))]
pub const RATE_LIMIT_COOLDOWN_SECS: u64 = 60;
#[cfg(test)]
pub const RATE_LIMIT_COOLDOWN_SECS: u64 = 4;

/// Attempt cap per allocation item: the initial call plus one
/// post-cooldown retry.
pub const MAX_FANOUT_ATTEMPTS: u32 = 2;

// ── Anomaly windows ─────────────────────────────────────────────────────────

/// An execution still PENDING after this window is reported by the stale
/// scan; its completion event was never observed.
pub const STALE_PENDING_EXECUTION_SECS: u64 = BASE_TICK_SECS * 120;
pub const STALE_PENDING_EXECUTION_NS: u64 = STALE_PENDING_EXECUTION_SECS * NANOS_PER_SEC;

// ── Backoff schedule ────────────────────────────────────────────────────────

/// Progressive backoff for empty ledger polls: 2×, 4×, 8×, 20× the base tick.
pub const EMPTY_POLL_BACKOFF_SCHEDULE_SECS: &[u64] = &[
    BASE_TICK_SECS * 2,
    BASE_TICK_SECS * 4,
    BASE_TICK_SECS * 8,
    BASE_TICK_SECS * 20,
];

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Host-safe nanosecond time source.
///
/// - `wasm32`: IC replicated time via `ic_cdk::api::time()`
/// - non-`wasm32`: wall clock fallback for native/unit tests
pub fn current_time_ns() -> u64 {
    #[cfg(target_arch = "wasm32")]
    return ic_cdk::api::time();

    #[cfg(all(not(target_arch = "wasm32"), test))]
    if let Some(override_ns) = TEST_TIME_OVERRIDE_NS.with(|slot| slot.get()) {
        return override_ns;
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_nanos().try_into().unwrap_or(u64::MAX))
            .unwrap_or_default()
    }
}

#[cfg(all(not(target_arch = "wasm32"), test))]
thread_local! {
    static TEST_TIME_OVERRIDE_NS: std::cell::Cell<Option<u64>> = const { std::cell::Cell::new(None) };
}

#[cfg(all(not(target_arch = "wasm32"), test))]
pub fn set_test_time_ns(now_ns: u64) {
    TEST_TIME_OVERRIDE_NS.with(|slot| slot.set(Some(now_ns)));
}

#[cfg(all(not(target_arch = "wasm32"), test))]
pub fn clear_test_time_ns() {
    TEST_TIME_OVERRIDE_NS.with(|slot| slot.set(None));
}

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

// ── Compile-time sanity checks ──────────────────────────────────────────────

// Lease must exceed the pipeline job budget.
const _: () = assert!(PIPELINE_LEASE_TTL_SECS > PIPELINE_JOB_BUDGET_SECS);
// Strategy interval must be a multiple of the tick.
const _: () = assert!(STRATEGY_CYCLE_INTERVAL_SECS.is_multiple_of(BASE_TICK_SECS));
// Backoff schedule entries must each be ≥ one tick.
const _: () = assert!(EMPTY_POLL_BACKOFF_SCHEDULE_SECS[0] >= BASE_TICK_SECS);
// The cooldown must exceed the regular call spacing, or the retry would not
// actually wait any longer than a normal call.
const _: () = assert!(RATE_LIMIT_COOLDOWN_SECS > FANOUT_CALL_SPACING_SECS);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_relationships_hold_under_any_profile() {
        assert_eq!(SCHEDULER_TICK_INTERVAL_SECS, BASE_TICK_SECS);
        assert_eq!(
            STRATEGY_CYCLE_INTERVAL_SECS,
            BASE_TICK_SECS * TICKS_PER_STRATEGY_CYCLE
        );
        assert_eq!(DELEGATION_SWEEP_INTERVAL_SECS, BASE_TICK_SECS * 20);
        assert_eq!(
            STALE_PENDING_EXECUTION_NS,
            STALE_PENDING_EXECUTION_SECS * NANOS_PER_SEC
        );
        assert_eq!(PIPELINE_LEASE_TTL_NS, PIPELINE_LEASE_TTL_SECS * NANOS_PER_SEC);
    }

    #[test]
    fn test_profile_is_fast() {
        assert_eq!(BASE_TICK_SECS, 2);
        assert_eq!(TICKS_PER_STRATEGY_CYCLE, 3);
        assert_eq!(STRATEGY_CYCLE_INTERVAL_SECS, 6);
        assert_eq!(FANOUT_CALL_SPACING_SECS, 1);
        assert_eq!(RATE_LIMIT_COOLDOWN_SECS, 4);
    }

    #[test]
    fn backoff_schedule_is_monotonically_increasing() {
        for window in EMPTY_POLL_BACKOFF_SCHEDULE_SECS.windows(2) {
            assert!(window[1] > window[0]);
        }
    }

    #[test]
    fn fanout_retry_cap_allows_exactly_one_retry() {
        assert_eq!(MAX_FANOUT_ATTEMPTS, 2);
    }
}
