use crate::domain::types::{
    OperationFailure, OperationFailureKind, OutcallFailure, OutcallFailureKind, RecoveryContext,
    RecoveryDecision, RecoveryDecisionReason, RecoveryFailure, RecoveryPolicyAction,
    ResponseLimitAdjustment, ResponseLimitPolicy,
};

/// Map a raw chain-layer error string to a structured `RecoveryFailure`.
///
/// Scheduler task handlers feed job errors through this before deciding
/// whether to retry, back off, or fail the task permanently.
pub fn classify_chain_failure(error: &str) -> RecoveryFailure {
    let normalized = error.to_ascii_lowercase();
    if is_insufficient_cycles_error(&normalized) {
        return RecoveryFailure::Operation(OperationFailure {
            kind: OperationFailureKind::InsufficientCycles,
        });
    }
    if normalized.contains("blocked by survival") {
        return RecoveryFailure::Operation(OperationFailure {
            kind: OperationFailureKind::BlockedBySurvivalPolicy,
        });
    }
    if normalized.contains("is not configured") {
        return RecoveryFailure::Operation(OperationFailure {
            kind: OperationFailureKind::MissingConfiguration,
        });
    }
    if normalized.contains("cannot be empty")
        || normalized.contains("must be > 0")
        || normalized.contains("is not a valid")
        || normalized.contains("must sum to")
    {
        return RecoveryFailure::Operation(OperationFailure {
            kind: OperationFailureKind::InvalidConfiguration,
        });
    }
    if normalized.contains("unauthorized")
        || normalized.contains("forbidden")
        || normalized.contains("not authorized")
    {
        return RecoveryFailure::Operation(OperationFailure {
            kind: OperationFailureKind::Unauthorized,
        });
    }
    if normalized.contains("malformed") {
        return RecoveryFailure::Operation(OperationFailure {
            kind: OperationFailureKind::Deterministic,
        });
    }
    RecoveryFailure::Outcall(OutcallFailure {
        kind: classify_chain_outcall_failure_kind(&normalized),
        retry_after_secs: None,
        observed_response_bytes: None,
    })
}

fn is_insufficient_cycles_error(normalized: &str) -> bool {
    normalized.contains("insufficient cycles")
        || normalized.contains("out of cycles")
        || normalized.contains("cycles depleted")
}

fn classify_chain_outcall_failure_kind(normalized_error: &str) -> OutcallFailureKind {
    if normalized_error.contains("http body exceeds size limit")
        || normalized_error.contains("response exceeded max_response_bytes")
        || (normalized_error.contains("max_response_bytes") && normalized_error.contains("exceed"))
    {
        return OutcallFailureKind::ResponseTooLarge;
    }
    if normalized_error.contains("status 429")
        || normalized_error.contains("http 429")
        || normalized_error.contains("rate limit")
        || normalized_error.contains("too many requests")
        || normalized_error.contains("-32005")
    {
        return OutcallFailureKind::RateLimited;
    }
    if normalized_error.contains("timeout")
        || normalized_error.contains("timed out")
        || normalized_error.contains("deadline exceeded")
    {
        return OutcallFailureKind::Timeout;
    }
    if normalized_error.contains("status 503")
        || normalized_error.contains("status 502")
        || normalized_error.contains("status 504")
        || normalized_error.contains("http 503")
        || normalized_error.contains("http 502")
        || normalized_error.contains("http 504")
        || normalized_error.contains("service unavailable")
    {
        return OutcallFailureKind::UpstreamUnavailable;
    }
    if normalized_error.contains("status 401")
        || normalized_error.contains("status 403")
        || normalized_error.contains("http 401")
        || normalized_error.contains("http 403")
        || normalized_error.contains("rejected by policy")
    {
        return OutcallFailureKind::RejectedByPolicy;
    }
    if normalized_error.contains("status 400")
        || normalized_error.contains("status 404")
        || normalized_error.contains("status 422")
        || normalized_error.contains("http 400")
        || normalized_error.contains("http 404")
        || normalized_error.contains("http 422")
    {
        return OutcallFailureKind::InvalidRequest;
    }
    if normalized_error.contains("failed to parse")
        || normalized_error.contains("was not valid utf-8")
        || normalized_error.contains("json-rpc error")
        || normalized_error.contains("missing result field")
    {
        return OutcallFailureKind::InvalidResponse;
    }
    if normalized_error.contains("outcall failed")
        || normalized_error.contains("transport")
        || normalized_error.contains("connection refused")
        || normalized_error.contains("connection reset")
        || normalized_error.contains("network is unreachable")
    {
        return OutcallFailureKind::Transport;
    }
    OutcallFailureKind::Unknown
}

/// Decide what the scheduler should do about one classified failure.
///
/// Transient transport problems get one free immediate retry before the
/// exponential backoff ladder starts; rate limits and unknown failures go
/// straight to backoff; oversized responses grow the response limit until it
/// is maxed; configuration, authorization, and deterministic failures cannot
/// heal on their own and escalate to a task fault.
pub fn decide_recovery_action(
    failure: &RecoveryFailure,
    context: &RecoveryContext,
) -> RecoveryDecision {
    match failure {
        RecoveryFailure::Outcall(outcall) => decide_outcall(outcall, context),
        RecoveryFailure::Operation(operation) => decide_operation(operation, context),
    }
}

fn decide_outcall(outcall: &OutcallFailure, context: &RecoveryContext) -> RecoveryDecision {
    use OutcallFailureKind as K;
    match outcall.kind {
        K::ResponseTooLarge => {
            match context.response_limit.as_ref().and_then(grown_response_limit) {
                Some(adjustment) => RecoveryDecision {
                    action: RecoveryPolicyAction::TuneResponseLimit,
                    reason: RecoveryDecisionReason::ResponseTooLarge,
                    backoff_secs: None,
                    response_limit_adjustment: Some(adjustment),
                },
                None => backoff(
                    context,
                    outcall.retry_after_secs,
                    RecoveryDecisionReason::ResponseLimitAlreadyMaxed,
                ),
            }
        }
        K::Timeout | K::Transport | K::UpstreamUnavailable if context.consecutive_failures == 0 => {
            immediate_retry(RecoveryDecisionReason::TransientOutcallFailure)
        }
        K::Timeout | K::Transport | K::UpstreamUnavailable => backoff(
            context,
            outcall.retry_after_secs,
            RecoveryDecisionReason::TransientOutcallFailure,
        ),
        K::RateLimited => backoff(
            context,
            outcall.retry_after_secs,
            RecoveryDecisionReason::OutcallRateLimited,
        ),
        K::InvalidRequest | K::RejectedByPolicy => {
            escalate(RecoveryDecisionReason::NonRetriableOutcallFailure)
        }
        K::InvalidResponse | K::Unknown => backoff(
            context,
            outcall.retry_after_secs,
            RecoveryDecisionReason::UnknownFailure,
        ),
    }
}

fn decide_operation(operation: &OperationFailure, context: &RecoveryContext) -> RecoveryDecision {
    use OperationFailureKind as K;
    match operation.kind {
        K::BlockedBySurvivalPolicy => skip(RecoveryDecisionReason::SurvivalPolicyBlocked),
        K::InsufficientCycles => skip(RecoveryDecisionReason::InsufficientCycles),
        K::Unknown => backoff(context, None, RecoveryDecisionReason::UnknownFailure),
        K::MissingConfiguration | K::InvalidConfiguration | K::Unauthorized | K::Deterministic => {
            escalate(RecoveryDecisionReason::NonRetriableOperationFailure)
        }
    }
}

fn immediate_retry(reason: RecoveryDecisionReason) -> RecoveryDecision {
    RecoveryDecision {
        action: RecoveryPolicyAction::RetryImmediate,
        reason,
        backoff_secs: None,
        response_limit_adjustment: None,
    }
}

fn skip(reason: RecoveryDecisionReason) -> RecoveryDecision {
    RecoveryDecision {
        action: RecoveryPolicyAction::Skip,
        reason,
        backoff_secs: None,
        response_limit_adjustment: None,
    }
}

fn escalate(reason: RecoveryDecisionReason) -> RecoveryDecision {
    RecoveryDecision {
        action: RecoveryPolicyAction::EscalateFault,
        reason,
        backoff_secs: None,
        response_limit_adjustment: None,
    }
}

// A server-provided retry-after wins over the computed ladder; both are
// clamped into [1, backoff_max_secs].
fn backoff(
    context: &RecoveryContext,
    retry_after_secs: Option<u64>,
    reason: RecoveryDecisionReason,
) -> RecoveryDecision {
    let ceiling = context.backoff_max_secs.max(1);
    let delay = retry_after_secs
        .unwrap_or_else(|| {
            doubling_backoff_secs(context.backoff_base_secs, ceiling, context.consecutive_failures)
        })
        .clamp(1, ceiling);
    RecoveryDecision {
        action: RecoveryPolicyAction::Backoff,
        reason,
        backoff_secs: Some(delay),
        response_limit_adjustment: None,
    }
}

fn doubling_backoff_secs(base_secs: u64, ceiling_secs: u64, consecutive_failures: u32) -> u64 {
    let ceiling = ceiling_secs.max(1);
    let mut delay = base_secs.clamp(1, ceiling);
    for _ in 0..consecutive_failures.min(20) {
        if delay >= ceiling {
            break;
        }
        delay = delay.saturating_mul(2).min(ceiling);
    }
    delay
}

fn grown_response_limit(policy: &ResponseLimitPolicy) -> Option<ResponseLimitAdjustment> {
    let floor = policy.min_bytes.max(1);
    let ceiling = policy.max_bytes.max(floor);
    let from_bytes = policy.current_bytes.clamp(floor, ceiling);
    let to_bytes = from_bytes
        .saturating_mul(policy.tune_multiplier.max(2))
        .clamp(floor, ceiling);
    if to_bytes > from_bytes {
        Some(ResponseLimitAdjustment {
            from_bytes,
            to_bytes,
        })
    } else {
        None
    }
}
