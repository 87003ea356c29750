//! Canonical reputation scoring.
//!
//! One 5-factor formula feeds every consumer: stored agent scores, query
//! views, and the on-chain oracle push all read the same number.  The
//! weighting is 35% win rate, 25% profitability, 15% volume, 15% experience,
//! 10% efficiency, clamped to [0,100] and rounded to an integer.

/// Agents with fewer executions than this report the neutral default
/// instead of a computed score.
pub const MIN_SCORED_EXECUTIONS: u64 = 5;

pub const NEUTRAL_SCORE: u8 = 50;

/// Volume-score interpolation window, in wei: below the floor scores 0,
/// above the ceiling scores 100, log10-interpolated in between.
pub const VOLUME_FLOOR_WEI: f64 = 1e18;
pub const VOLUME_CEILING_WEI: f64 = 1e24;

/// Efficiency pivot: average profit per trade is scaled against 0.1 token
/// (1e17 wei) around the neutral midpoint.
const EFFICIENCY_PIVOT_WEI: f64 = 1e17;

#[derive(Clone, Debug, PartialEq)]
pub struct ScoreInputs {
    pub win_rate: f64,
    pub total_volume_wei: f64,
    pub profit_loss_wei: f64,
    pub execution_count: u64,
    pub avg_profit_per_trade_wei: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub win_rate_score: f64,
    pub profitability_score: f64,
    pub volume_score: f64,
    pub experience_score: f64,
    pub efficiency_score: f64,
    pub score: u8,
}

fn clamp_component(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

fn win_rate_score(win_rate: f64) -> f64 {
    let raw = if win_rate < 0.3 {
        win_rate * 100.0
    } else if win_rate < 0.5 {
        30.0 + (win_rate - 0.3) * 100.0
    } else if win_rate < 0.7 {
        50.0 + (win_rate - 0.5) * 150.0
    } else {
        80.0 + (win_rate - 0.7) * 66.67
    };
    clamp_component(raw)
}

fn profitability_score(profit_loss_wei: f64, total_volume_wei: f64) -> f64 {
    if total_volume_wei == 0.0 {
        return 50.0;
    }
    let roi = profit_loss_wei / total_volume_wei * 100.0;
    clamp_component(50.0 + roi * 5.0)
}

fn volume_score(total_volume_wei: f64) -> f64 {
    if total_volume_wei < VOLUME_FLOOR_WEI {
        return 0.0;
    }
    if total_volume_wei >= VOLUME_CEILING_WEI {
        return 100.0;
    }
    let position = (total_volume_wei.log10() - VOLUME_FLOOR_WEI.log10())
        / (VOLUME_CEILING_WEI.log10() - VOLUME_FLOOR_WEI.log10());
    clamp_component(position * 100.0)
}

fn experience_score(execution_count: u64) -> f64 {
    clamp_component((execution_count as f64 / 100.0).sqrt() * 100.0)
}

fn efficiency_score(avg_profit_per_trade_wei: f64) -> f64 {
    clamp_component(50.0 + (avg_profit_per_trade_wei / EFFICIENCY_PIVOT_WEI) * 1000.0)
}

pub fn compute_score(inputs: &ScoreInputs) -> ScoreBreakdown {
    if inputs.execution_count < MIN_SCORED_EXECUTIONS {
        return ScoreBreakdown {
            win_rate_score: f64::from(NEUTRAL_SCORE),
            profitability_score: f64::from(NEUTRAL_SCORE),
            volume_score: f64::from(NEUTRAL_SCORE),
            experience_score: f64::from(NEUTRAL_SCORE),
            efficiency_score: f64::from(NEUTRAL_SCORE),
            score: NEUTRAL_SCORE,
        };
    }

    let win_rate_score = win_rate_score(inputs.win_rate);
    let profitability_score =
        profitability_score(inputs.profit_loss_wei, inputs.total_volume_wei);
    let volume_score = volume_score(inputs.total_volume_wei);
    let experience_score = experience_score(inputs.execution_count);
    let efficiency_score = efficiency_score(inputs.avg_profit_per_trade_wei);

    let weighted = 0.35 * win_rate_score
        + 0.25 * profitability_score
        + 0.15 * volume_score
        + 0.15 * experience_score
        + 0.10 * efficiency_score;
    let score = weighted.clamp(0.0, 100.0).round() as u8;

    ScoreBreakdown {
        win_rate_score,
        profitability_score,
        volume_score,
        experience_score,
        efficiency_score,
        score,
    }
}
