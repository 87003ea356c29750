//! Wei amount handling.
//!
//! Monetary values are persisted as decimal strings, unsigned for volumes
//! and balances and sign-prefixed for profit/loss, and converted to `U256`
//! magnitudes (plus an explicit sign) for arithmetic.  Reputation math is the
//! only consumer that degrades to `f64`.

use alloy_primitives::U256;
use std::str::FromStr;

pub const BPS_DENOMINATOR: u64 = 10_000;

pub fn parse_wei(raw: &str, field: &str) -> Result<U256, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} cannot be empty"));
    }
    if !trimmed.as_bytes().iter().all(|byte| byte.is_ascii_digit()) {
        return Err(format!("{field} must be a decimal string"));
    }
    U256::from_str(trimmed).map_err(|error| format!("failed to parse {field} as decimal: {error}"))
}

pub fn format_wei(value: U256) -> String {
    value.to_string()
}

/// Parse a sign-prefixed decimal wei string into (negative, magnitude).
pub fn parse_signed_wei(raw: &str, field: &str) -> Result<(bool, U256), String> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('-') {
        let magnitude = parse_wei(rest, field)?;
        Ok((!magnitude.is_zero(), magnitude))
    } else {
        Ok((false, parse_wei(trimmed, field)?))
    }
}

pub fn format_signed_wei(negative: bool, magnitude: U256) -> String {
    if negative && !magnitude.is_zero() {
        format!("-{magnitude}")
    } else {
        magnitude.to_string()
    }
}

/// Accumulate a signed delta onto a signed decimal string.
pub fn signed_wei_add(
    current: &str,
    delta_negative: bool,
    delta: U256,
    field: &str,
) -> Result<String, String> {
    let (current_negative, current_magnitude) = parse_signed_wei(current, field)?;
    let (negative, magnitude) = if current_negative == delta_negative {
        (
            current_negative,
            current_magnitude.saturating_add(delta),
        )
    } else if current_magnitude >= delta {
        (current_negative, current_magnitude - delta)
    } else {
        (delta_negative, delta - current_magnitude)
    };
    Ok(format_signed_wei(negative, magnitude))
}

/// Accumulate an unsigned delta onto an unsigned decimal string.
pub fn wei_add(current: &str, delta: U256, field: &str) -> Result<String, String> {
    let value = parse_wei(current, field)?;
    Ok(value.saturating_add(delta).to_string())
}

pub fn wei_to_f64(raw: &str, field: &str) -> Result<f64, String> {
    let value = parse_wei(raw, field)?;
    value
        .to_string()
        .parse::<f64>()
        .map_err(|error| format!("failed to convert {field} to f64: {error}"))
}

pub fn signed_wei_to_f64(raw: &str, field: &str) -> Result<f64, String> {
    let (negative, magnitude) = parse_signed_wei(raw, field)?;
    let value = magnitude
        .to_string()
        .parse::<f64>()
        .map_err(|error| format!("failed to convert {field} to f64: {error}"))?;
    Ok(if negative { -value } else { value })
}

/// `amount × bps / 10_000`, floored.
pub fn mul_bps(amount: U256, bps: u32) -> U256 {
    let bps = U256::from(bps);
    let denominator = U256::from(BPS_DENOMINATOR);
    match amount.checked_mul(bps) {
        Some(product) => product / denominator,
        // Inputs near U256::MAX lose sub-denominator precision here.
        None => (amount / denominator).saturating_mul(bps),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_unsigned_wei() {
        let value = parse_wei("10000000000000000000", "amount").expect("should parse");
        assert_eq!(value, U256::from(10_000_000_000_000_000_000u64));
        assert_eq!(format_wei(value), "10000000000000000000");
    }

    #[test]
    fn rejects_non_decimal_input() {
        assert!(parse_wei("0x10", "amount").is_err());
        assert!(parse_wei("", "amount").is_err());
        assert!(parse_wei("12.5", "amount").is_err());
    }

    #[test]
    fn signed_parsing_normalizes_negative_zero() {
        let (negative, magnitude) = parse_signed_wei("-0", "pnl").expect("should parse");
        assert!(!negative);
        assert!(magnitude.is_zero());
        assert_eq!(format_signed_wei(true, U256::ZERO), "0");
    }

    #[test]
    fn signed_add_crosses_zero_correctly() {
        let sum = signed_wei_add("100", true, U256::from(150u64), "pnl").expect("should add");
        assert_eq!(sum, "-50");
        let sum = signed_wei_add("-100", false, U256::from(150u64), "pnl").expect("should add");
        assert_eq!(sum, "50");
        let sum = signed_wei_add("-100", true, U256::from(50u64), "pnl").expect("should add");
        assert_eq!(sum, "-150");
    }

    #[test]
    fn signed_conversion_to_f64_keeps_sign() {
        let value = signed_wei_to_f64("-500000000000000000", "pnl").expect("should convert");
        assert_eq!(value, -5e17);
    }

    #[test]
    fn mul_bps_floors_toward_zero() {
        assert_eq!(mul_bps(U256::from(1000u64), 3500), U256::from(350u64));
        assert_eq!(mul_bps(U256::from(999u64), 3333), U256::from(332u64));
        assert_eq!(mul_bps(U256::from(10u64), 0), U256::ZERO);
    }
}
