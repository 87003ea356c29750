//! Swap venue port.
//!
//! Trades against the venue are exact-input swaps with a slippage-bounded
//! minimum output. The venue itself is opaque to the rest of the pipeline;
//! deployments without one run the stub, which fails the trade step and lets
//! the execution protocol record the failure instead of leaving the
//! execution dangling.

use crate::domain::amount::{format_wei, mul_bps, parse_wei};
use async_trait::async_trait;
use std::cell::{Cell, RefCell};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapOutcome {
    pub amount_out_wei: String,
    pub tx_hash: String,
}

#[async_trait(?Send)]
pub trait SwapVenue {
    /// Expected output of an exact-input swap at current prices.
    async fn quote(
        &self,
        token_in: &str,
        token_out: &str,
        amount_in_wei: &str,
    ) -> Result<String, String>;

    /// Execute an exact-input swap, failing if the realized output would
    /// fall below `min_amount_out_wei`.
    async fn execute_swap(
        &self,
        token_in: &str,
        token_out: &str,
        amount_in_wei: &str,
        min_amount_out_wei: &str,
    ) -> Result<SwapOutcome, String>;
}

pub struct StubSwapVenue;

#[async_trait(?Send)]
impl SwapVenue for StubSwapVenue {
    async fn quote(
        &self,
        _token_in: &str,
        _token_out: &str,
        _amount_in_wei: &str,
    ) -> Result<String, String> {
        Err("swap venue is not configured for this deployment".to_string())
    }

    async fn execute_swap(
        &self,
        _token_in: &str,
        _token_out: &str,
        _amount_in_wei: &str,
        _min_amount_out_wei: &str,
    ) -> Result<SwapOutcome, String> {
        Err("swap venue is not configured for this deployment".to_string())
    }
}

/// Deterministic venue for executor tests: quotes apply a fixed rate in
/// basis points, and executed swaps honor the minimum-output bound.
/// `fail_next_with` fails the next call of either kind; `fail_swap_with`
/// fails only the swap step, letting the preceding quote succeed.
#[allow(dead_code)]
pub struct MockSwapVenue {
    pub rate_bps: Cell<u32>,
    pub swaps: RefCell<Vec<String>>,
    pub fail_next_with: RefCell<Option<String>>,
    pub fail_swap_with: RefCell<Option<String>>,
}

#[allow(dead_code)]
impl MockSwapVenue {
    pub fn with_rate_bps(rate_bps: u32) -> Self {
        Self {
            rate_bps: Cell::new(rate_bps),
            swaps: RefCell::new(Vec::new()),
            fail_next_with: RefCell::new(None),
            fail_swap_with: RefCell::new(None),
        }
    }

    fn apply_rate(&self, amount_in_wei: &str) -> Result<String, String> {
        let amount = parse_wei(amount_in_wei, "amount_in_wei")?;
        Ok(format_wei(mul_bps(amount, self.rate_bps.get())))
    }
}

#[async_trait(?Send)]
impl SwapVenue for MockSwapVenue {
    async fn quote(
        &self,
        _token_in: &str,
        _token_out: &str,
        amount_in_wei: &str,
    ) -> Result<String, String> {
        if let Some(error) = self.fail_next_with.borrow_mut().take() {
            return Err(error);
        }
        self.apply_rate(amount_in_wei)
    }

    async fn execute_swap(
        &self,
        token_in: &str,
        token_out: &str,
        amount_in_wei: &str,
        min_amount_out_wei: &str,
    ) -> Result<SwapOutcome, String> {
        if let Some(error) = self.fail_next_with.borrow_mut().take() {
            return Err(error);
        }
        if let Some(error) = self.fail_swap_with.borrow_mut().take() {
            return Err(error);
        }
        let amount_out_wei = self.apply_rate(amount_in_wei)?;
        let realized = parse_wei(&amount_out_wei, "amount_out_wei")?;
        let minimum = parse_wei(min_amount_out_wei, "min_amount_out_wei")?;
        if realized < minimum {
            return Err(format!(
                "swap output below minimum: {amount_out_wei} < {min_amount_out_wei}"
            ));
        }
        let mut swaps = self.swaps.borrow_mut();
        swaps.push(format!(
            "{token_in}->{token_out} in={amount_in_wei} out={amount_out_wei}"
        ));
        Ok(SwapOutcome {
            amount_out_wei,
            tx_hash: format!("0x{:064x}", 0x5a_0000u64 + swaps.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::block_on_with_spin;

    #[test]
    fn stub_venue_rejects_trades() {
        let venue = StubSwapVenue;
        let error = block_on_with_spin(venue.quote("0xa", "0xb", "1000"))
            .expect_err("stub venue should not quote");
        assert!(error.contains("not configured"), "got: {error}");
    }

    #[test]
    fn mock_venue_applies_its_rate_to_quotes() {
        let venue = MockSwapVenue::with_rate_bps(10_200);
        let quoted = block_on_with_spin(venue.quote("0xa", "0xb", "10000"))
            .expect("quote should succeed");
        assert_eq!(quoted, "10200");
    }

    #[test]
    fn mock_venue_enforces_the_minimum_output() {
        let venue = MockSwapVenue::with_rate_bps(9_800);

        let error = block_on_with_spin(venue.execute_swap("0xa", "0xb", "10000", "9900"))
            .expect_err("output under the minimum should fail");
        assert!(error.contains("below minimum"), "got: {error}");
        assert!(venue.swaps.borrow().is_empty());

        let outcome = block_on_with_spin(venue.execute_swap("0xa", "0xb", "10000", "9700"))
            .expect("output above the minimum should succeed");
        assert_eq!(outcome.amount_out_wei, "9800");
        assert_eq!(venue.swaps.borrow().len(), 1);
    }
}
