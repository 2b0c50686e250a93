//! Fee estimation
//!
//! All rates use basis points: 10000 = 100%. Every network fee component is
//! multiplied by `1 + buffer_bps / 10000` to absorb quote-to-execution
//! slippage. The platform fee is exact and never buffered.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Basis-point precision (10^4)
pub const BPS_PRECISION: u32 = 10_000;

/// Fee policy numbers. These are configuration, not algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Safety buffer on every network fee (1000 = 10%)
    pub buffer_bps: u32,
    /// Conversion fee rate on converted volume
    pub conversion_fee_bps: u32,
    pub bridge_fee_per_transfer: Decimal,
    pub min_bridge_fee: Decimal,
    /// Gas-equivalent cost of settling on the destination ledger
    pub destination_gas: Decimal,
    /// Platform settlement fee taken from the gross amount
    #[serde(default)]
    pub platform_fee_bps: u32,
    /// Shortfalls at or below this are treated as rounding noise
    pub rounding_tolerance: Decimal,
    /// Decimals of the settlement asset
    #[serde(default = "default_settlement_decimals")]
    pub settlement_decimals: u32,
}

fn default_settlement_decimals() -> u32 {
    6
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            buffer_bps: 1000,
            conversion_fee_bps: 30,
            bridge_fee_per_transfer: Decimal::new(10, 2),
            min_bridge_fee: Decimal::new(5, 2),
            destination_gas: Decimal::new(2, 2),
            platform_fee_bps: 0,
            rounding_tolerance: Decimal::new(1, 6),
            settlement_decimals: default_settlement_decimals(),
        }
    }
}

impl FeePolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.platform_fee_bps >= BPS_PRECISION {
            return Err(format!(
                "platform_fee_bps must be below {}, got {}",
                BPS_PRECISION, self.platform_fee_bps
            ));
        }
        if self.bridge_fee_per_transfer.is_sign_negative()
            || self.min_bridge_fee.is_sign_negative()
            || self.destination_gas.is_sign_negative()
            || self.rounding_tolerance.is_sign_negative()
        {
            return Err("fee amounts must not be negative".to_string());
        }
        Ok(())
    }

    fn buffer_multiplier(&self) -> Decimal {
        Decimal::ONE + bps(self.buffer_bps)
    }

    /// Round up: the payer covers rounding, never the recipient.
    fn round_up(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.settlement_decimals, RoundingStrategy::AwayFromZero)
    }

    /// Buffered destination gas, the only network fee of a trivial plan.
    pub fn buffered_gas(&self) -> Decimal {
        self.round_up(self.destination_gas * self.buffer_multiplier())
    }

    pub fn platform_fee(&self, target: Decimal) -> Decimal {
        self.round_up(target * bps(self.platform_fee_bps))
    }

    /// Fee envelope for a plan making `transfers` cross-ledger transfers and
    /// converting `conversion_volume` worth of native coin.
    pub fn estimate(
        &self,
        target: Decimal,
        transfers: usize,
        conversion_volume: Decimal,
    ) -> FeeBreakdown {
        let buffer = self.buffer_multiplier();

        let conversion_fee =
            self.round_up(conversion_volume.max(Decimal::ZERO) * bps(self.conversion_fee_bps) * buffer);

        let bridge_fee = if transfers == 0 {
            Decimal::ZERO
        } else {
            let per_transfer = self.bridge_fee_per_transfer.max(self.min_bridge_fee);
            self.round_up(per_transfer * Decimal::from(transfers as u64) * buffer)
        };

        FeeBreakdown {
            conversion_fee,
            bridge_fee,
            gas_fee: self.buffered_gas(),
            platform_fee: self.platform_fee(target),
            transfers,
        }
    }
}

#[inline]
fn bps(value: u32) -> Decimal {
    Decimal::from(value) / Decimal::from(BPS_PRECISION)
}

/// Estimated fees of a plan, buffer already applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub conversion_fee: Decimal,
    pub bridge_fee: Decimal,
    pub gas_fee: Decimal,
    pub platform_fee: Decimal,
    /// Cross-ledger transfer count the bridge fee was sized for
    pub transfers: usize,
}

impl FeeBreakdown {
    /// Fees the payer covers on top of the target, excluding platform fee.
    pub fn network_total(&self) -> Decimal {
        self.conversion_fee + self.bridge_fee + self.gas_fee
    }

    pub fn total(&self) -> Decimal {
        self.network_total() + self.platform_fee
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_buffer_applied_to_every_network_component() {
        let policy = FeePolicy::default();
        let fees = policy.estimate(dec!(50), 1, dec!(20));

        // 20 * 0.30% * 1.1
        assert_eq!(fees.conversion_fee, dec!(0.066));
        // 0.10 * 1 * 1.1
        assert_eq!(fees.bridge_fee, dec!(0.11));
        // 0.02 * 1.1
        assert_eq!(fees.gas_fee, dec!(0.022));
        assert_eq!(fees.platform_fee, Decimal::ZERO);
        assert_eq!(fees.total(), dec!(0.198));
    }

    #[test]
    fn test_min_bridge_fee_floor() {
        let policy = FeePolicy {
            bridge_fee_per_transfer: dec!(0.01),
            min_bridge_fee: dec!(0.05),
            buffer_bps: 0,
            ..FeePolicy::default()
        };
        assert_eq!(policy.estimate(dec!(10), 2, Decimal::ZERO).bridge_fee, dec!(0.10));
    }

    #[test]
    fn test_no_transfers_no_bridge_fee() {
        let fees = FeePolicy::default().estimate(dec!(10), 0, Decimal::ZERO);
        assert_eq!(fees.bridge_fee, Decimal::ZERO);
        assert_eq!(fees.conversion_fee, Decimal::ZERO);
    }

    #[test]
    fn test_fee_monotone_in_transfer_count() {
        let policy = FeePolicy::default();
        let mut last = Decimal::ZERO;
        for transfers in 0..12 {
            let total = policy.estimate(dec!(100), transfers, dec!(5)).total();
            assert!(total >= last, "fee decreased at {} transfers", transfers);
            last = total;
        }
    }

    #[test]
    fn test_platform_fee_rounds_up() {
        let policy = FeePolicy {
            platform_fee_bps: 25,
            ..FeePolicy::default()
        };
        // 33.333333 * 0.25% = 0.0833333325 -> 0.083334
        assert_eq!(policy.platform_fee(dec!(33.333333)), dec!(0.083334));
    }

    #[test]
    fn test_validate_rejects_full_platform_fee() {
        let policy = FeePolicy {
            platform_fee_bps: 10_000,
            ..FeePolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
