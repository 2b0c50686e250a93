//! Two-pass sourcing planner

use rust_decimal::Decimal;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

use super::fee::{FeeBreakdown, FeePolicy};
use super::types::{BalanceSnapshot, LedgerId, Quote, SourceStep};
use crate::config::{AppConfig, LedgerConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Target amount must be greater than zero")]
    InvalidTarget,

    #[error("Unknown ledger: {0}")]
    UnknownLedger(String),

    #[error("Insufficient funds: shortfall {shortfall} of required {required}")]
    Infeasible {
        shortfall: Decimal,
        required: Decimal,
    },
}

impl PlanError {
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::InvalidTarget => "INVALID_TARGET",
            PlanError::UnknownLedger(_) => "UNKNOWN_LEDGER",
            PlanError::Infeasible { .. } => "INSUFFICIENT_FUNDS",
        }
    }
}

/// Result of one allocation pass over the snapshot.
#[derive(Debug)]
struct Allocation {
    steps: Vec<SourceStep>,
    remaining: Decimal,
}

impl Allocation {
    /// Distinct source ledgers whose funds must cross to the destination.
    fn transfer_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| !s.no_transfer)
            .map(|s| &s.ledger)
            .collect::<BTreeSet<_>>()
            .len()
    }

    fn conversion_volume(&self) -> Decimal {
        self.steps
            .iter()
            .filter(|s| s.is_conversion())
            .map(|s| s.amount)
            .sum()
    }
}

/// Deterministic sourcing planner.
///
/// Immutable after construction; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Planner {
    /// Destination first, then configured preference order
    ledgers: Vec<LedgerConfig>,
    destination: LedgerId,
    fees: FeePolicy,
}

impl Planner {
    pub fn new(
        ledgers: Vec<LedgerConfig>,
        destination: LedgerId,
        fees: FeePolicy,
    ) -> Result<Self, PlanError> {
        let dest_pos = ledgers
            .iter()
            .position(|l| l.id == destination.as_str())
            .ok_or_else(|| PlanError::UnknownLedger(destination.to_string()))?;

        let mut ordered = ledgers;
        let dest = ordered.remove(dest_pos);
        ordered.insert(0, dest);

        Ok(Self {
            ledgers: ordered,
            destination,
            fees,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, PlanError> {
        Self::new(
            config.ledgers.clone(),
            LedgerId::new(config.destination_ledger.clone()),
            config.fees.clone(),
        )
    }

    pub fn destination(&self) -> &LedgerId {
        &self.destination
    }

    /// Build a plan for paying `target` out of `snapshot`.
    pub fn plan(&self, snapshot: &BalanceSnapshot, target: Decimal) -> Result<Quote, PlanError> {
        if target <= Decimal::ZERO {
            return Err(PlanError::InvalidTarget);
        }

        for ledger in snapshot.keys() {
            if !self.ledgers.iter().any(|l| l.id == ledger.as_str()) {
                debug!(ledger = %ledger, "Ignoring balance on unconfigured ledger");
            }
        }

        if let Some(quote) = self.trivial_plan(snapshot, target) {
            return Ok(quote);
        }

        // Pass 1: how many ledgers does the bare target touch?
        let prelim = self.allocate(snapshot, target);
        let fees = self.fees.estimate(
            target,
            prelim.transfer_count(),
            prelim.conversion_volume(),
        );

        // Pass 2: the real plan, sized for target + fees
        let required = target + fees.total();
        let fin = self.allocate(snapshot, required);

        if fin.remaining > self.fees.rounding_tolerance {
            debug!(
                target = %target,
                required = %required,
                shortfall = %fin.remaining,
                "Plan infeasible"
            );
            return Err(PlanError::Infeasible {
                shortfall: fin.remaining,
                required,
            });
        }

        debug!(
            target = %target,
            steps = fin.steps.len(),
            transfers = fees.transfers,
            fees = %fees.total(),
            "Plan built"
        );

        Ok(self.quote(target, fees, fin.steps, false))
    }

    fn trivial_plan(&self, snapshot: &BalanceSnapshot, target: Decimal) -> Option<Quote> {
        let held = snapshot.get(&self.destination)?.settlement;
        let fees = FeeBreakdown {
            gas_fee: self.fees.buffered_gas(),
            platform_fee: self.fees.platform_fee(target),
            ..FeeBreakdown::default()
        };
        let required = target + fees.total();
        if held < required {
            return None;
        }
        let step = SourceStep::direct(self.destination.clone(), required, true);
        Some(self.quote(target, fees, vec![step], true))
    }

    fn quote(
        &self,
        target: Decimal,
        fees: FeeBreakdown,
        plan: Vec<SourceStep>,
        trivial: bool,
    ) -> Quote {
        Quote {
            target_amount: target,
            payer_total: target + fees.total(),
            recipient_amount: target,
            settlement_gross: target + fees.platform_fee,
            fees,
            plan,
            trivial,
        }
    }

    fn allocate(&self, snapshot: &BalanceSnapshot, required: Decimal) -> Allocation {
        let mut steps = Vec::new();
        let mut remaining = required;

        // Direct-balance pass
        for ledger in &self.ledgers {
            if remaining <= Decimal::ZERO {
                break;
            }
            let id = LedgerId::new(ledger.id.clone());
            let Some(balance) = snapshot.get(&id) else {
                continue;
            };
            let take = balance.settlement.min(remaining);
            if take > Decimal::ZERO {
                let no_transfer = id == self.destination;
                steps.push(SourceStep::direct(id, take, no_transfer));
                remaining -= take;
            }
        }

        // Conversion pass; rate is unknown until execution, so unpriced
        // native balances are assumed to cover whatever is left
        for ledger in self.ledgers.iter().filter(|l| l.supports_conversion) {
            if remaining <= self.fees.rounding_tolerance {
                break;
            }
            let id = LedgerId::new(ledger.id.clone());
            let Some(balance) = snapshot.get(&id) else {
                continue;
            };
            let spendable = balance.native - ledger.gas_reserve;
            if spendable <= Decimal::ZERO {
                continue;
            }
            let no_transfer = id == self.destination;

            match balance.native_value {
                Some(value) if value > Decimal::ZERO && balance.native > Decimal::ZERO => {
                    let spendable_value = value * spendable / balance.native;
                    let amount = spendable_value.min(remaining);
                    let native_amount = if amount == spendable_value {
                        spendable
                    } else {
                        (spendable * amount / spendable_value).round_dp(18)
                    };
                    steps.push(SourceStep::convert(id, amount, native_amount, no_transfer));
                    remaining -= amount;
                }
                Some(_) => continue,
                None => {
                    steps.push(SourceStep::convert(id, remaining, spendable, no_transfer));
                    remaining = Decimal::ZERO;
                }
            }
        }

        Allocation {
            steps,
            remaining: remaining.max(Decimal::ZERO),
        }
    }
}
