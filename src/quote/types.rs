//! Plan and balance types shared by the planner, the job record and the
//! balance aggregator boundary.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::fee::FeeBreakdown;

/// Ledger (chain) identifier as used in configuration, e.g. `"base"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(String);

impl LedgerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LedgerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Holdings of one address on one ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerBalance {
    /// Native coin balance
    #[serde(default)]
    pub native: Decimal,
    /// Settlement-asset balance
    #[serde(default)]
    pub settlement: Decimal,
    /// Settlement-denominated value of `native`, when the aggregator prices it
    #[serde(default)]
    pub native_value: Option<Decimal>,
}

impl LedgerBalance {
    pub fn settlement(amount: Decimal) -> Self {
        Self {
            settlement: amount,
            ..Default::default()
        }
    }

    pub fn native(amount: Decimal) -> Self {
        Self {
            native: amount,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.native.is_zero() && self.settlement.is_zero()
    }
}

/// Per-ledger balances. Ordered so that iteration is deterministic.
pub type BalanceSnapshot = BTreeMap<LedgerId, LedgerBalance>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Spend settlement asset already held
    Direct,
    /// Convert native coin into settlement asset first
    Convert,
}

/// One entry of a sourcing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStep {
    pub ledger: LedgerId,
    pub kind: StepKind,
    /// Settlement-denominated amount this step contributes
    pub amount: Decimal,
    /// Native amount to sell (conversion steps only)
    #[serde(default)]
    pub native_amount: Option<Decimal>,
    /// Actual conversion output, known once the conversion executed
    #[serde(default)]
    pub converted_amount: Option<Decimal>,
    /// Funds already sit on the destination ledger
    #[serde(default)]
    pub no_transfer: bool,
}

impl SourceStep {
    pub fn direct(ledger: LedgerId, amount: Decimal, no_transfer: bool) -> Self {
        Self {
            ledger,
            kind: StepKind::Direct,
            amount,
            native_amount: None,
            converted_amount: None,
            no_transfer,
        }
    }

    pub fn convert(
        ledger: LedgerId,
        amount: Decimal,
        native_amount: Decimal,
        no_transfer: bool,
    ) -> Self {
        Self {
            ledger,
            kind: StepKind::Convert,
            amount,
            native_amount: Some(native_amount),
            converted_amount: None,
            no_transfer,
        }
    }

    #[inline]
    pub fn is_conversion(&self) -> bool {
        self.kind == StepKind::Convert
    }

    /// Settlement asset this step actually makes available: the converted
    /// output once known, the planned amount before that.
    pub fn available(&self) -> Decimal {
        match self.kind {
            StepKind::Direct => self.amount,
            StepKind::Convert => self.converted_amount.unwrap_or(self.amount),
        }
    }
}

/// Planner output: the plan plus its fee envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub target_amount: Decimal,
    pub fees: FeeBreakdown,
    /// What the payer authorizes: target + buffered fees + platform fee
    pub payer_total: Decimal,
    /// What the recipient receives; always equals `target_amount`
    pub recipient_amount: Decimal,
    /// Amount handed to the settlement call (target + platform fee)
    pub settlement_gross: Decimal,
    pub plan: Vec<SourceStep>,
    /// Payer already holds enough on the destination ledger
    pub trivial: bool,
}

impl Quote {
    pub fn has_conversions(&self) -> bool {
        self.plan.iter().any(SourceStep::is_conversion)
    }

    pub fn needs_transfer(&self) -> bool {
        !self.trivial && self.plan.iter().any(|s| !s.no_transfer)
    }
}
