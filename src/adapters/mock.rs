//! Mock adapters for testing
//!
//! All mocks share one [`MockLedgers`] world so that conversions, bridge
//! transfers and payouts move balances the aggregator later reports.
//! An irreversible call repeated with the same reference panics: a resumed
//! job must never re-issue a call whose effect was already recorded.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{
    AdapterError, BalanceAggregator, BridgeAdapter, BridgeReceipt, BridgeSource,
    ConversionAdapter, ConversionReceipt, CustodyProvider, SettlementAdapter, SettlementReceipt,
};
use crate::credential::SignerIdentity;
use crate::quote::{BalanceSnapshot, LedgerBalance, LedgerId};

pub struct MockLedgers {
    balances: Mutex<HashMap<String, BalanceSnapshot>>,
    /// Settlement asset received per native unit
    conversion_rate: Decimal,
    completed: Mutex<HashSet<String>>,
    log: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, VecDeque<AdapterError>>>,
    payouts: Mutex<Vec<(String, Decimal)>>,
    /// Scans answered with an empty snapshot before the real one
    scan_lag: AtomicU32,
    scans: AtomicU32,
}

impl MockLedgers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            balances: Mutex::new(HashMap::new()),
            conversion_rate: Decimal::from(2500),
            completed: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            payouts: Mutex::new(Vec::new()),
            scan_lag: AtomicU32::new(0),
            scans: AtomicU32::new(0),
        })
    }

    pub fn set_balance(&self, address: &str, ledger: &str, balance: LedgerBalance) {
        self.balances
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .insert(LedgerId::from(ledger), balance);
    }

    pub fn balance(&self, address: &str, ledger: &str) -> LedgerBalance {
        self.balances
            .lock()
            .unwrap()
            .get(address)
            .and_then(|s| s.get(&LedgerId::from(ledger)).cloned())
            .unwrap_or_default()
    }

    pub fn set_scan_lag(&self, scans: u32) {
        self.scan_lag.store(scans, Ordering::SeqCst);
    }

    pub fn scan_count(&self) -> u32 {
        self.scans.load(Ordering::SeqCst)
    }

    /// Make the next call of `op` ("scan", "convert", "bridge", "settle") fail.
    pub fn fail_next(&self, op: &'static str, err: AdapterError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Successful irreversible calls, in order, as "op:reference"
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn payouts(&self) -> Vec<(String, Decimal)> {
        self.payouts.lock().unwrap().clone()
    }

    fn injected(&self, op: &'static str) -> Result<(), AdapterError> {
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(|q| q.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn complete(&self, op: &str, reference: &str) {
        let key = format!("{}:{}", op, reference);
        if !self.completed.lock().unwrap().insert(key.clone()) {
            panic!("duplicate irreversible call {}", key);
        }
        self.log.lock().unwrap().push(key);
    }

    fn adjust<F>(&self, address: &str, ledger: &LedgerId, f: F)
    where
        F: FnOnce(&mut LedgerBalance),
    {
        let mut balances = self.balances.lock().unwrap();
        let entry = balances
            .entry(address.to_string())
            .or_default()
            .entry(ledger.clone())
            .or_default();
        f(entry);
    }
}

pub struct MockAggregator(pub Arc<MockLedgers>);

#[async_trait]
impl BalanceAggregator for MockAggregator {
    async fn scan(&self, address: &str) -> Result<BalanceSnapshot, AdapterError> {
        self.0.injected("scan")?;
        let n = self.0.scans.fetch_add(1, Ordering::SeqCst);
        if n < self.0.scan_lag.load(Ordering::SeqCst) {
            return Ok(BalanceSnapshot::new());
        }
        Ok(self
            .0
            .balances
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct MockConverter(pub Arc<MockLedgers>);

#[async_trait]
impl ConversionAdapter for MockConverter {
    async fn convert(
        &self,
        reference: &str,
        ledger: &LedgerId,
        _from_asset: &str,
        native_amount: Decimal,
        signer: &SignerIdentity,
    ) -> Result<ConversionReceipt, AdapterError> {
        self.0.injected("convert")?;
        let address = signer.address();
        if self.0.balance(&address, ledger.as_str()).native < native_amount {
            return Err(AdapterError::Reverted("insufficient native balance".into()));
        }
        let output = native_amount * self.0.conversion_rate;
        self.0.adjust(&address, ledger, |b| {
            b.native -= native_amount;
            b.settlement += output;
        });
        self.0.complete("convert", reference);
        Ok(ConversionReceipt {
            tx_ref: format!("0xswap-{}", reference),
            actual_output: output,
        })
    }
}

pub struct MockBridge(pub Arc<MockLedgers>);

#[async_trait]
impl BridgeAdapter for MockBridge {
    async fn initiate_transfer(
        &self,
        reference: &str,
        source: &BridgeSource,
        dest_ledger: &LedgerId,
        recipient: &str,
        signer: &SignerIdentity,
    ) -> Result<BridgeReceipt, AdapterError> {
        self.0.injected("bridge")?;
        let address = signer.address();
        if self.0.balance(&address, source.ledger.as_str()).settlement < source.amount {
            return Err(AdapterError::Reverted("burn amount exceeds balance".into()));
        }
        self.0
            .adjust(&address, &source.ledger, |b| b.settlement -= source.amount);
        self.0
            .adjust(recipient, dest_ledger, |b| b.settlement += source.amount);
        self.0.complete("bridge", reference);
        Ok(BridgeReceipt {
            tx_ref: format!("0xburn-{}", reference),
            mint_tx: format!("0xmint-{}", reference),
            attestation: "0xattested".to_string(),
            attestation_signature: "0xsig".to_string(),
        })
    }
}

/// Settles on a single destination ledger
pub struct MockSettlement {
    pub ledgers: Arc<MockLedgers>,
    pub destination: LedgerId,
}

impl MockSettlement {
    fn debit(&self, signer: &SignerIdentity, gross: Decimal) -> Result<(), AdapterError> {
        let address = signer.address();
        if self.ledgers.balance(&address, self.destination.as_str()).settlement < gross {
            return Err(AdapterError::Reverted("transfer amount exceeds balance".into()));
        }
        self.ledgers
            .adjust(&address, &self.destination, |b| b.settlement -= gross);
        Ok(())
    }
}

#[async_trait]
impl SettlementAdapter for MockSettlement {
    async fn pay(
        &self,
        recipient: &str,
        gross_amount: Decimal,
        reference: &str,
        signer: &SignerIdentity,
    ) -> Result<SettlementReceipt, AdapterError> {
        self.ledgers.injected("settle")?;
        self.debit(signer, gross_amount)?;
        self.ledgers
            .payouts
            .lock()
            .unwrap()
            .push((recipient.to_string(), gross_amount));
        self.ledgers.complete("settle", reference);
        Ok(SettlementReceipt {
            tx_ref: format!("0xpay-{}", reference),
        })
    }

    async fn split_pay(
        &self,
        recipients: &[String],
        weights_bps: &[u32],
        gross_amount: Decimal,
        reference: &str,
        signer: &SignerIdentity,
    ) -> Result<SettlementReceipt, AdapterError> {
        self.ledgers.injected("settle")?;
        self.debit(signer, gross_amount)?;
        {
            let mut payouts = self.ledgers.payouts.lock().unwrap();
            for (recipient, weight) in recipients.iter().zip(weights_bps) {
                let share = gross_amount * Decimal::from(*weight) / Decimal::from(10_000);
                payouts.push((recipient.clone(), share));
            }
        }
        self.ledgers.complete("settle", reference);
        Ok(SettlementReceipt {
            tx_ref: format!("0xsplit-{}", reference),
        })
    }
}

pub struct MockCustody {
    created: AtomicU32,
    failure: Mutex<Option<AdapterError>>,
}

impl MockCustody {
    pub fn new() -> Self {
        Self {
            created: AtomicU32::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, err: AdapterError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustodyProvider for MockCustody {
    async fn create_signer(&self, payer: &str, _address: &str) -> Result<String, AdapterError> {
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("custody-{}-{}", payer, n))
    }
}
