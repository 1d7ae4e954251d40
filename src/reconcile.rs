//! Coupon-id reconciliation for transactions recorded without a coupon.
//!
//! A transaction with an unknown coupon id is matched against the same
//! user's receipts whose effective window `[start_eff, end_date]` contains
//! the pay date. Exactly one candidate imputes the coupon id; zero
//! candidates with no discount marks a plain purchase; anything else is
//! ambiguous and stays unresolved.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{is_missing_id, Receipt, ReconciledTransaction, Transaction};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("duplicate {table} key {key}; keys must be unique before reconciliation")]
    DuplicateKey { table: &'static str, key: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub total_transactions: u64,
    pub missing_coupon: u64,
    pub pre_triaged_ambiguous: u64,
    pub imputed: u64,
    pub no_coupon: u64,
    pub ambiguous: u64,
    pub candidate_receipts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Impute(i64),
    NoCoupon,
    Ambiguous,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    start_eff: NaiveDate,
    end_date: NaiveDate,
    coupon_id: i64,
}

pub fn reconcile(
    transactions: Vec<Transaction>,
    receipts: &[Receipt],
) -> Result<(Vec<ReconciledTransaction>, ReconcileReport), ReconcileError> {
    if let Some(key) = first_duplicate_key(transactions.iter().map(|t| t.txn_key)) {
        return Err(ReconcileError::DuplicateKey {
            table: "transaction",
            key,
        });
    }
    if let Some(key) = first_duplicate_key(receipts.iter().map(|r| r.receipt_key)) {
        return Err(ReconcileError::DuplicateKey {
            table: "receipt",
            key,
        });
    }

    let mut report = ReconcileReport {
        total_transactions: transactions.len() as u64,
        ..ReconcileReport::default()
    };

    let missing = transactions
        .iter()
        .filter(|t| is_missing_id(t.coupon_id))
        .count() as u64;
    report.missing_coupon = missing;

    info!(
        component = "reconcile",
        event = "reconcile.start",
        transactions = report.total_transactions,
        missing_coupon = missing,
        receipts = receipts.len()
    );

    let pool = if missing > 0 {
        candidate_pool(receipts)
    } else {
        HashMap::new()
    };
    report.candidate_receipts = pool.values().map(|c| c.len() as u64).sum();

    let mut out = Vec::with_capacity(transactions.len());
    for txn in transactions {
        if !is_missing_id(txn.coupon_id) {
            out.push(ReconciledTransaction::unchanged(txn));
            continue;
        }

        let decision = match triage(&txn) {
            Some(pay_date) => decide(&txn, pay_date, &pool),
            None => {
                report.pre_triaged_ambiguous += 1;
                Decision::Ambiguous
            }
        };

        out.push(apply_decision(txn, decision, &mut report));
    }

    if report.ambiguous > 0 {
        warn!(
            component = "reconcile",
            event = "reconcile.ambiguous",
            ambiguous = report.ambiguous,
            pre_triaged = report.pre_triaged_ambiguous
        );
    }

    info!(
        component = "reconcile",
        event = "reconcile.finish",
        imputed = report.imputed,
        no_coupon = report.no_coupon,
        ambiguous = report.ambiguous,
        candidate_receipts = report.candidate_receipts
    );

    Ok((out, report))
}

/// Transactions handed to the label builder: still-unresolved coupon ids
/// are dropped, and strict mode additionally drops imputed coupon ids.
pub fn label_input_transactions(
    reconciled: &[ReconciledTransaction],
    strict: bool,
) -> Vec<Transaction> {
    reconciled
        .iter()
        .filter(|row| !is_missing_id(row.txn.coupon_id))
        .filter(|row| !(strict && row.coupon_id_imputed))
        .map(|row| row.txn.clone())
        .collect()
}

pub(crate) fn first_duplicate_key(keys: impl IntoIterator<Item = i64>) -> Option<i64> {
    let mut seen = HashSet::new();
    keys.into_iter().find(|key| !seen.insert(*key))
}

// Unknown user or pay date cannot be matched at all.
fn triage(txn: &Transaction) -> Option<NaiveDate> {
    if is_missing_id(txn.user_id) {
        return None;
    }
    txn.pay_date
}

fn candidate_pool(receipts: &[Receipt]) -> HashMap<i64, Vec<Candidate>> {
    let mut pool: HashMap<i64, Vec<Candidate>> = HashMap::new();
    let mut dropped = 0u64;

    for receipt in receipts {
        let (Some(receive), Some(start), Some(end)) =
            (receipt.receive_date, receipt.start_date, receipt.end_date)
        else {
            dropped += 1;
            continue;
        };
        if start > end || is_missing_id(receipt.user_id) || is_missing_id(receipt.coupon_id) {
            dropped += 1;
            continue;
        }
        pool.entry(receipt.user_id).or_default().push(Candidate {
            start_eff: receive.max(start),
            end_date: end,
            coupon_id: receipt.coupon_id,
        });
    }

    if dropped > 0 {
        info!(
            component = "reconcile",
            event = "reconcile.pool.dropped",
            dropped = dropped
        );
    }

    pool
}

fn decide(txn: &Transaction, pay_date: NaiveDate, pool: &HashMap<i64, Vec<Candidate>>) -> Decision {
    let mut matches = pool
        .get(&txn.user_id)
        .into_iter()
        .flatten()
        .filter(|c| c.start_eff <= pay_date && pay_date <= c.end_date);

    match (matches.next(), matches.next()) {
        (Some(only), None) => Decision::Impute(only.coupon_id),
        (None, _) => match txn.reduce_amount {
            Some(amount) if amount.abs() < 1 => Decision::NoCoupon,
            _ => Decision::Ambiguous,
        },
        (Some(_), Some(_)) => Decision::Ambiguous,
    }
}

fn apply_decision(
    mut txn: Transaction,
    decision: Decision,
    report: &mut ReconcileReport,
) -> ReconciledTransaction {
    match decision {
        Decision::Impute(coupon_id) => {
            report.imputed += 1;
            txn.coupon_id = coupon_id;
        }
        Decision::NoCoupon => report.no_coupon += 1,
        Decision::Ambiguous => report.ambiguous += 1,
    }

    ReconciledTransaction {
        txn,
        coupon_id_imputed: matches!(decision, Decision::Impute(_)),
        flag_no_coupon: decision == Decision::NoCoupon,
        flag_ambiguous_txn: decision == Decision::Ambiguous,
    }
}
