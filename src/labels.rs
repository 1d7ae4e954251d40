//! Receipt-level redemption labels, validity flags and audit counters.
//!
//! Every receipt is evaluated independently against the full transaction
//! set, so one transaction may satisfy several receipts of the same user
//! and coupon. All windows are inclusive on both ends.

use std::collections::HashMap;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{is_missing_id, LabelRecord, Receipt, ReceiptWindow, Transaction};
use crate::reconcile::first_duplicate_key;

pub const DEFAULT_SHORT_WINDOW_DAYS: u32 = 15;

/// Name prefix of the per-receipt label workers, visible in thread-aware logs.
pub const LABEL_WORKER_PREFIX: &str = "labels-worker-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConfig {
    pub short_window_days: u32,
    /// Worker threads for per-receipt evaluation; 0 uses the engine default.
    pub threads: usize,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            short_window_days: DEFAULT_SHORT_WINDOW_DAYS,
            threads: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("duplicate {table} key {key}; keys must be unique before labelling")]
    DuplicateKey { table: &'static str, key: i64 },
    #[error("failed to build label worker pool: {0}")]
    ThreadPool(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelReport {
    pub receipts: u64,
    pub transactions: u64,
    pub full_horizon_redeemed: u64,
    pub short_term_redeemed: u64,
    pub valid: u64,
    pub structurally_invalid: u64,
    pub cross_user: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TxnPoint {
    pay_date: NaiveDate,
    txn_key: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CouponTxnPoint {
    pay_date: NaiveDate,
    txn_key: i64,
    user_id: i64,
}

/// Lookup structures shared read-only by every receipt evaluation.
struct LabelIndex {
    by_user_coupon: HashMap<(i64, i64), Vec<TxnPoint>>,
    by_coupon: HashMap<i64, Vec<CouponTxnPoint>>,
    windows_by_user_coupon: HashMap<(i64, i64), Vec<(NaiveDate, NaiveDate)>>,
}

impl LabelIndex {
    fn build(receipts: &[Receipt], transactions: &[Transaction], short_window_days: u32) -> Self {
        let mut by_user_coupon: HashMap<(i64, i64), Vec<TxnPoint>> = HashMap::new();
        let mut by_coupon: HashMap<i64, Vec<CouponTxnPoint>> = HashMap::new();

        // A null pay date never satisfies a date comparison.
        for txn in transactions {
            let Some(pay_date) = txn.pay_date else {
                continue;
            };
            by_user_coupon
                .entry((txn.user_id, txn.coupon_id))
                .or_default()
                .push(TxnPoint {
                    pay_date,
                    txn_key: txn.txn_key,
                });
            by_coupon
                .entry(txn.coupon_id)
                .or_default()
                .push(CouponTxnPoint {
                    pay_date,
                    txn_key: txn.txn_key,
                    user_id: txn.user_id,
                });
        }
        for points in by_user_coupon.values_mut() {
            points.sort_unstable();
        }
        for points in by_coupon.values_mut() {
            points.sort_unstable();
        }

        let mut windows_by_user_coupon: HashMap<(i64, i64), Vec<(NaiveDate, NaiveDate)>> =
            HashMap::new();
        for receipt in receipts {
            if let Some(bounds) = receipt.window(short_window_days).full_horizon() {
                windows_by_user_coupon
                    .entry((receipt.user_id, receipt.coupon_id))
                    .or_default()
                    .push(bounds);
            }
        }

        Self {
            by_user_coupon,
            by_coupon,
            windows_by_user_coupon,
        }
    }

    fn same_user(&self, receipt: &Receipt) -> &[TxnPoint] {
        self.by_user_coupon
            .get(&(receipt.user_id, receipt.coupon_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn same_coupon(&self, coupon_id: i64) -> &[CouponTxnPoint] {
        self.by_coupon
            .get(&coupon_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn has_own_covering_receipt(&self, user_id: i64, coupon_id: i64, day: NaiveDate) -> bool {
        self.windows_by_user_coupon
            .get(&(user_id, coupon_id))
            .map(|windows| {
                windows
                    .iter()
                    .any(|(start, end)| *start <= day && day <= *end)
            })
            .unwrap_or(false)
    }
}

pub fn build_labels(
    receipts: &[Receipt],
    transactions: &[Transaction],
    cfg: &LabelConfig,
) -> Result<(Vec<LabelRecord>, LabelReport), LabelError> {
    if let Some(key) = first_duplicate_key(receipts.iter().map(|r| r.receipt_key)) {
        return Err(LabelError::DuplicateKey {
            table: "receipt",
            key,
        });
    }
    if let Some(key) = first_duplicate_key(transactions.iter().map(|t| t.txn_key)) {
        return Err(LabelError::DuplicateKey {
            table: "transaction",
            key,
        });
    }

    info!(
        component = "labels",
        event = "labels.build.start",
        receipts = receipts.len(),
        transactions = transactions.len(),
        short_window_days = cfg.short_window_days,
        threads = cfg.threads
    );

    let index = LabelIndex::build(receipts, transactions, cfg.short_window_days);
    let pool = worker_pool(cfg.threads)?;

    let records: Vec<LabelRecord> = pool.install(|| {
        receipts
            .par_iter()
            .map(|receipt| label_receipt(receipt, &index, cfg.short_window_days))
            .collect()
    });

    let report = summarize(&records, transactions.len());
    if report.structurally_invalid > 0 {
        warn!(
            component = "labels",
            event = "labels.struc_invalid",
            structurally_invalid = report.structurally_invalid
        );
    }

    info!(
        component = "labels",
        event = "labels.build.finish",
        receipts = report.receipts,
        full_horizon_redeemed = report.full_horizon_redeemed,
        short_term_redeemed = report.short_term_redeemed,
        valid = report.valid,
        cross_user = report.cross_user
    );

    Ok((records, report))
}

fn worker_pool(threads: usize) -> Result<rayon::ThreadPool, LabelError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|idx| format!("{LABEL_WORKER_PREFIX}{idx}"))
        .build()
        .map_err(|err| LabelError::ThreadPool(err.to_string()))
}

fn label_receipt(receipt: &Receipt, index: &LabelIndex, short_window_days: u32) -> LabelRecord {
    let window = receipt.window(short_window_days);
    let same_user = index.same_user(receipt);

    let full_horizon = window
        .full_horizon()
        .map(|(start, end)| between(same_user, start, end))
        .unwrap_or(&[]);
    let short_term = window
        .short_term()
        .map(|(start, end)| between(same_user, start, end))
        .unwrap_or(&[]);

    let first_valid = full_horizon.first();
    let early = early_before_start(receipt, same_user) + early_before_receive(receipt, &window, same_user);
    let late = window
        .end_eff
        .map(|end| same_user.len() - same_user.partition_point(|p| p.pay_date <= end))
        .unwrap_or(0) as u64;
    let (other_in_window, other_without_own) = other_user_counts(receipt, &window, index);

    let flag_struc_invalid = is_missing_id(receipt.user_id)
        || is_missing_id(receipt.coupon_id)
        || receipt.has_invalid_span();

    LabelRecord {
        receipt_key: receipt.receipt_key,
        user_id: receipt.user_id,
        coupon_id: receipt.coupon_id,
        receive_date: receipt.receive_date,
        start_date: receipt.start_date,
        end_date: receipt.end_date,
        start_eff: window.start_eff,
        end_eff: window.end_eff,
        short_end: window.short_end,
        coupon_status: receipt.coupon_status,
        coupon_amount: receipt.coupon_amount,
        price_limit: receipt.price_limit,
        label_same_user_fh: !full_horizon.is_empty(),
        label_same_user_st: !short_term.is_empty(),
        first_valid_txn_key: first_valid.map(|p| p.txn_key),
        first_valid_txn_time: first_valid.map(|p| p.pay_date),
        same_user_valid_txn_count: full_horizon.len() as u64,
        same_user_early_txn_count: early,
        same_user_late_txn_count: late,
        other_user_in_window_txn_count: other_in_window,
        other_user_without_own_receipt_txn_count: other_without_own,
        flag_early: early > 0,
        flag_late: late > 0,
        flag_cross_user: other_without_own > 0,
        flag_struc_invalid,
    }
}

/// Points with `start <= pay_date <= end`; `points` is sorted by pay date.
fn between(points: &[TxnPoint], start: NaiveDate, end: NaiveDate) -> &[TxnPoint] {
    let lo = points.partition_point(|p| p.pay_date < start);
    let hi = points.partition_point(|p| p.pay_date <= end);
    if lo >= hi {
        &[]
    } else {
        &points[lo..hi]
    }
}

// Same-user transactions dated before the coupon's own start date.
fn early_before_start(receipt: &Receipt, same_user: &[TxnPoint]) -> u64 {
    receipt
        .start_date
        .map(|start| same_user.partition_point(|p| p.pay_date < start) as u64)
        .unwrap_or(0)
}

// Transactions in [start_date, end_eff] when even the latest of them still
// precedes the receive date; counted in full, otherwise zero.
fn early_before_receive(receipt: &Receipt, window: &ReceiptWindow, same_user: &[TxnPoint]) -> u64 {
    let (Some(start), Some(end), Some(receive)) =
        (receipt.start_date, window.end_eff, receipt.receive_date)
    else {
        return 0;
    };
    let span = between(same_user, start, end);
    match span.iter().map(|p| p.pay_date).max() {
        Some(latest) if latest < receive => span.len() as u64,
        _ => 0,
    }
}

fn other_user_counts(receipt: &Receipt, window: &ReceiptWindow, index: &LabelIndex) -> (u64, u64) {
    let Some((start, end)) = window.full_horizon() else {
        return (0, 0);
    };

    let points = index.same_coupon(receipt.coupon_id);
    let lo = points.partition_point(|p| p.pay_date < start);
    let hi = points.partition_point(|p| p.pay_date <= end);
    if lo >= hi {
        return (0, 0);
    }

    let mut in_window = 0u64;
    let mut without_own = Vec::new();
    for point in points[lo..hi].iter().filter(|p| p.user_id != receipt.user_id) {
        in_window += 1;
        if !index.has_own_covering_receipt(point.user_id, receipt.coupon_id, point.pay_date) {
            without_own.push(point.txn_key);
        }
    }
    without_own.sort_unstable();
    without_own.dedup();

    (in_window, without_own.len() as u64)
}

fn summarize(records: &[LabelRecord], transactions: usize) -> LabelReport {
    let mut report = LabelReport {
        receipts: records.len() as u64,
        transactions: transactions as u64,
        ..LabelReport::default()
    };
    for record in records {
        report.full_horizon_redeemed += u64::from(record.label_same_user_fh);
        report.short_term_redeemed += u64::from(record.label_same_user_st);
        report.valid += u64::from(record.label_valid());
        report.structurally_invalid += u64::from(record.flag_struc_invalid);
        report.cross_user += u64::from(record.flag_cross_user);
    }
    report
}
