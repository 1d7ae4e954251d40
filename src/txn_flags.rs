//! Transaction-level data-quality flags attached after reconciliation.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{is_missing_id, Receipt, ReconciledTransaction};
use crate::table::{
    fmt_flag, reconcile_flag_cells, transaction_cells, transaction_header, write_csv, TableError,
    RECONCILE_FLAG_COLUMNS,
};

pub const TXN_FLAG_COLUMNS: [&str; 3] = [
    "flag_untracked_coupon",
    "flag_missing_info",
    "flag_pay_or_reduce_amt_abn",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedTransaction {
    pub reconciled: ReconciledTransaction,
    /// Coupon id is known but nobody ever received that coupon.
    pub flag_untracked_coupon: bool,
    pub flag_missing_info: bool,
    pub flag_pay_or_reduce_amt_abn: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnFlagReport {
    pub transactions: u64,
    pub dropped_imputed: u64,
    pub untracked_coupon: u64,
    pub missing_info: u64,
    pub pay_or_reduce_amt_abn: u64,
}

/// Flags every reconciled transaction; strict mode first drops rows whose
/// coupon id was imputed.
pub fn flag_transactions(
    reconciled: &[ReconciledTransaction],
    receipts: &[Receipt],
    strict: bool,
) -> (Vec<FlaggedTransaction>, TxnFlagReport) {
    let tracked: HashSet<i64> = receipts.iter().map(|r| r.coupon_id).collect();
    let mut report = TxnFlagReport::default();

    let mut out = Vec::with_capacity(reconciled.len());
    for row in reconciled {
        if strict && row.coupon_id_imputed {
            report.dropped_imputed += 1;
            continue;
        }

        let flagged = FlaggedTransaction {
            flag_untracked_coupon: is_untracked(row, &tracked),
            flag_missing_info: has_missing_info(row),
            flag_pay_or_reduce_amt_abn: has_abnormal_amounts(row),
            reconciled: row.clone(),
        };
        report.untracked_coupon += u64::from(flagged.flag_untracked_coupon);
        report.missing_info += u64::from(flagged.flag_missing_info);
        report.pay_or_reduce_amt_abn += u64::from(flagged.flag_pay_or_reduce_amt_abn);
        out.push(flagged);
    }
    report.transactions = out.len() as u64;

    info!(
        component = "txn_flags",
        event = "txn_flags.finish",
        strict,
        transactions = report.transactions,
        dropped_imputed = report.dropped_imputed,
        untracked_coupon = report.untracked_coupon,
        missing_info = report.missing_info,
        pay_or_reduce_amt_abn = report.pay_or_reduce_amt_abn
    );

    (out, report)
}

fn is_untracked(row: &ReconciledTransaction, tracked: &HashSet<i64>) -> bool {
    let coupon = row.txn.coupon_id;
    !is_missing_id(coupon) && !tracked.contains(&coupon)
}

fn has_missing_info(row: &ReconciledTransaction) -> bool {
    let txn = &row.txn;
    is_missing_id(txn.user_id)
        || (is_missing_id(txn.coupon_id) && !row.flag_no_coupon)
        || is_missing_id(txn.shop_id)
        || is_missing_id(txn.order_id)
        || txn.coupon_type.is_none()
        || txn.biz_code.is_none()
        || txn.pay_date.is_none()
        || txn.actual_pay.is_none()
        || txn.reduce_amount.is_none()
}

fn has_abnormal_amounts(row: &ReconciledTransaction) -> bool {
    let txn = &row.txn;
    (row.flag_no_coupon && txn.reduce_amount.is_some_and(|r| r > 0))
        || txn.actual_pay.is_some_and(|p| p < 0)
        || txn.reduce_amount.is_some_and(|r| r < 0)
}

pub fn write_flagged_transactions(
    path: &Path,
    rows: &[FlaggedTransaction],
) -> Result<usize, TableError> {
    let extra: Vec<&str> = RECONCILE_FLAG_COLUMNS
        .iter()
        .chain(TXN_FLAG_COLUMNS.iter())
        .copied()
        .collect();
    let (header, passthrough) = transaction_header(rows.iter().map(|r| &r.reconciled.txn), &extra);

    write_csv(
        path,
        &header,
        rows.iter().map(|row| {
            let mut cells = transaction_cells(&row.reconciled.txn, &passthrough);
            cells.extend(reconcile_flag_cells(&row.reconciled));
            cells.push(fmt_flag(row.flag_untracked_coupon));
            cells.push(fmt_flag(row.flag_missing_info));
            cells.push(fmt_flag(row.flag_pay_or_reduce_amt_abn));
            cells
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Transaction, MISSING_ID};

    fn complete(txn_key: i64, coupon: i64, reduce: Option<i64>, pay: Option<i64>) -> Transaction {
        let mut txn = Transaction::new(txn_key, 1, coupon, "2023-01-05".parse().ok(), reduce, pay)
            .with_order(10, 100 + txn_key);
        txn.coupon_type = Some(1);
        txn.biz_code = Some("A".to_string());
        txn
    }

    fn receipt(coupon: i64) -> Receipt {
        Receipt {
            receipt_key: 1,
            user_id: 2,
            coupon_id: coupon,
            receive_date: None,
            start_date: None,
            end_date: None,
            price_limit: None,
            coupon_amount: None,
            coupon_status: None,
        }
    }

    #[test]
    fn untracked_coupon_ignores_the_missing_sentinel() {
        let rows = vec![
            ReconciledTransaction::unchanged(complete(1, 9001, Some(0), Some(10))),
            ReconciledTransaction::unchanged(complete(2, 9002, Some(0), Some(10))),
            ReconciledTransaction {
                flag_no_coupon: true,
                ..ReconciledTransaction::unchanged(complete(3, MISSING_ID, Some(0), Some(10)))
            },
        ];
        let (flagged, report) = flag_transactions(&rows, &[receipt(9001)], false);

        assert!(!flagged[0].flag_untracked_coupon);
        assert!(flagged[1].flag_untracked_coupon);
        assert!(!flagged[2].flag_untracked_coupon);
        assert!(!flagged[2].flag_missing_info);
        assert_eq!(report.untracked_coupon, 1);
    }

    #[test]
    fn missing_info_and_abnormal_amounts() {
        let ambiguous = ReconciledTransaction {
            flag_ambiguous_txn: true,
            ..ReconciledTransaction::unchanged(complete(1, MISSING_ID, Some(5), Some(10)))
        };
        let discounted_no_coupon = ReconciledTransaction {
            flag_no_coupon: true,
            ..ReconciledTransaction::unchanged(complete(2, MISSING_ID, Some(5), Some(10)))
        };
        let negative_pay = ReconciledTransaction::unchanged(complete(3, 9001, Some(0), Some(-1)));
        let no_biz = {
            let mut txn = complete(4, 9001, Some(0), Some(10));
            txn.biz_code = None;
            ReconciledTransaction::unchanged(txn)
        };

        let (flagged, _) = flag_transactions(
            &[ambiguous, discounted_no_coupon, negative_pay, no_biz],
            &[receipt(9001)],
            false,
        );

        assert!(flagged[0].flag_missing_info);
        assert!(!flagged[0].flag_pay_or_reduce_amt_abn);
        assert!(!flagged[1].flag_missing_info);
        assert!(flagged[1].flag_pay_or_reduce_amt_abn);
        assert!(flagged[2].flag_pay_or_reduce_amt_abn);
        assert!(flagged[3].flag_missing_info);
    }

    #[test]
    fn strict_mode_drops_imputed_rows() {
        let imputed = ReconciledTransaction {
            coupon_id_imputed: true,
            ..ReconciledTransaction::unchanged(complete(1, 9001, Some(5), Some(10)))
        };
        let kept = ReconciledTransaction::unchanged(complete(2, 9001, Some(5), Some(10)));

        let (strict, report) = flag_transactions(&[imputed.clone(), kept.clone()], &[receipt(9001)], true);
        assert_eq!(strict.len(), 1);
        assert_eq!(report.dropped_imputed, 1);

        let (relaxed, _) = flag_transactions(&[imputed, kept], &[receipt(9001)], false);
        assert_eq!(relaxed.len(), 2);
    }
}
