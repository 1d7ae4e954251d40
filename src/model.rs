//! Row types shared by every stage of the training-table build.
//!
//! Identifiers are integer codes. An unknown identifier is carried as
//! [`MISSING_ID`] rather than a null so that it survives joins the same way
//! the upstream coded tables do. Dates are calendar days; `None` is a true
//! null produced by ingestion.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

pub const MISSING_ID: i64 = -1;

pub fn is_missing_id(id: i64) -> bool {
    id == MISSING_ID
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_key: i64,
    pub user_id: i64,
    pub coupon_id: i64,
    pub pay_date: Option<NaiveDate>,
    pub reduce_amount: Option<i64>,
    pub actual_pay: Option<i64>,
    pub shop_id: i64,
    pub order_id: i64,
    pub coupon_type: Option<i64>,
    pub biz_code: Option<String>,
    pub passthrough: BTreeMap<String, String>,
}

impl Transaction {
    pub fn new(
        txn_key: i64,
        user_id: i64,
        coupon_id: i64,
        pay_date: Option<NaiveDate>,
        reduce_amount: Option<i64>,
        actual_pay: Option<i64>,
    ) -> Self {
        Self {
            txn_key,
            user_id,
            coupon_id,
            pay_date,
            reduce_amount,
            actual_pay,
            shop_id: MISSING_ID,
            order_id: MISSING_ID,
            coupon_type: None,
            biz_code: None,
            passthrough: BTreeMap::new(),
        }
    }

    pub fn with_order(mut self, shop_id: i64, order_id: i64) -> Self {
        self.shop_id = shop_id;
        self.order_id = order_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_key: i64,
    pub user_id: i64,
    pub coupon_id: i64,
    pub receive_date: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub price_limit: Option<i64>,
    pub coupon_amount: Option<i64>,
    pub coupon_status: Option<i64>,
}

impl Receipt {
    /// True when the validity span cannot be used for matching: any of the
    /// three dates is null or the span is inverted.
    pub fn has_invalid_span(&self) -> bool {
        match (self.receive_date, self.start_date, self.end_date) {
            (Some(_), Some(start), Some(end)) => start > end,
            _ => true,
        }
    }

    pub fn window(&self, short_window_days: u32) -> ReceiptWindow {
        ReceiptWindow::for_receipt(self, short_window_days)
    }
}

/// Effective usage windows derived from a receipt's dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptWindow {
    pub start_eff: Option<NaiveDate>,
    pub end_eff: Option<NaiveDate>,
    pub short_end: Option<NaiveDate>,
}

impl ReceiptWindow {
    pub fn for_receipt(receipt: &Receipt, short_window_days: u32) -> Self {
        let start_eff = match (receipt.receive_date, receipt.start_date) {
            (Some(receive), Some(start)) => Some(receive.max(start)),
            _ => None,
        };
        let end_eff = receipt.end_date;
        let short_end = match (receipt.end_date, receipt.receive_date) {
            (Some(end), Some(receive)) => {
                let horizon = receive
                    .checked_add_days(Days::new(u64::from(short_window_days)))
                    .unwrap_or(NaiveDate::MAX);
                Some(end.min(horizon))
            }
            _ => None,
        };

        Self {
            start_eff,
            end_eff,
            short_end,
        }
    }

    /// Inclusive full-horizon bounds, when both ends are known.
    pub fn full_horizon(&self) -> Option<(NaiveDate, NaiveDate)> {
        Some((self.start_eff?, self.end_eff?))
    }

    /// Inclusive short-term bounds, when both ends are known.
    pub fn short_term(&self) -> Option<(NaiveDate, NaiveDate)> {
        Some((self.start_eff?, self.short_end?))
    }

    pub fn covers(&self, day: NaiveDate) -> bool {
        self.full_horizon()
            .map(|(start, end)| start <= day && day <= end)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub user_id: i64,
    pub visit_date: Option<NaiveDate>,
}

/// A transaction after coupon-id reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledTransaction {
    pub txn: Transaction,
    pub coupon_id_imputed: bool,
    pub flag_no_coupon: bool,
    pub flag_ambiguous_txn: bool,
}

impl ReconciledTransaction {
    pub fn unchanged(txn: Transaction) -> Self {
        Self {
            txn,
            coupon_id_imputed: false,
            flag_no_coupon: false,
            flag_ambiguous_txn: false,
        }
    }
}

/// One row per receipt produced by the label builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub receipt_key: i64,
    pub user_id: i64,
    pub coupon_id: i64,
    pub receive_date: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub start_eff: Option<NaiveDate>,
    pub end_eff: Option<NaiveDate>,
    pub short_end: Option<NaiveDate>,
    pub coupon_status: Option<i64>,
    pub coupon_amount: Option<i64>,
    pub price_limit: Option<i64>,
    pub label_same_user_fh: bool,
    pub label_same_user_st: bool,
    pub first_valid_txn_key: Option<i64>,
    pub first_valid_txn_time: Option<NaiveDate>,
    pub same_user_valid_txn_count: u64,
    pub same_user_early_txn_count: u64,
    pub same_user_late_txn_count: u64,
    pub other_user_in_window_txn_count: u64,
    pub other_user_without_own_receipt_txn_count: u64,
    pub flag_early: bool,
    pub flag_late: bool,
    pub flag_cross_user: bool,
    pub flag_struc_invalid: bool,
}

impl LabelRecord {
    pub fn label_valid(&self) -> bool {
        !(self.flag_early || self.flag_late || self.flag_cross_user || self.flag_struc_invalid)
    }

    pub fn label_invalid(&self) -> bool {
        !self.label_valid()
    }
}

pub fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}
