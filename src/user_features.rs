//! Per-user historical features: outcome rates over the user's earlier
//! receipts, spend and discount ratios over earlier orders, and purchase
//! and visit frequencies.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::features::{
    validate_lookback_days, FeatureColumn, FeatureDType, FeatureError, FeatureSchema,
    DEFAULT_LOOKBACK_DAYS,
};
use crate::model::{is_missing_id, LabelRecord, Transaction, Visit};
use crate::reconcile::first_duplicate_key;
use crate::rolling::{outcomes, round3, CumulativeTable, OutcomeRates};
use crate::table::{fmt_flag, fmt_rate};

const ORDERS: usize = 0;
const SPEND: usize = 1;
const REDUCE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFeatureConfig {
    pub lookback_days: Vec<u32>,
}

impl Default for UserFeatureConfig {
    fn default() -> Self {
        Self {
            lookback_days: DEFAULT_LOOKBACK_DAYS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserTxnWindow {
    pub lookback_days: u32,
    pub no_history: bool,
    pub rt_avgspend_vs_pricelimit: f64,
    pub rt_avgreduce_vs_couponamt: f64,
    pub freq_purchase: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserVisitWindow {
    pub lookback_days: u32,
    pub no_history: bool,
    pub freq_visit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFeatureRow {
    pub receipt_key: i64,
    pub receipts: Vec<OutcomeRates>,
    pub txns: Vec<UserTxnWindow>,
    pub visits: Vec<UserVisitWindow>,
}

impl UserFeatureRow {
    /// Cells in [`build_user_feature_schema`] header order.
    pub fn cells(&self) -> Vec<String> {
        let mut cells = vec![self.receipt_key.to_string()];
        for w in &self.receipts {
            cells.push(fmt_flag(w.no_history));
            cells.push(fmt_rate(w.rate_invalid));
            cells.push(fmt_rate(w.rate_fh_redeem));
            cells.push(fmt_rate(w.rate_st_redeem));
        }
        for w in &self.txns {
            cells.push(fmt_flag(w.no_history));
            cells.push(fmt_rate(w.rt_avgspend_vs_pricelimit));
            cells.push(fmt_rate(w.rt_avgreduce_vs_couponamt));
            cells.push(fmt_rate(w.freq_purchase));
        }
        for w in &self.visits {
            cells.push(fmt_flag(w.no_history));
            cells.push(fmt_rate(w.freq_visit));
        }
        cells
    }
}

pub fn build_user_feature_schema(cfg: &UserFeatureConfig) -> FeatureSchema {
    let mut columns = Vec::new();
    for w in &cfg.lookback_days {
        columns.push(FeatureColumn::new(
            format!("no_history_receipts_indicator_{w}d"),
            FeatureDType::Bool,
        ));
        columns.push(FeatureColumn::new(
            format!("rate_same_user_invalid_{w}d"),
            FeatureDType::F64,
        ));
        columns.push(FeatureColumn::new(
            format!("rate_same_user_fh_redeem_{w}d"),
            FeatureDType::F64,
        ));
        columns.push(FeatureColumn::new(
            format!("rate_same_user_st_redeem_{w}d"),
            FeatureDType::F64,
        ));
    }
    for w in &cfg.lookback_days {
        columns.push(FeatureColumn::new(
            format!("no_history_txns_indicator_{w}d"),
            FeatureDType::Bool,
        ));
        columns.push(FeatureColumn::new(
            format!("rt_avgspend_vs_pricelimit_{w}d"),
            FeatureDType::F64,
        ));
        columns.push(FeatureColumn::new(
            format!("rt_avgreduce_vs_couponamt_{w}d"),
            FeatureDType::F64,
        ));
        columns.push(FeatureColumn::new(format!("freq_purchase_{w}d"), FeatureDType::F64));
    }
    for w in &cfg.lookback_days {
        columns.push(FeatureColumn::new(
            format!("no_history_visits_indicator_{w}d"),
            FeatureDType::Bool,
        ));
        columns.push(FeatureColumn::new(format!("freq_visit_{w}d"), FeatureDType::F64));
    }

    FeatureSchema::new("user", &cfg.lookback_days, columns)
}

pub fn build_user_features(
    records: &[LabelRecord],
    transactions: &[Transaction],
    visits: &[Visit],
    cfg: &UserFeatureConfig,
) -> Result<(FeatureSchema, Vec<UserFeatureRow>), FeatureError> {
    validate_lookback_days(&cfg.lookback_days)?;
    if let Some(key) = first_duplicate_key(records.iter().map(|r| r.receipt_key)) {
        return Err(FeatureError::DuplicateKey(key));
    }

    info!(
        component = "user_features",
        event = "user_features.start",
        receipts = records.len(),
        transactions = transactions.len(),
        visits = visits.len(),
        lookback_days = ?cfg.lookback_days
    );

    let schema = build_user_feature_schema(cfg);
    let receipt_table = outcomes::table(records, |record| record.user_id);
    let orders = collapse_orders(transactions);
    let order_count = orders.len();
    let order_table: CumulativeTable<i64, 3> = CumulativeTable::build(orders);
    let visit_table: CumulativeTable<i64, 1> = CumulativeTable::build(
        visits
            .iter()
            .map(|visit| (visit.user_id, visit.visit_date, [1])),
    );

    let rows: Vec<UserFeatureRow> = records
        .iter()
        .map(|record| {
            let user = record.user_id;
            let as_of = record.receive_date;
            UserFeatureRow {
                receipt_key: record.receipt_key,
                receipts: cfg
                    .lookback_days
                    .iter()
                    .map(|w| outcomes::rates(*w, &receipt_table.window(&user, as_of, *w)))
                    .collect(),
                txns: cfg
                    .lookback_days
                    .iter()
                    .map(|w| txn_window(record, *w, &order_table))
                    .collect(),
                visits: cfg
                    .lookback_days
                    .iter()
                    .map(|w| {
                        let window = visit_table.window(&user, as_of, *w);
                        UserVisitWindow {
                            lookback_days: *w,
                            no_history: window.no_history(),
                            freq_visit: frequency(window.counts[0], *w),
                        }
                    })
                    .collect(),
            }
        })
        .collect();

    info!(
        component = "user_features",
        event = "user_features.finish",
        rows = rows.len(),
        orders = order_count,
        users_with_receipts = receipt_table.partition_count()
    );

    Ok((schema, rows))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum OrderRef {
    Order(i64),
    Single(i64),
}

#[derive(Debug, Clone, Copy)]
struct OrderTotals {
    spend: Option<i64>,
    reduce: i64,
}

/// One event per order: `[1, spend, discount]` on the order's pay date.
/// Spend comes from the lowest-keyed transaction of the order; discounts
/// are summed. A transaction without an order id is its own order.
fn collapse_orders(transactions: &[Transaction]) -> Vec<(i64, Option<NaiveDate>, [i64; 3])> {
    let mut sorted: Vec<&Transaction> = transactions.iter().filter(|t| t.pay_date.is_some()).collect();
    sorted.sort_by_key(|t| t.txn_key);

    let mut orders: BTreeMap<(i64, NaiveDate, OrderRef), OrderTotals> = BTreeMap::new();
    for txn in sorted {
        let Some(pay_date) = txn.pay_date else {
            continue;
        };
        let order = if is_missing_id(txn.order_id) {
            OrderRef::Single(txn.txn_key)
        } else {
            OrderRef::Order(txn.order_id)
        };
        let totals = orders
            .entry((txn.user_id, pay_date, order))
            .or_insert(OrderTotals {
                spend: txn.actual_pay,
                reduce: 0,
            });
        totals.reduce += txn.reduce_amount.unwrap_or(0);
    }

    orders
        .into_iter()
        .map(|((user, day, _), totals)| {
            let mut values = [0i64; 3];
            values[ORDERS] = 1;
            values[SPEND] = totals.spend.unwrap_or(0);
            values[REDUCE] = totals.reduce;
            (user, Some(day), values)
        })
        .collect()
}

fn txn_window(record: &LabelRecord, w: u32, table: &CumulativeTable<i64, 3>) -> UserTxnWindow {
    let window = table.window(&record.user_id, record.receive_date, w);
    let orders = window.counts[ORDERS];

    UserTxnWindow {
        lookback_days: w,
        no_history: window.no_history(),
        rt_avgspend_vs_pricelimit: average_ratio(window.counts[SPEND], orders, record.price_limit),
        rt_avgreduce_vs_couponamt: average_ratio(window.counts[REDUCE], orders, record.coupon_amount),
        freq_purchase: frequency(orders, w),
    }
}

/// `total / orders / (reference + 1)`, 0.0 without orders or a usable reference.
fn average_ratio(total: i64, orders: i64, reference: Option<i64>) -> f64 {
    if orders == 0 {
        return 0.0;
    }
    match reference {
        Some(r) if r + 1 != 0 => round3(total as f64 / orders as f64 / (r + 1) as f64),
        _ => 0.0,
    }
}

fn frequency(count: i64, w: u32) -> f64 {
    round3(count as f64 / f64::from(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(raw: &str) -> Option<NaiveDate> {
        raw.parse().ok()
    }

    #[test]
    fn orders_take_first_spend_and_sum_discounts() {
        let txns = vec![
            Transaction::new(3, 1, 9001, day("2023-01-02"), Some(50), Some(999)).with_order(7, 100),
            Transaction::new(2, 1, 9002, day("2023-01-02"), Some(30), Some(1000)).with_order(7, 100),
            Transaction::new(4, 1, 9003, day("2023-01-02"), None, Some(200)),
            Transaction::new(5, 1, 9004, day("2023-01-02"), Some(10), Some(300)),
            Transaction::new(6, 1, 9004, None, Some(10), Some(300)),
        ];
        let orders = collapse_orders(&txns);

        assert_eq!(orders.len(), 3);
        let by_spend: Vec<[i64; 3]> = orders.iter().map(|(_, _, v)| *v).collect();
        assert!(by_spend.contains(&[1, 1000, 80]));
        assert!(by_spend.contains(&[1, 200, 0]));
        assert!(by_spend.contains(&[1, 300, 10]));
    }

    #[test]
    fn average_ratio_guards_zero_orders_and_unknown_reference() {
        assert_eq!(average_ratio(1000, 0, Some(10)), 0.0);
        assert_eq!(average_ratio(1000, 2, None), 0.0);
        assert_eq!(average_ratio(1000, 2, Some(999)), 0.5);
    }

    #[test]
    fn frequency_divides_by_lookback_length() {
        assert_eq!(frequency(3, 7), 0.429);
        assert_eq!(frequency(0, 7), 0.0);
        assert_eq!(frequency(14, 7), 2.0);
    }

    #[test]
    fn schema_groups_receipt_txn_and_visit_columns() {
        let schema = build_user_feature_schema(&UserFeatureConfig {
            lookback_days: vec![7],
        });
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "no_history_receipts_indicator_7d",
                "rate_same_user_invalid_7d",
                "rate_same_user_fh_redeem_7d",
                "rate_same_user_st_redeem_7d",
                "no_history_txns_indicator_7d",
                "rt_avgspend_vs_pricelimit_7d",
                "rt_avgreduce_vs_couponamt_7d",
                "freq_purchase_7d",
                "no_history_visits_indicator_7d",
                "freq_visit_7d",
            ]
        );
    }
}
