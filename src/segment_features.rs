//! Coupon-segment features: bins, descriptive markers, and historical
//! invalidity/redemption rates of the receipt's segment.

use std::collections::BTreeSet;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::features::{
    validate_lookback_days, FeatureColumn, FeatureDType, FeatureError, FeatureSchema,
    DEFAULT_LOOKBACK_DAYS,
};
use crate::model::{ymd, LabelRecord};
use crate::reconcile::first_duplicate_key;
use crate::rolling::{outcomes, OutcomeRates};
use crate::table::{fmt_date, fmt_flag, fmt_opt, fmt_opt_flag, fmt_rate};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentBinConfig {
    pub price_limit_splits: [i64; 2],
    pub coupon_amount_splits: [i64; 2],
    pub expiry_span_split_days: u32,
}

impl Default for SegmentBinConfig {
    fn default() -> Self {
        Self {
            price_limit_splits: [1_000, 10_000],
            coupon_amount_splits: [1_000, 10_000],
            expiry_span_split_days: 10,
        }
    }
}

/// Adjusted public holidays and weekend workdays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolidayCalendar {
    pub holidays: BTreeSet<NaiveDate>,
    pub workdays: BTreeSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn new(
        holidays: impl IntoIterator<Item = NaiveDate>,
        workdays: impl IntoIterator<Item = NaiveDate>,
    ) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
            workdays: workdays.into_iter().collect(),
        }
    }

    /// Mainland China, 2023.
    pub fn china_2023() -> Self {
        let holidays = [
            (1, 1),
            (1, 2),
            (1, 21),
            (1, 22),
            (1, 23),
            (1, 24),
            (1, 25),
            (1, 26),
            (1, 27),
            (4, 5),
            (4, 29),
            (4, 30),
            (5, 1),
            (5, 2),
            (5, 3),
            (6, 22),
            (6, 23),
            (6, 24),
        ];
        let workdays = [(1, 28), (1, 29), (4, 23), (5, 6), (6, 25)];

        Self::new(
            holidays.iter().filter_map(|(m, d)| ymd(2023, *m, *d)),
            workdays.iter().filter_map(|(m, d)| ymd(2023, *m, *d)),
        )
    }

    pub fn is_holiday(&self, day: NaiveDate) -> bool {
        self.holidays.contains(&day)
    }

    pub fn is_workday(&self, day: NaiveDate) -> bool {
        self.workdays.contains(&day)
    }
}

impl Default for HolidayCalendar {
    fn default() -> Self {
        Self::china_2023()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFeatureConfig {
    pub lookback_days: Vec<u32>,
    pub bins: SegmentBinConfig,
    pub calendar: HolidayCalendar,
}

impl Default for SegmentFeatureConfig {
    fn default() -> Self {
        Self {
            lookback_days: DEFAULT_LOOKBACK_DAYS.to_vec(),
            bins: SegmentBinConfig::default(),
            calendar: HolidayCalendar::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub price_limit_bin: i8,
    pub coupon_limit_bin: i8,
    pub expiry_span_bin: i8,
}

impl SegmentKey {
    pub fn for_record(record: &LabelRecord, bins: &SegmentBinConfig) -> Self {
        Self {
            price_limit_bin: amount_bin(record.price_limit, bins.price_limit_splits),
            coupon_limit_bin: amount_bin(record.coupon_amount, bins.coupon_amount_splits),
            expiry_span_bin: expiry_span_bin(
                record.start_date,
                record.end_date,
                bins.expiry_span_split_days,
            ),
        }
    }
}

/// 0 up to the first split, 1 up to the second, 2 above; unknown falls in 2.
pub fn amount_bin(value: Option<i64>, splits: [i64; 2]) -> i8 {
    match value {
        Some(v) if v <= splits[0] => 0,
        Some(v) if v <= splits[1] => 1,
        _ => 2,
    }
}

/// 0 for spans of at most `split_days`, 1 for longer ones, -1 when the span
/// is unknown or inverted.
pub fn expiry_span_bin(start: Option<NaiveDate>, end: Option<NaiveDate>, split_days: u32) -> i8 {
    let (Some(start), Some(end)) = (start, end) else {
        return -1;
    };
    let Some(limit) = start.checked_add_days(Days::new(u64::from(split_days))) else {
        return -1;
    };
    if start <= end && end <= limit {
        0
    } else if end > limit {
        1
    } else {
        -1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFeatureRow {
    pub receipt_key: i64,
    pub receive_date: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub price_limit: Option<i64>,
    pub coupon_amount: Option<i64>,
    pub segment: SegmentKey,
    pub generosity_ratio: Option<f64>,
    pub start_before_receive_marker: Option<bool>,
    pub end_before_receive_marker: Option<bool>,
    pub weekday_marker: bool,
    pub workday_marker: bool,
    pub holiday_marker: bool,
    pub label_invalid: bool,
    pub label_same_user_fh: bool,
    pub label_same_user_st: bool,
    pub windows: Vec<OutcomeRates>,
}

impl SegmentFeatureRow {
    pub fn window(&self, lookback_days: u32) -> Option<&OutcomeRates> {
        self.windows
            .iter()
            .find(|w| w.lookback_days == lookback_days)
    }

    /// Cells in [`build_segment_feature_schema`] header order.
    pub fn cells(&self) -> Vec<String> {
        let mut cells = vec![
            self.receipt_key.to_string(),
            fmt_date(self.receive_date),
            fmt_date(self.start_date),
            fmt_date(self.end_date),
            fmt_opt(self.price_limit),
            fmt_opt(self.coupon_amount),
            self.segment.price_limit_bin.to_string(),
            self.segment.coupon_limit_bin.to_string(),
            self.segment.expiry_span_bin.to_string(),
            fmt_opt(self.generosity_ratio),
            fmt_opt_flag(self.start_before_receive_marker),
            fmt_opt_flag(self.end_before_receive_marker),
            fmt_flag(self.weekday_marker),
            fmt_flag(self.workday_marker),
            fmt_flag(self.holiday_marker),
            fmt_flag(self.label_invalid),
            fmt_flag(self.label_same_user_fh),
            fmt_flag(self.label_same_user_st),
        ];
        for window in &self.windows {
            cells.push(fmt_flag(window.no_history));
            cells.push(fmt_rate(window.rate_invalid));
            cells.push(fmt_rate(window.rate_fh_redeem));
            cells.push(fmt_rate(window.rate_st_redeem));
        }
        cells
    }
}

pub fn build_segment_feature_schema(cfg: &SegmentFeatureConfig) -> FeatureSchema {
    let mut columns = vec![
        FeatureColumn::new("receive_date", FeatureDType::Date),
        FeatureColumn::new("start_date", FeatureDType::Date),
        FeatureColumn::new("end_date", FeatureDType::Date),
        FeatureColumn::new("price_limit", FeatureDType::I64),
        FeatureColumn::new("coupon_amount", FeatureDType::I64),
        FeatureColumn::new("price_limit_bin", FeatureDType::I64),
        FeatureColumn::new("coupon_limit_bin", FeatureDType::I64),
        FeatureColumn::new("expiry_span_bin", FeatureDType::I64),
        FeatureColumn::new("generosity_ratio", FeatureDType::F64),
        FeatureColumn::new("start_before_receive_marker", FeatureDType::Bool),
        FeatureColumn::new("end_before_receive_marker", FeatureDType::Bool),
        FeatureColumn::new("weekday_marker", FeatureDType::Bool),
        FeatureColumn::new("workday_marker", FeatureDType::Bool),
        FeatureColumn::new("holiday_marker", FeatureDType::Bool),
        FeatureColumn::new("label_invalid", FeatureDType::Bool),
        FeatureColumn::new("label_same_user_fh", FeatureDType::Bool),
        FeatureColumn::new("label_same_user_st", FeatureDType::Bool),
    ];
    for w in &cfg.lookback_days {
        columns.push(FeatureColumn::new(
            format!("no_history_indicator_{w}d"),
            FeatureDType::Bool,
        ));
        columns.push(FeatureColumn::new(format!("rate_invalid_{w}d"), FeatureDType::F64));
        columns.push(FeatureColumn::new(format!("rate_fh_redeem_{w}d"), FeatureDType::F64));
        columns.push(FeatureColumn::new(format!("rate_st_redeem_{w}d"), FeatureDType::F64));
    }

    FeatureSchema::new("segment", &cfg.lookback_days, columns)
}

/// One feature row per labelled receipt, in input order.
pub fn build_segment_features(
    records: &[LabelRecord],
    cfg: &SegmentFeatureConfig,
) -> Result<(FeatureSchema, Vec<SegmentFeatureRow>), FeatureError> {
    validate_lookback_days(&cfg.lookback_days)?;
    if let Some(key) = first_duplicate_key(records.iter().map(|r| r.receipt_key)) {
        return Err(FeatureError::DuplicateKey(key));
    }

    info!(
        component = "segment_features",
        event = "segment_features.start",
        receipts = records.len(),
        lookback_days = ?cfg.lookback_days
    );

    let schema = build_segment_feature_schema(cfg);
    let table = outcomes::table(records, |record| SegmentKey::for_record(record, &cfg.bins));

    let rows: Vec<SegmentFeatureRow> = records
        .iter()
        .map(|record| {
            let segment = SegmentKey::for_record(record, &cfg.bins);
            let windows = cfg
                .lookback_days
                .iter()
                .map(|w| outcomes::rates(*w, &table.window(&segment, record.receive_date, *w)))
                .collect();
            describe(record, segment, &cfg.calendar, windows)
        })
        .collect();

    info!(
        component = "segment_features",
        event = "segment_features.finish",
        rows = rows.len(),
        segments = table.partition_count()
    );

    Ok((schema, rows))
}

fn describe(
    record: &LabelRecord,
    segment: SegmentKey,
    calendar: &HolidayCalendar,
    windows: Vec<OutcomeRates>,
) -> SegmentFeatureRow {
    let receive = record.receive_date;

    SegmentFeatureRow {
        receipt_key: record.receipt_key,
        receive_date: receive,
        start_date: record.start_date,
        end_date: record.end_date,
        price_limit: record.price_limit,
        coupon_amount: record.coupon_amount,
        segment,
        generosity_ratio: generosity_ratio(record.coupon_amount, record.price_limit),
        start_before_receive_marker: before_marker(record.start_date, receive),
        end_before_receive_marker: before_marker(record.end_date, receive),
        weekday_marker: receive.map(is_weekday).unwrap_or(false),
        workday_marker: receive.map(|d| calendar.is_workday(d)).unwrap_or(false),
        holiday_marker: receive.map(|d| calendar.is_holiday(d)).unwrap_or(false),
        label_invalid: record.label_invalid(),
        label_same_user_fh: record.label_same_user_fh,
        label_same_user_st: record.label_same_user_st,
        windows,
    }
}

/// `coupon_amount / (price_limit + 1)`.
pub fn generosity_ratio(coupon_amount: Option<i64>, price_limit: Option<i64>) -> Option<f64> {
    let amount = coupon_amount?;
    let denominator = price_limit? + 1;
    (denominator != 0).then(|| amount as f64 / denominator as f64)
}

fn before_marker(day: Option<NaiveDate>, receive: Option<NaiveDate>) -> Option<bool> {
    Some(day? < receive?)
}

fn is_weekday(day: NaiveDate) -> bool {
    !matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}
