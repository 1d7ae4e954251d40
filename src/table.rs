//! CSV boundary for every stage: typed readers with up-front column checks
//! and atomic writers.
//!
//! Empty cells are nulls. Identifier columns map an empty cell to the
//! missing-id sentinel. Dates are `YYYY-MM-DD`; a trailing time part is
//! accepted and dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{LabelRecord, Receipt, ReconciledTransaction, Transaction, Visit, MISSING_ID};
use crate::txn_flags::TXN_FLAG_COLUMNS;

pub const TRANSACTION_REQUIRED_COLUMNS: [&str; 6] = [
    "txn_key",
    "user_id",
    "coupon_id",
    "pay_date",
    "reduce_amount",
    "actual_pay",
];

const TRANSACTION_OPTIONAL_COLUMNS: [&str; 4] = ["shop_id", "order_id", "coupon_type", "biz_code"];

pub const RECONCILE_FLAG_COLUMNS: [&str; 3] =
    ["coupon_id_imputed", "flag_no_coupon", "flag_ambiguous_txn"];

pub const RECEIPT_REQUIRED_COLUMNS: [&str; 9] = [
    "receipt_key",
    "user_id",
    "coupon_id",
    "receive_date",
    "start_date",
    "end_date",
    "price_limit",
    "coupon_amount",
    "coupon_status",
];

pub const VISIT_REQUIRED_COLUMNS: [&str; 2] = ["user_id", "visit_date"];

pub const LABEL_COLUMNS: [&str; 27] = [
    "receipt_key",
    "user_id",
    "coupon_id",
    "receive_date",
    "start_date",
    "end_date",
    "start_eff",
    "end_eff",
    "short_end",
    "coupon_status",
    "coupon_amount",
    "price_limit",
    "label_same_user_fh",
    "label_same_user_st",
    "label_valid",
    "label_invalid",
    "first_valid_txn_key",
    "first_valid_txn_time",
    "same_user_valid_txn_count",
    "same_user_early_txn_count",
    "same_user_late_txn_count",
    "other_user_in_window_txn_count",
    "other_user_without_own_receipt_txn_count",
    "flag_early",
    "flag_late",
    "flag_cross_user",
    "flag_struc_invalid",
];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{table} table is missing required columns: {missing:?}")]
    MissingColumns {
        table: &'static str,
        missing: Vec<String>,
    },
    #[error("{table} line {line}: failed to parse field {field} value '{value}'")]
    ParseField {
        table: &'static str,
        line: u64,
        field: String,
        value: String,
    },
    #[error("invalid output path: {0}")]
    InvalidPath(PathBuf),
}

/// Column positions of one CSV header, validated against a required set.
struct HeaderIndex {
    table: &'static str,
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl HeaderIndex {
    fn new(
        table: &'static str,
        headers: &StringRecord,
        required: &[&str],
    ) -> Result<Self, TableError> {
        let names: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
        let positions: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let missing: Vec<String> = required
            .iter()
            .filter(|name| !positions.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(TableError::MissingColumns { table, missing });
        }

        Ok(Self {
            table,
            names,
            positions,
        })
    }

    fn row<'a>(&'a self, record: &'a StringRecord) -> Row<'a> {
        Row {
            index: self,
            record,
            line: record.position().map(|p| p.line()).unwrap_or(0),
        }
    }
}

struct Row<'a> {
    index: &'a HeaderIndex,
    record: &'a StringRecord,
    line: u64,
}

impl<'a> Row<'a> {
    fn raw(&self, field: &str) -> Option<&'a str> {
        let idx = *self.index.positions.get(field)?;
        let value = self.record.get(idx)?.trim();
        (!value.is_empty()).then_some(value)
    }

    fn parse_error(&self, field: &str, value: &str) -> TableError {
        TableError::ParseField {
            table: self.index.table,
            line: self.line,
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    fn opt_i64(&self, field: &str) -> Result<Option<i64>, TableError> {
        let Some(value) = self.raw(field) else {
            return Ok(None);
        };
        if let Ok(parsed) = value.parse::<i64>() {
            return Ok(Some(parsed));
        }
        // Integral floats such as "1000.0" come out of upstream float columns.
        match value.parse::<f64>() {
            Ok(parsed) if parsed.fract() == 0.0 && fits_i64(parsed) => Ok(Some(parsed as i64)),
            _ => Err(self.parse_error(field, value)),
        }
    }

    fn id(&self, field: &str) -> Result<i64, TableError> {
        Ok(self.opt_i64(field)?.unwrap_or(MISSING_ID))
    }

    fn key(&self, field: &str) -> Result<i64, TableError> {
        self.opt_i64(field)?
            .ok_or_else(|| self.parse_error(field, ""))
    }

    fn count(&self, field: &str) -> Result<u64, TableError> {
        let value = self.raw(field).unwrap_or("0");
        value
            .parse::<u64>()
            .map_err(|_| self.parse_error(field, value))
    }

    fn date(&self, field: &str) -> Result<Option<NaiveDate>, TableError> {
        let Some(value) = self.raw(field) else {
            return Ok(None);
        };
        let day_part = value.split([' ', 'T']).next().unwrap_or(value);
        NaiveDate::parse_from_str(day_part, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| self.parse_error(field, value))
    }

    fn flag(&self, field: &str) -> Result<bool, TableError> {
        Ok(self.opt_flag(field)?.unwrap_or(false))
    }

    fn opt_flag(&self, field: &str) -> Result<Option<bool>, TableError> {
        let Some(value) = self.raw(field) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "1.0" | "true" => Ok(Some(true)),
            "0" | "0.0" | "false" => Ok(Some(false)),
            _ => Err(self.parse_error(field, value)),
        }
    }

    fn text(&self, field: &str) -> Option<String> {
        self.raw(field).map(str::to_string)
    }
}

// `i64::MAX as f64` rounds up to 2^63, which is itself out of range.
fn fits_i64(value: f64) -> bool {
    value >= i64::MIN as f64 && value < i64::MAX as f64
}

fn open_reader(path: &Path) -> Result<csv::Reader<fs::File>, TableError> {
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?)
}

pub fn read_transactions(path: &Path) -> Result<Vec<Transaction>, TableError> {
    let mut reader = open_reader(path)?;
    let index = HeaderIndex::new("transactions", reader.headers()?, &TRANSACTION_REQUIRED_COLUMNS)?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        out.push(parse_transaction(&index.row(&record))?);
    }

    info!(
        component = "table",
        event = "table.read",
        table = "transactions",
        path = %path.display(),
        rows = out.len()
    );
    Ok(out)
}

pub fn read_reconciled_transactions(path: &Path) -> Result<Vec<ReconciledTransaction>, TableError> {
    let mut reader = open_reader(path)?;
    let required: Vec<&str> = TRANSACTION_REQUIRED_COLUMNS
        .iter()
        .chain(RECONCILE_FLAG_COLUMNS.iter())
        .copied()
        .collect();
    let index = HeaderIndex::new("reconciled_transactions", reader.headers()?, &required)?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = index.row(&record);
        out.push(ReconciledTransaction {
            txn: parse_transaction(&row)?,
            coupon_id_imputed: row.flag("coupon_id_imputed")?,
            flag_no_coupon: row.flag("flag_no_coupon")?,
            flag_ambiguous_txn: row.flag("flag_ambiguous_txn")?,
        });
    }

    info!(
        component = "table",
        event = "table.read",
        table = "reconciled_transactions",
        path = %path.display(),
        rows = out.len()
    );
    Ok(out)
}

/// Columns the writers derive again on output; never carried as passthrough.
fn is_derived_column(name: &str) -> bool {
    RECONCILE_FLAG_COLUMNS.contains(&name) || TXN_FLAG_COLUMNS.contains(&name)
}

fn parse_transaction(row: &Row<'_>) -> Result<Transaction, TableError> {
    let mut passthrough = BTreeMap::new();
    for (idx, name) in row.index.names.iter().enumerate() {
        let known = TRANSACTION_REQUIRED_COLUMNS.contains(&name.as_str())
            || TRANSACTION_OPTIONAL_COLUMNS.contains(&name.as_str())
            || is_derived_column(name);
        if !known {
            let value = row.record.get(idx).unwrap_or("").to_string();
            passthrough.insert(name.clone(), value);
        }
    }

    Ok(Transaction {
        txn_key: row.key("txn_key")?,
        user_id: row.id("user_id")?,
        coupon_id: row.id("coupon_id")?,
        pay_date: row.date("pay_date")?,
        reduce_amount: row.opt_i64("reduce_amount")?,
        actual_pay: row.opt_i64("actual_pay")?,
        shop_id: row.id("shop_id")?,
        order_id: row.id("order_id")?,
        coupon_type: row.opt_i64("coupon_type")?,
        biz_code: row.text("biz_code"),
        passthrough,
    })
}

pub fn read_receipts(path: &Path) -> Result<Vec<Receipt>, TableError> {
    let mut reader = open_reader(path)?;
    let index = HeaderIndex::new("receipts", reader.headers()?, &RECEIPT_REQUIRED_COLUMNS)?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = index.row(&record);
        out.push(Receipt {
            receipt_key: row.key("receipt_key")?,
            user_id: row.id("user_id")?,
            coupon_id: row.id("coupon_id")?,
            receive_date: row.date("receive_date")?,
            start_date: row.date("start_date")?,
            end_date: row.date("end_date")?,
            price_limit: row.opt_i64("price_limit")?,
            coupon_amount: row.opt_i64("coupon_amount")?,
            coupon_status: row.opt_i64("coupon_status")?,
        });
    }

    info!(
        component = "table",
        event = "table.read",
        table = "receipts",
        path = %path.display(),
        rows = out.len()
    );
    Ok(out)
}

pub fn read_visits(path: &Path) -> Result<Vec<Visit>, TableError> {
    let mut reader = open_reader(path)?;
    let index = HeaderIndex::new("visits", reader.headers()?, &VISIT_REQUIRED_COLUMNS)?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = index.row(&record);
        out.push(Visit {
            user_id: row.id("user_id")?,
            visit_date: row.date("visit_date")?,
        });
    }

    info!(
        component = "table",
        event = "table.read",
        table = "visits",
        path = %path.display(),
        rows = out.len()
    );
    Ok(out)
}

pub fn read_label_records(path: &Path) -> Result<Vec<LabelRecord>, TableError> {
    let mut reader = open_reader(path)?;
    let required: Vec<&str> = LABEL_COLUMNS
        .iter()
        .copied()
        .filter(|name| *name != "label_valid" && *name != "label_invalid")
        .collect();
    let index = HeaderIndex::new("labels", reader.headers()?, &required)?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = index.row(&record);
        out.push(LabelRecord {
            receipt_key: row.key("receipt_key")?,
            user_id: row.id("user_id")?,
            coupon_id: row.id("coupon_id")?,
            receive_date: row.date("receive_date")?,
            start_date: row.date("start_date")?,
            end_date: row.date("end_date")?,
            start_eff: row.date("start_eff")?,
            end_eff: row.date("end_eff")?,
            short_end: row.date("short_end")?,
            coupon_status: row.opt_i64("coupon_status")?,
            coupon_amount: row.opt_i64("coupon_amount")?,
            price_limit: row.opt_i64("price_limit")?,
            label_same_user_fh: row.flag("label_same_user_fh")?,
            label_same_user_st: row.flag("label_same_user_st")?,
            first_valid_txn_key: row.opt_i64("first_valid_txn_key")?,
            first_valid_txn_time: row.date("first_valid_txn_time")?,
            same_user_valid_txn_count: row.count("same_user_valid_txn_count")?,
            same_user_early_txn_count: row.count("same_user_early_txn_count")?,
            same_user_late_txn_count: row.count("same_user_late_txn_count")?,
            other_user_in_window_txn_count: row.count("other_user_in_window_txn_count")?,
            other_user_without_own_receipt_txn_count: row
                .count("other_user_without_own_receipt_txn_count")?,
            flag_early: row.flag("flag_early")?,
            flag_late: row.flag("flag_late")?,
            flag_cross_user: row.flag("flag_cross_user")?,
            flag_struc_invalid: row.flag("flag_struc_invalid")?,
        });
    }

    info!(
        component = "table",
        event = "table.read",
        table = "labels",
        path = %path.display(),
        rows = out.len()
    );
    Ok(out)
}

/// Header for transaction tables: base columns, then every passthrough
/// column seen in any row, then `extra`.
pub(crate) fn transaction_header<'a>(
    txns: impl IntoIterator<Item = &'a Transaction>,
    extra: &[&str],
) -> (Vec<String>, Vec<String>) {
    let passthrough: BTreeSet<String> = txns
        .into_iter()
        .flat_map(|t| t.passthrough.keys().cloned())
        .filter(|name| !extra.contains(&name.as_str()) && !is_derived_column(name))
        .collect();
    let passthrough: Vec<String> = passthrough.into_iter().collect();

    let header = TRANSACTION_REQUIRED_COLUMNS
        .iter()
        .chain(TRANSACTION_OPTIONAL_COLUMNS.iter())
        .map(|name| name.to_string())
        .chain(passthrough.iter().cloned())
        .chain(extra.iter().map(|name| name.to_string()))
        .collect();
    (header, passthrough)
}

pub(crate) fn transaction_cells(txn: &Transaction, passthrough: &[String]) -> Vec<String> {
    let mut cells = vec![
        txn.txn_key.to_string(),
        txn.user_id.to_string(),
        txn.coupon_id.to_string(),
        fmt_date(txn.pay_date),
        fmt_opt(txn.reduce_amount),
        fmt_opt(txn.actual_pay),
        txn.shop_id.to_string(),
        txn.order_id.to_string(),
        fmt_opt(txn.coupon_type),
        txn.biz_code.clone().unwrap_or_default(),
    ];
    cells.extend(
        passthrough
            .iter()
            .map(|name| txn.passthrough.get(name).cloned().unwrap_or_default()),
    );
    cells
}

pub fn write_reconciled_transactions(
    path: &Path,
    rows: &[ReconciledTransaction],
) -> Result<usize, TableError> {
    let (header, passthrough) = transaction_header(rows.iter().map(|r| &r.txn), &RECONCILE_FLAG_COLUMNS);
    write_csv(
        path,
        &header,
        rows.iter().map(|row| {
            let mut cells = transaction_cells(&row.txn, &passthrough);
            cells.extend(reconcile_flag_cells(row));
            cells
        }),
    )
}

pub(crate) fn reconcile_flag_cells(row: &ReconciledTransaction) -> [String; 3] {
    [
        fmt_flag(row.coupon_id_imputed),
        fmt_flag(row.flag_no_coupon),
        fmt_flag(row.flag_ambiguous_txn),
    ]
}

pub fn write_label_records(path: &Path, rows: &[LabelRecord]) -> Result<usize, TableError> {
    let header: Vec<String> = LABEL_COLUMNS.iter().map(|name| name.to_string()).collect();
    write_csv(path, &header, rows.iter().map(label_cells))
}

fn label_cells(r: &LabelRecord) -> Vec<String> {
    vec![
        r.receipt_key.to_string(),
        r.user_id.to_string(),
        r.coupon_id.to_string(),
        fmt_date(r.receive_date),
        fmt_date(r.start_date),
        fmt_date(r.end_date),
        fmt_date(r.start_eff),
        fmt_date(r.end_eff),
        fmt_date(r.short_end),
        fmt_opt(r.coupon_status),
        fmt_opt(r.coupon_amount),
        fmt_opt(r.price_limit),
        fmt_flag(r.label_same_user_fh),
        fmt_flag(r.label_same_user_st),
        fmt_flag(r.label_valid()),
        fmt_flag(r.label_invalid()),
        fmt_opt(r.first_valid_txn_key),
        fmt_date(r.first_valid_txn_time),
        r.same_user_valid_txn_count.to_string(),
        r.same_user_early_txn_count.to_string(),
        r.same_user_late_txn_count.to_string(),
        r.other_user_in_window_txn_count.to_string(),
        r.other_user_without_own_receipt_txn_count.to_string(),
        fmt_flag(r.flag_early),
        fmt_flag(r.flag_late),
        fmt_flag(r.flag_cross_user),
        fmt_flag(r.flag_struc_invalid),
    ]
}

/// Serializes every row in memory and then replaces `path` atomically.
pub fn write_csv<I>(path: &Path, header: &[String], rows: I) -> Result<usize, TableError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    let mut count = 0usize;
    for row in rows {
        writer.write_record(&row)?;
        count += 1;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| TableError::Io(err.into_error()))?;

    write_atomic(path, &bytes)?;
    debug!(
        component = "table",
        event = "table.write",
        path = %path.display(),
        rows = count
    );
    Ok(count)
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TableError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| TableError::InvalidPath(path.to_path_buf()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

pub(crate) fn fmt_flag(value: bool) -> String {
    let cell = if value { "1" } else { "0" };
    cell.to_string()
}

pub(crate) fn fmt_opt_flag(value: Option<bool>) -> String {
    value.map(fmt_flag).unwrap_or_default()
}

pub(crate) fn fmt_opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub(crate) fn fmt_date(value: Option<NaiveDate>) -> String {
    value
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

pub(crate) fn fmt_rate(value: f64) -> String {
    format!("{value:.3}")
}
