//! End-to-end training-table build: read, reconcile, flag, label, aggregate,
//! combine, write.
//!
//! Every stage is computed in memory before the first file is written, so a
//! fatal error in any stage leaves the output directory untouched.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::combine::combine_features;
use crate::features::{validate_lookback_days, FeatureError};
use crate::labels::{build_labels, LabelConfig, LabelError, LabelReport};
use crate::observability::{log_pipeline_start, log_stage_output, parse_bool};
use crate::reconcile::{label_input_transactions, reconcile, ReconcileError, ReconcileReport};
use crate::segment_features::{build_segment_features, SegmentFeatureConfig};
use crate::table::{
    read_receipts, read_transactions, read_visits, write_atomic, write_csv, write_label_records,
    write_reconciled_transactions, TableError,
};
use crate::txn_flags::{flag_transactions, write_flagged_transactions, TxnFlagReport};
use crate::user_features::{build_user_features, UserFeatureConfig};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub transactions_path: PathBuf,
    pub receipts_path: PathBuf,
    pub visits_path: PathBuf,
    pub out_dir: PathBuf,
    /// Exclude transactions whose coupon id was imputed from labelling.
    pub reconcile_strict: bool,
    pub labels: LabelConfig,
    pub segment: SegmentFeatureConfig,
    pub user: UserFeatureConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transactions_path: PathBuf::from("data/transactions.csv"),
            receipts_path: PathBuf::from("data/receipts.csv"),
            visits_path: PathBuf::from("data/visits.csv"),
            out_dir: PathBuf::from("out"),
            reconcile_strict: false,
            labels: LabelConfig::default(),
            segment: SegmentFeatureConfig::default(),
            user: UserFeatureConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn mode(&self) -> &'static str {
        if self.reconcile_strict {
            "strict"
        } else {
            "relax"
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest serialization failed: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub mode: String,
    pub generated_at_utc: DateTime<Utc>,
    pub reconcile: ReconcileReport,
    pub txn_flags: TxnFlagReport,
    pub labels: LabelReport,
    pub segment_schema_fingerprint: String,
    pub user_schema_fingerprint: String,
    /// File name to row count, for every file written.
    pub outputs: BTreeMap<String, usize>,
}

pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(path) = env_path("COUPON_ROI_TRANSACTIONS_PATH") {
        config.transactions_path = path;
    }
    if let Some(path) = env_path("COUPON_ROI_RECEIPTS_PATH") {
        config.receipts_path = path;
    }
    if let Some(path) = env_path("COUPON_ROI_VISITS_PATH") {
        config.visits_path = path;
    }
    if let Some(path) = env_path("COUPON_ROI_OUT_DIR") {
        config.out_dir = path;
    }

    if let Ok(raw) = env::var("COUPON_ROI_RECONCILE_STRICT") {
        if let Some(parsed) = parse_bool(&raw) {
            config.reconcile_strict = parsed;
        }
    }

    if let Ok(raw) = env::var("COUPON_ROI_SHORT_WINDOW_DAYS") {
        if let Ok(parsed) = raw.trim().parse::<u32>() {
            if parsed > 0 {
                config.labels.short_window_days = parsed;
            }
        }
    }

    if let Ok(raw) = env::var("COUPON_ROI_THREADS") {
        if let Ok(parsed) = raw.trim().parse::<usize>() {
            config.labels.threads = parsed;
        }
    }

    if let Ok(raw) = env::var("COUPON_ROI_SEGMENT_LOOKBACK_DAYS") {
        if let Some(parsed) = parse_lookback_list(&raw) {
            config.segment.lookback_days = parsed;
        }
    }

    if let Ok(raw) = env::var("COUPON_ROI_USER_LOOKBACK_DAYS") {
        if let Some(parsed) = parse_lookback_list(&raw) {
            config.user.lookback_days = parsed;
        }
    }

    config
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

/// Comma-separated positive, unique day counts; anything else is rejected.
fn parse_lookback_list(raw: &str) -> Option<Vec<u32>> {
    let parsed: Vec<u32> = raw
        .split(',')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect::<Option<Vec<u32>>>()?;
    validate_lookback_days(&parsed).ok()?;
    Some(parsed)
}

pub fn run_pipeline(cfg: &PipelineConfig) -> Result<PipelineReport, PipelineError> {
    log_pipeline_start(cfg);
    validate_lookback_days(&cfg.segment.lookback_days)?;
    validate_lookback_days(&cfg.user.lookback_days)?;

    let transactions = read_transactions(&cfg.transactions_path)?;
    let receipts = read_receipts(&cfg.receipts_path)?;
    let visits = read_visits(&cfg.visits_path)?;

    let (reconciled, reconcile_report) = reconcile(transactions, &receipts)?;
    let (flagged, flag_report) = flag_transactions(&reconciled, &receipts, cfg.reconcile_strict);

    let label_input = label_input_transactions(&reconciled, cfg.reconcile_strict);
    let (labels, label_report) = build_labels(&receipts, &label_input, &cfg.labels)?;

    let (segment_schema, segment_rows) = build_segment_features(&labels, &cfg.segment)?;
    let history: Vec<_> = flagged.iter().map(|row| row.reconciled.txn.clone()).collect();
    let (user_schema, user_rows) = build_user_features(&labels, &history, &visits, &cfg.user)?;
    let trainable = combine_features(&segment_schema, &segment_rows, &user_schema, &user_rows);

    fs::create_dir_all(&cfg.out_dir)?;
    let mode = cfg.mode();
    let mut outputs = BTreeMap::new();

    let mut record = |name: String, rows: usize, path: &Path| {
        log_stage_output(&name, path, rows);
        outputs.insert(name, rows);
    };

    let path = cfg.out_dir.join("txns_reconciled.csv");
    let rows = write_reconciled_transactions(&path, &reconciled)?;
    record("txns_reconciled.csv".to_string(), rows, &path);

    let name = format!("txns_flagged_{mode}.csv");
    let path = cfg.out_dir.join(&name);
    let rows = write_flagged_transactions(&path, &flagged)?;
    record(name, rows, &path);

    let name = format!("labels_{mode}.csv");
    let path = cfg.out_dir.join(&name);
    let rows = write_label_records(&path, &labels)?;
    record(name, rows, &path);

    let path = cfg.out_dir.join("segment_features.csv");
    let rows = write_csv(
        &path,
        &segment_schema.header(),
        segment_rows.iter().map(|row| row.cells()),
    )?;
    record("segment_features.csv".to_string(), rows, &path);

    let path = cfg.out_dir.join("user_features.csv");
    let rows = write_csv(
        &path,
        &user_schema.header(),
        user_rows.iter().map(|row| row.cells()),
    )?;
    record("user_features.csv".to_string(), rows, &path);

    let path = cfg.out_dir.join("trainable.csv");
    let rows = write_csv(&path, &trainable.header, trainable.rows.iter().cloned())?;
    record("trainable.csv".to_string(), rows, &path);

    let report = PipelineReport {
        mode: mode.to_string(),
        generated_at_utc: Utc::now(),
        reconcile: reconcile_report,
        txn_flags: flag_report,
        labels: label_report,
        segment_schema_fingerprint: segment_schema.fingerprint,
        user_schema_fingerprint: user_schema.fingerprint,
        outputs,
    };

    let manifest = serde_json::to_vec_pretty(&report)?;
    write_atomic(&cfg.out_dir.join(MANIFEST_FILE), &manifest)?;

    if report.reconcile.ambiguous > 0 {
        warn!(
            component = "pipeline",
            event = "pipeline.ambiguous_transactions",
            ambiguous = report.reconcile.ambiguous
        );
    }
    info!(
        component = "pipeline",
        event = "pipeline.finish",
        mode,
        out_dir = %cfg.out_dir.display(),
        files = report.outputs.len() + 1
    );

    Ok(report)
}
