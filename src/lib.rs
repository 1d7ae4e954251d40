//! Coupon ROI training-table core.
//!
//! Current implemented scope:
//! - coupon-id reconciliation of transactions against receipts
//! - per-receipt redemption labels, validity flags and audit counters
//! - leakage-free rolling segment and user features
//! - CSV stage files, feature combination and the end-to-end pipeline

mod combine;
mod features;
mod labels;
mod model;
mod observability;
mod pipeline;
mod reconcile;
mod rolling;
mod segment_features;
mod table;
mod txn_flags;
mod user_features;

pub use combine::{combine_features, TrainableTable};
pub use features::{
    assert_schema_compatible, FeatureColumn, FeatureDType, FeatureError, FeatureSchema,
    DEFAULT_LOOKBACK_DAYS, FEATURE_SCHEMA_VERSION,
};
pub use labels::{
    build_labels, LabelConfig, LabelError, LabelReport, DEFAULT_SHORT_WINDOW_DAYS,
    LABEL_WORKER_PREFIX,
};
pub use model::{
    is_missing_id, ymd, LabelRecord, Receipt, ReceiptWindow, ReconciledTransaction, Transaction,
    Visit, MISSING_ID,
};
pub use observability::{
    init_logging, log_pipeline_start, log_stage_output, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    pipeline_config_from_env, run_pipeline, PipelineConfig, PipelineError, PipelineReport,
    MANIFEST_FILE,
};
pub use reconcile::{label_input_transactions, reconcile, ReconcileError, ReconcileReport};
pub use rolling::{rate, round3, CumulativeTable, OutcomeRates, WindowedCounts};
pub use segment_features::{
    amount_bin, build_segment_feature_schema, build_segment_features, expiry_span_bin,
    generosity_ratio, HolidayCalendar, SegmentBinConfig, SegmentFeatureConfig, SegmentFeatureRow,
    SegmentKey,
};
pub use table::{
    read_label_records, read_receipts, read_reconciled_transactions, read_transactions,
    read_visits, write_atomic, write_csv, write_label_records, write_reconciled_transactions,
    TableError, LABEL_COLUMNS, RECEIPT_REQUIRED_COLUMNS, RECONCILE_FLAG_COLUMNS,
    TRANSACTION_REQUIRED_COLUMNS, VISIT_REQUIRED_COLUMNS,
};
pub use txn_flags::{
    flag_transactions, write_flagged_transactions, FlaggedTransaction, TxnFlagReport,
    TXN_FLAG_COLUMNS,
};
pub use user_features::{
    build_user_feature_schema, build_user_features, UserFeatureConfig, UserFeatureRow,
    UserTxnWindow, UserVisitWindow,
};
