//! Logging configuration, subscriber setup and pipeline lifecycle events.
//!
//! Label building fans out over named rayon workers; enabling worker names
//! tags every event with the worker that emitted it.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::pipeline::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    /// Tag events with the emitting thread name, e.g. `labels-worker-3`.
    pub worker_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            worker_names: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("COUPON_ROI_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("COUPON_ROI_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("COUPON_ROI_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    if let Ok(worker_names) = env::var("COUPON_ROI_LOG_WORKER_NAMES") {
        if let Some(parsed) = parse_bool(&worker_names) {
            config.worker_names = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_thread_names(config.worker_names)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_pipeline_start(config: &PipelineConfig) {
    info!(
        component = "pipeline",
        event = "pipeline.start",
        transactions_path = %config.transactions_path.display(),
        receipts_path = %config.receipts_path.display(),
        visits_path = %config.visits_path.display(),
        out_dir = %config.out_dir.display(),
        mode = config.mode(),
        short_window_days = config.labels.short_window_days,
        threads = config.labels.threads,
        segment_lookback_days = ?config.segment.lookback_days,
        user_lookback_days = ?config.user.lookback_days
    );
}

pub fn log_stage_output(stage: &str, path: &Path, rows: usize) {
    info!(
        component = "pipeline",
        event = "stage.output",
        stage,
        path = %path.display(),
        rows
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(
            &[
                ("COUPON_ROI_LOG_LEVEL", None),
                ("COUPON_ROI_LOG_FORMAT", None),
                ("COUPON_ROI_LOG_TARGET", None),
                ("COUPON_ROI_LOG_WORKER_NAMES", None),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg, LoggingConfig::default());
    }

    #[test]
    fn parses_json_and_level_and_target_from_env() {
        let cfg = with_env_vars(
            &[
                ("COUPON_ROI_LOG_LEVEL", Some("debug")),
                ("COUPON_ROI_LOG_FORMAT", Some("json")),
                ("COUPON_ROI_LOG_TARGET", Some("false")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn invalid_format_or_target_falls_back_to_defaults() {
        let cfg = with_env_vars(
            &[
                ("COUPON_ROI_LOG_LEVEL", Some("trace")),
                ("COUPON_ROI_LOG_FORMAT", Some("yaml")),
                ("COUPON_ROI_LOG_TARGET", Some("maybe")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "trace");
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert!(cfg.include_target);
    }

    #[test]
    fn worker_names_toggle_from_env() {
        let cfg = with_env_vars(
            &[("COUPON_ROI_LOG_WORKER_NAMES", Some("on"))],
            logging_config_from_env,
        );
        assert!(cfg.worker_names);

        let cfg = with_env_vars(
            &[("COUPON_ROI_LOG_WORKER_NAMES", Some("sometimes"))],
            logging_config_from_env,
        );
        assert!(!cfg.worker_names);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        for raw in ["1", "true", " YES ", "on"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "False", "no", "off"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("2"), None);
    }
}
