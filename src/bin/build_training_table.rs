use coupon_roi::{init_logging, logging_config_from_env, pipeline_config_from_env, run_pipeline};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = pipeline_config_from_env();
    let report = run_pipeline(&cfg)?;

    println!(
        "Wrote {} files to {} ({} mode): {} receipts labelled, {} valid, {} ambiguous transactions",
        report.outputs.len() + 1,
        cfg.out_dir.display(),
        report.mode,
        report.labels.receipts,
        report.labels.valid,
        report.reconcile.ambiguous
    );

    Ok(())
}
