use std::process::ExitCode;

use chrono::Local;
use clap::Parser;
use roll_scrap::{
    config::Config,
    info_time,
    logging::{self, Verbosity},
    process::process_rolls,
    shutdown::listen_for_shutdown,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    logging::init(Verbosity::from_flags(config.verbose, config.quiet));

    let start_time = Local::now();
    let cancel = CancellationToken::new();
    let _listener = listen_for_shutdown(cancel.clone());

    match process_rolls(config, cancel).await {
        Ok(summary) => {
            tracing::info!(
                passed = summary.pool.passed,
                failed = summary.pool.failed,
                errored = summary.pool.errored,
                saved = summary.sink.flushed,
                unsaved = summary.sink.lost,
                "Processing completed!"
            );
            info_time!(start_time, "Full program time:");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Run aborted");
            ExitCode::FAILURE
        }
    }
}
