//! beacon-demo records a terminal chat as telemetry.
//!
//! This crate is the composition root: it reads configuration from the
//! environment, installs logging, picks adapters and runs the chat loop
//! on a single-threaded runtime.
//!
//! Usage: `beacon-demo [--dry-run]`

mod app;
mod env;


use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let dry_run = std::env::args().skip(1).any(|arg| arg == "--dry-run");

    let config = match env::load(dry_run) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Set BEACON_API_KEY and BEACON_PROJECT_ID, or pass --dry-run.");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.debug);
    log::info!("beacon-demo starting (dry run: {})", dry_run);

    let local = tokio::task::LocalSet::new();
    match local.run_until(app::run(config, dry_run)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise `debug` when the config asks for it.
fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
