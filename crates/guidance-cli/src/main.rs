//! `guidance` – guidance node entry point.
//!
//! 1. Installs the `tracing` subscriber (optional OTLP export).
//! 2. Loads `~/.guidance/config.toml`, or the file given as the first
//!    argument, applies `GUIDANCE_*` overrides, and validates it. A missing
//!    run identifier stops the process here.
//! 3. Builds a Tokio runtime with one worker per component plus one for the
//!    heartbeat.
//! 4. Runs the [`Orchestrator`] until **Ctrl-C**, then stops the components.

use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use guidance_kernel::{CancellationToken, LoopState};
use guidance_runtime::{GuidanceConfig, Orchestrator, config, init_tracing};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let _telemetry = init_tracing("guidance");

    let config_arg = std::env::args().nth(1);
    if matches!(config_arg.as_deref(), Some("-h" | "--help")) {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let cfg = match config::load(config_arg.map(PathBuf::from).as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "startup aborted");
            eprintln!("{}: {}", "Configuration error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    print_banner(&cfg);

    // One extra thread runs the heartbeat.
    let Some(runtime_threads) = cfg.worker_threads.checked_add(1) else {
        error!(worker_threads = cfg.worker_threads, "worker_threads is out of range");
        return ExitCode::FAILURE;
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(runtime_threads)
        .thread_name("guidance-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build the Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = match Orchestrator::new(cfg) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "startup aborted");
            return ExitCode::FAILURE;
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let shutdown_on_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping guidance …".yellow().bold());
        shutdown_on_signal.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process with a signal instead");
    }

    match runtime.block_on(orchestrator.run(shutdown)) {
        Ok(LoopState::Failed) => {
            error!("heartbeat loop failed");
            ExitCode::FAILURE
        }
        Ok(state) => {
            info!(state = ?state, "guidance exited");
            println!("{}", "  ✓ Guidance stopped.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "guidance aborted");
            eprintln!("{}: {}", "Guidance error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_banner(cfg: &GuidanceConfig) {
    println!();
    println!(
        "  {} {}",
        "guidance".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  run_id    {}", cfg.run_id.bold());
    println!("  workers   {}", cfg.worker_threads);
    println!("  heartbeat every {}s", cfg.heartbeat_interval_secs);
    println!();
}

fn print_usage() {
    println!("Usage: guidance [CONFIG_PATH]");
    println!();
    println!("Without CONFIG_PATH, {} is used when present.", config::config_path().display());
    println!("Environment: GUIDANCE_RUN_ID, GUIDANCE_WORKER_THREADS, GUIDANCE_HEARTBEAT_SECS,");
    println!("             GUIDANCE_COMPONENT_TICK_MS, GUIDANCE_LOG_FORMAT=json, RUST_LOG");
}
