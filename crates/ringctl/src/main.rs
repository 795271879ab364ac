mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Command};
use common::{ObservabilityConfig, TelemetryGuard};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let observability = ObservabilityConfig::from_env();

    let runtime = tokio::runtime::Runtime::new()?;

    // The OTLP exporters need the runtime, and the tracer must exist before
    // the logging layer picks it up.
    let telemetry = match observability.otel_endpoint.as_deref() {
        Some(endpoint) => Some(runtime.block_on(async { TelemetryGuard::init("ringctl", endpoint) })?),
        None => None,
    };
    common::setup_logging(
        &observability.log_level,
        observability.environment,
        "ringctl",
    );

    // First signal asks the current command to stop between chunks, a second
    // one exits right away.
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&shutdown))?;
        flag::register(signal, Arc::clone(&shutdown))?;
    }

    let result = match cli.command {
        Command::Write(args) => runtime.block_on(commands::write(args, &shutdown)),
        Command::Read(args) => runtime.block_on(commands::read(args, &shutdown)),
        Command::Cleanup { key } => commands::cleanup(key),
        Command::Decrement(args) => commands::decrement(args),
    };

    if let Err(e) = &result {
        tracing::error!("ringctl failed: {:#}", e);
    }

    // Flush exporters while the runtime is still up
    drop(telemetry);
    // A blocked stdin read keeps a blocking thread alive past the command
    runtime.shutdown_timeout(Duration::from_millis(100));

    result
}
