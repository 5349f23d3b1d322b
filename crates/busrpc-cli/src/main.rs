//! busrpc CLI: run a relay and talk to processes on the bus.
//!
//! Every bus command joins as a short-lived process with its own pid,
//! performs one operation and leaves again.

mod cli;
mod cmd;
mod ui;

use crate::cli::*;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = busrpc_kernel::config::load_config(cli.config.as_deref());

    match cli.command {
        Commands::Relay { listen } => cmd::relay::cmd_relay(config, listen).await,
        Commands::Nodes { wait_ms } => cmd::bus::cmd_nodes(config, wait_ms).await,
        Commands::Call {
            pid,
            method,
            args,
            wait_ms,
        } => cmd::bus::cmd_call(config, &pid, &method, &args, wait_ms).await,
        Commands::Send {
            pid,
            event,
            data,
            wait_ms,
        } => cmd::bus::cmd_send(config, &pid, &event, &data, wait_ms).await,
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start the async runtime: {e}"));
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}
