//! Commands that join the bus as a short-lived process.

use crate::ui;
use anyhow::{bail, Context};
use busrpc_kernel::Ipc;
use busrpc_types::BusrpcConfig;
use busrpc_wire::RelayClient;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Connect to the configured relay under a throwaway pid and join the bus.
async fn join(config: &BusrpcConfig) -> anyhow::Result<Ipc> {
    let broker = RelayClient::connect_with_limit(&config.ipc.broker_addr, config.relay.max_frame_size)
        .await
        .with_context(|| format!("connecting to relay at {}", config.ipc.broker_addr))?;

    let mut ipc_config = config.ipc.clone();
    ipc_config.pid = format!("busrpc-cli-{}", uuid::Uuid::new_v4().simple());
    let ipc = Ipc::new(Arc::new(broker), ipc_config);
    ipc.connect().await?;
    Ok(ipc)
}

/// Wait until `pid` is Known, or fail after `wait`.
async fn discover(ipc: &Ipc, pid: &str, wait: Duration) -> anyhow::Result<()> {
    let found = tokio::time::timeout(wait, async {
        while !ipc.nodes().contains(pid) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if found.is_err() {
        bail!("process {pid} did not announce itself within {}ms", wait.as_millis());
    }
    Ok(())
}

/// Parse a command-line value as JSON, falling back to a plain string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub async fn cmd_nodes(config: BusrpcConfig, wait_ms: u64) -> anyhow::Result<()> {
    let ipc = join(&config).await?;
    tokio::time::sleep(Duration::from_millis(wait_ms)).await;

    let pids = ipc.nodes().pids();
    ui::section(&format!("{} process(es) on the bus", pids.len()));
    for pid in &pids {
        println!("  {pid}");
    }

    ipc.close().await?;
    Ok(())
}

pub async fn cmd_call(
    config: BusrpcConfig,
    pid: &str,
    method: &str,
    args: &[String],
    wait_ms: u64,
) -> anyhow::Result<()> {
    let ipc = join(&config).await?;
    let outcome = async {
        discover(&ipc, pid, Duration::from_millis(wait_ms)).await?;
        let args = args.iter().map(|a| parse_value(a)).collect();
        let result = ipc.call(pid, method, args).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        anyhow::Ok(())
    }
    .await;

    ipc.close().await?;
    outcome
}

pub async fn cmd_send(
    config: BusrpcConfig,
    pid: &str,
    event: &str,
    data: &str,
    wait_ms: u64,
) -> anyhow::Result<()> {
    let ipc = join(&config).await?;
    let outcome = async {
        discover(&ipc, pid, Duration::from_millis(wait_ms)).await?;
        ipc.send(pid, event, parse_value(data)).await?;
        ui::success(&format!("Sent `{event}` to {pid}"));
        anyhow::Ok(())
    }
    .await;

    ipc.close().await?;
    outcome
}
