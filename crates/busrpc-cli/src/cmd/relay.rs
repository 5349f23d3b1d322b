use crate::ui;
use anyhow::Context;
use busrpc_types::BusrpcConfig;
use busrpc_wire::RelayServer;
use tracing::info;

/// Run a relay until Ctrl+C.
pub async fn cmd_relay(mut config: BusrpcConfig, listen: Option<String>) -> anyhow::Result<()> {
    if let Some(addr) = listen {
        config.relay.listen_addr = addr;
    }

    let (server, accept) = RelayServer::start(config.relay.clone())
        .await
        .with_context(|| format!("binding relay on {}", config.relay.listen_addr))?;

    ui::section("Relay");
    ui::kv("Listening", &server.local_addr().to_string());
    ui::kv("Max frame", &format!("{} bytes", config.relay.max_frame_size));
    ui::kv(
        "Max queue",
        &format!("{} messages", config.relay.max_pending_messages),
    );
    ui::hint("Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;

    accept.abort();
    info!("relay: shutting down");
    ui::success("Relay stopped");
    Ok(())
}
