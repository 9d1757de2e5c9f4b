//! loraptord: LoRaptor mesh messaging node.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use loraptor_core::config::LoraptorConfig;
use loraptor_core::{NodeAddress, SystemClock};
use loraptor_services::{ConnectionRegistry, SweepReport, TransportGateway};

mod console;
mod mesh;

use console::Console;
use mesh::UdpMeshGateway;

/// Map the process id into the usable address range (never 0, never
/// broadcast).
type InboundFrame = (Vec<u8>, NodeAddress);

/// Hand a received frame to the inbound task. Returns false once that task
/// has exited.
fn forward_frame(tx: &mpsc::UnboundedSender<InboundFrame>, payload: &[u8], from: NodeAddress) -> bool {
    if tx.send((payload.to_vec(), from)).is_err() {
        tracing::debug!(from, len = payload.len(), "inbound task gone, frame dropped");
        return false;
    }
    true
}

fn derive_address() -> NodeAddress {
    (std::process::id() % 0xFFFE) as NodeAddress + 1
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = LoraptorConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = LoraptorConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        LoraptorConfig::default()
    });

    let address = match config.node.address {
        0 => derive_address(),
        a => a,
    };
    tracing::info!(
        name = %config.node.name,
        address = format_args!("0x{address:04x}"),
        acks_disabled = config.messaging.acks_disabled,
        "loraptord starting"
    );

    let group_ip: Ipv4Addr = config
        .mesh
        .multicast_group
        .parse()
        .context("invalid multicast group in config")?;
    let group = SocketAddrV4::new(group_ip, config.mesh.port);

    // Shared state
    let clock = Arc::new(SystemClock::new());
    let gateway = Arc::new(UdpMeshGateway::new(
        address,
        group,
        Duration::from_secs(config.mesh.node_ttl_secs),
    ));

    gateway.set_waiting_for_connection_callback(Arc::new(|| tracing::info!("waiting for mesh")));
    gateway.set_connected_callback(Arc::new(|| tracing::info!("mesh link up")));
    gateway.set_disconnected_callback(Arc::new(|| tracing::warn!("mesh link down")));
    gateway.set_transmitted_callback(Arc::new(|payload: &[u8]| {
        tracing::trace!(bytes = payload.len(), "transmitted")
    }));

    // Inbound frames are handed off the receive path through a channel
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<InboundFrame>();
    gateway.set_receive_callback(Arc::new(move |payload: &[u8], from: NodeAddress| {
        forward_frame(&frame_tx, payload, from);
    }));

    gateway.init().context("failed to bring up mesh gateway")?;

    let registry = Arc::new(ConnectionRegistry::new(
        config.messaging.clone(),
        gateway.clone(),
        clock.clone(),
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let receive_task = tokio::spawn(mesh::receive_loop(gateway.clone()));

    let expiry_task = tokio::spawn(mesh::expiry_loop(gateway.clone()));

    let inbound_task = {
        let registry = registry.clone();
        tokio::spawn(async move {
            while let Some((payload, from)) = frame_rx.recv().await {
                registry.process_incoming_frame(&payload, from);
            }
        })
    };

    let sweep_task = {
        let registry = registry.clone();
        let gateway = gateway.clone();
        let period = Duration::from_millis(config.messaging.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                gateway.process();
                let report = registry.process_outgoing_sweep();
                if report != SweepReport::default() {
                    tracing::debug!(
                        sent = report.sent,
                        removed = report.removed,
                        dropped = report.dropped,
                        auto_acknowledged = report.auto_acknowledged,
                        "sweep"
                    );
                }
            }
        })
    };

    // Console exit (stdin closed) does not stop the node
    {
        let console = Console::new(registry.clone(), clock.clone());
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = console.run(shutdown).await {
                tracing::error!(error = %e, "console failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = receive_task       => tracing::error!("mesh receiver exited: {:?}", r),
        r = expiry_task        => tracing::error!("node expiry exited: {:?}", r),
        r = inbound_task       => tracing::error!("inbound task exited: {:?}", r),
        r = sweep_task         => tracing::error!("sweep task exited: {:?}", r),
    }

    Ok(())
}
