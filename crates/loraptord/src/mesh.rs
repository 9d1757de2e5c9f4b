//! UDP multicast stand-in for the LoRa mesh.
//!
//! Every node on the LAN joins one IPv4 multicast group. A frame is a
//! `FrameHeader` followed by the envelope bytes; each node keeps what is
//! addressed to it or to `BROADCAST_ADDR` and ignores its own echoes.
//! Sources heard on the group are tracked for `list nodes`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use loraptor_core::wire::{decode_frame, encode_frame, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};
use loraptor_core::{NodeAddress, BROADCAST_ADDR};
use loraptor_services::{GatewayCallbacks, TransportError, TransportGateway};

pub struct UdpMeshGateway {
    address: NodeAddress,
    group: SocketAddrV4,
    node_ttl: Duration,
    callbacks: GatewayCallbacks,
    nodes: DashMap<NodeAddress, Instant>,
    send_socket: OnceLock<Socket>,
    /// Joined listener, taken by `receive_loop`.
    listener: Mutex<Option<std::net::UdpSocket>>,
}

impl UdpMeshGateway {
    pub fn new(address: NodeAddress, group: SocketAddrV4, node_ttl: Duration) -> Self {
        Self {
            address,
            group,
            node_ttl,
            callbacks: GatewayCallbacks::default(),
            nodes: DashMap::new(),
            send_socket: OnceLock::new(),
            listener: Mutex::new(None),
        }
    }

    fn transmit(&self, dest: NodeAddress, payload: &[u8]) -> Result<(), TransportError> {
        let socket = self.send_socket.get().ok_or(TransportError::NotInitialized)?;
        let frame = encode_frame(self.address, dest, payload)?;
        let n = socket.send_to(&frame, &SocketAddr::V4(self.group).into())?;
        tracing::trace!(to = dest, bytes = n, "frame sent");
        self.callbacks.transmitted(payload);
        Ok(())
    }

    /// Handle one datagram from the group.
    fn on_datagram(&self, datagram: &[u8]) {
        let (header, payload) = match decode_frame(datagram) {
            Ok(f) => f,
            Err(e) => {
                tracing::trace!(error = %e, "ignoring malformed frame");
                return;
            }
        };
        let src = header.src();
        if src == self.address {
            return;
        }
        if self.nodes.insert(src, Instant::now()).is_none() {
            tracing::info!(node = src, "new node heard");
        }
        let dest = header.dest();
        if dest == self.address || dest == BROADCAST_ADDR {
            self.callbacks.received(payload, src);
        }
    }

    fn expire_nodes(&self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, seen| seen.elapsed() < self.node_ttl);
        before - self.nodes.len()
    }
}

impl TransportGateway for UdpMeshGateway {
    fn init(&self) -> Result<(), TransportError> {
        self.callbacks.waiting();
        if self.send_socket.get().is_none() {
            let sender = make_send_socket()?;
            let _ = self.send_socket.set(sender);
            let listener = make_listener_socket(self.group)?;
            *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        }
        tracing::info!(address = self.address, group = %self.group, "joined mesh group");
        self.callbacks.connected();
        Ok(())
    }

    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.transmit(BROADCAST_ADDR, payload)
    }

    fn send_to(&self, dest: NodeAddress, payload: &[u8]) -> Result<(), TransportError> {
        self.transmit(dest, payload)
    }

    fn local_address(&self) -> NodeAddress {
        self.address
    }

    fn callbacks(&self) -> &GatewayCallbacks {
        &self.callbacks
    }

    fn known_nodes(&self) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = self
            .nodes
            .iter()
            .filter(|e| e.value().elapsed() < self.node_ttl)
            .map(|e| *e.key())
            .collect();
        nodes.sort_unstable();
        nodes
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Receive frames from the group until the socket fails.
///
/// Fires the disconnected callback on exit.
pub async fn receive_loop(gateway: Arc<UdpMeshGateway>) -> Result<()> {
    let listener = gateway
        .listener
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .context("mesh gateway not initialized")?;
    let socket = UdpSocket::from_std(listener).context("failed to convert to tokio UdpSocket")?;

    let mut buf = vec![0u8; FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD];
    tracing::info!(port = gateway.group.port(), "mesh receiver starting");

    let result = loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _)) => gateway.on_datagram(&buf[..len]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e).context("mesh recv_from failed"),
        }
    };
    gateway.callbacks.disconnected();
    result
}

/// Forget nodes not heard within the TTL.
///
/// Runs forever. Cancel by dropping the task handle.
pub async fn expiry_loop(gateway: Arc<UdpMeshGateway>) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let removed = gateway.expire_nodes();
        if removed > 0 {
            tracing::debug!(removed, "expired mesh nodes");
        }
    }
}

// ── Sockets ───────────────────────────────────────────────────────────────────

fn make_send_socket() -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // TTL 1: stay on the local link
    socket.set_multicast_ttl_v4(1)?;
    // nodes on the same host must hear each other
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

fn make_listener_socket(group: SocketAddrV4) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;

    Ok(socket.into())
}
