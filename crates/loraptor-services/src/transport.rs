//! Transport gateway: the seam between the messaging layer and the radio.
//!
//! The registry only ever sees this trait. The daemon plugs in a UDP
//! multicast simulation of the mesh; tests plug in `LoopbackMesh`.

use std::sync::{Arc, PoisonError, RwLock};

use loraptor_core::wire::WireError;
use loraptor_core::NodeAddress;

/// Invoked with the envelope bytes and the sender's address.
pub type ReceiveCallback = Arc<dyn Fn(&[u8], NodeAddress) + Send + Sync>;
/// Link state change.
pub type LinkCallback = Arc<dyn Fn() + Send + Sync>;
/// Invoked with the bytes just put on air.
pub type TransmittedCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A mesh radio as seen by the messaging layer.
///
/// Implementations own a `GatewayCallbacks` and expose it through
/// `callbacks()`; the setters are provided on top of that.
pub trait TransportGateway: Send + Sync {
    /// Bring the link up. Fires the waiting and connected callbacks.
    fn init(&self) -> Result<(), TransportError>;

    /// Broadcast to every node in range.
    fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Send to one node.
    fn send_to(&self, dest: NodeAddress, payload: &[u8]) -> Result<(), TransportError>;

    fn local_address(&self) -> NodeAddress;

    fn callbacks(&self) -> &GatewayCallbacks;

    /// Drive a polled transport. Event-driven transports need nothing here.
    fn process(&self) {}

    /// Addresses heard recently.
    fn known_nodes(&self) -> Vec<NodeAddress> {
        Vec::new()
    }

    fn set_receive_callback(&self, cb: ReceiveCallback) {
        self.callbacks().set_receive(cb);
    }

    fn set_connected_callback(&self, cb: LinkCallback) {
        self.callbacks().set_connected(cb);
    }

    fn set_disconnected_callback(&self, cb: LinkCallback) {
        self.callbacks().set_disconnected(cb);
    }

    fn set_waiting_for_connection_callback(&self, cb: LinkCallback) {
        self.callbacks().set_waiting(cb);
    }

    fn set_transmitted_callback(&self, cb: TransmittedCallback) {
        self.callbacks().set_transmitted(cb);
    }
}

// ── Callbacks ─────────────────────────────────────────────────────────────────

/// Callback slots shared by gateway implementations.
///
/// Callbacks are cloned out of their slot before being invoked, so a
/// callback may itself replace callbacks or send on the gateway.
#[derive(Default)]
pub struct GatewayCallbacks {
    receive: RwLock<Option<ReceiveCallback>>,
    connected: RwLock<Option<LinkCallback>>,
    disconnected: RwLock<Option<LinkCallback>>,
    waiting: RwLock<Option<LinkCallback>>,
    transmitted: RwLock<Option<TransmittedCallback>>,
}

fn store<T>(slot: &RwLock<Option<T>>, value: T) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
}

fn current<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

impl GatewayCallbacks {
    pub fn set_receive(&self, cb: ReceiveCallback) {
        store(&self.receive, cb);
    }

    pub fn set_connected(&self, cb: LinkCallback) {
        store(&self.connected, cb);
    }

    pub fn set_disconnected(&self, cb: LinkCallback) {
        store(&self.disconnected, cb);
    }

    pub fn set_waiting(&self, cb: LinkCallback) {
        store(&self.waiting, cb);
    }

    pub fn set_transmitted(&self, cb: TransmittedCallback) {
        store(&self.transmitted, cb);
    }

    /// Hand a received frame to the receive callback. Returns false if none
    /// is installed.
    pub fn received(&self, payload: &[u8], from: NodeAddress) -> bool {
        match current(&self.receive) {
            Some(cb) => {
                cb(payload, from);
                true
            }
            None => false,
        }
    }

    pub fn connected(&self) {
        if let Some(cb) = current(&self.connected) {
            cb();
        }
    }

    pub fn disconnected(&self) {
        if let Some(cb) = current(&self.disconnected) {
            cb();
        }
    }

    pub fn waiting(&self) {
        if let Some(cb) = current(&self.waiting) {
            cb();
        }
    }

    pub fn transmitted(&self, payload: &[u8]) {
        if let Some(cb) = current(&self.transmitted) {
            cb(payload);
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not initialized")]
    NotInitialized,

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("framing failed: {0}")]
    Wire(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
