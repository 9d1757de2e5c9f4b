//! In-memory mesh for tests and simulations.
//!
//! Gateways joined to the same `LoopbackMesh` exchange frames through a
//! shared queue. Nothing moves until `pump()` is called, which makes
//! multi-node scenarios deterministic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use loraptor_core::{Clock, NodeAddress, BROADCAST_ADDR};

use crate::transport::{GatewayCallbacks, TransportError, TransportGateway};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct QueuedFrame {
    src: NodeAddress,
    dest: NodeAddress,
    payload: Vec<u8>,
}

struct MeshShared {
    nodes: DashMap<NodeAddress, Weak<LoopbackGateway>>,
    queue: Mutex<VecDeque<QueuedFrame>>,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct LoopbackMesh {
    shared: Arc<MeshShared>,
}

impl LoopbackMesh {
    /// `clock` timestamps the per-gateway sent log.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(MeshShared {
                nodes: DashMap::new(),
                queue: Mutex::new(VecDeque::new()),
                clock,
            }),
        }
    }

    /// Attach a node at `address`. A later join at the same address
    /// replaces the earlier gateway.
    pub fn join(&self, address: NodeAddress) -> Arc<LoopbackGateway> {
        let gw = Arc::new(LoopbackGateway {
            address,
            mesh: self.shared.clone(),
            callbacks: GatewayCallbacks::default(),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        });
        self.shared.nodes.insert(address, Arc::downgrade(&gw));
        gw
    }

    /// Frames waiting for delivery.
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Deliver queued frames, including any queued by receivers during
    /// delivery, until the queue is empty. Returns the number of
    /// deliveries made.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let frame = lock(&self.shared.queue).pop_front();
            let Some(frame) = frame else { break };

            let targets: Vec<Arc<LoopbackGateway>> = self
                .shared
                .nodes
                .iter()
                .filter(|e| {
                    let addr = *e.key();
                    addr != frame.src && (frame.dest == BROADCAST_ADDR || frame.dest == addr)
                })
                .filter_map(|e| e.value().upgrade())
                .collect();

            for gw in targets {
                if gw.callbacks.received(&frame.payload, frame.src) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Drop everything still queued, as if the frames were lost on air.
    pub fn drop_pending(&self) -> usize {
        let mut queue = lock(&self.shared.queue);
        let n = queue.len();
        queue.clear();
        n
    }
}

/// A frame a gateway handed to the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub dest: NodeAddress,
    pub payload: Vec<u8>,
    /// Sender clock tick at send time.
    pub at_millis: u32,
}

pub struct LoopbackGateway {
    address: NodeAddress,
    mesh: Arc<MeshShared>,
    callbacks: GatewayCallbacks,
    sent: Mutex<Vec<SentFrame>>,
    fail_sends: AtomicBool,
}

impl LoopbackGateway {
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        lock(&self.sent).clone()
    }

    /// Make every send fail with `TransportError::Unavailable`.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    fn enqueue(&self, dest: NodeAddress, payload: &[u8]) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(TransportError::Unavailable("loopback send disabled".into()));
        }
        lock(&self.sent).push(SentFrame {
            dest,
            payload: payload.to_vec(),
            at_millis: self.mesh.clock.uptime_millis(),
        });
        lock(&self.mesh.queue).push_back(QueuedFrame {
            src: self.address,
            dest,
            payload: payload.to_vec(),
        });
        self.callbacks.transmitted(payload);
        Ok(())
    }
}

impl TransportGateway for LoopbackGateway {
    fn init(&self) -> Result<(), TransportError> {
        self.callbacks.waiting();
        self.callbacks.connected();
        Ok(())
    }

    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.enqueue(BROADCAST_ADDR, payload)
    }

    fn send_to(&self, dest: NodeAddress, payload: &[u8]) -> Result<(), TransportError> {
        self.enqueue(dest, payload)
    }

    fn local_address(&self) -> NodeAddress {
        self.address
    }

    fn callbacks(&self) -> &GatewayCallbacks {
        &self.callbacks
    }

    fn known_nodes(&self) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = self
            .mesh
            .nodes
            .iter()
            .filter(|e| *e.key() != self.address && e.value().strong_count() > 0)
            .map(|e| *e.key())
            .collect();
        nodes.sort_unstable();
        nodes
    }
}
