//! LoRaptor integration test harness.
//!
//! Tests run several nodes in one process over a `LoopbackMesh` driven by a
//! shared `ManualClock`. Nothing is delivered or retried until a test calls
//! `Sim::step`, so every scenario is deterministic.

use std::sync::Arc;

use loraptor_core::config::MessagingSettings;
use loraptor_core::{ManualClock, NodeAddress};
use loraptor_services::{ConnectionRegistry, LoopbackGateway, LoopbackMesh};

mod messaging;
mod retry;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const KEY: &str = "secretkey123456";
pub const NODE_A: NodeAddress = 0x0001;
pub const NODE_B: NodeAddress = 0x0002;
pub const NODE_C: NodeAddress = 0x0003;

/// Sweep tick used by `Sim::run_for`.
pub const TICK_MS: u32 = 100;

pub struct Node {
    pub gateway: Arc<LoopbackGateway>,
    pub registry: Arc<ConnectionRegistry>,
}

impl Node {
    /// Envelopes this node has put on air.
    pub fn sent(&self) -> usize {
        self.gateway.sent_frames().len()
    }
}

pub struct Sim {
    pub mesh: LoopbackMesh,
    pub clock: Arc<ManualClock>,
}

impl Sim {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(1_760_000_000, 0));
        Self {
            mesh: LoopbackMesh::new(clock.clone()),
            clock,
        }
    }

    pub fn node(&self, address: NodeAddress) -> Node {
        self.node_with(address, MessagingSettings::default())
    }

    pub fn node_with(&self, address: NodeAddress, settings: MessagingSettings) -> Node {
        let gateway = self.mesh.join(address);
        let registry = Arc::new(ConnectionRegistry::new(
            settings,
            gateway.clone(),
            self.clock.clone(),
        ));
        registry.attach_receiver();
        Node { gateway, registry }
    }

    /// Sweep every node at the current tick, deliver everything in flight,
    /// then advance the clock by `millis`.
    pub fn step(&self, nodes: &[&Node], millis: u32) {
        for node in nodes {
            node.registry.process_outgoing_sweep();
        }
        self.mesh.pump();
        self.clock.advance_millis(millis);
    }

    /// Step at `TICK_MS` until `millis` have elapsed.
    pub fn run_for(&self, nodes: &[&Node], millis: u32) {
        for _ in 0..millis / TICK_MS {
            self.step(nodes, TICK_MS);
        }
    }
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

pub fn acks_disabled() -> MessagingSettings {
    MessagingSettings {
        acks_disabled: true,
        ..MessagingSettings::default()
    }
}
