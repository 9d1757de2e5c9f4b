//! Connection registry: owns every connection, routes inbound frames and
//! drives the outgoing retry sweep.
//!
//! Inbound routing tries each connection's key in registration order; the
//! first one that decodes wins. There is no connection id on the wire.
//!
//! Outgoing state machine per record:
//!
//! ```text
//!   NEW (retries 0) ─send─▶ SENT(1, t) ─interval─▶ SENT(2, t') … SENT(max)
//!        │                      │                                  │
//!        └──────── ACK ─────────┴──▶ ACKNOWLEDGED (removed)        └─▶ DROPPED
//! ```
//!
//! Sends are collected under the connection's outgoing lock and issued after
//! it is released, and only while the connection is still registered.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use bytes::Bytes;
use loraptor_core::config::MessagingSettings;
use loraptor_core::{
    Clock, EncodeError, MessageHash, MessageRecord, NodeAddress, PayloadType,
};

use crate::connection::Connection;
use crate::transport::TransportGateway;

pub struct ConnectionRegistry {
    connections: RwLock<Vec<Arc<Connection>>>,
    gateway: Arc<dyn TransportGateway>,
    clock: Arc<dyn Clock>,
    settings: MessagingSettings,
}

/// What happened to an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// An ACK decoded under `connection`. `matched` is false if no pending
    /// record carried the hash.
    Acknowledged { connection: String, matched: bool },
    /// A message decoded under `connection` and was buffered.
    Stored { connection: String, hash: MessageHash },
    /// No connection's key decoded the frame.
    Dropped,
}

/// Counters from one pass of the outgoing sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records transmitted (first send or retry).
    pub sent: usize,
    /// Acknowledged records removed.
    pub removed: usize,
    /// Records dropped after exhausting retries.
    pub dropped: usize,
    /// Records marked acknowledged because ACKs are disabled.
    pub auto_acknowledged: usize,
}

impl ConnectionRegistry {
    pub fn new(
        settings: MessagingSettings,
        gateway: Arc<dyn TransportGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            gateway,
            clock,
            settings,
        }
    }

    /// Route the gateway's received frames straight into this registry.
    /// Holds only a weak reference, so the registry can still be dropped.
    pub fn attach_receiver(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.gateway.set_receive_callback(Arc::new(move |payload: &[u8], from: NodeAddress| {
            if let Some(registry) = weak.upgrade() {
                registry.process_incoming_frame(payload, from);
            }
        }));
    }

    pub fn gateway(&self) -> &Arc<dyn TransportGateway> {
        &self.gateway
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Connection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Connection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.read().clone()
    }

    fn is_registered(&self, conn: &Arc<Connection>) -> bool {
        self.read().iter().any(|c| Arc::ptr_eq(c, conn))
    }

    // ── Connections ───────────────────────────────────────────────────────

    pub fn create_connection(
        &self,
        id: &str,
        key: &str,
        recipients: &[NodeAddress],
    ) -> Result<Arc<Connection>, RegistryError> {
        if !is_valid_connection_id(id) {
            return Err(RegistryError::InvalidConnectionId(id.to_string()));
        }
        let mut connections = self.write();
        if connections.iter().any(|c| c.id() == id) {
            return Err(RegistryError::ConnectionExists(id.to_string()));
        }
        let conn = Arc::new(Connection::new(
            id,
            key,
            recipients.iter().copied(),
            self.settings.buffer_size,
        ));
        connections.push(conn.clone());
        tracing::info!(connection = %id, recipients = ?conn.recipients(), "connection created");
        Ok(conn)
    }

    /// Remove a connection. Its buffered messages are discarded.
    pub fn delete_connection(&self, id: &str) -> Result<(), RegistryError> {
        let mut connections = self.write();
        let idx = connections
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.to_string()))?;
        let removed = connections.remove(idx);
        tracing::info!(
            connection = %id,
            discarded = removed.outgoing_len() + removed.incoming_len(),
            "connection deleted"
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.read().iter().find(|c| c.id() == id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<Connection>, RegistryError> {
        self.get(id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.to_string()))
    }

    /// Connection ids in registration order.
    pub fn connection_ids(&self) -> Vec<String> {
        self.read().iter().map(|c| c.id().to_string()).collect()
    }

    pub fn add_recipient(&self, id: &str, addr: NodeAddress) -> Result<bool, RegistryError> {
        Ok(self.require(id)?.add_recipient(addr))
    }

    pub fn remove_recipient(&self, id: &str, addr: NodeAddress) -> Result<bool, RegistryError> {
        Ok(self.require(id)?.remove_recipient(addr))
    }

    // ── Outgoing ──────────────────────────────────────────────────────────

    /// Encode `text` on connection `id` and enqueue it for the sweep.
    pub fn send_message(&self, id: &str, text: &str) -> Result<MessageHash, RegistryError> {
        let conn = self.require(id)?;
        if conn.recipients().is_empty() {
            return Err(RegistryError::NoRecipients(id.to_string()));
        }
        let payload = conn.prepare_payload(text, self.clock.as_ref())?;
        let record = MessageRecord::new_outgoing(payload, self.gateway.local_address());
        let hash = record.hash();
        conn.store_outgoing_message(record);
        tracing::debug!(connection = %id, hash = %hash, "message enqueued");
        Ok(hash)
    }

    pub fn flush_incoming(&self, id: &str) -> Result<Vec<MessageRecord>, RegistryError> {
        Ok(self.require(id)?.flush_incoming_messages())
    }

    /// Send `payload` to every recipient of `conn` except this node.
    /// Transport failures are logged and counted as sent.
    pub fn send_to_recipients(&self, conn: &Connection, payload: &[u8]) -> Result<usize, RegistryError> {
        let recipients = conn.recipients();
        if recipients.is_empty() {
            return Err(RegistryError::NoRecipients(conn.id().to_string()));
        }
        let local = self.gateway.local_address();
        let mut sent = 0;
        for to in recipients.into_iter().filter(|r| *r != local) {
            if let Err(e) = self.gateway.send_to(to, payload) {
                tracing::warn!(connection = %conn.id(), to, error = %e, "transport send failed");
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// One sweep at the clock's current millisecond tick.
    pub fn process_outgoing_sweep(&self) -> SweepReport {
        self.sweep_at(self.clock.uptime_millis())
    }

    /// One sweep over every connection's outgoing buffer at tick `now`.
    pub fn sweep_at(&self, now: u32) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.snapshot() {
            let due = self.collect_due(&conn, now, &mut report);
            if due.is_empty() {
                continue;
            }
            if !self.is_registered(&conn) {
                tracing::debug!(connection = %conn.id(), "connection deleted mid-sweep, skipping sends");
                continue;
            }
            for payload in due {
                if let Err(e) = self.send_to_recipients(&conn, &payload) {
                    tracing::warn!(connection = %conn.id(), error = %e, "sweep send skipped");
                }
            }
        }
        report
    }

    /// Walk one outgoing buffer under its lock and return the envelopes
    /// that are due for transmission.
    fn collect_due(&self, conn: &Connection, now: u32, report: &mut SweepReport) -> Vec<Bytes> {
        let interval = self.settings.retry_interval_ms;
        let max_retries = self.settings.max_retries;
        let acks_disabled = self.settings.acks_disabled;
        let mut due = Vec::new();

        conn.with_outgoing(|buf| {
            buf.retain_mut(|rec| {
                if rec.acknowledged {
                    report.removed += 1;
                    return false;
                }
                if rec.retries == 0 {
                    transmit(rec, now, &mut due);
                    report.sent += 1;
                    return true;
                }
                if acks_disabled {
                    rec.mark_acknowledged();
                    report.auto_acknowledged += 1;
                    return true;
                }
                if now.wrapping_sub(rec.last_sent) < interval {
                    return true;
                }
                if rec.retries >= max_retries {
                    tracing::warn!(
                        connection = %conn.id(),
                        hash = %rec.hash(),
                        retries = rec.retries,
                        "message dropped after max retries"
                    );
                    report.dropped += 1;
                    return false;
                }
                tracing::debug!(connection = %conn.id(), hash = %rec.hash(), retries = rec.retries, "retrying");
                transmit(rec, now, &mut due);
                report.sent += 1;
                true
            });
        });
        due
    }

    // ── Incoming ──────────────────────────────────────────────────────────

    /// Route a received envelope to the first connection whose key opens it.
    pub fn process_incoming_frame(&self, payload: &[u8], sender: NodeAddress) -> FrameOutcome {
        tracing::trace!(from = sender, len = payload.len(), "frame received");
        for conn in self.snapshot() {
            let envelope = match conn.decode(payload) {
                Ok(env) => env,
                Err(e) => {
                    tracing::trace!(connection = %conn.id(), error = %e, "key did not match");
                    continue;
                }
            };

            match envelope.kind {
                PayloadType::Ack => {
                    let hash = String::from_utf8_lossy(&envelope.content);
                    let matched = hash
                        .parse::<MessageHash>()
                        .map(|hash| conn.acknowledge_message(&hash))
                        .unwrap_or(false);
                    tracing::debug!(connection = %conn.id(), from = sender, hash = %hash, matched, "ack received");
                    return FrameOutcome::Acknowledged {
                        connection: conn.id().to_string(),
                        matched,
                    };
                }
                PayloadType::Message => {
                    let record = MessageRecord::new_incoming(
                        envelope.content,
                        envelope.epoch,
                        sender,
                        PayloadType::Message,
                    );
                    let hash = record.hash();
                    conn.store_incoming_message(record);
                    tracing::info!(connection = %conn.id(), from = sender, hash = %hash, "message stored");

                    if !self.settings.acks_disabled {
                        self.send_ack(&conn, hash, sender);
                    }
                    return FrameOutcome::Stored {
                        connection: conn.id().to_string(),
                        hash,
                    };
                }
            }
        }
        tracing::debug!(from = sender, len = payload.len(), "frame matched no connection, dropped");
        FrameOutcome::Dropped
    }

    fn send_ack(&self, conn: &Connection, hash: MessageHash, to: NodeAddress) {
        let ack = match conn.prepare_ack(hash, self.clock.as_ref()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(connection = %conn.id(), error = %e, "failed to encode ack");
                return;
            }
        };
        if let Err(e) = self.gateway.send_to(to, &ack.encoded) {
            tracing::warn!(connection = %conn.id(), to, error = %e, "ack send failed");
        }
    }
}

fn transmit(rec: &mut MessageRecord, now: u32, due: &mut Vec<Bytes>) {
    rec.increment_retries();
    rec.update_last_sent_time(now);
    due.push(rec.encoded.clone());
}

/// Ids travel as the envelope's public word and as console arguments.
pub fn is_valid_connection_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('|') && !id.chars().any(char::is_whitespace)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0:?} already exists")]
    ConnectionExists(String),

    #[error("connection {0:?} not found")]
    ConnectionNotFound(String),

    #[error("invalid connection id {0:?}")]
    InvalidConnectionId(String),

    #[error("connection {0:?} has no recipients")]
    NoRecipients(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
