//! Message records: one logical message plus its delivery bookkeeping.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::envelope::PayloadType;
use crate::wire::NodeAddress;

// ── Hash ──────────────────────────────────────────────────────────────────────

/// 64-bit message identity hash, rendered as 16 lowercase hex digits.
///
/// Identity only. This is not a security primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHash(pub u64);

const DJB2_SEED: u64 = 5381;

/// DJB2 mixing hash: `h = h * 33 + b`, wrapping.
pub fn djb2(seed: u64, data: &[u8]) -> u64 {
    data.iter()
        .fold(seed, |h, &b| h.wrapping_mul(33).wrapping_add(b as u64))
}

impl MessageHash {
    /// Hash of `content ++ epoch (BE) ++ sender (BE)`.
    pub fn compute(content: impl AsRef<[u8]>, epoch: u32, sender: NodeAddress) -> Self {
        let h = djb2(DJB2_SEED, content.as_ref());
        let h = djb2(h, &epoch.to_be_bytes());
        Self(djb2(h, &sender.to_be_bytes()))
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

impl FromStr for MessageHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = [0u8; 8];
        hex::decode_to_slice(s, &mut raw)?;
        Ok(Self(u64::from_be_bytes(raw)))
    }
}

impl Serialize for MessageHash {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageHash {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Record ────────────────────────────────────────────────────────────────────

/// A message held in a connection buffer.
///
/// `content` is the plaintext bytes as sent. `encoded` is the wire envelope,
/// built once when an outgoing record is created and reused on every retry;
/// incoming records leave it empty.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub content: Bytes,
    pub epoch: u32,
    pub sender: NodeAddress,
    pub kind: PayloadType,
    pub encoded: Bytes,
    pub acknowledged: bool,
    pub retries: u8,
    /// Milliseconds on the node's monotonic clock.
    pub last_sent: u32,
}

impl MessageRecord {
    pub fn new_outgoing(payload: PreparedPayload, sender: NodeAddress) -> Self {
        Self {
            content: payload.plaintext,
            epoch: payload.epoch,
            sender,
            kind: payload.kind,
            encoded: payload.encoded,
            acknowledged: false,
            retries: 0,
            last_sent: 0,
        }
    }

    pub fn new_incoming(content: Bytes, epoch: u32, sender: NodeAddress, kind: PayloadType) -> Self {
        Self {
            content,
            epoch,
            sender,
            kind,
            encoded: Bytes::new(),
            acknowledged: false,
            retries: 0,
            last_sent: 0,
        }
    }

    /// Content for display; invalid UTF-8 is replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    pub fn hash(&self) -> MessageHash {
        MessageHash::compute(&self.content, self.epoch, self.sender)
    }

    pub fn mark_acknowledged(&mut self) {
        self.acknowledged = true;
    }

    pub fn increment_retries(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    pub fn update_last_sent_time(&mut self, now_ms: u32) {
        self.last_sent = now_ms;
    }
}

/// An encoded envelope ready to be wrapped in an outgoing record.
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub epoch: u32,
    pub kind: PayloadType,
    pub plaintext: Bytes,
    pub encoded: Bytes,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
