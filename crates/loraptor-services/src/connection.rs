//! Connection: a named channel with a shared key and a set of recipients.
//!
//! Each connection owns an incoming and an outgoing `MessageBuffer`. Both
//! buffers and the recipient list sit behind their own mutex. No lock in
//! this module is held across a call out of the module.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use loraptor_core::{
    Clock, DecodeError, EncodeError, Envelope, MessageHash, MessageRecord, NodeAddress,
    PayloadType, PreparedPayload,
};

use crate::buffer::MessageBuffer;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Connection {
    id: String,
    key: String,
    recipients: Mutex<Vec<NodeAddress>>,
    incoming: Mutex<MessageBuffer>,
    outgoing: Mutex<MessageBuffer>,
}

impl Connection {
    /// Duplicate recipients are collapsed, keeping first-seen order.
    pub fn new(
        id: impl Into<String>,
        key: impl Into<String>,
        recipients: impl IntoIterator<Item = NodeAddress>,
        buffer_size: usize,
    ) -> Self {
        let mut unique: Vec<NodeAddress> = Vec::new();
        for r in recipients {
            if !unique.contains(&r) {
                unique.push(r);
            }
        }
        Self {
            id: id.into(),
            key: key.into(),
            recipients: Mutex::new(unique),
            incoming: Mutex::new(MessageBuffer::new(buffer_size)),
            outgoing: Mutex::new(MessageBuffer::new(buffer_size)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ── Codec ─────────────────────────────────────────────────────────────

    /// Encode `plaintext` as a MESSAGE envelope stamped with the clock's
    /// current epoch. Nothing is enqueued.
    pub fn prepare_payload(
        &self,
        plaintext: impl AsRef<[u8]>,
        clock: &dyn Clock,
    ) -> Result<PreparedPayload, EncodeError> {
        self.prepare(PayloadType::Message, Bytes::copy_from_slice(plaintext.as_ref()), clock)
    }

    /// Encode an ACK envelope for `hash`.
    pub fn prepare_ack(&self, hash: MessageHash, clock: &dyn Clock) -> Result<PreparedPayload, EncodeError> {
        self.prepare(PayloadType::Ack, Bytes::from(hash.to_string()), clock)
    }

    fn prepare(&self, kind: PayloadType, content: Bytes, clock: &dyn Clock) -> Result<PreparedPayload, EncodeError> {
        let epoch = clock.epoch_secs();
        let envelope = Envelope {
            public_word: self.id.clone(),
            epoch,
            kind,
            content,
        };
        let encoded = envelope.encode(&self.key)?;
        Ok(PreparedPayload {
            epoch,
            kind,
            plaintext: envelope.content,
            encoded: Bytes::from(encoded),
        })
    }

    /// Try to open a wire payload with this connection's key.
    pub fn decode(&self, wire: &[u8]) -> Result<Envelope, DecodeError> {
        Envelope::decode(wire, &self.key)
    }

    // ── Buffers ───────────────────────────────────────────────────────────

    /// Enqueue for the retry sweep. Returns the evicted record, if any.
    pub fn store_outgoing_message(&self, msg: MessageRecord) -> Option<MessageRecord> {
        let evicted = lock(&self.outgoing).push(msg);
        if let Some(old) = &evicted {
            tracing::debug!(connection = %self.id, hash = %old.hash(), "outgoing buffer full, evicted oldest");
        }
        evicted
    }

    pub fn store_incoming_message(&self, msg: MessageRecord) -> Option<MessageRecord> {
        let evicted = lock(&self.incoming).push(msg);
        if let Some(old) = &evicted {
            tracing::debug!(connection = %self.id, hash = %old.hash(), "incoming buffer full, evicted oldest");
        }
        evicted
    }

    /// Take every buffered incoming message, oldest first.
    pub fn flush_incoming_messages(&self) -> Vec<MessageRecord> {
        lock(&self.incoming).drain()
    }

    /// Mark the first unacknowledged outgoing record with this hash as
    /// acknowledged. The sweep removes it.
    pub fn acknowledge_message(&self, hash: &MessageHash) -> bool {
        let mut outgoing = lock(&self.outgoing);
        if let Some(rec) = outgoing
            .iter_mut()
            .find(|rec| !rec.acknowledged && rec.hash() == *hash)
        {
            rec.mark_acknowledged();
            return true;
        }
        false
    }

    /// Run `f` with the outgoing buffer locked.
    pub(crate) fn with_outgoing<R>(&self, f: impl FnOnce(&mut MessageBuffer) -> R) -> R {
        f(&mut lock(&self.outgoing))
    }

    pub fn outgoing_len(&self) -> usize {
        lock(&self.outgoing).len()
    }

    pub fn incoming_len(&self) -> usize {
        lock(&self.incoming).len()
    }

    /// Copy of the outgoing records, oldest first.
    pub fn outgoing_snapshot(&self) -> Vec<MessageRecord> {
        lock(&self.outgoing).iter().cloned().collect()
    }

    // ── Recipients ────────────────────────────────────────────────────────

    /// Returns false if the address was already a recipient.
    pub fn add_recipient(&self, addr: NodeAddress) -> bool {
        let mut recipients = lock(&self.recipients);
        if recipients.contains(&addr) {
            return false;
        }
        recipients.push(addr);
        true
    }

    /// Returns false if the address was not a recipient.
    pub fn remove_recipient(&self, addr: NodeAddress) -> bool {
        let mut recipients = lock(&self.recipients);
        let before = recipients.len();
        recipients.retain(|r| *r != addr);
        recipients.len() != before
    }

    pub fn recipients(&self) -> Vec<NodeAddress> {
        lock(&self.recipients).clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("recipients", &self.recipients())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loraptor_core::ManualClock;

    fn conn() -> Connection {
        Connection::new("alpha", "secretkey123456", [0x1234], 64)
    }

    #[test]
    fn prepared_payload_decodes_to_message() {
        let clock = ManualClock::new(1_760_000_000, 0);
        let c = conn();
        let p = c.prepare_payload("hello", &clock).unwrap();
        assert_eq!(p.epoch, 1_760_000_000);
        assert_eq!(p.plaintext, "hello");

        let env = c.decode(&p.encoded).unwrap();
        assert_eq!(env.public_word, "alpha");
        assert_eq!(env.kind, PayloadType::Message);
        assert_eq!(env.content, "hello");
        assert_eq!(env.epoch, 1_760_000_000);
        assert_eq!(c.outgoing_len(), 0);
    }

    #[test]
    fn ack_payload_carries_hash() {
        let clock = ManualClock::new(5, 0);
        let c = conn();
        let hash = MessageHash(0xfeed);
        let p = c.prepare_ack(hash, &clock).unwrap();
        let env = c.decode(&p.encoded).unwrap();
        assert_eq!(env.kind, PayloadType::Ack);
        assert_eq!(env.content, "000000000000feed");
    }

    #[test]
    fn acknowledge_marks_first_unacked_match() {
        let clock = ManualClock::new(1, 0);
        let c = conn();
        let p = c.prepare_payload("dup", &clock).unwrap();
        c.store_outgoing_message(MessageRecord::new_outgoing(p.clone(), 1));
        c.store_outgoing_message(MessageRecord::new_outgoing(p, 1));
        let hash = MessageHash::compute("dup", 1, 1);

        assert!(c.acknowledge_message(&hash));
        assert!(c.acknowledge_message(&hash));
        assert!(!c.acknowledge_message(&hash));
        assert!(c.outgoing_snapshot().iter().all(|r| r.acknowledged));
        // removal is left to the sweep
        assert_eq!(c.outgoing_len(), 2);
    }

    #[test]
    fn acknowledge_skips_records_with_other_hashes() {
        let clock = ManualClock::new(9, 0);
        let c = conn();
        for text in ["one", "two", "three"] {
            let p = c.prepare_payload(text, &clock).unwrap();
            c.store_outgoing_message(MessageRecord::new_outgoing(p, 7));
        }
        assert!(c.acknowledge_message(&MessageHash::compute("two", 9, 7)));
        let acked: Vec<bool> = c.outgoing_snapshot().iter().map(|r| r.acknowledged).collect();
        assert_eq!(acked, vec![false, true, false]);
    }

    #[test]
    fn binary_payload_keeps_its_bytes() {
        let clock = ManualClock::new(1, 0);
        let c = conn();
        let p = c.prepare_payload(b"\x00\xff|raw", &clock).unwrap();
        assert_eq!(p.plaintext, &b"\x00\xff|raw"[..]);
        assert_eq!(c.decode(&p.encoded).unwrap().content, &b"\x00\xff|raw"[..]);
    }

    #[test]
    fn unknown_hash_acknowledges_nothing() {
        assert!(!conn().acknowledge_message(&MessageHash(42)));
    }

    #[test]
    fn recipients_are_a_set() {
        let c = Connection::new("a", "k", [1, 2, 1], 4);
        assert_eq!(c.recipients(), vec![1, 2]);
        assert!(!c.add_recipient(2));
        assert!(c.add_recipient(3));
        assert!(c.remove_recipient(1));
        assert!(!c.remove_recipient(99));
        assert_eq!(c.recipients(), vec![2, 3]);
    }

    #[test]
    fn incoming_flush_drains() {
        let c = conn();
        c.store_incoming_message(MessageRecord::new_incoming("a".into(), 1, 2, PayloadType::Message));
        c.store_incoming_message(MessageRecord::new_incoming("b".into(), 2, 2, PayloadType::Message));
        let flushed = c.flush_incoming_messages();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].content, "a");
        assert!(c.flush_incoming_messages().is_empty());
    }

    #[test]
    fn outgoing_overflow_evicts_oldest() {
        let clock = ManualClock::new(0, 0);
        let c = Connection::new("a", "k", [1], 64);
        for n in 0..65u32 {
            clock.set_epoch(n);
            let p = c.prepare_payload("m", &clock).unwrap();
            let evicted = c.store_outgoing_message(MessageRecord::new_outgoing(p, 1));
            assert_eq!(evicted.is_some(), n == 64);
            if let Some(old) = evicted {
                assert_eq!(old.epoch, 0);
            }
        }
        assert_eq!(c.outgoing_len(), 64);
    }
}
