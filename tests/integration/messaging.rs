use anyhow::{Context, Result};

use loraptor_core::{MessageHash, PayloadType, BROADCAST_ADDR};

use crate::*;

/// A sends to B; B stores and ACKs; A clears the record on the next sweep.
#[test]
fn test_two_nodes_message_and_ack() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    a.registry.create_connection("alpha", KEY, &[NODE_B])?;
    b.registry.create_connection("alpha", KEY, &[NODE_A])?;

    let hash = a.registry.send_message("alpha", "hello")?;
    sim.step(&[&a, &b], 100);

    let inbox = b.registry.flush_incoming("alpha")?;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].content, "hello");
    assert_eq!(inbox[0].sender, NODE_A);
    assert_eq!(inbox[0].kind, PayloadType::Message);
    assert_eq!(inbox[0].hash(), hash);

    let conn = a.registry.get("alpha").context("alpha missing on A")?;
    assert!(conn.outgoing_snapshot()[0].acknowledged);

    sim.step(&[&a, &b], 100);
    assert_eq!(conn.outgoing_len(), 0);
    assert_eq!(a.sent(), 1, "acked message must not be retried");
    assert_eq!(b.sent(), 1, "exactly one ack");
    Ok(())
}

/// Frames carry no connection id: the receiver's key decides.
#[test]
fn test_routing_by_key() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    a.registry.create_connection("a", "k1", &[NODE_B])?;
    b.registry.create_connection("b", "k2", &[NODE_A])?;
    b.registry.create_connection("a", "k1", &[NODE_A])?;

    a.registry.send_message("a", "for a only")?;
    sim.step(&[&a, &b], 100);

    assert_eq!(b.registry.flush_incoming("a")?.len(), 1);
    assert!(b.registry.flush_incoming("b")?.is_empty());
    Ok(())
}

/// A receiver whose connection has another name but the same key still
/// accepts the frame.
#[test]
fn test_same_key_different_name() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    a.registry.create_connection("alpha", KEY, &[NODE_B])?;
    b.registry.create_connection("bravo", KEY, &[NODE_A])?;

    a.registry.send_message("alpha", "hi")?;
    sim.step(&[&a, &b], 100);

    assert_eq!(b.registry.flush_incoming("bravo")?.len(), 1);
    Ok(())
}

/// Unrelated nodes hear nothing they can open.
#[test]
fn test_wrong_key_receiver_drops_frame() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    a.registry.create_connection("alpha", KEY, &[NODE_B])?;
    b.registry.create_connection("alpha", "some other key", &[NODE_A])?;

    a.registry.send_message("alpha", "the quick brown fox jumps over the lazy dog")?;
    sim.step(&[&a, &b], 100);

    assert!(b.registry.flush_incoming("alpha")?.is_empty());
    assert_eq!(b.sent(), 0);
    Ok(())
}

/// A broadcast recipient reaches every node. The first ACK clears the
/// record; later ACKs for the same hash match nothing.
#[test]
fn test_broadcast_recipient() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    let c = sim.node(NODE_C);
    a.registry.create_connection("all", KEY, &[BROADCAST_ADDR])?;
    b.registry.create_connection("all", KEY, &[NODE_A])?;
    c.registry.create_connection("all", KEY, &[NODE_A])?;

    a.registry.send_message("all", "everyone")?;
    sim.step(&[&a, &b, &c], 100);

    assert_eq!(b.registry.flush_incoming("all")?.len(), 1);
    assert_eq!(c.registry.flush_incoming("all")?.len(), 1);
    assert_eq!(b.sent() + c.sent(), 2);

    sim.step(&[&a, &b, &c], 100);
    assert_eq!(a.registry.get("all").context("missing")?.outgoing_len(), 0);
    assert_eq!(a.sent(), 1);
    Ok(())
}

/// Multiple recipients each get one frame per transmission; the local
/// address is never sent to.
#[test]
fn test_multiple_recipients_skip_self() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    let c = sim.node(NODE_C);
    a.registry.create_connection("group", KEY, &[NODE_A, NODE_B, NODE_C])?;
    b.registry.create_connection("group", KEY, &[NODE_A])?;
    c.registry.create_connection("group", KEY, &[NODE_A])?;

    a.registry.send_message("group", "to both")?;
    sim.step(&[&a, &b, &c], 100);

    let dests: Vec<_> = a.gateway.sent_frames().iter().map(|f| f.dest).collect();
    assert_eq!(dests, vec![NODE_B, NODE_C]);
    assert_eq!(b.registry.flush_incoming("group")?.len(), 1);
    assert_eq!(c.registry.flush_incoming("group")?.len(), 1);
    Ok(())
}

/// A lost ACK makes the sender retry, and the receiver stores the
/// duplicate: there is no receive-side deduplication.
#[test]
fn test_lost_ack_causes_duplicate_delivery() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    a.registry.create_connection("alpha", KEY, &[NODE_B])?;
    b.registry.create_connection("alpha", KEY, &[NODE_A])?;

    b.gateway.set_fail_sends(true);
    let hash = a.registry.send_message("alpha", "are you there")?;
    sim.run_for(&[&a, &b], 5000);
    sim.step(&[&a, &b], 100);
    assert_eq!(a.sent(), 2);

    b.gateway.set_fail_sends(false);
    sim.run_for(&[&a, &b], 5000);
    sim.step(&[&a, &b], 100);

    let inbox = b.registry.flush_incoming("alpha")?;
    assert_eq!(inbox.len(), 3);
    assert!(inbox.iter().all(|r| r.hash() == hash));
    assert_eq!(a.registry.get("alpha").context("missing")?.outgoing_len(), 0);
    assert_eq!(a.sent(), 3);
    Ok(())
}

/// Sixty-five messages queued before a sweep: the oldest is evicted and
/// sixty-four go out.
#[test]
fn test_outgoing_overflow_evicts_oldest() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let conn = a.registry.create_connection("alpha", KEY, &[NODE_B])?;

    let mut hashes: Vec<MessageHash> = Vec::new();
    for n in 0..65 {
        hashes.push(a.registry.send_message("alpha", &format!("message {n}"))?);
    }
    assert_eq!(conn.outgoing_len(), 64);
    let queued: Vec<MessageHash> = conn.outgoing_snapshot().iter().map(|r| r.hash()).collect();
    assert_eq!(queued, hashes[1..]);

    sim.step(&[&a], 100);
    assert_eq!(a.sent(), 64);
    Ok(())
}

/// Both sides can send on the same connection at once.
#[test]
fn test_bidirectional_exchange() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    a.registry.create_connection("alpha", KEY, &[NODE_B])?;
    b.registry.create_connection("alpha", KEY, &[NODE_A])?;

    a.registry.send_message("alpha", "ping")?;
    b.registry.send_message("alpha", "pong")?;
    sim.step(&[&a, &b], 100);
    sim.step(&[&a, &b], 100);

    assert_eq!(a.registry.flush_incoming("alpha")?[0].content, "pong");
    assert_eq!(b.registry.flush_incoming("alpha")?[0].content, "ping");
    assert_eq!(a.registry.get("alpha").context("missing")?.outgoing_len(), 0);
    assert_eq!(b.registry.get("alpha").context("missing")?.outgoing_len(), 0);
    Ok(())
}
