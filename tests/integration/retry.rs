use anyhow::{Context, Result};

use crate::*;

/// A message nobody acknowledges is sent exactly five times, at least the
/// retry interval apart, then dropped.
#[test]
fn test_retry_bound_without_ack() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let conn = a.registry.create_connection("alpha", KEY, &[0x0099])?;
    a.registry.send_message("alpha", "anyone?")?;

    sim.run_for(&[&a], 30_000);

    let sends = a.gateway.sent_frames();
    assert_eq!(sends.len(), 5);
    for pair in sends.windows(2) {
        let gap = pair[1].at_millis.wrapping_sub(pair[0].at_millis);
        assert!(gap >= 5000, "retry after only {gap} ms");
    }
    assert!(sends.iter().all(|f| f.payload == sends[0].payload), "retries reuse the envelope");
    assert_eq!(conn.outgoing_len(), 0);
    Ok(())
}

/// The receiver comes online between retries; the next retry is
/// acknowledged and nothing more is sent.
#[test]
fn test_ack_arrives_mid_retry() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    let b = sim.node(NODE_B);
    a.registry.create_connection("alpha", KEY, &[NODE_B])?;

    a.registry.send_message("alpha", "wake up")?;
    sim.run_for(&[&a, &b], 5000);
    sim.step(&[&a, &b], 100);
    assert_eq!(a.sent(), 2);
    assert_eq!(b.sent(), 0);

    b.registry.create_connection("alpha", KEY, &[NODE_A])?;
    sim.run_for(&[&a, &b], 20_000);

    assert_eq!(a.sent(), 3);
    assert_eq!(b.registry.flush_incoming("alpha")?.len(), 1);
    assert_eq!(a.registry.get("alpha").context("missing")?.outgoing_len(), 0);
    Ok(())
}

/// With ACKs disabled the sender transmits once and forgets; the receiver
/// stores without replying.
#[test]
fn test_acks_disabled_fire_and_forget() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node_with(NODE_A, acks_disabled());
    let b = sim.node_with(NODE_B, acks_disabled());
    let conn = a.registry.create_connection("alpha", KEY, &[NODE_B])?;
    b.registry.create_connection("alpha", KEY, &[NODE_A])?;

    a.registry.send_message("alpha", "no reply needed")?;
    sim.step(&[&a, &b], 100);
    assert_eq!(conn.outgoing_snapshot()[0].retries, 1);

    sim.step(&[&a, &b], 100);
    assert!(conn.outgoing_snapshot()[0].acknowledged);

    sim.step(&[&a, &b], 100);
    assert_eq!(conn.outgoing_len(), 0);

    sim.run_for(&[&a, &b], 20_000);
    assert_eq!(a.sent(), 1);
    assert_eq!(b.sent(), 0);
    assert_eq!(b.registry.flush_incoming("alpha")?.len(), 1);
    Ok(())
}

/// Deleting a connection discards its queue; nothing is sent afterwards.
#[test]
fn test_delete_connection_stops_retries() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    a.registry.create_connection("alpha", KEY, &[0x0099])?;
    a.registry.send_message("alpha", "soon gone")?;

    sim.step(&[&a], 100);
    assert_eq!(a.sent(), 1);

    a.registry.delete_connection("alpha")?;
    sim.run_for(&[&a], 30_000);
    assert_eq!(a.sent(), 1);
    assert!(a.registry.connection_ids().is_empty());
    Ok(())
}

/// Removing the only recipient mid-retry: retries keep counting with
/// nobody to send to, and the record is dropped at the bound.
#[test]
fn test_recipient_removed_mid_retry() -> Result<()> {
    let sim = Sim::new();
    let a = sim.node(NODE_A);
    a.registry.create_connection("alpha", KEY, &[0x0099])?;
    a.registry.send_message("alpha", "hello?")?;
    sim.step(&[&a], 100);

    assert!(a.registry.remove_recipient("alpha", 0x0099)?);
    sim.run_for(&[&a], 30_000);

    assert_eq!(a.sent(), 1);
    assert_eq!(a.registry.get("alpha").context("missing")?.outgoing_len(), 0);
    Ok(())
}
