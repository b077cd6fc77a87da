mod common;

use anyhow::{Context, Result};
use common::{assign_for, recv_until, wait_for, TestServer};
use ntsync_server::notify::{Event, EventKind, EventKinds, Handler, Pattern};
use ntsync_server::protocol::{Message, PROTOCOL_VERSION};
use ntsync_server::store::{list_entries, list_tables, EntryFlags, Value};
use ntsync_server::{Client, Error};
use parking_lot::Mutex;
use std::sync::Arc;

#[test]
fn handshake_delivers_snapshot() -> Result<()> {
    let ts = TestServer::memory_only()?;
    let store = ts.server.store();
    store.set_value("/datatable/x", 5.0);
    store.set_value("/SmartDashboard/Compressor Enabled", true);

    let client = ts.connect("dashboard")?;
    assert_eq!(client.version(), Some(PROTOCOL_VERSION));
    assert_eq!(client.get_value("/datatable/x"), Some(&Value::Double(5.0)));
    assert_eq!(
        client.get_value("/SmartDashboard/Compressor Enabled"),
        Some(&Value::Boolean(true))
    );

    assert!(wait_for(|| ts.server.clients().len() == 1));
    let info = &ts.server.clients()[0];
    assert_eq!(info.name.as_deref(), Some("dashboard"));
    assert_eq!(info.version, Some(PROTOCOL_VERSION));
    let by_id = ts.server.client(info.id).context("client registered by id")?;
    assert_eq!(by_id.addr, info.addr);
    Ok(())
}

#[test]
fn writes_fan_out_to_every_client() -> Result<()> {
    let ts = TestServer::memory_only()?;
    let mut a = ts.connect("a")?;
    let mut b = ts.connect("b")?;

    a.set_value("/datatable/y", 1.0)?;
    recv_until(&mut a, assign_for("/datatable/y"))?;
    recv_until(&mut b, assign_for("/datatable/y"))?;

    a.set_value("/datatable/y", 2.0)?;
    let seen = recv_until(&mut b, |m| matches!(m, Message::EntryUpdate { .. }))?;
    assert_eq!(
        seen,
        Message::EntryUpdate {
            name: "/datatable/y".into(),
            sequence: 1,
            value: Value::Double(2.0),
        }
    );

    let entry = ts.server.store().get("/datatable/y").expect("entry exists");
    assert_eq!(entry.sequence, 1);
    assert_eq!(entry.value, Value::Double(2.0));
    Ok(())
}

#[test]
fn stale_write_is_rejected_and_sender_converges() -> Result<()> {
    let ts = TestServer::memory_only()?;
    let mut a = ts.connect("a")?;
    let mut b = ts.connect("b")?;

    ts.server.store().set_value("/x", 0.0);
    recv_until(&mut a, assign_for("/x"))?;
    recv_until(&mut b, assign_for("/x"))?;

    // both clients observed sequence 0; a gets there first
    a.set_value("/x", 1.0)?;
    recv_until(&mut a, |m| matches!(m, Message::EntryUpdate { .. }))?;
    b.set_value("/x", 2.0)?;

    let answer = recv_until(&mut b, assign_for("/x"))?;
    assert_eq!(
        answer,
        Message::EntryAssign {
            name: "/x".into(),
            sequence: 1,
            flags: EntryFlags::NONE,
            value: Value::Double(1.0),
        }
    );
    assert_eq!(b.get_value("/x"), Some(&Value::Double(1.0)));
    assert_eq!(ts.server.store().get_value("/x"), Some(Value::Double(1.0)));
    Ok(())
}

#[test]
fn old_protocol_version_is_refused() -> Result<()> {
    let ts = TestServer::memory_only()?;
    let mut client = Client::connect(ts.addr)?;

    match client.hello_with_version(0x0200, "legacy", false) {
        Err(Error::UnsupportedVersion { client, server }) => {
            assert_eq!(client, 0x0200);
            assert_eq!(server, PROTOCOL_VERSION);
        }
        other => panic!("expected UnsupportedVersion, got {:?}", other),
    }
    assert!(client.recv().is_err());
    assert!(wait_for(|| ts.server.active_connections() == 0));
    Ok(())
}

#[test]
fn malformed_frame_closes_only_that_connection() -> Result<()> {
    let ts = TestServer::memory_only()?;
    let mut good = ts.connect("good")?;
    let mut bad = ts.connect("bad")?;

    bad.send_raw(&[0, 0, 0, 2, 0x7f, 0x00])?;
    let mut closed = false;
    for _ in 0..16 {
        if bad.recv().is_err() {
            closed = true;
            break;
        }
    }
    assert!(closed);

    ts.server.store().set_value("/after", true);
    recv_until(&mut good, assign_for("/after"))?;
    assert!(wait_for(|| ts.server.active_connections() == 1));
    Ok(())
}

#[test]
fn delete_fires_once_and_leaves_the_table() -> Result<()> {
    let ts = TestServer::memory_only()?;
    let store = ts.server.store();
    store.set_value("/t/a", 1.0);
    store.set_value("/t/b", 2.0);
    assert!(list_tables(store, "/").contains("/t/"));

    let mut watcher = Client::connect(ts.addr)?;
    watcher.hello("watcher", true)?;
    watcher.subscribe(Pattern::Prefix("/t/".into()), EventKinds::DELETED, false)?;
    watcher.subscribe(Pattern::Exact("/t/a".into()), EventKinds::DELETED, false)?;
    // the snapshot answer proves both subscriptions are registered
    assert_eq!(watcher.request_snapshot()?, 2);

    let mut writer = ts.connect("writer")?;
    writer.delete("/t/a")?;
    recv_until(&mut writer, |m| matches!(m, Message::EntryDelete { .. }))?;
    store.delete("/t/b", ntsync_server::store::Writer::Local);

    let first = recv_until(&mut watcher, |m| matches!(m, Message::EntryDelete { .. }))?;
    let second = recv_until(&mut watcher, |m| matches!(m, Message::EntryDelete { .. }))?;
    assert_eq!(first, Message::EntryDelete { name: "/t/a".into() });
    assert_eq!(second, Message::EntryDelete { name: "/t/b".into() });

    assert!(list_entries(store, "/t").is_empty());
    assert!(!list_tables(store, "/").contains("/t/"));
    Ok(())
}

#[test]
fn local_listener_sees_remote_writes() -> Result<()> {
    let ts = TestServer::memory_only()?;
    let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: Handler = Arc::new(move |event: &Event| sink.lock().push(event.clone()));
    ts.server.add_listener(
        Pattern::Prefix("/SmartDashboard/".into()),
        EventKinds::VALUE_ALL,
        false,
        handler,
    );

    let mut client = ts.connect("robot")?;
    client.set_value("/SmartDashboard/Compressor Enabled", true)?;
    client.set_value("/elsewhere", 1.0)?;

    assert!(wait_for(|| seen.lock().len() == 1));
    let event = seen.lock()[0].clone();
    assert_eq!(event.kind, EventKind::Created);
    assert_eq!(event.value, Value::Boolean(true));
    Ok(())
}

#[test]
fn huge_sequence_from_a_client_is_harmless() -> Result<()> {
    let ts = TestServer::memory_only()?;
    ts.server.store().set_value("/x", 1.0);

    let mut rogue = Client::connect(ts.addr)?;
    rogue.hello("rogue", true)?;
    rogue.send(&Message::EntryUpdate {
        name: "/x".into(),
        sequence: u64::MAX,
        value: Value::Double(2.0),
    })?;
    rogue.send(&Message::EntryAssign {
        name: "/x".into(),
        sequence: 0,
        flags: EntryFlags::NONE,
        value: Value::Double(3.0),
    })?;
    // answered in order, so both writes are in
    assert_eq!(rogue.request_snapshot()?, 0);

    ts.server.store().set_value("/x", 4.0);
    let entry = ts.server.store().get("/x").context("entry exists")?;
    assert_eq!(entry.sequence, 3);
    assert_eq!(entry.value, Value::Double(4.0));

    let mut honest = ts.connect("honest")?;
    honest.set_value("/x", 5.0)?;
    let echoed = recv_until(&mut honest, |m| matches!(m, Message::EntryUpdate { .. }))?;
    assert_eq!(
        echoed,
        Message::EntryUpdate {
            name: "/x".into(),
            sequence: 4,
            value: Value::Double(5.0),
        }
    );
    assert!(wait_for(|| ts.server.active_connections() == 2));
    Ok(())
}
