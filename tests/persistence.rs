mod common;

use anyhow::Result;
use common::{assign_for, recv_until, test_config, TestServer};
use ntsync_server::persist;
use ntsync_server::protocol::Message;
use ntsync_server::store::{EntryFlags, Value};
use ntsync_server::Config;
use std::fs;
use std::path::Path;

fn persistent_config(path: &Path) -> Config {
    Config {
        persist_path: Some(path.to_string_lossy().into_owned()),
        flush_interval_ms: 50,
        ..test_config()
    }
}

#[test]
fn persistent_entry_survives_restart_with_fresh_sequence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("networktables.json");
    assert!(persist::ensure_store_file(&path)?);

    let ts = TestServer::start(persistent_config(&path))?;
    let mut client = ts.connect("demo")?;

    client.set_value("/datatable/test", 10.0)?;
    recv_until(&mut client, assign_for("/datatable/test"))?;
    client.set_value("/datatable/test", 10.0)?;
    recv_until(&mut client, |m| matches!(m, Message::EntryUpdate { .. }))?;
    client.set_value("/datatable/x", 5.0)?;
    client.set_persistent("/datatable/test")?;
    recv_until(&mut client, |m| matches!(m, Message::EntryFlagsUpdate { .. }))?;

    let before = ts.server.store().get("/datatable/test").expect("entry exists");
    assert!(before.sequence > 0);
    assert_eq!(ts.server.flush_now()?, 1);
    ts.stop()?;

    let saved = persist::load(&path)?;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].name, "/datatable/test");

    let ts = TestServer::start(persistent_config(&path))?;
    let entry = ts.server.store().get("/datatable/test").expect("restored");
    assert_eq!(entry.value, Value::Double(10.0));
    assert!(entry.flags.contains(EntryFlags::PERSISTENT));
    assert_eq!(entry.sequence, 0);
    assert!(ts.server.store().get("/datatable/x").is_none());

    let client = ts.connect("demo-again")?;
    assert_eq!(client.get("/datatable/test").map(|e| e.sequence), Some(0));
    Ok(())
}

#[test]
fn losing_the_flag_drops_the_entry_from_the_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("networktables.json");

    let ts = TestServer::start(persistent_config(&path))?;
    let store = ts.server.store();
    store.set_value("/keep", "yes");
    store.set_persistent("/keep");
    store.set_value("/drop", "no");
    store.set_persistent("/drop");
    assert_eq!(ts.server.flush_now()?, 2);

    store.clear_persistent("/drop");
    ts.stop()?;

    let names: Vec<String> = persist::load(&path)?.into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["/keep".to_string()]);
    Ok(())
}

#[test]
fn corrupt_store_file_starts_empty() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("networktables.json");
    fs::write(&path, "{ this is not a store")?;

    let ts = TestServer::start(persistent_config(&path))?;
    assert!(ts.server.store().is_empty());

    ts.server.store().set_value("/fresh", 1.0);
    ts.server.store().set_persistent("/fresh");
    ts.stop()?;

    assert_eq!(persist::load(&path)?.len(), 1);
    Ok(())
}
