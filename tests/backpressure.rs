mod common;

use anyhow::Result;
use common::{test_config, TestServer};
use ntsync_server::protocol::Message;
use ntsync_server::Config;
use std::time::Duration;

#[test]
fn slow_client_gets_one_resync_marker_then_a_consistent_snapshot() -> Result<()> {
    let config = Config {
        outbound_queue_capacity: 16,
        connection_buffer_size: 1024,
        liveness_timeout_ms: 60_000,
        ..test_config()
    };
    let ts = TestServer::start(config)?;
    let mut slow = ts.connect("slow")?;
    slow.set_read_timeout(Some(Duration::from_secs(10)))?;

    // far more than the socket buffers can hold while the client sleeps
    let store = ts.server.store();
    let payload = "x".repeat(4096);
    for i in 0..10_000 {
        store.set_value("/bulk/counter", i as f64);
        store.set_value(&format!("/bulk/{}", i % 64), payload.as_str());
    }

    let mut markers = 0;
    loop {
        if slow.recv()? == Message::ResyncRequired {
            markers += 1;
            break;
        }
    }

    slow.send(&Message::SnapshotRequest)?;
    loop {
        match slow.recv()? {
            Message::ResyncRequired => markers += 1,
            Message::HelloComplete { .. } => break,
            _ => {}
        }
    }
    assert_eq!(markers, 1);

    assert_eq!(slow.names(), store.names());
    for name in store.names() {
        assert_eq!(slow.get_value(&name), store.get_value(&name).as_ref(), "{}", name);
    }
    Ok(())
}
