//! State written to the data directory survives a gateway restart.
mod common;

use std::time::Duration;

use common::{collect_messages, next_matching, node_info, settings, start_with, text, unix_ago, wait_link, ALICE, BOB};
use meshchat::gateway::SessionEvent;
use meshchat::mesh::Destination;
use meshchat::storage::messages::DeliveryState;
use meshchat::storage::JsonFileStore;
use tempfile::TempDir;

#[tokio::test]
async fn messages_and_nodes_survive_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let mut h = start_with(settings(), JsonFileStore::open(tmp.path()).unwrap()).await;
        h.radio.send(&node_info(ALICE, "Alice Ridge", unix_ago(30), 1)).await;
        h.radio
            .send(&text(ALICE, Destination::Broadcast, 0, 2, "kept"))
            .await;
        h.radio
            .send(&text(BOB, Destination::Broadcast, 1, 3, "also kept"))
            .await;
        assert_eq!(collect_messages(&mut h.session, Duration::from_millis(300)).await.len(), 2);
        h.gateway.shutdown().await.unwrap();
    }
    assert!(tmp.path().join("messages.json").exists());

    let mut h = start_with(settings(), JsonFileStore::open(tmp.path()).unwrap()).await;
    let handle = h.gateway.handle();
    let status = handle.status().await.unwrap();
    assert_eq!(status.messages, 2);
    assert_eq!(status.nodes, 2);
    assert_eq!(handle.node(ALICE).await.unwrap().long_name.as_deref(), Some("Alice Ridge"));
    let page = handle.history(0, None, None).await.unwrap();
    assert_eq!(page.messages[0].body, "kept");

    // Dedup state is restored along with the messages
    h.radio
        .send(&text(ALICE, Destination::Broadcast, 0, 2, "kept"))
        .await;
    assert!(collect_messages(&mut h.session, Duration::from_millis(200))
        .await
        .is_empty());
    h.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn display_name_change_is_persisted() {
    let tmp = TempDir::new().unwrap();
    {
        let h = start_with(settings(), JsonFileStore::open(tmp.path()).unwrap()).await;
        let profile = h.gateway.handle().set_display_name("Summit Relay").await.unwrap();
        assert_eq!(profile.display_name, "Summit Relay");
        h.gateway.shutdown().await.unwrap();
    }
    let saved = JsonFileStore::read_snapshot(tmp.path()).unwrap();
    assert_eq!(saved.profile.unwrap().display_name, "Summit Relay");

    let h = start_with(settings(), JsonFileStore::open(tmp.path()).unwrap()).await;
    assert_eq!(h.gateway.handle().status().await.unwrap().profile.display_name, "Summit Relay");
    h.gateway.shutdown().await.unwrap();

    // A different node id on the same directory keeps its configured name
    let mut other = settings();
    other.profile.node_id = 0x1234;
    let h = start_with(other, JsonFileStore::open(tmp.path()).unwrap()).await;
    assert_eq!(h.gateway.handle().status().await.unwrap().profile.display_name, "Test Gateway");
    h.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn unfinished_sends_fail_after_restart() {
    let tmp = TempDir::new().unwrap();
    let key = {
        let mut h = start_with(settings(), JsonFileStore::open(tmp.path()).unwrap()).await;
        drop(h.radio);
        wait_link(&mut h.session, false).await;
        let pending = h.session.send(0, "never left").await.unwrap();
        assert_eq!(pending.state, DeliveryState::Pending);
        h.gateway.shutdown().await.unwrap();
        pending.key
    };

    let mut h = start_with(settings(), JsonFileStore::open(tmp.path()).unwrap()).await;
    let page = h.gateway.handle().history(0, None, None).await.unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].key, key);
    assert_eq!(page.messages[0].state, DeliveryState::Failed);
    assert_eq!(h.gateway.handle().status().await.unwrap().outbox.queued, 0);
    // Nothing is replayed onto the new link
    assert!(h.radio.is_silent_for(Duration::from_millis(150)).await);
    h.gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn data_directory_is_locked_while_running() {
    let tmp = TempDir::new().unwrap();
    let h = start_with(settings(), JsonFileStore::open(tmp.path()).unwrap()).await;
    let err = JsonFileStore::open(tmp.path()).unwrap_err();
    assert!(err.to_string().contains("in use"), "{}", err);
    // Read-only inspection still works
    assert!(JsonFileStore::read_snapshot(tmp.path()).is_ok());

    h.gateway.shutdown().await.unwrap();
    assert!(JsonFileStore::open(tmp.path()).is_ok());
}

#[tokio::test]
async fn periodic_flush_writes_without_shutdown() {
    let tmp = TempDir::new().unwrap();
    let mut s = settings();
    s.flush_interval = Duration::from_millis(50);
    let mut h = start_with(s, JsonFileStore::open(tmp.path()).unwrap()).await;
    h.radio
        .send(&text(BOB, Destination::Broadcast, 0, 40, "flushed"))
        .await;
    next_matching(&mut h.session, |e| matches!(e, SessionEvent::Message { .. })).await;

    let deadline = tokio::time::Instant::now() + common::WAIT;
    loop {
        let snapshot = JsonFileStore::read_snapshot(tmp.path()).unwrap();
        if snapshot.messages.iter().any(|m| m.body == "flushed") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "state never flushed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    h.gateway.shutdown().await.unwrap();
}
