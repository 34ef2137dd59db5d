//! Hub-mode relay integration tests.
//!
//! Each client negotiates a memory peer connection with the relay over a
//! real control socket; data-channel traffic is copied between clients.

mod common;

use std::time::Duration;

use peerpoint_core::{ChannelEvent, DataChannel, DataMessage, PeerConnection, SignalingState};
use serde_json::json;

use common::{next_data_message, wait_until, HubClient, TestServer};

fn snapshot_of(client: &HubClient, hue: f64) -> String {
    json!({
        "clientId": client.id.as_str(),
        "hue": hue,
        "pointers": {
            "ids": [1],
            "entities": {"1": {"pointerId": 1, "pointerType": "mouse", "pressure": 0.5, "x": 10.0, "y": 20.0}}
        }
    })
    .to_string()
}

#[tokio::test]
async fn negotiation_reaches_stable_on_both_sides() {
    let server = TestServer::start_hub().await;
    let a = HubClient::connect(&server).await;

    assert!(wait_until(|| server.relay().registry().channel_count() == 1).await);
    assert_eq!(a.peer.signaling_state(), SignalingState::Stable);
    let relay_peer = server.factory().relay_peer(&a.id).expect("relay peer");
    assert_eq!(relay_peer.signaling_state(), SignalingState::Stable);
    assert!(relay_peer.remote_description().is_some_and(|d| d.is_offer()));
    assert!(wait_until(|| !relay_peer.applied_candidates().is_empty()).await);

    server.shutdown().await;
}

#[tokio::test]
async fn data_messages_reach_every_other_client() {
    let server = TestServer::start_hub().await;
    let a = HubClient::connect(&server).await;
    let mut b = HubClient::connect(&server).await;
    let mut c = HubClient::connect(&server).await;
    assert!(wait_until(|| server.relay().registry().channel_count() == 3).await);

    let text = snapshot_of(&a, 120.0);
    a.send(&text).await;

    assert_eq!(next_data_message(&mut b.messages).await, Some(text.clone()));
    assert_eq!(next_data_message(&mut c.messages).await, Some(text));

    server.shutdown().await;
}

#[tokio::test]
async fn channel_failure_removes_only_that_client() {
    let server = TestServer::start_hub().await;
    let a = HubClient::connect(&server).await;
    let mut b = HubClient::connect(&server).await;
    let mut c = HubClient::connect(&server).await;
    assert!(wait_until(|| server.relay().registry().channel_count() == 3).await);

    server
        .factory()
        .relay_peer(&c.id)
        .and_then(|peer| peer.channel("pointers"))
        .expect("relay end of c's channel")
        .fail("transport lost");

    // The relay closes C's control socket, which ends C's driver.
    tokio::time::timeout(Duration::from_secs(5), &mut c.driver)
        .await
        .expect("c's control socket was not closed")
        .expect("driver task");
    assert!(wait_until(|| server.relay().registry().len() == 2).await);
    assert!(!server.relay().registry().contains(&c.id));

    let text = snapshot_of(&a, 42.0);
    a.send(&text).await;
    assert_eq!(next_data_message(&mut b.messages).await, Some(text.clone()));

    let mut c_saw = Vec::new();
    while let Some(event) = c.messages.try_recv() {
        c_saw.push(event);
    }
    assert!(!c_saw.contains(&ChannelEvent::Message(text)));
    assert!(wait_until(|| !c.channel.is_open()).await);

    server.shutdown().await;
}

#[tokio::test]
async fn new_channel_receives_known_snapshots() {
    let server = TestServer::start_hub().await;
    let a = HubClient::connect(&server).await;
    assert!(wait_until(|| server.relay().registry().channel_count() == 1).await);

    a.send(&snapshot_of(&a, 200.0)).await;
    assert!(wait_until(|| server.relay().replica_state().contains(&a.id)).await);

    let mut b = HubClient::connect(&server).await;
    let text = next_data_message(&mut b.messages).await.expect("snapshot");
    match DataMessage::decode(&text).expect("data message") {
        DataMessage::Snapshot(data) => {
            assert_eq!(data.client_id, a.id);
            assert!((data.hue - 200.0).abs() < f64::EPSILON);
            assert_eq!(data.pointers.ids(), &[1]);
        }
        other => panic!("expected a snapshot, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn resync_is_answered_by_the_hub() {
    let server = TestServer::start_hub().await;
    let a = HubClient::connect(&server).await;
    let mut b = HubClient::connect(&server).await;
    assert!(wait_until(|| server.relay().registry().channel_count() == 2).await);

    let text = snapshot_of(&a, 10.0);
    a.send(&text).await;
    assert_eq!(next_data_message(&mut b.messages).await, Some(text));

    let resync = DataMessage::ResyncRequest(a.id.clone()).encode().expect("encode");
    b.send(&resync).await;

    let reply = next_data_message(&mut b.messages).await.expect("resync reply");
    assert!(matches!(
        DataMessage::decode(&reply),
        Ok(DataMessage::Snapshot(data)) if data.client_id == a.id
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn departure_removes_client_from_replica() {
    let server = TestServer::start_hub().await;
    let a = HubClient::connect(&server).await;
    let mut b = HubClient::connect(&server).await;
    assert!(wait_until(|| server.relay().registry().channel_count() == 2).await);

    let text = snapshot_of(&a, 300.0);
    a.send(&text).await;
    assert_eq!(next_data_message(&mut b.messages).await, Some(text));

    a.driver.abort();
    a.channel.close().await;

    let removal = next_data_message(&mut b.messages).await.expect("removal patch");
    match DataMessage::decode(&removal).expect("data message") {
        DataMessage::Patches(patches) => assert_eq!(patches.len(), 1),
        other => panic!("expected patches, got {other:?}"),
    }
    assert!(wait_until(|| !server.relay().replica_state().contains(&a.id)).await);

    server.shutdown().await;
}
