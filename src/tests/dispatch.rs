//! Inbound dispatch races and operation timeouts.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::hub::{run_single_keygen, spawn_node, spawn_node_with, wait_until, GossipHub};
use crate::config::Settings;
use crate::coordinator::registry::{OperationEntry, INBOUND_QUEUE_CAPACITY};
use crate::models::{GossipMessage, Message, Peer, Protocol, SignRequest};

fn envelope(message_id: &str, sender: &str) -> Message {
    let gossip = GossipMessage {
        message_id: message_id.to_string(),
        message: "00".to_string(),
        sender_id: sender.to_string(),
        receiver_id: String::new(),
    };
    Message {
        message: serde_json::to_string(&gossip).unwrap(),
        sender: sender.to_string(),
        topic: "tss".to_string(),
    }
}

fn raw_entry(correlator: &str) -> (OperationEntry, mpsc::Receiver<GossipMessage>) {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    (
        OperationEntry {
            correlator: correlator.to_string(),
            channel_id: format!("test{correlator}"),
            protocol: Protocol::Eddsa,
            class_name: "eddsaSign".to_string(),
            queue: tx,
            started_at: Instant::now(),
        },
        rx,
    )
}

#[tokio::test]
async fn early_message_waits_for_admission_and_delivers_once() {
    let hub = GossipHub::new();
    let node = spawn_node(&hub, "p1").await;

    // frame arrives before the matching operation exists
    node.coordinator
        .handle_inbound(envelope("eddsaff00", "p2"));
    tokio::time::sleep(Duration::from_millis(60)).await;

    let (entry, mut rx) = raw_entry("eddsaff00");
    node.coordinator.registry().insert(entry).unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("dispatcher never delivered")
        .unwrap();
    assert_eq!(delivered.sender_id, "p2");

    // exactly once
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unmatched_message_is_dropped_after_the_dispatch_timeout() {
    let hub = GossipHub::new();
    let home = tempfile::tempdir().unwrap();
    let mut settings = Settings::for_tests(home.path().to_str().unwrap());
    settings.message_timeout = 1;
    let node = spawn_node_with(&hub, "p1", home, settings).await;

    node.coordinator
        .handle_inbound(envelope("eddsaorphan", "p2"));
    tokio::time::sleep(Duration::from_millis(1300)).await;

    // registering afterwards gets nothing: the frame is gone
    let (entry, mut rx) = raw_entry("eddsaorphan");
    node.coordinator.registry().insert(entry).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn closed_queue_swallows_late_frames() {
    let hub = GossipHub::new();
    let node = spawn_node(&hub, "p1").await;

    let (entry, rx) = raw_entry("eddsaclosed");
    node.coordinator.registry().insert(entry).unwrap();
    // the driver side is gone but the entry still lingers
    drop(rx);

    node.coordinator
        .handle_inbound(envelope("eddsaclosed", "p2"));
    // nothing to assert beyond "no panic, handler stays quiet"
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn sign_times_out_with_a_failure_callback() {
    let hub = GossipHub::new();
    let node = spawn_node(&hub, "p1").await;
    let (share_id, _) = run_single_keygen(&hub, &node, "eddsa").await;

    // two committee members that will never answer
    node.coordinator
        .start_sign(SignRequest {
            crypto: "eddsa".to_string(),
            message: "deadbeef".to_string(),
            call_back_url: "cb://p1/sign".to_string(),
            peers: vec![
                Peer {
                    share_id,
                    p2p_id: "p1".to_string(),
                },
                Peer {
                    share_id: "1111".to_string(),
                    p2p_id: "p8".to_string(),
                },
            ],
            operation_timeout: 1,
            chain_code: String::new(),
            derivation_path: vec![],
        })
        .unwrap();

    let callbacks = hub.wait_for_callbacks(1, Duration::from_secs(5)).await;
    assert_eq!(callbacks[0].payload["status"], "fail");
    assert_eq!(callbacks[0].payload["error"], "eddsaSign operation timeout");
    assert_eq!(callbacks[0].payload["message"], "deadbeef");

    wait_until(
        || node.coordinator.running_class_names().is_empty(),
        Duration::from_secs(5),
    )
    .await;
}

#[tokio::test]
async fn zero_timeout_rejects_the_operation_before_it_works() {
    let hub = GossipHub::new();
    let node = spawn_node(&hub, "p1").await;
    let (share_id, _) = run_single_keygen(&hub, &node, "eddsa").await;

    node.coordinator
        .start_sign(SignRequest {
            crypto: "eddsa".to_string(),
            message: "deadbeef".to_string(),
            call_back_url: "cb://p1/sign".to_string(),
            peers: vec![
                Peer {
                    share_id,
                    p2p_id: "p1".to_string(),
                },
                Peer {
                    share_id: "1111".to_string(),
                    p2p_id: "p8".to_string(),
                },
            ],
            operation_timeout: 0,
            chain_code: String::new(),
            derivation_path: vec![],
        })
        .unwrap();

    let callbacks = hub.wait_for_callbacks(1, Duration::from_secs(5)).await;
    assert_eq!(callbacks[0].payload["status"], "fail");
    assert_eq!(callbacks[0].payload["error"], "eddsaSign operation timeout");

    wait_until(
        || node.coordinator.running_class_names().is_empty(),
        Duration::from_secs(5),
    )
    .await;

    // a straggler for the dead correlator is dropped silently
    node.coordinator
        .handle_inbound(envelope("eddsadead", "p8"));
    tokio::time::sleep(Duration::from_millis(100)).await;
}
