use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use sight_overlay::{
    bootstrap, join_overlay, BootstrapPeer, MemoryHost, MemoryOverlay, MembershipConfig,
    OverlayError, OverlayHost, PeerId, Topic, RELAY_TOPIC,
};

fn addr(peer_id: PeerId) -> String {
    format!("/ip4/127.0.0.1/tcp/15050/p2p/{peer_id}")
}

#[tokio::test]
async fn startup_survives_partial_bootstrap_failure() {
    let overlay = MemoryOverlay::default();
    let seed = overlay.host();
    let node = overlay.host();
    let offline = PeerId::random();

    let config = MembershipConfig {
        bootstrap_peers: vec![
            "definitely-not-a-multiaddr".into(),
            addr(offline),
            addr(seed.peer_id()),
        ],
        ..MembershipConfig::default()
    };
    let mut membership = join_overlay(&node, &config).await.unwrap();

    assert_eq!(membership.bootstrap.connected, vec![seed.peer_id()]);
    assert_eq!(membership.bootstrap.invalid, vec!["definitely-not-a-multiaddr".to_string()]);
    assert_eq!(membership.bootstrap.unreachable, vec![offline]);
    assert_eq!(membership.subscription.topic(), RELAY_TOPIC);

    let seed_topic = seed.join(RELAY_TOPIC).await.unwrap();
    seed_topic.publish(b"welcome".to_vec()).await.unwrap();
    let message = membership.subscription.next().await.unwrap();
    assert_eq!(message.data, b"welcome");
    assert_eq!(message.source, Some(seed.peer_id()));
}

#[tokio::test]
async fn startup_succeeds_with_no_reachable_peers() {
    let overlay = MemoryOverlay::default();
    let node = overlay.host();
    let config = MembershipConfig {
        bootstrap_peers: vec![addr(PeerId::random()), addr(PeerId::random())],
        ..MembershipConfig::default()
    };
    let membership = join_overlay(&node, &config).await.unwrap();
    assert!(membership.bootstrap.connected.is_empty());
    assert_eq!(membership.bootstrap.unreachable.len(), 2);
}

#[tokio::test]
async fn differently_named_topics_do_not_see_each_other() {
    let overlay = MemoryOverlay::default();
    let current = overlay.host();
    let legacy = overlay.host();
    let mut current_member = join_overlay(&current, &MembershipConfig::default()).await.unwrap();
    let legacy_member = join_overlay(
        &legacy,
        &MembershipConfig {
            topic: "sight-message-v0".into(),
            ..MembershipConfig::default()
        },
    )
    .await
    .unwrap();

    legacy_member.topic.publish(b"old".to_vec()).await.unwrap();
    current_member.topic.publish(b"new".to_vec()).await.unwrap();
    assert_eq!(current_member.subscription.next().await.unwrap().data, b"new");
}

#[tokio::test]
async fn join_fails_on_closed_host() {
    let overlay = MemoryOverlay::default();
    let node: MemoryHost = overlay.host();
    node.close().await;
    let err = join_overlay(&node, &MembershipConfig::default()).await.err().unwrap();
    assert!(matches!(err, OverlayError::Closed));
}

/// Host whose dials never complete.
struct StalledHost;

#[async_trait]
impl OverlayHost for StalledHost {
    fn peer_id(&self) -> PeerId {
        PeerId::random()
    }

    async fn join(&self, _topic: &str) -> Result<Arc<dyn Topic>, OverlayError> {
        Err(OverlayError::Host("unused".into()))
    }

    async fn connect(&self, _peer: &BootstrapPeer) -> Result<(), OverlayError> {
        std::future::pending().await
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn stalled_dials_time_out_per_peer() {
    let peers = vec![addr(PeerId::random()), addr(PeerId::random())];
    let report = bootstrap(&StalledHost, &peers, Duration::from_millis(20)).await;
    assert_eq!(report.unreachable.len(), 2);
    assert!(report.connected.is_empty());
}
