//! Loopback tests running a real server against real clients

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::protocol::MAX_DATAGRAM_SIZE;

async fn start_server() -> Server {
    let mut server = Server::new(
        NetworkConfig::new("127.0.0.1", 0, 0),
        Arc::new(SessionRegistry::new()),
    );
    server.start().await.unwrap();
    server
}

async fn join(server: &Server, name: &str) -> (Client, mpsc::Receiver<ClientEvent>) {
    let (tcp_addr, udp_addr) = server.local_addrs().unwrap();
    join_with(tcp_addr, udp_addr, name, NetworkConfig::default()).await
}

async fn join_with(
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    name: &str,
    config: NetworkConfig,
) -> (Client, mpsc::Receiver<ClientEvent>) {
    let mut client = Client::new(config, name);
    let events = client.take_event_receiver().unwrap();
    client.connect(tcp_addr, udp_addr).await.unwrap();
    (client, events)
}

/// Forward datagrams to `upstream`, swallowing the first `lose` of them
async fn lossy_relay(upstream: SocketAddr, lose: usize) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut seen = 0;
        while let Ok((n, _)) = socket.recv_from(&mut buf).await {
            seen += 1;
            if seen > lose {
                let _ = socket.send_to(&buf[..n], upstream).await;
            }
        }
    });
    addr
}

async fn expect_event<F>(events: &mut mpsc::Receiver<ClientEvent>, mut matches: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_users(events: &mut mpsc::Receiver<ClientEvent>, expected: &[&str]) {
    expect_event(events, |event| match event {
        ClientEvent::UserListChanged { users } => users == expected,
        _ => false,
    })
    .await;
}

/// Drain whatever arrives within `window`
async fn collect(events: &mut mpsc::Receiver<ClientEvent>, window: Duration) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    let _ = timeout(window, async {
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
    })
    .await;
    seen
}

#[tokio::test]
async fn test_private_message_delivered_and_acknowledged() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server, "alice").await;
    let (_bob, mut bob_events) = join(&server, "bob").await;
    wait_for_users(&mut alice_events, &["alice", "bob"]).await;
    wait_for_users(&mut bob_events, &["alice", "bob"]).await;

    let sequence = alice.send_text("hi", Some("bob")).await.unwrap();
    assert_eq!(sequence, 1);

    let received = expect_event(&mut bob_events, |e| {
        matches!(e, ClientEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        received,
        ClientEvent::MessageReceived {
            sender: "alice".to_string(),
            text: "hi".to_string(),
            private: true,
        }
    );

    let ack = expect_event(&mut alice_events, |e| {
        matches!(e, ClientEvent::Acknowledged { .. })
    })
    .await;
    assert_eq!(ack, ClientEvent::Acknowledged { sequence });
    assert_eq!(alice.pending_count().await, 0);
}

#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server, "alice").await;
    let (_bob, mut bob_events) = join(&server, "bob").await;
    let (_carol, mut carol_events) = join(&server, "carol").await;
    let everyone = ["alice", "bob", "carol"];
    wait_for_users(&mut alice_events, &everyone).await;
    wait_for_users(&mut bob_events, &everyone).await;
    wait_for_users(&mut carol_events, &everyone).await;

    let sequence = alice.send_text("hello all", None).await.unwrap();

    for events in [&mut bob_events, &mut carol_events] {
        let received = expect_event(events, |e| matches!(e, ClientEvent::MessageReceived { .. })).await;
        assert_eq!(
            received,
            ClientEvent::MessageReceived {
                sender: "alice".to_string(),
                text: "hello all".to_string(),
                private: false,
            }
        );
    }

    let seen = collect(&mut alice_events, Duration::from_millis(300)).await;
    assert!(seen.contains(&ClientEvent::Acknowledged { sequence }));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ClientEvent::MessageReceived { .. })));
}

#[tokio::test]
async fn test_private_to_unknown_recipient_still_acknowledged() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server, "alice").await;
    wait_for_users(&mut alice_events, &["alice"]).await;

    let sequence = alice.send_text("anyone?", Some("nobody")).await.unwrap();
    let ack = expect_event(&mut alice_events, |e| {
        matches!(e, ClientEvent::Acknowledged { .. })
    })
    .await;
    assert_eq!(ack, ClientEvent::Acknowledged { sequence });
}

#[tokio::test]
async fn test_ping_measures_round_trip() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server, "alice").await;
    let (_bob, mut bob_events) = join(&server, "bob").await;
    wait_for_users(&mut alice_events, &["alice", "bob"]).await;
    wait_for_users(&mut bob_events, &["alice", "bob"]).await;

    alice.ping("bob").await.unwrap();

    match expect_event(&mut alice_events, |e| matches!(e, ClientEvent::PingMeasured { .. })).await {
        ClientEvent::PingMeasured { target, rtt } => {
            assert_eq!(target, "bob");
            assert!(rtt < Duration::from_secs(5));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_to_unknown_target_gets_no_answer() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server, "alice").await;
    wait_for_users(&mut alice_events, &["alice"]).await;

    alice.ping("ghost").await.unwrap();
    let seen = collect(&mut alice_events, Duration::from_millis(300)).await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ClientEvent::PingMeasured { .. })));
}

#[tokio::test]
async fn test_logout_updates_remaining_users() {
    let server = start_server().await;
    let (_alice, mut alice_events) = join(&server, "alice").await;
    let (bob, mut bob_events) = join(&server, "bob").await;
    wait_for_users(&mut alice_events, &["alice", "bob"]).await;
    wait_for_users(&mut bob_events, &["alice", "bob"]).await;

    bob.logout().await.unwrap();

    expect_event(&mut bob_events, |e| matches!(e, ClientEvent::ConnectionLost { .. })).await;
    wait_for_users(&mut alice_events, &["alice"]).await;
    assert!(server.registry().lookup("bob").await.is_none());
    assert!(!bob.is_connected().await);
}

#[tokio::test]
async fn test_identity_reusable_after_logout() {
    let server = start_server().await;
    let (_alice, mut alice_events) = join(&server, "alice").await;
    let (bob, mut bob_events) = join(&server, "bob").await;
    wait_for_users(&mut alice_events, &["alice", "bob"]).await;
    wait_for_users(&mut bob_events, &["alice", "bob"]).await;

    bob.logout().await.unwrap();
    wait_for_users(&mut alice_events, &["alice"]).await;

    let (_bob_again, mut again_events) = join(&server, "bob").await;
    wait_for_users(&mut again_events, &["alice", "bob"]).await;
    assert_eq!(server.registry().snapshot_identities().await, vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_duplicate_identity_rejected() {
    let server = start_server().await;
    let (_first, mut first_events) = join(&server, "alice").await;
    wait_for_users(&mut first_events, &["alice"]).await;

    let (second, mut second_events) = join(&server, "alice").await;
    match expect_event(&mut second_events, |e| matches!(e, ClientEvent::ConnectionLost { .. })).await {
        ClientEvent::ConnectionLost { reason } => assert!(reason.contains("lost")),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!second.is_connected().await);

    assert_eq!(server.registry().len().await, 1);
    let seen = collect(&mut first_events, Duration::from_millis(200)).await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ClientEvent::ConnectionLost { .. })));
}

#[tokio::test]
async fn test_server_stop_disconnects_clients() {
    let mut server = start_server().await;
    let (alice, mut alice_events) = join(&server, "alice").await;
    wait_for_users(&mut alice_events, &["alice"]).await;

    server.stop().await.unwrap();

    expect_event(&mut alice_events, |e| matches!(e, ClientEvent::ConnectionLost { .. })).await;
    assert!(!alice.is_connected().await);
    assert!(server.registry().is_empty().await);
}

#[tokio::test]
async fn test_unacknowledged_datagram_is_retransmitted() {
    // A bare socket stands in for a server that never acknowledges
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server = start_server().await;
    let (tcp_addr, _) = server.local_addrs().unwrap();

    let config = NetworkConfig::default()
        .with_retransmit(Duration::from_millis(100), Duration::from_millis(25))
        .with_max_retransmits(2);
    let mut client = Client::new(config, "alice");
    let mut events = client.take_event_receiver().unwrap();
    client
        .connect(tcp_addr, silent.local_addr().unwrap())
        .await
        .unwrap();

    let sequence = client.send_text("lost", None).await.unwrap();

    for attempt in 1..=2 {
        let event = expect_event(&mut events, |e| matches!(e, ClientEvent::Retransmitted { .. })).await;
        assert_eq!(event, ClientEvent::Retransmitted { sequence, attempt });
    }
    let event = expect_event(&mut events, |e| matches!(e, ClientEvent::DeliveryAbandoned { .. })).await;
    assert_eq!(event, ClientEvent::DeliveryAbandoned { sequence });
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test]
async fn test_lost_datagram_recovered_by_retransmission() {
    let server = start_server().await;
    let (tcp_addr, udp_addr) = server.local_addrs().unwrap();
    let relay = lossy_relay(udp_addr, 1).await;

    let config = NetworkConfig::default()
        .with_retransmit(Duration::from_millis(200), Duration::from_millis(50));
    let (alice, mut alice_events) = join_with(tcp_addr, relay, "alice", config).await;
    let (_bob, mut bob_events) = join(&server, "bob").await;
    wait_for_users(&mut alice_events, &["alice", "bob"]).await;
    wait_for_users(&mut bob_events, &["alice", "bob"]).await;

    let sequence = alice.send_text("second try", Some("bob")).await.unwrap();

    let received = expect_event(&mut bob_events, |e| {
        matches!(e, ClientEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        received,
        ClientEvent::MessageReceived {
            sender: "alice".to_string(),
            text: "second try".to_string(),
            private: true,
        }
    );

    let resent = expect_event(&mut alice_events, |e| {
        matches!(e, ClientEvent::Retransmitted { .. })
    })
    .await;
    assert_eq!(resent, ClientEvent::Retransmitted { sequence, attempt: 1 });
    let ack = expect_event(&mut alice_events, |e| {
        matches!(e, ClientEvent::Acknowledged { .. })
    })
    .await;
    assert_eq!(ack, ClientEvent::Acknowledged { sequence });
    assert_eq!(alice.pending_count().await, 0);
}

#[tokio::test]
async fn test_degenerate_sweep_intervals_still_retransmit() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server = start_server().await;
    let (tcp_addr, _) = server.local_addrs().unwrap();
    let timeout_period = Duration::from_millis(100);

    for (name, sweep_interval) in [("zero", Duration::ZERO), ("slow", Duration::from_secs(60))] {
        let config = NetworkConfig::default()
            .with_retransmit(timeout_period, sweep_interval)
            .with_max_retransmits(1);
        let (client, mut events) =
            join_with(tcp_addr, silent.local_addr().unwrap(), name, config).await;

        let sequence = client.send_text("anyone", None).await.unwrap();
        let event = expect_event(&mut events, |e| matches!(e, ClientEvent::Retransmitted { .. })).await;
        assert_eq!(event, ClientEvent::Retransmitted { sequence, attempt: 1 });
        let event = expect_event(&mut events, |e| matches!(e, ClientEvent::DeliveryAbandoned { .. })).await;
        assert_eq!(event, ClientEvent::DeliveryAbandoned { sequence });
        assert!(client.is_connected().await);
    }
}

#[tokio::test]
async fn test_dropped_client_is_logged_out() {
    let server = start_server().await;
    let (_alice, mut alice_events) = join(&server, "alice").await;
    let (bob, mut bob_events) = join(&server, "bob").await;
    wait_for_users(&mut alice_events, &["alice", "bob"]).await;
    wait_for_users(&mut bob_events, &["alice", "bob"]).await;

    drop(bob);

    wait_for_users(&mut alice_events, &["alice"]).await;
    expect_event(&mut bob_events, |e| matches!(e, ClientEvent::ConnectionLost { .. })).await;
    assert!(server.registry().lookup("bob").await.is_none());
}
