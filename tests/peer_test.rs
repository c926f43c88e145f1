use rudp::{ConnectionStatus, DeliveryMethod, Peer, PeerConfig, PeerEvent, SendResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

const APP: &str = "peer-integration-test";
const WAIT: Duration = Duration::from_secs(10);

async fn start_peer() -> Peer {
    let mut config = PeerConfig::new(APP);
    config.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    Peer::start(config).await.unwrap()
}

/// waits for the first event matching `f`, skipping all others
async fn wait_for<T>(peer: &mut Peer, mut f: impl FnMut(PeerEvent) -> Option<T>) -> T {
    timeout(WAIT, async {
        loop {
            let event = peer.recv_event().await.expect("network task terminated");
            if let Some(result) = f(event) {
                return result;
            }
        }
    })
        .await
        .expect("timed out waiting for event")
}

async fn wait_for_status(peer: &mut Peer, expected_remote: SocketAddr, expected: ConnectionStatus) {
    wait_for(peer, |event| match event {
        PeerEvent::StatusChanged { remote, status, .. } if remote == expected_remote && status == expected => Some(()),
        _ => None,
    }).await
}

async fn connected_pair() -> (Peer, Peer) {
    let mut a = start_peer().await;
    let mut b = start_peer().await;
    let (addr_a, addr_b) = (a.local_addr(), b.local_addr());

    a.connect(addr_b).await.unwrap();
    wait_for_status(&mut a, addr_b, ConnectionStatus::Connected).await;
    wait_for_status(&mut b, addr_a, ConnectionStatus::Connected).await;
    (a, b)
}

#[tokio::test]
async fn test_reliable_ordered_messages() {
    let (a, mut b) = connected_pair().await;

    for i in 0..50u32 {
        let mut msg = a.create_message();
        msg.write_u32(i);
        msg.write_string("payload");
        let result = a.send_message(msg, b.local_addr(), DeliveryMethod::ReliableOrdered, 3).await.unwrap();
        assert_ne!(result, SendResult::Dropped);
    }

    for i in 0..50u32 {
        let mut msg = wait_for(&mut b, |event| match event {
            PeerEvent::Data(msg) => Some(msg),
            _ => None,
        }).await;
        assert_eq!(msg.sender(), a.local_addr());
        assert_eq!(msg.read_u32().unwrap(), i);
        assert_eq!(msg.read_string().unwrap(), "payload");
    }

    let connections = a.connections().await.unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].status, ConnectionStatus::Connected);
    assert!(connections[0].statistics.sent_messages >= 50);

    let addr_a = a.local_addr();
    a.shutdown("done").await.unwrap();
    wait_for_status(&mut b, addr_a, ConnectionStatus::Disconnected).await;
}

#[tokio::test]
async fn test_fragmented_message() {
    let (a, mut b) = connected_pair().await;

    let mut msg = a.create_message();
    for i in 0..10_000u32 {
        msg.write_u32(i);
    }
    a.send_message(msg, b.local_addr(), DeliveryMethod::ReliableUnordered, 0).await.unwrap();

    let mut received = wait_for(&mut b, |event| match event {
        PeerEvent::Data(msg) => Some(msg),
        _ => None,
    }).await;
    assert_eq!(received.bit_len(), 10_000 * 32);
    for i in 0..10_000u32 {
        assert_eq!(received.read_u32().unwrap(), i);
    }
}

#[tokio::test]
async fn test_invalid_channel() {
    let (a, b) = connected_pair().await;
    let msg = a.create_message();
    assert!(a.send_message(msg, b.local_addr(), DeliveryMethod::Unreliable, 1).await.is_err());
}

#[tokio::test]
async fn test_send_without_connection() {
    let a = start_peer().await;
    let b = start_peer().await;

    let mut msg = a.create_message();
    msg.write_u8(1);
    let result = a.send_message(msg, b.local_addr(), DeliveryMethod::ReliableOrdered, 0).await.unwrap();
    assert_eq!(result, SendResult::FailedNotConnected);
}

#[tokio::test]
async fn test_discovery() {
    let mut a = start_peer().await;
    let mut b = start_peer().await;

    a.discover_known_peer(b.local_addr()).await.unwrap();
    let requester = wait_for(&mut b, |event| match event {
        PeerEvent::DiscoveryRequest(msg) => Some(msg.sender()),
        _ => None,
    }).await;
    assert_eq!(requester, a.local_addr());

    let mut response = b.create_message();
    response.write_string("server #1");
    b.send_discovery_response(response, requester).await.unwrap();

    let (responder, text) = wait_for(&mut a, |event| match event {
        PeerEvent::DiscoveryResponse(mut msg) => Some((msg.sender(), msg.read_string().unwrap())),
        _ => None,
    }).await;
    assert_eq!(responder, b.local_addr());
    assert_eq!(text, "server #1");
}

#[tokio::test]
async fn test_disconnect() {
    let (a, mut b) = connected_pair().await;
    a.disconnect(b.local_addr(), "bye").await.unwrap();

    let reason = wait_for(&mut b, |event| match event {
        PeerEvent::StatusChanged { status: ConnectionStatus::Disconnected, reason, .. } => Some(reason),
        _ => None,
    }).await;
    assert_eq!(reason, "bye");
}
