//! Integration tests: peers talking through a real relay server on loopback.

use std::time::Duration;

use p2p_mesh::{
    DirectOverlay, NetEvent, OverlayConfig, Payload, RelayClient, RelayClientConfig,
    BINARY_PAYLOAD_NAME,
};
use p2p_relay::{RelayServer, RelayServerConfig};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

async fn relay() -> RelayServer {
    RelayServer::start(RelayServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..RelayServerConfig::default()
    })
    .await
    .unwrap()
}

struct TestPeer {
    client: RelayClient,
    events: UnboundedReceiver<NetEvent>,
    id: String,
}

/// A listening overlay registered with `server` under its real port.
async fn peer(server: &RelayServer) -> TestPeer {
    let overlay = DirectOverlay::new(OverlayConfig::default());
    let events = overlay.subscribe();
    let local = overlay.listen("127.0.0.1", 0).await.unwrap();
    let config = RelayClientConfig {
        advertise_ip: "127.0.0.1".into(),
        advertise_port: local.port(),
        ..RelayClientConfig::default()
    };
    let client = RelayClient::start(overlay, config);
    let addr = server.local_addr();
    let reg = client
        .connect_to_relay("127.0.0.1", addr.port())
        .await
        .unwrap();
    TestPeer {
        client,
        events,
        id: reg.peer_id,
    }
}

async fn next_matching<F>(rx: &mut UnboundedReceiver<NetEvent>, pred: F) -> NetEvent
where
    F: Fn(&NetEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn quiet_for<F>(rx: &mut UnboundedReceiver<NetEvent>, period: Duration, pred: F) -> bool
where
    F: Fn(&NetEvent) -> bool,
{
    timeout(period, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_err()
}

fn is_message(event: &NetEvent) -> bool {
    matches!(event, NetEvent::Message(env) if env.origin().is_some())
}

#[tokio::test]
async fn relayed_hello_reaches_registered_peer() {
    let server = relay().await;
    let mut a = peer(&server).await;
    let b = peer(&server).await;

    let seen = b.client.discover_peers().await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id.as_deref(), Some(a.id.as_str()));

    assert!(b.client.send_via_relay(&a.id, "hello").await);

    match next_matching(&mut a.events, is_message).await {
        NetEvent::Message(env) => {
            assert_eq!(env.payload(), &Payload::Text("hello".into()));
            let origin = env.origin().unwrap();
            assert_eq!(origin.id.as_deref(), Some(b.id.as_str()));
            assert!(origin.is_relay_only());
        }
        _ => unreachable!(),
    }
    assert_eq!(a.client.relay_peers().await.len(), 1);
}

#[tokio::test]
async fn file_round_trip_preserves_bytes_and_name() {
    let server = relay().await;
    let mut a = peer(&server).await;
    let b = peer(&server).await;

    let body: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    assert!(b.client.send_file_via_relay(&a.id, &body, "blob.bin").await);

    let notice = next_matching(&mut a.events, is_message).await;
    match notice {
        NetEvent::Message(env) => {
            assert!(matches!(env.payload(), Payload::Status(s) if s.contains("blob.bin")))
        }
        _ => unreachable!(),
    }
    match next_matching(&mut a.events, is_message).await {
        NetEvent::Message(env) => assert_eq!(
            env.payload(),
            &Payload::File {
                filename: "blob.bin".into(),
                data: body,
            }
        ),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn upgrade_switches_to_direct_and_send_to_all_delivers_once() {
    let server = relay().await;
    let mut a = peer(&server).await;
    let b = peer(&server).await;
    b.client.discover_peers().await.unwrap();

    assert!(b.client.upgrade(&a.id).await.unwrap());
    let handle = b.client.overlay().peer_by_id(&a.id).await.unwrap();
    assert!(handle.is_direct());
    assert!(handle.is_approved());
    next_matching(&mut a.events, |e| matches!(e, NetEvent::PeerPending(_))).await;

    assert_eq!(b.client.send_to_all(b"over the socket").await, 1);
    match next_matching(&mut a.events, is_message).await {
        NetEvent::Message(env) => {
            assert_eq!(env.payload(), &Payload::Bytes(b"over the socket".to_vec()));
            assert!(env.origin().unwrap().is_direct());
        }
        _ => unreachable!(),
    }
    assert!(quiet_for(&mut a.events, Duration::from_millis(300), is_message).await);
}

#[tokio::test]
async fn upgrade_is_idempotent() {
    let server = relay().await;
    let mut a = peer(&server).await;
    let b = peer(&server).await;
    b.client.discover_peers().await.unwrap();

    assert!(b.client.upgrade(&a.id).await.unwrap());
    assert!(b.client.upgrade(&a.id).await.unwrap());
    assert_eq!(b.client.status().await.direct_peers, 1);

    next_matching(&mut a.events, |e| matches!(e, NetEvent::PeerPending(_))).await;
    assert!(
        quiet_for(&mut a.events, Duration::from_millis(300), |e| {
            matches!(e, NetEvent::PeerPending(_))
        })
        .await
    );
    assert_eq!(a.client.overlay().pending().await.len(), 1);
}

#[tokio::test]
async fn failed_upgrade_falls_back_to_relay() {
    let server = relay().await;
    let mut a = peer(&server).await;
    let b = peer(&server).await;
    b.client.discover_peers().await.unwrap();

    // nothing listens on A's advertised port any more
    a.client.overlay().shutdown().await;
    // let the accept loop observe the cancellation and drop its listener
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!b.client.upgrade(&a.id).await.unwrap());
    let handle = b.client.overlay().peer_by_id(&a.id).await.unwrap();
    assert!(handle.is_relay_only());
    assert!(handle.is_approved());

    assert_eq!(b.client.send_to_all(b"via relay").await, 1);
    match next_matching(&mut a.events, is_message).await {
        NetEvent::Message(env) => assert_eq!(env.payload(), &Payload::Text("via relay".into())),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn binary_broadcast_reaches_relay_peers_intact() {
    let server = relay().await;
    let mut a = peer(&server).await;
    let b = peer(&server).await;
    b.client.discover_peers().await.unwrap();
    let handle = b.client.overlay().peer_by_id(&a.id).await.unwrap();
    b.client.overlay().approve(handle.key).await.unwrap();

    let raw = vec![0xff, 0xfe, 0x00, 0x80, b'x'];
    assert_eq!(b.client.send_to_all(&raw).await, 1);

    let file = next_matching(&mut a.events, |e| {
        matches!(e, NetEvent::Message(env) if matches!(env.payload(), Payload::File { .. }))
    })
    .await;
    match file {
        NetEvent::Message(env) => assert_eq!(
            env.payload(),
            &Payload::File {
                filename: BINARY_PAYLOAD_NAME.into(),
                data: raw,
            }
        ),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn relay_to_unknown_peer_reports_status() {
    let server = relay().await;
    let mut a = peer(&server).await;

    assert!(a.client.send_via_relay("nobody", "lost").await);
    let status = next_matching(&mut a.events, |e| {
        matches!(e, NetEvent::Message(env) if env.text().contains("nobody"))
    })
    .await;
    match status {
        NetEvent::Message(env) => assert!(env.text().contains("Invalid peer IDs")),
        _ => unreachable!(),
    }
    assert!(a.client.is_connected().await);
}

#[tokio::test]
async fn shutdown_unregisters_from_relay() {
    let server = relay().await;
    let a = peer(&server).await;
    let b = peer(&server).await;
    assert_eq!(server.peer_count().await, 2);

    a.client.shutdown().await;
    timeout(WAIT, async {
        while server.peer_count().await != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(b.client.discover_peers().await.unwrap().is_empty());
}
