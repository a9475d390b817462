//! End-to-end: a relay server and two peer nodes built from TOML files.

use std::io::Write;
use std::time::Duration;

use p2p_app::{load_config, Node, NodeConfig};
use p2p_mesh::{NetEvent, Payload};
use p2p_relay::RelayServer;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn peer_config(relay_port: u16) -> NodeConfig {
    let file = write_config(&format!(
        r#"
log_level = "debug"

[relay]
host = "127.0.0.1"
port = {relay_port}

[local]
host = "127.0.0.1"
port = 0
"#
    ));
    load_config(file.path()).unwrap()
}

async fn start_relay() -> RelayServer {
    let file = write_config(
        r#"
[server]
host = "127.0.0.1"
port = 0
"#,
    );
    let config = load_config(file.path()).unwrap();
    RelayServer::start(config.relay_server_config()).await.unwrap()
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

#[tokio::test]
async fn two_nodes_talk_through_relay_then_directly() {
    p2p_app::init_tracing("debug");
    let relay = start_relay().await;
    let port = relay.local_addr().port();

    let a = Node::bind(peer_config(port)).await.unwrap();
    let mut a_events = a.overlay().subscribe();
    let a_id = a.join_relay().await.unwrap();

    let b = Node::bind(peer_config(port)).await.unwrap();
    let b_id = b.join_relay().await.unwrap();
    assert_ne!(a_id, b_id);

    let known = b.client().discover_peers().await.unwrap();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].address.port, a.local_addr().port());

    assert!(b.client().send_via_relay(&a_id, "hello").await);
    match next_matching(&mut a_events, |e| {
        matches!(e, NetEvent::Message(env) if env.origin().is_some())
    })
    .await
    {
        NetEvent::Message(env) => {
            assert_eq!(env.payload(), &Payload::Text("hello".into()));
            assert_eq!(env.origin().unwrap().id.as_deref(), Some(b_id.as_str()));
        }
        _ => unreachable!(),
    }

    assert!(b.client().upgrade(&a_id).await.unwrap());
    assert_eq!(b.client().send_to_all(b"direct now").await, 1);
    match next_matching(&mut a_events, |e| {
        matches!(e, NetEvent::Message(env) if matches!(env.payload(), Payload::Bytes(_)))
    })
    .await
    {
        NetEvent::Message(env) => assert_eq!(env.text(), "direct now"),
        _ => unreachable!(),
    }

    let status = b.client().status().await;
    assert!(status.connected);
    assert_eq!(status.direct_peers, 1);
    assert_eq!(status.relay_peers, 1);

    a.shutdown().await;
    b.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn direct_connect_and_approve_without_relay() {
    let mut config = NodeConfig::default();
    config.local.host = "127.0.0.1".into();
    config.local.port = 0;

    let host = Node::bind(config.clone()).await.unwrap();
    let mut host_events = host.overlay().subscribe();
    let guest = Node::bind(config).await.unwrap();
    let mut guest_events = guest.overlay().subscribe();

    guest
        .overlay()
        .connect("127.0.0.1", host.local_addr().port())
        .await
        .unwrap();
    let pending = next_matching(&mut host_events, |e| matches!(e, NetEvent::PeerPending(_)));
    let pending = match pending.await {
        NetEvent::PeerPending(peer) => peer,
        _ => unreachable!(),
    };
    host.overlay().approve(pending.key).await.unwrap();
    host.overlay().set_name(pending.key, "guest").await.unwrap();

    assert_eq!(host.client().send_to_all(b"welcome").await, 1);
    match next_matching(&mut guest_events, |e| matches!(e, NetEvent::Message(_))).await {
        NetEvent::Message(env) => assert_eq!(env.text(), "welcome"),
        _ => unreachable!(),
    }
    assert_eq!(
        host.overlay().peer(pending.key).await.unwrap().display_name.as_deref(),
        Some("guest")
    );

    host.shutdown().await;
    guest.shutdown().await;
}
