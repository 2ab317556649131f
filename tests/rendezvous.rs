use hubrelay::connector::{Connector, PeerConnection};
use hubrelay::engine::{ControlEngine, EngineState};
use hubrelay::hub::{Hub, HubConfig, PeerRegistry, Registry};
use hubrelay::stream::StreamPair;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::{sleep, timeout};

struct Peer {
    connector: Connector,
    conns: UnboundedReceiver<PeerConnection>,
}

async fn start_hub(max_idle: Duration) -> (SocketAddr, Arc<PeerRegistry>) {
    let hub = Hub::new(HubConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_idle,
        silence: Duration::from_secs(2),
        status_interval: Duration::ZERO,
    })
    .await
    .unwrap();
    let addr = hub.local_addr().unwrap();
    let registry = hub.registry();
    tokio::spawn(hub.run());
    (addr, registry)
}

async fn join_hub(addr: SocketAddr, id: &str) -> Peer {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (tx, rx) = unbounded_channel();
    let connector = Connector::new(StreamPair::from_tcp(stream), Arc::new(tx));
    connector.connect(id).await.unwrap();
    Peer {
        connector,
        conns: rx,
    }
}

async fn wait_until<F: Fn() -> bool>(f: F) {
    timeout(Duration::from_secs(5), async {
        while !f() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_conn(peer: &mut Peer) -> PeerConnection {
    timeout(Duration::from_secs(5), peer.conns.recv())
        .await
        .expect("no peer connection")
        .expect("listener closed")
}

#[tokio::test]
async fn test_bridge_relay_and_resume() {
    let (addr, registry) = start_hub(Duration::from_millis(300)).await;

    let mut alice = join_hub(addr, "alice").await;
    let mut bob = join_hub(addr, "bob").await;
    wait_until(|| registry.is_registered("alice") && registry.is_registered("bob")).await;

    alice.connector.sync_hub_information().await.unwrap();
    wait_until(|| alice.connector.peer_ids().unwrap().contains("bob")).await;

    alice.connector.connect_peer("bob").await.unwrap();

    let mut a = next_conn(&mut alice).await;
    let mut b = next_conn(&mut bob).await;
    assert_eq!(a.remote_peer_id, "bob");
    assert_eq!(b.remote_peer_id, "alice");
    assert_eq!(alice.connector.engine_state(), EngineState::Borrowed);

    a.stream.write_all(b"hello bob").await.unwrap();
    let mut buf = [0u8; 9];
    b.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello bob");

    b.stream.write_all(b"hi alice").await.unwrap();
    let mut buf = [0u8; 8];
    a.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi alice");

    // silence on the data channel releases both leases
    let mut rest = vec![];
    a.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    wait_until(|| alice.connector.is_active() && bob.connector.is_active()).await;
    wait_until(|| {
        registry.session("alice").map_or(false, |s| s.is_active())
            && registry.session("bob").map_or(false, |s| s.is_active())
    })
    .await;
    assert_eq!(registry.pending_requests(), 0);

    // control protocol works again on the same streams
    let _carol = join_hub(addr, "carol").await;
    wait_until(|| registry.is_registered("carol")).await;
    alice.connector.sync_hub_information().await.unwrap();
    wait_until(|| alice.connector.peer_ids().unwrap().contains("carol")).await;
    bob.connector.sync_hub_information().await.unwrap();
    wait_until(|| bob.connector.peer_ids().unwrap().len() == 2).await;
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let (addr, registry) = start_hub(Duration::from_secs(60)).await;

    let alice = join_hub(addr, "alice").await;
    wait_until(|| registry.is_registered("alice")).await;
    let first = registry.session("alice").unwrap();

    let impostor = join_hub(addr, "alice").await;
    wait_until(|| impostor.connector.engine_state() == EngineState::Terminated).await;

    let current = registry.session("alice").unwrap();
    assert!(Arc::ptr_eq(&first, &current));
    assert!(alice.connector.is_active());

    let _bob = join_hub(addr, "bob").await;
    wait_until(|| registry.is_registered("bob")).await;
    alice.connector.sync_hub_information().await.unwrap();
    wait_until(|| alice.connector.peer_ids().unwrap().contains("bob")).await;
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let (addr, registry) = start_hub(Duration::from_secs(60)).await;

    let alice = join_hub(addr, "alice").await;
    wait_until(|| registry.is_registered("alice")).await;

    drop(alice);
    wait_until(|| !registry.is_registered("alice")).await;
}

#[tokio::test]
async fn test_connect_to_unknown_peer() {
    let (addr, registry) = start_hub(Duration::from_secs(60)).await;

    let alice = join_hub(addr, "alice").await;
    wait_until(|| registry.is_registered("alice")).await;

    alice.connector.connect_peer("nobody").await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.pending_requests(), 0);
    assert!(alice.connector.is_active());
}
