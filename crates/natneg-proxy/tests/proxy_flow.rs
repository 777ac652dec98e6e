//! End-to-end flows over loopback: a scripted rendezvous server, a scripted
//! remote peer, and real client sockets on both of the client's roles (game
//! socket and communication socket).

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use natneg_proxy::{start_proxy, AddressTranslator, ProxyConfig, ProxyHandle};
use tokio::{net::UdpSocket, time::timeout};

const PUBLIC_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
const NATNEG_ID: u32 = 0x1122_3344;
const MAGIC: [u8; 6] = [0xFD, 0xFC, 0x1E, 0x66, 0x6A, 0xB2];

fn init_packet(sequence: u8, player: u8) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(0x03); // version
    out.push(0x00); // step: init
    out.extend_from_slice(&NATNEG_ID.to_le_bytes());
    out.push(sequence);
    out.push(player);
    out
}

fn init_ack_packet(player: u8) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(0x03);
    out.push(0x01); // step: initAck
    out.extend_from_slice(&NATNEG_ID.to_le_bytes());
    out.push(0x00);
    out.push(player);
    out
}

fn connect_packet(peer: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(peer) = peer else {
        panic!("expected an IPv4 peer address");
    };
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(0x03);
    out.push(0x05); // step: connect
    out.extend_from_slice(&NATNEG_ID.to_le_bytes());
    out.extend_from_slice(&peer.ip().octets());
    out.extend_from_slice(&peer.port().to_be_bytes());
    out.push(0x42); // gotyourdata
    out.push(0x00); // finished
    out
}

async fn bind_local() -> UdpSocket {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind loopback socket")
}

async fn recv_from(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 2048];
    let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .expect("recv_from failed");
    buf.truncate(len);
    (buf, from)
}

async fn expect_silence(socket: &UdpSocket, wait: Duration) {
    let mut buf = vec![0u8; 2048];
    if let Ok(received) = timeout(wait, socket.recv_from(&mut buf)).await {
        let (len, from) = received.expect("recv_from failed");
        panic!("unexpected datagram of {len} bytes from {from}");
    }
}

async fn start(
    server_addr: SocketAddr,
    session_timeout: Duration,
) -> (ProxyHandle, Arc<AddressTranslator>) {
    let translator = Arc::new(AddressTranslator::new(PUBLIC_IP));
    let cfg = ProxyConfig {
        bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        server_host: server_addr.ip().to_string(),
        server_port: server_addr.port(),
        session_timeout,
        ..ProxyConfig::default()
    };
    let handle = start_proxy(cfg, translator.clone())
        .await
        .expect("start proxy");
    (handle, translator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_natneg_traffic_is_dropped() {
    let server = bind_local().await;
    let (proxy, _translator) = start(server.local_addr().unwrap(), Duration::from_secs(60)).await;

    let client = bind_local().await;
    client
        .send_to(&[0x00, 0x11, 0x22], proxy.local_addr())
        .await
        .unwrap();
    expect_silence(&server, Duration::from_millis(300)).await;

    // The dispatcher keeps serving after the drop.
    client
        .send_to(&init_packet(0, 7), proxy.local_addr())
        .await
        .unwrap();
    let (data, _) = recv_from(&server).await;
    assert_eq!(data, init_packet(0, 7));

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rendezvous_rewrite_and_relay() {
    let server = bind_local().await;
    let peer = bind_local().await;
    let (proxy, _translator) = start(server.local_addr().unwrap(), Duration::from_secs(60)).await;
    let front = proxy.local_addr();

    let client_game = bind_local().await;
    let client_comm = bind_local().await;

    // The init with sequence 0 comes from the client's game socket; it
    // creates the session and reaches the server through the game
    // connection's public-facing socket.
    client_game
        .send_to(&init_packet(0, 7), front)
        .await
        .unwrap();
    let (data, game_path) = recv_from(&server).await;
    assert_eq!(data, init_packet(0, 7));
    assert_ne!(game_path, front);

    // Communication-socket traffic goes upstream from the session's own
    // ephemeral socket instead.
    client_comm
        .send_to(&init_packet(1, 7), front)
        .await
        .unwrap();
    let (data, comm_path) = recv_from(&server).await;
    assert_eq!(data, init_packet(1, 7));
    assert_ne!(comm_path, game_path);

    // The server's connect names the real remote peer. The proxy must store
    // that endpoint and rewrite the payload to its own fake remote socket,
    // translated to the public address, before the client sees it.
    let peer_addr = peer.local_addr().unwrap();
    let original = connect_packet(peer_addr);
    server.send_to(&original, comm_path).await.unwrap();

    let (rewritten, from) = recv_from(&client_comm).await;
    assert_eq!(from, front, "connect must egress from the front socket");
    assert_eq!(rewritten.len(), original.len());
    assert_eq!(&rewritten[..12], &original[..12]);
    assert_eq!(&rewritten[12..16], &PUBLIC_IP.octets());
    let fake_port = u16::from_be_bytes([rewritten[16], rewritten[17]]);
    assert_ne!(fake_port, 0);
    assert_eq!(&rewritten[18..], &original[18..]);

    // Bidirectional relay: client -> peer through the fake remote socket,
    // peer -> client through the public-facing socket, both unchanged.
    let fake_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, fake_port));
    client_game.send_to(&[0xA1, 0xA2], fake_addr).await.unwrap();
    let (data, from) = recv_from(&peer).await;
    assert_eq!(data, [0xA1, 0xA2]);
    assert_eq!(
        from, game_path,
        "peer traffic must come from the public-facing socket"
    );

    peer.send_to(&[0xB1, 0xB2], game_path).await.unwrap();
    let (data, from) = recv_from(&client_game).await;
    assert_eq!(data, [0xB1, 0xB2]);
    assert_eq!(from, fake_addr);

    // The client's game socket rebinds mid-game; the relay follows the new
    // source in both directions.
    let client_game2 = bind_local().await;
    client_game2.send_to(&[0xC1, 0xC2], fake_addr).await.unwrap();
    let (data, _) = recv_from(&peer).await;
    assert_eq!(data, [0xC1, 0xC2]);

    peer.send_to(&[0xD1, 0xD2], game_path).await.unwrap();
    let (data, _) = recv_from(&client_game2).await;
    assert_eq!(data, [0xD1, 0xD2]);

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_key_reaches_the_same_session() {
    let server = bind_local().await;
    let (proxy, _translator) = start(server.local_addr().unwrap(), Duration::from_secs(60)).await;

    let client = bind_local().await;
    client
        .send_to(&init_packet(0, 7), proxy.local_addr())
        .await
        .unwrap();
    let (_, first_path) = recv_from(&server).await;

    // A retransmit of the same init maps to the same session and relays
    // from the same socket.
    client
        .send_to(&init_packet(0, 7), proxy.local_addr())
        .await
        .unwrap();
    let (_, second_path) = recv_from(&server).await;
    assert_eq!(first_path, second_path);

    // A different player ID under the same NatNegID is a different session.
    let other_client = bind_local().await;
    other_client
        .send_to(&init_packet(0, 8), proxy.local_addr())
        .await
        .unwrap();
    let (_, other_path) = recv_from(&server).await;
    assert_ne!(other_path, first_path);

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activity_extends_the_session_lifetime() {
    let server = bind_local().await;
    let (proxy, _translator) = start(server.local_addr().unwrap(), Duration::from_millis(600)).await;
    let front = proxy.local_addr();

    let client_game = bind_local().await;
    let client_comm = bind_local().await;

    client_game
        .send_to(&init_packet(0, 7), front)
        .await
        .unwrap();
    let (_, _game_path) = recv_from(&server).await;

    client_comm
        .send_to(&init_packet(1, 7), front)
        .await
        .unwrap();
    let (_, comm_path) = recv_from(&server).await;

    // Keep traffic flowing for well over the 600ms timeout; every round
    // extends both state machines, so the session must survive and keep its
    // communication socket.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(200)).await;

        server
            .send_to(&init_ack_packet(7), comm_path)
            .await
            .unwrap();
        let (data, from) = recv_from(&client_comm).await;
        assert_eq!(data, init_ack_packet(7));
        assert_eq!(from, front);

        client_comm
            .send_to(&init_packet(1, 7), front)
            .await
            .unwrap();
        let (_, path) = recv_from(&server).await;
        assert_eq!(path, comm_path, "session must keep its communication socket");
    }

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_sessions_are_reaped_and_recreated() {
    let server = bind_local().await;
    let (proxy, _translator) = start(server.local_addr().unwrap(), Duration::from_millis(300)).await;

    let client = bind_local().await;
    client
        .send_to(&init_packet(0, 7), proxy.local_addr())
        .await
        .unwrap();
    let (_, first_path) = recv_from(&server).await;

    // Well past the inactivity window the session and its sockets are gone;
    // the same key then builds a fresh session from scratch.
    tokio::time::sleep(Duration::from_millis(1000)).await;

    client
        .send_to(&init_packet(0, 7), proxy.local_addr())
        .await
        .unwrap();
    let (_, second_path) = recv_from(&server).await;
    assert_ne!(
        first_path, second_path,
        "a reaped session must not be reachable again"
    );

    proxy.shutdown().await;
}
