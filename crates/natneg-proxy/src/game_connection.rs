use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Weak,
};

use tokio::{net::UdpSocket, sync::mpsc};

use crate::{
    proxy::{FrontSocket, SessionContext, SessionControl},
    translator::AddressTranslator,
};

/// Established-relay session behind one Initial Phase.
///
/// Two sockets with fixed roles: `public_socket` talks to the upstream
/// server and to the real remote peer (to both of them its public endpoint
/// is "the client"), while `fake_remote_socket` faces the client's game
/// socket (to the client its public endpoint is "the remote peer"). The
/// split exists because the game assumes the peer and the server each have
/// exactly one `(IP, port)`, so the proxy has to present distinct public
/// endpoints for the two roles.
pub(crate) enum GameConnectionCommand {
    PacketToServer(Vec<u8>),
    CommunicationFromServer {
        data: Vec<u8>,
        client_communication: Option<SocketAddr>,
    },
}

#[derive(Clone)]
pub(crate) struct GameConnectionHandle {
    tx: mpsc::Sender<GameConnectionCommand>,
    client_public: SocketAddr,
}

impl GameConnectionHandle {
    /// The client's public game endpoint as observed when the rendezvous
    /// began. Fixed for the session's lifetime; drift is tracked separately.
    pub(crate) fn client_public(&self) -> SocketAddr {
        self.client_public
    }

    /// A closed channel means the relay task has ended (idle timeout or
    /// socket setup failure).
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn packet_to_server(
        &self,
        data: Vec<u8>,
    ) -> Result<(), mpsc::error::TrySendError<GameConnectionCommand>> {
        self.tx.try_send(GameConnectionCommand::PacketToServer(data))
    }

    pub(crate) fn communication_from_server(
        &self,
        data: Vec<u8>,
        client_communication: Option<SocketAddr>,
    ) -> Result<(), mpsc::error::TrySendError<GameConnectionCommand>> {
        self.tx.try_send(GameConnectionCommand::CommunicationFromServer {
            data,
            client_communication,
        })
    }
}

pub(crate) fn spawn(
    ctx: SessionContext,
    server: SocketAddr,
    client_public: SocketAddr,
) -> GameConnectionHandle {
    let (tx, rx) = mpsc::channel(ctx.cfg.session_queue_len);
    tokio::spawn(run(ctx, server, client_public, rx));
    GameConnectionHandle { tx, client_public }
}

async fn run(
    ctx: SessionContext,
    server: SocketAddr,
    client_public: SocketAddr,
    mut rx: mpsc::Receiver<GameConnectionCommand>,
) {
    let public_socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!("failed to bind public-facing socket: {err}");
            return;
        }
    };
    let fake_remote_socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!("failed to bind fake remote socket: {err}");
            return;
        }
    };
    tracing::info!(client = %client_public, "game connection created");

    let mut client_real = client_public;
    let mut remote_player: Option<SocketAddr> = None;
    // The fake-remote receive loop starts with the first address rewrite;
    // the socket may send before that.
    let mut fake_active = false;
    let mut commands_open = true;

    let mut shutdown = ctx.shutdown.clone();
    let mut public_buf = vec![0u8; ctx.cfg.recv_buffer_len];
    let mut fake_buf = vec![0u8; ctx.cfg.recv_buffer_len];
    let idle = tokio::time::sleep(ctx.cfg.session_timeout);
    tokio::pin!(idle);

    loop {
        let control = tokio::select! {
            biased;
            _ = shutdown.changed() => SessionControl::Close,
            _ = &mut idle => {
                tracing::info!(client = %client_public, "inactivity timeout, closing game connection");
                SessionControl::Close
            }
            command = rx.recv(), if commands_open => match command {
                Some(GameConnectionCommand::PacketToServer(data)) => {
                    handle_packet_to_server(&data, &public_socket, server).await
                }
                Some(GameConnectionCommand::CommunicationFromServer { data, client_communication }) => {
                    handle_communication_packet_from_server(
                        data,
                        client_communication,
                        &fake_remote_socket,
                        &ctx.front,
                        &ctx.translator,
                        &mut remote_player,
                        &mut fake_active,
                    )
                    .await
                }
                None => {
                    // The initial phase is gone; the relay keeps running on
                    // its own sockets until it goes idle.
                    commands_open = false;
                    SessionControl::Continue
                }
            },
            recv = public_socket.recv_from(&mut public_buf) => match recv {
                Ok((len, from)) if from == server => {
                    handle_packet_from_server(&public_buf[..len], &ctx.front, client_public).await
                }
                Ok((len, from)) => {
                    handle_packet_from_remote_player(
                        &public_buf[..len],
                        from,
                        &fake_remote_socket,
                        &mut remote_player,
                        client_real,
                    )
                    .await
                }
                Err(err) => {
                    tracing::error!("public socket receive failed: {err}");
                    SessionControl::Continue
                }
            },
            recv = fake_remote_socket.recv_from(&mut fake_buf), if fake_active => match recv {
                Ok((len, from)) => {
                    handle_packet_to_remote_player(
                        &fake_buf[..len],
                        from,
                        &public_socket,
                        remote_player,
                        &mut client_real,
                    )
                    .await
                }
                Err(err) => {
                    tracing::error!("fake remote socket receive failed: {err}");
                    SessionControl::Continue
                }
            },
        };

        match control {
            SessionControl::Continue => {}
            SessionControl::Extend => {
                idle.as_mut()
                    .reset(tokio::time::Instant::now() + ctx.cfg.session_timeout);
            }
            SessionControl::Close => break,
        }
    }
}

/// Client game-socket traffic destined for the rendezvous server. Relayed
/// from the public-facing socket so the server sees that socket's endpoint
/// as the client.
async fn handle_packet_to_server(
    data: &[u8],
    public_socket: &UdpSocket,
    server: SocketAddr,
) -> SessionControl {
    if !natneg_protocol::is_nat_neg(data) {
        tracing::warn!("packet to server is not NatNeg, discarded");
        return SessionControl::Continue;
    }
    if let Ok(step) = natneg_protocol::step(data) {
        tracing::debug!(%step, "relaying client packet to server");
    }
    if let Err(err) = public_socket.send_to(data, server).await {
        tracing::error!("public socket send failed: {err}");
    }
    SessionControl::Extend
}

/// The rewrite path: a server reply relayed through the Initial Phase's
/// communication socket. A `connect`/`connectPing` payload names the remote
/// peer; the embedded endpoint is replaced with the fake remote socket's
/// public endpoint so the peers talk through the proxy.
async fn handle_communication_packet_from_server(
    mut data: Vec<u8>,
    client_communication: Option<SocketAddr>,
    fake_remote_socket: &UdpSocket,
    front: &FrontSocket,
    translator: &Weak<AddressTranslator>,
    remote_player: &mut Option<SocketAddr>,
    fake_active: &mut bool,
) -> SessionControl {
    // Unknown steps relay unchanged; the proxy is payload-agnostic past the
    // header.
    let offset = match natneg_protocol::step(&data) {
        Ok(step) => {
            tracing::debug!(%step, "communication packet from server");
            step.address_offset()
        }
        Err(err) => {
            tracing::debug!("communication packet with unrecognized step: {err}");
            None
        }
    };

    if let Some(offset) = offset {
        let (ip, port) = match natneg_protocol::parse_address(&data, offset) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("connect packet with truncated address field: {err}, discarded");
                return SessionControl::Continue;
            }
        };
        let remote = SocketAddr::new(IpAddr::V4(ip), port);
        *remote_player = Some(remote);
        tracing::info!(%remote, "remote player discovered");

        let local = match fake_remote_socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                tracing::error!("fake remote socket has no local address: {err}");
                return SessionControl::Continue;
            }
        };
        let Some(translator) = translator.upgrade() else {
            tracing::error!("address translator gone while rewriting, packet discarded");
            return SessionControl::Continue;
        };
        let public_ip = translator.public_ip();
        if let Err(err) = natneg_protocol::rewrite_address(&mut data, offset, public_ip, local.port())
        {
            tracing::warn!("address rewrite failed: {err}, packet discarded");
            return SessionControl::Continue;
        }
        tracing::info!(
            endpoint = %SocketAddr::new(IpAddr::V4(public_ip), local.port()),
            "embedded address rewritten to fake remote endpoint"
        );
        *fake_active = true;
    }

    let Some(to) = client_communication else {
        tracing::warn!("client communication endpoint unknown, packet discarded");
        return SessionControl::Continue;
    };
    front.send_from_proxy_socket(&data, to).await;
    SessionControl::Extend
}

/// Server traffic arriving on the public-facing socket goes back to the
/// client through the front socket, so the client sees the server's
/// expected port.
async fn handle_packet_from_server(
    data: &[u8],
    front: &FrontSocket,
    client_public: SocketAddr,
) -> SessionControl {
    if !natneg_protocol::is_nat_neg(data) {
        tracing::warn!("packet from server is not NatNeg, discarded");
        return SessionControl::Continue;
    }
    tracing::debug!(client = %client_public, "relaying server packet to client via front socket");
    front.send_from_proxy_socket(data, client_public).await;
    SessionControl::Extend
}

/// Remote-peer traffic on the public-facing socket, relayed to wherever the
/// client's game socket currently is. Non-NatNeg payloads pass through
/// untouched.
async fn handle_packet_from_remote_player(
    data: &[u8],
    from: SocketAddr,
    fake_remote_socket: &UdpSocket,
    remote_player: &mut Option<SocketAddr>,
    client_real: SocketAddr,
) -> SessionControl {
    if *remote_player != Some(from) {
        match *remote_player {
            Some(old) => tracing::warn!(%old, new = %from, "updating remote player address"),
            None => tracing::info!(remote = %from, "learned remote player address"),
        }
        *remote_player = Some(from);
    }

    if natneg_protocol::is_nat_neg(data) {
        tracing::debug!(remote = %from, client = %client_real, "forwarding NatNeg packet from remote player");
    }
    if let Err(err) = fake_remote_socket.send_to(data, client_real).await {
        tracing::error!("fake remote socket send failed: {err}");
    }
    SessionControl::Extend
}

/// Client game-socket traffic on the fake remote socket, relayed to the
/// real remote peer. The source is tracked so a NAT rebinding mid-game does
/// not break the relay.
async fn handle_packet_to_remote_player(
    data: &[u8],
    from: SocketAddr,
    public_socket: &UdpSocket,
    remote_player: Option<SocketAddr>,
    client_real: &mut SocketAddr,
) -> SessionControl {
    if from != *client_real {
        tracing::warn!(old = %client_real, new = %from, "updating client address");
        *client_real = from;
    }

    let Some(remote) = remote_player else {
        tracing::warn!("remote player unknown, client packet discarded");
        return SessionControl::Continue;
    };
    if natneg_protocol::is_nat_neg(data) {
        tracing::debug!(client = %from, remote = %remote, "forwarding NatNeg packet to remote player");
    }
    if let Err(err) = public_socket.send_to(data, remote).await {
        tracing::error!("public socket send failed: {err}");
    }
    SessionControl::Extend
}
