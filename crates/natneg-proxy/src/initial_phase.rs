use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use natneg_protocol::NatNegPlayerId;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
};

use crate::{
    game_connection::{self, GameConnectionHandle},
    proxy::{SessionContext, SessionControl},
};

/// Rendezvous-phase session for one `(NatNegID, PlayerID)` key.
///
/// The session starts with nothing but the key: the upstream server name is
/// still unresolved and the client's public game endpoint is unknown. Client
/// packets submitted in that window are queued and drained once both
/// prerequisites land; only then does the communication socket's receive
/// loop start.
pub(crate) enum InitialPhaseCommand {
    PacketToServer { data: Vec<u8>, from: SocketAddr },
    PrepareGameConnection { client_public: SocketAddr },
}

pub(crate) struct InitialPhaseHandle {
    tx: mpsc::Sender<InitialPhaseCommand>,
}

impl InitialPhaseHandle {
    /// A closed channel means the session task has ended; the dispatcher
    /// treats this like an expired weak reference.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn send(
        &self,
        command: InitialPhaseCommand,
    ) -> Result<(), mpsc::error::TrySendError<InitialPhaseCommand>> {
        self.tx.try_send(command)
    }
}

pub(crate) fn spawn(id: NatNegPlayerId, ctx: SessionContext) -> InitialPhaseHandle {
    let (tx, rx) = mpsc::channel(ctx.cfg.session_queue_len);
    tokio::spawn(run(id, ctx, rx));
    InitialPhaseHandle { tx }
}

async fn run(id: NatNegPlayerId, ctx: SessionContext, mut rx: mpsc::Receiver<InitialPhaseCommand>) {
    let comm_socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!(%id, "failed to bind communication socket: {err}");
            close(&ctx, id).await;
            return;
        }
    };
    tracing::info!(%id, "initial phase created");

    // Resolve the upstream server concurrently; submitted packets queue
    // until the endpoint is known.
    let (resolved_tx, mut resolved_rx) = oneshot::channel();
    {
        let host = ctx.cfg.server_host.clone();
        let port = ctx.cfg.server_port;
        tracing::info!(%id, "resolving server hostname {host}:{port}");
        tokio::spawn(async move {
            let _ = resolved_tx.send(resolve_host_port(&host, port).await);
        });
    }
    let mut resolution_pending = true;

    let mut server: Option<SocketAddr> = None;
    let mut client_communication: Option<SocketAddr> = None;
    // `Some` until the session reaches its ready state, then drained.
    let mut pending: Option<Vec<(Vec<u8>, SocketAddr)>> = Some(Vec::new());
    let mut pending_client: Option<SocketAddr> = None;
    let mut connection: Option<GameConnectionHandle> = None;

    let mut shutdown = ctx.shutdown.clone();
    let mut buf = vec![0u8; ctx.cfg.recv_buffer_len];
    let idle = tokio::time::sleep(ctx.cfg.session_timeout);
    tokio::pin!(idle);

    loop {
        let control = tokio::select! {
            biased;
            _ = shutdown.changed() => SessionControl::Close,
            _ = &mut idle => {
                tracing::info!(%id, "inactivity timeout, closing");
                SessionControl::Close
            }
            command = rx.recv() => match command {
                Some(InitialPhaseCommand::PacketToServer { data, from }) => {
                    if let Some(queue) = pending.as_mut() {
                        tracing::debug!(%id, %from, "session not ready yet, deferring packet");
                        queue.push((data, from));
                        SessionControl::Continue
                    } else if let (Some(server), Some(conn)) = (server, connection.as_ref()) {
                        dispatch_to_server(id, data, from, &comm_socket, server, conn, &mut client_communication).await
                    } else {
                        SessionControl::Continue
                    }
                }
                Some(InitialPhaseCommand::PrepareGameConnection { client_public }) => {
                    pending_client = Some(client_public);
                    check_pending_actions(
                        id,
                        &ctx,
                        &comm_socket,
                        server,
                        &mut pending_client,
                        &mut pending,
                        &mut connection,
                        &mut client_communication,
                    )
                    .await
                }
                None => SessionControl::Close,
            },
            resolved = &mut resolved_rx, if resolution_pending => {
                resolution_pending = false;
                match resolved {
                    Ok(Ok(addr)) => {
                        tracing::info!(%id, server = %addr, "server hostname resolved");
                        server = Some(addr);
                        check_pending_actions(
                            id,
                            &ctx,
                            &comm_socket,
                            server,
                            &mut pending_client,
                            &mut pending,
                            &mut connection,
                            &mut client_communication,
                        )
                        .await
                    }
                    Ok(Err(err)) => {
                        // Stays unresolved; the inactivity timer reaps the session.
                        tracing::error!(%id, "failed to resolve server hostname: {err}");
                        SessionControl::Continue
                    }
                    Err(_) => SessionControl::Continue,
                }
            }
            recv = comm_socket.recv_from(&mut buf), if pending.is_none() => match recv {
                Ok((len, from)) => {
                    handle_packet_from_server(
                        id,
                        &buf[..len],
                        from,
                        server,
                        connection.as_ref(),
                        client_communication,
                    )
                    .await
                }
                Err(err) => {
                    tracing::error!(%id, "communication socket receive failed: {err}");
                    SessionControl::Continue
                }
            }
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

    close(&ctx, id).await;
}

/// Create the game connection once both the resolved server endpoint and the
/// client's public game endpoint are known, then drain the deferred queue.
#[allow(clippy::too_many_arguments)]
async fn check_pending_actions(
    id: NatNegPlayerId,
    ctx: &SessionContext,
    comm_socket: &UdpSocket,
    server: Option<SocketAddr>,
    pending_client: &mut Option<SocketAddr>,
    pending: &mut Option<Vec<(Vec<u8>, SocketAddr)>>,
    connection: &mut Option<GameConnectionHandle>,
    client_communication: &mut Option<SocketAddr>,
) -> SessionControl {
    let Some(server) = server else {
        return SessionControl::Continue;
    };
    let Some(client_public) = *pending_client else {
        return SessionControl::Continue;
    };
    let Some(queue) = pending.take() else {
        // Retransmitted init with sequence 0; the game connection exists.
        tracing::debug!(%id, "game connection already prepared, ignoring");
        *pending_client = None;
        return SessionControl::Continue;
    };
    *pending_client = None;

    tracing::info!(
        %id,
        client = %client_public,
        deferred = queue.len(),
        "game connection created, session ready"
    );
    *connection = Some(game_connection::spawn(ctx.clone(), server, client_public));

    let mut control = SessionControl::Continue;
    for (data, from) in queue {
        let Some(conn) = connection.as_ref() else {
            break;
        };
        match dispatch_to_server(id, data, from, comm_socket, server, conn, client_communication)
            .await
        {
            SessionControl::Close => return SessionControl::Close,
            SessionControl::Extend => control = SessionControl::Extend,
            SessionControl::Continue => {}
        }
    }
    control
}

/// Route one client datagram once the session is ready. Traffic from the
/// client's game socket belongs to the game connection; anything else is the
/// client's communication-socket traffic and goes upstream from here.
async fn dispatch_to_server(
    id: NatNegPlayerId,
    data: Vec<u8>,
    from: SocketAddr,
    comm_socket: &UdpSocket,
    server: SocketAddr,
    connection: &GameConnectionHandle,
    client_communication: &mut Option<SocketAddr>,
) -> SessionControl {
    use tokio::sync::mpsc::error::TrySendError;

    if connection.is_closed() {
        tracing::warn!(%id, "game connection expired, closing session");
        return SessionControl::Close;
    }

    if from == connection.client_public() {
        // The game connection relays this from its own socket so the server
        // learns that socket's public endpoint.
        return match connection.packet_to_server(data) {
            Ok(()) => SessionControl::Continue,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%id, "game connection queue full, dropping packet");
                SessionControl::Continue
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(%id, "game connection expired, closing session");
                SessionControl::Close
            }
        };
    }

    if !natneg_protocol::is_nat_neg(&data) {
        tracing::warn!(%id, %from, "packet to server is not NatNeg, discarded");
        return SessionControl::Continue;
    }

    tracing::debug!(%id, %from, "updating client communication endpoint");
    *client_communication = Some(from);

    if let Err(err) = comm_socket.send_to(&data, server).await {
        tracing::error!(%id, "communication socket send failed: {err}");
    }
    SessionControl::Extend
}

/// A reply arrived on this session's own communication socket; server
/// replies are handed to the game connection, which owns the rewrite path.
async fn handle_packet_from_server(
    id: NatNegPlayerId,
    data: &[u8],
    from: SocketAddr,
    server: Option<SocketAddr>,
    connection: Option<&GameConnectionHandle>,
    client_communication: Option<SocketAddr>,
) -> SessionControl {
    use tokio::sync::mpsc::error::TrySendError;

    let (Some(server), Some(connection)) = (server, connection) else {
        return SessionControl::Continue;
    };

    if from != server {
        tracing::debug!(%id, %from, "datagram on communication socket from unexpected source, discarded");
        return SessionControl::Continue;
    }
    if !natneg_protocol::is_nat_neg(data) {
        tracing::warn!(%id, "packet from server is not NatNeg, discarded");
        return SessionControl::Continue;
    }

    match connection.communication_from_server(data.to_vec(), client_communication) {
        Ok(()) => SessionControl::Extend,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%id, "game connection queue full, dropping server packet");
            SessionControl::Continue
        }
        Err(TrySendError::Closed(_)) => {
            tracing::warn!(%id, "game connection expired, closing session");
            SessionControl::Close
        }
    }
}

async fn close(ctx: &SessionContext, id: NatNegPlayerId) {
    if ctx.removals.send(id).await.is_err() {
        tracing::debug!(%id, "dispatcher already gone while closing");
    }
}

/// Resolve `host:port`, skipping DNS for numeric addresses. The proxy is
/// IPv4-only, so IPv4 results win over whatever the resolver lists first.
async fn resolve_host_port(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs = tokio::net::lookup_host((host, port)).await?;
    let mut first = None;
    for addr in addrs {
        if first.is_none() {
            first = Some(addr);
        }
        if addr.is_ipv4() {
            return Ok(addr);
        }
    }
    first.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolve_host_port_takes_numeric_fast_path() {
        let addr = resolve_host_port("192.0.2.1", 27901).await.unwrap();
        assert_eq!(addr, SocketAddr::from(([192, 0, 2, 1], 27901)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolve_host_port_prefers_ipv4() {
        let resolved = resolve_host_port("localhost", 27901).await.unwrap();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(("localhost", 27901))
            .await
            .unwrap()
            .collect();
        if addrs.iter().any(|addr| addr.is_ipv4()) {
            assert!(resolved.is_ipv4(), "expected an IPv4 result, got {resolved}");
        }
    }
}
