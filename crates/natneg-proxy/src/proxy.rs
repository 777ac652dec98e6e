use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use natneg_protocol::NatNegPlayerId;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::ProxyConfig,
    initial_phase::{self, InitialPhaseCommand, InitialPhaseHandle},
    translator::AddressTranslator,
};

/// What a completed session operation means for the owning loop.
pub(crate) enum SessionControl {
    Continue,
    /// Observed activity; re-arm the inactivity timer.
    Extend,
    Close,
}

/// The well-known front socket, shared between the dispatcher's receive loop
/// and the game connections that use it as egress towards clients.
#[derive(Clone)]
pub(crate) struct FrontSocket {
    socket: Arc<UdpSocket>,
}

impl FrontSocket {
    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Send `data` so the client sees it coming from the server's expected
    /// port. This is the proxy's sole spoofing-by-proxy path.
    pub(crate) async fn send_from_proxy_socket(&self, data: &[u8], to: SocketAddr) {
        tracing::debug!(%to, len = data.len(), "sending from front socket");
        if let Err(err) = self.socket.send_to(data, to).await {
            tracing::error!(%to, "front socket send failed: {err}");
        }
    }
}

/// Everything a session needs from its surroundings. Sessions never own the
/// dispatcher or the translator; the dispatcher likewise only holds session
/// command channels, so a session's lifetime is pinned solely by its own
/// task.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) cfg: Arc<ProxyConfig>,
    pub(crate) front: FrontSocket,
    pub(crate) translator: Weak<AddressTranslator>,
    pub(crate) removals: mpsc::Sender<NatNegPlayerId>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

pub struct ProxyHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub async fn start_proxy(
    cfg: ProxyConfig,
    translator: Arc<AddressTranslator>,
) -> io::Result<ProxyHandle> {
    let socket = UdpSocket::bind(cfg.bind_addr).await?;
    let local_addr = socket.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (removals_tx, removals_rx) = mpsc::channel::<NatNegPlayerId>(64);

    let ctx = SessionContext {
        cfg: Arc::new(cfg),
        front: FrontSocket {
            socket: Arc::new(socket),
        },
        translator: Arc::downgrade(&translator),
        removals: removals_tx,
        shutdown: shutdown_rx,
    };

    let task = tokio::spawn(run_dispatcher(ctx, removals_rx));

    Ok(ProxyHandle {
        local_addr,
        shutdown_tx,
        task: Some(task),
    })
}

async fn run_dispatcher(ctx: SessionContext, mut removals_rx: mpsc::Receiver<NatNegPlayerId>) {
    let mut sessions: HashMap<NatNegPlayerId, InitialPhaseHandle> = HashMap::new();
    let mut shutdown = ctx.shutdown.clone();
    let mut buf = vec![0u8; ctx.cfg.recv_buffer_len];

    tracing::info!("natneg proxy created");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                tracing::info!("dispatcher shutting down");
                break;
            }
            Some(id) = removals_rx.recv() => {
                remove_connection(&mut sessions, id);
            }
            recv = ctx.front.socket().recv_from(&mut buf) => {
                match recv {
                    Ok((len, from)) => handle_packet_to_server(&ctx, &mut sessions, &buf[..len], from),
                    Err(err) => tracing::error!("front socket receive failed: {err}"),
                }
            }
        }
    }
}

fn handle_packet_to_server(
    ctx: &SessionContext,
    sessions: &mut HashMap<NatNegPlayerId, InitialPhaseHandle>,
    data: &[u8],
    from: SocketAddr,
) {
    if !natneg_protocol::is_nat_neg(data) {
        tracing::warn!(%from, "packet is not NatNeg, discarded");
        return;
    }

    let id = match natneg_protocol::player_id(data) {
        Ok(Some(id)) => id,
        Ok(None) => {
            tracing::debug!(%from, "packet carries no session key, discarded");
            return;
        }
        Err(err) => {
            tracing::warn!(%from, "malformed NatNeg packet: {err}, discarded");
            return;
        }
    };

    let session = session_for(ctx, sessions, id);

    // An init with sequence number 0 is the one packet sent from the
    // client's game socket, so `from` is the client's public game endpoint
    // and the game connection has to be materialized now. Later sequence
    // numbers get no special treatment.
    if let Ok(Some(0)) = natneg_protocol::init_sequence(data) {
        tracing::info!(%id, client = %from, "init sequence 0, preparing game connection");
        forward(session, id, InitialPhaseCommand::PrepareGameConnection { client_public: from });
    }

    forward(
        session,
        id,
        InitialPhaseCommand::PacketToServer {
            data: data.to_vec(),
            from,
        },
    );
}

/// Table lookup that treats a closed command channel like an expired weak
/// reference: the session task is gone, so a fresh one replaces it.
fn session_for<'a>(
    ctx: &SessionContext,
    sessions: &'a mut HashMap<NatNegPlayerId, InitialPhaseHandle>,
    id: NatNegPlayerId,
) -> &'a InitialPhaseHandle {
    use std::collections::hash_map::Entry;

    match sessions.entry(id) {
        Entry::Occupied(mut entry) => {
            if entry.get().is_closed() {
                tracing::info!(%id, "session expired, recreating initial phase");
                entry.insert(initial_phase::spawn(id, ctx.clone()));
            }
            entry.into_mut()
        }
        Entry::Vacant(entry) => {
            tracing::info!(%id, "new session key, creating initial phase");
            entry.insert(initial_phase::spawn(id, ctx.clone()))
        }
    }
}

fn forward(session: &InitialPhaseHandle, id: NatNegPlayerId, command: InitialPhaseCommand) {
    use tokio::sync::mpsc::error::TrySendError;

    match session.send(command) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%id, "session queue full, dropping packet");
        }
        Err(TrySendError::Closed(_)) => {
            tracing::warn!(%id, "session closed before handoff, dropping packet");
        }
    }
}

/// Idempotent. A stale removal must not take down a session that was already
/// recreated under the same key, so only dead entries are erased.
fn remove_connection(sessions: &mut HashMap<NatNegPlayerId, InitialPhaseHandle>, id: NatNegPlayerId) {
    if let Some(session) = sessions.get(&id) {
        if session.is_closed() {
            tracing::info!(%id, "removing connection");
            sessions.remove(&id);
        } else {
            tracing::debug!(%id, "stale removal for a live session, ignored");
        }
    }
}
