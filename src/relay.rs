//! # Relay Forwarding and Circuits
//!
//! Server side runs on publicly reachable nodes: it keeps an address book
//! of registered peers, forwards punch signaling between them, and shovels
//! `PRLY`-framed UDP packets for allocated circuit sessions. State lives in
//! an actor; the handle is cheap to clone.
//!
//! Client side runs on NAT-bound nodes. Relays are never discovered, only
//! configured explicitly, and the signaling connection is dialed lazily on
//! first use. A [`RelayCircuit`] is a QUIC connection tunneled through a
//! forwarding session; its health is tracked by keepalives over the
//! signaling connection, with one silent reconnect attempt before the
//! circuit is declared dead. Streams on a circuit close independently,
//! closing one never tears down the circuit.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use anyhow::{Context as AnyhowContext, Result, bail};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{Connection, Endpoint};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::addrstore::AddrStore;
use crate::crypto::{extract_verified_identity, identity_to_sni};
use crate::identity::{Identity, now_ms};
use crate::messages::{
    self, AddressBookEntry, AddressBookUpdate, RelayPush, RelayPushReply, RelayRequest,
    RelayResponse, RequestBody, WireRequest, WireResponse,
};
use crate::nat::{NatClass, NatCoordinator};
use crate::rpc::{self, IdentityMismatch, read_framed, write_framed};
use crate::signaling::{PunchAnswer, PunchOffer, SignalingChannel};
use crate::socket::RoutedSock;
use crate::verifier::Verifier;

// ============================================================================
// Constants
// ============================================================================

/// Magic bytes identifying relay circuit frames.
pub const RELAY_MAGIC: [u8; 4] = *b"PRLY";

/// Relay frame header: magic(4) + session_id(16).
pub const RELAY_HEADER_SIZE: usize = 20;

/// Maximum relay frame size (fits in UDP MTU with headroom).
pub const MAX_RELAY_FRAME_SIZE: usize = 1400;

/// Maximum forwarding sessions the server will carry.
/// SECURITY: Bounds session table growth.
pub const MAX_SESSIONS: usize = 10_000;

/// Maximum registered peers (address book and push connections).
/// SECURITY: Bounds registration state per relay.
pub const MAX_REGISTRATIONS: usize = 10_000;

/// Inactive complete sessions are garbage collected after this.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval for the expired-session sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum sessions a single IP may hold per rate-limit window.
/// SECURITY: Limits session table pollution from one source.
pub const MAX_SESSIONS_PER_IP: usize = 50;

/// Rate limit window for session allocation.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Deadline for a pushed signal to be answered by the target peer.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub fn generate_session_id() -> Result<[u8; 16]> {
    let mut id = [0u8; 16];
    getrandom::getrandom(&mut id).map_err(|e| anyhow::anyhow!("CSPRNG unavailable: {e}"))?;
    Ok(id)
}

// ============================================================================
// Frame Codec
// ============================================================================

/// Client-side encoder for one circuit session, used by the socket layer
/// to wrap QUIC packets for transit through the relay.
#[derive(Debug, Clone)]
pub struct RelayTunnel {
    session_id: [u8; 16],
}

impl RelayTunnel {
    pub fn new(session_id: [u8; 16]) -> Self {
        Self { session_id }
    }

    pub fn session_id(&self) -> [u8; 16] {
        self.session_id
    }

    /// Wrap a QUIC packet in a `PRLY` frame.
    pub fn encode_frame(&self, quic_packet: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(RELAY_HEADER_SIZE + quic_packet.len());
        frame.extend_from_slice(&RELAY_MAGIC);
        frame.extend_from_slice(&self.session_id);
        frame.extend_from_slice(quic_packet);
        frame
    }

    /// Split a `PRLY` frame into (session_id, payload).
    pub fn decode_frame(data: &[u8]) -> Option<([u8; 16], &[u8])> {
        if data.len() < RELAY_HEADER_SIZE || data[0..4] != RELAY_MAGIC {
            return None;
        }
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&data[4..20]);
        Some((session_id, &data[RELAY_HEADER_SIZE..]))
    }
}

// ============================================================================
// Circuit State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Session allocated, QUIC handshake over the tunnel in flight.
    Creating,
    /// Handshake complete, keepalives healthy.
    Active,
    /// Keepalive budget exhausted; one reconnect attempt is in flight.
    Stale,
    /// Terminal. A closed circuit is never revived.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    Established,
    HeartbeatOk,
    HeartbeatMissed { exhausted: bool },
    Reconnected,
    ReconnectFailed,
    CloseRequested,
    TransportFailed,
}

/// Pure transition function. Closed absorbs everything; events that make
/// no sense in the current state leave it unchanged.
pub fn circuit_transition(state: CircuitState, event: CircuitEvent) -> CircuitState {
    use CircuitEvent::*;
    use CircuitState::*;
    match (state, event) {
        (Closed, _) => Closed,
        (_, CloseRequested) | (_, TransportFailed) => Closed,
        (Creating, Established) => Active,
        (Active, HeartbeatOk) => Active,
        (Active, HeartbeatMissed { exhausted: false }) => Active,
        (Active, HeartbeatMissed { exhausted: true }) => Stale,
        // A late ack while stale counts as recovery.
        (Stale, Reconnected) | (Stale, HeartbeatOk) => Active,
        (Stale, ReconnectFailed) => Closed,
        (s, _) => s,
    }
}

// ============================================================================
// Forwarding Sessions (server side)
// ============================================================================

#[derive(Debug, Clone)]
struct RelaySession {
    initiator_identity: Identity,
    initiator_addr: SocketAddr,
    target_identity: Identity,
    target_addr: SocketAddr,
    created_at: Instant,
    last_activity: Instant,
    bytes_relayed: u64,
    packets_relayed: u64,
}

impl RelaySession {
    fn new(initiator: (Identity, SocketAddr), target: (Identity, SocketAddr)) -> Self {
        let now = Instant::now();
        Self {
            initiator_identity: initiator.0,
            initiator_addr: initiator.1,
            target_identity: target.0,
            target_addr: target.1,
            created_at: now,
            last_activity: now,
            bytes_relayed: 0,
            packets_relayed: 0,
        }
    }

    fn is_expired(&self) -> bool {
        self.last_activity.elapsed() > SESSION_TIMEOUT
    }

    /// The other endpoint, or None if `from` is not a participant.
    fn destination(&self, from: SocketAddr) -> Option<SocketAddr> {
        if from == self.initiator_addr {
            Some(self.target_addr)
        } else if from == self.target_addr {
            Some(self.initiator_addr)
        } else {
            None
        }
    }

    fn record_activity(&mut self, bytes: usize) {
        self.last_activity = Instant::now();
        self.bytes_relayed += bytes as u64;
        self.packets_relayed += 1;
    }
}

// ============================================================================
// RelayServer Handle
// ============================================================================

enum ServerCommand {
    Register {
        identity: Identity,
        addr: SocketAddr,
        conn: Connection,
        update: AddressBookUpdate,
        reply: oneshot::Sender<Result<(), &'static str>>,
    },
    Lookup {
        target: Identity,
        reply: oneshot::Sender<Option<AddressBookEntry>>,
    },
    Registration {
        target: Identity,
        reply: oneshot::Sender<Option<(Connection, SocketAddr)>>,
    },
    CreateSession {
        session_id: [u8; 16],
        initiator: (Identity, SocketAddr),
        target: (Identity, SocketAddr),
        reply: oneshot::Sender<Result<(), &'static str>>,
    },
    RemoveSession {
        session_id: [u8; 16],
    },
    TouchSession {
        session_id: [u8; 16],
        reply: oneshot::Sender<bool>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    ProcessPacket {
        data: Vec<u8>,
        from: SocketAddr,
    },
    Quit,
}

/// Handle to the relay server actor. Cheap to clone.
#[derive(Clone)]
pub struct RelayServer {
    cmd_tx: mpsc::Sender<ServerCommand>,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer").finish_non_exhaustive()
    }
}

impl RelayServer {
    /// Spawn the actor. `socket` is the node's UDP socket, shared with the
    /// QUIC endpoint; forwarded frames go straight out through it.
    pub fn start(socket: Arc<UdpSocket>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        if let Ok(addr) = socket.local_addr() {
            info!(addr = %addr, "relay server started");
        }
        let actor = RelayServerActor::new(socket);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Forward a circuit frame that arrived on the shared socket but does
    /// not belong to a local session. Called from the datagram hot path.
    pub async fn process_packet(&self, data: Vec<u8>, from: SocketAddr) {
        let _ = self
            .cmd_tx
            .send(ServerCommand::ProcessPacket { data, from })
            .await;
    }

    pub async fn session_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ServerCommand::SessionCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Service one relay request from an authenticated signaling stream.
    /// `sender` is the TLS-verified identity of the caller and `conn` the
    /// connection the request arrived on.
    pub async fn handle_request(
        &self,
        request: RelayRequest,
        sender: Identity,
        conn: Connection,
    ) -> RelayResponse {
        match request {
            RelayRequest::Register { update } => {
                let observed = conn.remote_address();
                match self
                    .send_registration(sender, observed, conn, update)
                    .await
                {
                    Ok(()) => RelayResponse::Registered {
                        observed_addr: observed.to_string(),
                    },
                    Err(reason) => RelayResponse::Error {
                        message: reason.to_string(),
                    },
                }
            }
            RelayRequest::Query { target } => {
                let (reply, rx) = oneshot::channel();
                let _ = self.cmd_tx.send(ServerCommand::Lookup { target, reply }).await;
                RelayResponse::QueryResult {
                    entry: rx.await.unwrap_or(None),
                }
            }
            RelayRequest::ConnectRequest { target, offer } => {
                let Some((target_conn, _)) = self.registration(target).await else {
                    return RelayResponse::ConnectRejected {
                        reason: "target not registered".to_string(),
                    };
                };
                match push_to_peer(&target_conn, &RelayPush::IncomingConnect {
                    from: sender,
                    offer,
                })
                .await
                {
                    Ok(RelayPushReply::Answer { answer }) => {
                        RelayResponse::ConnectAnswer { answer }
                    }
                    Ok(RelayPushReply::Rejected { reason }) => {
                        RelayResponse::ConnectRejected { reason }
                    }
                    Ok(RelayPushReply::CircuitReady) => RelayResponse::ConnectRejected {
                        reason: "unexpected reply from target".to_string(),
                    },
                    Err(e) => RelayResponse::ConnectRejected {
                        reason: format!("target unreachable: {e}"),
                    },
                }
            }
            RelayRequest::OpenCircuit { target } => {
                self.open_circuit_for(sender, conn.remote_address(), target)
                    .await
            }
            RelayRequest::Keepalive { session_id } => {
                let (reply, rx) = oneshot::channel();
                let _ = self
                    .cmd_tx
                    .send(ServerCommand::TouchSession { session_id, reply })
                    .await;
                if rx.await.unwrap_or(false) {
                    RelayResponse::KeepaliveAck
                } else {
                    RelayResponse::Error {
                        message: "unknown session".to_string(),
                    }
                }
            }
        }
    }

    async fn open_circuit_for(
        &self,
        initiator: Identity,
        initiator_addr: SocketAddr,
        target: Identity,
    ) -> RelayResponse {
        let Some((target_conn, target_addr)) = self.registration(target).await else {
            return RelayResponse::CircuitRejected {
                reason: "target not registered".to_string(),
            };
        };

        let session_id = match generate_session_id() {
            Ok(id) => id,
            Err(e) => {
                return RelayResponse::CircuitRejected {
                    reason: e.to_string(),
                };
            }
        };

        // The session must exist before the target acknowledges, so the
        // initiator's first handshake packets are forwardable immediately.
        let (reply, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(ServerCommand::CreateSession {
                session_id,
                initiator: (initiator, initiator_addr),
                target: (target, target_addr),
                reply,
            })
            .await;
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return RelayResponse::CircuitRejected {
                    reason: reason.to_string(),
                };
            }
            Err(_) => {
                return RelayResponse::CircuitRejected {
                    reason: "relay actor stopped".to_string(),
                };
            }
        }

        match push_to_peer(&target_conn, &RelayPush::IncomingCircuit {
            from: initiator,
            session_id,
        })
        .await
        {
            Ok(RelayPushReply::CircuitReady) => RelayResponse::CircuitOpen { session_id },
            Ok(RelayPushReply::Rejected { reason }) => {
                self.remove_session(session_id).await;
                RelayResponse::CircuitRejected { reason }
            }
            Ok(RelayPushReply::Answer { .. }) => {
                self.remove_session(session_id).await;
                RelayResponse::CircuitRejected {
                    reason: "unexpected reply from target".to_string(),
                }
            }
            Err(e) => {
                self.remove_session(session_id).await;
                RelayResponse::CircuitRejected {
                    reason: format!("target unreachable: {e}"),
                }
            }
        }
    }

    async fn send_registration(
        &self,
        identity: Identity,
        addr: SocketAddr,
        conn: Connection,
        update: AddressBookUpdate,
    ) -> Result<(), &'static str> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ServerCommand::Register {
                identity,
                addr,
                conn,
                update,
                reply,
            })
            .await
            .map_err(|_| "relay actor stopped")?;
        rx.await.map_err(|_| "relay actor stopped")?
    }

    async fn registration(&self, target: Identity) -> Option<(Connection, SocketAddr)> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ServerCommand::Registration { target, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    async fn remove_session(&self, session_id: [u8; 16]) {
        let _ = self
            .cmd_tx
            .send(ServerCommand::RemoveSession { session_id })
            .await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(ServerCommand::Quit).await;
    }
}

/// Open a fresh stream on the target's signaling connection, deliver a
/// push, and wait for its reply on the same stream.
async fn push_to_peer(conn: &Connection, push: &RelayPush) -> Result<RelayPushReply> {
    tokio::time::timeout(PUSH_TIMEOUT, async {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .context("failed to open push stream")?;
        let bytes = messages::serialize(push)?;
        write_framed(&mut send, &bytes).await?;
        send.finish()?;
        let reply_bytes = read_framed(&mut recv, rpc::MAX_RESPONSE_SIZE).await?;
        let reply: RelayPushReply = messages::deserialize_bounded(&reply_bytes)?;
        Ok(reply)
    })
    .await
    .map_err(|_| anyhow::anyhow!("push timed out"))?
}

// ============================================================================
// RelayServer Actor
// ============================================================================

struct RelayServerActor {
    socket: Arc<UdpSocket>,
    /// Active forwarding sessions.
    /// SECURITY: Bounded via LruCache, oldest evicted at capacity.
    sessions: LruCache<[u8; 16], RelaySession>,
    /// Signaling connections of registered peers, for pushes.
    registrations: LruCache<Identity, (Connection, SocketAddr)>,
    /// Non-authoritative cache of registered peers' addresses.
    address_book: LruCache<Identity, AddressBookEntry>,
    /// Per-IP session count for rate limiting: (count, window_start).
    ip_session_count: LruCache<IpAddr, (usize, Instant)>,
}

impl RelayServerActor {
    fn new(socket: Arc<UdpSocket>) -> Self {
        let sessions_cap = NonZeroUsize::new(MAX_SESSIONS).unwrap_or(NonZeroUsize::MIN);
        let reg_cap = NonZeroUsize::new(MAX_REGISTRATIONS).unwrap_or(NonZeroUsize::MIN);
        Self {
            socket,
            sessions: LruCache::new(sessions_cap),
            registrations: LruCache::new(reg_cap),
            address_book: LruCache::new(reg_cap),
            ip_session_count: LruCache::new(reg_cap),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ServerCommand>) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ServerCommand::Register { identity, addr, conn, update, reply }) => {
                            let _ = reply.send(self.register(identity, addr, conn, update));
                        }
                        Some(ServerCommand::Lookup { target, reply }) => {
                            let _ = reply.send(self.lookup(target));
                        }
                        Some(ServerCommand::Registration { target, reply }) => {
                            let reg = self.registrations.get(&target).and_then(|(conn, addr)| {
                                conn.close_reason().is_none().then(|| (conn.clone(), *addr))
                            });
                            let _ = reply.send(reg);
                        }
                        Some(ServerCommand::CreateSession { session_id, initiator, target, reply }) => {
                            let _ = reply.send(self.create_session(session_id, initiator, target));
                        }
                        Some(ServerCommand::RemoveSession { session_id }) => {
                            self.sessions.pop(&session_id);
                        }
                        Some(ServerCommand::TouchSession { session_id, reply }) => {
                            let known = match self.sessions.get_mut(&session_id) {
                                Some(session) => {
                                    session.last_activity = Instant::now();
                                    true
                                }
                                None => false,
                            };
                            let _ = reply.send(known);
                        }
                        Some(ServerCommand::SessionCount { reply }) => {
                            let _ = reply.send(self.sessions.len());
                        }
                        Some(ServerCommand::ProcessPacket { data, from }) => {
                            self.forward_packet(&data, from).await;
                        }
                        Some(ServerCommand::Quit) | None => {
                            debug!("relay server actor shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup.tick() => {
                    self.cleanup_expired();
                }
            }
        }
    }

    fn register(
        &mut self,
        identity: Identity,
        addr: SocketAddr,
        conn: Connection,
        update: AddressBookUpdate,
    ) -> Result<(), &'static str> {
        self.registrations.put(identity, (conn, addr));
        self.address_book.put(identity, AddressBookEntry {
            identity,
            direct_addrs: update.direct_addrs,
            nat_class: update.nat_class,
            online: true,
            last_seen_ms: now_ms(),
        });
        debug!(peer = %identity.short(), addr = %addr, "peer registered");
        Ok(())
    }

    fn lookup(&mut self, target: Identity) -> Option<AddressBookEntry> {
        let online = self
            .registrations
            .get(&target)
            .is_some_and(|(conn, _)| conn.close_reason().is_none());
        let entry = self.address_book.get_mut(&target)?;
        entry.online = online;
        Some(entry.clone())
    }

    fn create_session(
        &mut self,
        session_id: [u8; 16],
        initiator: (Identity, SocketAddr),
        target: (Identity, SocketAddr),
    ) -> Result<(), &'static str> {
        if self.sessions.len() >= MAX_SESSIONS {
            return Err("relay at session capacity");
        }

        // SECURITY: Per-IP rate limiting against session exhaustion.
        let ip = initiator.1.ip();
        let now = Instant::now();
        let (count, window_start) = self.ip_session_count.get_or_insert_mut(ip, || (0, now));
        if now.duration_since(*window_start) > RATE_LIMIT_WINDOW {
            *count = 0;
            *window_start = now;
        }
        if *count >= MAX_SESSIONS_PER_IP {
            warn!(ip = %ip, "session rate limit exceeded");
            return Err("rate limit exceeded");
        }
        *count += 1;

        if self.sessions.contains(&session_id) {
            return Err("session id collision");
        }

        debug!(
            session = %hex::encode(&session_id[..4]),
            initiator = %initiator.0.short(),
            target = %target.0.short(),
            "circuit session created"
        );
        self.sessions
            .put(session_id, RelaySession::new(initiator, target));
        Ok(())
    }

    async fn forward_packet(&mut self, data: &[u8], from: SocketAddr) {
        let Some((session_id, _)) = RelayTunnel::decode_frame(data) else {
            trace!(from = %from, len = data.len(), "dropping malformed relay frame");
            return;
        };

        let dest = match self.sessions.get_mut(&session_id) {
            Some(session) => match session.destination(from) {
                Some(dest) => {
                    session.record_activity(data.len());
                    dest
                }
                None => {
                    trace!(
                        session = %hex::encode(&session_id[..4]),
                        from = %from,
                        "dropping frame from non-participant"
                    );
                    return;
                }
            },
            None => {
                trace!(
                    session = %hex::encode(&session_id[..4]),
                    from = %from,
                    "dropping frame for unknown session"
                );
                return;
            }
        };

        if let Err(e) = self.socket.send_to(data, dest).await {
            warn!(dest = %dest, error = %e, "relay forward failed");
        }
    }

    fn cleanup_expired(&mut self) {
        let expired: Vec<[u8; 16]> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired())
            .map(|(id, _)| *id)
            .collect();
        let removed = expired.len();
        for session_id in expired {
            if let Some(session) = self.sessions.pop(&session_id) {
                trace!(
                    session = %hex::encode(&session_id[..4]),
                    age_secs = session.created_at.elapsed().as_secs(),
                    bytes = session.bytes_relayed,
                    packets = session.packets_relayed,
                    initiator = %session.initiator_identity.short(),
                    target = %session.target_identity.short(),
                    "expired circuit session"
                );
            }
        }

        // Mark peers whose signaling connection died as offline so queries
        // stop steering dials at them.
        let dead: Vec<Identity> = self
            .registrations
            .iter()
            .filter(|(_, (conn, _))| conn.close_reason().is_some())
            .map(|(id, _)| *id)
            .collect();
        for identity in dead {
            self.registrations.pop(&identity);
            if let Some(entry) = self.address_book.get_mut(&identity) {
                entry.online = false;
            }
        }

        if removed > 0 {
            debug!(removed = removed, remaining = self.sessions.len(), "session sweep");
        }
    }
}

// ============================================================================
// RelayClient
// ============================================================================

/// Client-side relay access for one configured relay. All methods that
/// need the relay dial the signaling connection lazily and reuse it.
pub struct RelayClient {
    endpoint: Endpoint,
    sock: Arc<RoutedSock>,
    relay_addr: Option<SocketAddr>,
    unpinned_config: quinn::ClientConfig,
    pinned_config: quinn::ClientConfig,
    local_identity: Identity,
    coordinator: Arc<NatCoordinator>,
    addrs: AddrStore,
    verifier: Verifier,
    nat_class: Arc<StdRwLock<NatClass>>,
    punch_timeout: Duration,
    probe_interval: Duration,
    punch_skew_tolerance: Duration,
    signaling_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_misses: u32,
    signaling: Mutex<Option<Connection>>,
}

impl RelayClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Endpoint,
        sock: Arc<RoutedSock>,
        unpinned_config: quinn::ClientConfig,
        pinned_config: quinn::ClientConfig,
        local_identity: Identity,
        coordinator: Arc<NatCoordinator>,
        addrs: AddrStore,
        verifier: Verifier,
        nat_class: Arc<StdRwLock<NatClass>>,
        config: &crate::config::Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            sock,
            relay_addr: config.relay_addr,
            unpinned_config,
            pinned_config,
            local_identity,
            coordinator,
            addrs,
            verifier,
            nat_class,
            punch_timeout: config.punch_timeout,
            probe_interval: config.punch_probe_interval,
            punch_skew_tolerance: config.punch_skew_tolerance,
            signaling_timeout: config.signaling_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_misses: config.heartbeat_misses,
            signaling: Mutex::new(None),
        })
    }

    /// Whether an operator configured a relay at all.
    pub fn is_configured(&self) -> bool {
        self.relay_addr.is_some()
    }

    /// Relay endpoints to advertise in our published record.
    pub fn advertised_relay_addrs(&self) -> Vec<String> {
        self.relay_addr.iter().map(|a| a.to_string()).collect()
    }

    /// Dial and register with the relay now instead of on first use. A
    /// peer that wants to be reachable through the relay must register
    /// before anyone can signal it.
    pub async fn connect_now(&self) -> Result<()> {
        self.ensure_connected().await.map(|_| ())
    }

    /// The lazily-dialed signaling connection, registering on first dial.
    /// The relay's identity is learned from the handshake; its address is
    /// operator-trusted, so the TLS verifier only requires a valid
    /// self-signed Ed25519 certificate rather than a pinned identity.
    async fn ensure_connected(&self) -> Result<Connection> {
        let relay_addr = self.relay_addr.context("no relay configured")?;
        let mut guard = self.signaling.lock().await;
        if let Some(conn) = guard.as_ref()
            && conn.close_reason().is_none()
        {
            return Ok(conn.clone());
        }
        *guard = None;

        let connecting = self
            .endpoint
            .connect_with(self.unpinned_config.clone(), relay_addr, "relay")
            .context("failed to start relay connection")?;
        let conn = tokio::time::timeout(self.signaling_timeout, connecting)
            .await
            .map_err(|_| anyhow::anyhow!("relay handshake timed out"))?
            .context("relay handshake failed")?;

        let relay_identity = extract_verified_identity(&conn)
            .context("relay presented no verifiable identity")?;
        info!(
            relay = %relay_identity.short(),
            addr = %relay_addr,
            "signaling connection established"
        );

        self.spawn_push_loop(conn.clone(), relay_addr);
        self.register_on(&conn).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Send our current address book entry to the relay. The registration
    /// response doubles as an address echo.
    async fn register_on(&self, conn: &Connection) -> Result<()> {
        let update = self.current_update().await;
        let response = rpc::request(conn, &WireRequest {
            sender: self.local_identity,
            body: RequestBody::Relay(RelayRequest::Register { update }),
        })
        .await?;
        match response {
            WireResponse::Relay(RelayResponse::Registered { observed_addr }) => {
                if let Ok(observed) = observed_addr.parse::<SocketAddr>() {
                    self.verifier.report_echo(observed).await;
                }
                Ok(())
            }
            WireResponse::Relay(RelayResponse::Error { message })
            | WireResponse::Error { message } => bail!("relay registration failed: {message}"),
            other => bail!("unexpected registration response: {other:?}"),
        }
    }

    /// Refresh the registration after the publishable set changed. A miss
    /// here is tolerable, the next lazy dial re-registers anyway.
    pub async fn refresh_registration(&self) {
        let conn = {
            let guard = self.signaling.lock().await;
            guard.clone()
        };
        if let Some(conn) = conn
            && conn.close_reason().is_none()
            && let Err(e) = self.register_on(&conn).await
        {
            debug!(error = %e, "registration refresh failed");
        }
    }

    async fn current_update(&self) -> AddressBookUpdate {
        let direct_addrs = self
            .addrs
            .list_publishable()
            .await
            .into_iter()
            .map(|e| e.addr.to_string())
            .collect();
        let nat_class = self.nat_class.read().map(|g| *g).unwrap_or_default();
        AddressBookUpdate {
            direct_addrs,
            nat_class,
        }
    }

    /// Answer relay-initiated pushes: punch exchanges targeting us and
    /// circuits opened toward us.
    fn spawn_push_loop(&self, conn: Connection, relay_addr: SocketAddr) {
        let coordinator = Arc::clone(&self.coordinator);
        let addrs = self.addrs.clone();
        let sock = Arc::clone(&self.sock);
        let nat_class = Arc::clone(&self.nat_class);
        let punch_timeout = self.punch_timeout;
        let probe_interval = self.probe_interval;
        let skew_tolerance = self.punch_skew_tolerance;

        tokio::spawn(async move {
            loop {
                let (mut send, mut recv) = match conn.accept_bi().await {
                    Ok(streams) => streams,
                    Err(e) => {
                        debug!(error = %e, "signaling connection ended");
                        break;
                    }
                };

                let push: RelayPush = match read_framed(&mut recv, rpc::MAX_REQUEST_SIZE)
                    .await
                    .and_then(|bytes| Ok(messages::deserialize_bounded(&bytes)?))
                {
                    Ok(push) => push,
                    Err(e) => {
                        trace!(error = %e, "malformed push");
                        continue;
                    }
                };

                let reply = match push {
                    RelayPush::IncomingConnect { from, offer } => {
                        debug!(peer = %from.short(), "incoming punch exchange");
                        // Open our mapping toward the offerer for the same
                        // window it is probing us.
                        coordinator.spawn_responder_burst(
                            offer.candidates.clone(),
                            punch_timeout,
                            probe_interval,
                            skew_tolerance,
                        );
                        let candidates = addrs
                            .list_publishable()
                            .await
                            .into_iter()
                            .map(|e| e.addr.to_string())
                            .collect();
                        let class = nat_class.read().map(|g| *g).unwrap_or_default();
                        RelayPushReply::Answer {
                            answer: PunchAnswer {
                                candidates,
                                nat_class: class,
                            },
                        }
                    }
                    RelayPush::IncomingCircuit { from, session_id } => {
                        debug!(
                            peer = %from.short(),
                            session = %hex::encode(&session_id[..4]),
                            "incoming circuit"
                        );
                        sock.add_tunnel_route(from, relay_addr, session_id);
                        RelayPushReply::CircuitReady
                    }
                };

                let result = async {
                    let bytes = messages::serialize(&reply)?;
                    write_framed(&mut send, &bytes).await?;
                    send.finish()?;
                    anyhow::Ok(())
                }
                .await;
                if let Err(e) = result {
                    trace!(error = %e, "push reply failed");
                }
            }
        });
    }

    /// Last-resort address lookup against the relay's book.
    pub async fn query_address_book(&self, target: Identity) -> Result<Option<AddressBookEntry>> {
        let conn = self.ensure_connected().await?;
        let response = rpc::request(&conn, &WireRequest {
            sender: self.local_identity,
            body: RequestBody::Relay(RelayRequest::Query { target }),
        })
        .await?;
        match response {
            WireResponse::Relay(RelayResponse::QueryResult { entry }) => Ok(entry),
            WireResponse::Relay(RelayResponse::Error { message })
            | WireResponse::Error { message } => bail!("address book query failed: {message}"),
            other => bail!("unexpected query response: {other:?}"),
        }
    }

    async fn keepalive(&self, session_id: [u8; 16]) -> bool {
        let Ok(conn) = self.ensure_connected().await else {
            return false;
        };
        matches!(
            rpc::request(&conn, &WireRequest {
                sender: self.local_identity,
                body: RequestBody::Relay(RelayRequest::Keepalive { session_id }),
            })
            .await,
            Ok(WireResponse::Relay(RelayResponse::KeepaliveAck))
        )
    }

    async fn drop_signaling(&self) {
        let mut guard = self.signaling.lock().await;
        if let Some(conn) = guard.take() {
            conn.close(0u32.into(), b"reconnecting");
        }
    }

    /// Open a forwarding circuit to `target` and handshake QUIC through it.
    pub async fn open_circuit(self: &Arc<Self>, target: Identity) -> Result<RelayCircuit> {
        let relay_addr = self.relay_addr.context("no relay configured")?;
        let conn = self.ensure_connected().await?;

        let response = rpc::request(&conn, &WireRequest {
            sender: self.local_identity,
            body: RequestBody::Relay(RelayRequest::OpenCircuit { target }),
        })
        .await?;
        let session_id = match response {
            WireResponse::Relay(RelayResponse::CircuitOpen { session_id }) => session_id,
            WireResponse::Relay(RelayResponse::CircuitRejected { reason }) => {
                bail!("circuit rejected: {reason}")
            }
            WireResponse::Relay(RelayResponse::Error { message })
            | WireResponse::Error { message } => bail!("circuit open failed: {message}"),
            other => bail!("unexpected circuit response: {other:?}"),
        };

        let tunnel_addr = self.sock.add_tunnel_route(target, relay_addr, session_id);
        let quic = match self.dial_tunnel(target, tunnel_addr).await {
            Ok(conn) => conn,
            Err(e) => {
                self.sock.remove_tunnel_route(&target);
                return Err(e);
            }
        };

        debug!(
            peer = %target.short(),
            session = %hex::encode(&session_id[..4]),
            "circuit established"
        );
        Ok(RelayCircuit::start(Arc::clone(self), quic, target, session_id))
    }

    async fn dial_tunnel(&self, target: Identity, tunnel_addr: SocketAddr) -> Result<Connection> {
        let connecting = self
            .endpoint
            .connect_with(
                self.pinned_config.clone(),
                tunnel_addr,
                &identity_to_sni(&target),
            )
            .context("failed to start tunneled connection")?;
        let quic = tokio::time::timeout(self.signaling_timeout, connecting)
            .await
            .map_err(|_| anyhow::anyhow!("tunneled handshake timed out"))?
            .context("tunneled handshake failed")?;

        match extract_verified_identity(&quic) {
            Some(actual) if actual == target => Ok(quic),
            actual => {
                quic.close(0u32.into(), b"identity mismatch");
                Err(IdentityMismatch {
                    expected: target,
                    actual,
                }
                .into())
            }
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("relay_addr", &self.relay_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SignalingChannel for RelayClient {
    async fn exchange_candidates(
        &self,
        target: Identity,
        offer: PunchOffer,
    ) -> Result<PunchAnswer> {
        let conn = self.ensure_connected().await?;
        let response = rpc::request(&conn, &WireRequest {
            sender: self.local_identity,
            body: RequestBody::Relay(RelayRequest::ConnectRequest { target, offer }),
        })
        .await?;
        match response {
            WireResponse::Relay(RelayResponse::ConnectAnswer { answer }) => Ok(answer),
            WireResponse::Relay(RelayResponse::ConnectRejected { reason }) => {
                bail!("exchange rejected: {reason}")
            }
            WireResponse::Relay(RelayResponse::Error { message })
            | WireResponse::Error { message } => bail!("exchange failed: {message}"),
            other => bail!("unexpected exchange response: {other:?}"),
        }
    }
}

// ============================================================================
// RelayCircuit
// ============================================================================

/// One live circuit: a QUIC connection tunneled through a relay session,
/// kept healthy by keepalives over the signaling connection. Streams on
/// the connection are independent; this type only tracks the circuit.
pub struct RelayCircuit {
    conn: Connection,
    peer: Identity,
    session_id: [u8; 16],
    state: Arc<StdMutex<CircuitState>>,
    heartbeat: tokio::task::JoinHandle<()>,
    client: Arc<RelayClient>,
}

impl RelayCircuit {
    fn start(
        client: Arc<RelayClient>,
        conn: Connection,
        peer: Identity,
        session_id: [u8; 16],
    ) -> Self {
        let state = Arc::new(StdMutex::new(circuit_transition(
            CircuitState::Creating,
            CircuitEvent::Established,
        )));

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&client),
            conn.clone(),
            peer,
            session_id,
            Arc::clone(&state),
        ));

        Self {
            conn,
            peer,
            session_id,
            state,
            heartbeat,
            client,
        }
    }

    async fn heartbeat_loop(
        client: Arc<RelayClient>,
        conn: Connection,
        peer: Identity,
        session_id: [u8; 16],
        state: Arc<StdMutex<CircuitState>>,
    ) {
        let mut misses = 0u32;
        let mut interval = tokio::time::interval(client.heartbeat_interval);
        interval.tick().await;

        loop {
            interval.tick().await;

            if conn.close_reason().is_some() {
                apply(&state, CircuitEvent::TransportFailed);
                break;
            }

            if client.keepalive(session_id).await {
                misses = 0;
                apply(&state, CircuitEvent::HeartbeatOk);
                continue;
            }

            misses += 1;
            let exhausted = misses >= client.heartbeat_misses;
            apply(&state, CircuitEvent::HeartbeatMissed { exhausted });
            if !exhausted {
                continue;
            }

            // One silent reconnect of the signaling connection. The data
            // path may still be fine; only a failed re-register kills the
            // circuit.
            debug!(peer = %peer.short(), "circuit stale, reconnecting signaling");
            client.drop_signaling().await;
            if client.keepalive(session_id).await {
                misses = 0;
                apply(&state, CircuitEvent::Reconnected);
                continue;
            }

            apply(&state, CircuitEvent::ReconnectFailed);
            warn!(peer = %peer.short(), "circuit lost");
            conn.close(0u32.into(), b"circuit lost");
            client.sock.remove_tunnel_route(&peer);
            break;
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn remote_identity(&self) -> Identity {
        self.peer
    }

    pub fn session_id(&self) -> [u8; 16] {
        self.session_id
    }

    pub fn state(&self) -> CircuitState {
        self.state
            .lock()
            .map(|g| *g)
            .unwrap_or(CircuitState::Closed)
    }

    /// Tear the circuit down. Idempotent.
    pub fn close(&self) {
        apply(&self.state, CircuitEvent::CloseRequested);
        self.heartbeat.abort();
        self.conn.close(0u32.into(), b"circuit closed");
        self.client.sock.remove_tunnel_route(&self.peer);
    }
}

impl Drop for RelayCircuit {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RelayCircuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCircuit")
            .field("peer", &self.peer.short())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn apply(state: &Arc<StdMutex<CircuitState>>, event: CircuitEvent) {
    if let Ok(mut guard) = state.lock() {
        *guard = circuit_transition(*guard, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn frame_roundtrip() {
        let tunnel = RelayTunnel::new([3u8; 16]);
        let frame = tunnel.encode_frame(b"quic bytes");
        assert_eq!(frame.len(), RELAY_HEADER_SIZE + 10);
        let (session, payload) = RelayTunnel::decode_frame(&frame).unwrap();
        assert_eq!(session, [3u8; 16]);
        assert_eq!(payload, b"quic bytes");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(RelayTunnel::decode_frame(b"short").is_none());
        let mut frame = RelayTunnel::new([1u8; 16]).encode_frame(b"x");
        frame[0] = b'X';
        assert!(RelayTunnel::decode_frame(&frame).is_none());
        // Header-only frame carries an empty payload, which is valid.
        let empty = RelayTunnel::new([2u8; 16]).encode_frame(b"");
        let (_, payload) = RelayTunnel::decode_frame(&empty).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn session_ids_are_random() {
        let a = generate_session_id().unwrap();
        let b = generate_session_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn circuit_lifecycle_transitions() {
        use CircuitEvent::*;
        use CircuitState::*;

        assert_eq!(circuit_transition(Creating, Established), Active);
        assert_eq!(circuit_transition(Active, HeartbeatOk), Active);
        assert_eq!(
            circuit_transition(Active, HeartbeatMissed { exhausted: false }),
            Active
        );
        assert_eq!(
            circuit_transition(Active, HeartbeatMissed { exhausted: true }),
            Stale
        );
        assert_eq!(circuit_transition(Stale, Reconnected), Active);
        assert_eq!(circuit_transition(Stale, HeartbeatOk), Active);
        assert_eq!(circuit_transition(Stale, ReconnectFailed), Closed);
    }

    #[test]
    fn circuit_closed_is_terminal() {
        use CircuitEvent::*;
        use CircuitState::*;

        for event in [
            Established,
            HeartbeatOk,
            HeartbeatMissed { exhausted: true },
            Reconnected,
            ReconnectFailed,
            CloseRequested,
            TransportFailed,
        ] {
            assert_eq!(circuit_transition(Closed, event), Closed);
        }
        assert_eq!(circuit_transition(Active, TransportFailed), Closed);
        assert_eq!(circuit_transition(Creating, CloseRequested), Closed);
    }

    #[test]
    fn circuit_nonsense_events_ignored() {
        use CircuitEvent::*;
        use CircuitState::*;

        assert_eq!(circuit_transition(Creating, HeartbeatOk), Creating);
        assert_eq!(circuit_transition(Active, Established), Active);
        assert_eq!(circuit_transition(Stale, Established), Stale);
    }

    #[test]
    fn session_forwarding_destinations() {
        let a = Identity::from_bytes([1u8; 32]);
        let b = Identity::from_bytes([2u8; 32]);
        let session = RelaySession::new((a, addr(1000)), (b, addr(2000)));

        assert_eq!(session.destination(addr(1000)), Some(addr(2000)));
        assert_eq!(session.destination(addr(2000)), Some(addr(1000)));
        assert_eq!(session.destination(addr(3000)), None);
        assert!(!session.is_expired());
    }

    #[test]
    fn session_activity_accounting() {
        let a = Identity::from_bytes([1u8; 32]);
        let b = Identity::from_bytes([2u8; 32]);
        let mut session = RelaySession::new((a, addr(1000)), (b, addr(2000)));

        session.record_activity(100);
        session.record_activity(50);
        assert_eq!(session.bytes_relayed, 150);
        assert_eq!(session.packets_relayed, 2);
    }
}
