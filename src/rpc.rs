//! # QUIC Request/Response Plumbing
//!
//! Length-prefixed bincode messages over short-lived bidirectional
//! streams. Outbound dials pin the expected peer identity in the TLS SNI;
//! inbound streams are gated on the TLS-verified identity before any
//! handler runs, and a claimed envelope sender that disagrees with the
//! verified identity kills the stream.
//!
//! [`RpcNode`] caches one healthy connection per peer behind an actor so
//! concurrent callers share dials instead of racing them.

use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, bail};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{Connection, Endpoint};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::crypto::{extract_verified_identity, identity_to_sni};
use crate::directory::DirectoryStore;
use crate::identity::{Identity, PeerRecord};
use crate::messages::{
    self, DirectoryRequest, DirectoryResponse, PeerRequest, PeerResponse, RequestBody, WireRequest,
    WireResponse,
};
use crate::relay::RelayServer;

/// Maximum request/response payload.
/// SECURITY: Bounds per-stream allocation.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// Maximum application stream tag length.
const MAX_TAG_SIZE: usize = 256;

/// First byte of every stream opened toward an accepting endpoint:
/// request/response exchange, or a long-lived application stream.
pub(crate) const STREAM_KIND_RPC: u8 = 0;
pub(crate) const STREAM_KIND_APP: u8 = 1;

/// Deadline for reading a request header/body off an accepted stream.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for one full request/response exchange.
pub const RPC_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a dial-back probe connection attempt.
const DIALBACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Cached outbound connections.
const MAX_CACHED_CONNECTIONS: usize = 1000;

// ============================================================================
// Errors
// ============================================================================

/// The handshake produced a peer other than the one dialed. Carried inside
/// anyhow chains and surfaced by downcast where the distinction matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMismatch {
    pub expected: Identity,
    pub actual: Option<Identity>,
}

impl fmt::Display for IdentityMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.actual {
            Some(actual) => write!(
                f,
                "expected peer {} but handshake produced {}",
                self.expected.short(),
                actual.short()
            ),
            None => write!(
                f,
                "expected peer {} but handshake carried no identity",
                self.expected.short()
            ),
        }
    }
}

impl std::error::Error for IdentityMismatch {}

// ============================================================================
// Framing
// ============================================================================

pub(crate) async fn write_framed(send: &mut quinn::SendStream, data: &[u8]) -> Result<()> {
    let len = data.len() as u32;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(data).await?;
    Ok(())
}

pub(crate) async fn read_framed(recv: &mut quinn::RecvStream, max: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        bail!("frame too large: {} bytes (max {})", len, max);
    }
    let mut data = vec![0u8; len];
    recv.read_exact(&mut data).await?;
    Ok(data)
}

/// One request/response exchange on a fresh stream of `conn`.
pub async fn request(conn: &Connection, request: &WireRequest) -> Result<WireResponse> {
    tokio::time::timeout(RPC_STREAM_TIMEOUT, async {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .context("failed to open bidirectional stream")?;

        let request_bytes = messages::serialize(request).context("failed to serialize request")?;
        send.write_all(&[STREAM_KIND_RPC]).await?;
        write_framed(&mut send, &request_bytes).await?;
        send.finish()?;

        let response_bytes = read_framed(&mut recv, MAX_RESPONSE_SIZE).await?;
        let response: WireResponse = messages::deserialize_bounded(&response_bytes)
            .context("failed to deserialize response")?;
        Ok(response)
    })
    .await
    .map_err(|_| anyhow::anyhow!("rpc exchange timed out"))?
}

// ============================================================================
// Outbound Dialing
// ============================================================================

/// Dial `addr` expecting exactly `expected` on the far end. The SNI pins
/// the identity so the TLS verifier rejects an impostor during the
/// handshake; the post-handshake check is belt and suspenders against
/// verifier misconfiguration.
pub async fn connect_verified(
    endpoint: &Endpoint,
    config: quinn::ClientConfig,
    addr: SocketAddr,
    expected: Identity,
) -> Result<Connection> {
    let connecting = endpoint
        .connect_with(config, addr, &identity_to_sni(&expected))
        .context("failed to start connection")?;
    let conn = connecting.await.context("handshake failed")?;

    match extract_verified_identity(&conn) {
        Some(actual) if actual == expected => Ok(conn),
        actual => {
            conn.close(0u32.into(), b"identity mismatch");
            Err(IdentityMismatch { expected, actual }.into())
        }
    }
}

// ============================================================================
// Connection Cache Actor
// ============================================================================

struct CachedConnection {
    conn: Connection,
}

impl CachedConnection {
    fn is_healthy(&self) -> bool {
        self.conn.close_reason().is_none()
    }
}

enum Command {
    GetOrConnect {
        addr: SocketAddr,
        expected: Identity,
        reply: oneshot::Sender<Result<Connection>>,
    },
    Invalidate {
        peer: Identity,
    },
    Quit,
}

/// Handle to the outbound connection cache.
#[derive(Clone)]
pub struct RpcNode {
    tx: mpsc::Sender<Command>,
}

impl RpcNode {
    pub fn new(endpoint: Endpoint, client_config: quinn::ClientConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = CacheActor {
            endpoint,
            client_config,
            cache: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN),
            ),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// A healthy cached connection to `expected`, or a fresh verified dial.
    pub async fn get_or_connect(&self, addr: SocketAddr, expected: Identity) -> Result<Connection> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetOrConnect {
                addr,
                expected,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("rpc actor stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("rpc actor dropped reply"))?
    }

    /// Drop a cached connection after an exchange over it failed.
    pub async fn invalidate(&self, peer: Identity) {
        let _ = self.tx.send(Command::Invalidate { peer }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Quit).await;
    }
}

impl fmt::Debug for RpcNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcNode").finish_non_exhaustive()
    }
}

struct CacheActor {
    endpoint: Endpoint,
    client_config: quinn::ClientConfig,
    cache: LruCache<Identity, CachedConnection>,
}

impl CacheActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::GetOrConnect {
                    addr,
                    expected,
                    reply,
                } => {
                    if let Some(cached) = self.cache.get(&expected)
                        && cached.is_healthy()
                    {
                        let _ = reply.send(Ok(cached.conn.clone()));
                        continue;
                    }
                    self.cache.pop(&expected);

                    let result = tokio::time::timeout(
                        RPC_STREAM_TIMEOUT,
                        connect_verified(
                            &self.endpoint,
                            self.client_config.clone(),
                            addr,
                            expected,
                        ),
                    )
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("dial timed out")));

                    if let Ok(conn) = &result {
                        self.cache.put(expected, CachedConnection { conn: conn.clone() });
                    }
                    let _ = reply.send(result);
                }
                Command::Invalidate { peer } => {
                    if let Some(cached) = self.cache.pop(&peer) {
                        trace!(peer = %peer.short(), "cached connection invalidated");
                        cached.conn.close(0u32.into(), b"invalidated");
                    }
                }
                Command::Quit => break,
            }
        }
        debug!("rpc cache actor stopped");
    }
}

// ============================================================================
// Inbound Dispatch
// ============================================================================

/// A tagged application stream opened by a connected peer.
pub struct IncomingStream {
    pub peer: Identity,
    pub tag: String,
    pub send: quinn::SendStream,
    pub recv: quinn::RecvStream,
}

/// Everything the accept loop needs to answer requests.
pub struct RpcHandlers {
    pub local_identity: Identity,
    pub endpoint: Endpoint,
    pub client_config: quinn::ClientConfig,
    pub directory_store: Option<Arc<dyn DirectoryStore>>,
    pub relay_server: Option<RelayServer>,
    /// Receives every record observed in incoming directory puts, feeding
    /// the realm cache.
    pub record_tx: Option<mpsc::Sender<PeerRecord>>,
    /// Receives tagged application streams opened by peers.
    pub app_tx: mpsc::Sender<IncomingStream>,
}

/// Accept connections until the endpoint closes. Every connection is
/// identity-gated; every stream gets its own task.
pub fn spawn_accept_loop(handlers: Arc<RpcHandlers>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(incoming) = handlers.endpoint.accept().await {
            let handlers = Arc::clone(&handlers);
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        trace!(error = %e, "inbound handshake failed");
                        return;
                    }
                };
                handle_connection(conn, handlers).await;
            });
        }
        debug!("accept loop stopped");
    })
}

async fn handle_connection(conn: Connection, handlers: Arc<RpcHandlers>) {
    let remote = conn.remote_address();
    let verified_identity = match extract_verified_identity(&conn) {
        Some(id) => id,
        None => {
            warn!(remote = %remote, "connection without verifiable identity, closing");
            conn.close(0u32.into(), b"unverifiable identity");
            return;
        }
    };
    debug!(peer = %verified_identity.short(), remote = %remote, "peer connected");

    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                debug!(peer = %verified_identity.short(), "connection closed by application");
                break;
            }
            Err(e) => {
                trace!(peer = %verified_identity.short(), error = %e, "connection ended");
                break;
            }
        };

        let conn = conn.clone();
        let handlers = Arc::clone(&handlers);
        tokio::spawn(async move {
            if let Err(e) =
                handle_stream(send, recv, conn, verified_identity, handlers).await
            {
                trace!(peer = %verified_identity.short(), error = %e, "stream handler failed");
            }
        });
    }
}

async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    conn: Connection,
    verified_identity: Identity,
    handlers: Arc<RpcHandlers>,
) -> Result<()> {
    let mut kind = [0u8; 1];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut kind))
        .await
        .map_err(|_| anyhow::anyhow!("stream header read timed out"))??;

    if kind[0] == STREAM_KIND_APP {
        let tag_bytes =
            tokio::time::timeout(REQUEST_READ_TIMEOUT, read_framed(&mut recv, MAX_TAG_SIZE))
                .await
                .map_err(|_| anyhow::anyhow!("tag read timed out"))??;
        let tag = String::from_utf8(tag_bytes).context("stream tag is not UTF-8")?;
        trace!(peer = %verified_identity.short(), tag = %tag, "application stream opened");
        handlers
            .app_tx
            .send(IncomingStream {
                peer: verified_identity,
                tag,
                send,
                recv,
            })
            .await
            .map_err(|_| anyhow::anyhow!("application stream receiver dropped"))?;
        return Ok(());
    }
    if kind[0] != STREAM_KIND_RPC {
        bail!("unknown stream kind {}", kind[0]);
    }

    let request_bytes =
        tokio::time::timeout(REQUEST_READ_TIMEOUT, read_framed(&mut recv, MAX_REQUEST_SIZE))
            .await
            .map_err(|_| anyhow::anyhow!("request read timed out"))??;

    let request: WireRequest = messages::deserialize_bounded(&request_bytes)
        .context("failed to deserialize request")?;

    // SECURITY: The envelope's claimed sender must match the identity the
    // TLS handshake proved, or the request is a spoof attempt.
    if request.sender != verified_identity {
        warn!(
            claimed = %request.sender.short(),
            verified = %verified_identity.short(),
            "claimed sender does not match verified identity"
        );
        bail!("sender identity spoof");
    }

    let response = dispatch(request.body, &conn, verified_identity, &handlers).await;

    let response_bytes = messages::serialize(&response)?;
    write_framed(&mut send, &response_bytes).await?;
    send.finish()?;
    Ok(())
}

async fn dispatch(
    body: RequestBody,
    conn: &Connection,
    sender: Identity,
    handlers: &RpcHandlers,
) -> WireResponse {
    match body {
        RequestBody::Directory(req) => match &handlers.directory_store {
            Some(store) => WireResponse::Directory(handle_directory(req, store, handlers).await),
            None => WireResponse::Error {
                message: "directory service not enabled".to_string(),
            },
        },
        RequestBody::Relay(req) => match &handlers.relay_server {
            Some(server) => {
                WireResponse::Relay(server.handle_request(req, sender, conn.clone()).await)
            }
            None => WireResponse::Error {
                message: "relay service not enabled".to_string(),
            },
        },
        RequestBody::Peer(req) => WireResponse::Peer(handle_peer(req, conn, sender, handlers).await),
    }
}

async fn handle_directory(
    req: DirectoryRequest,
    store: &Arc<dyn DirectoryStore>,
    handlers: &RpcHandlers,
) -> DirectoryResponse {
    match req {
        DirectoryRequest::Put { key, record } => match store.put(key, record.clone()).await {
            Ok(()) => {
                if let Some(tx) = &handlers.record_tx {
                    let _ = tx.try_send(record);
                }
                DirectoryResponse::PutOk
            }
            Err(e) => DirectoryResponse::PutRejected {
                reason: e.to_string(),
            },
        },
        DirectoryRequest::Get { key } => match store.get(key).await {
            Ok(Some(record)) => DirectoryResponse::Found { record },
            Ok(None) => DirectoryResponse::NotFound,
            Err(e) => DirectoryResponse::Error {
                message: e.to_string(),
            },
        },
    }
}

async fn handle_peer(
    req: PeerRequest,
    conn: &Connection,
    sender: Identity,
    handlers: &RpcHandlers,
) -> PeerResponse {
    match req {
        PeerRequest::ObservedAddr => PeerResponse::ObservedAddr {
            addr: conn.remote_address().to_string(),
        },
        PeerRequest::CheckReachability { probe_addr } => {
            let parsed: SocketAddr = match probe_addr.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    return PeerResponse::Error {
                        message: "invalid probe address".to_string(),
                    };
                }
            };

            // SECURITY: Only dial back to the IP this connection actually
            // came from, so a peer cannot use us to probe third parties.
            if parsed.ip() != conn.remote_address().ip() {
                warn!(
                    peer = %sender.short(),
                    probe = %parsed,
                    source = %conn.remote_address(),
                    "dial-back target does not match connection source"
                );
                return PeerResponse::Error {
                    message: "probe address must match connection source".to_string(),
                };
            }

            let reachable = matches!(
                tokio::time::timeout(
                    DIALBACK_TIMEOUT,
                    connect_verified(
                        &handlers.endpoint,
                        handlers.client_config.clone(),
                        parsed,
                        sender,
                    ),
                )
                .await,
                Ok(Ok(_))
            );
            debug!(peer = %sender.short(), probe = %parsed, reachable = reachable, "dial-back probe");
            PeerResponse::Reachable { reachable }
        }
        PeerRequest::Ping => PeerResponse::Pong,
    }
}

// ============================================================================
// Remote Directory Store
// ============================================================================

/// [`DirectoryStore`] backed by directory-serving peers reached over RPC.
/// Put goes to every configured peer; Get returns the first hit.
pub struct RemoteDirectory {
    rpc: RpcNode,
    local_identity: Identity,
    peers: Vec<(Identity, SocketAddr)>,
}

impl RemoteDirectory {
    pub fn new(rpc: RpcNode, local_identity: Identity, peers: Vec<(Identity, SocketAddr)>) -> Self {
        Self {
            rpc,
            local_identity,
            peers,
        }
    }

    async fn exchange(
        &self,
        peer: Identity,
        addr: SocketAddr,
        req: DirectoryRequest,
    ) -> Result<DirectoryResponse> {
        let conn = self.rpc.get_or_connect(addr, peer).await?;
        let response = request(
            &conn,
            &WireRequest {
                sender: self.local_identity,
                body: RequestBody::Directory(req),
            },
        )
        .await;
        if response.is_err() {
            self.rpc.invalidate(peer).await;
        }
        match response? {
            WireResponse::Directory(resp) => Ok(resp),
            WireResponse::Error { message } => bail!("directory peer error: {message}"),
            _ => bail!("unexpected response type"),
        }
    }
}

#[async_trait]
impl DirectoryStore for RemoteDirectory {
    async fn put(&self, key: [u8; 32], record: PeerRecord) -> Result<()> {
        if self.peers.is_empty() {
            bail!("no directory peers configured");
        }
        let mut last_err = None;
        let mut accepted = 0usize;
        for (peer, addr) in &self.peers {
            match self
                .exchange(*peer, *addr, DirectoryRequest::Put {
                    key,
                    record: record.clone(),
                })
                .await
            {
                Ok(DirectoryResponse::PutOk) => accepted += 1,
                Ok(DirectoryResponse::PutRejected { reason }) => {
                    last_err = Some(anyhow::anyhow!("rejected: {reason}"));
                }
                Ok(other) => {
                    last_err = Some(anyhow::anyhow!("unexpected put response: {other:?}"));
                }
                Err(e) => last_err = Some(e),
            }
        }
        if accepted == 0 {
            Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no directory peer accepted the put")))
        } else {
            Ok(())
        }
    }

    async fn get(&self, key: [u8; 32]) -> Result<Option<PeerRecord>> {
        let mut last_err = None;
        let mut answered = 0usize;
        for (peer, addr) in &self.peers {
            match self.exchange(*peer, *addr, DirectoryRequest::Get { key }).await {
                Ok(DirectoryResponse::Found { record }) => return Ok(Some(record)),
                Ok(DirectoryResponse::NotFound) => answered += 1,
                Ok(other) => {
                    last_err = Some(anyhow::anyhow!("unexpected get response: {other:?}"));
                }
                Err(e) => last_err = Some(e),
            }
        }
        // An authoritative not-found from any peer outranks transport
        // errors from the rest.
        match last_err {
            Some(e) if answered == 0 => Err(e),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mismatch_display() {
        let err = IdentityMismatch {
            expected: Identity::from_bytes([1u8; 32]),
            actual: Some(Identity::from_bytes([2u8; 32])),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected peer"));

        let err = IdentityMismatch {
            expected: Identity::from_bytes([1u8; 32]),
            actual: None,
        };
        assert!(err.to_string().contains("no identity"));
    }
}
