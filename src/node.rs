//! # Node Facade
//!
//! Wires the socket, lifecycle store, verifier, directory client, NAT
//! coordinator, relay client, and priority engine into one handle. The
//! public surface is small: start, announce, connect, accept streams,
//! shut down.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};

use anyhow::{Context as AnyhowContext, Result};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, trace, warn};

use crate::addrstore::{AddrSource, AddrStore};
use crate::cache::CacheLayer;
use crate::config::Config;
use crate::connect::{ConnectEngine, ConnectError, Established};
use crate::crypto::{
    create_client_config, create_client_config_unpinned, create_server_config,
    generate_ed25519_cert,
};
use crate::directory::{DirectoryClient, DirectoryStore, MemoryDirectory};
use crate::identity::{Identity, Keypair};
use crate::messages::{PeerRequest, PeerResponse, RequestBody, WireRequest, WireResponse};
use crate::nat::{NatClass, NatCoordinator, classify_from_observations};
use crate::relay::{RelayClient, RelayServer};
use crate::rpc::{self, IncomingStream, RemoteDirectory, RpcHandlers, RpcNode};
use crate::socket::RoutedSock;
use crate::verifier::Verifier;

const APP_STREAM_CAPACITY: usize = 64;
const RECORD_CHANNEL_CAPACITY: usize = 64;

/// One established, identity-verified connection to a peer.
pub struct Connection {
    established: Established,
    peer: Identity,
    local: Identity,
}

impl Connection {
    pub fn remote_identity(&self) -> Identity {
        self.peer
    }

    /// Which phase produced this connection: "direct", "punched", or
    /// "relayed".
    pub fn path(&self) -> &'static str {
        self.established.path_name()
    }

    /// Open a tagged bidirectional stream. Streams are independent; the
    /// peer receives them through [`Node::accept_stream`].
    pub async fn open_stream(
        &self,
        tag: &str,
    ) -> Result<(quinn::SendStream, quinn::RecvStream)> {
        let (mut send, recv) = self
            .established
            .connection()
            .open_bi()
            .await
            .context("failed to open stream")?;
        send.write_all(&[rpc::STREAM_KIND_APP]).await?;
        rpc::write_framed(&mut send, tag.as_bytes()).await?;
        Ok((send, recv))
    }

    /// Round-trip liveness check over the connection.
    pub async fn ping(&self) -> Result<()> {
        let response = rpc::request(self.established.connection(), &WireRequest {
            sender: self.local,
            body: RequestBody::Peer(PeerRequest::Ping),
        })
        .await?;
        match response {
            WireResponse::Peer(PeerResponse::Pong) => Ok(()),
            other => anyhow::bail!("unexpected ping response: {other:?}"),
        }
    }

    pub fn close(&self) {
        match &self.established {
            Established::Relayed(circuit) => circuit.close(),
            Established::Direct(conn) | Established::Punched(conn) => {
                conn.close(0u32.into(), b"done");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer.short())
            .field("path", &self.path())
            .finish()
    }
}

/// A running node.
pub struct Node {
    keypair: Arc<Keypair>,
    identity: Identity,
    sock: Arc<RoutedSock>,
    endpoint: quinn::Endpoint,
    addrs: AddrStore,
    verifier: Verifier,
    directory: Arc<DirectoryClient>,
    relay_client: Arc<RelayClient>,
    relay_server: Option<RelayServer>,
    rpc: RpcNode,
    engine: ConnectEngine,
    nat_class: Arc<StdRwLock<NatClass>>,
    network_change_tx: mpsc::Sender<()>,
    app_rx: Mutex<mpsc::Receiver<IncomingStream>>,
}

impl Node {
    pub async fn start(keypair: Keypair, config: Config) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        let keypair = Arc::new(keypair);
        let identity = keypair.identity();
        info!(identity = %identity.short(), addr = %config.listen_addr, "starting node");

        let (certs, key) = generate_ed25519_cert(keypair.as_ref())?;
        let server_config = create_server_config(certs.clone(), key.clone_key())?;
        let pinned = create_client_config(certs.clone(), key.clone_key())?;
        let unpinned = create_client_config_unpinned(certs, key)?;

        let (endpoint, sock) =
            RoutedSock::bind_endpoint(config.listen_addr, server_config).await?;
        let local_addr = sock.local_addr();

        let punch_rx = sock
            .take_punch_rx()
            .context("punch stream already taken")?;
        let coordinator = NatCoordinator::start(Arc::clone(&sock), identity, punch_rx);

        let addrs = AddrStore::new(config.addr_ttl, config.addr_tick, config.max_verify_failures);
        for addr in &config.operator_addrs {
            addrs.add_operator(*addr).await;
        }
        for addr in enumerate_local_addrs(local_addr.port()) {
            addrs.add_candidate(addr, AddrSource::SelfObserved).await;
        }

        let verifier = Verifier::new(addrs.clone(), config.corroboration_count);
        let nat_class = Arc::new(StdRwLock::new(
            config.nat_class_override.unwrap_or_default(),
        ));

        let relay_server = config.serve_relay.then(|| {
            let server = RelayServer::start(Arc::clone(sock.inner_socket()));
            sock.install_relay_server(server.clone());
            server
        });

        let rpc = RpcNode::new(endpoint.clone(), pinned.clone());

        let relay_client = RelayClient::new(
            endpoint.clone(),
            Arc::clone(&sock),
            unpinned,
            pinned.clone(),
            identity,
            Arc::clone(&coordinator),
            addrs.clone(),
            verifier.clone(),
            Arc::clone(&nat_class),
            &config,
        );

        let local_store = Arc::new(MemoryDirectory::new());
        let store: Arc<dyn DirectoryStore> = if config.directory_peers.is_empty() {
            Arc::clone(&local_store) as Arc<dyn DirectoryStore>
        } else {
            Arc::new(RemoteDirectory::new(
                rpc.clone(),
                identity,
                config.directory_peers.clone(),
            ))
        };

        let directory = DirectoryClient::new(
            Arc::clone(&keypair),
            store,
            addrs.clone(),
            relay_client.advertised_relay_addrs(),
            Arc::clone(&nat_class),
            &config,
        );

        let (network_change_tx, network_change_rx) = mpsc::channel(4);
        directory.spawn_republish_task(network_change_rx);

        let cache = Arc::new(CacheLayer::new(config.record_max_age));
        let engine = ConnectEngine::new(
            endpoint.clone(),
            pinned.clone(),
            identity,
            addrs.clone(),
            Arc::clone(&cache),
            Arc::clone(&directory),
            Arc::clone(&relay_client),
            Arc::clone(&coordinator),
            Arc::clone(&nat_class),
            &config,
        );

        let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
        let (app_tx, app_rx) = mpsc::channel(APP_STREAM_CAPACITY);
        rpc::spawn_accept_loop(Arc::new(RpcHandlers {
            local_identity: identity,
            endpoint: endpoint.clone(),
            client_config: pinned,
            directory_store: config
                .serve_directory
                .then(|| Arc::clone(&local_store) as Arc<dyn DirectoryStore>),
            relay_server: relay_server.clone(),
            record_tx: Some(record_tx),
            app_tx,
        }));

        let node = Arc::new(Self {
            keypair,
            identity,
            sock,
            endpoint,
            addrs,
            verifier,
            directory,
            relay_client,
            relay_server,
            rpc,
            engine,
            nat_class,
            network_change_tx,
            app_rx: Mutex::new(app_rx),
        });

        node.spawn_record_feed(record_rx, cache);
        node.spawn_registration_refresh();
        Ok(node)
    }

    /// Records learned through incoming directory puts also feed the realm
    /// cache and seq tracking.
    fn spawn_record_feed(
        self: &Arc<Self>,
        mut record_rx: mpsc::Receiver<crate::identity::PeerRecord>,
        cache: Arc<CacheLayer>,
    ) {
        let directory = Arc::clone(&self.directory);
        tokio::spawn(async move {
            while let Some(record) = record_rx.recv().await {
                cache.apply_record(&record);
                directory.observe_record(record).await;
            }
        });
    }

    /// Keep the relay's address book entry in step with the publishable
    /// set.
    fn spawn_registration_refresh(self: &Arc<Self>) {
        if !self.relay_client.is_configured() {
            return;
        }
        let relay_client = Arc::clone(&self.relay_client);
        let mut events = self.addrs.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.affects_publishable_set() => {
                        relay_client.refresh_registration().await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        relay_client.refresh_registration().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }

    pub fn nat_class(&self) -> NatClass {
        self.nat_class.read().map(|g| *g).unwrap_or_default()
    }

    pub fn addrs(&self) -> &AddrStore {
        &self.addrs
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn directory(&self) -> &Arc<DirectoryClient> {
        &self.directory
    }

    /// Register with the configured relay now. Without this the relay
    /// connection stays lazy and inbound signaling cannot reach us.
    pub async fn connect_relay(&self) -> Result<()> {
        self.relay_client.connect_now().await
    }

    /// Publish our verified addresses to the directory.
    pub async fn announce(&self) -> Result<(), ConnectError> {
        self.directory
            .announce()
            .await
            .map_err(|e| ConnectError::PublishRejected {
                reason: e.to_string(),
            })
    }

    /// Establish a connection to `target`, racing direct dials and falling
    /// back to punching and relaying.
    pub async fn connect(&self, target: Identity) -> Result<Connection, ConnectError> {
        let established = self.engine.connect(target).await?;
        info!(
            peer = %target.short(),
            path = established.path_name(),
            "connected"
        );

        // Ask the peer what address it sees us as; agreement across peers
        // promotes the mapping without an active probe.
        if let Established::Direct(conn) | Established::Punched(conn) = &established {
            self.spawn_observed_addr_probe(conn.clone(), target);
        }

        Ok(Connection {
            established,
            peer: target,
            local: self.identity,
        })
    }

    fn spawn_observed_addr_probe(&self, conn: quinn::Connection, peer: Identity) {
        let verifier = self.verifier.clone();
        let identity = self.identity;
        tokio::spawn(async move {
            let response = rpc::request(&conn, &WireRequest {
                sender: identity,
                body: RequestBody::Peer(PeerRequest::ObservedAddr),
            })
            .await;
            match response {
                Ok(WireResponse::Peer(PeerResponse::ObservedAddr { addr })) => {
                    if let Ok(observed) = addr.parse::<SocketAddr>() {
                        trace!(peer = %peer.short(), addr = %observed, "observed address learned");
                        verifier.report_peer_observation(observed, peer).await;
                    }
                }
                Ok(_) => {}
                Err(e) => trace!(peer = %peer.short(), error = %e, "observed-addr probe failed"),
            }
        });
    }

    /// The next tagged stream a peer opened toward us.
    pub async fn accept_stream(&self) -> Option<IncomingStream> {
        self.app_rx.lock().await.recv().await
    }

    /// Ask `helper` to dial us back at `probe_addr`. The result feeds the
    /// lifecycle store either way.
    pub async fn request_dialback(
        &self,
        helper: Identity,
        helper_addr: SocketAddr,
        probe_addr: SocketAddr,
    ) -> Result<bool> {
        let conn = self.rpc.get_or_connect(helper_addr, helper).await?;
        let response = rpc::request(&conn, &WireRequest {
            sender: self.identity,
            body: RequestBody::Peer(PeerRequest::CheckReachability {
                probe_addr: probe_addr.to_string(),
            }),
        })
        .await?;
        match response {
            WireResponse::Peer(PeerResponse::Reachable { reachable }) => {
                self.verifier.report_dialback(probe_addr, reachable).await;
                Ok(reachable)
            }
            WireResponse::Peer(PeerResponse::Error { message })
            | WireResponse::Error { message } => anyhow::bail!("dial-back failed: {message}"),
            other => anyhow::bail!("unexpected dial-back response: {other:?}"),
        }
    }

    /// Re-derive our NAT class from the externally observed addresses
    /// collected so far. No-op under an operator override.
    pub async fn reclassify_nat(&self) -> NatClass {
        let observed: Vec<SocketAddr> = self
            .addrs
            .list_publishable()
            .await
            .into_iter()
            .filter(|e| e.source != AddrSource::SelfObserved)
            .map(|e| e.addr)
            .collect();
        let class = classify_from_observations(self.local_addr(), &observed);
        if let Ok(mut guard) = self.nat_class.write() {
            *guard = class;
        }
        debug!(class = %class, "NAT classification updated");
        class
    }

    /// Signal an interface/network change: triggers an immediate
    /// republish.
    pub async fn notify_network_change(&self) {
        let _ = self.network_change_tx.send(()).await;
    }

    /// Orderly teardown, reverse of startup order.
    pub async fn shutdown(&self) {
        debug!(identity = %self.identity.short(), "shutting down");
        self.rpc.shutdown().await;
        if let Some(server) = &self.relay_server {
            server.quit().await;
        }
        self.verifier.shutdown().await;
        self.addrs.shutdown().await;
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity.short())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Local interface discovery via the UDP-connect trick: no packets are
/// sent, the OS just picks the outbound interface.
fn enumerate_local_addrs(port: u16) -> Vec<SocketAddr> {
    let mut found = Vec::new();
    if let Ok(probe) = std::net::UdpSocket::bind("0.0.0.0:0")
        && probe.connect("8.8.8.8:80").is_ok()
        && let Ok(local) = probe.local_addr()
    {
        found.push(SocketAddr::new(local.ip(), port));
    }
    if found.is_empty() {
        warn!("no routable local interface found");
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_enumeration_uses_listen_port() {
        for addr in enumerate_local_addrs(4567) {
            assert_eq!(addr.port(), 4567);
        }
    }
}
