//! # Routed UDP Socket
//!
//! One UDP socket carries three traffic kinds, demultiplexed by magic
//! prefix before QUIC ever sees a datagram:
//!
//! - `PRLY` relay frames: circuit traffic encapsulated for or arriving
//!   from the relay
//! - `PNCH` punch probes: handed to the NAT coordinator
//! - everything else: raw QUIC, passed through untouched
//!
//! ## Tunnel Addressing
//!
//! QUIC tracks connections by `SocketAddr`, but a relayed peer has no
//! stable address of its own. Each circuit therefore gets a synthetic
//! IPv4 address in 240.0.0.0/5 (reserved, never routed) derived from the
//! peer identity; outbound datagrams to it are wrapped in relay frames,
//! and inbound frames are rewritten so QUIC sees the synthetic source.
//! The synthetic range is IPv4 so quinn never rejects the dial for an
//! address-family mismatch with the underlying socket. Direct traffic is
//! never rewritten — QUIC keys handshakes on the real remote address and
//! translating it stalls connections.
//!
//! Implements quinn's `AsyncUdpSocket`, so the QUIC layer is unaware any
//! of this is happening.

use std::fmt::{self, Debug};
use std::io::{self, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use lru::LruCache;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::identity::Identity;
use crate::nat::PunchProbe;
use crate::relay::{MAX_RELAY_FRAME_SIZE, RELAY_MAGIC, RelayServer, RelayTunnel};

/// Maximum concurrent tunnel routes.
/// SECURITY: Bounds route table size.
pub const MAX_TUNNEL_ROUTES: usize = 1024;

/// Buffered inbound punch probes before older ones drop.
const PUNCH_CHANNEL_CAPACITY: usize = 64;

/// Leading octet bits of synthetic tunnel addresses: 240.0.0.0/5, inside
/// the reserved class E range so it can never collide with real traffic.
const TUNNEL_NET: u8 = 240;
const TUNNEL_NET_MASK: u8 = 0b1111_1000;

/// Synthetic address standing in for one relayed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelAddr(pub SocketAddr);

impl TunnelAddr {
    pub fn from_identity(identity: &Identity) -> Self {
        let hash = blake3::hash(identity.as_bytes());
        let h = hash.as_bytes();
        let ip = Ipv4Addr::new(TUNNEL_NET | (h[0] & !TUNNEL_NET_MASK), h[1], h[2], h[3]);
        // Ports below 1024 look odd in logs; fold the hash into the rest.
        let port = 1024 + (u16::from_be_bytes([h[4], h[5]]) % (u16::MAX - 1024));
        Self(SocketAddr::new(IpAddr::V4(ip), port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn is_tunnel_addr(addr: &SocketAddr) -> bool {
        match Self::normalize(*addr).ip() {
            IpAddr::V4(v4) => v4.octets()[0] & TUNNEL_NET_MASK == TUNNEL_NET,
            IpAddr::V6(_) => false,
        }
    }

    /// Collapse v4-mapped IPv6 forms; quinn produces them when the socket
    /// is bound to an IPv6 address.
    pub fn normalize(addr: SocketAddr) -> SocketAddr {
        match addr.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
                None => addr,
            },
            IpAddr::V4(_) => addr,
        }
    }
}

struct TunnelRoute {
    relay_addr: SocketAddr,
    tunnel: RelayTunnel,
    last_recv: Option<Instant>,
}

pub struct RoutedSock {
    inner: Arc<tokio::net::UdpSocket>,
    local_addr: SocketAddr,
    /// Synthetic addr -> outbound tunnel route.
    routes: StdRwLock<LruCache<SocketAddr, TunnelRoute>>,
    /// Session id -> synthetic addr, for inbound frame translation.
    sessions: StdRwLock<LruCache<[u8; 16], SocketAddr>>,
    /// Present when this process also forwards for others.
    relay_server: StdRwLock<Option<RelayServer>>,
    punch_tx: mpsc::Sender<(PunchProbe, SocketAddr)>,
    punch_rx: StdMutex<Option<mpsc::Receiver<(PunchProbe, SocketAddr)>>>,
}

impl RoutedSock {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (punch_tx, punch_rx) = mpsc::channel(PUNCH_CHANNEL_CAPACITY);
        let cap = NonZeroUsize::new(MAX_TUNNEL_ROUTES).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            inner: Arc::new(socket),
            local_addr,
            routes: StdRwLock::new(LruCache::new(cap)),
            sessions: StdRwLock::new(LruCache::new(cap)),
            relay_server: StdRwLock::new(None),
            punch_tx,
            punch_rx: StdMutex::new(Some(punch_rx)),
        })
    }

    pub fn into_endpoint(
        self,
        server_config: quinn::ServerConfig,
    ) -> io::Result<(quinn::Endpoint, Arc<Self>)> {
        let sock = Arc::new(self);

        let runtime =
            quinn::default_runtime().ok_or_else(|| io::Error::other("no async runtime found"))?;

        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            sock.clone(),
            runtime,
        )?;

        Ok((endpoint, sock))
    }

    pub async fn bind_endpoint(
        addr: SocketAddr,
        server_config: quinn::ServerConfig,
    ) -> io::Result<(quinn::Endpoint, Arc<Self>)> {
        let sock = Self::bind(addr).await?;
        sock.into_endpoint(server_config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn inner_socket(&self) -> &Arc<tokio::net::UdpSocket> {
        &self.inner
    }

    /// Wire the local relay server into the datagram path. Frames for
    /// sessions we do not own are forwarded by it.
    pub fn install_relay_server(&self, server: RelayServer) {
        if let Ok(mut guard) = self.relay_server.write() {
            *guard = Some(server);
        }
    }

    /// Take the inbound punch probe stream. Yields exactly once.
    pub fn take_punch_rx(&self) -> Option<mpsc::Receiver<(PunchProbe, SocketAddr)>> {
        self.punch_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Install a circuit route toward `identity` through `relay_addr`.
    /// Returns the synthetic address QUIC should dial or expect.
    pub fn add_tunnel_route(
        &self,
        identity: Identity,
        relay_addr: SocketAddr,
        session_id: [u8; 16],
    ) -> SocketAddr {
        let tunnel_addr = TunnelAddr::from_identity(&identity).socket_addr();
        if let Ok(mut routes) = self.routes.write() {
            routes.put(
                tunnel_addr,
                TunnelRoute {
                    relay_addr,
                    tunnel: RelayTunnel::new(session_id),
                    last_recv: None,
                },
            );
        }
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.put(session_id, tunnel_addr);
        }
        trace!(
            peer = %identity.short(),
            session = %hex::encode(&session_id[..4]),
            "tunnel route installed"
        );
        tunnel_addr
    }

    pub fn remove_tunnel_route(&self, identity: &Identity) {
        let tunnel_addr = TunnelAddr::from_identity(identity).socket_addr();
        let session_id = match self.routes.write() {
            Ok(mut routes) => routes.pop(&tunnel_addr).map(|r| r.tunnel.session_id()),
            Err(_) => None,
        };
        if let (Some(sid), Ok(mut sessions)) = (session_id, self.sessions.write()) {
            sessions.pop(&sid);
        }
    }

    /// Time since circuit traffic last arrived from `identity`, or `None`
    /// if no route exists or nothing was ever received.
    pub fn tunnel_idle_time(&self, identity: &Identity) -> Option<std::time::Duration> {
        let tunnel_addr = TunnelAddr::from_identity(identity).socket_addr();
        let routes = self.routes.read().ok()?;
        routes.peek(&tunnel_addr)?.last_recv.map(|t| t.elapsed())
    }

    /// Send raw bytes outside any framing; used for punch probes.
    pub fn try_send_raw(&self, data: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.try_send_to(data, dest).map(|_| ())
    }
}

impl Debug for RoutedSock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedSock")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

struct RoutedSockPoller {
    inner: Arc<tokio::net::UdpSocket>,
}

impl Debug for RoutedSockPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedSockPoller").finish_non_exhaustive()
    }
}

impl UdpPoller for RoutedSockPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.inner.poll_send_ready(cx)
    }
}

impl AsyncUdpSocket for RoutedSock {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(RoutedSockPoller {
            inner: self.inner.clone(),
        })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        if !TunnelAddr::is_tunnel_addr(&transmit.destination) {
            return self
                .inner
                .try_send_to(transmit.contents, transmit.destination)
                .map(|_| ());
        }

        let routes = match self.routes.try_read() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "route map locked"));
            }
        };

        let dest = TunnelAddr::normalize(transmit.destination);
        let route = match routes.peek(&dest) {
            Some(route) => route,
            None => {
                warn!(dest = ?transmit.destination, "no tunnel route for destination");
                return Err(io::Error::new(io::ErrorKind::NotConnected, "unknown tunnel"));
            }
        };

        let frame = route.tunnel.encode_frame(transmit.contents);
        let relay_dest = route.relay_addr;
        drop(routes);

        if frame.len() > MAX_RELAY_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "relay frame too large",
            ));
        }

        self.inner.try_send_to(&frame, relay_dest).map(|_| ())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        debug_assert!(!bufs.is_empty() && !meta.is_empty());

        let mut buf = [0u8; 65535];
        let mut read_buf = tokio::io::ReadBuf::new(&mut buf);

        match self.inner.poll_recv_from(cx, &mut read_buf) {
            Poll::Ready(Ok(src_addr)) => {
                let received = read_buf.filled();

                if received.len() >= 4 && received[0..4] == RELAY_MAGIC {
                    if let Some((session_id, payload)) = RelayTunnel::decode_frame(received) {
                        // Frames for a session we own are circuit traffic
                        // for our own QUIC endpoint.
                        let tunnel_addr = match self.sessions.try_read() {
                            Ok(guard) => guard.peek(&session_id).copied(),
                            Err(_) => None,
                        };

                        if let Some(tunnel_addr) = tunnel_addr {
                            if let Ok(mut routes) = self.routes.try_write()
                                && let Some(route) = routes.get_mut(&tunnel_addr)
                            {
                                route.last_recv = Some(Instant::now());
                            }

                            let copy_len = payload.len().min(bufs[0].len());
                            bufs[0][..copy_len].copy_from_slice(&payload[..copy_len]);
                            meta[0] = RecvMeta {
                                addr: tunnel_addr,
                                len: copy_len,
                                stride: copy_len,
                                ecn: None,
                                dst_ip: None,
                            };
                            return Poll::Ready(Ok(1));
                        }

                        // Not ours: hand to the forwarding server if one
                        // is running here, otherwise drop.
                        let server = match self.relay_server.read() {
                            Ok(guard) => guard.clone(),
                            Err(_) => None,
                        };
                        if let Some(server) = server {
                            let data = received.to_vec();
                            tokio::spawn(async move {
                                server.process_packet(data, src_addr).await;
                            });
                        } else {
                            trace!(
                                session = %hex::encode(&session_id[..4]),
                                "dropping frame for unknown session"
                            );
                        }
                    }
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }

                if PunchProbe::is_punch_probe(received) {
                    if let Some(probe) = PunchProbe::from_bytes(received) {
                        // Full channel means a burst flood; dropping is fine.
                        let _ = self.punch_tx.try_send((probe, src_addr));
                    }
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }

                // Plain QUIC datagram: never rewrite the source address.
                let copy_len = received.len().min(bufs[0].len());
                bufs[0][..copy_len].copy_from_slice(&received[..copy_len]);
                meta[0] = RecvMeta {
                    addr: src_addr,
                    len: copy_len,
                    stride: copy_len,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RELAY_HEADER_SIZE;

    #[test]
    fn tunnel_addr_is_deterministic_and_distinct() {
        let a = Identity::from_bytes([1u8; 32]);
        let b = Identity::from_bytes([2u8; 32]);

        assert_eq!(
            TunnelAddr::from_identity(&a).socket_addr(),
            TunnelAddr::from_identity(&a).socket_addr()
        );
        assert_ne!(
            TunnelAddr::from_identity(&a).socket_addr(),
            TunnelAddr::from_identity(&b).socket_addr()
        );
    }

    #[test]
    fn tunnel_addr_detection() {
        let id = Identity::from_bytes([1u8; 32]);
        let synthetic = TunnelAddr::from_identity(&id).socket_addr();
        assert!(TunnelAddr::is_tunnel_addr(&synthetic));

        let v4: SocketAddr = "192.0.2.1:1234".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:1234".parse().unwrap();
        assert!(!TunnelAddr::is_tunnel_addr(&v4));
        assert!(!TunnelAddr::is_tunnel_addr(&v6));
    }

    #[tokio::test]
    async fn route_install_and_remove() {
        let sock = RoutedSock::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = Identity::from_bytes([3u8; 32]);
        let relay: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let tunnel_addr = sock.add_tunnel_route(peer, relay, [7u8; 16]);
        assert!(TunnelAddr::is_tunnel_addr(&tunnel_addr));

        sock.remove_tunnel_route(&peer);
        let routes = sock.routes.read().unwrap();
        assert!(routes.peek(&tunnel_addr).is_none());
    }

    #[tokio::test]
    async fn punch_rx_taken_once() {
        let sock = RoutedSock::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(sock.take_punch_rx().is_some());
        assert!(sock.take_punch_rx().is_none());
    }

    #[test]
    fn relay_frame_encoding() {
        let tunnel = RelayTunnel::new([9u8; 16]);
        let payload = b"quic bytes";
        let frame = tunnel.encode_frame(payload);

        assert_eq!(frame.len(), RELAY_HEADER_SIZE + payload.len());
        assert_eq!(&frame[0..4], &RELAY_MAGIC);
        let (session, decoded) = RelayTunnel::decode_frame(&frame).unwrap();
        assert_eq!(session, [9u8; 16]);
        assert_eq!(decoded, payload);
    }
}
