//! # Passage - Connection Establishment & NAT Traversal Engine
//!
//! Passage turns a peer identity into a live, identity-verified QUIC
//! connection, whatever the network between the two peers looks like:
//!
//! - **Identity**: BLAKE3 hash of an Ed25519 public key; every handshake
//!   proves it via mutual TLS with self-signed certificates
//! - **Address lifecycle**: discovered addresses are verified before they
//!   are ever published, and expire when confirmation stops
//! - **Directory**: signed, sequence-numbered peer records with strictly
//!   monotonic consumption
//! - **NAT traversal**: coordinated UDP hole punching with NAT-class
//!   pre-flight, falling back to relayed circuits
//! - **Relay**: operator-configured forwarding servers carrying `PRLY`
//!   framed circuit traffic over the same UDP socket as QUIC
//!
//! ## Architecture
//!
//! Mutable state lives behind the **actor pattern**: each stateful
//! component (lifecycle store, verifier, relay server, connection cache)
//! has a cheap-to-clone handle and a private actor that owns the state
//! and processes commands sequentially.
//!
//! ## Security Model
//!
//! - All connections use mutual TLS with Ed25519 certificates
//! - An address enters a published record only after verification
//! - Records are domain-separated signatures over their full contents
//! - All tables are bounded; untrusted input is size- and time-limited
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, identities, signed peer records |
//! | `crypto` | TLS certificate generation and verification |
//! | `addrstore` | Address lifecycle state machine and store |
//! | `verifier` | Reachability verification and corroboration |
//! | `directory` | Announce/resolve with backoff and seq monotonicity |
//! | `cache` | Success and realm address caches |
//! | `nat` | NAT classification and hole punch coordination |
//! | `relay` | Relay server, client, and circuit lifecycle |
//! | `connect` | Phase-ordered connection priority engine |
//! | `socket` | RoutedSock multi-path UDP transport layer |
//! | `rpc` | QUIC request/response plumbing and dispatch |
//! | `messages` | Serialization types for all wire protocols |

pub mod addrstore;
pub mod cache;
pub mod config;
pub mod connect;
mod crypto;
pub mod directory;
pub mod identity;
pub mod messages;
pub mod nat;
pub mod node;
pub mod relay;
pub mod rpc;
pub mod signaling;
pub mod socket;
pub mod verifier;

pub use config::Config;
pub use connect::ConnectError;
pub use identity::{Identity, Keypair, PeerRecord};
pub use node::{Connection, Node};
pub use rpc::IncomingStream;
