//! # Wire Protocol Messages
//!
//! All serializable message types crossing QUIC streams. Messages are
//! serialized with bincode; every deserialization path enforces a size
//! limit to prevent memory exhaustion from hostile peers.
//!
//! ## Protocol Types
//!
//! | Concern | Request Type | Response Type |
//! |---------|--------------|---------------|
//! | Directory | `DirectoryRequest` | `DirectoryResponse` |
//! | Relay/signaling | `RelayRequest` | `RelayResponse` |
//! | Peer plumbing | `PeerRequest` | `PeerResponse` |
//!
//! Relay-initiated pushes (`RelayPush`) arrive on relay-opened streams of
//! the signaling connection rather than as responses.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Identity, PeerRecord};
use crate::nat::NatClass;
use crate::signaling::{PunchAnswer, PunchOffer};

/// Maximum serialized record/value size (64 KiB). Records are small; a
/// larger payload is hostile.
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization, with framing headroom.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Directory
// ============================================================================

/// Put/Get against the record directory. Both idempotent; the store is
/// eventually consistent and keeps only the highest sequence number per key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DirectoryRequest {
    Put { key: [u8; 32], record: PeerRecord },
    Get { key: [u8; 32] },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DirectoryResponse {
    PutOk,
    PutRejected { reason: String },
    Found { record: PeerRecord },
    NotFound,
    Error { message: String },
}

// ============================================================================
// Relay / Signaling
// ============================================================================

/// What a registered peer publishes into the relay's address book cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressBookUpdate {
    pub direct_addrs: Vec<String>,
    pub nat_class: NatClass,
}

/// A relay's cached view of one registered peer. Explicitly non-
/// authoritative: it may lag or be evicted, the directory is the source
/// of truth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressBookEntry {
    pub identity: Identity,
    pub direct_addrs: Vec<String>,
    pub nat_class: NatClass,
    pub online: bool,
    pub last_seen_ms: u64,
}

/// Client-to-relay requests over the signaling connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RelayRequest {
    /// Register or refresh this peer's address book entry.
    Register { update: AddressBookUpdate },
    /// Query the address book for a peer, a last-resort cache read.
    Query { target: Identity },
    /// Forward a punch candidate exchange to a registered target.
    ConnectRequest { target: Identity, offer: PunchOffer },
    /// Allocate a forwarding session toward a registered target.
    OpenCircuit { target: Identity },
    /// Circuit liveness probe.
    Keepalive { session_id: [u8; 16] },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RelayResponse {
    /// Registration accepted; `observed_addr` is the source address the
    /// relay saw, an externally-echoed reflection of the caller.
    Registered { observed_addr: String },
    QueryResult { entry: Option<AddressBookEntry> },
    ConnectAnswer { answer: PunchAnswer },
    ConnectRejected { reason: String },
    CircuitOpen { session_id: [u8; 16] },
    CircuitRejected { reason: String },
    KeepaliveAck,
    Error { message: String },
}

/// Relay-initiated messages pushed to a registered peer on a relay-opened
/// stream; the peer answers on the same stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RelayPush {
    /// A punch exchange from `from`, forwarded verbatim. Answered with a
    /// `PunchAnswer`.
    IncomingConnect { from: Identity, offer: PunchOffer },
    /// A circuit toward this peer was allocated; install the tunnel route
    /// before the initiator's handshake packets arrive. Answered with an
    /// acknowledgement flag.
    IncomingCircuit { from: Identity, session_id: [u8; 16] },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RelayPushReply {
    Answer { answer: PunchAnswer },
    CircuitReady,
    Rejected { reason: String },
}

// ============================================================================
// Peer plumbing
// ============================================================================

/// Direct peer-to-peer requests outside the directory/relay concerns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    /// "What address do you see me as?" The response seeds the observed-
    /// address corroboration ledger.
    ObservedAddr,
    /// Ask the peer to dial us back at `probe_addr` to confirm it is
    /// reachable from outside.
    CheckReachability { probe_addr: String },
    Ping,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerResponse {
    ObservedAddr { addr: String },
    Reachable { reachable: bool },
    Pong,
    Error { message: String },
}

// ============================================================================
// Envelope
// ============================================================================

/// Top-level request envelope carried on each stream. The claimed sender
/// identity is cross-checked against the TLS-verified identity by the
/// dispatcher before any handler runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireRequest {
    pub sender: Identity,
    pub body: RequestBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestBody {
    Directory(DirectoryRequest),
    Relay(RelayRequest),
    Peer(PeerRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireResponse {
    Directory(DirectoryResponse),
    Relay(RelayResponse),
    Peer(PeerResponse),
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn sample_record() -> PeerRecord {
        PeerRecord::new_signed(
            &Keypair::generate(),
            vec!["203.0.113.1:4433".to_string()],
            vec![],
            NatClass::FullCone,
            vec![],
            1,
        )
    }

    #[test]
    fn directory_request_round_trip() {
        let record = sample_record();
        let request = DirectoryRequest::Put {
            key: *record.identity.as_bytes(),
            record: record.clone(),
        };
        let bytes = serialize(&request).unwrap();
        let decoded: DirectoryRequest = deserialize_bounded(&bytes).unwrap();
        match decoded {
            DirectoryRequest::Put { key, record: r } => {
                assert_eq!(key, *record.identity.as_bytes());
                assert_eq!(r, record);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn relay_request_round_trip() {
        let request = RelayRequest::OpenCircuit {
            target: Identity::from_bytes([5u8; 32]),
        };
        let bytes = serialize(&request).unwrap();
        let decoded: RelayRequest = deserialize_bounded(&bytes).unwrap();
        match decoded {
            RelayRequest::OpenCircuit { target } => {
                assert_eq!(target, Identity::from_bytes([5u8; 32]));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = WireRequest {
            sender: Identity::from_bytes([2u8; 32]),
            body: RequestBody::Peer(PeerRequest::Ping),
        };
        let bytes = serialize(&envelope).unwrap();
        let decoded: WireRequest = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.sender, envelope.sender);
        assert!(matches!(
            decoded.body,
            RequestBody::Peer(PeerRequest::Ping)
        ));
    }

    #[test]
    fn push_round_trip() {
        let push = RelayPush::IncomingCircuit {
            from: Identity::from_bytes([7u8; 32]),
            session_id: [9u8; 16],
        };
        let bytes = serialize(&push).unwrap();
        let decoded: RelayPush = deserialize_bounded(&bytes).unwrap();
        match decoded {
            RelayPush::IncomingCircuit { from, session_id } => {
                assert_eq!(from, Identity::from_bytes([7u8; 32]));
                assert_eq!(session_id, [9u8; 16]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn malformed_bytes_rejected() {
        let result: Result<WireRequest, _> = deserialize_bounded(&[0xFF; 8]);
        assert!(result.is_err());
        let result: Result<DirectoryResponse, _> = deserialize_bounded(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn oversized_payload_rejected() {
        // A length field claiming more than the limit must fail before
        // allocation, not OOM.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes()); // variant: Query-ish
        bytes.extend_from_slice(&(u64::MAX).to_le_bytes());
        let result: Result<WireResponse, _> = deserialize_bounded(&bytes);
        assert!(result.is_err());
    }
}
