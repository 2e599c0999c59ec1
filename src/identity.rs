//! # Identity and Peer Records
//!
//! Peers are addressed by a 32-byte identity derived from their Ed25519
//! verifying key: `Identity = BLAKE3(public_key)`. The key itself travels
//! inside the signed [`PeerRecord`], so any consumer can re-derive the
//! identity and check the signature without out-of-band state.
//!
//! ## Record Model
//!
//! A `PeerRecord` is the unit a peer publishes to the directory: its
//! identity, verifying key, direct and relay addresses, NAT classification,
//! capability tags, a strictly increasing sequence number, and a timestamp,
//! all covered by a domain-separated Ed25519 signature. Consumers must
//! verify the signature and keep only the highest sequence number seen —
//! there is no global clock, seq monotonicity is the only cross-network
//! ordering guarantee.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::{RECORD_SIGNATURE_DOMAIN, SignatureError, sign_with_domain, verify_with_domain};
use crate::nat::NatClass;

/// Maximum addresses of each kind a record may carry.
/// SECURITY: Bounds record size against inflation by a malicious peer.
pub const MAX_RECORD_ADDRS: usize = 16;

/// Maximum length of a single address string.
pub const MAX_ADDR_LEN: usize = 256;

/// Maximum capability tags per record.
pub const MAX_CAPABILITIES: usize = 16;

/// Maximum length of a capability tag.
pub const MAX_CAPABILITY_LEN: usize = 64;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Identity
// ============================================================================

/// A peer's network identity: the BLAKE3 hash of its Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the identity a verifying key corresponds to.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 keypair backing a node's identity and record signatures.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_public_key(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PeerRecord
// ============================================================================

/// Why a resolved record was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// Signature missing, malformed, or cryptographically invalid.
    SignatureInvalid,
    /// Identity does not match the hash of the embedded public key.
    IdentityMismatch,
    /// Record timestamp lies further in the future than the skew tolerance.
    ClockSkewFuture,
    /// Record is older than the accepted maximum age.
    Stale,
    /// Structural bounds violated (too many or too long addresses).
    Malformed,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::SignatureInvalid => write!(f, "record signature invalid"),
            RecordError::IdentityMismatch => write!(f, "record identity does not match public key"),
            RecordError::ClockSkewFuture => write!(f, "record timestamp too far in the future"),
            RecordError::Stale => write!(f, "record is stale"),
            RecordError::Malformed => write!(f, "record violates structural bounds"),
        }
    }
}

impl std::error::Error for RecordError {}

/// A signed, sequence-numbered address bundle for one peer.
///
/// Owned exclusively by the peer it describes. `seq` strictly increases on
/// every republish; consumers discard records with `seq` at or below one
/// already held for the same identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub identity: Identity,
    pub public_key: [u8; 32],
    pub direct_addrs: Vec<String>,
    pub relay_addrs: Vec<String>,
    pub nat_class: NatClass,
    pub capabilities: Vec<String>,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

impl PeerRecord {
    /// Build and sign a record for this keypair's identity.
    pub fn new_signed(
        keypair: &Keypair,
        direct_addrs: Vec<String>,
        relay_addrs: Vec<String>,
        nat_class: NatClass,
        capabilities: Vec<String>,
        seq: u64,
    ) -> Self {
        let mut record = Self {
            identity: keypair.identity(),
            public_key: keypair.public_key_bytes(),
            direct_addrs,
            relay_addrs,
            nat_class,
            capabilities,
            seq,
            timestamp_ms: now_ms(),
            signature: Vec::new(),
        };
        let payload = record.signed_payload();
        record.signature = sign_with_domain(keypair, RECORD_SIGNATURE_DOMAIN, &payload);
        record
    }

    /// Canonical byte layout covered by the signature:
    /// identity(32) || public_key(32) || seq(8) || nat_class(1) ||
    /// per-list count(4) then len(4)+bytes per entry for direct, relay,
    /// capability lists || timestamp(8).
    fn signed_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(128);
        payload.extend_from_slice(self.identity.as_bytes());
        payload.extend_from_slice(&self.public_key);
        payload.extend_from_slice(&self.seq.to_be_bytes());
        payload.push(self.nat_class.wire_byte());
        for list in [&self.direct_addrs, &self.relay_addrs, &self.capabilities] {
            payload.extend_from_slice(&(list.len() as u32).to_be_bytes());
            for item in list {
                payload.extend_from_slice(&(item.len() as u32).to_be_bytes());
                payload.extend_from_slice(item.as_bytes());
            }
        }
        payload.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        payload
    }

    /// Structural bounds check. Run before any cryptographic work so a
    /// malicious record cannot make us hash megabytes of address strings.
    pub fn validate_structure(&self) -> Result<(), RecordError> {
        if self.direct_addrs.len() > MAX_RECORD_ADDRS
            || self.relay_addrs.len() > MAX_RECORD_ADDRS
            || self.capabilities.len() > MAX_CAPABILITIES
        {
            return Err(RecordError::Malformed);
        }
        for addr in self.direct_addrs.iter().chain(self.relay_addrs.iter()) {
            if addr.len() > MAX_ADDR_LEN {
                return Err(RecordError::Malformed);
            }
        }
        for cap in &self.capabilities {
            if cap.len() > MAX_CAPABILITY_LEN {
                return Err(RecordError::Malformed);
            }
        }
        Ok(())
    }

    /// Verify structure, identity derivation, and signature.
    pub fn verify(&self) -> Result<(), RecordError> {
        self.validate_structure()?;
        if Identity::from_public_key(&self.public_key) != self.identity {
            return Err(RecordError::IdentityMismatch);
        }
        let payload = self.signed_payload();
        verify_with_domain(&self.public_key, RECORD_SIGNATURE_DOMAIN, &payload, &self.signature)
            .map_err(|e| match e {
                SignatureError::InvalidPublicKey => RecordError::IdentityMismatch,
                _ => RecordError::SignatureInvalid,
            })
    }

    /// Verify plus freshness against the local clock.
    pub fn verify_fresh(&self, max_age_ms: u64, skew_tolerance_ms: u64) -> Result<(), RecordError> {
        self.verify()?;
        let now = now_ms();
        if self.timestamp_ms > now.saturating_add(skew_tolerance_ms) {
            return Err(RecordError::ClockSkewFuture);
        }
        if now.saturating_sub(self.timestamp_ms) > max_age_ms {
            return Err(RecordError::Stale);
        }
        Ok(())
    }

    /// The effective address set a consumer should dial, direct first.
    pub fn all_addrs(&self) -> Vec<String> {
        let mut addrs = self.direct_addrs.clone();
        for a in &self.relay_addrs {
            if !addrs.contains(a) {
                addrs.push(a.clone());
            }
        }
        addrs
    }
}

impl PartialEq for PeerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.seq == other.seq
    }
}

impl Eq for PeerRecord {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(keypair: &Keypair, seq: u64) -> PeerRecord {
        PeerRecord::new_signed(
            keypair,
            vec!["203.0.113.7:4433".to_string()],
            vec!["198.51.100.1:4433".to_string()],
            NatClass::FullCone,
            vec!["echo".to_string()],
            seq,
        )
    }

    #[test]
    fn identity_is_hash_of_public_key() {
        let keypair = Keypair::generate();
        let expected = blake3::hash(&keypair.public_key_bytes());
        assert_eq!(keypair.identity().as_bytes(), expected.as_bytes());
    }

    #[test]
    fn identity_hex_round_trip() {
        let id = Identity::from_bytes([7u8; 32]);
        let parsed = Identity::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert!(Identity::from_hex("zz").is_none());
        assert!(Identity::from_hex("abcd").is_none());
    }

    #[test]
    fn signed_record_verifies() {
        let keypair = Keypair::generate();
        let record = sample_record(&keypair, 1);
        assert!(record.verify().is_ok());
        assert!(record.verify_fresh(60_000, 5_000).is_ok());
    }

    #[test]
    fn tampered_record_rejected() {
        let keypair = Keypair::generate();
        let mut record = sample_record(&keypair, 1);
        record.direct_addrs.push("192.0.2.9:1".to_string());
        assert_eq!(record.verify(), Err(RecordError::SignatureInvalid));
    }

    #[test]
    fn tampered_seq_rejected() {
        let keypair = Keypair::generate();
        let mut record = sample_record(&keypair, 1);
        record.seq = 99;
        assert_eq!(record.verify(), Err(RecordError::SignatureInvalid));
    }

    #[test]
    fn wrong_identity_rejected() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let mut record = sample_record(&keypair, 1);
        record.identity = other.identity();
        assert_eq!(record.verify(), Err(RecordError::IdentityMismatch));
    }

    #[test]
    fn future_timestamp_rejected() {
        let keypair = Keypair::generate();
        let mut record = sample_record(&keypair, 1);
        record.timestamp_ms = now_ms() + 60_000;
        // Re-sign so only freshness fails, not the signature.
        let payload = record.signed_payload();
        record.signature = sign_with_domain(&keypair, RECORD_SIGNATURE_DOMAIN, &payload);
        assert_eq!(
            record.verify_fresh(3_600_000, 5_000),
            Err(RecordError::ClockSkewFuture)
        );
    }

    #[test]
    fn stale_record_rejected() {
        let keypair = Keypair::generate();
        let mut record = sample_record(&keypair, 1);
        record.timestamp_ms = now_ms().saturating_sub(120_000);
        let payload = record.signed_payload();
        record.signature = sign_with_domain(&keypair, RECORD_SIGNATURE_DOMAIN, &payload);
        assert_eq!(record.verify_fresh(60_000, 5_000), Err(RecordError::Stale));
    }

    #[test]
    fn oversized_record_rejected_before_crypto() {
        let keypair = Keypair::generate();
        let mut record = sample_record(&keypair, 1);
        record.direct_addrs = (0..MAX_RECORD_ADDRS + 1)
            .map(|i| format!("203.0.113.{i}:1"))
            .collect();
        assert_eq!(record.verify(), Err(RecordError::Malformed));
    }

    #[test]
    fn all_addrs_dedupes_relay_overlap() {
        let keypair = Keypair::generate();
        let mut record = sample_record(&keypair, 1);
        record.relay_addrs = record.direct_addrs.clone();
        assert_eq!(record.all_addrs().len(), 1);
    }
}
