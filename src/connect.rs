//! # Connection Priority Engine
//!
//! One call, every strategy: resolve the target's addresses, race direct
//! dials, fall back to hole punching, fall back to a relay circuit. Each
//! phase runs to completion before the next starts, and every produced
//! connection carries a TLS-verified identity equal to the target. A
//! connection whose identity does not match is discarded and the engine
//! moves on as if the phase had failed.
//!
//! Failures never escape as panics or process exits; the caller gets a
//! [`ConnectError`] naming what went wrong, with [`ConnectError::AllPhasesExhausted`]
//! aggregating per-phase reasons when nothing worked.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use quinn::{Connection, Endpoint};
use tracing::{debug, trace, warn};

use crate::addrstore::{AddrSource, AddrStore};
use crate::cache::{CacheLayer, CacheSource};
use crate::crypto::extract_verified_identity;
use crate::directory::DirectoryClient;
use crate::identity::Identity;
use crate::nat::{NatClass, NatCoordinator, PunchDecision, PunchError, decide};
use crate::relay::{RelayCircuit, RelayClient};
use crate::rpc::{IdentityMismatch, connect_verified};
use crate::signaling::SignalingChannel;
use crate::socket::TunnelAddr;

// ============================================================================
// Errors
// ============================================================================

/// Why a connection attempt failed. Nothing here is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// No addresses were found anywhere and no relay is configured.
    NoAddresses,
    /// Every dial ran out the clock.
    DialTimeout,
    /// The remote (or the network) actively refused.
    DialRefused { reason: String },
    /// A handshake completed but with the wrong peer on the other end.
    IdentityMismatch { expected: Identity },
    /// Punching was required but no signaling channel exists.
    NoSignalingChannel,
    /// The directory refused our record.
    PublishRejected { reason: String },
    /// Every phase ran and failed; reasons in phase order.
    AllPhasesExhausted { phases: Vec<(AttemptPhase, String)> },
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAddresses => write!(f, "no addresses known and no relay configured"),
            Self::DialTimeout => write!(f, "dial timed out"),
            Self::DialRefused { reason } => write!(f, "dial refused: {reason}"),
            Self::IdentityMismatch { expected } => {
                write!(f, "peer is not {}", expected.short())
            }
            Self::NoSignalingChannel => write!(f, "no signaling channel for hole punching"),
            Self::PublishRejected { reason } => write!(f, "publish rejected: {reason}"),
            Self::AllPhasesExhausted { phases } => {
                write!(f, "all phases exhausted:")?;
                for (phase, reason) in phases {
                    write!(f, " [{phase}: {reason}]")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConnectError {}

/// The phases, in the order the engine runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Resolve,
    DirectDial,
    Punch,
    Relay,
}

impl AttemptPhase {
    /// The phase after this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Resolve => Some(Self::DirectDial),
            Self::DirectDial => Some(Self::Punch),
            Self::Punch => Some(Self::Relay),
            Self::Relay => None,
        }
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolve => "resolve",
            Self::DirectDial => "direct",
            Self::Punch => "punch",
            Self::Relay => "relay",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// A successfully established, identity-verified connection and how it
/// was reached.
pub enum Established {
    Direct(Connection),
    Punched(Connection),
    Relayed(RelayCircuit),
}

impl Established {
    pub fn connection(&self) -> &Connection {
        match self {
            Self::Direct(conn) | Self::Punched(conn) => conn,
            Self::Relayed(circuit) => circuit.connection(),
        }
    }

    pub fn path_name(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Punched(_) => "punched",
            Self::Relayed(_) => "relayed",
        }
    }
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Established").field(&self.path_name()).finish()
    }
}

// ============================================================================
// Direct dial racing
// ============================================================================

fn classify_dial_error(e: &anyhow::Error, expected: Identity) -> ConnectError {
    if e.downcast_ref::<IdentityMismatch>().is_some() {
        ConnectError::IdentityMismatch { expected }
    } else {
        ConnectError::DialRefused {
            reason: e.to_string(),
        }
    }
}

/// Dial every candidate in parallel; the first verified success wins and
/// dropping the race cancels the rest. Prefers the most specific failure
/// when everything loses.
pub async fn race_direct_dials(
    endpoint: &Endpoint,
    config: quinn::ClientConfig,
    candidates: &[SocketAddr],
    expected: Identity,
    dial_timeout: Duration,
) -> Result<Connection, ConnectError> {
    if candidates.is_empty() {
        return Err(ConnectError::NoAddresses);
    }

    let mut dials: FuturesUnordered<_> = candidates
        .iter()
        .map(|&addr| {
            let config = config.clone();
            async move {
                let result = tokio::time::timeout(
                    dial_timeout,
                    connect_verified(endpoint, config, addr, expected),
                )
                .await;
                (addr, result)
            }
        })
        .collect();

    let mut last_error = ConnectError::DialTimeout;
    while let Some((addr, result)) = dials.next().await {
        match result {
            Ok(Ok(conn)) => {
                debug!(peer = %expected.short(), addr = %addr, "direct dial succeeded");
                return Ok(conn);
            }
            Ok(Err(e)) => {
                trace!(addr = %addr, error = %e, "direct dial failed");
                last_error = classify_dial_error(&e, expected);
            }
            Err(_) => {
                trace!(addr = %addr, "direct dial timed out");
                if !matches!(last_error, ConnectError::DialRefused { .. }) {
                    last_error = ConnectError::DialTimeout;
                }
            }
        }
    }
    Err(last_error)
}

// ============================================================================
// Engine
// ============================================================================

struct Resolved {
    candidates: Vec<String>,
    remote_nat: NatClass,
}

/// Orchestrates resolution and the dial/punch/relay ladder for one node.
pub struct ConnectEngine {
    endpoint: Endpoint,
    pinned_config: quinn::ClientConfig,
    local_identity: Identity,
    addrs: AddrStore,
    cache: Arc<CacheLayer>,
    directory: Arc<DirectoryClient>,
    relay: Arc<RelayClient>,
    coordinator: Arc<NatCoordinator>,
    nat_class: Arc<StdRwLock<NatClass>>,
    dial_timeout: Duration,
    punch_timeout: Duration,
    probe_interval: Duration,
    punch_skew_tolerance: Duration,
}

impl ConnectEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Endpoint,
        pinned_config: quinn::ClientConfig,
        local_identity: Identity,
        addrs: AddrStore,
        cache: Arc<CacheLayer>,
        directory: Arc<DirectoryClient>,
        relay: Arc<RelayClient>,
        coordinator: Arc<NatCoordinator>,
        nat_class: Arc<StdRwLock<NatClass>>,
        config: &crate::config::Config,
    ) -> Self {
        Self {
            endpoint,
            pinned_config,
            local_identity,
            addrs,
            cache,
            directory,
            relay,
            coordinator,
            nat_class,
            dial_timeout: config.dial_timeout,
            punch_timeout: config.punch_timeout,
            probe_interval: config.punch_probe_interval,
            punch_skew_tolerance: config.punch_skew_tolerance,
        }
    }

    /// Establish a connection to `target`, trying direct, punched, and
    /// relayed paths in that order.
    pub async fn connect(&self, target: Identity) -> Result<Established, ConnectError> {
        if target == self.local_identity {
            return Err(ConnectError::DialRefused {
                reason: "cannot connect to self".to_string(),
            });
        }

        let resolved = self.resolve(target).await;
        if resolved.candidates.is_empty() && !self.relay.is_configured() {
            return Err(ConnectError::NoAddresses);
        }

        let mut failures: Vec<(AttemptPhase, String)> = Vec::new();
        if resolved.candidates.is_empty() {
            failures.push((AttemptPhase::Resolve, "no direct addresses found".to_string()));
        }

        // Phase 1: parallel direct dials.
        let dialable: Vec<SocketAddr> = resolved
            .candidates
            .iter()
            .filter_map(|a| a.parse().ok())
            .filter(|a| !TunnelAddr::is_tunnel_addr(a))
            .collect();
        if !dialable.is_empty() {
            match race_direct_dials(
                &self.endpoint,
                self.pinned_config.clone(),
                &dialable,
                target,
                self.dial_timeout,
            )
            .await
            {
                Ok(conn) => {
                    self.cache
                        .record_success(target, conn.remote_address().to_string());
                    return Ok(Established::Direct(conn));
                }
                Err(e) => {
                    debug!(peer = %target.short(), error = %e, "direct phase failed");
                    failures.push((AttemptPhase::DirectDial, e.to_string()));
                }
            }
        }

        // Phase 2: hole punch. Skipped silently when there is no
        // signaling channel to exchange candidates over.
        match self.try_punch(target, resolved.remote_nat).await {
            Ok(conn) => {
                self.cache
                    .record_success(target, conn.remote_address().to_string());
                return Ok(Established::Punched(conn));
            }
            Err(ConnectError::NoSignalingChannel) => {
                trace!(peer = %target.short(), "skipping punch, no signaling channel");
            }
            Err(e) => {
                debug!(peer = %target.short(), error = %e, "punch phase failed");
                failures.push((AttemptPhase::Punch, e.to_string()));
            }
        }

        // Phase 3: relay circuit.
        if self.relay.is_configured() {
            match self.relay.open_circuit(target).await {
                Ok(circuit) => return Ok(Established::Relayed(circuit)),
                Err(e) => {
                    debug!(peer = %target.short(), error = %e, "relay phase failed");
                    failures.push((AttemptPhase::Relay, e.to_string()));
                }
            }
        } else {
            failures.push((AttemptPhase::Relay, "no relay configured".to_string()));
        }

        warn!(peer = %target.short(), phases = failures.len(), "connection attempt exhausted");
        Err(ConnectError::AllPhasesExhausted { phases: failures })
    }

    /// Candidate addresses for `target`, walking the lookup ladder:
    /// local success cache, realm cache, directory, relay address book.
    /// Cache hits are served immediately and re-verified in the
    /// background so staleness heals without blocking the caller.
    async fn resolve(&self, target: Identity) -> Resolved {
        if let Some((source, candidates)) = self.cache.resolve_cached(target) {
            debug!(
                peer = %target.short(),
                source = ?source,
                count = candidates.len(),
                "resolved from cache"
            );
            self.spawn_cache_refresh(target);
            let remote_nat = match source {
                // The realm cache learned the class from a record.
                CacheSource::RecentSuccess | CacheSource::Realm => NatClass::Unknown,
            };
            return Resolved {
                candidates,
                remote_nat,
            };
        }

        if let Some(record) = self.directory.resolve(target).await {
            self.cache.apply_record(&record);
            return Resolved {
                candidates: record.direct_addrs.clone(),
                remote_nat: record.nat_class,
            };
        }

        if self.relay.is_configured() {
            match self.relay.query_address_book(target).await {
                Ok(Some(entry)) => {
                    self.cache
                        .learn_realm_addrs(target, entry.direct_addrs.clone());
                    return Resolved {
                        candidates: entry.direct_addrs,
                        remote_nat: entry.nat_class,
                    };
                }
                Ok(None) => {}
                Err(e) => trace!(error = %e, "address book fallback failed"),
            }
        }

        Resolved {
            candidates: Vec::new(),
            remote_nat: NatClass::Unknown,
        }
    }

    fn spawn_cache_refresh(&self, target: Identity) {
        let directory = Arc::clone(&self.directory);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            if let Some(record) = directory.resolve(target).await {
                cache.apply_record(&record);
            } else {
                cache.invalidate(target);
            }
        });
    }

    async fn try_punch(&self, target: Identity, remote_nat: NatClass) -> Result<Connection, ConnectError> {
        if !self.relay.is_configured() {
            return Err(ConnectError::NoSignalingChannel);
        }

        let local_nat = self.nat_class.read().map(|g| *g).unwrap_or_default();
        if decide(local_nat, remote_nat) == PunchDecision::UseRelay {
            return Err(ConnectError::DialRefused {
                reason: "symmetric NAT pair, punching cannot work".to_string(),
            });
        }

        // Only externally observed mappings are worth offering; our own
        // bind addresses mean nothing to a peer outside the NAT.
        let local_candidates: Vec<String> = self
            .addrs
            .list_publishable()
            .await
            .into_iter()
            .filter(|e| e.source != AddrSource::SelfObserved)
            .map(|e| e.addr.to_string())
            .collect();

        let signaling: &RelayClient = &self.relay;
        let punched_addr = self
            .coordinator
            .punch(
                target,
                local_nat,
                remote_nat,
                local_candidates,
                signaling as &dyn SignalingChannel,
                self.punch_timeout,
                self.probe_interval,
                self.punch_skew_tolerance,
            )
            .await
            .map_err(|e| match e {
                PunchError::Timeout => ConnectError::DialTimeout,
                other => ConnectError::DialRefused {
                    reason: other.to_string(),
                },
            })?;

        // The punched mapping is open; the QUIC handshake through it
        // still has to prove the peer is who we wanted. The handshake
        // belongs to the punch phase and runs on its budget: the direct
        // dial budget was already spent, and a freshly punched mapping
        // must be used before the NAT ages it out.
        let conn = tokio::time::timeout(
            self.punch_timeout,
            connect_verified(
                &self.endpoint,
                self.pinned_config.clone(),
                punched_addr,
                target,
            ),
        )
        .await
        .map_err(|_| ConnectError::DialTimeout)?
        .map_err(|e| classify_dial_error(&e, target))?;

        let verified = extract_verified_identity(&conn);
        debug_assert_eq!(verified, Some(target));
        Ok(conn)
    }
}

impl fmt::Debug for ConnectEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectEngine")
            .field("local", &self.local_identity.short())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_is_fixed() {
        assert_eq!(AttemptPhase::Resolve.next(), Some(AttemptPhase::DirectDial));
        assert_eq!(AttemptPhase::DirectDial.next(), Some(AttemptPhase::Punch));
        assert_eq!(AttemptPhase::Punch.next(), Some(AttemptPhase::Relay));
        assert_eq!(AttemptPhase::Relay.next(), None);
    }

    #[test]
    fn error_display_names_phases() {
        let err = ConnectError::AllPhasesExhausted {
            phases: vec![
                (AttemptPhase::DirectDial, "refused".to_string()),
                (AttemptPhase::Relay, "no relay".to_string()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("direct: refused"));
        assert!(msg.contains("relay: no relay"));
    }

    #[test]
    fn mismatch_classification() {
        let expected = Identity::from_bytes([7u8; 32]);
        let err: anyhow::Error = IdentityMismatch {
            expected,
            actual: None,
        }
        .into();
        assert_eq!(
            classify_dial_error(&err, expected),
            ConnectError::IdentityMismatch { expected }
        );

        let plain = anyhow::anyhow!("connection refused");
        assert!(matches!(
            classify_dial_error(&plain, expected),
            ConnectError::DialRefused { .. }
        ));
    }
}
