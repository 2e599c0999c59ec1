//! # NAT Classification and Hole Punching
//!
//! Classifies NAT behavior into four classes and drives the coordinated
//! simultaneous-open exchange that punches mappings through them.
//!
//! ## Punch Protocol
//!
//! - `PNCH` magic prefix identifies punch probe packets
//! - Probe carries the sender identity and a random nonce
//! - Candidates are exchanged over an already-established signaling
//!   channel; only externally observed addresses are offered
//! - Both sides burst probes at the exchanged candidates until the first
//!   inbound probe from the expected peer arrives or the window expires
//!
//! The state machine is a plain enum with a pure transition function so
//! phase ordering is testable without sockets.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::Identity;
use crate::signaling::{PunchAnswer, PunchOffer, SignalingChannel};
use crate::socket::RoutedSock;

// ============================================================================
// NAT Classes
// ============================================================================

/// Observed NAT behavior of a peer's network edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NatClass {
    /// Publicly reachable, no translation observed.
    None,
    /// Endpoint-independent mapping and filtering.
    FullCone,
    /// Endpoint-independent mapping, address-dependent filtering.
    RestrictedCone,
    /// Address-and-port-dependent mapping. Punching rarely works.
    Symmetric,
    /// Not yet classified.
    #[default]
    Unknown,
}

impl NatClass {
    /// Stable single-byte encoding used inside signed record payloads.
    pub fn wire_byte(&self) -> u8 {
        match self {
            NatClass::None => 0,
            NatClass::FullCone => 1,
            NatClass::RestrictedCone => 2,
            NatClass::Symmetric => 3,
            NatClass::Unknown => 255,
        }
    }
}

impl fmt::Display for NatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatClass::None => "none",
            NatClass::FullCone => "full-cone",
            NatClass::RestrictedCone => "restricted-cone",
            NatClass::Symmetric => "symmetric",
            NatClass::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Classify our own NAT from externally observed reflections of one local
/// socket. Multiple observers seeing the same mapping means the mapping is
/// endpoint independent (cone); diverging mappings mean symmetric. An
/// observation equal to the local address means no translation at all.
pub fn classify_from_observations(local: SocketAddr, observed: &[SocketAddr]) -> NatClass {
    if observed.is_empty() {
        return NatClass::Unknown;
    }
    if observed.iter().all(|o| *o == local) {
        return NatClass::None;
    }
    let first = observed[0];
    if observed.iter().all(|o| *o == first) {
        if observed.len() >= 2 {
            // Endpoint-independent mapping confirmed by 2+ observers.
            // Filtering behavior is indistinguishable from here, so report
            // the conservative cone class.
            NatClass::RestrictedCone
        } else {
            NatClass::Unknown
        }
    } else {
        NatClass::Symmetric
    }
}

// ============================================================================
// Decide Matrix
// ============================================================================

/// Outcome of consulting both peers' NAT classes before punching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchDecision {
    /// Punching is worth the window; proceed to candidate exchange.
    Attempt,
    /// Near-zero success probability; skip straight to relay.
    UseRelay,
}

/// The only hard-coded short-circuit: symmetric against symmetric wastes
/// the punch window. Every other pairing, including unknowns, is attempted.
pub fn decide(local: NatClass, remote: NatClass) -> PunchDecision {
    match (local, remote) {
        (NatClass::Symmetric, NatClass::Symmetric) => PunchDecision::UseRelay,
        _ => PunchDecision::Attempt,
    }
}

/// Probe window for one side of a punch attempt. The responder starts
/// bursting the moment it answers, roughly half the exchange round trip
/// before the initiator sees that answer, so the initiator discounts the
/// responder's head start; both sides then widen the window by the
/// configured skew tolerance so neither stops while the other may still
/// be probing.
pub fn probe_window(
    punch_timeout: Duration,
    exchange_rtt: Duration,
    skew_tolerance: Duration,
) -> Duration {
    punch_timeout.saturating_sub(exchange_rtt / 2) + skew_tolerance
}

// ============================================================================
// Punch State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchPhase {
    Idle,
    Decide,
    Exchanging,
    Punching,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchEvent {
    Start,
    Decided(PunchDecision),
    CandidatesExchanged,
    ExchangeFailed,
    ProbeConfirmed,
    TimedOut,
}

impl PunchPhase {
    /// Pure transition function. Unexpected events leave the phase alone;
    /// terminal phases absorb everything.
    pub fn advance(self, event: PunchEvent) -> PunchPhase {
        match (self, event) {
            (PunchPhase::Idle, PunchEvent::Start) => PunchPhase::Decide,
            (PunchPhase::Decide, PunchEvent::Decided(PunchDecision::Attempt)) => {
                PunchPhase::Exchanging
            }
            (PunchPhase::Decide, PunchEvent::Decided(PunchDecision::UseRelay)) => PunchPhase::Failed,
            (PunchPhase::Exchanging, PunchEvent::CandidatesExchanged) => PunchPhase::Punching,
            (PunchPhase::Exchanging, PunchEvent::ExchangeFailed) => PunchPhase::Failed,
            (PunchPhase::Punching, PunchEvent::ProbeConfirmed) => PunchPhase::Succeeded,
            (PunchPhase::Punching, PunchEvent::TimedOut) => PunchPhase::Failed,
            (phase, _) => phase,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PunchPhase::Succeeded | PunchPhase::Failed)
    }
}

// ============================================================================
// Punch Probe Packets
// ============================================================================

/// Magic bytes identifying punch probe packets.
pub const PUNCH_MAGIC: [u8; 4] = *b"PNCH";

/// Probe size: magic(4) + identity(32) + nonce(8).
pub const PUNCH_PROBE_SIZE: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchProbe {
    pub sender: Identity,
    pub nonce: u64,
}

impl PunchProbe {
    pub fn new(sender: Identity) -> Self {
        Self {
            sender,
            nonce: rand::random(),
        }
    }

    pub fn to_bytes(&self) -> [u8; PUNCH_PROBE_SIZE] {
        let mut buf = [0u8; PUNCH_PROBE_SIZE];
        buf[0..4].copy_from_slice(&PUNCH_MAGIC);
        buf[4..36].copy_from_slice(self.sender.as_bytes());
        buf[36..44].copy_from_slice(&self.nonce.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != PUNCH_PROBE_SIZE || data[0..4] != PUNCH_MAGIC {
            return None;
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&data[4..36]);
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&data[36..44]);
        Some(Self {
            sender: Identity::from_bytes(id),
            nonce: u64::from_be_bytes(nonce_bytes),
        })
    }

    pub fn is_punch_probe(data: &[u8]) -> bool {
        data.len() >= 4 && data[0..4] == PUNCH_MAGIC
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PunchError {
    /// Both sides symmetric; decided against punching with zero probes sent.
    SymmetricPair,
    /// Candidate exchange over the signaling channel failed.
    ExchangeFailed(String),
    /// Neither side offered any externally observed candidate.
    NoCandidates,
    /// The punch window expired without a confirming inbound probe.
    Timeout,
}

impl fmt::Display for PunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PunchError::SymmetricPair => write!(f, "both peers behind symmetric NAT"),
            PunchError::ExchangeFailed(e) => write!(f, "candidate exchange failed: {e}"),
            PunchError::NoCandidates => write!(f, "no punchable candidates exchanged"),
            PunchError::Timeout => write!(f, "punch window expired"),
        }
    }
}

impl std::error::Error for PunchError {}

// ============================================================================
// Coordinator
// ============================================================================

type PunchWaiters = Arc<StdMutex<HashMap<Identity, mpsc::Sender<SocketAddr>>>>;

/// Drives hole punch attempts and answers inbound probes.
///
/// Owns the socket's punch probe stream: every inbound probe is answered
/// with a reply probe (so the far side confirms its mapping) and routed to
/// the attempt waiting on that peer, if any.
pub struct NatCoordinator {
    socket: Arc<RoutedSock>,
    local_identity: Identity,
    waiters: PunchWaiters,
}

impl NatCoordinator {
    /// Build the coordinator and spawn the inbound probe dispatcher.
    /// `probe_rx` must be the socket's punch stream, taken exactly once.
    pub fn start(
        socket: Arc<RoutedSock>,
        local_identity: Identity,
        mut probe_rx: mpsc::Receiver<(PunchProbe, SocketAddr)>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            socket,
            local_identity,
            waiters: Arc::new(StdMutex::new(HashMap::new())),
        });

        let dispatcher = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some((probe, src)) = probe_rx.recv().await {
                dispatcher.handle_inbound_probe(probe, src);
            }
        });

        coordinator
    }

    fn handle_inbound_probe(&self, probe: PunchProbe, src: SocketAddr) {
        if probe.sender == self.local_identity {
            return;
        }
        trace!(peer = %probe.sender.short(), addr = %src, "punch probe received");

        // Confirm our mapping toward the sender.
        let reply = PunchProbe::new(self.local_identity);
        if let Err(e) = self.socket.try_send_raw(&reply.to_bytes(), src) {
            trace!(error = %e, "punch reply send failed");
        }

        let waiter = {
            let guard = match self.waiters.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            guard.get(&probe.sender).cloned()
        };
        if let Some(tx) = waiter {
            let _ = tx.try_send(src);
        }
    }

    /// Attempt to punch a direct mapping toward `target`.
    ///
    /// Returns the remote address the first confirming probe arrived from;
    /// the caller follows up with an identity-pinned QUIC dial to it. The
    /// signaling channel stays open afterwards as the fallback path.
    pub async fn punch(
        &self,
        target: Identity,
        local_class: NatClass,
        remote_class: NatClass,
        local_candidates: Vec<String>,
        signaling: &dyn SignalingChannel,
        punch_timeout: Duration,
        probe_interval: Duration,
        skew_tolerance: Duration,
    ) -> Result<SocketAddr, PunchError> {
        let mut phase = PunchPhase::Idle.advance(PunchEvent::Start);
        debug_assert_eq!(phase, PunchPhase::Decide);

        let decision = decide(local_class, remote_class);
        phase = phase.advance(PunchEvent::Decided(decision));
        if decision == PunchDecision::UseRelay {
            debug!(
                peer = %target.short(),
                "symmetric pair, skipping punch"
            );
            debug_assert_eq!(phase, PunchPhase::Failed);
            return Err(PunchError::SymmetricPair);
        }

        let offer = PunchOffer {
            candidates: local_candidates,
            nat_class: local_class,
        };
        let exchange_started = tokio::time::Instant::now();
        let answer: PunchAnswer = match signaling.exchange_candidates(target, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                phase = phase.advance(PunchEvent::ExchangeFailed);
                debug_assert!(phase.is_terminal());
                return Err(PunchError::ExchangeFailed(e.to_string()));
            }
        };
        let exchange_rtt = exchange_started.elapsed();
        phase = phase.advance(PunchEvent::CandidatesExchanged);
        debug_assert_eq!(phase, PunchPhase::Punching);

        let targets: Vec<SocketAddr> = answer
            .candidates
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        if targets.is_empty() {
            return Err(PunchError::NoCandidates);
        }

        let (tx, mut rx) = mpsc::channel(4);
        if let Ok(mut guard) = self.waiters.lock() {
            guard.insert(target, tx);
        }

        let window = probe_window(punch_timeout, exchange_rtt, skew_tolerance);
        trace!(
            peer = %target.short(),
            rtt_ms = exchange_rtt.as_millis(),
            window_ms = window.as_millis(),
            "punch window opened"
        );
        let result = self
            .probe_until_confirmed(&targets, &mut rx, window, probe_interval)
            .await;

        if let Ok(mut guard) = self.waiters.lock() {
            guard.remove(&target);
        }

        match result {
            Some(addr) => {
                phase = phase.advance(PunchEvent::ProbeConfirmed);
                debug_assert_eq!(phase, PunchPhase::Succeeded);
                debug!(peer = %target.short(), addr = %addr, "punch confirmed");
                Ok(addr)
            }
            None => {
                let _ = phase.advance(PunchEvent::TimedOut);
                Err(PunchError::Timeout)
            }
        }
    }

    /// Answer an incoming punch request: burst probes back at the offered
    /// candidates for the same window so both mappings open. The responder
    /// has no round-trip lead to discount, only the skew widening.
    pub fn spawn_responder_burst(
        self: &Arc<Self>,
        candidates: Vec<String>,
        punch_timeout: Duration,
        probe_interval: Duration,
        skew_tolerance: Duration,
    ) {
        let coordinator = Arc::clone(self);
        let window = probe_window(punch_timeout, Duration::ZERO, skew_tolerance);
        tokio::spawn(async move {
            let targets: Vec<SocketAddr> =
                candidates.iter().filter_map(|a| a.parse().ok()).collect();
            if targets.is_empty() {
                return;
            }
            let deadline = tokio::time::Instant::now() + window;
            let mut interval = tokio::time::interval(probe_interval);
            while tokio::time::Instant::now() < deadline {
                interval.tick().await;
                coordinator.send_burst(&targets);
            }
        });
    }

    async fn probe_until_confirmed(
        &self,
        targets: &[SocketAddr],
        rx: &mut mpsc::Receiver<SocketAddr>,
        window: Duration,
        probe_interval: Duration,
    ) -> Option<SocketAddr> {
        let deadline = tokio::time::Instant::now() + window;
        let mut interval = tokio::time::interval(probe_interval);

        loop {
            tokio::select! {
                confirmed = rx.recv() => {
                    return confirmed;
                }
                _ = interval.tick() => {
                    self.send_burst(targets);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return None;
                }
            }
        }
    }

    fn send_burst(&self, targets: &[SocketAddr]) {
        let probe = PunchProbe::new(self.local_identity);
        let bytes = probe.to_bytes();
        for addr in targets {
            if let Err(e) = self.socket.try_send_raw(&bytes, *addr) {
                trace!(addr = %addr, error = %e, "punch probe send failed");
            }
        }
        if !targets.is_empty() {
            trace!(count = targets.len(), "punch probe burst");
        }
    }
}

impl fmt::Debug for NatCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatCoordinator")
            .field("local_identity", &self.local_identity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_pair_short_circuits() {
        assert_eq!(
            decide(NatClass::Symmetric, NatClass::Symmetric),
            PunchDecision::UseRelay
        );

        let phase = PunchPhase::Idle
            .advance(PunchEvent::Start)
            .advance(PunchEvent::Decided(PunchDecision::UseRelay));
        assert_eq!(phase, PunchPhase::Failed);
    }

    #[test]
    fn every_non_symmetric_pairing_attempts() {
        let classes = [
            NatClass::None,
            NatClass::FullCone,
            NatClass::RestrictedCone,
            NatClass::Symmetric,
            NatClass::Unknown,
        ];
        for local in classes {
            for remote in classes {
                let expected = if local == NatClass::Symmetric && remote == NatClass::Symmetric {
                    PunchDecision::UseRelay
                } else {
                    PunchDecision::Attempt
                };
                assert_eq!(decide(local, remote), expected, "{local} vs {remote}");
            }
        }
    }

    #[test]
    fn happy_path_phase_order() {
        let mut phase = PunchPhase::Idle;
        phase = phase.advance(PunchEvent::Start);
        assert_eq!(phase, PunchPhase::Decide);
        phase = phase.advance(PunchEvent::Decided(PunchDecision::Attempt));
        assert_eq!(phase, PunchPhase::Exchanging);
        phase = phase.advance(PunchEvent::CandidatesExchanged);
        assert_eq!(phase, PunchPhase::Punching);
        phase = phase.advance(PunchEvent::ProbeConfirmed);
        assert_eq!(phase, PunchPhase::Succeeded);
        assert!(phase.is_terminal());
    }

    #[test]
    fn terminal_phases_absorb_events() {
        for terminal in [PunchPhase::Succeeded, PunchPhase::Failed] {
            for event in [
                PunchEvent::Start,
                PunchEvent::CandidatesExchanged,
                PunchEvent::ProbeConfirmed,
                PunchEvent::TimedOut,
            ] {
                assert_eq!(terminal.advance(event), terminal);
            }
        }
    }

    #[test]
    fn out_of_order_events_ignored() {
        assert_eq!(
            PunchPhase::Idle.advance(PunchEvent::ProbeConfirmed),
            PunchPhase::Idle
        );
        assert_eq!(
            PunchPhase::Exchanging.advance(PunchEvent::TimedOut),
            PunchPhase::Exchanging
        );
    }

    #[test]
    fn probe_window_discounts_rtt_lead_and_widens_by_skew() {
        // Initiator: half the exchange round trip is the responder's head
        // start; the skew tolerance widens what remains.
        assert_eq!(
            probe_window(
                Duration::from_secs(5),
                Duration::from_secs(2),
                Duration::from_secs(1)
            ),
            Duration::from_secs(5)
        );
        // Responder: no lead to discount, pure widening.
        assert_eq!(
            probe_window(Duration::from_secs(5), Duration::ZERO, Duration::from_secs(1)),
            Duration::from_secs(6)
        );
        // A pathological RTT never underflows the window.
        assert_eq!(
            probe_window(
                Duration::from_secs(1),
                Duration::from_secs(10),
                Duration::from_secs(1)
            ),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn probe_round_trip() {
        let probe = PunchProbe {
            sender: Identity::from_bytes([9u8; 32]),
            nonce: 0xDEADBEEF,
        };
        let bytes = probe.to_bytes();
        assert!(PunchProbe::is_punch_probe(&bytes));
        assert_eq!(PunchProbe::from_bytes(&bytes), Some(probe));
    }

    #[test]
    fn probe_rejects_malformed() {
        assert!(PunchProbe::from_bytes(&[]).is_none());
        assert!(PunchProbe::from_bytes(b"PNCH").is_none());
        let mut wrong_magic = [0u8; PUNCH_PROBE_SIZE];
        wrong_magic[0..4].copy_from_slice(b"NOPE");
        assert!(PunchProbe::from_bytes(&wrong_magic).is_none());
    }

    #[test]
    fn classification_from_observations() {
        let local: SocketAddr = "192.168.1.5:4000".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.9:61000".parse().unwrap();
        let other: SocketAddr = "203.0.113.9:61001".parse().unwrap();

        assert_eq!(classify_from_observations(local, &[]), NatClass::Unknown);
        assert_eq!(
            classify_from_observations(local, &[local, local]),
            NatClass::None
        );
        assert_eq!(
            classify_from_observations(local, &[mapped]),
            NatClass::Unknown
        );
        assert_eq!(
            classify_from_observations(local, &[mapped, mapped]),
            NatClass::RestrictedCone
        );
        assert_eq!(
            classify_from_observations(local, &[mapped, other]),
            NatClass::Symmetric
        );
    }
}
