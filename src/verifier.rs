//! # Reachability Verifier
//!
//! Decides when a candidate self-address is trustworthy enough to publish.
//! The policy is fixed and two-tiered:
//!
//! - An **externally echoed** address (a binding response from the
//!   configured relay, STUN-style) is verified on its own. The echo
//!   mechanism is itself a third-party attestation, and requiring more
//!   would deadlock a node that has no verified peers yet.
//! - A **peer-observed** address (another peer claims "I see you from X")
//!   is never sufficient alone. It needs either corroboration from a
//!   configurable number of independent peers, or confirmation by an
//!   active dial-back probe through an already-connected peer.
//!
//! The corroboration ledger counts distinct reporter identities per
//! address, bounded by an LRU so hostile peers cannot grow it unboundedly.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::addrstore::{AddrSource, AddrStore, VerifyMethod};
use crate::identity::Identity;

/// Maximum addresses with pending corroboration state.
/// SECURITY: Bounds ledger size against observation spam.
const MAX_PENDING_OBSERVATIONS: usize = 256;

/// Maximum distinct reporters remembered per address.
const MAX_REPORTERS_PER_ADDR: usize = 32;

enum Command {
    Echo {
        addr: SocketAddr,
    },
    PeerObservation {
        addr: SocketAddr,
        reporter: Identity,
    },
    DialBackResult {
        addr: SocketAddr,
        reachable: bool,
    },
    PendingReporters {
        addr: SocketAddr,
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

/// Handle to the verifier actor.
#[derive(Clone)]
pub struct Verifier {
    tx: mpsc::Sender<Command>,
}

impl Verifier {
    pub fn new(store: AddrStore, corroboration_count: usize) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = Actor {
            store,
            corroboration_count,
            pending: LruCache::new(
                NonZeroUsize::new(MAX_PENDING_OBSERVATIONS).unwrap_or(NonZeroUsize::MIN),
            ),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// A trusted third party echoed this as our address. Verified alone.
    pub async fn report_echo(&self, addr: SocketAddr) {
        let _ = self.tx.send(Command::Echo { addr }).await;
    }

    /// A peer claims to see us at `addr`. Counts toward corroboration,
    /// never verifies alone.
    pub async fn report_peer_observation(&self, addr: SocketAddr, reporter: Identity) {
        let _ = self
            .tx
            .send(Command::PeerObservation { addr, reporter })
            .await;
    }

    /// Outcome of an active dial-back probe requested from a connected peer.
    pub async fn report_dialback(&self, addr: SocketAddr, reachable: bool) {
        let _ = self
            .tx
            .send(Command::DialBackResult { addr, reachable })
            .await;
    }

    /// Distinct reporters currently recorded for `addr` (test hook).
    pub async fn pending_reporters(&self, addr: SocketAddr) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::PendingReporters { addr, reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Quit).await;
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier").finish_non_exhaustive()
    }
}

struct Actor {
    store: AddrStore,
    corroboration_count: usize,
    pending: LruCache<SocketAddr, HashSet<Identity>>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Echo { addr } => {
                    self.store
                        .add_candidate(addr, AddrSource::ExternallyObserved)
                        .await;
                    let score = self
                        .store
                        .mark_verified(addr, VerifyMethod::ThirdPartyEcho)
                        .await;
                    debug!(addr = %addr, score = ?score, "echo-verified address");
                    self.pending.pop(&addr);
                }
                Command::PeerObservation { addr, reporter } => {
                    self.store
                        .add_candidate(addr, AddrSource::PeerObserved)
                        .await;

                    let reporters = self
                        .pending
                        .get_or_insert_mut(addr, HashSet::new);
                    if reporters.len() < MAX_REPORTERS_PER_ADDR {
                        reporters.insert(reporter);
                    }
                    let count = reporters.len();
                    trace!(
                        addr = %addr,
                        reporter = %reporter.short(),
                        count = count,
                        "peer observation recorded"
                    );

                    if count >= self.corroboration_count {
                        let score = self
                            .store
                            .mark_verified(addr, VerifyMethod::Corroboration)
                            .await;
                        debug!(addr = %addr, score = ?score, "corroborated address");
                        self.pending.pop(&addr);
                    }
                }
                Command::DialBackResult { addr, reachable } => {
                    if reachable {
                        let score = self.store.mark_verified(addr, VerifyMethod::DialBack).await;
                        debug!(addr = %addr, score = ?score, "dial-back verified address");
                        self.pending.pop(&addr);
                    } else {
                        self.store.mark_unreachable(addr).await;
                    }
                }
                Command::PendingReporters { addr, reply } => {
                    let count = self.pending.peek(&addr).map(|s| s.len()).unwrap_or(0);
                    let _ = reply.send(count);
                }
                Command::Quit => break,
            }
        }
        debug!("verifier actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrstore::AddrState;
    use std::time::Duration;

    fn addr(n: u8) -> SocketAddr {
        format!("203.0.113.{n}:4000").parse().unwrap()
    }

    fn id(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    async fn store() -> AddrStore {
        AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3)
    }

    #[tokio::test]
    async fn echo_verifies_alone() {
        let store = store().await;
        let verifier = Verifier::new(store.clone(), 2);

        verifier.report_echo(addr(1)).await;
        // Let the actor drain.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entry = store.snapshot(addr(1)).await.unwrap();
        assert_eq!(entry.state, AddrState::Reachable);
        assert_eq!(entry.verify_method, Some(VerifyMethod::ThirdPartyEcho));
        verifier.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn single_peer_observation_is_not_enough() {
        let store = store().await;
        let verifier = Verifier::new(store.clone(), 2);

        verifier.report_peer_observation(addr(1), id(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entry = store.snapshot(addr(1)).await.unwrap();
        assert_eq!(entry.state, AddrState::Candidate);
        assert_eq!(verifier.pending_reporters(addr(1)).await, 1);
        verifier.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_reporter_does_not_corroborate() {
        let store = store().await;
        let verifier = Verifier::new(store.clone(), 2);

        verifier.report_peer_observation(addr(1), id(1)).await;
        verifier.report_peer_observation(addr(1), id(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entry = store.snapshot(addr(1)).await.unwrap();
        assert_eq!(entry.state, AddrState::Candidate);
        assert_eq!(verifier.pending_reporters(addr(1)).await, 1);
        verifier.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn two_independent_reporters_corroborate() {
        let store = store().await;
        let verifier = Verifier::new(store.clone(), 2);

        verifier.report_peer_observation(addr(1), id(1)).await;
        verifier.report_peer_observation(addr(1), id(2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entry = store.snapshot(addr(1)).await.unwrap();
        assert_eq!(entry.state, AddrState::Reachable);
        assert_eq!(entry.verify_method, Some(VerifyMethod::Corroboration));
        verifier.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn dialback_confirms_single_observation() {
        let store = store().await;
        let verifier = Verifier::new(store.clone(), 2);

        verifier.report_peer_observation(addr(1), id(1)).await;
        verifier.report_dialback(addr(1), true).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entry = store.snapshot(addr(1)).await.unwrap();
        assert_eq!(entry.state, AddrState::Reachable);
        assert_eq!(entry.verify_method, Some(VerifyMethod::DialBack));
        verifier.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn failed_dialback_marks_unreachable() {
        let store = store().await;
        let verifier = Verifier::new(store.clone(), 2);

        verifier.report_peer_observation(addr(1), id(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.mark_validating(addr(1)).await;
        verifier.report_dialback(addr(1), false).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entry = store.snapshot(addr(1)).await.unwrap();
        assert_eq!(entry.state, AddrState::Unreachable);
        verifier.shutdown().await;
        store.shutdown().await;
    }
}
