//! # Address Lifecycle Store
//!
//! Tracks every known self-address through the lifecycle
//! `Candidate → Validating → Reachable/Unreachable → Published → Renewing
//! → Discarded`, serializing all mutations through one actor so concurrent
//! verifications of the same address can never race to different terminal
//! states.
//!
//! Every transition emits an [`AddrEvent`]; the directory client's
//! republish task subscribes and reacts to publishable-set changes.
//! Addresses not reconfirmed within their TTL are discarded. A discarded
//! address that reappears via a new discovery event re-enters as a fresh
//! `Candidate` with no history, so one bad probe cannot poison an address
//! forever.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Maximum addresses tracked.
/// SECURITY: Bounds store size against discovery spam.
pub const MAX_TRACKED_ADDRS: usize = 1024;

/// Capacity of the transition event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// States, Sources, Priority
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrState {
    Candidate,
    Validating,
    Reachable,
    Unreachable,
    Published,
    Renewing,
    Discarded,
}

/// How an address was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSource {
    /// Asserted by the operator in configuration.
    OperatorConfigured,
    /// Enumerated from local interfaces.
    SelfObserved,
    /// Reflected back by a trusted third party (relay binding response).
    ExternallyObserved,
    /// Claimed by another peer ("I see you from X").
    PeerObserved,
    /// Advertised on our behalf by the configured relay.
    RelayAdvertised,
}

/// How an address came to be verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMethod {
    Operator,
    DialBack,
    ThirdPartyEcho,
    Corroboration,
    RelayGuaranteed,
}

/// Publish-ordering priority. Higher is announced first.
pub fn priority(method: Option<VerifyMethod>) -> u8 {
    match method {
        Some(VerifyMethod::Operator) => 100,
        Some(VerifyMethod::DialBack) => 80,
        Some(VerifyMethod::ThirdPartyEcho) => 60,
        Some(VerifyMethod::Corroboration) => 55,
        Some(VerifyMethod::RelayGuaranteed) => 40,
        None => 10,
    }
}

// ============================================================================
// Pure Transition Function
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrInput {
    VerifyStarted,
    VerifySucceeded,
    /// `exhausted` is true once the failure budget is spent.
    VerifyFailed { exhausted: bool },
    Announced,
    RenewalDue,
    TtlExpired,
}

/// Single source of truth for lifecycle ordering. Inputs that make no
/// sense in the current state leave it unchanged; `Discarded` absorbs
/// everything (re-entry happens as a brand-new entry, not a transition).
pub fn transition(state: AddrState, input: AddrInput) -> AddrState {
    use AddrInput::*;
    use AddrState::*;
    match (state, input) {
        (Candidate, VerifyStarted) => Validating,
        (Candidate, VerifySucceeded) => Reachable,
        (Validating, VerifySucceeded) => Reachable,
        (Validating, VerifyFailed { exhausted: false }) => Unreachable,
        (Validating, VerifyFailed { exhausted: true }) => Discarded,
        (Unreachable, VerifyStarted) => Validating,
        (Unreachable, VerifySucceeded) => Reachable,
        (Reachable, Announced) => Published,
        (Reachable, VerifyFailed { exhausted: false }) => Unreachable,
        (Reachable, VerifyFailed { exhausted: true }) => Discarded,
        (Published, RenewalDue) => Renewing,
        (Published, VerifyFailed { exhausted: false }) => Unreachable,
        (Published, VerifyFailed { exhausted: true }) => Discarded,
        (Renewing, VerifySucceeded) => Published,
        (Renewing, VerifyFailed { exhausted: false }) => Unreachable,
        (Renewing, VerifyFailed { exhausted: true }) => Discarded,
        (_, TtlExpired) => Discarded,
        (s, _) => s,
    }
}

// ============================================================================
// Entries and Events
// ============================================================================

#[derive(Debug, Clone)]
pub struct AddrEntry {
    pub addr: SocketAddr,
    pub source: AddrSource,
    pub state: AddrState,
    pub verify_method: Option<VerifyMethod>,
    pub failures: u32,
    pub discovered_at: Instant,
    pub last_confirmed: Instant,
}

impl AddrEntry {
    pub fn priority(&self) -> u8 {
        priority(self.verify_method)
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone)]
pub struct AddrEvent {
    pub addr: SocketAddr,
    pub from: AddrState,
    pub to: AddrState,
}

impl AddrEvent {
    /// Whether this transition can change the announce payload.
    pub fn affects_publishable_set(&self) -> bool {
        let publishable = |s: AddrState| matches!(s, AddrState::Reachable | AddrState::Published);
        publishable(self.from) != publishable(self.to)
            || (self.from == AddrState::Candidate && self.to == AddrState::Reachable)
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    AddCandidate {
        addr: SocketAddr,
        source: AddrSource,
    },
    AddOperator {
        addr: SocketAddr,
    },
    MarkValidating {
        addr: SocketAddr,
    },
    MarkVerified {
        addr: SocketAddr,
        method: VerifyMethod,
        reply: oneshot::Sender<Option<u8>>,
    },
    MarkUnreachable {
        addr: SocketAddr,
    },
    MarkPublished {
        addrs: Vec<SocketAddr>,
    },
    ListPublishable {
        reply: oneshot::Sender<Vec<AddrEntry>>,
    },
    Snapshot {
        addr: SocketAddr,
        reply: oneshot::Sender<Option<AddrEntry>>,
    },
    Quit,
}

/// Cheap-to-clone handle to the lifecycle store actor.
#[derive(Clone)]
pub struct AddrStore {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<AddrEvent>,
}

impl AddrStore {
    pub fn new(ttl: Duration, tick: Duration, max_failures: u32) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let actor = Actor {
            entries: LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_ADDRS).unwrap_or(NonZeroUsize::MIN),
            ),
            events: events.clone(),
            ttl,
            max_failures,
        };
        tokio::spawn(actor.run(rx, tick));
        Self { tx, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AddrEvent> {
        self.events.subscribe()
    }

    pub async fn add_candidate(&self, addr: SocketAddr, source: AddrSource) {
        let _ = self.tx.send(Command::AddCandidate { addr, source }).await;
    }

    /// Operator-asserted addresses skip verification and enter `Reachable`
    /// at the highest priority tier.
    pub async fn add_operator(&self, addr: SocketAddr) {
        let _ = self.tx.send(Command::AddOperator { addr }).await;
    }

    pub async fn mark_validating(&self, addr: SocketAddr) {
        let _ = self.tx.send(Command::MarkValidating { addr }).await;
    }

    /// Returns the priority score, or `None` if the address is unknown or
    /// the transition was not applicable.
    pub async fn mark_verified(&self, addr: SocketAddr, method: VerifyMethod) -> Option<u8> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::MarkVerified { addr, method, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn mark_unreachable(&self, addr: SocketAddr) {
        let _ = self.tx.send(Command::MarkUnreachable { addr }).await;
    }

    /// Record that an announce carrying these addresses succeeded.
    pub async fn mark_published(&self, addrs: Vec<SocketAddr>) {
        let _ = self.tx.send(Command::MarkPublished { addrs }).await;
    }

    /// Only `Reachable`/`Published` entries, highest priority first.
    pub async fn list_publishable(&self) -> Vec<AddrEntry> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::ListPublishable { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn snapshot(&self, addr: SocketAddr) -> Option<AddrEntry> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Snapshot { addr, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Quit).await;
    }
}

impl std::fmt::Debug for AddrStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrStore").finish_non_exhaustive()
    }
}

struct Actor {
    entries: LruCache<SocketAddr, AddrEntry>,
    events: broadcast::Sender<AddrEvent>,
    ttl: Duration,
    max_failures: u32,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.tick().await;

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => break,
                        Some(cmd) => self.handle(cmd),
                    }
                }
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
        debug!("address store actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AddCandidate { addr, source } => {
                if self.entries.contains(&addr) {
                    // Known and alive: a rediscovery refreshes nothing by
                    // itself, verification does.
                    trace!(addr = %addr, "candidate already tracked");
                    return;
                }
                let now = Instant::now();
                self.entries.put(
                    addr,
                    AddrEntry {
                        addr,
                        source,
                        state: AddrState::Candidate,
                        verify_method: None,
                        failures: 0,
                        discovered_at: now,
                        last_confirmed: now,
                    },
                );
                debug!(addr = %addr, source = ?source, "candidate address added");
            }
            Command::AddOperator { addr } => {
                let now = Instant::now();
                self.entries.put(
                    addr,
                    AddrEntry {
                        addr,
                        source: AddrSource::OperatorConfigured,
                        state: AddrState::Reachable,
                        verify_method: Some(VerifyMethod::Operator),
                        failures: 0,
                        discovered_at: now,
                        last_confirmed: now,
                    },
                );
                self.emit(addr, AddrState::Candidate, AddrState::Reachable);
            }
            Command::MarkValidating { addr } => {
                self.apply(addr, AddrInput::VerifyStarted, None);
            }
            Command::MarkVerified { addr, method, reply } => {
                let score = self.apply(addr, AddrInput::VerifySucceeded, Some(method));
                let _ = reply.send(score);
            }
            Command::MarkUnreachable { addr } => {
                let exhausted = self
                    .entries
                    .peek(&addr)
                    .map(|e| e.failures + 1 >= self.max_failures)
                    .unwrap_or(false);
                self.apply(addr, AddrInput::VerifyFailed { exhausted }, None);
            }
            Command::MarkPublished { addrs } => {
                for addr in addrs {
                    self.apply(addr, AddrInput::Announced, None);
                }
            }
            Command::ListPublishable { reply } => {
                let mut publishable: Vec<AddrEntry> = self
                    .entries
                    .iter()
                    .filter(|(_, e)| {
                        matches!(e.state, AddrState::Reachable | AddrState::Published)
                    })
                    .map(|(_, e)| e.clone())
                    .collect();
                publishable.sort_by(|a, b| b.priority().cmp(&a.priority()));
                let _ = reply.send(publishable);
            }
            Command::Snapshot { addr, reply } => {
                let _ = reply.send(self.entries.peek(&addr).cloned());
            }
            Command::Quit => {}
        }
    }

    /// Apply one lifecycle input; returns the new priority on a transition
    /// into `Reachable`/`Published`, and drops discarded entries so a later
    /// rediscovery starts from scratch.
    fn apply(
        &mut self,
        addr: SocketAddr,
        input: AddrInput,
        method: Option<VerifyMethod>,
    ) -> Option<u8> {
        let entry = self.entries.get_mut(&addr)?;
        let old = entry.state;
        let new = transition(old, input);
        if new == old {
            trace!(addr = %addr, state = ?old, input = ?input, "lifecycle input ignored");
            return None;
        }

        entry.state = new;
        match input {
            AddrInput::VerifySucceeded => {
                entry.failures = 0;
                entry.last_confirmed = Instant::now();
                if let Some(m) = method {
                    entry.verify_method = Some(m);
                }
            }
            AddrInput::VerifyFailed { .. } => {
                entry.failures += 1;
            }
            _ => {}
        }
        let score = entry.priority();
        debug!(addr = %addr, from = ?old, to = ?new, "address transition");

        if new == AddrState::Discarded {
            self.entries.pop(&addr);
        }
        self.emit(addr, old, new);

        matches!(new, AddrState::Reachable | AddrState::Published).then_some(score)
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let renewal_due = self.ttl / 2;

        let mut expired = Vec::new();
        let mut renewals = Vec::new();
        for (addr, entry) in self.entries.iter() {
            let age = now.duration_since(entry.last_confirmed);
            if age >= self.ttl {
                expired.push(*addr);
            } else if entry.state == AddrState::Published && age >= renewal_due {
                renewals.push(*addr);
            }
        }

        for addr in renewals {
            self.apply(addr, AddrInput::RenewalDue, None);
        }
        for addr in expired {
            warn!(addr = %addr, "address TTL expired");
            self.apply(addr, AddrInput::TtlExpired, None);
        }
    }

    fn emit(&self, addr: SocketAddr, from: AddrState, to: AddrState) {
        // Lagging or absent subscribers are fine.
        let _ = self.events.send(AddrEvent { addr, from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("203.0.113.{n}:4433").parse().unwrap()
    }

    #[test]
    fn transition_happy_path() {
        let mut s = AddrState::Candidate;
        s = transition(s, AddrInput::VerifyStarted);
        assert_eq!(s, AddrState::Validating);
        s = transition(s, AddrInput::VerifySucceeded);
        assert_eq!(s, AddrState::Reachable);
        s = transition(s, AddrInput::Announced);
        assert_eq!(s, AddrState::Published);
        s = transition(s, AddrInput::RenewalDue);
        assert_eq!(s, AddrState::Renewing);
        s = transition(s, AddrInput::VerifySucceeded);
        assert_eq!(s, AddrState::Published);
    }

    #[test]
    fn transition_failure_paths() {
        assert_eq!(
            transition(AddrState::Validating, AddrInput::VerifyFailed { exhausted: false }),
            AddrState::Unreachable
        );
        assert_eq!(
            transition(AddrState::Validating, AddrInput::VerifyFailed { exhausted: true }),
            AddrState::Discarded
        );
        assert_eq!(
            transition(AddrState::Unreachable, AddrInput::VerifyStarted),
            AddrState::Validating
        );
        assert_eq!(
            transition(AddrState::Published, AddrInput::TtlExpired),
            AddrState::Discarded
        );
    }

    #[test]
    fn nonsense_inputs_ignored() {
        assert_eq!(
            transition(AddrState::Candidate, AddrInput::Announced),
            AddrState::Candidate
        );
        assert_eq!(
            transition(AddrState::Unreachable, AddrInput::Announced),
            AddrState::Unreachable
        );
        assert_eq!(
            transition(AddrState::Discarded, AddrInput::VerifySucceeded),
            AddrState::Discarded
        );
    }

    #[test]
    fn priority_ordering_matches_policy() {
        assert!(priority(Some(VerifyMethod::Operator)) > priority(Some(VerifyMethod::DialBack)));
        assert!(
            priority(Some(VerifyMethod::DialBack)) > priority(Some(VerifyMethod::ThirdPartyEcho))
        );
        assert!(
            priority(Some(VerifyMethod::ThirdPartyEcho))
                > priority(Some(VerifyMethod::RelayGuaranteed))
        );
        assert!(priority(Some(VerifyMethod::RelayGuaranteed)) > priority(None));
    }

    #[tokio::test]
    async fn candidates_are_not_publishable() {
        let store = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        store.add_candidate(addr(1), AddrSource::PeerObserved).await;
        assert!(store.list_publishable().await.is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn verified_address_becomes_publishable() {
        let store = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        store
            .add_candidate(addr(1), AddrSource::ExternallyObserved)
            .await;
        store.mark_validating(addr(1)).await;
        let score = store
            .mark_verified(addr(1), VerifyMethod::ThirdPartyEcho)
            .await;
        assert_eq!(score, Some(60));

        let publishable = store.list_publishable().await;
        assert_eq!(publishable.len(), 1);
        assert_eq!(publishable[0].state, AddrState::Reachable);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn publishable_ordered_by_priority() {
        let store = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        store
            .add_candidate(addr(1), AddrSource::ExternallyObserved)
            .await;
        store
            .mark_verified(addr(1), VerifyMethod::ThirdPartyEcho)
            .await;
        store.add_operator(addr(2)).await;

        let publishable = store.list_publishable().await;
        assert_eq!(publishable.len(), 2);
        assert_eq!(publishable[0].addr, addr(2));
        assert_eq!(publishable[0].verify_method, Some(VerifyMethod::Operator));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_failures_discard_and_rediscovery_is_fresh() {
        let store = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 2);
        store
            .add_candidate(addr(1), AddrSource::PeerObserved)
            .await;
        store.mark_validating(addr(1)).await;
        store.mark_unreachable(addr(1)).await;
        // Back into validating, then a second failure exhausts the budget.
        store.mark_validating(addr(1)).await;
        store.mark_unreachable(addr(1)).await;
        assert!(store.snapshot(addr(1)).await.is_none());

        // Rediscovery starts over with no failure history.
        store
            .add_candidate(addr(1), AddrSource::PeerObserved)
            .await;
        let entry = store.snapshot(addr(1)).await.unwrap();
        assert_eq!(entry.state, AddrState::Candidate);
        assert_eq!(entry.failures, 0);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn transitions_emit_events() {
        let store = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        let mut events = store.subscribe();
        store
            .add_candidate(addr(1), AddrSource::ExternallyObserved)
            .await;
        store
            .mark_verified(addr(1), VerifyMethod::ThirdPartyEcho)
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.addr, addr(1));
        assert_eq!(event.to, AddrState::Reachable);
        assert!(event.affects_publishable_set());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn ttl_expiry_discards() {
        let store = AddrStore::new(Duration::from_millis(50), Duration::from_millis(20), 3);
        store
            .add_candidate(addr(1), AddrSource::ExternallyObserved)
            .await;
        store
            .mark_verified(addr(1), VerifyMethod::ThirdPartyEcho)
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.list_publishable().await.is_empty());
        store.shutdown().await;
    }
}
