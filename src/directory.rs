//! # Directory Client
//!
//! Publishes this node's signed [`PeerRecord`] to the authoritative record
//! store and resolves other peers' records from it. The store itself is an
//! injected [`DirectoryStore`] trait object — eventually consistent Put/Get
//! is the whole contract, how records are replicated behind it is not this
//! crate's concern.
//!
//! The one invariant everything else leans on: **an announce payload may
//! only ever contain addresses whose lifecycle state is `Reachable` or
//! `Published`**. Publishing an unverified address poisons every future
//! connection attempt against it, so [`build_publish_set`] re-validates
//! the set even though the lifecycle store already filters.
//!
//! Failed announces retry with exponential backoff (1s base, ×2, capped at
//! 30s, 5 attempts, ±20% jitter) and re-arm on the next republish trigger
//! after exhaustion. Republish fires on publishable-set change, at 50% of
//! record TTL, and on an explicit network-change signal.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, trace, warn};

use crate::addrstore::{AddrEntry, AddrState, AddrStore};
use crate::config::Config;
use crate::identity::{Identity, Keypair, PeerRecord, now_ms};
use crate::nat::NatClass;

/// Resolved records remembered for sequence-monotonicity enforcement.
const MAX_HELD_RECORDS: usize = 1024;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// An address outside `Reachable`/`Published` reached the announce
    /// path. This is a caller bug, never retried.
    Unpublishable { addr: String, state: String },
    /// The store refused the record; retried with backoff.
    Rejected { reason: String },
    /// The retry budget is spent. Re-armed on the next republish trigger.
    Exhausted { attempts: u32, last_reason: String },
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Unpublishable { addr, state } => {
                write!(f, "refusing to announce {addr} in lifecycle state {state}")
            }
            PublishError::Rejected { reason } => write!(f, "directory rejected announce: {reason}"),
            PublishError::Exhausted { attempts, last_reason } => {
                write!(f, "announce failed after {attempts} attempts: {last_reason}")
            }
        }
    }
}

impl std::error::Error for PublishError {}

// ============================================================================
// Store Interface
// ============================================================================

/// Authoritative record store boundary: idempotent, eventually consistent
/// Put/Get keyed by identity bytes.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn put(&self, key: [u8; 32], record: PeerRecord) -> Result<()>;
    async fn get(&self, key: [u8; 32]) -> Result<Option<PeerRecord>>;
}

/// In-process store for tests and single-process deployments. Keeps only
/// the highest sequence number per key; a lower-seq put is a no-op, which
/// is what makes put idempotent under replays.
pub struct MemoryDirectory {
    records: Mutex<LruCache<[u8; 32], PeerRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_HELD_RECORDS).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn put(&self, key: [u8; 32], record: PeerRecord) -> Result<()> {
        record.verify()?;
        if record.identity.as_bytes() != &key {
            anyhow::bail!("record identity does not match key");
        }
        let mut records = self.records.lock().await;
        match records.peek(&key) {
            Some(held) if held.seq >= record.seq => {}
            _ => {
                records.put(key, record);
            }
        }
        Ok(())
    }

    async fn get(&self, key: [u8; 32]) -> Result<Option<PeerRecord>> {
        let mut records = self.records.lock().await;
        Ok(records.get(&key).cloned())
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff with jitter for announce retries.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub attempts: u32,
}

impl AnnounceBackoff {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config.announce_backoff_base,
            cap: config.announce_backoff_cap,
            attempts: config.announce_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base × 2^attempt`,
    /// capped, with ±20% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        exp.mul_f64(jitter)
    }
}

// ============================================================================
// Announce Set Validation
// ============================================================================

/// Validate and order the addresses an announce may carry.
///
/// Rejects any entry outside `Reachable`/`Published` instead of silently
/// dropping it: an unpublishable entry here means lifecycle filtering was
/// bypassed somewhere, and that must surface, not be papered over.
pub fn build_publish_set(entries: &[AddrEntry]) -> Result<Vec<String>, PublishError> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.state {
            AddrState::Reachable | AddrState::Published => {
                let addr = entry.addr.to_string();
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
            other => {
                return Err(PublishError::Unpublishable {
                    addr: entry.addr.to_string(),
                    state: format!("{other:?}"),
                });
            }
        }
    }
    Ok(out)
}

// ============================================================================
// Client
// ============================================================================

pub struct DirectoryClient {
    keypair: Arc<Keypair>,
    store: Arc<dyn DirectoryStore>,
    addrs: AddrStore,
    seq: AtomicU64,
    held: Mutex<LruCache<Identity, PeerRecord>>,
    backoff: AnnounceBackoff,
    relay_addrs: Vec<String>,
    nat_class: Arc<std::sync::RwLock<NatClass>>,
    record_max_age: Duration,
    record_skew_tolerance: Duration,
    resolve_timeout: Duration,
    record_ttl: Duration,
}

impl DirectoryClient {
    pub fn new(
        keypair: Arc<Keypair>,
        store: Arc<dyn DirectoryStore>,
        addrs: AddrStore,
        relay_addrs: Vec<String>,
        nat_class: Arc<std::sync::RwLock<NatClass>>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            keypair,
            store,
            addrs,
            // Seeded from wall-clock millis: a restarted node with a
            // persisted keypair keeps publishing strictly higher sequence
            // numbers, so stores and consumers holding its old records
            // accept the fresh ones instead of waiting out record_max_age.
            seq: AtomicU64::new(now_ms()),
            held: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_HELD_RECORDS).unwrap_or(NonZeroUsize::MIN),
            )),
            backoff: AnnounceBackoff::from_config(config),
            relay_addrs,
            nat_class,
            record_max_age: config.record_max_age,
            record_skew_tolerance: config.record_skew_tolerance,
            resolve_timeout: config.resolve_timeout,
            record_ttl: config.record_ttl,
        })
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    fn current_nat_class(&self) -> NatClass {
        self.nat_class.read().map(|c| *c).unwrap_or_default()
    }

    /// Publish the current publishable address set as a freshly sequenced,
    /// signed record. Retries with backoff; exhaustion is reported, never
    /// fatal — the node keeps operating on its stale published record.
    pub async fn announce(&self) -> Result<(), PublishError> {
        let entries = self.addrs.list_publishable().await;
        let direct_addrs = build_publish_set(&entries)?;
        if direct_addrs.is_empty() && self.relay_addrs.is_empty() {
            trace!("nothing publishable, skipping announce");
            return Ok(());
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = PeerRecord::new_signed(
            &self.keypair,
            direct_addrs.clone(),
            self.relay_addrs.clone(),
            self.current_nat_class(),
            Vec::new(),
            seq,
        );
        let key = *record.identity.as_bytes();

        let mut last_reason = String::new();
        for attempt in 0..self.backoff.attempts {
            match self.store.put(key, record.clone()).await {
                Ok(()) => {
                    info!(seq = seq, addrs = direct_addrs.len(), "record announced");
                    let published: Vec<_> =
                        direct_addrs.iter().filter_map(|a| a.parse().ok()).collect();
                    self.addrs.mark_published(published).await;
                    return Ok(());
                }
                Err(e) => {
                    last_reason = e.to_string();
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_reason,
                        "announce rejected, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(PublishError::Exhausted {
            attempts: self.backoff.attempts,
            last_reason,
        })
    }

    /// Resolve a peer's record. Timeouts and store errors map to `None` —
    /// "not found" is an answer, not a failure. Returned records are
    /// signature-checked, freshness-checked, and never regress below a
    /// sequence number already held.
    pub async fn resolve(&self, target: Identity) -> Option<PeerRecord> {
        let fetched =
            match tokio::time::timeout(self.resolve_timeout, self.store.get(*target.as_bytes()))
                .await
            {
                Ok(Ok(record)) => record,
                Ok(Err(e)) => {
                    debug!(peer = %target.short(), error = %e, "directory get failed");
                    None
                }
                Err(_) => {
                    debug!(peer = %target.short(), "directory resolve timed out");
                    None
                }
            };

        let mut held = self.held.lock().await;
        if let Some(record) = fetched {
            if record.identity != target {
                warn!(peer = %target.short(), "directory returned record for wrong identity");
            } else if let Err(e) = record.verify_fresh(
                self.record_max_age.as_millis() as u64,
                self.record_skew_tolerance.as_millis() as u64,
            ) {
                debug!(peer = %target.short(), error = %e, "resolved record rejected");
            } else {
                match held.peek(&target) {
                    Some(prev) if prev.seq >= record.seq => {
                        trace!(
                            peer = %target.short(),
                            held = prev.seq,
                            fetched = record.seq,
                            "ignoring stale record"
                        );
                    }
                    _ => {
                        held.put(target, record);
                    }
                }
            }
        }
        held.peek(&target).cloned()
    }

    /// Seed the monotonicity ledger from a record learned out of band
    /// (gossip, relay address book). Same rules as a directory resolve.
    pub async fn observe_record(&self, record: PeerRecord) {
        if record
            .verify_fresh(
                self.record_max_age.as_millis() as u64,
                self.record_skew_tolerance.as_millis() as u64,
            )
            .is_err()
        {
            return;
        }
        let mut held = self.held.lock().await;
        match held.peek(&record.identity) {
            Some(prev) if prev.seq >= record.seq => {}
            _ => {
                held.put(record.identity, record);
            }
        }
    }

    /// Run the republish loop: reacts to publishable-set changes, the 50%
    /// TTL renewal timer, and explicit network-change signals.
    pub fn spawn_republish_task(
        self: &Arc<Self>,
        mut network_change: mpsc::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        let mut events = client.addrs.subscribe();
        tokio::spawn(async move {
            let mut renewal = tokio::time::interval(client.record_ttl / 2);
            renewal.tick().await;

            loop {
                let trigger = tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) if event.affects_publishable_set() => "address-change",
                        Ok(_) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => "address-change",
                        Err(_) => break,
                    },
                    _ = renewal.tick() => "renewal",
                    signal = network_change.recv() => match signal {
                        Some(()) => "network-change",
                        None => break,
                    },
                };

                debug!(trigger = trigger, "republishing record");
                if let Err(e) = client.announce().await {
                    warn!(trigger = trigger, error = %e, "republish failed");
                }
            }
            debug!("republish task stopped");
        })
    }
}

impl fmt::Debug for DirectoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryClient")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrstore::{AddrSource, VerifyMethod};

    fn keypair() -> Arc<Keypair> {
        Arc::new(Keypair::generate())
    }

    fn nat_class() -> Arc<std::sync::RwLock<NatClass>> {
        Arc::new(std::sync::RwLock::new(NatClass::Unknown))
    }

    fn entry(state: AddrState) -> AddrEntry {
        let now = std::time::Instant::now();
        AddrEntry {
            addr: "203.0.113.1:4433".parse().unwrap(),
            source: AddrSource::ExternallyObserved,
            state,
            verify_method: Some(VerifyMethod::ThirdPartyEcho),
            failures: 0,
            discovered_at: now,
            last_confirmed: now,
        }
    }

    #[test]
    fn publish_set_accepts_only_reachable_or_published() {
        assert!(build_publish_set(&[entry(AddrState::Reachable)]).is_ok());
        assert!(build_publish_set(&[entry(AddrState::Published)]).is_ok());

        for state in [
            AddrState::Candidate,
            AddrState::Validating,
            AddrState::Unreachable,
            AddrState::Renewing,
            AddrState::Discarded,
        ] {
            let result = build_publish_set(&[entry(AddrState::Reachable), entry(state)]);
            assert!(
                matches!(result, Err(PublishError::Unpublishable { .. })),
                "state {state:?} must be rejected"
            );
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = AnnounceBackoff {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            attempts: 5,
        };
        for _ in 0..50 {
            // Attempt 0: 1s ±20%.
            let d0 = backoff.delay(0);
            assert!(d0 >= Duration::from_millis(800) && d0 <= Duration::from_millis(1200));
            // Attempt 2: 4s ±20%.
            let d2 = backoff.delay(2);
            assert!(d2 >= Duration::from_millis(3200) && d2 <= Duration::from_millis(4800));
            // Deep attempts stay at the cap ±20%.
            let d9 = backoff.delay(9);
            assert!(d9 >= Duration::from_secs(24) && d9 <= Duration::from_secs(36));
        }
    }

    #[tokio::test]
    async fn memory_directory_keeps_highest_seq() {
        let store = MemoryDirectory::new();
        let kp = keypair();
        let key = *kp.identity().as_bytes();

        let r1 = PeerRecord::new_signed(&kp, vec!["203.0.113.1:1".into()], vec![], NatClass::None, vec![], 1);
        let r2 = PeerRecord::new_signed(&kp, vec!["203.0.113.1:2".into()], vec![], NatClass::None, vec![], 2);

        store.put(key, r2.clone()).await.unwrap();
        // A replayed older record is accepted but changes nothing.
        store.put(key, r1).await.unwrap();

        let held = store.get(key).await.unwrap().unwrap();
        assert_eq!(held.seq, 2);
        assert_eq!(held.direct_addrs, r2.direct_addrs);
    }

    #[tokio::test]
    async fn memory_directory_rejects_invalid_records() {
        let store = MemoryDirectory::new();
        let kp = keypair();
        let mut record =
            PeerRecord::new_signed(&kp, vec!["203.0.113.1:1".into()], vec![], NatClass::None, vec![], 1);
        record.seq = 7; // breaks the signature
        assert!(store.put(*kp.identity().as_bytes(), record).await.is_err());
    }

    #[tokio::test]
    async fn announce_increments_seq_and_marks_published() {
        let kp = keypair();
        let addrs = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        addrs.add_operator("203.0.113.5:4433".parse().unwrap()).await;

        let store = Arc::new(MemoryDirectory::new());
        let client = DirectoryClient::new(
            kp.clone(),
            store.clone(),
            addrs.clone(),
            vec![],
            nat_class(),
            &Config::default(),
        );

        let floor = now_ms();
        client.announce().await.unwrap();
        client.announce().await.unwrap();

        let record = store.get(*kp.identity().as_bytes()).await.unwrap().unwrap();
        assert!(record.seq >= floor + 2, "two announces above the time seed");

        let entry = addrs.snapshot("203.0.113.5:4433".parse().unwrap()).await.unwrap();
        assert_eq!(entry.state, AddrState::Published);
        addrs.shutdown().await;
    }

    #[tokio::test]
    async fn restarted_publisher_keeps_seq_increasing() {
        let kp = keypair();
        let addrs = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        addrs.add_operator("203.0.113.5:4433".parse().unwrap()).await;
        let store = Arc::new(MemoryDirectory::new());

        let first_run = DirectoryClient::new(
            kp.clone(),
            store.clone(),
            addrs.clone(),
            vec![],
            nat_class(),
            &Config::default(),
        );
        first_run.announce().await.unwrap();
        let before = store.get(*kp.identity().as_bytes()).await.unwrap().unwrap().seq;
        drop(first_run);

        // A restart rebuilds the client with the same keypair; its fresh
        // records must still outrank the ones the store already holds.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second_run = DirectoryClient::new(
            kp.clone(),
            store.clone(),
            addrs.clone(),
            vec![],
            nat_class(),
            &Config::default(),
        );
        second_run.announce().await.unwrap();

        let after = store.get(*kp.identity().as_bytes()).await.unwrap().unwrap();
        assert!(after.seq > before, "post-restart record must outrank");
        addrs.shutdown().await;
    }

    #[tokio::test]
    async fn reannounce_with_same_addrs_differs_only_in_seq() {
        let kp = keypair();
        let addrs = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        addrs.add_operator("203.0.113.5:4433".parse().unwrap()).await;

        let store = Arc::new(MemoryDirectory::new());
        let client = DirectoryClient::new(
            kp.clone(),
            store.clone(),
            addrs.clone(),
            vec![],
            nat_class(),
            &Config::default(),
        );

        client.announce().await.unwrap();
        let first = store.get(*kp.identity().as_bytes()).await.unwrap().unwrap();
        client.announce().await.unwrap();
        let second = store.get(*kp.identity().as_bytes()).await.unwrap().unwrap();

        assert_eq!(first.direct_addrs, second.direct_addrs);
        assert_eq!(first.seq + 1, second.seq);
        addrs.shutdown().await;
    }

    /// Store stub whose contents tests set directly, bypassing put rules.
    struct RawStore {
        record: Mutex<Option<PeerRecord>>,
    }

    #[async_trait]
    impl DirectoryStore for RawStore {
        async fn put(&self, _key: [u8; 32], record: PeerRecord) -> Result<()> {
            *self.record.lock().await = Some(record);
            Ok(())
        }
        async fn get(&self, _key: [u8; 32]) -> Result<Option<PeerRecord>> {
            Ok(self.record.lock().await.clone())
        }
    }

    #[tokio::test]
    async fn consumer_never_regresses_to_lower_seq() {
        let publisher = keypair();
        let addrs = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        let store = Arc::new(RawStore {
            record: Mutex::new(None),
        });
        let client = DirectoryClient::new(
            keypair(),
            store.clone(),
            addrs.clone(),
            vec![],
            nat_class(),
            &Config::default(),
        );

        let target = publisher.identity();
        let r2 = PeerRecord::new_signed(&publisher, vec!["203.0.113.1:2".into()], vec![], NatClass::None, vec![], 2);
        let r1 = PeerRecord::new_signed(&publisher, vec!["203.0.113.1:1".into()], vec![], NatClass::None, vec![], 1);

        *store.record.lock().await = Some(r2);
        assert_eq!(client.resolve(target).await.unwrap().seq, 2);

        // Store regresses (partition healing, replica lag); the consumer
        // must not.
        *store.record.lock().await = Some(r1);
        assert_eq!(client.resolve(target).await.unwrap().seq, 2);
        addrs.shutdown().await;
    }

    #[tokio::test]
    async fn resolve_miss_is_none_not_error() {
        let addrs = AddrStore::new(Duration::from_secs(60), Duration::from_secs(60), 3);
        let client = DirectoryClient::new(
            keypair(),
            Arc::new(MemoryDirectory::new()),
            addrs.clone(),
            vec![],
            nat_class(),
            &Config::default(),
        );
        assert!(client.resolve(Identity::from_bytes([3u8; 32])).await.is_none());
        addrs.shutdown().await;
    }
}
