//! # Resolution Cache Layer
//!
//! Non-authoritative address sources consulted, in order, before the
//! directory: (1) the most-recently-successful-connection cache, (2) the
//! realm cache of addresses learned from peers in the same isolation
//! domain. The relay's address book is the third source, queried by the
//! connection engine only after a directory miss since it needs a round
//! trip to the relay.
//!
//! Cache hits never suppress the authoritative lookup: the engine always
//! spawns a background directory resolve to refresh this layer
//! (cache-then-verify), so a stale entry can serve a fast dial without
//! blocking the consistency check.

use std::num::NonZeroUsize;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, trace};

use crate::identity::{Identity, PeerRecord};

/// Peers remembered per cache bucket.
/// SECURITY: Bounds cache size.
const MAX_CACHED_PEERS: usize = 1024;

/// Which bucket produced a cached resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    RecentSuccess,
    Realm,
}

#[derive(Debug, Clone)]
struct CachedAddrs {
    addrs: Vec<String>,
    updated: Instant,
}

pub struct CacheLayer {
    local: StdMutex<LruCache<Identity, CachedAddrs>>,
    realm: StdMutex<LruCache<Identity, CachedAddrs>>,
    max_age: Duration,
}

impl CacheLayer {
    pub fn new(max_age: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_CACHED_PEERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            local: StdMutex::new(LruCache::new(cap)),
            realm: StdMutex::new(LruCache::new(cap)),
            max_age,
        }
    }

    /// Record the address a successful connection actually used. It moves
    /// to the front of the peer's list so the next attempt dials it first.
    pub fn record_success(&self, peer: Identity, addr: String) {
        let Ok(mut local) = self.local.lock() else {
            return;
        };
        let now = Instant::now();
        match local.get_mut(&peer) {
            Some(entry) => {
                entry.addrs.retain(|a| *a != addr);
                entry.addrs.insert(0, addr);
                entry.updated = now;
            }
            None => {
                local.put(
                    peer,
                    CachedAddrs {
                        addrs: vec![addr],
                        updated: now,
                    },
                );
            }
        }
    }

    /// Addresses learned from a realm member or a refreshed record.
    pub fn learn_realm_addrs(&self, peer: Identity, addrs: Vec<String>) {
        if addrs.is_empty() {
            return;
        }
        let Ok(mut realm) = self.realm.lock() else {
            return;
        };
        realm.put(
            peer,
            CachedAddrs {
                addrs,
                updated: Instant::now(),
            },
        );
    }

    /// Fold an authoritative record back into the cache. Called by the
    /// background refresh after every directory resolve.
    pub fn apply_record(&self, record: &PeerRecord) {
        self.learn_realm_addrs(record.identity, record.all_addrs());
    }

    /// Merged view of both buckets in consultation order: recent-success
    /// addresses first, realm-learned addresses appended after them,
    /// deduplicated. The reported source is the earliest bucket that
    /// contributed. Expired entries are treated as absent.
    pub fn resolve_cached(&self, peer: Identity) -> Option<(CacheSource, Vec<String>)> {
        let local = self.fresh_bucket(&self.local, peer);
        let realm = self.fresh_bucket(&self.realm, peer);

        let source = match (&local, &realm) {
            (Some(_), _) => CacheSource::RecentSuccess,
            (None, Some(_)) => CacheSource::Realm,
            (None, None) => {
                debug!(peer = %peer.short(), "cache miss");
                return None;
            }
        };

        let mut addrs = local.unwrap_or_default();
        for addr in realm.unwrap_or_default() {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        trace!(peer = %peer.short(), source = ?source, count = addrs.len(), "cache hit");
        Some((source, addrs))
    }

    /// Drop a peer's cached entries, e.g. after every cached address
    /// failed to dial.
    pub fn invalidate(&self, peer: Identity) {
        if let Ok(mut local) = self.local.lock() {
            local.pop(&peer);
        }
        if let Ok(mut realm) = self.realm.lock() {
            realm.pop(&peer);
        }
    }

    fn fresh_bucket(
        &self,
        bucket: &StdMutex<LruCache<Identity, CachedAddrs>>,
        peer: Identity,
    ) -> Option<Vec<String>> {
        let mut guard = bucket.lock().ok()?;
        let entry = guard.get(&peer)?;
        if entry.updated.elapsed() > self.max_age || entry.addrs.is_empty() {
            return None;
        }
        Some(entry.addrs.clone())
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer").finish_non_exhaustive()
    }
}
