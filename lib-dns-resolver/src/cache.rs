//! The sharded response cache.
//!
//! Entries are whole encoded responses keyed by query fingerprint.  The
//! cache is a fixed power-of-two array of shards, each an ordinary map
//! behind its own read/write lock; the shard index is the low bits of the
//! fingerprint, so operations on distinct fingerprints contend only when
//! they collide on a shard, and operations on the same fingerprint are
//! linearized by its shard's lock.
//!
//! With serve-stale enabled, an entry past its TTL but within the stale
//! window is still returned - and counted as a miss, so the caller knows to
//! refresh it.  Past the stale window the entry is invisible and waits for
//! the cleanup task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;

use dns_types::protocol::types::*;

use crate::enrich::ThreatSignal;
use crate::events::{Broadcaster, Event, EventKind};
use crate::util::types::TaskHandle;

pub const DEFAULT_SHARD_COUNT: usize = 256;
pub const DEFAULT_SHARD_CAPACITY: usize = 512;
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of shards; rounded up to a power of two.
    pub shard_count: usize,
    /// Entries per shard before insertion evicts the entry closest to
    /// expiry.
    pub shard_capacity: usize,
    /// Whether entries past their TTL may still be served.
    pub serve_stale: bool,
    /// How far past expiry an entry may still be served.
    pub max_stale: Duration,
    /// How often the background cleanup wakes.
    pub cleanup_interval: Duration,
    /// Whether to publish hit/miss events, which dominate event throughput.
    pub emit_hit_miss: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            shard_capacity: DEFAULT_SHARD_CAPACITY,
            serve_stale: false,
            max_stale: Duration::from_secs(1800),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            emit_hit_miss: false,
        }
    }
}

/// Whether the cached response was DNSSEC-validated.  This server does not
/// validate, so entries it creates are `Unvalidated`; the field is carried
/// for upstream-validated data and the control plane.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DnssecStatus {
    Unvalidated,
    Validated,
    Bogus,
}

/// Threat-intelligence verdict buckets, derived from the score.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Reputation {
    Benign,
    Suspicious,
    Malicious,
}

impl Reputation {
    /// The score thresholds are part of the contract: above 80 is
    /// malicious, 51 to 80 is suspicious, everything else benign.
    pub fn from_score(score: u8) -> Self {
        match score {
            81.. => Reputation::Malicious,
            51..=80 => Reputation::Suspicious,
            _ => Reputation::Benign,
        }
    }
}

/// A cached response.  The cache owns its entries; consumers get clones.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: u64,
    pub wire_bytes: Vec<u8>,
    pub original_ttl: u32,
    pub expires_at: Instant,
    pub qname: DomainName,
    pub qtype: QueryType,
    pub qclass: QueryClass,
    pub dnssec_status: DnssecStatus,
    pub hit_count: u64,
    pub threat_score: u8,
    pub reputation: Reputation,
    pub categories: Vec<String>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
}

impl CacheEntry {
    pub fn new(
        fingerprint: u64,
        question: &Question,
        wire_bytes: Vec<u8>,
        ttl: u32,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            fingerprint,
            wire_bytes,
            original_ttl: ttl,
            expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
            qname: question.name.clone(),
            qtype: question.qtype,
            qclass: question.qclass,
            dnssec_status: DnssecStatus::Unvalidated,
            hit_count: 0,
            threat_score: 0,
            reputation: Reputation::Benign,
            categories: Vec::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Stamp the enrichment verdict onto the entry, before it becomes
    /// visible in the cache.
    pub fn apply_threat(&mut self, signal: &ThreatSignal) {
        self.threat_score = signal.score.min(100);
        self.reputation = Reputation::from_score(self.threat_score);
        self.categories = signal.categories.clone();
    }
}

/// A cache hit, fresh or stale.  A stale hit has already been counted as a
/// miss: the caller should serve it and refresh the entry.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Fresh(CacheEntry),
    Stale(CacheEntry),
}

impl CacheLookup {
    pub fn entry(self) -> CacheEntry {
        match self {
            CacheLookup::Fresh(entry) | CacheLookup::Stale(entry) => entry,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, CacheLookup::Stale(_))
    }
}

/// What to remove in a `flush`.
#[derive(Debug, Clone)]
pub enum FlushScope {
    All,
    Domain {
        name: DomainName,
        include_subdomains: bool,
    },
    RecordType(RecordType),
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FlushOutcome {
    pub removed: usize,
    pub bytes_freed: usize,
}

/// A point-in-time view of the cache counters and contents.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_serves: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub entries: usize,
    pub wire_bytes: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_serves: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

type Shard = RwLock<HashMap<u64, CacheEntry>>;

/// A convenience wrapper around the cache which lets it be shared between
/// tasks.  Invoking `clone` gives a new handle to the same cache.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    shards: Vec<Shard>,
    shard_mask: u64,
    config: CacheConfig,
    broadcaster: Broadcaster,
    counters: Counters,
}

impl SharedCache {
    pub fn new(config: CacheConfig, broadcaster: Broadcaster) -> Self {
        let shard_count = config.shard_count.max(1).next_power_of_two();
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(RwLock::new(HashMap::new()));
        }

        Self {
            inner: Arc::new(CacheInner {
                shards,
                shard_mask: shard_count as u64 - 1,
                config,
                broadcaster,
                counters: Counters::default(),
            }),
        }
    }

    fn shard(&self, fingerprint: u64) -> &Shard {
        &self.inner.shards[(fingerprint & self.inner.shard_mask) as usize]
    }

    /// Look up a fingerprint.
    ///
    /// Returns `Fresh` for an unexpired entry, `Stale` for an expired entry
    /// still within the stale window (serve-stale only), and `None`
    /// otherwise.  Stale lookups count as misses so that refresh logic and
    /// monitoring see them as such.
    pub fn get(&self, fingerprint: u64) -> Option<CacheLookup> {
        let now = Instant::now();
        let config = &self.inner.config;

        let mut shard = self.shard(fingerprint).write();
        let Some(entry) = shard.get_mut(&fingerprint) else {
            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if now <= entry.expires_at {
            entry.hit_count += 1;
            entry.last_seen = SystemTime::now();
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            let snapshot = entry.clone();
            drop(shard);

            if config.emit_hit_miss {
                self.publish(EventKind::Hit, snapshot.qname.clone(), "fresh");
            }
            Some(CacheLookup::Fresh(snapshot))
        } else if config.serve_stale && now <= entry.expires_at + config.max_stale {
            entry.hit_count += 1;
            entry.last_seen = SystemTime::now();
            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.inner
                .counters
                .stale_serves
                .fetch_add(1, Ordering::Relaxed);
            let snapshot = entry.clone();
            drop(shard);

            if config.emit_hit_miss {
                self.publish(EventKind::Miss, snapshot.qname.clone(), "stale");
            }
            Some(CacheLookup::Stale(snapshot))
        } else {
            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store or overwrite an entry.  If the shard is full, the resident
    /// entry closest to expiry is evicted to make room.
    pub fn set(&self, entry: CacheEntry) {
        let fingerprint = entry.fingerprint;
        let qname = entry.qname.clone();
        let mut evicted_qname = None;

        {
            let mut shard = self.shard(fingerprint).write();

            if !shard.contains_key(&fingerprint)
                && shard.len() >= self.inner.config.shard_capacity
            {
                let victim = shard
                    .iter()
                    .min_by_key(|(_, candidate)| candidate.expires_at)
                    .map(|(fp, _)| *fp);
                if let Some(victim) = victim {
                    if let Some(old) = shard.remove(&victim) {
                        evicted_qname = Some(old.qname);
                    }
                }
            }

            shard.insert(fingerprint, entry);
        }

        self.inner.counters.insertions.fetch_add(1, Ordering::Relaxed);
        if let Some(victim_qname) = evicted_qname {
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            self.publish(EventKind::Evict, victim_qname, "shard full");
        }
        self.publish(EventKind::Store, qname, "insert");
    }

    /// Remove an entry if present.
    pub fn delete(&self, fingerprint: u64) -> bool {
        let removed = self.shard(fingerprint).write().remove(&fingerprint);
        if let Some(entry) = removed {
            self.publish(EventKind::Evict, entry.qname, "delete");
            true
        } else {
            false
        }
    }

    /// Remove everything the scope covers.
    pub fn flush(&self, scope: &FlushScope) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();

        for shard in &self.inner.shards {
            let mut shard = shard.write();
            shard.retain(|_, entry| {
                if scope_matches(scope, entry) {
                    outcome.removed += 1;
                    outcome.bytes_freed += entry.wire_bytes.len();
                    false
                } else {
                    true
                }
            });
        }

        let flush_name = match scope {
            FlushScope::Domain { name, .. } => name.clone(),
            FlushScope::All | FlushScope::RecordType(_) => DomainName::root_domain(),
        };
        self.publish(
            EventKind::Flush,
            flush_name,
            format!("{} entries", outcome.removed),
        );

        outcome
    }

    /// Collect entries matching a name (and optionally a type), for the
    /// control plane's cache inspection.
    pub fn entries_matching(
        &self,
        name: &DomainName,
        qtype: Option<QueryType>,
    ) -> Vec<CacheEntry> {
        let mut entries = Vec::new();
        self.for_each(|entry| {
            if &entry.qname == name && qtype.map_or(true, |qt| entry.qtype == qt) {
                entries.push(entry.clone());
            }
        });
        entries
    }

    /// Read-only traversal under per-shard read locks, held one shard at a
    /// time.  Monitoring only: entries may be concurrently added or removed
    /// in shards this has already passed.
    pub fn for_each<F: FnMut(&CacheEntry)>(&self, mut f: F) {
        for shard in &self.inner.shards {
            let shard = shard.read();
            for entry in shard.values() {
                f(entry);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut entries = 0;
        let mut wire_bytes = 0;
        self.for_each(|entry| {
            entries += 1;
            wire_bytes += entry.wire_bytes.len();
        });

        CacheStats {
            hits: self.inner.counters.hits.load(Ordering::Relaxed),
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
            stale_serves: self.inner.counters.stale_serves.load(Ordering::Relaxed),
            insertions: self.inner.counters.insertions.load(Ordering::Relaxed),
            evictions: self.inner.counters.evictions.load(Ordering::Relaxed),
            entries,
            wire_bytes,
        }
    }

    /// One cleanup sweep: remove entries past their TTL (plus the stale
    /// window, when serve-stale is on).  Yields between shards so readers
    /// are not starved during a large sweep.
    pub async fn cleanup_expired(&self) -> usize {
        let grace = if self.inner.config.serve_stale {
            self.inner.config.max_stale
        } else {
            Duration::ZERO
        };

        let mut removed_total = 0;
        for shard in &self.inner.shards {
            let mut removed = Vec::new();
            {
                let now = Instant::now();
                let mut shard = shard.write();
                shard.retain(|_, entry| {
                    if now > entry.expires_at + grace {
                        removed.push(entry.qname.clone());
                        false
                    } else {
                        true
                    }
                });
            }

            removed_total += removed.len();
            for qname in removed {
                self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                self.publish(EventKind::Evict, qname, "expired");
            }

            tokio::task::yield_now().await;
        }

        removed_total
    }

    /// Launch the periodic cleanup task.
    pub fn spawn_cleanup(&self) -> TaskHandle {
        let cache = self.clone();
        let interval = self.inner.config.cleanup_interval;

        TaskHandle::spawn(move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    () = tokio::time::sleep(interval) => {
                        let removed = cache.cleanup_expired().await;
                        if removed > 0 {
                            tracing::debug!(%removed, "cache cleanup");
                        }
                    }
                }
            }
        })
    }

    fn publish(&self, kind: EventKind, qname: DomainName, reason: impl Into<String>) {
        self.inner
            .broadcaster
            .publish(Event::new(kind, qname, reason));
    }
}

fn scope_matches(scope: &FlushScope, entry: &CacheEntry) -> bool {
    match scope {
        FlushScope::All => true,
        FlushScope::Domain {
            name,
            include_subdomains,
        } => &entry.qname == name || (*include_subdomains && entry.qname.is_subdomain_of(name)),
        FlushScope::RecordType(rtype) => entry.qtype == QueryType::Record(*rtype),
    }
}
