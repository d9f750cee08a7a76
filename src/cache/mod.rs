mod domain;
mod record_set;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::dns::packet::DnsRecord;
use crate::dns::types::RecordType;

pub use domain::Domain;
pub use record_set::RecordSet;

/// Bounded, TTL-aware response cache keyed by (owner name, record type).
///
/// Capacity counts domains. The insertion-order sequence drives a
/// FIFO-ish eviction: a full insert first sweeps expired domains and
/// only then drops the oldest survivor. Stale order entries (re-set or
/// already-deleted names) are tolerated and filtered during sweeps.
///
/// Lock order is Cache > Domain > RecordSet; a lower lock is never held
/// while acquiring a higher one.
pub struct Cache {
    inner: RwLock<CacheInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

struct CacheInner {
    domains: HashMap<String, Arc<Domain>>,
    expire_order: VecDeque<String>,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Cache {
            inner: RwLock::new(CacheInner {
                domains: HashMap::with_capacity(capacity),
                expire_order: VecDeque::with_capacity(capacity),
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up the records answering `(name, qtype)`.
    ///
    /// The CNAME set is consulted alongside the requested type; the
    /// returned flag is true when only CNAME records were found, in
    /// which case the caller still has to resolve the original type.
    /// Returned records carry their remaining TTL in whole seconds.
    pub fn get(&self, name: &str, qtype: RecordType) -> (Vec<DnsRecord>, bool) {
        let now = Instant::now();
        let key = name.to_lowercase();

        let domain = { self.inner.read().domains.get(&key).cloned() };
        let Some(domain) = domain else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return (Vec::new(), false);
        };

        if domain.expires() <= now {
            self.sweep();
            self.misses.fetch_add(1, Ordering::Relaxed);
            return (Vec::new(), false);
        }

        let mut out = Vec::new();
        let mut cname_found = false;
        if qtype != RecordType::CNAME {
            if let Some(records) = self.consult(&domain, RecordType::CNAME, now) {
                cname_found = true;
                out.extend(records);
            }
        }

        let mut type_found = false;
        if let Some(records) = self.consult(&domain, qtype, now) {
            type_found = true;
            out.extend(records);
        }

        if out.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return (Vec::new(), false);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        (out, cname_found && !type_found)
    }

    /// One consulted record set: expired or empty sets are deleted from
    /// the domain and reported absent; live sets are cleaned first.
    fn consult(
        &self,
        domain: &Arc<Domain>,
        rtype: RecordType,
        now: Instant,
    ) -> Option<Vec<DnsRecord>> {
        let set = domain.get(rtype)?;
        if set.expires() <= now || set.is_empty() {
            domain.delete(rtype);
            return None;
        }
        let records = set.live_records(now);
        if records.is_empty() {
            domain.delete(rtype);
            return None;
        }
        Some(records)
    }

    /// Insert or update the records for `name`, grouped by type. Every
    /// type present in the call replaces that type's prior set
    /// atomically; types not mentioned are left alone.
    ///
    /// `tangent` marks an opportunistic fill: it must never replace a
    /// set that was last written by the client-driven path and is still
    /// live.
    pub fn set(&self, name: &str, records: &[DnsRecord], tangent: bool) {
        if records.is_empty() {
            return;
        }

        let now = Instant::now();
        let key = name.to_lowercase();

        let mut inner = self.inner.write();

        let (domain, created) = match inner.domains.get(&key) {
            Some(existing) => (existing.clone(), false),
            None => {
                if inner.domains.len() >= self.capacity {
                    Self::sweep_locked(&mut inner, now);
                    if inner.domains.len() >= self.capacity {
                        self.evict_first(&mut inner);
                    }
                }
                (Arc::new(Domain::new(now)), true)
            }
        };

        // Types already replaced within this call keep appending;
        // tangent-vetoed types are skipped wholesale.
        let mut fresh: HashMap<RecordType, Arc<RecordSet>> = HashMap::new();
        let mut vetoed: HashSet<RecordType> = HashSet::new();
        let mut wrote = false;

        for rr in records {
            let rtype = rr.rtype;
            if vetoed.contains(&rtype) {
                continue;
            }

            let set = match fresh.get(&rtype) {
                Some(set) => set.clone(),
                None => {
                    if tangent {
                        if let Some(existing) = domain.get(rtype) {
                            if existing.authoritative() && existing.expires() > now {
                                debug!(
                                    "tangent fill for {} {} vetoed by live authoritative set",
                                    key,
                                    rtype.name()
                                );
                                vetoed.insert(rtype);
                                continue;
                            }
                        }
                    }
                    let set = Arc::new(RecordSet::new(!tangent, now));
                    domain.set(rtype, set.clone());
                    fresh.insert(rtype, set.clone());
                    set
                }
            };

            let expires = now + Duration::from_secs(rr.ttl as u64);
            set.add(rr.clone(), expires);
            domain.raise_expires(set.expires());
            wrote = true;
        }

        if !wrote && !created {
            return;
        }

        inner.expire_order.push_back(key.clone());
        inner.domains.insert(key, domain);
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// One pass over the order sequence, dropping names whose domain is
    /// missing or expired and compacting survivors in place. O(N).
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        Self::sweep_locked(&mut inner, now);
    }

    fn sweep_locked(inner: &mut CacheInner, now: Instant) {
        let CacheInner {
            domains,
            expire_order,
        } = inner;
        expire_order.retain(|name| {
            let live = match domains.get(name) {
                None => return false,
                Some(domain) => domain.expires() > now,
            };
            if !live {
                domains.remove(name);
                return false;
            }
            true
        });
    }

    /// FIFO eviction: drop the domain at the head of the order
    /// sequence, skipping stale entries.
    fn evict_first(&self, inner: &mut CacheInner) {
        while let Some(name) = inner.expire_order.pop_front() {
            if inner.domains.remove(&name).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("cache full, evicted {}", name);
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().domains.len()
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "capacity": self.capacity,
            "domains": self.len(),
            "hits": self.hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
            "insertions": self.insertions.load(Ordering::Relaxed),
            "evictions": self.evictions.load(Ordering::Relaxed),
        })
    }
}
