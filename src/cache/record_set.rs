use std::time::Instant;

use parking_lot::RwLock;

use crate::dns::packet::DnsRecord;

/// One cached resource record with its absolute expiry.
pub struct Record {
    pub rr: DnsRecord,
    pub expires: Instant,
}

/// Records sharing owner name and type. `expires` tracks the furthest
/// expiry of any contained record; the set is dead once `expires` has
/// passed. Carries its own lock so readers of one type never contend
/// with writers of another.
pub struct RecordSet {
    inner: RwLock<RecordSetInner>,
}

struct RecordSetInner {
    records: Vec<Record>,
    expires: Instant,
    authoritative: bool,
}

impl RecordSet {
    /// A fresh, empty set. `authoritative` marks sets written by the
    /// client-driven path as opposed to tangent fills.
    pub fn new(authoritative: bool, now: Instant) -> Self {
        RecordSet {
            inner: RwLock::new(RecordSetInner {
                records: Vec::new(),
                expires: now,
                authoritative,
            }),
        }
    }

    pub fn add(&self, rr: DnsRecord, expires: Instant) {
        let mut inner = self.inner.write();
        if inner.expires < expires {
            inner.expires = expires;
        }
        inner.records.push(Record { rr, expires });
    }

    pub fn expires(&self) -> Instant {
        self.inner.read().expires
    }

    pub fn authoritative(&self) -> bool {
        self.inner.read().authoritative
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Drop expired records, then return the survivors with their TTL
    /// field rewritten to the remaining whole seconds.
    pub fn live_records(&self, now: Instant) -> Vec<DnsRecord> {
        let mut inner = self.inner.write();
        inner.records.retain(|record| record.expires > now);
        inner
            .records
            .iter()
            .map(|record| {
                let mut rr = record.rr.clone();
                rr.ttl = record.expires.saturating_duration_since(now).as_secs() as u32;
                rr
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::types::{DnsClass, RecordType};
    use std::time::Duration;

    fn a_record(ttl: u32) -> DnsRecord {
        DnsRecord {
            name: "example.com".into(),
            rtype: RecordType::A,
            rclass: DnsClass::IN,
            ttl,
            rdata: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_expires_tracks_max() {
        let now = Instant::now();
        let set = RecordSet::new(true, now);
        set.add(a_record(30), now + Duration::from_secs(30));
        set.add(a_record(300), now + Duration::from_secs(300));
        set.add(a_record(60), now + Duration::from_secs(60));
        assert_eq!(set.expires(), now + Duration::from_secs(300));
    }

    #[test]
    fn test_live_records_drops_expired_and_rewrites_ttl() {
        let now = Instant::now();
        let set = RecordSet::new(true, now);
        set.add(a_record(0), now);
        set.add(a_record(60), now + Duration::from_secs(60));

        let live = set.live_records(now);
        assert_eq!(live.len(), 1);
        assert!(live[0].ttl <= 60);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_fresh_set_is_already_expired() {
        let now = Instant::now();
        let set = RecordSet::new(false, now);
        assert!(set.expires() <= now);
        assert!(set.is_empty());
    }
}
