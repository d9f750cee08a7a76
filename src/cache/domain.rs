use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::cache::record_set::RecordSet;
use crate::dns::types::RecordType;

/// All cached record sets for one owner name. `expires` is the furthest
/// expiry of any contained set and only ever moves forward.
pub struct Domain {
    inner: RwLock<DomainInner>,
}

struct DomainInner {
    records: HashMap<RecordType, Arc<RecordSet>>,
    expires: Instant,
}

impl Domain {
    pub fn new(now: Instant) -> Self {
        Domain {
            inner: RwLock::new(DomainInner {
                records: HashMap::with_capacity(1),
                expires: now,
            }),
        }
    }

    pub fn get(&self, rtype: RecordType) -> Option<Arc<RecordSet>> {
        self.inner.read().records.get(&rtype).cloned()
    }

    /// Bind a set for `rtype`, raising the domain expiry to cover it.
    pub fn set(&self, rtype: RecordType, set: Arc<RecordSet>) {
        let set_expires = set.expires();
        let mut inner = self.inner.write();
        inner.records.insert(rtype, set);
        if inner.expires < set_expires {
            inner.expires = set_expires;
        }
    }

    pub fn delete(&self, rtype: RecordType) {
        self.inner.write().records.remove(&rtype);
    }

    pub fn expires(&self) -> Instant {
        self.inner.read().expires
    }

    /// Raise the domain expiry after records were appended to an
    /// already-bound set.
    pub fn raise_expires(&self, expires: Instant) {
        let mut inner = self.inner.write();
        if inner.expires < expires {
            inner.expires = expires;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expires_covers_every_set() {
        let now = Instant::now();
        let domain = Domain::new(now);

        let short = Arc::new(RecordSet::new(true, now + Duration::from_secs(30)));
        let long = Arc::new(RecordSet::new(true, now + Duration::from_secs(600)));
        domain.set(RecordType::A, short);
        domain.set(RecordType::AAAA, long);

        assert!(domain.expires() >= now + Duration::from_secs(600));
    }

    #[test]
    fn test_delete_removes_only_that_type() {
        let now = Instant::now();
        let domain = Domain::new(now);
        domain.set(RecordType::A, Arc::new(RecordSet::new(true, now)));
        domain.set(RecordType::CNAME, Arc::new(RecordSet::new(true, now)));

        domain.delete(RecordType::A);
        assert!(domain.get(RecordType::A).is_none());
        assert!(domain.get(RecordType::CNAME).is_some());
    }
}
