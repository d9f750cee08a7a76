use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::Cache;
use crate::dns::packet::DnsRecord;
use crate::dns::types::{DnsClass, RecordType, ResponseCode, TANGENT_TYPES};
use crate::kv::KvMirror;
use crate::upstream::{Message, Pool};

/// Everything the front-end needs to encode a successful reply.
pub struct Resolution {
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
    pub authenticated: bool,
}

impl Resolution {
    fn from_cache(answers: Vec<DnsRecord>) -> Self {
        Resolution {
            answers,
            authorities: Vec::new(),
            additionals: Vec::new(),
            authenticated: false,
        }
    }
}

/// TTL used for answers synthesized from the external mirror, which
/// stores bare addresses without expiry metadata.
const MIRROR_TTL: u32 = 300;

pub struct HandlerStats {
    pub requests: AtomicU64,
    pub tangent_requests: AtomicU64,
}

/// Glue between the front-end, the cache and the upstream pool:
/// cache lookup, coalesced upstream dispatch, cache fill, and tangent
/// prefetch of sibling record types.
#[derive(Clone)]
pub struct QueryHandler {
    cache: Arc<Cache>,
    pool: Arc<Pool>,
    kv: Option<Arc<KvMirror>>,
    stats: Arc<HandlerStats>,
}

impl QueryHandler {
    pub fn new(cache: Arc<Cache>, pool: Arc<Pool>, kv: Option<Arc<KvMirror>>) -> Self {
        QueryHandler {
            cache,
            pool,
            kv,
            stats: Arc::new(HandlerStats {
                requests: AtomicU64::new(0),
                tangent_requests: AtomicU64::new(0),
            }),
        }
    }

    /// Answer one question. A cache hit that is not CNAME-only is
    /// served directly; everything else goes through the pool. An
    /// upstream failure or a non-NoError rcode surfaces as an error the
    /// front-end renders as NXDOMAIN.
    pub async fn handle(&self, name: &str, qtype: RecordType) -> anyhow::Result<Resolution> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let (records, only_cname) = self.cache.get(name, qtype);
        if !records.is_empty() && !only_cname {
            debug!("{} found in local cache with {} answers", name, records.len());
            return Ok(Resolution::from_cache(records));
        }

        // Advisory external mirror, consulted for address queries only.
        if qtype == RecordType::A {
            if let Some(kv) = &self.kv {
                if let Some(value) = kv.fetch(name).await {
                    if let Some(record) = a_record_from_mirror(name, &value, MIRROR_TTL) {
                        debug!("{} found in external kv as {}", name, value);
                        return Ok(Resolution::from_cache(vec![record]));
                    }
                }
            }
        }

        let result = self
            .pool
            .resolve(Message {
                name: name.to_string(),
                qtype,
            })
            .await;

        // Tangent prefetches run regardless of how this query went.
        self.spawn_tangents(name, qtype);

        let resolved = match result {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!("{} (T:{}) failed upstream: {}", name, qtype.name(), e);
                return Err(anyhow::anyhow!("nxdomain"));
            }
        };

        info!(
            "{} (T:{}) found in {} (P:{}) with {} answers",
            name,
            qtype.name(),
            resolved.server.name,
            resolved.server.priority,
            resolved.message.answers.len()
        );

        if resolved.message.header.rcode != ResponseCode::NoError {
            return Err(anyhow::anyhow!("nxdomain"));
        }

        if !resolved.message.answers.is_empty() {
            let cache = self.cache.clone();
            let answers = resolved.message.answers.clone();
            let owner = name.to_string();
            tokio::spawn(async move {
                cache.set(&owner, &answers, false);
            });

            if qtype == RecordType::A {
                self.spawn_kv_fill(name, &resolved.message.answers);
            }
        }

        Ok(Resolution {
            answers: resolved.message.answers,
            authorities: resolved.message.authorities,
            additionals: resolved.message.additionals,
            authenticated: resolved.message.header.ad,
        })
    }

    /// Opportunistically fetch the sibling record types so the next
    /// question for this name is already cached. Never blocks the
    /// reply; fills are marked tangent so they cannot clobber the
    /// client-driven answer.
    fn spawn_tangents(&self, name: &str, qtype: RecordType) {
        for tangent_type in TANGENT_TYPES {
            if tangent_type == qtype {
                continue;
            }
            let handler = self.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                handler.tangent(name, tangent_type).await;
            });
        }
    }

    async fn tangent(&self, name: String, qtype: RecordType) {
        self.stats.tangent_requests.fetch_add(1, Ordering::Relaxed);

        let (records, only_cname) = self.cache.get(&name, qtype);
        if !records.is_empty() && !only_cname {
            return;
        }

        match self
            .pool
            .resolve(Message {
                name: name.clone(),
                qtype,
            })
            .await
        {
            Ok(resolved)
                if resolved.message.header.rcode == ResponseCode::NoError
                    && !resolved.message.answers.is_empty() =>
            {
                debug!(
                    "tangent {} (T:{}) found in {} with {} answers",
                    name,
                    qtype.name(),
                    resolved.server.name,
                    resolved.message.answers.len()
                );
                self.cache.set(&name, &resolved.message.answers, true);
            }
            _ => {}
        }
    }

    /// Mirror the first A answer into the external KV (spawned,
    /// advisory).
    fn spawn_kv_fill(&self, name: &str, answers: &[DnsRecord]) {
        let Some(kv) = &self.kv else { return };
        let Some(a_record) = answers
            .iter()
            .find(|rr| rr.rtype == RecordType::A && rr.rdata.len() == 4)
        else {
            return;
        };

        let kv = kv.clone();
        let name = name.to_string();
        let value = format!(
            "{}.{}.{}.{}",
            a_record.rdata[0], a_record.rdata[1], a_record.rdata[2], a_record.rdata[3]
        );
        let ttl = a_record.ttl;
        tokio::spawn(async move {
            kv.store_a(&name, ttl, &value).await;
        });
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": self.stats.requests.load(Ordering::Relaxed),
            "tangent_requests": self.stats.tangent_requests.load(Ordering::Relaxed),
        })
    }
}

/// Synthesize an A record from a KV-mirrored address string.
pub(crate) fn a_record_from_mirror(name: &str, value: &str, ttl: u32) -> Option<DnsRecord> {
    let addr: std::net::Ipv4Addr = value.parse().ok()?;
    Some(DnsRecord {
        name: name.to_string(),
        rtype: RecordType::A,
        rclass: DnsClass::IN,
        ttl,
        rdata: addr.octets().to_vec(),
    })
}
