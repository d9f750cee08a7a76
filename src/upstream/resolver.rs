use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::dns::packet::DnsPacket;
use crate::upstream::server::Server;

/// A successful upstream answer and the server it came from.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub message: DnsPacket,
    pub server: Server,
}

/// All upstreams failed for one query. Cloneable so one failure can be
/// broadcast to every waiter.
#[derive(Debug, Clone)]
pub struct ResolveError {
    pub attempts: usize,
    pub detail: String,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no upstream answered after {} attempts: {}",
            self.attempts, self.detail
        )
    }
}

impl std::error::Error for ResolveError {}

pub type MessageResult = Result<Resolved, ResolveError>;

/// One in-flight upstream query. The first result latches; every
/// present and future waiter receives exactly that result, exactly
/// once, and delivery never blocks the resolving side.
pub struct Resolver {
    state: Mutex<ResolverState>,
}

struct ResolverState {
    result: Option<MessageResult>,
    waiters: Vec<oneshot::Sender<MessageResult>>,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver {
            state: Mutex::new(ResolverState {
                result: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Register a waiter. A latched result is delivered immediately.
    pub fn subscribe(&self) -> oneshot::Receiver<MessageResult> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        match &state.result {
            Some(result) => {
                let _ = tx.send(result.clone());
            }
            None => state.waiters.push(tx),
        }
        rx
    }

    /// Latch the result and fan it out. Later calls are discarded; the
    /// first response wins.
    pub fn resolve(&self, result: MessageResult) {
        let mut state = self.state.lock();
        if state.result.is_some() {
            return;
        }
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        state.result = Some(result);
    }
}

/// Two-level map of in-flight queries: name -> type -> Resolver. Gives
/// single-flight semantics: the first caller for a (name, type) becomes
/// the originator, everyone else joins its Resolver.
pub struct ResolverTable {
    names: RwLock<HashMap<String, Arc<DomainResolvers>>>,
}

pub struct DomainResolvers {
    by_type: Mutex<HashMap<u16, Arc<Resolver>>>,
}

pub enum Registration {
    /// An in-flight query exists; await its result.
    Joined(oneshot::Receiver<MessageResult>),
    /// This caller created the entry and must dispatch the query.
    Originating(Arc<Resolver>, oneshot::Receiver<MessageResult>),
}

impl ResolverTable {
    pub fn new() -> Self {
        ResolverTable {
            names: RwLock::new(HashMap::new()),
        }
    }

    pub fn join_or_register(&self, name: &str, qtype: u16) -> Registration {
        // Fast path: join an existing resolver under the read lock.
        if let Some(domain) = self.names.read().get(name) {
            if let Some(resolver) = domain.by_type.lock().get(&qtype) {
                return Registration::Joined(resolver.subscribe());
            }
        }

        // Re-check under the write lock, then create. The outer lock is
        // held across the inner insert so a concurrent cleanup cannot
        // orphan the new entry.
        let mut names = self.names.write();
        let domain = names
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(DomainResolvers {
                    by_type: Mutex::new(HashMap::with_capacity(1)),
                })
            })
            .clone();
        let mut by_type = domain.by_type.lock();
        if let Some(resolver) = by_type.get(&qtype) {
            return Registration::Joined(resolver.subscribe());
        }
        let resolver = Arc::new(Resolver::new());
        let rx = resolver.subscribe();
        by_type.insert(qtype, resolver.clone());
        Registration::Originating(resolver, rx)
    }

    /// Remove a completed entry; the name level goes too once empty.
    /// Called by the originating waiter only.
    pub fn remove(&self, name: &str, qtype: u16) {
        let mut names = self.names.write();
        if let Some(domain) = names.get(name) {
            let mut by_type = domain.by_type.lock();
            by_type.remove(&qtype);
            let empty = by_type.is_empty();
            drop(by_type);
            if empty {
                names.remove(name);
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.names
            .read()
            .values()
            .map(|domain| domain.by_type.lock().len())
            .sum()
    }
}
