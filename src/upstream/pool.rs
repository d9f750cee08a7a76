use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dns::packet;
use crate::dns::types::RecordType;
use crate::upstream::exchange::Exchange;
use crate::upstream::resolver::{
    MessageResult, Registration, ResolveError, Resolver, ResolverTable,
};
use crate::upstream::server::{probe_servers, Server};
use crate::upstream::worker;

/// One question for the pool.
pub struct Message {
    pub name: String,
    pub qtype: RecordType,
}

/// A dispatched upstream query: the wire packet to send and the
/// Resolver every waiter is parked on.
pub struct Query {
    pub packet: Vec<u8>,
    pub resolver: Arc<Resolver>,
}

/// State shared between the pool handle and its workers.
pub struct PoolShared {
    pub servers: Vec<Server>,
    pub timeout: Duration,
    pub exchange: Arc<dyn Exchange>,
    pub queries: AtomicU64,
    pub exchanges: AtomicU64,
    pub exchange_failures: AtomicU64,
    pub exhausted: AtomicU64,
}

/// Fixed-size pool of workers draining a shared query queue, fanning
/// each query across the priority-ordered upstreams with staggered
/// failover, and coalescing duplicate concurrent questions.
pub struct Pool {
    shared: Arc<PoolShared>,
    table: ResolverTable,
    queue: mpsc::UnboundedSender<Query>,
}

impl Pool {
    /// Probe the candidates, keep the responders sorted by priority,
    /// and spawn `size` workers. Zero responders means the pool is
    /// unusable and the process should not start.
    pub async fn new(
        candidates: Vec<Server>,
        size: usize,
        timeout: Duration,
        exchange: Arc<dyn Exchange>,
    ) -> anyhow::Result<Pool> {
        let servers = probe_servers(candidates, exchange.clone()).await;
        if servers.is_empty() {
            anyhow::bail!("no upstream server answered the startup probe");
        }
        info!(
            "upstream pool ready: {} servers, {} workers, {}ms client timeout",
            servers.len(),
            size,
            timeout.as_millis()
        );

        let shared = Arc::new(PoolShared {
            servers,
            timeout,
            exchange,
            queries: AtomicU64::new(0),
            exchanges: AtomicU64::new(0),
            exchange_failures: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        });

        let (queue, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for id in 0..size {
            tokio::spawn(worker::run(id, shared.clone(), rx.clone()));
        }

        Ok(Pool {
            shared,
            table: ResolverTable::new(),
            queue,
        })
    }

    /// Resolve one (name, type) through the upstreams, coalescing with
    /// any identical in-flight question. Every caller receives exactly
    /// one result.
    pub async fn resolve(&self, message: Message) -> MessageResult {
        self.shared.queries.fetch_add(1, Ordering::Relaxed);
        let name = message.name.to_lowercase();
        let qtype = message.qtype.to_u16();

        match self.table.join_or_register(&name, qtype) {
            Registration::Joined(rx) => rx.await.unwrap_or_else(|_| Err(dropped_error())),
            Registration::Originating(resolver, rx) => {
                let packet = packet::build_query(rand::random(), &name, message.qtype);
                if self.queue.send(Query { packet, resolver: resolver.clone() }).is_err() {
                    // Workers are gone; latch so present and future
                    // joiners are released.
                    resolver.resolve(Err(dropped_error()));
                }
                let result = rx.await.unwrap_or_else(|_| Err(dropped_error()));
                self.table.remove(&name, qtype);
                result
            }
        }
    }

    pub fn num_upstreams(&self) -> usize {
        self.shared.servers.len()
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "servers": self.shared.servers.len(),
            "in_flight": self.table.in_flight(),
            "queries": self.shared.queries.load(Ordering::Relaxed),
            "exchanges": self.shared.exchanges.load(Ordering::Relaxed),
            "exchange_failures": self.shared.exchange_failures.load(Ordering::Relaxed),
            "exhausted": self.shared.exhausted.load(Ordering::Relaxed),
        })
    }
}

fn dropped_error() -> ResolveError {
    ResolveError {
        attempts: 0,
        detail: "query pool shut down".into(),
    }
}

/// Outcome report from the worker for one tried server.
pub struct ServerOutcome {
    pub succeeded: bool,
    pub index: usize,
}

/// Timed producer of the next server to try for one query. Emits the
/// first server immediately, then one more per stagger period, in
/// priority order. A success outcome stops emission; a terminating
/// `None` is always emitted. Failure outcomes do not reset the cadence.
pub struct ServerIter {
    pub servers: mpsc::Receiver<Option<(Server, usize)>>,
    pub outcomes: mpsc::Sender<ServerOutcome>,
}

impl ServerIter {
    pub fn start(servers: Vec<Server>, stagger: Duration) -> ServerIter {
        let (server_tx, server_rx) = mpsc::channel(1);
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<ServerOutcome>(servers.len().max(1));

        tokio::spawn(async move {
            if servers.is_empty() {
                let _ = server_tx.send(None).await;
                return;
            }
            if server_tx.send(Some((servers[0].clone(), 0))).await.is_err() {
                return;
            }

            let mut next = 1;
            loop {
                let delay = tokio::time::sleep(stagger);
                tokio::pin!(delay);
                let mut finished = false;
                loop {
                    tokio::select! {
                        _ = &mut delay => break,
                        outcome = outcome_rx.recv() => match outcome {
                            Some(outcome) if outcome.succeeded => {
                                debug!("try {} succeeded, stopping emission", outcome.index);
                                finished = true;
                                break;
                            }
                            Some(_) => continue,
                            None => {
                                finished = true;
                                break;
                            }
                        },
                    }
                }

                if finished || next >= servers.len() {
                    let _ = server_tx.send(None).await;
                    return;
                }
                if server_tx
                    .send(Some((servers[next].clone(), next)))
                    .await
                    .is_err()
                {
                    return;
                }
                next += 1;
            }
        });

        ServerIter {
            servers: server_rx,
            outcomes: outcome_tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::testing::{Behavior, MockExchange};
    use tokio::time::Instant;

    fn server(name: &str, priority: u32) -> Server {
        Server {
            name: name.into(),
            address: "192.0.2.1".into(),
            port: 53,
            priority,
        }
    }

    fn message(name: &str) -> Message {
        Message {
            name: name.into(),
            qtype: RecordType::A,
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn test_zero_probe_survivors_refuses_to_start() {
        let mock = MockExchange::new().with_failing_probes();
        let pool = Pool::new(
            vec![server("s0", 0)],
            2,
            TIMEOUT,
            Arc::new(mock),
        )
        .await;
        assert!(pool.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_pool_prefers_lowest_priority() {
        let mock = Arc::new(MockExchange::new());
        // Deliberately unsorted candidates
        let candidates = vec![server("s2", 2), server("s0", 0), server("s1", 1)];
        let pool = Pool::new(candidates, 2, TIMEOUT, mock.clone()).await.unwrap();

        let result = pool.resolve(message("example.com.")).await.unwrap();
        assert_eq!(result.server.name, "s0");
        assert_eq!(result.server.priority, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_coalesces_concurrent_queries() {
        let mock = Arc::new(
            MockExchange::new().with_default(Behavior::Respond {
                delay: Duration::from_millis(50),
            }),
        );
        let pool = Arc::new(
            Pool::new(vec![server("s0", 0)], 4, TIMEOUT, mock.clone())
                .await
                .unwrap(),
        );

        let mut calls = Vec::new();
        for _ in 0..100 {
            let pool = pool.clone();
            calls.push(tokio::spawn(async move {
                pool.resolve(message("q.example.")).await
            }));
        }

        let mut servers_seen = Vec::new();
        for call in calls {
            let result = call.await.unwrap().unwrap();
            servers_seen.push(result.server.name);
        }

        assert_eq!(mock.count_for("q.example", RecordType::A), 1);
        assert!(servers_seen.iter().all(|name| name == "s0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_queries_are_fresh_flights() {
        let mock = Arc::new(MockExchange::new());
        let pool = Pool::new(vec![server("s0", 0)], 2, TIMEOUT, mock.clone())
            .await
            .unwrap();

        assert!(pool.resolve(message("q.example.")).await.is_ok());
        assert!(pool.resolve(message("q.example.")).await.is_ok());
        // Cleanup after the first flight means the second really went
        // upstream again
        assert_eq!(mock.count_for("q.example", RecordType::A), 2);
        assert_eq!(pool.stats()["in_flight"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staggered_failover_beats_full_timeout() {
        let mock = Arc::new(
            MockExchange::new()
                .with_server("s0", Behavior::Timeout)
                .with_server("s1", Behavior::Respond {
                    delay: Duration::from_millis(10),
                }),
        );
        let pool = Pool::new(
            vec![server("s0", 0), server("s1", 1)],
            2,
            TIMEOUT,
            mock.clone(),
        )
        .await
        .unwrap();

        let started = Instant::now();
        let result = pool.resolve(message("slow.example.")).await.unwrap();
        let elapsed = started.elapsed();

        // Second server is tried at timeout/2 = 100ms and answers in
        // 10ms, well before the first server's timeout expires.
        assert_eq!(result.server.name, "s1");
        assert!(elapsed >= Duration::from_millis(100), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(160), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_upstreams_failing_errors_within_bound() {
        let mock = Arc::new(MockExchange::new().with_default(Behavior::Timeout));
        let pool = Pool::new(
            vec![server("s0", 0), server("s1", 1), server("s2", 2)],
            2,
            TIMEOUT,
            mock.clone(),
        )
        .await
        .unwrap();

        let started = Instant::now();
        let result = pool.resolve(message("dead.example.")).await;
        let elapsed = started.elapsed();

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        // timeout + (k-1) * timeout/2 = 200 + 2*100 = 400ms
        assert!(elapsed >= Duration::from_millis(400), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(460), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_refusals_advance_to_next_server() {
        let mock = Arc::new(
            MockExchange::new()
                .with_server("s0", Behavior::Refuse)
                .with_server("s1", Behavior::Refuse)
                .with_server("s2", Behavior::Respond {
                    delay: Duration::from_millis(5),
                }),
        );
        let pool = Pool::new(
            vec![server("s0", 0), server("s1", 1), server("s2", 2)],
            2,
            TIMEOUT,
            mock.clone(),
        )
        .await
        .unwrap();

        let result = pool.resolve(message("bounce.example.")).await.unwrap();
        assert_eq!(result.server.name, "s2");
    }
}
