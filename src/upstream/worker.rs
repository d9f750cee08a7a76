use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::dns::packet::{self, DnsPacket};
use crate::upstream::pool::{PoolShared, Query, ServerIter, ServerOutcome};
use crate::upstream::resolver::{Resolved, ResolveError};
use crate::upstream::server::Server;

/// Worker loop: drain the shared queue, resolve each query against the
/// upstreams. The receiver sits behind a mutex so the fixed worker
/// population competes for items.
pub async fn run(
    worker_id: usize,
    shared: Arc<PoolShared>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Query>>>,
) {
    loop {
        let query = { queue.lock().await.recv().await };
        let Some(query) = query else {
            debug!("worker {} shutting down", worker_id);
            return;
        };
        resolve_query(worker_id, &shared, query).await;
    }
}

/// Fan one query across the upstreams as the iterator emits them.
/// Exchanges overlap: an emitted server is tried even while earlier
/// tries are still pending, and the first success wins. Dispatched
/// exchanges are never cancelled; once a winner is delivered, late
/// results fall on a closed channel.
async fn resolve_query(worker_id: usize, shared: &Arc<PoolShared>, query: Query) {
    let ServerIter {
        servers: mut server_rx,
        outcomes: outcome_tx,
    } = ServerIter::start(shared.servers.clone(), shared.timeout / 2);

    let (done_tx, mut done_rx) =
        mpsc::unbounded_channel::<(Server, usize, anyhow::Result<DnsPacket>)>();

    let mut in_flight = 0usize;
    let mut attempts = 0usize;
    let mut exhausted = false;
    let mut last_error = String::from("no upstream servers available");

    loop {
        if exhausted && in_flight == 0 {
            shared.exhausted.fetch_add(1, Ordering::Relaxed);
            debug!(
                "worker {}: all {} upstream attempts failed: {}",
                worker_id, attempts, last_error
            );
            query.resolver.resolve(Err(ResolveError {
                attempts,
                detail: last_error,
            }));
            return;
        }

        tokio::select! {
            emitted = server_rx.recv(), if !exhausted => {
                match emitted.flatten() {
                    Some((server, index)) => {
                        attempts += 1;
                        in_flight += 1;
                        shared.exchanges.fetch_add(1, Ordering::Relaxed);
                        let exchange = shared.exchange.clone();
                        let timeout = shared.timeout;
                        let packet = query.packet.clone();
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            let result = exchange
                                .exchange(&packet, &server, timeout)
                                .await
                                .and_then(|bytes| packet::parse_packet(&bytes));
                            let _ = done.send((server, index, result));
                        });
                    }
                    None => exhausted = true,
                }
            }
            done = done_rx.recv() => {
                let Some((server, index, result)) = done else {
                    // done_tx lives on this stack frame, so the channel
                    // cannot close while we are looping.
                    continue;
                };
                match result {
                    Ok(message) => {
                        let _ = outcome_tx.send(ServerOutcome { succeeded: true, index }).await;
                        debug!(
                            "worker {}: {} answered (priority {}, try {})",
                            worker_id, server.name, server.priority, index
                        );
                        query.resolver.resolve(Ok(Resolved { message, server }));
                        return;
                    }
                    Err(e) => {
                        shared.exchange_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "worker {}: {} failed (try {}): {}",
                            worker_id, server.name, index, e
                        );
                        last_error = e.to_string();
                        in_flight -= 1;
                        let _ = outcome_tx.send(ServerOutcome { succeeded: false, index }).await;
                    }
                }
            }
        }
    }
}
