mod cache;
mod config;
mod dns;
mod handler;
mod kv;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::dns::packet::{self, Reply};
use crate::dns::types::ResponseCode;
use crate::handler::QueryHandler;
use crate::kv::KvMirror;
use crate::upstream::{Pool, UdpExchange};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tanuki_dns=info".into()),
        )
        .init();

    info!("tanuki-dns v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tanuki-dns.toml".to_string());
    let config = Config::load(&config_path)?;
    info!("config loaded from {}", config_path);

    let cache = Arc::new(Cache::new(config.cache.max_domains));

    let candidates = config.upstreams.iter().map(|u| u.to_server()).collect();
    let pool = Arc::new(
        Pool::new(
            candidates,
            config.pool.workers,
            Duration::from_millis(config.pool.timeout_ms),
            Arc::new(UdpExchange),
        )
        .await?,
    );

    info!("forwarding to {} upstream resolvers", pool.num_upstreams());

    let kv = if config.kv.enabled {
        info!("external kv mirror enabled at {}", config.kv.address);
        Some(Arc::new(KvMirror::new(
            &config.kv.address,
            &config.kv.basis,
            Duration::from_millis(config.kv.timeout_ms),
        )))
    } else {
        None
    };

    let handler = QueryHandler::new(cache.clone(), pool.clone(), kv);

    if config.stats.enabled {
        let cache = cache.clone();
        let pool = pool.clone();
        let handler = handler.clone();
        let interval = Duration::from_secs(config.stats.report_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                info!(
                    "stats cache={} pool={} handler={}",
                    cache.stats(),
                    pool.stats(),
                    handler.stats()
                );
            }
        });
    }

    let bind_addr = format!("{}:{}", config.listen.address, config.listen.port);
    let socket = Arc::new(UdpSocket::bind(&bind_addr).await?);
    info!("tanuki-dns listening on {} (UDP)", bind_addr);

    let mut buf = vec![0u8; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let request = buf[..len].to_vec();
                let socket = socket.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Some(response) = serve_packet(&handler, &request).await {
                        if let Err(e) = socket.send_to(&response, peer).await {
                            warn!("failed to send response to {}: {}", peer, e);
                        }
                    }
                });
            }
            Err(e) => error!("UDP recv error: {}", e),
        }
    }
}

/// Decode one client packet, run it through the handler, encode the
/// reply. Unparseable packets and questionless messages are dropped.
async fn serve_packet(handler: &QueryHandler, request: &[u8]) -> Option<Vec<u8>> {
    let request = match packet::parse_packet(request) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("dropping unparseable query: {}", e);
            return None;
        }
    };
    let question = request.questions.first()?.clone();
    let id = request.header.id;

    if request.header.opcode != 0 {
        return Some(Reply::status(id, question, true, ResponseCode::NotImp).encode());
    }

    debug!(
        "searching for {} with record type {}",
        question.name,
        question.qtype.name()
    );

    match handler.handle(&question.name, question.qtype).await {
        Ok(resolution) => Some(
            Reply {
                id,
                question,
                response: true,
                recursion_desired: request.header.rd,
                authenticated: resolution.authenticated,
                rcode: ResponseCode::NoError,
                answers: resolution.answers,
                authorities: resolution.authorities,
                additionals: resolution.additionals,
            }
            .encode(),
        ),
        Err(_) => Some(Reply::status(id, question, false, ResponseCode::NxDomain).encode()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::types::RecordType;
    use crate::upstream::testing::MockExchange;

    async fn build_handler() -> QueryHandler {
        let cache = Arc::new(Cache::new(64));
        let pool = Pool::new(
            vec![crate::upstream::Server {
                name: "mock".into(),
                address: "192.0.2.1".into(),
                port: 53,
                priority: 0,
            }],
            2,
            Duration::from_millis(200),
            Arc::new(MockExchange::new()),
        )
        .await
        .unwrap();
        QueryHandler::new(cache, Arc::new(pool), None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_packet_success() {
        let handler = build_handler().await;
        let query = packet::build_query(0x4242, "example.com.", RecordType::A);

        let response = serve_packet(&handler, &query).await.unwrap();
        let parsed = packet::parse_packet(&response).unwrap();
        assert_eq!(parsed.header.id, 0x4242);
        assert!(parsed.header.qr);
        assert!(parsed.header.ra);
        assert_eq!(parsed.header.rcode, ResponseCode::NoError);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.questions[0].name, "example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_packet_non_query_opcode() {
        let handler = build_handler().await;
        let mut query = packet::build_query(0x0101, "example.com.", RecordType::A);
        // Opcode STATUS (2) in bits 11-14 of the flags word
        query[2] |= 2 << 3;

        let response = serve_packet(&handler, &query).await.unwrap();
        let parsed = packet::parse_packet(&response).unwrap();
        assert_eq!(parsed.header.rcode, ResponseCode::NotImp);
        assert!(parsed.header.qr);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_packet_garbage_is_dropped() {
        let handler = build_handler().await;
        assert!(serve_packet(&handler, &[0x13, 0x37]).await.is_none());
    }
}
