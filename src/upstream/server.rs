use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dns::packet;
use crate::dns::types::RecordType;
use crate::upstream::exchange::Exchange;

/// Well-known name used to verify that a candidate upstream actually
/// answers from this host. Some networks block UDP to public resolvers.
pub const PROBE_NAME: &str = "google.com.";
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// One configured upstream resolver. Smaller priority numbers are tried
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub priority: u32,
}

impl Server {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid upstream address {}:{}: {}", self.address, self.port, e))
    }
}

/// Probe every candidate concurrently and keep the ones that answer,
/// sorted by ascending priority.
pub async fn probe_servers(candidates: Vec<Server>, exchange: Arc<dyn Exchange>) -> Vec<Server> {
    let mut probes = Vec::with_capacity(candidates.len());
    for server in candidates {
        let exchange = exchange.clone();
        probes.push(tokio::spawn(async move {
            debug!("checking [{}]:{}...", server.address, server.port);
            let query = packet::build_query(rand::random(), PROBE_NAME, RecordType::A);
            match exchange.exchange(&query, &server, PROBE_TIMEOUT).await {
                Ok(_) => Some(server),
                Err(e) => {
                    warn!(
                        "upstream {} [{}:{}] failed startup probe: {}",
                        server.name, server.address, server.port, e
                    );
                    None
                }
            }
        }));
    }

    let mut alive = Vec::new();
    for probe in probes {
        if let Ok(Some(server)) = probe.await {
            info!(
                "resolved [{}]:{} with priority {}",
                server.address, server.port, server.priority
            );
            alive.push(server);
        }
    }

    alive.sort_by_key(|server| server.priority);
    alive
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        let server = Server {
            name: "cloudflare".into(),
            address: "1.1.1.1".into(),
            port: 53,
            priority: 0,
        };
        assert_eq!(server.socket_addr().unwrap().to_string(), "1.1.1.1:53");

        let bad = Server {
            name: "broken".into(),
            address: "not an address".into(),
            port: 53,
            priority: 0,
        };
        assert!(bad.socket_addr().is_err());
    }
}
