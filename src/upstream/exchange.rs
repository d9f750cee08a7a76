use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::upstream::server::Server;

/// The one capability workers need from the network: send a query to a
/// server, get the raw response back. Tests substitute their own.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(
        &self,
        query: &[u8],
        server: &Server,
        timeout: Duration,
    ) -> anyhow::Result<Vec<u8>>;
}

/// Plain DNS over UDP on an ephemeral socket.
pub struct UdpExchange;

#[async_trait]
impl Exchange for UdpExchange {
    async fn exchange(
        &self,
        query: &[u8],
        server: &Server,
        timeout: Duration,
    ) -> anyhow::Result<Vec<u8>> {
        let addr = server.socket_addr()?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(query, addr).await?;

        let mut buf = vec![0u8; 4096];
        let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("timeout waiting for {}", addr))??;

        if len < 2 || buf[..2] != query[..2] {
            return Err(anyhow::anyhow!("transaction id mismatch from {}", addr));
        }

        Ok(buf[..len].to_vec())
    }
}
