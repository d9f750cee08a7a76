use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Advisory mirror of resolved addresses in an external Redis-protocol
/// KV. Strictly best-effort: every call has a short timeout and the
/// first failure disables the mirror for the remainder of the process.
pub struct KvMirror {
    address: String,
    basis: String,
    timeout: Duration,
    healthy: AtomicBool,
}

impl KvMirror {
    pub fn new(address: &str, basis: &str, timeout: Duration) -> Self {
        KvMirror {
            address: address.to_string(),
            basis: basis.to_string(),
            timeout,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// GET the mirrored address for a name. Empty values count as
    /// misses.
    pub async fn fetch(&self, name: &str) -> Option<String> {
        if !self.healthy() {
            return None;
        }
        let key = self.key(name);
        match self.command(&["GET", &key]).await {
            Ok(Some(value)) if !value.is_empty() => Some(value),
            Ok(_) => None,
            Err(e) => {
                self.disable(&e);
                None
            }
        }
    }

    /// SETEX the resolved address with the answer's TTL.
    pub async fn store_a(&self, name: &str, ttl: u32, value: &str) {
        if !self.healthy() {
            return;
        }
        let key = self.key(name);
        let ttl = ttl.to_string();
        match self.command(&["SETEX", &key, &ttl, value]).await {
            Ok(_) => debug!("{} mirrored to external kv", name),
            Err(e) => self.disable(&e),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.basis, name.to_lowercase())
    }

    fn disable(&self, err: &anyhow::Error) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!("external kv disabled for the rest of this run: {}", err);
        }
    }

    async fn command(&self, args: &[&str]) -> anyhow::Result<Option<String>> {
        let exchange = async {
            let stream = TcpStream::connect(&self.address).await?;
            let mut stream = BufReader::new(stream);
            stream.write_all(&encode_command(args)).await?;
            read_reply(&mut stream).await
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow::anyhow!("kv timeout after {:?}", self.timeout))?
    }
}

/// RESP array-of-bulk-strings encoding, the request framing both
/// commands use.
fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parse one RESP reply. `None` is the null bulk string (a GET miss).
async fn read_reply<R>(reader: &mut R) -> anyhow::Result<Option<String>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let line = line.trim_end_matches(['\r', '\n']);

    match line.as_bytes().first() {
        Some(b'+') | Some(b':') => Ok(Some(line[1..].to_string())),
        Some(b'-') => Err(anyhow::anyhow!("kv error reply: {}", &line[1..])),
        Some(b'$') => {
            let len: i64 = line[1..]
                .parse()
                .map_err(|_| anyhow::anyhow!("bad kv bulk length: {}", line))?;
            if len < 0 {
                return Ok(None);
            }
            let mut buf = vec![0u8; len as usize + 2];
            reader.read_exact(&mut buf).await?;
            buf.truncate(len as usize);
            Ok(Some(String::from_utf8_lossy(&buf).to_string()))
        }
        _ => Err(anyhow::anyhow!("unexpected kv reply: {:?}", line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&["GET", "tanuki-dns:urls:example.com"]);
        assert_eq!(
            encoded,
            b"*2\r\n$3\r\nGET\r\n$27\r\ntanuki-dns:urls:example.com\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_read_reply_bulk() {
        let mut reader = BufReader::new(&b"$13\r\n93.184.216.34\r\n"[..]);
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply.as_deref(), Some("93.184.216.34"));
    }

    #[tokio::test]
    async fn test_read_reply_null_is_miss() {
        let mut reader = BufReader::new(&b"$-1\r\n"[..]);
        assert!(read_reply(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_reply_ok_and_error() {
        let mut reader = BufReader::new(&b"+OK\r\n"[..]);
        assert_eq!(read_reply(&mut reader).await.unwrap().as_deref(), Some("OK"));

        let mut reader = BufReader::new(&b"-ERR wrong number of arguments\r\n"[..]);
        assert!(read_reply(&mut reader).await.is_err());
    }
}
