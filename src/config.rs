use serde::Deserialize;

use crate::upstream::Server;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub listen: ListenConfig,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default)]
    pub priority: u32,
}

impl UpstreamConfig {
    pub fn to_server(&self) -> Server {
        Server {
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            priority: self.priority,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Capacity in domains, not records.
    #[serde(default = "default_max_domains")]
    pub max_domains: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_domains: default_max_domains(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-upstream exchange timeout; failover staggers at half this.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            workers: default_workers(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KvConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_kv_address")]
    pub address: String,
    #[serde(default = "default_kv_basis")]
    pub basis: String,
    #[serde(default = "default_kv_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig {
            enabled: false,
            address: default_kv_address(),
            basis: default_kv_basis(),
            timeout_ms: default_kv_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            enabled: true,
            report_interval_secs: default_report_interval(),
        }
    }
}

// Default value functions
fn default_dns_port() -> u16 { 53 }
fn default_max_domains() -> usize { 10_000 }
fn default_workers() -> usize { 4 }
fn default_timeout_ms() -> u64 { 500 }
fn default_kv_address() -> String { "127.0.0.1:6379".to_string() }
fn default_kv_basis() -> String { "tanuki-dns:urls".to_string() }
fn default_kv_timeout_ms() -> u64 { 100 }
fn default_true() -> bool { true }
fn default_report_interval() -> u64 { 5 }

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))?;
        Ok(config)
    }
}
