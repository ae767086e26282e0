use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{Context, Result, ensure};
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

use crate::indexer::scanner::{
    ChunkFailurePolicy, DEFAULT_CHUNK_SIZE, MAX_CHUNK_CONCURRENCY, ScanOptions,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub server: ServerConfig,
    pub chain: ChainConfig,
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub database: Option<DatabaseConfig>,
}

impl ApiConfig {
    pub fn load() -> Result<Self> {
        let configured_path = std::env::var("LILNOUNS_INDEXER_CONFIG")
            .unwrap_or_else(|_| "config/indexer.toml".to_string());
        assert!(
            !configured_path.is_empty(),
            "Configuration path must be non-empty"
        );
        assert!(
            configured_path.len() < 4096,
            "Configuration path length exceeds hard limit"
        );

        let mut builder = Config::builder()
            .add_source(File::new(&configured_path, FileFormat::Toml).required(true));

        if let Ok(env_override) = std::env::var("LILNOUNS_INDEXER_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/indexer.{}.toml", env_override);
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        let settings = builder
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;
        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize indexer configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.server.port > 0, "Server port must be greater than zero");
        ensure!(!self.chain.rpc_url.is_empty(), "RPC URL must be specified");
        self.chain.request_timeout()?;
        self.contracts.governor_address()?;
        self.contracts.data_address()?;
        self.indexer.ensure_bounds()?;

        if self.cache.backend == CacheBackend::Database {
            let database = self
                .database
                .as_ref()
                .context("The database cache backend requires a [database] section")?;
            database.ensure_bounds()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        let host = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub request_timeout_ms: Option<u64>,
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Result<Duration> {
        let millis = self.request_timeout_ms.unwrap_or(10_000);
        ensure!(millis >= 100, "RPC timeout must be at least 100ms");
        ensure!(millis <= 60_000, "RPC timeout cannot exceed 60 seconds");
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractsConfig {
    pub governor_address: String,
    pub governor_start_block: u64,
    pub data_address: String,
    pub data_start_block: u64,
    /// First block searched for votes; defaults to the governor deployment.
    pub vote_start_block: Option<u64>,
}

impl ContractsConfig {
    pub fn governor_address(&self) -> Result<Address> {
        parse_address(&self.governor_address, "governor_address")
    }

    pub fn data_address(&self) -> Result<Address> {
        parse_address(&self.data_address, "data_address")
    }

    pub fn vote_start_block(&self) -> u64 {
        self.vote_start_block.unwrap_or(self.governor_start_block)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub chunk_size: u64,
    pub freshness_threshold: u64,
    pub chunk_concurrency: usize,
    pub chunk_retries: u32,
    pub chunk_timeout_ms: u64,
    pub hold_checkpoint_on_gap: bool,
    pub block_height_ttl_ms: u64,
    pub warm_interval_ms: Option<u64>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            freshness_threshold: 100,
            chunk_concurrency: 1,
            chunk_retries: 0,
            chunk_timeout_ms: 15_000,
            hold_checkpoint_on_gap: false,
            block_height_ttl_ms: 12_000,
            warm_interval_ms: None,
        }
    }
}

impl IndexerConfig {
    pub fn ensure_bounds(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "Chunk size must be positive");
        ensure!(
            self.chunk_size <= 1_000_000,
            "Chunk size exceeds defensive limit"
        );
        ensure!(
            (1..=MAX_CHUNK_CONCURRENCY).contains(&self.chunk_concurrency),
            "Chunk concurrency must be between 1 and {MAX_CHUNK_CONCURRENCY}"
        );
        ensure!(self.chunk_retries <= 10, "Chunk retries exceed defensive limit");
        ensure!(
            self.chunk_timeout_ms >= 100,
            "Chunk timeout must be at least 100ms"
        );
        ensure!(
            self.block_height_ttl_ms <= 300_000,
            "Block height cache TTL cannot exceed five minutes"
        );
        if let Some(interval) = self.warm_interval_ms {
            ensure!(interval >= 1_000, "Warm interval must be >= 1 second");
        }
        Ok(())
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            chunk_size: self.chunk_size,
            concurrency: self.chunk_concurrency,
            failure_policy: ChunkFailurePolicy {
                retries: self.chunk_retries,
                timeout: Duration::from_millis(self.chunk_timeout_ms),
            },
        }
    }

    pub fn block_height_ttl(&self) -> Duration {
        Duration::from_millis(self.block_height_ttl_ms)
    }

    pub fn warm_interval(&self) -> Option<Duration> {
        self.warm_interval_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Database,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    fn ensure_bounds(&self) -> Result<()> {
        ensure!(!self.url.is_empty(), "Database URL must be specified");
        ensure!(
            self.max_connections >= self.min_connections.unwrap_or(1),
            "Max connections must be >= min connections"
        );
        ensure!(self.max_connections <= 128, "Connection pool oversized");
        Ok(())
    }
}

fn parse_address(value: &str, label: &str) -> Result<Address> {
    let address =
        Address::from_str(value.trim()).with_context(|| format!("Invalid {label}: {value}"))?;
    ensure!(address != Address::ZERO, "{label} must not be the zero address");
    Ok(address)
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}
