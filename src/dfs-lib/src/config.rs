use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::keys;
use crate::{ChecksumType, DfsError, DfsResult, Endpoint, EndpointRole};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub policy_enabled: bool,
    /// "t1,n1,t2,n2,..." pairs of (window millis, retries in window).
    pub policy_spec: String,
    pub max_attempts: u32,
    pub window_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy_enabled: false,
            policy_spec: "10000,6,60000,10".to_string(),
            max_attempts: 10,
            window_base_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub max_attempts: u32,
    pub sleep_base_ms: u64,
    pub sleep_max_ms: u64,
    pub connection_retries: u32,
    pub connection_retries_on_timeouts: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            sleep_base_ms: 500,
            sleep_max_ms: 15000,
            connection_retries: 0,
            connection_retries_on_timeouts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ByteArrayManagerConfig {
    pub enabled: bool,
    pub count_threshold: u32,
    pub count_limit: u32,
    pub count_reset_time_period_ms: u64,
}

impl Default for ByteArrayManagerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count_threshold: 128,
            count_limit: 2048,
            count_reset_time_period_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    pub max_packets_in_flight: u32,
    pub exclude_nodes_cache_expiry_ms: u64,
    pub byte_array_manager: ByteArrayManagerConfig,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_packets_in_flight: 80,
            exclude_nodes_cache_expiry_ms: 10 * 60 * 1000,
            byte_array_manager: ByteArrayManagerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplaceDatanodePolicy {
    Never,
    Default,
    Always,
}

impl FromStr for ReplaceDatanodePolicy {
    type Err = DfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEVER" => Ok(ReplaceDatanodePolicy::Never),
            "DEFAULT" => Ok(ReplaceDatanodePolicy::Default),
            "ALWAYS" => Ok(ReplaceDatanodePolicy::Always),
            other => Err(DfsError::InvalidConfig(format!(
                "unknown replace-datanode-on-failure policy {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaceDatanodeOnFailureConfig {
    pub enable: bool,
    pub policy: ReplaceDatanodePolicy,
    pub best_effort: bool,
}

impl Default for ReplaceDatanodeOnFailureConfig {
    fn default() -> Self {
        Self {
            enable: true,
            policy: ReplaceDatanodePolicy::Default,
            best_effort: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockWriteConfig {
    pub retries: u32,
    pub locate_following_block_retries: u32,
    pub locate_following_block_initial_delay_ms: u64,
    pub replace_datanode_on_failure: ReplaceDatanodeOnFailureConfig,
}

impl Default for BlockWriteConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            locate_following_block_retries: 5,
            locate_following_block_initial_delay_ms: 400,
            replace_datanode_on_failure: ReplaceDatanodeOnFailureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortCircuitConfig {
    pub enabled: bool,
    pub skip_checksum: bool,
    pub buffer_size: usize,
    pub cache_size: usize,
    pub cache_expiry_ms: u64,
    pub stale_threshold_ms: u64,
    pub watcher_check_interval_ms: u64,
    /// How long a node whose domain socket failed is skipped.
    pub path_failure_backoff_ms: u64,
    /// Hosts considered co-located with this client.
    pub local_hosts: Vec<String>,
}

impl Default for ShortCircuitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            skip_checksum: false,
            buffer_size: 1024 * 1024,
            cache_size: 256,
            cache_expiry_ms: 60 * 60 * 1000,
            stale_threshold_ms: 30 * 60 * 1000,
            watcher_check_interval_ms: 60_000,
            path_failure_backoff_ms: 10 * 60 * 1000,
            local_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgedReadConfig {
    pub threshold_millis: u64,
    pub threadpool_size: usize,
}

impl Default for HedgedReadConfig {
    fn default() -> Self {
        Self {
            threshold_millis: 500,
            threadpool_size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub retry_policy_enabled: bool,
    pub retry_policy_spec: String,
    pub retry_max_attempts: u32,
    pub failover_max_attempts: u32,
    pub failover_sleep_base_ms: u64,
    pub failover_sleep_max_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry_policy_enabled: false,
            retry_policy_spec: "10000,6,60000,10".to_string(),
            retry_max_attempts: 10,
            failover_max_attempts: 15,
            failover_sleep_base_ms: 500,
            failover_sleep_max_ms: 15000,
        }
    }
}

/// Immutable client configuration, shared by reference with every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DfsClientConfig {
    /// Metadata endpoints, active first.
    pub endpoints: Vec<Endpoint>,
    pub block_size: u64,
    pub replication: u16,
    pub checksum_type: ChecksumType,
    pub bytes_per_checksum: u32,
    #[serde(alias = "packet_size")]
    pub write_packet_size: u32,
    pub socket_timeout_ms: u64,
    pub max_block_acquire_failures: u32,
    pub slow_io_warning_threshold_ms: u64,
    /// Used for co-located nodes that do not advertise their own socket path.
    pub domain_socket_path: String,
    pub retry: RetryConfig,
    pub failover: FailoverConfig,
    pub write: WriteConfig,
    pub block_write: BlockWriteConfig,
    pub short_circuit: ShortCircuitConfig,
    pub hedged_read: HedgedReadConfig,
    pub http_client: HttpClientConfig,
}

impl Default for DfsClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            block_size: 128 * 1024 * 1024,
            replication: 3,
            checksum_type: ChecksumType::Crc32c,
            bytes_per_checksum: 512,
            write_packet_size: 64 * 1024,
            socket_timeout_ms: 60_000,
            max_block_acquire_failures: 3,
            slow_io_warning_threshold_ms: 30_000,
            domain_socket_path: String::new(),
            retry: RetryConfig::default(),
            failover: FailoverConfig::default(),
            write: WriteConfig::default(),
            block_write: BlockWriteConfig::default(),
            short_circuit: ShortCircuitConfig::default(),
            hedged_read: HedgedReadConfig::default(),
            http_client: HttpClientConfig::default(),
        }
    }
}

fn read_config_file<T: DeserializeOwned>(path: &Path) -> DfsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DfsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        toml::from_str::<T>(&content)
            .map_err(|e| DfsError::InvalidConfig(format!("parse {} failed: {}", path.display(), e)))
    } else {
        serde_json::from_str::<T>(&content)
            .map_err(|e| DfsError::InvalidConfig(format!("parse {} failed: {}", path.display(), e)))
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> DfsResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| DfsError::InvalidConfig(format!("invalid value {:?} for {}: {}", value, key, e)))
}

impl DfsClientConfig {
    /// Load from a JSON file, or TOML when the extension is `.toml`.
    pub fn load(path: &Path) -> DfsResult<Self> {
        let config: DfsClientConfig = read_config_file(path)?;
        config.validate()?;
        info!(
            "loaded dfs client config from {}: {} endpoints",
            path.display(),
            config.endpoints.len()
        );
        Ok(config)
    }

    /// Build a config from flat `dfs.*` properties. Unknown keys are ignored.
    pub fn from_properties(props: &HashMap<String, String>) -> DfsResult<Self> {
        let mut config = DfsClientConfig::default();
        for (key, value) in props.iter() {
            let key = key.as_str();
            match key {
                keys::DFS_BLOCK_SIZE_KEY => config.block_size = parse_value(key, value)?,
                keys::DFS_REPLICATION_KEY => config.replication = parse_value(key, value)?,
                keys::DFS_CLIENT_WRITE_PACKET_SIZE_KEY => {
                    config.write_packet_size = parse_value(key, value)?
                }
                keys::DFS_CLIENT_SOCKET_TIMEOUT_KEY => {
                    config.socket_timeout_ms = parse_value(key, value)?
                }
                keys::DFS_CLIENT_MAX_BLOCK_ACQUIRE_FAILURES_KEY => {
                    config.max_block_acquire_failures = parse_value(key, value)?
                }
                keys::DFS_CHECKSUM_TYPE_KEY => config.checksum_type = ChecksumType::parse(value)?,
                keys::DFS_BYTES_PER_CHECKSUM_KEY => {
                    config.bytes_per_checksum = parse_value(key, value)?
                }
                keys::DFS_DOMAIN_SOCKET_PATH_KEY => config.domain_socket_path = value.clone(),
                keys::DFS_SHORT_CIRCUIT_SHARED_MEMORY_WATCHER_INTERRUPT_CHECK_MS => {
                    config.short_circuit.watcher_check_interval_ms = parse_value(key, value)?
                }
                keys::DFS_CLIENT_SLOW_IO_WARNING_THRESHOLD_KEY => {
                    config.slow_io_warning_threshold_ms = parse_value(key, value)?
                }

                keys::retry::POLICY_ENABLED_KEY => {
                    config.retry.policy_enabled = parse_value(key, value)?
                }
                keys::retry::POLICY_SPEC_KEY => config.retry.policy_spec = value.clone(),
                keys::retry::MAX_ATTEMPTS_KEY => config.retry.max_attempts = parse_value(key, value)?,
                keys::retry::WINDOW_BASE_KEY => {
                    config.retry.window_base_ms = parse_value(key, value)?
                }

                keys::failover::MAX_ATTEMPTS_KEY => {
                    config.failover.max_attempts = parse_value(key, value)?
                }
                keys::failover::SLEEPTIME_BASE_KEY => {
                    config.failover.sleep_base_ms = parse_value(key, value)?
                }
                keys::failover::SLEEPTIME_MAX_KEY => {
                    config.failover.sleep_max_ms = parse_value(key, value)?
                }
                keys::failover::CONNECTION_RETRIES_KEY => {
                    config.failover.connection_retries = parse_value(key, value)?
                }
                keys::failover::CONNECTION_RETRIES_ON_SOCKET_TIMEOUTS_KEY => {
                    config.failover.connection_retries_on_timeouts = parse_value(key, value)?
                }

                keys::write::MAX_PACKETS_IN_FLIGHT_KEY => {
                    config.write.max_packets_in_flight = parse_value(key, value)?
                }
                keys::write::EXCLUDE_NODES_CACHE_EXPIRY_INTERVAL_KEY => {
                    config.write.exclude_nodes_cache_expiry_ms = parse_value(key, value)?
                }
                keys::write::byte_array_manager::ENABLED_KEY => {
                    config.write.byte_array_manager.enabled = parse_value(key, value)?
                }
                keys::write::byte_array_manager::COUNT_THRESHOLD_KEY => {
                    config.write.byte_array_manager.count_threshold = parse_value(key, value)?
                }
                keys::write::byte_array_manager::COUNT_LIMIT_KEY => {
                    config.write.byte_array_manager.count_limit = parse_value(key, value)?
                }
                keys::write::byte_array_manager::COUNT_RESET_TIME_PERIOD_MS_KEY => {
                    config.write.byte_array_manager.count_reset_time_period_ms =
                        parse_value(key, value)?
                }

                keys::block_write::RETRIES_KEY => {
                    config.block_write.retries = parse_value(key, value)?
                }
                keys::block_write::LOCATEFOLLOWINGBLOCK_RETRIES_KEY => {
                    config.block_write.locate_following_block_retries = parse_value(key, value)?
                }
                keys::block_write::LOCATEFOLLOWINGBLOCK_INITIAL_DELAY_MS_KEY => {
                    config.block_write.locate_following_block_initial_delay_ms =
                        parse_value(key, value)?
                }
                keys::block_write::replace_datanode_on_failure::ENABLE_KEY => {
                    config.block_write.replace_datanode_on_failure.enable = parse_value(key, value)?
                }
                keys::block_write::replace_datanode_on_failure::POLICY_KEY => {
                    config.block_write.replace_datanode_on_failure.policy = value.parse()?
                }
                keys::block_write::replace_datanode_on_failure::BEST_EFFORT_KEY => {
                    config.block_write.replace_datanode_on_failure.best_effort =
                        parse_value(key, value)?
                }

                keys::short_circuit::KEY => config.short_circuit.enabled = parse_value(key, value)?,
                keys::short_circuit::SKIP_CHECKSUM_KEY => {
                    config.short_circuit.skip_checksum = parse_value(key, value)?
                }
                keys::short_circuit::BUFFER_SIZE_KEY => {
                    config.short_circuit.buffer_size = parse_value(key, value)?
                }
                keys::short_circuit::STREAMS_CACHE_SIZE_KEY => {
                    config.short_circuit.cache_size = parse_value(key, value)?
                }
                keys::short_circuit::STREAMS_CACHE_EXPIRY_MS_KEY => {
                    config.short_circuit.cache_expiry_ms = parse_value(key, value)?
                }
                keys::short_circuit::REPLICA_STALE_THRESHOLD_MS_KEY => {
                    config.short_circuit.stale_threshold_ms = parse_value(key, value)?
                }

                keys::hedged_read::THRESHOLD_MILLIS_KEY => {
                    config.hedged_read.threshold_millis = parse_value(key, value)?
                }
                keys::hedged_read::THREADPOOL_SIZE_KEY => {
                    config.hedged_read.threadpool_size = parse_value(key, value)?
                }

                keys::http_client::RETRY_POLICY_ENABLED_KEY => {
                    config.http_client.retry_policy_enabled = parse_value(key, value)?
                }
                keys::http_client::RETRY_POLICY_SPEC_KEY => {
                    config.http_client.retry_policy_spec = value.clone()
                }
                keys::http_client::RETRY_MAX_ATTEMPTS_KEY => {
                    config.http_client.retry_max_attempts = parse_value(key, value)?
                }
                keys::http_client::FAILOVER_MAX_ATTEMPTS_KEY => {
                    config.http_client.failover_max_attempts = parse_value(key, value)?
                }
                keys::http_client::FAILOVER_SLEEPTIME_BASE_KEY => {
                    config.http_client.failover_sleep_base_ms = parse_value(key, value)?
                }
                keys::http_client::FAILOVER_SLEEPTIME_MAX_KEY => {
                    config.http_client.failover_sleep_max_ms = parse_value(key, value)?
                }
                _ => {}
            }
        }

        config.endpoints = Self::endpoints_from_properties(props)?;
        config.validate()?;
        Ok(config)
    }

    /// `dfs.nameservices=ns`, `dfs.ha.namenodes.ns=nn1,nn2` and
    /// `dfs.namenode.rpc-address.ns.nn1=host:port`. The first listed instance
    /// is the initial active.
    fn endpoints_from_properties(props: &HashMap<String, String>) -> DfsResult<Vec<Endpoint>> {
        let nameservice = match props.get(keys::DFS_NAMESERVICES) {
            Some(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
            _ => return Ok(Vec::new()),
        };
        let ids_key = format!("{}.{}", keys::DFS_HA_NAMENODES_KEY_PREFIX, nameservice);
        let mut endpoints = Vec::new();
        match props.get(&ids_key) {
            Some(ids) => {
                for id in ids.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
                    let addr_key =
                        format!("{}.{}.{}", keys::DFS_NAMENODE_RPC_ADDRESS_KEY, nameservice, id);
                    let addr = props.get(&addr_key).ok_or_else(|| {
                        DfsError::InvalidConfig(format!("missing {}", addr_key))
                    })?;
                    let role = if endpoints.is_empty() {
                        EndpointRole::Active
                    } else {
                        EndpointRole::Standby
                    };
                    endpoints.push(Endpoint::parse(addr, role)?);
                }
            }
            None => {
                let addr_key = format!("{}.{}", keys::DFS_NAMENODE_RPC_ADDRESS_KEY, nameservice);
                if let Some(addr) = props.get(&addr_key) {
                    endpoints.push(Endpoint::parse(addr, EndpointRole::Active)?);
                }
            }
        }
        Ok(endpoints)
    }

    pub fn validate(&self) -> DfsResult<()> {
        if self.write_packet_size == 0 {
            return Err(DfsError::InvalidConfig("packet size must be positive".to_string()));
        }
        if self.bytes_per_checksum == 0 {
            return Err(DfsError::InvalidConfig(
                "bytes per checksum must be positive".to_string(),
            ));
        }
        if self.bytes_per_checksum as u64 + self.checksum_type.checksum_size() as u64
            > self.write_packet_size as u64
        {
            return Err(DfsError::InvalidConfig(format!(
                "packet size {} cannot hold one {} byte checksum chunk",
                self.write_packet_size, self.bytes_per_checksum
            )));
        }
        if self.block_size == 0 || self.block_size % self.bytes_per_checksum as u64 != 0 {
            return Err(DfsError::InvalidConfig(format!(
                "block size {} must be a positive multiple of bytes per checksum {}",
                self.block_size, self.bytes_per_checksum
            )));
        }
        if self.replication == 0 {
            return Err(DfsError::InvalidConfig("replication must be positive".to_string()));
        }
        if self.write.max_packets_in_flight == 0 {
            return Err(DfsError::InvalidConfig(
                "max packets in flight must be positive".to_string(),
            ));
        }
        if self.failover.max_attempts == 0 {
            return Err(DfsError::InvalidConfig(
                "failover max attempts must be positive".to_string(),
            ));
        }
        if self.failover.sleep_base_ms > self.failover.sleep_max_ms {
            return Err(DfsError::InvalidConfig(format!(
                "failover sleep base {}ms exceeds max {}ms",
                self.failover.sleep_base_ms, self.failover.sleep_max_ms
            )));
        }
        Ok(())
    }

    pub fn hedged_read_threshold(&self) -> Duration {
        Duration::from_millis(self.hedged_read.threshold_millis)
    }

    /// None when `socket_timeout_ms` is 0, i.e. wait forever.
    pub fn socket_timeout(&self) -> Option<Duration> {
        match self.socket_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn slow_io_warning_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_io_warning_threshold_ms)
    }

    pub fn exclude_nodes_expiry(&self) -> Duration {
        Duration::from_millis(self.write.exclude_nodes_cache_expiry_ms)
    }
}
