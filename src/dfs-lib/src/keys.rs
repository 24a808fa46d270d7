//! Property names understood by [`crate::DfsClientConfig::from_properties`].
//! Defaults live on the config structs.

pub const DFS_BLOCK_SIZE_KEY: &str = "dfs.blocksize";
pub const DFS_REPLICATION_KEY: &str = "dfs.replication";
pub const DFS_NAMESERVICES: &str = "dfs.nameservices";
pub const DFS_HA_NAMENODES_KEY_PREFIX: &str = "dfs.ha.namenodes";
pub const DFS_NAMENODE_RPC_ADDRESS_KEY: &str = "dfs.namenode.rpc-address";
pub const DFS_CLIENT_WRITE_PACKET_SIZE_KEY: &str = "dfs.client-write-packet-size";
pub const DFS_CLIENT_SOCKET_TIMEOUT_KEY: &str = "dfs.client.socket-timeout";
pub const DFS_CLIENT_MAX_BLOCK_ACQUIRE_FAILURES_KEY: &str =
    "dfs.client.max.block.acquire.failures";
pub const DFS_CHECKSUM_TYPE_KEY: &str = "dfs.checksum.type";
pub const DFS_BYTES_PER_CHECKSUM_KEY: &str = "dfs.bytes-per-checksum";
pub const DFS_DOMAIN_SOCKET_PATH_KEY: &str = "dfs.domain.socket.path";
pub const DFS_SHORT_CIRCUIT_SHARED_MEMORY_WATCHER_INTERRUPT_CHECK_MS: &str =
    "dfs.short.circuit.shared.memory.watcher.interrupt.check.ms";
pub const DFS_CLIENT_SLOW_IO_WARNING_THRESHOLD_KEY: &str =
    "dfs.client.slow.io.warning.threshold.ms";

pub mod retry {
    pub const POLICY_ENABLED_KEY: &str = "dfs.client.retry.policy.enabled";
    pub const POLICY_SPEC_KEY: &str = "dfs.client.retry.policy.spec";
    pub const MAX_ATTEMPTS_KEY: &str = "dfs.client.retry.max.attempts";
    pub const WINDOW_BASE_KEY: &str = "dfs.client.retry.window.base";
}

pub mod failover {
    pub const MAX_ATTEMPTS_KEY: &str = "dfs.client.failover.max.attempts";
    pub const SLEEPTIME_BASE_KEY: &str = "dfs.client.failover.sleep.base.millis";
    pub const SLEEPTIME_MAX_KEY: &str = "dfs.client.failover.sleep.max.millis";
    pub const CONNECTION_RETRIES_KEY: &str = "dfs.client.failover.connection.retries";
    pub const CONNECTION_RETRIES_ON_SOCKET_TIMEOUTS_KEY: &str =
        "dfs.client.failover.connection.retries.on.timeouts";
}

pub mod write {
    pub const MAX_PACKETS_IN_FLIGHT_KEY: &str = "dfs.client.write.max-packets-in-flight";
    pub const EXCLUDE_NODES_CACHE_EXPIRY_INTERVAL_KEY: &str =
        "dfs.client.write.exclude.nodes.cache.expiry.interval.millis";

    pub mod byte_array_manager {
        pub const ENABLED_KEY: &str = "dfs.client.write.byte-array-manager.enabled";
        pub const COUNT_THRESHOLD_KEY: &str = "dfs.client.write.byte-array-manager.count-threshold";
        pub const COUNT_LIMIT_KEY: &str = "dfs.client.write.byte-array-manager.count-limit";
        pub const COUNT_RESET_TIME_PERIOD_MS_KEY: &str =
            "dfs.client.write.byte-array-manager.count-reset-time-period-ms";
    }
}

pub mod block_write {
    pub const RETRIES_KEY: &str = "dfs.client.block.write.retries";
    pub const LOCATEFOLLOWINGBLOCK_RETRIES_KEY: &str =
        "dfs.client.block.write.locateFollowingBlock.retries";
    pub const LOCATEFOLLOWINGBLOCK_INITIAL_DELAY_MS_KEY: &str =
        "dfs.client.block.write.locateFollowingBlock.initial.delay.ms";

    pub mod replace_datanode_on_failure {
        pub const ENABLE_KEY: &str = "dfs.client.block.write.replace-datanode-on-failure.enable";
        pub const POLICY_KEY: &str = "dfs.client.block.write.replace-datanode-on-failure.policy";
        pub const BEST_EFFORT_KEY: &str =
            "dfs.client.block.write.replace-datanode-on-failure.best-effort";
    }
}

pub mod short_circuit {
    pub const KEY: &str = "dfs.client.read.shortcircuit";
    pub const SKIP_CHECKSUM_KEY: &str = "dfs.client.read.shortcircuit.skip.checksum";
    pub const BUFFER_SIZE_KEY: &str = "dfs.client.read.shortcircuit.buffer.size";
    pub const STREAMS_CACHE_SIZE_KEY: &str = "dfs.client.read.shortcircuit.streams.cache.size";
    pub const STREAMS_CACHE_EXPIRY_MS_KEY: &str =
        "dfs.client.read.shortcircuit.streams.cache.expiry.ms";
    pub const REPLICA_STALE_THRESHOLD_MS_KEY: &str =
        "dfs.client.read.short.circuit.replica.stale.threshold.ms";
}

pub mod hedged_read {
    pub const THRESHOLD_MILLIS_KEY: &str = "dfs.client.hedged.read.threshold.millis";
    pub const THREADPOOL_SIZE_KEY: &str = "dfs.client.hedged.read.threadpool.size";
}

pub mod http_client {
    pub const RETRY_POLICY_ENABLED_KEY: &str = "dfs.http.client.retry.policy.enabled";
    pub const RETRY_POLICY_SPEC_KEY: &str = "dfs.http.client.retry.policy.spec";
    pub const RETRY_MAX_ATTEMPTS_KEY: &str = "dfs.http.client.retry.max.attempts";
    pub const FAILOVER_MAX_ATTEMPTS_KEY: &str = "dfs.http.client.failover.max.attempts";
    pub const FAILOVER_SLEEPTIME_BASE_KEY: &str = "dfs.http.client.failover.sleep.base.millis";
    pub const FAILOVER_SLEEPTIME_MAX_KEY: &str = "dfs.http.client.failover.sleep.max.millis";
}
