use dfs_lib::{
    AccessToken, ChecksumType, DataChecksum, DataTransfer, DfsError, DfsResult, ExtendedBlock,
    ReplicaRevocation, ShortCircuitConfig, ShortCircuitFds, StorageNodeRef,
    CHECKSUM_META_HEADER_LEN,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const REVOCATION_QUEUE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaKey {
    pub node_id: String,
    pub block_id: u64,
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.block_id, self.node_id)
    }
}

/// Data and checksum files of a local replica, opened from descriptors the
/// storage node handed over its domain socket.
pub struct ShortCircuitReplica {
    key: ReplicaKey,
    block: ExtendedBlock,
    data: File,
    meta: File,
    checksum: DataChecksum,
    data_len: u64,
    /// Upper bound on a single pread of the data file.
    read_size: usize,
    created_at: Instant,
    revoked: AtomicBool,
}

impl ShortCircuitReplica {
    fn open(
        key: ReplicaKey,
        block: ExtendedBlock,
        fds: ShortCircuitFds,
        buffer_size: usize,
    ) -> DfsResult<Self> {
        let data = File::from(fds.data);
        let meta = File::from(fds.meta);
        let mut header = [0u8; CHECKSUM_META_HEADER_LEN];
        meta.read_exact_at(&mut header, 0).map_err(|e| {
            DfsError::CorruptData(format!("read checksum header of {} failed: {}", key, e))
        })?;
        let checksum = DataChecksum::from_header(&header)?;
        let data_len = data.metadata()?.len();
        // whole chunks, so verified reads split on checksum boundaries
        let bpc = checksum.bytes_per_checksum().max(1);
        let read_size = (buffer_size / bpc).max(1) * bpc;
        Ok(Self {
            key,
            block,
            data,
            meta,
            checksum,
            data_len,
            read_size,
            created_at: Instant::now(),
            revoked: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &ReplicaKey {
        &self.key
    }

    pub fn block(&self) -> &ExtendedBlock {
        &self.block
    }

    pub fn is_valid(&self) -> bool {
        !self.revoked.load(Ordering::Acquire)
    }

    fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.created_at.elapsed() >= threshold
    }

    fn read_data(&self, buf: &mut [u8], offset: u64) -> DfsResult<()> {
        let mut pos = offset;
        for part in buf.chunks_mut(self.read_size) {
            self.data.read_exact_at(part, pos)?;
            pos += part.len() as u64;
        }
        Ok(())
    }

    fn read_blocking(&self, range: Range<u64>, verify: bool) -> DfsResult<Vec<u8>> {
        if !self.is_valid() {
            return Err(DfsError::ReplicaStale(format!("{} was revoked", self.key)));
        }
        if range.end > self.data_len || range.start > range.end {
            return Err(DfsError::ReplicaStale(format!(
                "{} holds {} bytes, asked for {:?}",
                self.key, self.data_len, range
            )));
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let len = (range.end - range.start) as usize;
        if !verify || self.checksum.kind() == ChecksumType::Null {
            let mut buf = vec![0u8; len];
            self.read_data(&mut buf, range.start)?;
            return Ok(buf);
        }

        // widen to whole chunks so every byte returned is covered by a checksum
        let bpc = self.checksum.bytes_per_checksum() as u64;
        let first_chunk = range.start / bpc;
        let aligned_start = first_chunk * bpc;
        let aligned_end = (range.end.div_ceil(bpc) * bpc).min(self.data_len);
        let mut buf = vec![0u8; (aligned_end - aligned_start) as usize];
        self.read_data(&mut buf, aligned_start)?;

        let sum_len = self.checksum.num_chunks(buf.len()) * self.checksum.checksum_size();
        let sum_offset =
            CHECKSUM_META_HEADER_LEN as u64 + first_chunk * self.checksum.checksum_size() as u64;
        let mut sums = vec![0u8; sum_len];
        self.meta.read_exact_at(&mut sums, sum_offset).map_err(|e| {
            DfsError::CorruptData(format!("read checksums of {} failed: {}", self.key, e))
        })?;
        let sums = DataChecksum::decode_sums(&sums)?;
        self.checksum.verify(&buf, &sums, aligned_start)?;

        let from = (range.start - aligned_start) as usize;
        buf.truncate(from + len);
        buf.drain(..from);
        Ok(buf)
    }
}

/// A reference to a cached replica. Dropping it returns the replica to the
/// cache.
pub struct ShortCircuitHandle {
    replica: Arc<ShortCircuitReplica>,
    cache: Arc<ReplicaCache>,
}

impl ShortCircuitHandle {
    pub fn block(&self) -> &ExtendedBlock {
        self.replica.block()
    }

    pub fn is_valid(&self) -> bool {
        self.replica.is_valid()
    }

    pub fn same_replica(&self, other: &ShortCircuitHandle) -> bool {
        Arc::ptr_eq(&self.replica, &other.replica)
    }

    pub async fn read(&self, range: Range<u64>, verify_checksum: bool) -> DfsResult<Vec<u8>> {
        let replica = self.replica.clone();
        tokio::task::spawn_blocking(move || replica.read_blocking(range, verify_checksum))
            .await
            .map_err(|e| DfsError::Internal(format!("short-circuit read task failed: {}", e)))?
    }
}

impl Drop for ShortCircuitHandle {
    fn drop(&mut self) {
        self.cache.release(&self.replica);
    }
}

struct CacheEntry {
    /// Serializes handshakes for this key.
    loading: Arc<tokio::sync::Mutex<()>>,
    replica: Option<Arc<ShortCircuitReplica>>,
    refs: usize,
    last_used: Instant,
    lru_id: u64,
}

impl CacheEntry {
    fn new(now: Instant, lru_id: u64) -> Self {
        Self {
            loading: Arc::new(tokio::sync::Mutex::new(())),
            replica: None,
            refs: 0,
            last_used: now,
            lru_id,
        }
    }

    fn is_idle(&self) -> bool {
        self.refs == 0 && self.replica.is_some()
    }
}

struct CacheState {
    entries: HashMap<ReplicaKey, CacheEntry>,
    next_lru_id: u64,
    /// node id -> end of its back-off
    failed_nodes: HashMap<String, Instant>,
}

impl CacheState {
    fn next_lru_id(&mut self) -> u64 {
        let id = self.next_lru_id;
        self.next_lru_id += 1;
        id
    }
}

struct ReplicaCache {
    capacity: usize,
    expiry: Duration,
    stale_threshold: Duration,
    path_failure_backoff: Duration,
    state: Mutex<CacheState>,
}

impl ReplicaCache {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn try_hit(
        &self,
        state: &mut CacheState,
        key: &ReplicaKey,
        block: &ExtendedBlock,
    ) -> Option<Arc<ShortCircuitReplica>> {
        let lru_id = state.next_lru_id();
        let entry = state.entries.get_mut(key)?;
        let replica = entry.replica.clone()?;
        if !replica.is_valid()
            || replica.block.generation_stamp != block.generation_stamp
            || replica.is_stale(self.stale_threshold)
        {
            debug!("dropping cached short-circuit replica {}", key);
            // handles still out refer to the old replica and are not counted
            entry.replica = None;
            entry.refs = 0;
            return None;
        }
        entry.refs += 1;
        entry.last_used = Instant::now();
        entry.lru_id = lru_id;
        Some(replica)
    }

    fn insert(&self, key: ReplicaKey, replica: Arc<ShortCircuitReplica>) {
        let now = Instant::now();
        let mut state = self.lock();
        let lru_id = state.next_lru_id();
        let entry = state
            .entries
            .entry(key)
            .or_insert_with(|| CacheEntry::new(now, lru_id));
        entry.replica = Some(replica);
        entry.refs = 1;
        entry.last_used = now;
        entry.lru_id = lru_id;
    }

    fn release(&self, replica: &Arc<ShortCircuitReplica>) {
        let mut state = self.lock();
        let lru_id = state.next_lru_id();
        let Some(entry) = state.entries.get_mut(replica.key()) else {
            return;
        };
        let current = entry
            .replica
            .as_ref()
            .map(|r| Arc::ptr_eq(r, replica))
            .unwrap_or(false);
        if !current {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        entry.last_used = Instant::now();
        entry.lru_id = lru_id;
        if entry.refs == 0 {
            self.evict_over_capacity(&mut state);
        }
    }

    fn evict_over_capacity(&self, state: &mut CacheState) {
        let mut idle: Vec<(u64, ReplicaKey)> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_idle())
            .map(|(k, e)| (e.lru_id, k.clone()))
            .collect();
        if idle.len() <= self.capacity {
            return;
        }
        idle.sort_by_key(|(lru_id, _)| *lru_id);
        let excess = idle.len() - self.capacity;
        for (_, key) in idle.into_iter().take(excess) {
            debug!("evicting short-circuit replica {}", key);
            state.entries.remove(&key);
        }
    }

    fn expire_idle(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        let expiry = self.expiry;
        state
            .entries
            .retain(|_, e| !(e.is_idle() && now.duration_since(e.last_used) >= expiry));
        state.failed_nodes.retain(|_, until| *until > now);
        let expired = before - state.entries.len();
        if expired > 0 {
            debug!("expired {} idle short-circuit replicas", expired);
        }
    }

    fn revoke(&self, revocation: &ReplicaRevocation) {
        let key = ReplicaKey {
            node_id: revocation.node.node_id(),
            block_id: revocation.block_id,
        };
        let mut state = self.lock();
        if let Some(entry) = state.entries.remove(&key) {
            if let Some(replica) = entry.replica {
                replica.revoke();
                info!("short-circuit replica {} revoked", key);
            }
        }
    }

    fn invalidate(&self, replica: &Arc<ShortCircuitReplica>) {
        replica.revoke();
        let mut state = self.lock();
        let current = state
            .entries
            .get(replica.key())
            .and_then(|e| e.replica.as_ref())
            .map(|r| Arc::ptr_eq(r, replica))
            .unwrap_or(false);
        if current {
            state.entries.remove(replica.key());
        }
    }

    fn backed_off(&self, node: &StorageNodeRef) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        match state.failed_nodes.get(&node.node_id()) {
            Some(until) if *until > now => true,
            Some(_) => {
                state.failed_nodes.remove(&node.node_id());
                false
            }
            None => false,
        }
    }

    fn on_handshake_failure(&self, node: &StorageNodeRef, key: &ReplicaKey) {
        let mut state = self.lock();
        state
            .failed_nodes
            .insert(node.node_id(), Instant::now() + self.path_failure_backoff);
        let unused = state
            .entries
            .get(key)
            .map(|e| e.replica.is_none() && e.refs == 0)
            .unwrap_or(false);
        if unused {
            state.entries.remove(key);
        }
    }
}

/// Cache of local replica descriptors obtained over storage-node domain
/// sockets, keyed by node and block.
///
/// Concurrent acquires of the same key share one handshake. Idle entries are
/// bounded by `cache_size` (least recently used first out) and expire after
/// `cache_expiry_ms`; replicas older than `stale_threshold_ms` are
/// re-handshaken before reuse. A node whose handshake fails is skipped for
/// `path_failure_backoff_ms`, callers fall back to the network path.
pub struct ShortCircuitChannelManager {
    cache: Arc<ReplicaCache>,
    transfer: Arc<dyn DataTransfer>,
    socket_path: String,
    local_hosts: Vec<String>,
    buffer_size: usize,
    revocations: mpsc::Sender<ReplicaRevocation>,
    cancel: CancellationToken,
    watcher: JoinHandle<()>,
}

impl ShortCircuitChannelManager {
    /// Spawns the revocation watcher, so it must be called from a runtime.
    pub fn new(
        config: &ShortCircuitConfig,
        domain_socket_path: &str,
        transfer: Arc<dyn DataTransfer>,
    ) -> Self {
        let cache = Arc::new(ReplicaCache {
            capacity: config.cache_size,
            expiry: Duration::from_millis(config.cache_expiry_ms),
            stale_threshold: Duration::from_millis(config.stale_threshold_ms),
            path_failure_backoff: Duration::from_millis(config.path_failure_backoff_ms),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_lru_id: 0,
                failed_nodes: HashMap::new(),
            }),
        });
        let (tx, rx) = mpsc::channel(REVOCATION_QUEUE_LEN);
        let cancel = CancellationToken::new();
        let interval = Duration::from_millis(config.watcher_check_interval_ms.max(1));
        let watcher = tokio::spawn(run_watcher(cache.clone(), rx, interval, cancel.clone()));

        Self {
            cache,
            transfer,
            socket_path: domain_socket_path.to_string(),
            local_hosts: config.local_hosts.clone(),
            buffer_size: config.buffer_size,
            revocations: tx,
            cancel,
            watcher,
        }
    }

    /// Channel on which storage-node revocation notices are delivered.
    pub fn revocation_sender(&self) -> mpsc::Sender<ReplicaRevocation> {
        self.revocations.clone()
    }

    pub fn is_local(&self, node: &StorageNodeRef) -> bool {
        let has_socket = node.domain_socket_path.is_some()
            || (!self.socket_path.is_empty() && self.local_hosts.iter().any(|h| *h == node.host));
        has_socket && !self.cache.backed_off(node)
    }

    /// A handle on the local replica of `block` on `node`, or None when the
    /// caller should read over the network.
    pub async fn acquire(
        &self,
        node: &StorageNodeRef,
        block: &ExtendedBlock,
        token: &AccessToken,
    ) -> Option<ShortCircuitHandle> {
        if !self.is_local(node) {
            return None;
        }
        let key = ReplicaKey {
            node_id: node.node_id(),
            block_id: block.block_id,
        };

        let loading = {
            let mut state = self.cache.lock();
            if let Some(replica) = self.cache.try_hit(&mut state, &key, block) {
                return Some(self.handle(replica));
            }
            let now = Instant::now();
            let lru_id = state.next_lru_id();
            state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(now, lru_id))
                .loading
                .clone()
        };

        let _loading = loading.lock().await;
        {
            // someone else may have finished the handshake while we waited
            let mut state = self.cache.lock();
            if let Some(replica) = self.cache.try_hit(&mut state, &key, block) {
                return Some(self.handle(replica));
            }
        }
        if self.cache.backed_off(node) {
            return None;
        }

        debug!("short-circuit handshake with {} for {}", node, block);
        let opened = match self.transfer.domain_socket_handshake(node, block, token).await {
            Ok(fds) => {
                let open_key = key.clone();
                let open_block = block.clone();
                let buffer_size = self.buffer_size;
                tokio::task::spawn_blocking(move || {
                    ShortCircuitReplica::open(open_key, open_block, fds, buffer_size)
                })
                .await
                .map_err(|e| DfsError::Internal(format!("open replica task failed: {}", e)))
                .and_then(|r| r)
            }
            Err(e) => Err(e),
        };

        match opened {
            Ok(replica) => {
                let replica = Arc::new(replica);
                self.cache.insert(key, replica.clone());
                Some(self.handle(replica))
            }
            Err(e) => {
                debug!(
                    "short-circuit to {} unavailable, using network reads for {:?}: {}",
                    node, self.cache.path_failure_backoff, e
                );
                self.cache.on_handshake_failure(node, &key);
                None
            }
        }
    }

    pub fn release(&self, handle: ShortCircuitHandle) {
        drop(handle);
    }

    /// Stop handing out the replica behind `handle`, e.g. after a failed read.
    pub fn invalidate(&self, handle: &ShortCircuitHandle) {
        warn!("invalidating short-circuit replica {}", handle.replica.key());
        self.cache.invalidate(&handle.replica);
    }

    /// Number of replicas currently cached, in use or idle.
    pub fn cached_count(&self) -> usize {
        self.cache
            .lock()
            .entries
            .values()
            .filter(|e| e.replica.is_some())
            .count()
    }

    fn handle(&self, replica: Arc<ShortCircuitReplica>) -> ShortCircuitHandle {
        ShortCircuitHandle {
            replica,
            cache: self.cache.clone(),
        }
    }
}

impl Drop for ShortCircuitChannelManager {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.watcher.abort();
    }
}

async fn run_watcher(
    cache: Arc<ReplicaCache>,
    mut revocations: mpsc::Receiver<ReplicaRevocation>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            revocation = revocations.recv() => match revocation {
                Some(revocation) => cache.revoke(&revocation),
                None => break,
            },
            _ = ticker.tick() => cache.expire_idle(),
        }
    }
    debug!("short-circuit watcher stopped");
}
