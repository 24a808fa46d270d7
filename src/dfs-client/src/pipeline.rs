use dfs_lib::{
    AccessToken, DataChecksum, DataTransfer, DfsClientConfig, DfsError, DfsResult, ExtendedBlock,
    AckStream, LocatedBlock, Packet, PacketSink, PipelineAck, PipelineConnection, PipelineStage,
    ReplaceDatanodeOnFailureConfig, ReplaceDatanodePolicy, StorageNodeRef,
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::buffer_pool::BufferPool;
use crate::metadata::MetadataClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceDatanodeMode {
    /// The feature is switched off entirely.
    Disable,
    Never,
    Default,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceDatanodeOnFailure {
    pub mode: ReplaceDatanodeMode,
    pub best_effort: bool,
}

impl ReplaceDatanodeOnFailure {
    pub fn from_config(config: &ReplaceDatanodeOnFailureConfig) -> Self {
        let mode = if !config.enable {
            ReplaceDatanodeMode::Disable
        } else {
            match config.policy {
                ReplaceDatanodePolicy::Never => ReplaceDatanodeMode::Never,
                ReplaceDatanodePolicy::Default => ReplaceDatanodeMode::Default,
                ReplaceDatanodePolicy::Always => ReplaceDatanodeMode::Always,
            }
        };
        Self {
            mode,
            best_effort: config.best_effort,
        }
    }

    /// `remaining` is the number of healthy nodes left in the pipeline.
    pub fn should_replace(&self, replication: u16, remaining: usize, hflushed: bool) -> bool {
        match self.mode {
            ReplaceDatanodeMode::Disable | ReplaceDatanodeMode::Never => false,
            ReplaceDatanodeMode::Always => true,
            ReplaceDatanodeMode::Default => {
                replication >= 3 && (remaining <= (replication / 2) as usize || hflushed)
            }
        }
    }
}

/// Storage nodes that recently failed a write, skipped by block allocation
/// until their entry expires.
pub struct ExcludedNodes {
    expiry: Duration,
    nodes: Mutex<HashMap<String, (StorageNodeRef, Instant)>>,
}

impl ExcludedNodes {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (StorageNodeRef, Instant)>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, node: &StorageNodeRef) {
        info!("excluding storage node {} for {:?}", node, self.expiry);
        self.lock()
            .insert(node.node_id(), (node.clone(), Instant::now()));
    }

    pub fn contains(&self, node: &StorageNodeRef) -> bool {
        let now = Instant::now();
        match self.lock().get(&node.node_id()) {
            Some((_, added)) => now.duration_since(*added) < self.expiry,
            None => false,
        }
    }

    /// Live entries, dropping expired ones.
    pub fn snapshot(&self) -> Vec<StorageNodeRef> {
        let now = Instant::now();
        let expiry = self.expiry;
        let mut nodes = self.lock();
        nodes.retain(|_, (_, added)| now.duration_since(*added) < expiry);
        nodes.values().map(|(node, _)| node.clone()).collect()
    }
}

/// What a write pipeline needs from the rest of the client.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<DfsClientConfig>,
    pub metadata: Arc<MetadataClient>,
    pub transfer: Arc<dyn DataTransfer>,
    pub buffer_pool: Arc<BufferPool>,
    pub excluded: Arc<ExcludedNodes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Setup,
    Streaming,
    Recovering,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug)]
struct PipelineFailure {
    /// Index into the live node list, None when no node can be blamed.
    bad_node: Option<usize>,
    error: DfsError,
}

struct PipelineState {
    nodes: Vec<StorageNodeRef>,
    unacked: VecDeque<Arc<Packet>>,
    acked_bytes: u64,
    last_acked_seqno: Option<u64>,
    last_packet_acked: bool,
    failure: Option<PipelineFailure>,
    ack_generation: u64,
}

fn lock_state(state: &Mutex<PipelineState>) -> MutexGuard<'_, PipelineState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Node to blame for a transfer error. Without a node index the first node
/// is the one the client talks to.
fn failed_node(err: &DfsError) -> Option<usize> {
    match err {
        DfsError::PipelineNodeFailed { index, .. } => Some(*index),
        DfsError::ProtocolViolation(_) => None,
        _ => Some(0),
    }
}

enum RecoveryError {
    Node(PipelineFailure),
    Fatal(DfsError),
}

struct AckProcessor {
    state: Arc<Mutex<PipelineState>>,
    window: Arc<Semaphore>,
    events: Arc<Notify>,
    buffer_pool: Arc<BufferPool>,
    slow_threshold: Duration,
    ack_timeout: Option<Duration>,
    generation: u64,
    block: String,
}

impl AckProcessor {
    fn fail(&self, state: &mut PipelineState, bad_node: Option<usize>, error: DfsError) {
        if state.failure.is_none() {
            warn!("pipeline for {} failed: {}", self.block, error);
            state.failure = Some(PipelineFailure { bad_node, error });
        }
    }

    /// None when the wait timed out with nothing outstanding.
    async fn next_ack(
        &self,
        acks: &mut Box<dyn AckStream>,
    ) -> Option<DfsResult<Option<PipelineAck>>> {
        let Some(limit) = self.ack_timeout else {
            return Some(acks.next_ack().await);
        };
        match tokio::time::timeout(limit, acks.next_ack()).await {
            Ok(result) => Some(result),
            Err(_) => {
                let state = lock_state(&self.state);
                if state.ack_generation == self.generation && state.unacked.is_empty() {
                    return None;
                }
                Some(Err(DfsError::Timeout(format!(
                    "no ack for packet {:?} of {} within {:?}",
                    state.unacked.front().map(|p| p.seqno),
                    self.block,
                    limit
                ))))
            }
        }
    }

    async fn run(self, mut acks: Box<dyn AckStream>) {
        loop {
            let Some(result) = self.next_ack(&mut acks).await else {
                continue;
            };
            let mut state = lock_state(&self.state);
            if state.ack_generation != self.generation {
                return;
            }

            let ack = match result {
                Ok(Some(ack)) => ack,
                Ok(None) => {
                    if !state.last_packet_acked {
                        self.fail(
                            &mut state,
                            Some(0),
                            DfsError::Network("ack stream closed before last packet".to_string()),
                        );
                    }
                    drop(state);
                    self.events.notify_one();
                    return;
                }
                Err(e) => {
                    self.fail(&mut state, failed_node(&e), e);
                    drop(state);
                    self.events.notify_one();
                    return;
                }
            };

            let expected = state.unacked.front().map(|p| p.seqno);
            if expected != Some(ack.seqno) {
                self.fail(
                    &mut state,
                    None,
                    DfsError::ProtocolViolation(format!(
                        "ack for packet {} while expecting {:?}",
                        ack.seqno, expected
                    )),
                );
                drop(state);
                self.events.notify_one();
                return;
            }
            if let Some(bad) = ack.first_bad_node() {
                self.fail(
                    &mut state,
                    Some(bad),
                    DfsError::PipelineNodeFailed {
                        index: bad,
                        reason: format!("{:?} for packet {}", ack.replies[bad], ack.seqno),
                    },
                );
                drop(state);
                self.events.notify_one();
                return;
            }

            let packet = match state.unacked.pop_front() {
                Some(packet) => packet,
                None => return,
            };
            state.acked_bytes = state.acked_bytes.max(packet.end_offset());
            state.last_acked_seqno = Some(packet.seqno);
            if packet.last_packet_in_block {
                state.last_packet_acked = true;
            }
            drop(state);

            self.window.add_permits(1);
            let elapsed = packet.created_at.elapsed();
            if elapsed > self.slow_threshold {
                warn!(
                    "slow ack for packet {} of {}: {:?}",
                    packet.seqno, self.block, elapsed
                );
            }
            if let Ok(packet) = Arc::try_unwrap(packet) {
                self.buffer_pool.release(packet.into_data());
            }
            self.events.notify_one();
        }
    }
}

/// Streams one block to an ordered chain of storage nodes.
pub struct BlockWritePipeline {
    path: String,
    ctx: PipelineContext,
    checksum: DataChecksum,
    replace_policy: ReplaceDatanodeOnFailure,
    block: ExtendedBlock,
    token: AccessToken,
    status: PipelineStatus,
    state: Arc<Mutex<PipelineState>>,
    window: Arc<Semaphore>,
    events: Arc<Notify>,
    sink: Option<Box<dyn PacketSink>>,
    ack_task: Option<JoinHandle<()>>,
    next_seqno: u64,
    pending: Vec<u8>,
    pending_offset: u64,
    data_per_packet: usize,
    hflushed: bool,
    recovery_attempts: u32,
    progress_mark: Option<u64>,
}

impl BlockWritePipeline {
    /// Allocate the block following `previous` and connect its pipeline.
    pub async fn create(
        ctx: PipelineContext,
        path: &str,
        previous: Option<&ExtendedBlock>,
    ) -> DfsResult<Self> {
        let config = ctx.config.clone();
        let checksum = DataChecksum::new(config.checksum_type, config.bytes_per_checksum as usize)?;
        let chunk_len = checksum.bytes_per_checksum() + checksum.checksum_size();
        let chunks_per_packet = (config.write_packet_size as usize / chunk_len).max(1);
        let data_per_packet = chunks_per_packet * checksum.bytes_per_checksum();

        let mut last_err = None;
        for attempt in 0..=config.block_write.retries {
            let excluded = ctx.excluded.snapshot();
            let located = Self::locate_following_block(&ctx, path, previous, &excluded).await?;
            if located.locations.is_empty() {
                if let Err(e) = ctx.metadata.abandon_block(path, &located.block).await {
                    warn!("abandon {} failed: {}", located.block, e);
                }
                return Err(DfsError::PipelineFailed(format!(
                    "no storage nodes for {} of {}",
                    located.block, path
                )));
            }

            info!(
                "setting up pipeline for {} of {} (attempt {}): {:?}",
                located.block,
                path,
                attempt + 1,
                located
                    .locations
                    .iter()
                    .map(|n| n.node_id())
                    .collect::<Vec<_>>()
            );
            match ctx
                .transfer
                .connect_pipeline(
                    &located.block,
                    &located.locations,
                    &located.token,
                    PipelineStage::SetupCreate,
                )
                .await
            {
                Ok(conn) => {
                    return Ok(Self::start(
                        ctx,
                        path,
                        checksum,
                        data_per_packet,
                        located,
                        conn,
                    ))
                }
                Err(e) => {
                    warn!("pipeline setup for {} failed: {}", located.block, e);
                    if let Err(abandon_err) = ctx.metadata.abandon_block(path, &located.block).await
                    {
                        warn!("abandon {} failed: {}", located.block, abandon_err);
                    }
                    if let Some(bad) = failed_node(&e).and_then(|i| located.locations.get(i)) {
                        ctx.excluded.add(bad);
                    }
                    if !e.kind().is_retryable() {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }

        let reason = match last_err {
            Some(e) => e.to_string(),
            None => "no attempt made".to_string(),
        };
        error!("unable to create new block for {}: {}", path, reason);
        Err(DfsError::PipelineFailed(format!(
            "unable to create new block for {}: {}",
            path, reason
        )))
    }

    async fn locate_following_block(
        ctx: &PipelineContext,
        path: &str,
        previous: Option<&ExtendedBlock>,
        excluded: &[StorageNodeRef],
    ) -> DfsResult<LocatedBlock> {
        let block_write = &ctx.config.block_write;
        let mut retries = block_write.locate_following_block_retries;
        let mut delay = Duration::from_millis(block_write.locate_following_block_initial_delay_ms);
        loop {
            match ctx.metadata.add_block(path, previous, excluded).await {
                Err(DfsError::NotReplicatedYet(msg)) if retries > 0 => {
                    retries -= 1;
                    info!(
                        "previous block of {} not replicated yet, retrying in {:?}: {}",
                        path, delay, msg
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }

    fn start(
        ctx: PipelineContext,
        path: &str,
        checksum: DataChecksum,
        data_per_packet: usize,
        located: LocatedBlock,
        conn: PipelineConnection,
    ) -> Self {
        let max_in_flight = ctx.config.write.max_packets_in_flight as usize;
        let state = PipelineState {
            nodes: Vec::new(),
            unacked: VecDeque::new(),
            acked_bytes: 0,
            last_acked_seqno: None,
            last_packet_acked: false,
            failure: None,
            ack_generation: 0,
        };
        let pending = ctx.buffer_pool.allocate(data_per_packet);
        let replace_policy =
            ReplaceDatanodeOnFailure::from_config(&ctx.config.block_write.replace_datanode_on_failure);
        let mut pipeline = Self {
            path: path.to_string(),
            ctx,
            checksum,
            replace_policy,
            block: located.block,
            token: located.token,
            status: PipelineStatus::Setup,
            state: Arc::new(Mutex::new(state)),
            window: Arc::new(Semaphore::new(max_in_flight)),
            events: Arc::new(Notify::new()),
            sink: None,
            ack_task: None,
            next_seqno: 0,
            pending,
            pending_offset: 0,
            data_per_packet,
            hflushed: false,
            recovery_attempts: 0,
            progress_mark: None,
        };
        pipeline.install_connection(conn, located.locations);
        pipeline.status = PipelineStatus::Streaming;
        pipeline
    }

    fn install_connection(&mut self, conn: PipelineConnection, nodes: Vec<StorageNodeRef>) {
        let generation = {
            let mut state = lock_state(&self.state);
            state.nodes = nodes;
            state.failure = None;
            state.ack_generation += 1;
            state.ack_generation
        };
        self.sink = Some(conn.sink);
        let processor = AckProcessor {
            state: self.state.clone(),
            window: self.window.clone(),
            events: self.events.clone(),
            buffer_pool: self.ctx.buffer_pool.clone(),
            slow_threshold: self.ctx.config.slow_io_warning_threshold(),
            ack_timeout: self.ctx.config.socket_timeout(),
            generation,
            block: self.block.to_string(),
        };
        self.ack_task = Some(tokio::spawn(processor.run(conn.acks)));
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn block(&self) -> &ExtendedBlock {
        &self.block
    }

    pub fn nodes(&self) -> Vec<StorageNodeRef> {
        lock_state(&self.state).nodes.clone()
    }

    pub fn acked_bytes(&self) -> u64 {
        lock_state(&self.state).acked_bytes
    }

    /// Bytes accepted by `write` so far, sent or not.
    pub fn bytes_in_block(&self) -> u64 {
        self.pending_offset + self.pending.len() as u64
    }

    fn ensure_streaming(&self) -> DfsResult<()> {
        match self.status {
            PipelineStatus::Streaming => Ok(()),
            PipelineStatus::Failed => Err(DfsError::PipelineFailed(format!(
                "pipeline for {} already failed",
                self.block
            ))),
            status => Err(DfsError::InvalidState(format!(
                "pipeline for {} is {:?}",
                self.block, status
            ))),
        }
    }

    pub async fn write(&mut self, mut data: &[u8]) -> DfsResult<()> {
        self.ensure_streaming()?;
        if self.bytes_in_block() + data.len() as u64 > self.ctx.config.block_size {
            return Err(DfsError::InvalidParam(format!(
                "write of {} bytes crosses the end of {}",
                data.len(),
                self.block
            )));
        }

        while !data.is_empty() {
            let room = self.data_per_packet - self.pending.len();
            let n = room.min(data.len());
            self.pending.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.pending.len() == self.data_per_packet {
                self.flush_pending(false).await?;
            }
        }
        Ok(())
    }

    /// Send everything written so far and wait until the whole chain has it.
    pub async fn hflush(&mut self) -> DfsResult<()> {
        self.ensure_streaming()?;
        self.flush_pending(true).await?;
        self.wait_for_acks().await?;
        self.hflushed = true;
        Ok(())
    }

    /// Flush, send the empty last packet and wait for the full-chain ack.
    /// Returns the finalized block.
    pub async fn close(&mut self) -> DfsResult<ExtendedBlock> {
        if self.status == PipelineStatus::Closed {
            return Ok(self.block.clone());
        }
        self.ensure_streaming()?;
        self.flush_pending(false).await?;

        self.status = PipelineStatus::Closing;
        let last = Packet::new(
            self.next_seqno,
            self.bytes_in_block(),
            Vec::new(),
            Vec::new(),
            true,
        );
        self.next_seqno += 1;
        self.enqueue(last).await?;
        self.wait_for_acks().await?;

        if let Some(task) = self.ack_task.take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                warn!("closing connection for {} failed: {}", self.block, e);
            }
        }
        let pending = std::mem::take(&mut self.pending);
        self.ctx.buffer_pool.release(pending);

        self.block.num_bytes = self.acked_bytes();
        self.status = PipelineStatus::Closed;
        info!(
            "closed pipeline for {} of {}, {} bytes",
            self.block, self.path, self.block.num_bytes
        );
        Ok(self.block.clone())
    }

    /// Turn the pending bytes into a packet. With `keep_partial_chunk` a
    /// trailing partial chunk stays pending so the next packet resends it
    /// from the chunk boundary.
    async fn flush_pending(&mut self, keep_partial_chunk: bool) -> DfsResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let offset = self.pending_offset;
        let len = self.pending.len();
        let partial = if keep_partial_chunk {
            len % self.checksum.bytes_per_checksum()
        } else {
            0
        };

        let mut next = self.ctx.buffer_pool.allocate(self.data_per_packet);
        if partial > 0 {
            next.extend_from_slice(&self.pending[len - partial..]);
        }
        let data = std::mem::replace(&mut self.pending, next);
        self.pending_offset = offset + (len - partial) as u64;

        let checksums = self.checksum.compute(&data);
        let packet = Packet::new(self.next_seqno, offset, data, checksums, false);
        self.next_seqno += 1;
        self.enqueue(packet).await
    }

    async fn enqueue(&mut self, packet: Packet) -> DfsResult<()> {
        self.wait_for_window().await?;
        let packet = Arc::new(packet);
        lock_state(&self.state).unacked.push_back(packet.clone());
        debug!(
            "sending packet {} of {}: offset {}, {} bytes, last {}",
            packet.seqno,
            self.block,
            packet.offset_in_block,
            packet.data_len(),
            packet.last_packet_in_block
        );

        let result = match self.sink.as_mut() {
            Some(sink) => sink.send_packet(&packet).await,
            None => Err(DfsError::InvalidState("pipeline has no connection".to_string())),
        };
        if let Err(e) = result {
            self.record_failure(failed_node(&e), e);
            self.recover().await?;
        }
        Ok(())
    }

    async fn wait_for_window(&mut self) -> DfsResult<()> {
        loop {
            if self.has_failure() {
                self.recover().await?;
                continue;
            }
            let window = self.window.clone();
            let events = self.events.clone();
            tokio::select! {
                permit = window.acquire() => {
                    let permit = permit.map_err(|_| {
                        DfsError::InvalidState("pipeline window closed".to_string())
                    })?;
                    permit.forget();
                    return Ok(());
                }
                _ = events.notified() => {}
            }
        }
    }

    async fn wait_for_acks(&mut self) -> DfsResult<()> {
        loop {
            if self.has_failure() {
                self.recover().await?;
                continue;
            }
            if lock_state(&self.state).unacked.is_empty() {
                return Ok(());
            }
            self.events.clone().notified().await;
        }
    }

    fn has_failure(&self) -> bool {
        lock_state(&self.state).failure.is_some()
    }

    fn record_failure(&self, bad_node: Option<usize>, error: DfsError) {
        let mut state = lock_state(&self.state);
        if state.failure.is_none() {
            state.failure = Some(PipelineFailure { bad_node, error });
        }
    }

    fn fail(&mut self, reason: String) -> DfsError {
        error!("pipeline for {} of {} failed: {}", self.block, self.path, reason);
        self.status = PipelineStatus::Failed;
        if let Some(task) = self.ack_task.take() {
            task.abort();
        }
        self.sink = None;
        DfsError::PipelineFailed(reason)
    }

    async fn teardown_connection(&mut self) {
        if let Some(task) = self.ack_task.take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!("closing stream of {} failed: {}", self.block, e);
            }
        }
    }

    async fn recover(&mut self) -> DfsResult<()> {
        let (mut failure, last_acked) = {
            let mut state = lock_state(&self.state);
            match state.failure.take() {
                Some(failure) => (failure, state.last_acked_seqno),
                None => return Ok(()),
            }
        };
        let closing = self.status == PipelineStatus::Closing;
        let stage = if closing {
            PipelineStage::SetupCloseRecovery
        } else {
            PipelineStage::SetupStreamingRecovery
        };
        self.status = PipelineStatus::Recovering;

        // acks since the last recovery restore the budget
        if last_acked != self.progress_mark {
            self.recovery_attempts = 0;
            self.progress_mark = last_acked;
        }

        loop {
            self.recovery_attempts += 1;
            if self.recovery_attempts > self.ctx.config.block_write.retries {
                let reason = format!(
                    "giving up after {} recovery attempts: {}",
                    self.recovery_attempts - 1,
                    failure.error
                );
                return Err(self.fail(reason));
            }
            warn!(
                "recovering pipeline for {} of {} (attempt {}): {}",
                self.block, self.path, self.recovery_attempts, failure.error
            );

            match self.try_recover(&failure, stage).await {
                Ok(()) => {
                    self.status = if closing {
                        PipelineStatus::Closing
                    } else {
                        PipelineStatus::Streaming
                    };
                    info!(
                        "pipeline for {} recovered with nodes {:?}",
                        self.block,
                        self.nodes().iter().map(|n| n.node_id()).collect::<Vec<_>>()
                    );
                    return Ok(());
                }
                Err(RecoveryError::Node(next)) => failure = next,
                Err(RecoveryError::Fatal(e)) => {
                    let reason = format!("recovery of {} failed: {}", self.block, e);
                    return Err(self.fail(reason));
                }
            }
        }
    }

    async fn try_recover(
        &mut self,
        failure: &PipelineFailure,
        stage: PipelineStage,
    ) -> Result<(), RecoveryError> {
        self.teardown_connection().await;

        let (mut nodes, acked_bytes) = {
            let state = lock_state(&self.state);
            (state.nodes.clone(), state.acked_bytes)
        };
        if let Some(index) = failure.bad_node {
            if index < nodes.len() {
                let bad = nodes.remove(index);
                warn!("removing {} from pipeline for {}", bad, self.block);
                self.ctx.excluded.add(&bad);
            }
        }
        if nodes.is_empty() {
            return Err(RecoveryError::Fatal(DfsError::PipelineFailed(format!(
                "all nodes of {} failed",
                self.block
            ))));
        }
        lock_state(&self.state).nodes = nodes.clone();

        if self
            .replace_policy
            .should_replace(self.ctx.config.replication, nodes.len(), self.hflushed)
        {
            if let Err(e) = self.add_replacement(&mut nodes, acked_bytes).await {
                if !self.replace_policy.best_effort {
                    return Err(RecoveryError::Fatal(e));
                }
                warn!(
                    "no replacement for {}, continuing with {} nodes: {}",
                    self.block,
                    nodes.len(),
                    e
                );
            }
        }

        let old_block = self.block.clone();
        let updated = self
            .ctx
            .metadata
            .update_block_for_pipeline(&old_block)
            .await
            .map_err(RecoveryError::Fatal)?;
        let mut new_block = updated.block;
        new_block.num_bytes = acked_bytes;
        let token = updated.token;

        let conn = match self
            .ctx
            .transfer
            .connect_pipeline(&new_block, &nodes, &token, stage)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                lock_state(&self.state).nodes = nodes;
                return Err(RecoveryError::Node(PipelineFailure {
                    bad_node: failed_node(&e),
                    error: e,
                }));
            }
        };
        self.ctx
            .metadata
            .update_pipeline(&old_block, &new_block, &nodes)
            .await
            .map_err(RecoveryError::Fatal)?;
        info!("{} is now {}", old_block, new_block);

        self.block = new_block;
        self.token = token;
        self.install_connection(conn, nodes);

        let resend: Vec<Arc<Packet>> = lock_state(&self.state).unacked.iter().cloned().collect();
        if !resend.is_empty() {
            debug!("resending {} packets of {}", resend.len(), self.block);
        }
        for packet in resend {
            let result = match self.sink.as_mut() {
                Some(sink) => sink.send_packet(&packet).await,
                None => Err(DfsError::InvalidState("pipeline has no connection".to_string())),
            };
            if let Err(e) = result {
                return Err(RecoveryError::Node(PipelineFailure {
                    bad_node: failed_node(&e),
                    error: e,
                }));
            }
        }
        Ok(())
    }

    /// Ask for a new node and copy the acknowledged prefix to it.
    async fn add_replacement(
        &mut self,
        nodes: &mut Vec<StorageNodeRef>,
        acked_bytes: u64,
    ) -> DfsResult<()> {
        let excluded = self.ctx.excluded.snapshot();
        let new_node = self
            .ctx
            .metadata
            .get_additional_datanode(&self.path, &self.block, nodes, &excluded)
            .await?;

        if acked_bytes > 0 {
            let mut source_block = self.block.clone();
            source_block.num_bytes = acked_bytes;
            if let Err(e) = self
                .ctx
                .transfer
                .transfer_block(
                    &nodes[0],
                    std::slice::from_ref(&new_node),
                    &source_block,
                    &self.token,
                )
                .await
            {
                self.ctx.excluded.add(&new_node);
                return Err(e);
            }
        }
        info!("added {} to pipeline for {}", new_node, self.block);
        nodes.push(new_node);
        Ok(())
    }
}

impl Drop for BlockWritePipeline {
    fn drop(&mut self) {
        if let Some(task) = self.ack_task.take() {
            task.abort();
        }
    }
}
