//! In-memory metadata service and storage nodes with fault injection.

use async_trait::async_trait;
use dfs_lib::{
    AccessToken, AckStatus, AckStream, ChecksumType, DataChecksum, DataTransfer, DfsClientConfig,
    DfsError, DfsResult, Endpoint, EndpointRole, ExtendedBlock, LocatedBlock, LocatedBlocks,
    MetadataProtocol, Packet, PacketSink, PipelineAck, PipelineConnection, PipelineStage,
    ShortCircuitFds, StaticTokenProvider, StorageNodeRef,
};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

use crate::buffer_pool::BufferPool;
use crate::failover::FailoverController;
use crate::metadata::MetadataClient;
use crate::pipeline::{ExcludedNodes, PipelineContext};
use crate::retry::RetryPolicy;

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_BYTES_PER_CHECKSUM: usize = 512;

struct Replica {
    generation_stamp: u64,
    data: Vec<u8>,
}

struct FileEntry {
    blocks: Vec<LocatedBlock>,
    complete: bool,
}

#[derive(Default)]
struct Faults {
    down_endpoints: HashSet<String>,
    transient_metadata_failures: u32,
    not_replicated_yet: u32,
    incomplete_responses: u32,
    /// node id -> first packet seqno the node fails on
    node_failures: HashMap<String, u64>,
    reorder_ack_at: Option<u64>,
    connect_failures: HashMap<String, u32>,
    fail_all_connects: bool,
    read_delays: HashMap<String, Duration>,
    read_failures: HashMap<String, u32>,
    handshake_failures: HashSet<String>,
    handshake_delay: Duration,
}

struct ClusterState {
    nodes: Vec<StorageNodeRef>,
    replication: usize,
    next_block_id: u64,
    next_generation: u64,
    files: HashMap<String, FileEntry>,
    replicas: HashMap<(String, u64), Replica>,
    abandoned: Vec<ExtendedBlock>,
    metadata_calls: Vec<String>,
    packets_sent: usize,
    reads: HashMap<String, usize>,
    handshakes: usize,
    faults: Faults,
}

fn lock(state: &Mutex<ClusterState>) -> MutexGuard<'_, ClusterState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_packet(replica: &mut Replica, packet: &Packet) {
    let offset = packet.offset_in_block as usize;
    replica.data.truncate(offset);
    replica.data.extend_from_slice(&packet.data);
}

pub struct TestCluster {
    state: Arc<Mutex<ClusterState>>,
    ack_gate: watch::Sender<bool>,
    replica_dir: TempDir,
    file_seq: AtomicU64,
}

impl TestCluster {
    pub fn new(node_count: usize) -> Arc<Self> {
        let nodes = (0..node_count)
            .map(|i| StorageNodeRef::new(format!("dn{}", i + 1), 9866))
            .collect();
        let state = ClusterState {
            nodes,
            replication: 3,
            next_block_id: 1,
            next_generation: 1000,
            files: HashMap::new(),
            replicas: HashMap::new(),
            abandoned: Vec::new(),
            metadata_calls: Vec::new(),
            packets_sent: 0,
            reads: HashMap::new(),
            handshakes: 0,
            faults: Faults::default(),
        };
        let (ack_gate, _) = watch::channel(false);
        Arc::new(Self {
            state: Arc::new(Mutex::new(state)),
            ack_gate,
            replica_dir: TempDir::new().unwrap(),
            file_seq: AtomicU64::new(0),
        })
    }

    pub fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::new("nn1", 8020, EndpointRole::Active),
            Endpoint::new("nn2", 8020, EndpointRole::Standby),
        ]
    }

    pub fn config(&self, customize: impl FnOnce(&mut DfsClientConfig)) -> DfsClientConfig {
        let mut config = DfsClientConfig {
            endpoints: Self::endpoints(),
            ..Default::default()
        };
        customize(&mut config);
        config
    }

    pub fn metadata_client(self: &Arc<Self>, config: &DfsClientConfig) -> MetadataClient {
        MetadataClient::new(
            self.clone(),
            Arc::new(StaticTokenProvider::new(AccessToken(TEST_TOKEN.to_string()))),
            FailoverController::new(config.endpoints.clone(), &config.failover).unwrap(),
            RetryPolicy::from_config(&config.retry).unwrap(),
        )
    }

    pub fn pipeline_context(
        self: &Arc<Self>,
        customize: impl FnOnce(&mut DfsClientConfig),
    ) -> PipelineContext {
        let config = Arc::new(self.config(customize));
        PipelineContext {
            metadata: Arc::new(self.metadata_client(&config)),
            transfer: self.clone(),
            buffer_pool: Arc::new(BufferPool::new(&config.write.byte_array_manager)),
            excluded: Arc::new(ExcludedNodes::new(config.exclude_nodes_expiry())),
            config,
        }
    }

    pub fn storage_nodes(&self) -> Vec<StorageNodeRef> {
        lock(&self.state).nodes.clone()
    }

    /// Advertise a domain socket on node `index`. Only affects blocks
    /// allocated afterwards.
    pub fn set_domain_socket(&self, index: usize, path: &str) {
        let mut state = lock(&self.state);
        let node = state.nodes[index].clone().with_domain_socket(path);
        state.nodes[index] = node;
    }

    /// Store a complete single-block file directly, bypassing the pipeline.
    pub async fn create_file(&self, path: &str, data: &[u8]) {
        let mut state = lock(&self.state);
        let block = ExtendedBlock {
            block_id: state.next_block_id,
            generation_stamp: state.next_generation,
            num_bytes: data.len() as u64,
        };
        state.next_block_id += 1;
        state.next_generation += 1;
        let replication = state.replication;
        let locations: Vec<StorageNodeRef> =
            state.nodes.iter().take(replication).cloned().collect();
        for node in locations.iter() {
            state.replicas.insert(
                (node.node_id(), block.block_id),
                Replica {
                    generation_stamp: block.generation_stamp,
                    data: data.to_vec(),
                },
            );
        }
        state.files.insert(
            path.to_string(),
            FileEntry {
                blocks: vec![LocatedBlock {
                    block,
                    offset: 0,
                    locations,
                    token: AccessToken(TEST_TOKEN.to_string()),
                }],
                complete: true,
            },
        );
    }

    pub fn located_blocks(&self, path: &str) -> LocatedBlocks {
        let state = lock(&self.state);
        match state.files.get(path) {
            Some(file) => LocatedBlocks {
                file_length: file.blocks.iter().map(|b| b.block.num_bytes).sum(),
                blocks: file.blocks.clone(),
            },
            None => LocatedBlocks::default(),
        }
    }

    pub fn is_complete(&self, path: &str) -> bool {
        lock(&self.state)
            .files
            .get(path)
            .map(|f| f.complete)
            .unwrap_or(false)
    }

    pub fn replica_data(&self, node: &StorageNodeRef, block_id: u64) -> Option<Vec<u8>> {
        lock(&self.state)
            .replicas
            .get(&(node.node_id(), block_id))
            .map(|r| r.data.clone())
    }

    // fault injection

    pub fn set_endpoint_down(&self, endpoint: &str, down: bool) {
        let mut state = lock(&self.state);
        if down {
            state.faults.down_endpoints.insert(endpoint.to_string());
        } else {
            state.faults.down_endpoints.remove(endpoint);
        }
    }

    pub fn inject_transient_metadata_failures(&self, count: u32) {
        lock(&self.state).faults.transient_metadata_failures = count;
    }

    pub fn inject_not_replicated_yet(&self, count: u32) {
        lock(&self.state).faults.not_replicated_yet = count;
    }

    pub fn inject_incomplete_responses(&self, count: u32) {
        lock(&self.state).faults.incomplete_responses = count;
    }

    /// The node reports an error for packet `seqno` (or any later one) and
    /// drops the connection.
    pub fn fail_node_on_packet(&self, node: &StorageNodeRef, seqno: u64) {
        lock(&self.state)
            .faults
            .node_failures
            .insert(node.node_id(), seqno);
    }

    /// The ack for packet `seqno` carries the next sequence number instead.
    pub fn reorder_ack_on_packet(&self, seqno: u64) {
        lock(&self.state).faults.reorder_ack_at = Some(seqno);
    }

    pub fn fail_connect(&self, node: &StorageNodeRef, times: u32) {
        lock(&self.state)
            .faults
            .connect_failures
            .insert(node.node_id(), times);
    }

    pub fn fail_all_connects(&self, fail: bool) {
        lock(&self.state).faults.fail_all_connects = fail;
    }

    pub fn pause_acks(&self, paused: bool) {
        self.ack_gate.send_replace(paused);
    }

    pub fn set_read_delay(&self, node: &StorageNodeRef, delay: Duration) {
        lock(&self.state)
            .faults
            .read_delays
            .insert(node.node_id(), delay);
    }

    /// The next `times` reads from the node fail.
    pub fn fail_reads(&self, node: &StorageNodeRef, times: u32) {
        lock(&self.state)
            .faults
            .read_failures
            .insert(node.node_id(), times);
    }

    pub fn fail_handshakes(&self, node: &StorageNodeRef, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.faults.handshake_failures.insert(node.node_id());
        } else {
            state.faults.handshake_failures.remove(&node.node_id());
        }
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        lock(&self.state).faults.handshake_delay = delay;
    }

    // observations

    pub fn metadata_calls(&self) -> Vec<String> {
        lock(&self.state).metadata_calls.clone()
    }

    pub fn packets_sent(&self) -> usize {
        lock(&self.state).packets_sent
    }

    pub fn abandoned_blocks(&self) -> Vec<ExtendedBlock> {
        lock(&self.state).abandoned.clone()
    }

    pub fn reads(&self, node: &StorageNodeRef) -> usize {
        lock(&self.state)
            .reads
            .get(&node.node_id())
            .copied()
            .unwrap_or(0)
    }

    pub fn handshakes(&self) -> usize {
        lock(&self.state).handshakes
    }

    fn check_endpoint(state: &mut ClusterState, endpoint: &Endpoint) -> DfsResult<()> {
        let id = endpoint.to_string();
        state.metadata_calls.push(id.clone());
        if state.faults.down_endpoints.contains(&id) {
            return Err(DfsError::EndpointUnavailable(format!(
                "connection to {} refused",
                id
            )));
        }
        if state.faults.transient_metadata_failures > 0 {
            state.faults.transient_metadata_failures -= 1;
            return Err(DfsError::Network("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn find_block_mut<'a>(
        state: &'a mut ClusterState,
        block_id: u64,
    ) -> Option<&'a mut LocatedBlock> {
        state
            .files
            .values_mut()
            .flat_map(|f| f.blocks.iter_mut())
            .find(|b| b.block.block_id == block_id)
    }
}

#[async_trait]
impl MetadataProtocol for TestCluster {
    async fn get_block_locations(
        &self,
        endpoint: &Endpoint,
        _token: &AccessToken,
        path: &str,
        _offset: u64,
        _length: u64,
    ) -> DfsResult<LocatedBlocks> {
        {
            let mut state = lock(&self.state);
            Self::check_endpoint(&mut state, endpoint)?;
            if !state.files.contains_key(path) {
                return Err(DfsError::NotFound(path.to_string()));
            }
        }
        Ok(self.located_blocks(path))
    }

    async fn add_block(
        &self,
        endpoint: &Endpoint,
        _token: &AccessToken,
        path: &str,
        previous: Option<&ExtendedBlock>,
        excluded: &[StorageNodeRef],
    ) -> DfsResult<LocatedBlock> {
        let mut state = lock(&self.state);
        Self::check_endpoint(&mut state, endpoint)?;
        if state.faults.not_replicated_yet > 0 {
            state.faults.not_replicated_yet -= 1;
            return Err(DfsError::NotReplicatedYet(format!(
                "previous block of {} not replicated yet",
                path
            )));
        }

        if let Some(prev) = previous {
            if let Some(located) = Self::find_block_mut(&mut state, prev.block_id) {
                located.block = prev.clone();
            }
        }

        let replication = state.replication;
        let locations: Vec<StorageNodeRef> = state
            .nodes
            .iter()
            .filter(|n| !excluded.iter().any(|e| e.same_node(n)))
            .take(replication)
            .cloned()
            .collect();
        if locations.is_empty() {
            return Err(DfsError::ResourceExhausted(format!(
                "no storage nodes available for {}",
                path
            )));
        }

        let block = ExtendedBlock::new(state.next_block_id, state.next_generation);
        state.next_block_id += 1;
        state.next_generation += 1;

        let file = state
            .files
            .entry(path.to_string())
            .or_insert_with(|| FileEntry {
                blocks: Vec::new(),
                complete: false,
            });
        let offset = file.blocks.iter().map(|b| b.block.num_bytes).sum();
        let located = LocatedBlock {
            block,
            offset,
            locations,
            token: AccessToken(TEST_TOKEN.to_string()),
        };
        file.blocks.push(located.clone());
        Ok(located)
    }

    async fn abandon_block(
        &self,
        endpoint: &Endpoint,
        _token: &AccessToken,
        path: &str,
        block: &ExtendedBlock,
    ) -> DfsResult<()> {
        let mut state = lock(&self.state);
        Self::check_endpoint(&mut state, endpoint)?;
        if let Some(file) = state.files.get_mut(path) {
            file.blocks.retain(|b| b.block.block_id != block.block_id);
        }
        state.abandoned.push(block.clone());
        Ok(())
    }

    async fn get_additional_datanode(
        &self,
        endpoint: &Endpoint,
        _token: &AccessToken,
        _path: &str,
        block: &ExtendedBlock,
        existing: &[StorageNodeRef],
        excluded: &[StorageNodeRef],
    ) -> DfsResult<StorageNodeRef> {
        let mut state = lock(&self.state);
        Self::check_endpoint(&mut state, endpoint)?;
        state
            .nodes
            .iter()
            .find(|n| {
                !existing.iter().any(|e| e.same_node(n)) && !excluded.iter().any(|e| e.same_node(n))
            })
            .cloned()
            .ok_or_else(|| {
                DfsError::ResourceExhausted(format!("no additional node for {}", block))
            })
    }

    async fn update_block_for_pipeline(
        &self,
        endpoint: &Endpoint,
        _token: &AccessToken,
        block: &ExtendedBlock,
    ) -> DfsResult<LocatedBlock> {
        let mut state = lock(&self.state);
        Self::check_endpoint(&mut state, endpoint)?;
        let generation_stamp = state.next_generation;
        state.next_generation += 1;
        Ok(LocatedBlock {
            block: ExtendedBlock {
                block_id: block.block_id,
                generation_stamp,
                num_bytes: block.num_bytes,
            },
            offset: 0,
            locations: Vec::new(),
            token: AccessToken(TEST_TOKEN.to_string()),
        })
    }

    async fn update_pipeline(
        &self,
        endpoint: &Endpoint,
        _token: &AccessToken,
        _old_block: &ExtendedBlock,
        new_block: &ExtendedBlock,
        nodes: &[StorageNodeRef],
    ) -> DfsResult<()> {
        let mut state = lock(&self.state);
        Self::check_endpoint(&mut state, endpoint)?;
        if let Some(located) = Self::find_block_mut(&mut state, new_block.block_id) {
            located.block.generation_stamp = new_block.generation_stamp;
            located.locations = nodes.to_vec();
        }
        Ok(())
    }

    async fn complete(
        &self,
        endpoint: &Endpoint,
        _token: &AccessToken,
        path: &str,
        last: Option<&ExtendedBlock>,
    ) -> DfsResult<bool> {
        let mut state = lock(&self.state);
        Self::check_endpoint(&mut state, endpoint)?;
        if let Some(last) = last {
            if let Some(located) = Self::find_block_mut(&mut state, last.block_id) {
                located.block = last.clone();
            }
        }
        if state.faults.incomplete_responses > 0 {
            state.faults.incomplete_responses -= 1;
            return Ok(false);
        }
        let file = state
            .files
            .entry(path.to_string())
            .or_insert_with(|| FileEntry {
                blocks: Vec::new(),
                complete: false,
            });
        file.complete = true;
        Ok(true)
    }
}

struct FakeSink {
    state: Arc<Mutex<ClusterState>>,
    block: ExtendedBlock,
    targets: Vec<StorageNodeRef>,
    acks: Option<mpsc::UnboundedSender<PipelineAck>>,
    broken: Option<usize>,
}

#[async_trait]
impl PacketSink for FakeSink {
    async fn send_packet(&mut self, packet: &Packet) -> DfsResult<()> {
        if let Some(index) = self.broken {
            return Err(DfsError::PipelineNodeFailed {
                index,
                reason: "connection closed".to_string(),
            });
        }

        let checksum = DataChecksum::new(ChecksumType::Crc32c, TEST_BYTES_PER_CHECKSUM)?;
        let mut ack = PipelineAck::success(packet.seqno, self.targets.len());
        {
            let mut state = lock(&self.state);
            state.packets_sent += 1;

            let failing = self.targets.iter().position(|t| {
                state
                    .faults
                    .node_failures
                    .get(&t.node_id())
                    .map(|seqno| *seqno <= packet.seqno)
                    .unwrap_or(false)
            });
            let healthy = failing.unwrap_or(self.targets.len());
            let corrupt = !packet.checksums.is_empty()
                && checksum
                    .verify(&packet.data, &packet.checksums, packet.offset_in_block)
                    .is_err();

            for (i, target) in self.targets[..healthy].iter().enumerate() {
                if corrupt {
                    ack.replies[i] = AckStatus::ErrorChecksum;
                    break;
                }
                let replica = state
                    .replicas
                    .entry((target.node_id(), self.block.block_id))
                    .or_insert_with(|| Replica {
                        generation_stamp: self.block.generation_stamp,
                        data: Vec::new(),
                    });
                replica.generation_stamp = self.block.generation_stamp;
                write_packet(replica, packet);
            }

            if let Some(index) = failing {
                state.faults.node_failures.remove(&self.targets[index].node_id());
                ack.replies[index] = AckStatus::Error;
                self.broken = Some(index);
            } else if state.faults.reorder_ack_at == Some(packet.seqno) {
                state.faults.reorder_ack_at = None;
                ack.seqno += 1;
            }
        }

        if let Some(acks) = self.acks.as_ref() {
            let _ = acks.send(ack);
        }
        Ok(())
    }

    async fn close(&mut self) -> DfsResult<()> {
        self.acks = None;
        Ok(())
    }
}

struct FakeAcks {
    acks: mpsc::UnboundedReceiver<PipelineAck>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl AckStream for FakeAcks {
    async fn next_ack(&mut self) -> DfsResult<Option<PipelineAck>> {
        let _ = self.gate.wait_for(|paused| !*paused).await;
        Ok(self.acks.recv().await)
    }
}

#[async_trait]
impl DataTransfer for TestCluster {
    async fn connect_pipeline(
        &self,
        block: &ExtendedBlock,
        targets: &[StorageNodeRef],
        _token: &AccessToken,
        stage: PipelineStage,
    ) -> DfsResult<PipelineConnection> {
        {
            let mut state = lock(&self.state);
            if state.faults.fail_all_connects {
                return Err(DfsError::PipelineNodeFailed {
                    index: 0,
                    reason: "connection refused".to_string(),
                });
            }
            for (index, target) in targets.iter().enumerate() {
                if let Some(remaining) = state.faults.connect_failures.get_mut(&target.node_id()) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(DfsError::PipelineNodeFailed {
                            index,
                            reason: format!("{} refused setup", target),
                        });
                    }
                }
            }

            for target in targets.iter() {
                let key = (target.node_id(), block.block_id);
                match stage {
                    PipelineStage::SetupCreate => {
                        state.replicas.insert(
                            key,
                            Replica {
                                generation_stamp: block.generation_stamp,
                                data: Vec::new(),
                            },
                        );
                    }
                    PipelineStage::SetupStreamingRecovery | PipelineStage::SetupCloseRecovery => {
                        let replica = state.replicas.entry(key).or_insert_with(|| Replica {
                            generation_stamp: block.generation_stamp,
                            data: Vec::new(),
                        });
                        replica.generation_stamp = block.generation_stamp;
                        replica.data.truncate(block.num_bytes as usize);
                    }
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(PipelineConnection {
            sink: Box::new(FakeSink {
                state: self.state.clone(),
                block: block.clone(),
                targets: targets.to_vec(),
                acks: Some(tx),
                broken: None,
            }),
            acks: Box::new(FakeAcks {
                acks: rx,
                gate: self.ack_gate.subscribe(),
            }),
        })
    }

    async fn transfer_block(
        &self,
        source: &StorageNodeRef,
        targets: &[StorageNodeRef],
        block: &ExtendedBlock,
        _token: &AccessToken,
    ) -> DfsResult<()> {
        let mut state = lock(&self.state);
        let data = match state.replicas.get(&(source.node_id(), block.block_id)) {
            Some(replica) if replica.data.len() as u64 >= block.num_bytes => {
                replica.data[..block.num_bytes as usize].to_vec()
            }
            _ => {
                return Err(DfsError::NotFound(format!("{} on {}", block, source)));
            }
        };
        for target in targets.iter() {
            state.replicas.insert(
                (target.node_id(), block.block_id),
                Replica {
                    generation_stamp: block.generation_stamp,
                    data: data.clone(),
                },
            );
        }
        Ok(())
    }

    async fn read_block(
        &self,
        node: &StorageNodeRef,
        block: &ExtendedBlock,
        range: Range<u64>,
        _token: &AccessToken,
    ) -> DfsResult<Vec<u8>> {
        let delay = {
            let mut state = lock(&self.state);
            *state.reads.entry(node.node_id()).or_insert(0) += 1;
            if let Some(remaining) = state.faults.read_failures.get_mut(&node.node_id()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DfsError::Network(format!("{} reset the connection", node)));
                }
            }
            state.faults.read_delays.get(&node.node_id()).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = lock(&self.state);
        let replica = state
            .replicas
            .get(&(node.node_id(), block.block_id))
            .ok_or_else(|| DfsError::NotFound(format!("{} on {}", block, node)))?;
        if replica.generation_stamp != block.generation_stamp {
            return Err(DfsError::ReplicaStale(format!("{} on {}", block, node)));
        }
        let end = (range.end as usize).min(replica.data.len());
        let start = (range.start as usize).min(end);
        Ok(replica.data[start..end].to_vec())
    }

    async fn domain_socket_handshake(
        &self,
        node: &StorageNodeRef,
        block: &ExtendedBlock,
        _token: &AccessToken,
    ) -> DfsResult<ShortCircuitFds> {
        let delay = {
            let mut state = lock(&self.state);
            state.handshakes += 1;
            if state.faults.handshake_failures.contains(&node.node_id()) {
                return Err(DfsError::Network(format!(
                    "domain socket of {} unavailable",
                    node
                )));
            }
            state.faults.handshake_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let data = self
            .replica_data(node, block.block_id)
            .ok_or_else(|| DfsError::NotFound(format!("{} on {}", block, node)))?;
        let checksum = DataChecksum::new(ChecksumType::Crc32c, TEST_BYTES_PER_CHECKSUM)?;
        let meta = checksum.encode_meta(&checksum.compute(&data));

        let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
        let data_path: PathBuf = self
            .replica_dir
            .path()
            .join(format!("blk_{}_{}", block.block_id, seq));
        let meta_path = data_path.with_extension("meta");
        std::fs::write(&data_path, &data)?;
        std::fs::write(&meta_path, &meta)?;

        Ok(ShortCircuitFds {
            data: OwnedFd::from(std::fs::File::open(&data_path)?),
            meta: OwnedFd::from(std::fs::File::open(&meta_path)?),
        })
    }
}
