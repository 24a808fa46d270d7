//! Contracts of the collaborators this layer talks to. The metadata service,
//! the storage-node data-transfer protocol and credential acquisition are
//! provided by the embedding application.

use async_trait::async_trait;
use std::ops::Range;
use std::os::fd::OwnedFd;

use crate::{
    AccessToken, DfsResult, Endpoint, ExtendedBlock, LocatedBlock, LocatedBlocks, Packet,
    PipelineAck, StorageNodeRef,
};

/// RPC stub for the metadata service. Every call names the endpoint it goes
/// to so that failover stays in the caller's hands.
#[async_trait]
pub trait MetadataProtocol: Send + Sync {
    async fn get_block_locations(
        &self,
        endpoint: &Endpoint,
        token: &AccessToken,
        path: &str,
        offset: u64,
        length: u64,
    ) -> DfsResult<LocatedBlocks>;

    /// Allocate the block following `previous` (None for the first block).
    async fn add_block(
        &self,
        endpoint: &Endpoint,
        token: &AccessToken,
        path: &str,
        previous: Option<&ExtendedBlock>,
        excluded: &[StorageNodeRef],
    ) -> DfsResult<LocatedBlock>;

    async fn abandon_block(
        &self,
        endpoint: &Endpoint,
        token: &AccessToken,
        path: &str,
        block: &ExtendedBlock,
    ) -> DfsResult<()>;

    /// Pick a node to replace a failed member of a write pipeline.
    async fn get_additional_datanode(
        &self,
        endpoint: &Endpoint,
        token: &AccessToken,
        path: &str,
        block: &ExtendedBlock,
        existing: &[StorageNodeRef],
        excluded: &[StorageNodeRef],
    ) -> DfsResult<StorageNodeRef>;

    /// Bump the generation stamp of a block under recovery.
    async fn update_block_for_pipeline(
        &self,
        endpoint: &Endpoint,
        token: &AccessToken,
        block: &ExtendedBlock,
    ) -> DfsResult<LocatedBlock>;

    async fn update_pipeline(
        &self,
        endpoint: &Endpoint,
        token: &AccessToken,
        old_block: &ExtendedBlock,
        new_block: &ExtendedBlock,
        nodes: &[StorageNodeRef],
    ) -> DfsResult<()>;

    /// Returns false while the last block is not yet minimally replicated.
    async fn complete(
        &self,
        endpoint: &Endpoint,
        token: &AccessToken,
        path: &str,
        last: Option<&ExtendedBlock>,
    ) -> DfsResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    SetupCreate,
    SetupStreamingRecovery,
    SetupCloseRecovery,
}

/// Sending half of a connected write pipeline.
#[async_trait]
pub trait PacketSink: Send {
    async fn send_packet(&mut self, packet: &Packet) -> DfsResult<()>;
    async fn close(&mut self) -> DfsResult<()>;
}

/// Receiving half of a connected write pipeline.
#[async_trait]
pub trait AckStream: Send {
    /// `Ok(None)` once the chain closed the stream cleanly.
    async fn next_ack(&mut self) -> DfsResult<Option<PipelineAck>>;
}

pub struct PipelineConnection {
    pub sink: Box<dyn PacketSink>,
    pub acks: Box<dyn AckStream>,
}

/// Descriptors received over the storage node's domain socket.
#[derive(Debug)]
pub struct ShortCircuitFds {
    pub data: OwnedFd,
    pub meta: OwnedFd,
}

/// Signal from a storage node that a short-circuit replica must no longer be
/// read locally (block deleted, moved or uncached).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaRevocation {
    pub node: StorageNodeRef,
    pub block_id: u64,
}

#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Connect to `targets[0]`, which connects downstream in order. Returns
    /// once the whole chain acknowledged setup; a node-level failure is
    /// reported as `DfsError::PipelineNodeFailed`.
    async fn connect_pipeline(
        &self,
        block: &ExtendedBlock,
        targets: &[StorageNodeRef],
        token: &AccessToken,
        stage: PipelineStage,
    ) -> DfsResult<PipelineConnection>;

    /// Copy the acknowledged prefix of `block` from `source` to `targets`.
    async fn transfer_block(
        &self,
        source: &StorageNodeRef,
        targets: &[StorageNodeRef],
        block: &ExtendedBlock,
        token: &AccessToken,
    ) -> DfsResult<()>;

    async fn read_block(
        &self,
        node: &StorageNodeRef,
        block: &ExtendedBlock,
        range: Range<u64>,
        token: &AccessToken,
    ) -> DfsResult<Vec<u8>>;

    async fn domain_socket_handshake(
        &self,
        node: &StorageNodeRef,
        block: &ExtendedBlock,
        token: &AccessToken,
    ) -> DfsResult<ShortCircuitFds>;
}

pub trait TokenProvider: Send + Sync {
    fn token_for(&self, endpoint: &Endpoint) -> DfsResult<AccessToken>;
}

pub struct StaticTokenProvider {
    token: AccessToken,
}

impl StaticTokenProvider {
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token_for(&self, _endpoint: &Endpoint) -> DfsResult<AccessToken> {
        Ok(self.token.clone())
    }
}
