use async_trait::async_trait;
use dfs_lib::{DataTransfer, DfsClientConfig, DfsResult, LocatedBlock, StorageNodeRef};
use log::debug;
use std::ops::Range;
use std::sync::Arc;

use crate::short_circuit::ShortCircuitChannelManager;

/// Reads a byte range of one replica of a block.
#[async_trait]
pub trait ReplicaReader: Send + Sync {
    async fn read_replica(
        &self,
        block: &LocatedBlock,
        node: &StorageNodeRef,
        range: Range<u64>,
    ) -> DfsResult<Vec<u8>>;
}

/// Prefers the local short-circuit path and falls back to the network
/// transfer protocol.
pub struct BlockReaderFactory {
    transfer: Arc<dyn DataTransfer>,
    short_circuit: Option<Arc<ShortCircuitChannelManager>>,
    verify_checksum: bool,
}

impl BlockReaderFactory {
    pub fn new(
        config: &DfsClientConfig,
        transfer: Arc<dyn DataTransfer>,
        short_circuit: Option<Arc<ShortCircuitChannelManager>>,
    ) -> Self {
        Self {
            transfer,
            short_circuit,
            verify_checksum: !config.short_circuit.skip_checksum,
        }
    }

    async fn read_local(
        &self,
        manager: &ShortCircuitChannelManager,
        block: &LocatedBlock,
        node: &StorageNodeRef,
        range: Range<u64>,
    ) -> Option<Vec<u8>> {
        let handle = manager.acquire(node, &block.block, &block.token).await?;
        match handle.read(range, self.verify_checksum).await {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(
                    "short-circuit read of {} on {} failed, using network: {}",
                    block.block, node, e
                );
                manager.invalidate(&handle);
                None
            }
        }
    }
}

#[async_trait]
impl ReplicaReader for BlockReaderFactory {
    async fn read_replica(
        &self,
        block: &LocatedBlock,
        node: &StorageNodeRef,
        range: Range<u64>,
    ) -> DfsResult<Vec<u8>> {
        if let Some(manager) = self.short_circuit.as_ref() {
            if let Some(data) = self.read_local(manager, block, node, range.clone()).await {
                return Ok(data);
            }
        }
        self.transfer
            .read_block(node, &block.block, range, &block.token)
            .await
    }
}
