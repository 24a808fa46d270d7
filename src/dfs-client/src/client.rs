use dfs_lib::{
    DataTransfer, DfsClientConfig, DfsError, DfsResult, ErrorKind, ExtendedBlock, LocatedBlock,
    LocatedBlocks, MetadataProtocol, StorageNodeRef, TokenProvider,
};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::block_reader::BlockReaderFactory;
use crate::buffer_pool::{BufferPool, BufferPoolStats};
use crate::failover::FailoverController;
use crate::hedged_read::{HedgedReadMetrics, HedgedReadScheduler};
use crate::metadata::MetadataClient;
use crate::pipeline::{BlockWritePipeline, ExcludedNodes, PipelineContext};
use crate::retry::RetryPolicy;
use crate::short_circuit::ShortCircuitChannelManager;

/// Entry point tying the metadata client, write pipelines and the read path
/// together. Cheap to share behind an `Arc`.
pub struct DfsClient {
    ctx: PipelineContext,
    short_circuit: Option<Arc<ShortCircuitChannelManager>>,
    hedged: HedgedReadScheduler,
}

impl DfsClient {
    /// Spawns the short-circuit watcher when enabled, so it must be called
    /// from a runtime.
    pub fn new(
        config: Arc<DfsClientConfig>,
        metadata: Arc<dyn MetadataProtocol>,
        transfer: Arc<dyn DataTransfer>,
        tokens: Arc<dyn TokenProvider>,
    ) -> DfsResult<Self> {
        config.validate()?;
        if config.endpoints.is_empty() {
            return Err(DfsError::InvalidConfig(
                "no metadata endpoints configured".to_string(),
            ));
        }

        let failover = FailoverController::new(config.endpoints.clone(), &config.failover)?;
        let retry = RetryPolicy::from_config(&config.retry)?;
        let metadata = Arc::new(MetadataClient::new(metadata, tokens, failover, retry));

        let short_circuit = if config.short_circuit.enabled {
            Some(Arc::new(ShortCircuitChannelManager::new(
                &config.short_circuit,
                &config.domain_socket_path,
                transfer.clone(),
            )))
        } else {
            None
        };
        let reader = Arc::new(BlockReaderFactory::new(
            &config,
            transfer.clone(),
            short_circuit.clone(),
        ));
        let hedged = HedgedReadScheduler::new(reader, &config);

        info!(
            "dfs client ready: {} endpoints, short-circuit {}, hedged reads {}",
            config.endpoints.len(),
            short_circuit.is_some(),
            hedged.is_enabled()
        );
        Ok(Self {
            ctx: PipelineContext {
                buffer_pool: Arc::new(BufferPool::new(&config.write.byte_array_manager)),
                excluded: Arc::new(ExcludedNodes::new(config.exclude_nodes_expiry())),
                metadata,
                transfer,
                config,
            },
            short_circuit,
            hedged,
        })
    }

    pub fn config(&self) -> &DfsClientConfig {
        &self.ctx.config
    }

    pub fn metadata(&self) -> &MetadataClient {
        &self.ctx.metadata
    }

    pub fn short_circuit(&self) -> Option<&Arc<ShortCircuitChannelManager>> {
        self.short_circuit.as_ref()
    }

    pub fn hedged_read_metrics(&self) -> HedgedReadMetrics {
        self.hedged.metrics()
    }

    pub fn buffer_pool_stats(&self) -> BufferPoolStats {
        self.ctx.buffer_pool.stats()
    }

    pub fn excluded_nodes(&self) -> Vec<StorageNodeRef> {
        self.ctx.excluded.snapshot()
    }

    /// Start writing a new file. Blocks are allocated lazily on first write.
    pub async fn create(&self, path: &str) -> DfsResult<FileWriter> {
        if !path.starts_with('/') {
            return Err(DfsError::InvalidParam(format!(
                "path must be absolute: {}",
                path
            )));
        }
        Ok(FileWriter {
            ctx: self.ctx.clone(),
            path: path.to_string(),
            pipeline: None,
            last_block: None,
            written: 0,
            closed: false,
        })
    }

    /// Read up to `len` bytes at `offset`. Reading past the end of the file
    /// returns what is there.
    pub async fn read(&self, path: &str, offset: u64, len: u64) -> DfsResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut located = self
            .ctx
            .metadata
            .get_block_locations(path, offset, len)
            .await?;
        let end = offset.saturating_add(len).min(located.file_length);
        let mut out = Vec::with_capacity(end.saturating_sub(offset) as usize);
        let mut pos = offset;
        let mut failures = 0;

        while pos < end {
            let block = block_at(&located, pos, path)?;
            let block_end = end.min(block.end_offset());
            let range = (pos - block.offset)..(block_end - block.offset);
            let err = match self.hedged.read(&block, range.clone()).await {
                Ok(data) if data.len() as u64 == range.end - range.start => {
                    pos += data.len() as u64;
                    out.extend_from_slice(&data);
                    continue;
                }
                Ok(data) => DfsError::Network(format!(
                    "short read of {}: {} of {} bytes",
                    block.block,
                    data.len(),
                    range.end - range.start
                )),
                Err(e) => e,
            };

            if err.kind() == ErrorKind::AuthFailure
                || failures >= self.ctx.config.max_block_acquire_failures
            {
                warn!(
                    "could not obtain {} of {} from any node: {}",
                    block.block, path, err
                );
                return Err(err);
            }
            let wait = self.block_acquire_wait(failures);
            warn!(
                "no live node for {} of {} ({}), refetching locations in {:?}",
                block.block, path, err, wait
            );
            tokio::time::sleep(wait).await;
            failures += 1;
            located = self
                .ctx
                .metadata
                .get_block_locations(path, pos, end - pos)
                .await?;
        }
        Ok(out)
    }

    /// Grows linearly with the failure count, randomized to spread out
    /// readers hitting the same missing block.
    fn block_acquire_wait(&self, failures: u32) -> Duration {
        let window = self.ctx.config.retry.window_base_ms as f64;
        let jitter: f64 = rand::thread_rng().gen();
        let ms = window * failures as f64 + window * (failures + 1) as f64 * jitter;
        Duration::from_millis(ms as u64)
    }
}

fn block_at(located: &LocatedBlocks, pos: u64, path: &str) -> DfsResult<LocatedBlock> {
    located
        .blocks
        .iter()
        .find(|b| b.offset <= pos && pos < b.end_offset())
        .cloned()
        .ok_or_else(|| {
            DfsError::CorruptData(format!("no block of {} covers offset {}", path, pos))
        })
}

/// Sequential writer for one file. Rolls to a new block pipeline every
/// `block_size` bytes and completes the file on close.
pub struct FileWriter {
    ctx: PipelineContext,
    path: String,
    pipeline: Option<BlockWritePipeline>,
    last_block: Option<ExtendedBlock>,
    written: u64,
    closed: bool,
}

impl FileWriter {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bytes accepted so far.
    pub fn pos(&self) -> u64 {
        self.written
    }

    /// Nodes of the block currently being written.
    pub fn pipeline_nodes(&self) -> Vec<StorageNodeRef> {
        self.pipeline
            .as_ref()
            .map(|p| p.nodes())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> DfsResult<()> {
        if self.closed {
            return Err(DfsError::InvalidState(format!("{} is closed", self.path)));
        }
        Ok(())
    }

    pub async fn write(&mut self, mut data: &[u8]) -> DfsResult<()> {
        self.ensure_open()?;
        let block_size = self.ctx.config.block_size;
        while !data.is_empty() {
            if self.pipeline.is_none() {
                let pipeline = BlockWritePipeline::create(
                    self.ctx.clone(),
                    &self.path,
                    self.last_block.as_ref(),
                )
                .await?;
                self.pipeline = Some(pipeline);
            }

            let room = self
                .pipeline
                .as_ref()
                .map(|p| block_size.saturating_sub(p.bytes_in_block()))
                .unwrap_or(0);
            if room == 0 {
                self.end_block().await?;
                continue;
            }

            let n = (room.min(data.len() as u64)) as usize;
            if let Some(pipeline) = self.pipeline.as_mut() {
                pipeline.write(&data[..n]).await?;
            }
            data = &data[n..];
            self.written += n as u64;
        }
        Ok(())
    }

    pub async fn hflush(&mut self) -> DfsResult<()> {
        self.ensure_open()?;
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.hflush().await,
            None => Ok(()),
        }
    }

    pub async fn close(&mut self) -> DfsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.end_block().await?;
        self.complete().await?;
        self.closed = true;
        info!("closed {}, {} bytes", self.path, self.written);
        Ok(())
    }

    async fn end_block(&mut self) -> DfsResult<()> {
        if let Some(mut pipeline) = self.pipeline.take() {
            let block = pipeline.close().await?;
            debug!("finished {} of {}", block, self.path);
            self.last_block = Some(block);
        }
        Ok(())
    }

    /// The metadata service refuses to complete while the last block is not
    /// minimally replicated; poll with a doubling delay.
    async fn complete(&self) -> DfsResult<()> {
        let block_write = &self.ctx.config.block_write;
        let mut delay = Duration::from_millis(block_write.locate_following_block_initial_delay_ms);
        let mut retries = block_write.locate_following_block_retries;
        loop {
            if self
                .ctx
                .metadata
                .complete(&self.path, self.last_block.as_ref())
                .await?
            {
                return Ok(());
            }
            if retries == 0 {
                return Err(DfsError::Timeout(format!(
                    "unable to close {}: last block not replicated yet",
                    self.path
                )));
            }
            retries -= 1;
            warn!("{} not complete yet, retrying in {:?}", self.path, delay);
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}
