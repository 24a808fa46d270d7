use dfs_lib::{DfsClientConfig, DfsError, DfsResult, LocatedBlock, StorageNodeRef};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

use crate::block_reader::ReplicaReader;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HedgedReadMetrics {
    /// Secondary reads started because the threshold elapsed.
    pub ops: u64,
    /// Reads won by a secondary.
    pub wins: u64,
    /// Reads run in the caller's task because the pool was saturated.
    pub executed_in_caller: u64,
}

/// Aborts the task when the losing attempt is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

type Attempt = BoxFuture<'static, (usize, DfsResult<Vec<u8>>)>;

/// Reads a block range from its replicas, starting a read on the next replica
/// whenever the outstanding ones have not answered within the threshold.
pub struct HedgedReadScheduler {
    reader: Arc<dyn ReplicaReader>,
    threshold: Duration,
    /// None when hedging is off and replicas are tried one at a time.
    pool: Option<Arc<Semaphore>>,
    ops: AtomicU64,
    wins: AtomicU64,
    executed_in_caller: AtomicU64,
}

impl HedgedReadScheduler {
    pub fn new(reader: Arc<dyn ReplicaReader>, config: &DfsClientConfig) -> Self {
        let size = config.hedged_read.threadpool_size;
        let pool = if size > 0 {
            info!(
                "hedged reads enabled: threshold {}ms, pool size {}",
                config.hedged_read.threshold_millis, size
            );
            Some(Arc::new(Semaphore::new(size)))
        } else {
            None
        };
        Self {
            reader,
            threshold: config.hedged_read_threshold(),
            pool,
            ops: AtomicU64::new(0),
            wins: AtomicU64::new(0),
            executed_in_caller: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn metrics(&self) -> HedgedReadMetrics {
        HedgedReadMetrics {
            ops: self.ops.load(Ordering::Relaxed),
            wins: self.wins.load(Ordering::Relaxed),
            executed_in_caller: self.executed_in_caller.load(Ordering::Relaxed),
        }
    }

    /// Read `range` of `block` from its replicas in location order. The first
    /// successful read wins and the others are cancelled; when every replica
    /// fails the last error is returned.
    pub async fn read(&self, block: &LocatedBlock, range: Range<u64>) -> DfsResult<Vec<u8>> {
        self.read_from(block, &block.locations, range).await
    }

    /// Like [`read`](Self::read) with an explicit replica preference order.
    pub async fn read_from(
        &self,
        block: &LocatedBlock,
        nodes: &[StorageNodeRef],
        range: Range<u64>,
    ) -> DfsResult<Vec<u8>> {
        if nodes.is_empty() {
            return Err(DfsError::NotFound(format!("no replicas of {}", block.block)));
        }
        match self.pool.as_ref() {
            Some(pool) => self.read_hedged(pool, block, nodes, range).await,
            None => self.read_sequential(block, nodes, range).await,
        }
    }

    async fn read_sequential(
        &self,
        block: &LocatedBlock,
        nodes: &[StorageNodeRef],
        range: Range<u64>,
    ) -> DfsResult<Vec<u8>> {
        let mut last_err = None;
        for node in nodes.iter() {
            match self.reader.read_replica(block, node, range.clone()).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!("read of {} from {} failed: {}", block.block, node, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DfsError::NotFound(block.block.to_string())))
    }

    fn start(
        &self,
        pool: &Arc<Semaphore>,
        index: usize,
        block: &LocatedBlock,
        node: &StorageNodeRef,
        range: Range<u64>,
    ) -> Attempt {
        let reader = self.reader.clone();
        let block = block.clone();
        let node = node.clone();
        match pool.clone().try_acquire_owned() {
            Ok(permit) => {
                let task = tokio::spawn(async move {
                    let _permit = permit;
                    reader.read_replica(&block, &node, range).await
                });
                Box::pin(async move {
                    match AbortOnDrop(task).await {
                        Ok(result) => (index, result),
                        Err(e) => (
                            index,
                            Err(DfsError::Internal(format!("hedged read task failed: {}", e))),
                        ),
                    }
                })
            }
            Err(_) => {
                self.executed_in_caller.fetch_add(1, Ordering::Relaxed);
                debug!("hedged read pool saturated, reading {} in caller", node);
                Box::pin(async move { (index, reader.read_replica(&block, &node, range).await) })
            }
        }
    }

    async fn read_hedged(
        &self,
        pool: &Arc<Semaphore>,
        block: &LocatedBlock,
        nodes: &[StorageNodeRef],
        range: Range<u64>,
    ) -> DfsResult<Vec<u8>> {
        let mut attempts: FuturesUnordered<Attempt> = FuturesUnordered::new();
        let mut hedged = vec![false; nodes.len()];
        let mut next = 0;
        let mut last_err = None;

        attempts.push(self.start(pool, next, block, &nodes[next], range.clone()));
        next += 1;

        loop {
            if attempts.is_empty() {
                if next >= nodes.len() {
                    return Err(last_err
                        .unwrap_or_else(|| DfsError::NotFound(block.block.to_string())));
                }
                attempts.push(self.start(pool, next, block, &nodes[next], range.clone()));
                next += 1;
            }

            let outcome = if next < nodes.len() {
                match tokio::time::timeout(self.threshold, attempts.next()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!(
                            "read of {} slower than {:?}, hedging to {}",
                            block.block, self.threshold, nodes[next]
                        );
                        self.ops.fetch_add(1, Ordering::Relaxed);
                        hedged[next] = true;
                        attempts.push(self.start(pool, next, block, &nodes[next], range.clone()));
                        next += 1;
                        continue;
                    }
                }
            } else {
                attempts.next().await
            };

            match outcome {
                Some((index, Ok(data))) => {
                    if hedged[index] {
                        self.wins.fetch_add(1, Ordering::Relaxed);
                    }
                    // dropping `attempts` cancels the losers
                    return Ok(data);
                }
                Some((index, Err(e))) => {
                    warn!("read of {} from {} failed: {}", block.block, nodes[index], e);
                    last_err = Some(e);
                }
                None => {}
            }
        }
    }
}
