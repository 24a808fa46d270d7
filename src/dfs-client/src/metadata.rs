use dfs_lib::{
    AccessToken, DfsError, DfsResult, Endpoint, ErrorKind, ExtendedBlock, LocatedBlock,
    LocatedBlocks, MetadataProtocol, StorageNodeRef, TokenProvider,
};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::failover::{FailoverAction, FailoverController};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};

/// Metadata RPCs guarded by the retry policy and the failover controller.
///
/// Endpoint-level failures (refused connections, timeouts) go to the failover
/// controller. Other transient failures are first retried on the same
/// endpoint per the retry policy, then handed to failover. Fatal errors are
/// returned as is.
pub struct MetadataClient {
    protocol: Arc<dyn MetadataProtocol>,
    tokens: Arc<dyn TokenProvider>,
    failover: FailoverController,
    retry: RetryPolicy,
}

impl MetadataClient {
    pub fn new(
        protocol: Arc<dyn MetadataProtocol>,
        tokens: Arc<dyn TokenProvider>,
        failover: FailoverController,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            protocol,
            tokens,
            failover,
            retry,
        }
    }

    pub fn failover(&self) -> &FailoverController {
        &self.failover
    }

    async fn invoke<'a, T, F>(&'a self, op: &str, mut call: F) -> DfsResult<T>
    where
        F: FnMut(&'a dyn MetadataProtocol, Endpoint, AccessToken) -> BoxFuture<'a, DfsResult<T>>,
    {
        let mut failover_state = self.failover.begin();
        let mut retry_state = RetryState::new();
        loop {
            let endpoint = self.failover.endpoint_for(&failover_state);
            let token = self.tokens.token_for(&endpoint)?;
            let err = match call(self.protocol.as_ref(), endpoint.clone(), token).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            // answered by the service, the caller decides what to do
            if matches!(err, DfsError::NotReplicatedYet(_)) {
                return Err(err);
            }

            let kind = err.kind();
            let same_endpoint_retry = kind == ErrorKind::ResourceExhausted
                || (kind == ErrorKind::TransientNetwork && !err.is_timeout());
            if same_endpoint_retry {
                let attempt = retry_state.record_failure();
                match self.retry.should_retry(attempt, retry_state.elapsed(), kind) {
                    RetryDecision::Retry { delay } => {
                        warn!(
                            "{} on {} failed (attempt {}), retrying in {:?}: {}",
                            op, endpoint, attempt, delay, err
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    RetryDecision::GiveUp => {
                        if kind == ErrorKind::ResourceExhausted {
                            error!("{} on {} failed: {}", op, endpoint, err);
                            return Err(err);
                        }
                    }
                }
            }

            match self.failover.on_failure(&mut failover_state, &endpoint, &err) {
                FailoverAction::RetrySame { delay } => {
                    debug!("{} retrying {} in {:?}: {}", op, endpoint, delay, err);
                    tokio::time::sleep(delay).await;
                }
                FailoverAction::SwitchTo {
                    endpoint: next,
                    delay,
                } => {
                    info!("{} switching to {} in {:?}", op, next, delay);
                    tokio::time::sleep(delay).await;
                    // the new endpoint gets the full same-endpoint retry budget
                    retry_state = RetryState::new();
                }
                FailoverAction::GiveUp => {
                    error!("{} failed on {}: {}", op, endpoint, err);
                    return Err(err);
                }
            }
        }
    }

    pub async fn get_block_locations(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> DfsResult<LocatedBlocks> {
        self.invoke("getBlockLocations", move |proto, ep, token| {
            Box::pin(async move {
                proto
                    .get_block_locations(&ep, &token, path, offset, length)
                    .await
            })
        })
        .await
    }

    pub async fn add_block(
        &self,
        path: &str,
        previous: Option<&ExtendedBlock>,
        excluded: &[StorageNodeRef],
    ) -> DfsResult<LocatedBlock> {
        self.invoke("addBlock", move |proto, ep, token| {
            Box::pin(async move { proto.add_block(&ep, &token, path, previous, excluded).await })
        })
        .await
    }

    pub async fn abandon_block(&self, path: &str, block: &ExtendedBlock) -> DfsResult<()> {
        self.invoke("abandonBlock", move |proto, ep, token| {
            Box::pin(async move { proto.abandon_block(&ep, &token, path, block).await })
        })
        .await
    }

    pub async fn get_additional_datanode(
        &self,
        path: &str,
        block: &ExtendedBlock,
        existing: &[StorageNodeRef],
        excluded: &[StorageNodeRef],
    ) -> DfsResult<StorageNodeRef> {
        self.invoke("getAdditionalDatanode", move |proto, ep, token| {
            Box::pin(async move {
                proto
                    .get_additional_datanode(&ep, &token, path, block, existing, excluded)
                    .await
            })
        })
        .await
    }

    pub async fn update_block_for_pipeline(&self, block: &ExtendedBlock) -> DfsResult<LocatedBlock> {
        self.invoke("updateBlockForPipeline", move |proto, ep, token| {
            Box::pin(async move { proto.update_block_for_pipeline(&ep, &token, block).await })
        })
        .await
    }

    pub async fn update_pipeline(
        &self,
        old_block: &ExtendedBlock,
        new_block: &ExtendedBlock,
        nodes: &[StorageNodeRef],
    ) -> DfsResult<()> {
        self.invoke("updatePipeline", move |proto, ep, token| {
            Box::pin(async move {
                proto
                    .update_pipeline(&ep, &token, old_block, new_block, nodes)
                    .await
            })
        })
        .await
    }

    pub async fn complete(&self, path: &str, last: Option<&ExtendedBlock>) -> DfsResult<bool> {
        self.invoke("complete", move |proto, ep, token| {
            Box::pin(async move { proto.complete(&ep, &token, path, last).await })
        })
        .await
    }
}
