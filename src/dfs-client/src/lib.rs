// Client-side resilience and fast-path I/O for the distributed filesystem:
// metadata retry and failover, block write pipelines with recovery,
// short-circuit local reads and hedged replica reads.

mod block_reader;
mod buffer_pool;
mod client;
mod failover;
mod hedged_read;
mod metadata;
mod pipeline;
mod retry;
mod short_circuit;

#[cfg(test)]
mod client_tests;
#[cfg(test)]
mod test_cluster;

pub use block_reader::{BlockReaderFactory, ReplicaReader};
pub use buffer_pool::{BufferPool, BufferPoolStats};
pub use client::{DfsClient, FileWriter};
pub use failover::{FailoverAction, FailoverController, FailoverState};
pub use hedged_read::{HedgedReadMetrics, HedgedReadScheduler};
pub use metadata::MetadataClient;
pub use pipeline::{
    BlockWritePipeline, ExcludedNodes, PipelineContext, PipelineStatus, ReplaceDatanodeMode,
    ReplaceDatanodeOnFailure,
};
pub use retry::{exponential_delay, RetryDecision, RetryPolicy, RetryState, RetryWindow};
pub use short_circuit::{
    ReplicaKey, ShortCircuitChannelManager, ShortCircuitHandle, ShortCircuitReplica,
};

pub use dfs_lib::*;
