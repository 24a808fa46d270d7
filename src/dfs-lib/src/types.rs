use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::{DfsError, DfsResult};

pub const DEFAULT_METADATA_RPC_PORT: u16 = 8020;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Active,
    Standby,
}

/// A metadata-service instance the client may talk to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub role: EndpointRole,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, role: EndpointRole) -> Self {
        Self {
            host: host.into(),
            port,
            role,
        }
    }

    /// Parse `host[:port]`, falling back to the default metadata RPC port.
    pub fn parse(addr: &str, role: EndpointRole) -> DfsResult<Self> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(DfsError::InvalidConfig("empty endpoint address".to_string()));
        }
        match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    DfsError::InvalidConfig(format!("invalid port in {}: {}", addr, e))
                })?;
                if host.is_empty() {
                    return Err(DfsError::InvalidConfig(format!(
                        "missing host in endpoint {}",
                        addr
                    )));
                }
                Ok(Self::new(host, port, role))
            }
            None => Ok(Self::new(addr, DEFAULT_METADATA_RPC_PORT, role)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A storage node as seen by the client. `domain_socket_path` is only set when
/// the node advertises a local data-transfer socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageNodeRef {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub domain_socket_path: Option<PathBuf>,
}

impl StorageNodeRef {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            domain_socket_path: None,
        }
    }

    pub fn with_domain_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.domain_socket_path = Some(path.into());
        self
    }

    /// Identity used for exclusion lists and cache keys; the socket path is
    /// an attribute of the node, not part of its identity.
    pub fn node_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn same_node(&self, other: &StorageNodeRef) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for StorageNodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtendedBlock {
    pub block_id: u64,
    pub generation_stamp: u64,
    pub num_bytes: u64,
}

impl ExtendedBlock {
    pub fn new(block_id: u64, generation_stamp: u64) -> Self {
        Self {
            block_id,
            generation_stamp,
            num_bytes: 0,
        }
    }
}

impl fmt::Display for ExtendedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}_{}", self.block_id, self.generation_stamp)
    }
}

/// Opaque credential attached to every RPC and data-transfer request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessToken(pub String);

/// A block plus the ordered set of storage nodes holding (or about to hold) it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlock {
    pub block: ExtendedBlock,
    /// Offset of the first byte of this block within its file.
    pub offset: u64,
    pub locations: Vec<StorageNodeRef>,
    pub token: AccessToken,
}

impl LocatedBlock {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.block.num_bytes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlocks {
    pub file_length: u64,
    pub blocks: Vec<LocatedBlock>,
}

impl LocatedBlocks {
    /// Blocks overlapping `[offset, offset + length)`, in file order.
    pub fn blocks_in_range(&self, offset: u64, length: u64) -> Vec<&LocatedBlock> {
        let end = offset.saturating_add(length);
        self.blocks
            .iter()
            .filter(|b| b.offset < end && b.end_offset() > offset)
            .collect()
    }
}
