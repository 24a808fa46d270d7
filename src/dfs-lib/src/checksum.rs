use serde::{Deserialize, Serialize};

use crate::{DfsError, DfsResult};

pub const CHECKSUM_META_VERSION: u16 = 1;
/// version (u16) + checksum type (u8) + bytes per checksum (u32)
pub const CHECKSUM_META_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumType {
    Null,
    Crc32c,
}

impl ChecksumType {
    pub fn id(&self) -> u8 {
        match self {
            ChecksumType::Null => 0,
            ChecksumType::Crc32c => 2,
        }
    }

    pub fn from_id(id: u8) -> DfsResult<Self> {
        match id {
            0 => Ok(ChecksumType::Null),
            2 => Ok(ChecksumType::Crc32c),
            _ => Err(DfsError::CorruptData(format!("unknown checksum type {}", id))),
        }
    }

    pub fn checksum_size(&self) -> usize {
        match self {
            ChecksumType::Null => 0,
            ChecksumType::Crc32c => 4,
        }
    }

    pub fn parse(name: &str) -> DfsResult<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "NULL" => Ok(ChecksumType::Null),
            "CRC32C" => Ok(ChecksumType::Crc32c),
            other => Err(DfsError::InvalidConfig(format!(
                "unsupported checksum type {}",
                other
            ))),
        }
    }
}

/// Per-chunk checksum calculator. Data is split into `bytes_per_checksum`
/// chunks; the last chunk may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChecksum {
    kind: ChecksumType,
    bytes_per_checksum: usize,
}

impl DataChecksum {
    pub fn new(kind: ChecksumType, bytes_per_checksum: usize) -> DfsResult<Self> {
        if bytes_per_checksum == 0 {
            return Err(DfsError::InvalidConfig(
                "bytes per checksum must be positive".to_string(),
            ));
        }
        Ok(Self {
            kind,
            bytes_per_checksum,
        })
    }

    pub fn kind(&self) -> ChecksumType {
        self.kind
    }

    pub fn bytes_per_checksum(&self) -> usize {
        self.bytes_per_checksum
    }

    pub fn checksum_size(&self) -> usize {
        self.kind.checksum_size()
    }

    pub fn num_chunks(&self, len: usize) -> usize {
        len.div_ceil(self.bytes_per_checksum)
    }

    pub fn compute(&self, data: &[u8]) -> Vec<u32> {
        match self.kind {
            ChecksumType::Null => Vec::new(),
            ChecksumType::Crc32c => data
                .chunks(self.bytes_per_checksum)
                .map(crc32c::crc32c)
                .collect(),
        }
    }

    /// Verify `data` against `sums`. `data_offset` is only used to report the
    /// position of a mismatch.
    pub fn verify(&self, data: &[u8], sums: &[u32], data_offset: u64) -> DfsResult<()> {
        if self.kind == ChecksumType::Null {
            return Ok(());
        }
        let chunks = self.num_chunks(data.len());
        if sums.len() < chunks {
            return Err(DfsError::CorruptData(format!(
                "missing checksums: need {}, got {}",
                chunks,
                sums.len()
            )));
        }
        for (index, chunk) in data.chunks(self.bytes_per_checksum).enumerate() {
            let actual = crc32c::crc32c(chunk);
            if actual != sums[index] {
                let pos = data_offset + (index * self.bytes_per_checksum) as u64;
                return Err(DfsError::CorruptData(format!(
                    "checksum mismatch at offset {}: expected {:#010x}, got {:#010x}",
                    pos, sums[index], actual
                )));
            }
        }
        Ok(())
    }

    pub fn to_header(&self) -> [u8; CHECKSUM_META_HEADER_LEN] {
        let mut header = [0u8; CHECKSUM_META_HEADER_LEN];
        header[0..2].copy_from_slice(&CHECKSUM_META_VERSION.to_be_bytes());
        header[2] = self.kind.id();
        header[3..7].copy_from_slice(&(self.bytes_per_checksum as u32).to_be_bytes());
        header
    }

    pub fn from_header(header: &[u8]) -> DfsResult<Self> {
        if header.len() < CHECKSUM_META_HEADER_LEN {
            return Err(DfsError::CorruptData(format!(
                "checksum header too short: {} bytes",
                header.len()
            )));
        }
        let version = u16::from_be_bytes([header[0], header[1]]);
        if version != CHECKSUM_META_VERSION {
            return Err(DfsError::CorruptData(format!(
                "unsupported checksum meta version {}",
                version
            )));
        }
        let kind = ChecksumType::from_id(header[2])?;
        let bpc = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
        Self::new(kind, bpc as usize)
            .map_err(|_| DfsError::CorruptData("zero bytes per checksum in header".to_string()))
    }

    /// Serialize a checksum meta file: header followed by big-endian sums.
    pub fn encode_meta(&self, sums: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHECKSUM_META_HEADER_LEN + sums.len() * 4);
        out.extend_from_slice(&self.to_header());
        for sum in sums {
            out.extend_from_slice(&sum.to_be_bytes());
        }
        out
    }

    pub fn decode_sums(bytes: &[u8]) -> DfsResult<Vec<u32>> {
        if bytes.len() % 4 != 0 {
            return Err(DfsError::CorruptData(format!(
                "checksum region length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
