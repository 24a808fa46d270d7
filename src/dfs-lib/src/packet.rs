use std::time::Instant;

/// One unit of a block write. Immutable once built; the pipeline keeps it in
/// its resend queue until every node has acknowledged it.
#[derive(Debug)]
pub struct Packet {
    pub seqno: u64,
    pub offset_in_block: u64,
    pub data: Vec<u8>,
    pub checksums: Vec<u32>,
    pub last_packet_in_block: bool,
    pub created_at: Instant,
}

impl Packet {
    pub fn new(
        seqno: u64,
        offset_in_block: u64,
        data: Vec<u8>,
        checksums: Vec<u32>,
        last_packet_in_block: bool,
    ) -> Self {
        Self {
            seqno,
            offset_in_block,
            data,
            checksums,
            last_packet_in_block,
            created_at: Instant::now(),
        }
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Offset in the block just past the last byte carried by this packet.
    pub fn end_offset(&self) -> u64 {
        self.offset_in_block + self.data.len() as u64
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Success,
    Error,
    ErrorChecksum,
}

/// Acknowledgement for one packet, with one status per node of the chain in
/// send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineAck {
    pub seqno: u64,
    pub replies: Vec<AckStatus>,
}

impl PipelineAck {
    pub fn success(seqno: u64, nodes: usize) -> Self {
        Self {
            seqno,
            replies: vec![AckStatus::Success; nodes],
        }
    }

    pub fn is_success(&self) -> bool {
        self.replies.iter().all(|r| *r == AckStatus::Success)
    }

    pub fn first_bad_node(&self) -> Option<usize> {
        self.replies.iter().position(|r| *r != AckStatus::Success)
    }
}
