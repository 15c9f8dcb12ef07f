//! Integrity validation of the main snapshot stream.
//!
//! The sender frames the snapshot payload with a fixed-size header
//! carrying the payload length and a CRC32 digest; the receiver feeds
//! chunk payloads through a [`SnapshotValidator`] in sequence order and
//! checks the accumulated stream against the header once the terminal
//! chunk has arrived. Auxiliary files are excluded from this stream.

use crc32fast::Hasher;

/// Size in bytes of the header placed at the start of the main stream.
pub const SNAPSHOT_HEADER_SIZE: usize = 24;

const SNAPSHOT_HEADER_MAGIC: u64 = 0x534e_4150_4844_5231;

/// Header framing the main snapshot stream: magic, payload length,
/// payload CRC32, and a CRC32 over the preceding header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub payload_len: u64,
    pub payload_crc: u32,
}

impl SnapshotHeader {
    pub fn new(payload: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(payload);
        Self {
            payload_len: payload.len() as u64,
            payload_crc: hasher.finalize(),
        }
    }

    pub fn encode(&self) -> [u8; SNAPSHOT_HEADER_SIZE] {
        let mut buf = [0u8; SNAPSHOT_HEADER_SIZE];
        buf[0..8].copy_from_slice(&SNAPSHOT_HEADER_MAGIC.to_le_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_crc.to_le_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&buf[0..20]);
        buf[20..24].copy_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    /// Decodes and verifies a header prefix. Returns None when the magic
    /// or the header checksum does not match.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SNAPSHOT_HEADER_SIZE {
            return None;
        }
        let magic = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        if magic != SNAPSHOT_HEADER_MAGIC {
            return None;
        }
        let mut hasher = Hasher::new();
        hasher.update(&bytes[0..20]);
        let header_crc = u32::from_le_bytes(bytes[20..24].try_into().ok()?);
        if hasher.finalize() != header_crc {
            return None;
        }
        Some(Self {
            payload_len: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            payload_crc: u32::from_le_bytes(bytes[16..20].try_into().ok()?),
        })
    }

    /// Frames a payload for transmission: header followed by the payload.
    /// Senders split the result into chunks; tests use it to build valid
    /// streams.
    pub fn seal(payload: &[u8]) -> Vec<u8> {
        let header = Self::new(payload);
        let mut framed = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + payload.len());
        framed.extend_from_slice(&header.encode());
        framed.extend_from_slice(payload);
        framed
    }
}

/// Accumulates the main snapshot stream chunk by chunk and reports
/// pass/fail once the stream is complete. One instance per transfer.
pub struct SnapshotValidator {
    header: Option<SnapshotHeader>,
    digest: Hasher,
    received: u64,
}

impl Default for SnapshotValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotValidator {
    pub fn new() -> Self {
        Self {
            header: None,
            digest: Hasher::new(),
            received: 0,
        }
    }

    /// Feeds one chunk payload. The first chunk must contain the whole
    /// header. Returns false when the chunk cannot belong to a valid
    /// stream; the caller drops the chunk and the transfer.
    pub fn add_chunk(&mut self, data: &[u8], chunk_id: u64) -> bool {
        if chunk_id == 0 {
            if self.header.is_some() {
                return false;
            }
            let Some(header) = SnapshotHeader::decode(data) else {
                return false;
            };
            self.header = Some(header);
            let payload = &data[SNAPSHOT_HEADER_SIZE..];
            self.digest.update(payload);
            self.received = payload.len() as u64;
            true
        } else {
            if self.header.is_none() {
                return false;
            }
            self.digest.update(data);
            self.received += data.len() as u64;
            true
        }
    }

    /// Final verdict over the accumulated stream.
    pub fn validate(self) -> bool {
        match self.header {
            Some(header) => {
                self.received == header.payload_len
                    && self.digest.finalize() == header.payload_crc
            }
            None => false,
        }
    }
}
