//! Wire-level data model for snapshot transfers.
//!
//! The field set and semantics of [`SnapshotChunk`] are compatibility
//! critical: chunk id 0 opens a transfer, file chunk id 0 opens a file,
//! and the terminal flags mark the last chunk of the current file and of
//! the whole transfer. Senders and receivers must agree on all of them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Binary protocol version spoken by this build. Chunks carrying any
/// other version are dropped before touching session state.
pub const RPC_BIN_VERSION: u32 = 1;

/// Cluster membership recorded at the snapshotted index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub config_change_id: u64,
    /// Voting members, replica id to address.
    pub addresses: BTreeMap<u64, String>,
    pub observers: BTreeMap<u64, String>,
    pub witnesses: BTreeMap<u64, String>,
    pub removed: BTreeSet<u64>,
}

/// Descriptor of an auxiliary file bundled with the snapshot stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFileInfo {
    pub file_id: u64,
    /// Path of the file on the sending side; only its base name matters
    /// to the receiver.
    pub filepath: PathBuf,
    pub file_size: u64,
    /// Opaque application metadata attached by the sender.
    pub metadata: Vec<u8>,
}

impl SnapshotFileInfo {
    /// On-disk name the file is stored under once the snapshot is
    /// promoted to its final directory.
    pub fn filename(&self) -> String {
        format!("external-file-{}", self.file_id)
    }
}

/// One unit of a snapshot transfer as received from the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub deployment_id: u64,
    pub bin_ver: u32,
    pub group_id: u64,
    pub member_id: u64,
    /// Replica the transfer originates from.
    pub from: u64,
    pub index: u64,
    pub term: u64,
    pub on_disk_index: u64,
    pub membership: Membership,
    /// Path of the file this chunk belongs to on the sending side.
    pub filepath: PathBuf,
    pub file_size: u64,
    /// Sequence id within the whole transfer, 0 for the first chunk.
    pub chunk_id: u64,
    /// Sequence id within the current file, 0 for its first byte.
    pub file_chunk_id: u64,
    /// Terminal flag for the whole transfer.
    pub last_chunk: bool,
    /// Terminal flag for the current file.
    pub last_file_chunk: bool,
    pub data: Vec<u8>,
    /// Present on every chunk that belongs to an auxiliary file; the
    /// descriptor is recorded when `file_chunk_id` is 0.
    pub file_info: Option<SnapshotFileInfo>,
    /// Witness replicas participate in the protocol but hold no data.
    pub witness: bool,
}

impl SnapshotChunk {
    pub fn is_last_chunk(&self) -> bool {
        self.last_chunk
    }

    pub fn is_last_file_chunk(&self) -> bool {
        self.last_file_chunk
    }

    pub fn has_file_info(&self) -> bool {
        self.file_info.is_some()
    }
}

/// Key identifying the transfer a chunk belongs to. At most one active
/// reassembly session exists per key.
pub fn chunk_key(chunk: &SnapshotChunk) -> String {
    format!("{}:{}:{}", chunk.group_id, chunk.member_id, chunk.index)
}

/// Completed snapshot as handed to the consensus engine, with all paths
/// resolved under the final snapshot directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub on_disk_index: u64,
    pub membership: Membership,
    pub filepath: PathBuf,
    pub file_size: u64,
    pub witness: bool,
    pub files: Vec<SnapshotFileInfo>,
}

/// Install-snapshot notification for one replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub group_id: u64,
    pub from: u64,
    pub to: u64,
    pub snapshot: Snapshot,
}

/// Delivery envelope handed to the received-snapshot callback. Mirrors
/// the transport's message batch so the consensus engine consumes
/// reassembled snapshots through the same path as live traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub bin_ver: u32,
    pub deployment_id: u64,
    pub messages: Vec<SnapshotMessage>,
}
