//! Receiving-side snapshot chunk reassembly for replicated state
//! machine transports.
//!
//! The crate accepts an unordered arrival stream of chunks belonging to
//! possibly many concurrent snapshot transfers, reconstructs each
//! transfer into an integrity-checked snapshot directory on durable
//! storage, and hands the finished snapshot to the consensus engine
//! exactly once via injected delivery ports.

pub mod storage;
pub mod transport;
pub mod validator;
pub mod wire;

pub use storage::{ChunkFile, SnapshotEnv, SnapshotEnvError};
pub use transport::{
    ChunkReassembler, DeploymentIdSource, ReassemblyConfig, SnapshotDirResolver, StorageFault,
    TransferEvents, DEFAULT_GC_INTERVAL_TICKS, DEFAULT_MAX_CONCURRENT_SESSIONS,
    DEFAULT_TIMEOUT_TICKS,
};
pub use validator::{SnapshotHeader, SnapshotValidator, SNAPSHOT_HEADER_SIZE};
pub use wire::{
    chunk_key, Membership, MessageBatch, Snapshot, SnapshotChunk, SnapshotFileInfo,
    SnapshotMessage, RPC_BIN_VERSION,
};
