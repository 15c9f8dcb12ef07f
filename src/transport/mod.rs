//! Receiving side of the snapshot transfer transport.

mod chunks;

use crate::wire::MessageBatch;
use std::path::PathBuf;

pub use chunks::{
    ChunkReassembler, ReassemblyConfig, StorageFault, DEFAULT_GC_INTERVAL_TICKS,
    DEFAULT_MAX_CONCURRENT_SESSIONS, DEFAULT_TIMEOUT_TICKS,
};

/// Delivery-side observer for completed transfers. Both callbacks run
/// synchronously inside the `submit` call that processes the terminal
/// chunk, each exactly once per completed transfer.
pub trait TransferEvents: Send + Sync {
    /// Hands the reassembled snapshot to the consensus engine.
    fn snapshot_received(&self, batch: MessageBatch);
    /// Signals the sending replica that the transfer completed.
    fn transfer_confirmed(&self, group_id: u64, member_id: u64, from: u64);
}

/// Supplies the deployment id chunks must carry to be accepted.
pub trait DeploymentIdSource: Send + Sync {
    fn deployment_id(&self) -> u64;
}

/// Resolves the snapshot root directory for a (group, member) pair.
pub trait SnapshotDirResolver: Send + Sync {
    fn snapshot_dir(&self, group_id: u64, member_id: u64) -> PathBuf;
}
