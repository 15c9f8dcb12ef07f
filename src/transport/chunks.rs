//! Reassembly of snapshot transfers from an at-least-once chunk stream.
//!
//! Chunks for one transfer are serialized by a per-key lock and accepted
//! strictly in sequence order; there is no reordering buffer. Rejected
//! chunks are dropped silently and the sender recovers through its own
//! timeout and restart. Storage faults are not recoverable: continuing
//! after one would risk promoting a corrupt snapshot directory, so they
//! abort the process.

use crate::storage::{ChunkFile, SnapshotEnv, SnapshotEnvError};
use crate::transport::{DeploymentIdSource, SnapshotDirResolver, TransferEvents};
use crate::validator::SnapshotValidator;
use crate::wire::{
    chunk_key, MessageBatch, Snapshot, SnapshotChunk, SnapshotFileInfo, SnapshotMessage,
    RPC_BIN_VERSION,
};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Ticks between garbage-collection sweeps.
pub const DEFAULT_GC_INTERVAL_TICKS: u64 = 30;
/// Ticks without progress after which a transfer is abandoned.
pub const DEFAULT_TIMEOUT_TICKS: u64 = 900;
/// Admission-control cap on concurrently tracked transfers.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 128;

/// Unrecoverable local storage fault. Deliberately distinct from the
/// silent rejection path: a rejected chunk is retried by the sender,
/// while one of these aborts the process.
#[derive(Debug, Error)]
pub enum StorageFault {
    #[error("short write persisting chunk for {key}: wrote {written} of {expected} bytes")]
    ShortWrite {
        key: String,
        written: usize,
        expected: usize,
    },
    #[error("failed to persist chunk for {key}: {source}")]
    Persist { key: String, source: io::Error },
    #[error("chunk for {key} carries file path {path:?} without a file name")]
    InvalidFilePath { key: String, path: PathBuf },
    #[error("failed to probe deletion marker for {key}: {source}")]
    DeletionProbe { key: String, source: io::Error },
    #[error("failed to finalize snapshot for {key}: {source}")]
    Finalize {
        key: String,
        source: SnapshotEnvError,
    },
    #[error("terminal processing for {key} without a tracked first chunk")]
    MissingFirstChunk { key: String },
}

fn abort(fault: StorageFault) -> ! {
    error!("event=snapshot_storage_fault error={fault}");
    panic!("{fault}");
}

/// Construction-time configuration shared by all sessions.
#[derive(Debug, Clone, Copy)]
pub struct ReassemblyConfig {
    pub validate: bool,
    pub gc_interval_ticks: u64,
    pub timeout_ticks: u64,
    pub max_concurrent_sessions: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            validate: true,
            gc_interval_ticks: DEFAULT_GC_INTERVAL_TICKS,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
        }
    }
}

impl ReassemblyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_gc_interval_ticks(mut self, ticks: u64) -> Self {
        self.gc_interval_ticks = ticks.max(1);
        self
    }

    pub fn with_timeout_ticks(mut self, ticks: u64) -> Self {
        self.timeout_ticks = ticks.max(1);
        self
    }

    pub fn with_max_concurrent_sessions(mut self, sessions: usize) -> Self {
        self.max_concurrent_sessions = sessions.max(1);
        self
    }
}

/// In-progress reassembly session, exclusively owned by the reassembler.
struct TrackedTransfer {
    first_chunk: SnapshotChunk,
    extra_files: Vec<SnapshotFileInfo>,
    validator: SnapshotValidator,
    next_chunk: u64,
    tick: u64,
}

/// Session table and key-lock registry, guarded by one table-wide lock.
/// Key locks are created lazily and never removed; the key space is
/// bounded by the set of (group, member) pairs ever seen.
struct TransferTable {
    sessions: HashMap<String, Arc<Mutex<TrackedTransfer>>>,
    locks: HashMap<String, Arc<Mutex<()>>>,
}

/// Receiving-side reassembly engine for snapshot transfers.
///
/// Different transfer keys proceed fully concurrently; all processing
/// for one key is serialized end to end by that key's lock. The table
/// lock only guards map state and is never held across chunk
/// persistence or finalize.
pub struct ChunkReassembler {
    config: ReassemblyConfig,
    current_tick: AtomicU64,
    closed: AtomicBool,
    events: Arc<dyn TransferEvents>,
    deployment: Arc<dyn DeploymentIdSource>,
    resolver: Arc<dyn SnapshotDirResolver>,
    inner: Mutex<TransferTable>,
}

impl ChunkReassembler {
    pub fn new(
        events: Arc<dyn TransferEvents>,
        deployment: Arc<dyn DeploymentIdSource>,
        resolver: Arc<dyn SnapshotDirResolver>,
    ) -> Self {
        Self::with_config(events, deployment, resolver, ReassemblyConfig::default())
    }

    pub fn with_config(
        events: Arc<dyn TransferEvents>,
        deployment: Arc<dyn DeploymentIdSource>,
        resolver: Arc<dyn SnapshotDirResolver>,
        config: ReassemblyConfig,
    ) -> Self {
        Self {
            config,
            current_tick: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            events,
            deployment,
            resolver,
            inner: Mutex::new(TransferTable {
                sessions: HashMap::new(),
                locks: HashMap::new(),
            }),
        }
    }

    /// Accepts one chunk. Returns false when the chunk is dropped; the
    /// sender recovers via its own timeout, no negative acknowledgment
    /// is produced.
    pub fn submit(&self, chunk: SnapshotChunk) -> bool {
        let deployment_id = self.deployment.deployment_id();
        if chunk.deployment_id != deployment_id || chunk.bin_ver != RPC_BIN_VERSION {
            error!(
                "event=snapshot_chunk_rejected reason=epoch key={} deployment_id={} \
                 expected_deployment_id={} bin_ver={} expected_bin_ver={}",
                chunk_key(&chunk),
                chunk.deployment_id,
                deployment_id,
                chunk.bin_ver,
                RPC_BIN_VERSION
            );
            return false;
        }
        let key = chunk_key(&chunk);
        let lock = self.transfer_lock(&key);
        let _serialized = lock.lock();
        self.add_locked(chunk, &key)
    }

    /// Advances the logical clock; every `gc_interval_ticks` the
    /// inactivity sweep runs. Driven by an external periodic caller.
    pub fn tick(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let tick = self.current_tick.fetch_add(1, Ordering::AcqRel) + 1;
        if tick % self.config.gc_interval_ticks == 0 {
            self.gc(tick);
        }
    }

    /// Discards the temp directory of every tracked session and stops
    /// further garbage collection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let table = self.inner.lock();
        for session in table.sessions.values() {
            let td = session.lock();
            self.env_for(&td.first_chunk).remove_temp_dir();
        }
    }

    /// Number of currently tracked sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    fn gc(&self, tick: u64) {
        let mut table = self.inner.lock();
        let timeout = self.config.timeout_ticks;
        let expired: Vec<String> = table
            .sessions
            .iter()
            .filter(|(_, session)| tick.saturating_sub(session.lock().tick) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(session) = table.sessions.remove(&key) {
                let td = session.lock();
                warn!(
                    "event=snapshot_transfer_expired key={} last_progress_tick={} tick={}",
                    key, td.tick, tick
                );
                self.env_for(&td.first_chunk).remove_temp_dir();
            }
        }
    }

    fn tick_now(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }

    /// Get-or-create of the per-key lock; entries are never removed so a
    /// returned lock can outlive any session.
    fn transfer_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut table = self.inner.lock();
        table
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn add_locked(&self, chunk: SnapshotChunk, key: &str) -> bool {
        let Some(session) = self.record(&chunk, key) else {
            return false;
        };
        let env = self.env_for(&chunk);
        match env.is_marked_deleted() {
            Ok(false) => {}
            Ok(true) => {
                env.remove_temp_dir();
                warn!("event=snapshot_chunk_dropped reason=replica_removed key={key}");
                return false;
            }
            Err(err) => abort(StorageFault::DeletionProbe {
                key: key.to_string(),
                source: err,
            }),
        }
        if self.should_validate(&chunk) {
            let mut td = session.lock();
            if !td.validator.add_chunk(&chunk.data, chunk.chunk_id) {
                warn!("event=snapshot_chunk_rejected reason=invalid_payload key={key}");
                return false;
            }
        }
        if let Err(fault) = self.save(&chunk, key) {
            env.remove_temp_dir();
            abort(fault);
        }
        if chunk.is_last_chunk() {
            let accepted = self.complete_transfer(&chunk, &session, &env, key);
            self.reset(key);
            return accepted;
        }
        true
    }

    /// Session-table transition for one chunk. Returns the session the
    /// chunk was accepted into, or None when the chunk is dropped.
    fn record(&self, chunk: &SnapshotChunk, key: &str) -> Option<Arc<Mutex<TrackedTransfer>>> {
        let tick = self.tick_now();
        let mut table = self.inner.lock();
        if chunk.chunk_id == 0 {
            if let Some(prior) = table.sessions.remove(key) {
                // A retried transfer supersedes the unclaimed attempt.
                warn!("event=snapshot_unclaimed_transfer_discarded key={key}");
                let prior = prior.lock();
                self.env_for(&prior.first_chunk).remove_temp_dir();
            } else if table.sessions.len() >= self.config.max_concurrent_sessions {
                error!(
                    "event=snapshot_chunk_rejected reason=capacity key={} sessions={}",
                    key,
                    table.sessions.len()
                );
                return None;
            }
            info!("event=snapshot_first_chunk key={} from={}", key, chunk.from);
            let mut validator = SnapshotValidator::new();
            if self.config.validate
                && !chunk.has_file_info()
                && !validator.add_chunk(&chunk.data, chunk.chunk_id)
            {
                warn!("event=snapshot_chunk_rejected reason=invalid_header key={key}");
                return None;
            }
            let mut td = TrackedTransfer {
                first_chunk: chunk.clone(),
                extra_files: Vec::new(),
                validator,
                next_chunk: 1,
                tick,
            };
            record_file_info(&mut td, chunk);
            let session = Arc::new(Mutex::new(td));
            table.sessions.insert(key.to_string(), session.clone());
            Some(session)
        } else {
            let Some(session) = table.sessions.get(key).cloned() else {
                error!(
                    "event=snapshot_chunk_rejected reason=untracked key={} chunk_id={}",
                    key, chunk.chunk_id
                );
                return None;
            };
            {
                let mut td = session.lock();
                if td.next_chunk != chunk.chunk_id {
                    error!(
                        "event=snapshot_chunk_rejected reason=out_of_order key={} expected={} received={}",
                        key, td.next_chunk, chunk.chunk_id
                    );
                    return None;
                }
                if td.first_chunk.from != chunk.from {
                    error!(
                        "event=snapshot_chunk_rejected reason=source_mismatch key={} from={} expected={}",
                        key, chunk.from, td.first_chunk.from
                    );
                    return None;
                }
                td.next_chunk = chunk.chunk_id + 1;
                record_file_info(&mut td, chunk);
                td.tick = tick;
            }
            Some(session)
        }
    }

    fn should_validate(&self, chunk: &SnapshotChunk) -> bool {
        self.config.validate && !chunk.has_file_info() && chunk.chunk_id != 0
    }

    /// Persists one chunk payload under the transfer's temp directory.
    /// Any failure here is a storage fault; the caller aborts.
    fn save(&self, chunk: &SnapshotChunk, key: &str) -> Result<(), StorageFault> {
        let env = self.env_for(chunk);
        if chunk.chunk_id == 0 {
            env.create_temp_dir()
                .map_err(|err| persist_fault(key, err))?;
        }
        let path = env.temp_dir().join(stored_file_name(chunk, key)?);
        let mut file = if chunk.file_chunk_id == 0 {
            ChunkFile::create(&path)
        } else {
            ChunkFile::open_append(&path)
        }
        .map_err(|err| persist_fault(key, err))?;
        let written = file
            .write(&chunk.data)
            .map_err(|err| persist_fault(key, err))?;
        if written != chunk.data.len() {
            return Err(StorageFault::ShortWrite {
                key: key.to_string(),
                written,
                expected: chunk.data.len(),
            });
        }
        if chunk.is_last_chunk() || chunk.is_last_file_chunk() {
            file.sync().map_err(|err| persist_fault(key, err))?;
        }
        file.close().map_err(|err| persist_fault(key, err))
    }

    /// Terminal-chunk processing: final validation, promotion to the
    /// final directory, synchronous delivery.
    fn complete_transfer(
        &self,
        chunk: &SnapshotChunk,
        session: &Arc<Mutex<TrackedTransfer>>,
        env: &SnapshotEnv,
        key: &str,
    ) -> bool {
        if self.config.validate {
            let validator = {
                let mut td = session.lock();
                mem::take(&mut td.validator)
            };
            if !validator.validate() {
                warn!("event=snapshot_rejected reason=integrity key={key}");
                env.remove_temp_dir();
                return false;
            }
        }
        let message = {
            let td = session.lock();
            self.install_message(&td.first_chunk, &td.extra_files, key)
        };
        let snapshot = message.messages[0].snapshot.clone();
        match env.finalize(&snapshot) {
            Ok(()) => {}
            Err(SnapshotEnvError::OutOfDate) => {
                warn!(
                    "event=snapshot_rejected reason=out_of_date key={} index={}",
                    key, chunk.index
                );
                env.remove_temp_dir();
                return false;
            }
            Err(err) => {
                env.remove_temp_dir();
                abort(StorageFault::Finalize {
                    key: key.to_string(),
                    source: err,
                });
            }
        }
        info!(
            "event=snapshot_received key={} from={} index={} term={}",
            key, chunk.from, chunk.index, chunk.term
        );
        self.events.snapshot_received(message);
        self.events
            .transfer_confirmed(chunk.group_id, chunk.member_id, chunk.from);
        true
    }

    /// Builds the delivery envelope from the session's first chunk, with
    /// every path resolved under the final directory.
    fn install_message(
        &self,
        first: &SnapshotChunk,
        files: &[SnapshotFileInfo],
        key: &str,
    ) -> MessageBatch {
        if first.chunk_id != 0 {
            abort(StorageFault::MissingFirstChunk {
                key: key.to_string(),
            });
        }
        let final_dir = self.env_for(first).final_dir();
        let filepath = match first.filepath.file_name() {
            Some(name) => final_dir.join(name),
            None => abort(StorageFault::InvalidFilePath {
                key: key.to_string(),
                path: first.filepath.clone(),
            }),
        };
        let files = files
            .iter()
            .map(|info| {
                let mut resolved = info.clone();
                resolved.filepath = final_dir.join(info.filename());
                resolved
            })
            .collect();
        let snapshot = Snapshot {
            index: first.index,
            term: first.term,
            on_disk_index: first.on_disk_index,
            membership: first.membership.clone(),
            filepath,
            file_size: first.file_size,
            witness: first.witness,
            files,
        };
        MessageBatch {
            bin_ver: first.bin_ver,
            deployment_id: first.deployment_id,
            messages: vec![SnapshotMessage {
                group_id: first.group_id,
                from: first.from,
                to: first.member_id,
                snapshot,
            }],
        }
    }

    fn reset(&self, key: &str) {
        self.inner.lock().sessions.remove(key);
    }

    fn env_for(&self, chunk: &SnapshotChunk) -> SnapshotEnv {
        let root = self.resolver.snapshot_dir(chunk.group_id, chunk.member_id);
        SnapshotEnv::new(root, chunk.index, chunk.from)
    }
}

fn record_file_info(td: &mut TrackedTransfer, chunk: &SnapshotChunk) {
    if chunk.file_chunk_id == 0 {
        if let Some(info) = &chunk.file_info {
            td.extra_files.push(info.clone());
        }
    }
}

/// Auxiliary files are stored under their delivery name so the promoted
/// directory matches the paths the delivery message resolves to.
fn stored_file_name(chunk: &SnapshotChunk, key: &str) -> Result<OsString, StorageFault> {
    if let Some(info) = &chunk.file_info {
        return Ok(info.filename().into());
    }
    match chunk.filepath.file_name() {
        Some(name) => Ok(name.to_os_string()),
        None => Err(StorageFault::InvalidFilePath {
            key: key.to_string(),
            path: chunk.filepath.clone(),
        }),
    }
}

fn persist_fault(key: &str, err: io::Error) -> StorageFault {
    StorageFault::Persist {
        key: key.to_string(),
        source: err,
    }
}
