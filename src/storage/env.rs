//! Per-transfer snapshot directory lifecycle.
//!
//! Chunks are written into a receiving temp directory named after the
//! snapshot index and the source replica. Promotion to the final
//! directory is atomic: a checksummed metadata flag file is written and
//! synced inside the temp directory first, then the whole directory is
//! renamed and the parent directory synced. A replica's snapshot root
//! can carry a deletion marker; transfers targeting it are dropped.

use crate::wire::Snapshot;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SNAPSHOT_DIR_PREFIX: &str = "snapshot-";
const RECEIVING_DIR_SUFFIX: &str = ".receiving";
const SNAPSHOT_METADATA_FILE: &str = "snapshot.metadata";
const DELETED_MARKER_FILE: &str = "DELETED";

#[derive(Debug, Error)]
pub enum SnapshotEnvError {
    /// A finalized snapshot with an equal or higher index already exists.
    #[error("snapshot is out of date")]
    OutOfDate,
    #[error("metadata checksum mismatch in {path}")]
    MetadataChecksum { path: PathBuf },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataRecord {
    checksum: u32,
    snapshot: Snapshot,
}

/// Storage environment for one transfer, rooted at the target replica's
/// snapshot directory.
#[derive(Debug, Clone)]
pub struct SnapshotEnv {
    root_dir: PathBuf,
    index: u64,
    from: u64,
}

impl SnapshotEnv {
    pub fn new(root_dir: impl Into<PathBuf>, index: u64, from: u64) -> Self {
        Self {
            root_dir: root_dir.into(),
            index,
            from,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn temp_dir(&self) -> PathBuf {
        let name = format!(
            "{}{:016X}-{}{}",
            SNAPSHOT_DIR_PREFIX, self.index, self.from, RECEIVING_DIR_SUFFIX
        );
        self.root_dir.join(name)
    }

    pub fn final_dir(&self) -> PathBuf {
        self.root_dir.join(final_dir_name(self.index))
    }

    /// Creates a fresh temp directory, discarding any leftover from a
    /// superseded attempt by the same source.
    pub fn create_temp_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root_dir)?;
        let temp = self.temp_dir();
        match fs::remove_dir_all(&temp) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        fs::create_dir(&temp)
    }

    /// Best-effort removal of the temp directory. Failures are logged and
    /// swallowed; the GC sweep retries removal for sessions it expires.
    pub fn remove_temp_dir(&self) {
        let temp = self.temp_dir();
        match fs::remove_dir_all(&temp) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "event=snapshot_temp_dir_removal_failed dir={} error={}",
                temp.display(),
                err
            ),
        }
    }

    /// True when the replica's snapshot root carries the deletion marker,
    /// meaning the target (group, member) has been removed.
    pub fn is_marked_deleted(&self) -> io::Result<bool> {
        match fs::metadata(self.root_dir.join(DELETED_MARKER_FILE)) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Places the deletion marker in the snapshot root.
    pub fn mark_deleted(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root_dir)?;
        let file = File::create(self.root_dir.join(DELETED_MARKER_FILE))?;
        file.sync_all()
    }

    /// Atomically promotes the temp directory to the final directory.
    /// Returns [`SnapshotEnvError::OutOfDate`] when a finalized snapshot
    /// with an equal or higher index already exists under the root.
    pub fn finalize(&self, snapshot: &Snapshot) -> Result<(), SnapshotEnvError> {
        if self.superseded()? {
            return Err(SnapshotEnvError::OutOfDate);
        }
        self.write_metadata(snapshot)?;
        fs::rename(self.temp_dir(), self.final_dir())?;
        sync_dir(&self.root_dir)?;
        Ok(())
    }

    /// Reads back the metadata flag file of a finalized snapshot
    /// directory, verifying its checksum.
    pub fn read_metadata(dir: &Path) -> Result<Snapshot, SnapshotEnvError> {
        let path = dir.join(SNAPSHOT_METADATA_FILE);
        let record: MetadataRecord = serde_json::from_slice(&fs::read(&path)?)?;
        if metadata_checksum(&record.snapshot)? != record.checksum {
            return Err(SnapshotEnvError::MetadataChecksum { path });
        }
        Ok(record.snapshot)
    }

    fn superseded(&self) -> Result<bool, SnapshotEnvError> {
        let entries = match fs::read_dir(&self.root_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(index) = parse_final_dir_name(&entry.file_name().to_string_lossy()) {
                if index >= self.index {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn write_metadata(&self, snapshot: &Snapshot) -> Result<(), SnapshotEnvError> {
        let record = MetadataRecord {
            checksum: metadata_checksum(snapshot)?,
            snapshot: snapshot.clone(),
        };
        let path = self.temp_dir().join(SNAPSHOT_METADATA_FILE);
        let mut file = File::create(&path)?;
        file.write_all(&serde_json::to_vec_pretty(&record)?)?;
        file.sync_all()?;
        Ok(())
    }
}

fn final_dir_name(index: u64) -> String {
    format!("{}{:016X}", SNAPSHOT_DIR_PREFIX, index)
}

fn parse_final_dir_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SNAPSHOT_DIR_PREFIX)?;
    if digits.len() != 16 {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

fn metadata_checksum(snapshot: &Snapshot) -> Result<u32, serde_json::Error> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&serde_json::to_vec(snapshot)?);
    Ok(hasher.finalize())
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
