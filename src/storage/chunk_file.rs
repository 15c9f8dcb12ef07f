//! File handle used to persist received chunk payloads.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Append-oriented handle for one file under a transfer's temp
/// directory. Callers must compare the count returned by [`write`] with
/// the payload length; a short write signals a storage fault.
///
/// [`write`]: ChunkFile::write
#[derive(Debug)]
pub struct ChunkFile {
    file: File,
    path: PathBuf,
}

impl ChunkFile {
    /// Creates the file for the first chunk of a stream, truncating any
    /// leftover from a superseded attempt.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Opens the file for a continuation chunk.
    pub fn open_append(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self { file, path })
    }

    /// Writes one payload, returning the number of bytes accepted by the
    /// underlying file.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write(data)
    }

    /// Flushes file content to durable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Consumes the handle, surfacing any close-time error.
    pub fn close(self) -> io::Result<()> {
        drop(self.file);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn create_then_append_concatenates_payloads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stream.dat");

        let mut file = ChunkFile::create(&path).unwrap();
        assert_eq!(file.write(b"AAA").unwrap(), 3);
        file.sync().unwrap();
        file.close().unwrap();

        let mut file = ChunkFile::open_append(&path).unwrap();
        assert_eq!(file.write(b"BBB").unwrap(), 3);
        file.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"AAABBB");
    }

    #[test]
    fn create_truncates_prior_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stream.dat");
        fs::write(&path, b"stale bytes from an abandoned attempt").unwrap();

        let mut file = ChunkFile::create(&path).unwrap();
        file.write(b"fresh").unwrap();
        file.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"fresh");
    }

    #[test]
    fn open_append_requires_existing_file() {
        let tmp = TempDir::new().unwrap();
        let err = ChunkFile::open_append(tmp.path().join("missing.dat")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
