mod chunk_file;
mod env;

pub use chunk_file::ChunkFile;
pub use env::{SnapshotEnv, SnapshotEnvError};
