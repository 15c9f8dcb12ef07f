use parking_lot::Mutex;
use snapstream::{
    ChunkReassembler, DeploymentIdSource, Membership, MessageBatch, ReassemblyConfig,
    SnapshotChunk, SnapshotDirResolver, SnapshotEnv, SnapshotFileInfo, SnapshotHeader,
    TransferEvents, RPC_BIN_VERSION,
};
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const DEPLOYMENT_ID: u64 = 42;
const GROUP: u64 = 3;
const MEMBER: u64 = 5;
const SOURCE: u64 = 8;
const INDEX: u64 = 1_000;

#[derive(Default)]
struct RecordedEvents {
    batches: Mutex<Vec<MessageBatch>>,
    confirms: Mutex<Vec<(u64, u64, u64)>>,
}

impl TransferEvents for RecordedEvents {
    fn snapshot_received(&self, batch: MessageBatch) {
        self.batches.lock().push(batch);
    }

    fn transfer_confirmed(&self, group_id: u64, member_id: u64, from: u64) {
        self.confirms.lock().push((group_id, member_id, from));
    }
}

struct FixedDeployment(u64);

impl DeploymentIdSource for FixedDeployment {
    fn deployment_id(&self) -> u64 {
        self.0
    }
}

struct RootResolver(PathBuf);

impl SnapshotDirResolver for RootResolver {
    fn snapshot_dir(&self, group_id: u64, member_id: u64) -> PathBuf {
        self.0.join(format!("g{group_id}-n{member_id}"))
    }
}

fn membership() -> Membership {
    let mut membership = Membership {
        config_change_id: 9,
        ..Membership::default()
    };
    membership.addresses.insert(5, "replica-5:9100".to_string());
    membership.addresses.insert(8, "replica-8:9100".to_string());
    membership.removed.insert(2);
    membership
}

fn base_chunk() -> SnapshotChunk {
    SnapshotChunk {
        deployment_id: DEPLOYMENT_ID,
        bin_ver: RPC_BIN_VERSION,
        group_id: GROUP,
        member_id: MEMBER,
        from: SOURCE,
        index: INDEX,
        term: 7,
        on_disk_index: 950,
        membership: membership(),
        filepath: PathBuf::from("snapshot.dat"),
        file_size: 0,
        chunk_id: 0,
        file_chunk_id: 0,
        last_chunk: false,
        last_file_chunk: false,
        data: Vec::new(),
        file_info: None,
        witness: false,
    }
}

fn main_chunk(chunk_id: u64, data: &[u8]) -> SnapshotChunk {
    SnapshotChunk {
        chunk_id,
        file_chunk_id: chunk_id,
        data: data.to_vec(),
        ..base_chunk()
    }
}

#[test]
fn validated_transfer_with_auxiliary_file_is_promoted_and_delivered() -> Result<(), Box<dyn Error>>
{
    let tmp = TempDir::new()?;
    let events = Arc::new(RecordedEvents::default());
    let reassembler = ChunkReassembler::new(
        events.clone(),
        Arc::new(FixedDeployment(DEPLOYMENT_ID)),
        Arc::new(RootResolver(tmp.path().to_path_buf())),
    );

    // Main stream: sealed payload split across two chunks.
    let payload = b"replicated state machine snapshot".repeat(64);
    let framed = SnapshotHeader::seal(&payload);
    let split = framed.len() / 3;
    let mut first = main_chunk(0, &framed[..split]);
    first.file_size = framed.len() as u64;
    assert!(reassembler.submit(first));
    let mut second = main_chunk(1, &framed[split..]);
    second.last_file_chunk = true;
    assert!(reassembler.submit(second));

    // Auxiliary file in two chunks; the descriptor rides on the chunk
    // that opens the file.
    let aux_info = SnapshotFileInfo {
        file_id: 7,
        filepath: PathBuf::from("/remote/state/config.bin"),
        file_size: 12,
        metadata: b"opaque".to_vec(),
    };
    let mut aux_first = base_chunk();
    aux_first.chunk_id = 2;
    aux_first.file_chunk_id = 0;
    aux_first.filepath = aux_info.filepath.clone();
    aux_first.file_info = Some(aux_info.clone());
    aux_first.data = b"aux-head".to_vec();
    assert!(reassembler.submit(aux_first));

    let mut aux_last = base_chunk();
    aux_last.chunk_id = 3;
    aux_last.file_chunk_id = 1;
    aux_last.filepath = aux_info.filepath.clone();
    aux_last.file_info = Some(aux_info.clone());
    aux_last.data = b"-tail".to_vec();
    aux_last.last_chunk = true;
    aux_last.last_file_chunk = true;
    assert!(reassembler.submit(aux_last));

    // Exactly one delivery and one confirm, session gone.
    let batches = events.batches.lock().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(events.confirms.lock().clone(), vec![(GROUP, MEMBER, SOURCE)]);
    assert_eq!(reassembler.session_count(), 0);

    let batch = &batches[0];
    assert_eq!(batch.bin_ver, RPC_BIN_VERSION);
    assert_eq!(batch.deployment_id, DEPLOYMENT_ID);
    let message = &batch.messages[0];
    assert_eq!(message.group_id, GROUP);
    assert_eq!(message.to, MEMBER);
    assert_eq!(message.from, SOURCE);

    // Snapshot metadata rides from the first chunk into the delivery.
    let snapshot = &message.snapshot;
    assert_eq!(snapshot.index, INDEX);
    assert_eq!(snapshot.term, 7);
    assert_eq!(snapshot.on_disk_index, 950);
    assert_eq!(snapshot.membership, membership());
    assert!(!snapshot.witness);
    assert_eq!(snapshot.file_size, framed.len() as u64);

    // All bytes are in the promoted final directory, at resolved paths.
    let final_dir = snapshot.filepath.parent().unwrap();
    assert_eq!(fs::read(&snapshot.filepath)?, framed);
    assert_eq!(snapshot.files.len(), 1);
    let delivered_aux = &snapshot.files[0];
    assert_eq!(delivered_aux.filepath, final_dir.join("external-file-7"));
    assert_eq!(delivered_aux.metadata, b"opaque");
    assert_eq!(fs::read(&delivered_aux.filepath)?, b"aux-head-tail");

    // Finalize left a checksummed, readable metadata record behind.
    let restored = SnapshotEnv::read_metadata(final_dir)?;
    assert_eq!(&restored, snapshot);

    // A retry of the same transfer is now superseded by the final dir.
    let mut retry = main_chunk(0, &framed[..split]);
    retry.file_size = framed.len() as u64;
    assert!(reassembler.submit(retry));
    let mut retry_last = main_chunk(1, &framed[split..]);
    retry_last.last_chunk = true;
    retry_last.last_file_chunk = true;
    assert!(!reassembler.submit(retry_last));
    assert_eq!(events.batches.lock().len(), 1);
    assert_eq!(reassembler.session_count(), 0);

    Ok(())
}

#[test]
fn witness_transfer_round_trips_the_witness_flag() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let events = Arc::new(RecordedEvents::default());
    let reassembler = ChunkReassembler::with_config(
        events.clone(),
        Arc::new(FixedDeployment(DEPLOYMENT_ID)),
        Arc::new(RootResolver(tmp.path().to_path_buf())),
        ReassemblyConfig::new().with_validation(false),
    );

    let mut witness = main_chunk(0, b"witness-stub");
    witness.witness = true;
    witness.last_chunk = true;
    witness.last_file_chunk = true;
    assert!(reassembler.submit(witness));

    let batches = events.batches.lock().clone();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].messages[0].snapshot.witness);
    Ok(())
}
