//! State that Raft keeps outside of the logs
//!
//! Both files are small and always rewritten as a whole.
use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use binrw::{binrw, io::NoSeek, BinRead, BinWrite};
use replog_api::{LogOffset, Membership, NodeId, TermId};

use crate::{
    ioutil::{read_file_if_exists, write_file_atomically},
    log::LogError,
};

use super::RaftResult;

const STATE_FILE_NAME: &str = "raft.state";
const SNAPSHOT_FILE_NAME: &str = "raft.snapshot";

/// Must be durable before answering any RPC
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[brw(big)]
pub struct PersistentState {
    /// Current term we're aware of
    pub current_term: TermId,
    #[br(temp)]
    #[bw(calc = u8::from(voted_for.is_some()))]
    has_vote: u8,
    /// The peer we voted for in the `current_term`
    #[br(if(has_vote != 0))]
    pub voted_for: Option<NodeId>,
    /// Everything up to this index is known to be committed
    ///
    /// Updated whenever a configuration entry commits, so after a
    /// restart we know which membership is in effect.
    pub commit_floor: LogOffset,
}

/// Describes the point a snapshot (or compaction) was taken at
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct SnapshotMeta {
    pub last_included_index: LogOffset,
    pub last_included_term: TermId,
    /// First offset of the user log the snapshot content starts with
    pub records_base: LogOffset,
    /// User log offset right after `last_included_index` was applied
    pub records_end: LogOffset,
    /// Membership in effect at `last_included_index`
    pub membership: Membership,
}

fn state_path(dir: &Path) -> PathBuf {
    dir.join(STATE_FILE_NAME)
}

fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE_NAME)
}

fn decode<T>(content: &[u8], what: &str) -> RaftResult<T>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    T::read_options(&mut Cursor::new(content), binrw::Endian::Big, ())
        .map_err(|e| LogError::Corrupted(format!("invalid {what} file: {e}")).into())
}

fn encode<T>(value: &T) -> Vec<u8>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut buf = vec![];
    value
        .write_options(&mut NoSeek::new(&mut buf), binrw::Endian::Big, ())
        .expect("can't fail");
    buf
}

pub fn load_state(dir: &Path) -> RaftResult<PersistentState> {
    match read_file_if_exists(&state_path(dir))? {
        Some(content) => decode(&content, STATE_FILE_NAME),
        None => Ok(PersistentState::default()),
    }
}

pub fn save_state(dir: &Path, state: &PersistentState) -> RaftResult<()> {
    Ok(write_file_atomically(&state_path(dir), &encode(state))?)
}

pub fn load_snapshot_meta(dir: &Path) -> RaftResult<Option<SnapshotMeta>> {
    read_file_if_exists(&snapshot_path(dir))?
        .map(|content| decode(&content, SNAPSHOT_FILE_NAME))
        .transpose()
}

pub fn save_snapshot_meta(dir: &Path, meta: &SnapshotMeta) -> RaftResult<()> {
    Ok(write_file_atomically(&snapshot_path(dir), &encode(meta))?)
}
