//! Peer (Raft) protocol
//!
//! After a connection sends [`crate::RequestHeaderCmd::Peer`], it
//! carries a sequence of [`PeerRequest`] frames, each answered with
//! a matching [`PeerResponse`] frame. Every frame is prefixed with
//! its length ([`FrameHeader`]).
use binrw::{binrw, BinRead, BinWrite};
use convi::ExpectFrom;

use crate::{LogOffset, Membership, NodeId, RaftEntryHeader, TermId};

/// Length prefix of every peer frame
#[derive(BinRead, BinWrite, Debug, Copy, Clone)]
#[br(big)]
#[bw(big)]
pub struct FrameHeader {
    pub len: u32,
}

impl FrameHeader {
    pub const BYTE_SIZE: usize = 4;
    /// Frames larger than that are considered a protocol violation
    pub const MAX_LEN: u32 = 64 * 1024 * 1024;
}

/// Corresponds to the RequestVote RPC
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub struct RequestVote {
    pub term: TermId,
    pub candidate_id: NodeId,
    pub last_log_index: LogOffset,
    pub last_log_term: TermId,
}

#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub struct RequestVoteResponse {
    pub term: TermId,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub vote_granted: bool,
}

/// Single entry shipped inside [`AppendEntries`]
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct PeerEntry {
    pub header: RaftEntryHeader,
    #[br(temp)]
    #[bw(calc = u32::expect_from(payload.len()))]
    len: u32,
    #[br(count = len)]
    pub payload: Vec<u8>,
}

impl PeerEntry {
    pub fn new(header: RaftEntryHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }
}

/// Update send from leader to follower (corresponds to AppendEntries RPC)
///
/// With no `entries` it's just a heartbeat.
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct AppendEntries {
    /// Current term leader thinks it is
    pub term: TermId,
    pub leader_id: NodeId,
    /// Index of the entry immediately preceding `entries`
    pub prev_log_index: LogOffset,
    pub prev_log_term: TermId,
    pub leader_commit: LogOffset,
    #[br(temp)]
    #[bw(calc = u32::expect_from(entries.len()))]
    count: u32,
    #[br(count = count)]
    pub entries: Vec<PeerEntry>,
}

impl AppendEntries {
    pub fn new(
        term: TermId,
        leader_id: NodeId,
        prev_log_index: LogOffset,
        prev_log_term: TermId,
        leader_commit: LogOffset,
        entries: Vec<PeerEntry>,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            leader_commit,
            entries,
        }
    }
}

/// Response from the follower to [`AppendEntries`]
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub struct AppendEntriesResponse {
    pub term: TermId,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub success: bool,
    /// Index of the last entry in the follower's log
    ///
    /// Lets the leader skip back quickly on a mismatch.
    pub last_log_index: LogOffset,
}

/// A chunk of a snapshot (corresponds to InstallSnapshot RPC)
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct InstallSnapshot {
    pub term: TermId,
    pub leader_id: NodeId,
    pub last_included_index: LogOffset,
    pub last_included_term: TermId,
    /// First user log offset contained in the snapshot
    pub records_base: LogOffset,
    /// User log offset right after the last record in the snapshot
    pub records_end: LogOffset,
    pub membership: Membership,
    /// Byte position of `data` within the snapshot stream
    pub chunk_offset: u64,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub done: bool,
    #[br(temp)]
    #[bw(calc = u32::expect_from(data.len()))]
    len: u32,
    #[br(count = len)]
    pub data: Vec<u8>,
}

impl InstallSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        term: TermId,
        leader_id: NodeId,
        last_included_index: LogOffset,
        last_included_term: TermId,
        records_base: LogOffset,
        records_end: LogOffset,
        membership: Membership,
        chunk_offset: u64,
        done: bool,
        data: Vec<u8>,
    ) -> Self {
        Self {
            term,
            leader_id,
            last_included_index,
            last_included_term,
            records_base,
            records_end,
            membership,
            chunk_offset,
            done,
            data,
        }
    }
}

#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub struct InstallSnapshotResponse {
    pub term: TermId,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub success: bool,
}

#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(big)]
pub enum PeerRequest {
    #[brw(magic(1u8))]
    RequestVote(RequestVote),
    #[brw(magic(2u8))]
    AppendEntries(AppendEntries),
    #[brw(magic(3u8))]
    InstallSnapshot(InstallSnapshot),
}

#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub enum PeerResponse {
    #[brw(magic(1u8))]
    RequestVote(RequestVoteResponse),
    #[brw(magic(2u8))]
    AppendEntries(AppendEntriesResponse),
    #[brw(magic(3u8))]
    InstallSnapshot(InstallSnapshotResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryKind, Member};
    use std::io::Cursor;

    #[test]
    fn append_entries_carries_payloads() {
        let req = PeerRequest::AppendEntries(AppendEntries::new(
            TermId(3),
            NodeId(1),
            LogOffset(10),
            TermId(2),
            LogOffset(9),
            vec![
                PeerEntry::new(
                    RaftEntryHeader {
                        term: TermId(3),
                        kind: EntryKind::Command,
                        record_offset: LogOffset(4),
                    },
                    b"hello".to_vec(),
                ),
                PeerEntry::new(
                    RaftEntryHeader {
                        term: TermId(3),
                        kind: EntryKind::Config,
                        record_offset: LogOffset(5),
                    },
                    vec![],
                ),
            ],
        ));

        let mut buf = vec![];
        req.write(&mut Cursor::new(&mut buf)).unwrap();
        assert_eq!(buf[0], 2);

        let PeerRequest::AppendEntries(decoded) = PeerRequest::read(&mut Cursor::new(&buf)).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0].payload, b"hello");
        assert!(decoded.entries[1].payload.is_empty());
    }

    #[test]
    fn install_snapshot_keeps_membership() {
        let req = PeerRequest::InstallSnapshot(InstallSnapshot::new(
            TermId(1),
            NodeId(1),
            LogOffset(20),
            TermId(1),
            LogOffset(0),
            LogOffset(15),
            Membership::new([Member::new(NodeId(1), "localhost:1", true)]),
            0,
            true,
            vec![1, 2, 3],
        ));

        let mut buf = vec![];
        req.write(&mut Cursor::new(&mut buf)).unwrap();
        assert_eq!(PeerRequest::read(&mut Cursor::new(&buf)).unwrap(), req);
    }
}
