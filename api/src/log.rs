//! Log datastructures
//!
//! Every node keeps two logs: the Raft log, which is replicated
//! between the peers, and the user log, which holds only the
//! committed records. This module contains types describing
//! the content of the Raft log and the cluster membership that
//! travels through it.
use binrw::binrw;
use convi::ExpectFrom;

use crate::{LogOffset, NodeId, TermId};

/// Kind of an entry in the Raft log
#[binrw]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[brw(big, repr = u8)]
pub enum EntryKind {
    /// A record produced by a client
    Command = 0,
    /// Appended by every new leader to commit entries of older terms
    Noop = 1,
    /// New cluster membership (payload: [`Membership`])
    Config = 2,
}

/// Raft log entry header
///
/// Every entry in the Raft log is prefixed with this header.
#[binrw]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct RaftEntryHeader {
    /// Term of the leader that created the entry
    pub term: TermId,
    pub kind: EntryKind,
    /// For [`EntryKind::Command`] the user log offset the record will
    /// occupy; for all other kinds the next user log offset.
    ///
    /// Makes applying committed entries idempotent.
    pub record_offset: LogOffset,
}

impl RaftEntryHeader {
    pub const BYTE_SIZE: usize = TermId::BYTE_SIZE + 1 + LogOffset::BYTE_SIZE;

    /// The user log offset right after this entry is applied
    pub fn records_end(&self) -> LogOffset {
        match self.kind {
            EntryKind::Command => self.record_offset.next(),
            EntryKind::Noop | EntryKind::Config => self.record_offset,
        }
    }
}

/// A single cluster member
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct Member {
    pub id: NodeId,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub voter: bool,
    #[br(temp)]
    #[bw(calc = u16::expect_from(addr.len()))]
    addr_len: u16,
    #[br(count = addr_len)]
    addr: Vec<u8>,
}

impl Member {
    pub fn new(id: NodeId, addr: impl Into<String>, voter: bool) -> Self {
        Self {
            id,
            voter,
            addr: addr.into().into_bytes(),
        }
    }

    /// Address the member accepts connections on
    pub fn addr(&self) -> String {
        String::from_utf8_lossy(&self.addr).into_owned()
    }
}

/// Cluster membership, as stored in [`EntryKind::Config`] entries
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[brw(big)]
pub struct Membership {
    #[br(temp)]
    #[bw(calc = u32::expect_from(members.len()))]
    count: u32,
    /// Sorted by [`Member::id`]
    #[br(count = count)]
    members: Vec<Member>,
}

impl Membership {
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        let mut s = Self::default();
        for member in members {
            s.upsert(member);
        }
        s
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn get(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.get(id).map(|m| m.voter).unwrap_or(false)
    }

    pub fn voters(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.voter)
    }

    /// Strict majority of voters
    pub fn quorum(&self) -> usize {
        self.voters().count() / 2 + 1
    }

    /// Insert or replace a member
    pub fn upsert(&mut self, member: Member) {
        match self.members.binary_search_by_key(&member.id, |m| m.id) {
            Ok(i) => self.members[i] = member,
            Err(i) => self.members.insert(i, member),
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Member> {
        let i = self.members.iter().position(|m| m.id == id)?;
        Some(self.members.remove(i))
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::{BinRead, BinWrite};
    use std::io::Cursor;

    #[test]
    fn membership_quorum_counts_voters_only() {
        let mut m = Membership::new([
            Member::new(NodeId(1), "a:1", true),
            Member::new(NodeId(2), "b:1", true),
            Member::new(NodeId(3), "c:1", false),
        ]);
        assert_eq!(m.quorum(), 2);
        m.upsert(Member::new(NodeId(3), "c:1", true));
        assert_eq!(m.quorum(), 2);
        m.upsert(Member::new(NodeId(4), "d:1", true));
        assert_eq!(m.quorum(), 3);
        assert!(m.remove(NodeId(1)).is_some());
        assert_eq!(m.quorum(), 2);
    }

    #[test]
    fn membership_encoding() {
        let m = Membership::new([
            Member::new(NodeId(2), "127.0.0.1:8000", true),
            Member::new(NodeId(1), "[::1]:9000", false),
        ]);

        let mut buf = vec![];
        m.write(&mut Cursor::new(&mut buf)).unwrap();
        let decoded = Membership::read(&mut Cursor::new(&buf)).unwrap();

        assert_eq!(decoded, m);
        assert_eq!(decoded.members()[0].id, NodeId(1));
        assert_eq!(decoded.members()[0].addr(), "[::1]:9000");
    }
}
