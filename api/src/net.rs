use binrw::{binrw, BinRead, BinWrite};
use convi::ExpectFrom;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::{LogOffset, Member, NodeId, RecordSize};

pub const REPLOG_VERSION_0: u8 = 0;

/// Every request is sent as a fixed size header, possibly followed by a payload
pub const REQUEST_HEADER_SIZE: usize = 14;

/// Connection header
///
/// On every connect server sends some initial data.
#[derive(BinRead, BinWrite, Debug, Copy, Clone)]
#[br(big)]
#[bw(big)]
pub struct ConnectionHello {
    /// Protocol version
    pub version: u8,
}

impl ConnectionHello {
    pub const BYTE_SIZE: usize = 1;
}

/// Request header- command
///
/// Every request starts with a one byte command
#[binrw]
#[derive(FromPrimitive, IntoPrimitive, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[repr(u8)]
#[brw(big, repr = u8)]
pub enum RequestHeaderCmd {
    /// Switch the connection to the peer (Raft) protocol
    Peer = 0,
    /// Append a record to the log and wait for it to be commited
    Produce = 8,
    /// Switch the connection into a stream of appends
    ProduceStream = 9,
    /// Read a record
    Consume = 16,
    /// Read records starting at an offset, waiting for new ones
    ConsumeStream = 17,
    /// Add a server to the cluster
    Join = 32,
    /// Remove a server from the cluster
    Leave = 33,
    /// List servers in the cluster
    GetServers = 34,
    #[default]
    Other,
}

/// Arguments for [`RequestHeaderCmd::Produce`]
///
/// Followed by `size` bytes of the record.
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub struct ProduceRequestHeader {
    pub size: RecordSize,
}

/// A single item of [`RequestHeaderCmd::ProduceStream`]
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub enum ProduceStreamItem {
    /// Followed by the record payload
    #[brw(magic(1u8))]
    Record(RecordSize),
    /// Client is done; server will finish responding and close the stream
    #[brw(magic(0u8))]
    End,
}

impl ProduceStreamItem {
    pub const MAX_BYTE_SIZE: usize = 1 + RecordSize::BYTE_SIZE;
}

/// Consistency requested by a reader
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[brw(big, repr = u8)]
pub enum Consistency {
    /// Only the leader may serve the read
    #[default]
    Strong = 0,
    /// Any node may serve the read, possibly stale
    Relaxed = 1,
}

/// Arguments for [`RequestHeaderCmd::Consume`] and [`RequestHeaderCmd::ConsumeStream`]
#[binrw]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct ConsumeRequestHeader {
    pub offset: LogOffset,
    pub consistency: Consistency,
}

/// Arguments for [`RequestHeaderCmd::Join`]
///
/// Followed by `addr_len` bytes of the address.
#[binrw]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct JoinRequestHeader {
    pub id: NodeId,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub voter: bool,
    pub addr_len: u16,
}

/// Arguments for [`RequestHeaderCmd::Leave`]
#[binrw]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct LeaveRequestHeader {
    pub id: NodeId,
}

/// Status of a response
#[binrw]
#[derive(IntoPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[brw(big, repr = u8)]
pub enum Status {
    Ok = 0,
    /// Offset outside of the commited range; body: empty
    OffsetOutOfRange = 1,
    /// Node is not a leader; body: leader address (empty if unknown)
    NotLeader = 2,
    /// Access denied
    Unauthorized = 3,
    /// Malformed request; body: message
    Invalid = 4,
    /// Node failed internally; body: message
    Internal = 5,
    /// Node lost leadership while the request was in flight; outcome unknown,
    /// the record may or may not be committed; body: leader address
    LeadershipLost = 6,
}

/// Every response starts with this header, followed by `len` bytes of the body
#[binrw]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct ResponseHeader {
    pub status: Status,
    pub len: u32,
}

impl ResponseHeader {
    pub const BYTE_SIZE: usize = 1 + 4;

    pub fn ok(len: usize) -> Self {
        Self {
            status: Status::Ok,
            len: u32::expect_from(len),
        }
    }
}

/// Body of a successful produce response
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct ProduceResponse {
    pub offset: LogOffset,
}

impl ProduceResponse {
    pub const BYTE_SIZE: usize = LogOffset::BYTE_SIZE;
}

/// Body of a successful consume response
///
/// Followed by the record payload (`ResponseHeader::len - BYTE_SIZE` bytes).
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct RecordHeader {
    pub offset: LogOffset,
}

impl RecordHeader {
    pub const BYTE_SIZE: usize = LogOffset::BYTE_SIZE;
}

/// A server as reported by [`RequestHeaderCmd::GetServers`]
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct ServerInfo {
    pub member: Member,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub is_leader: bool,
}

/// Body of a successful [`RequestHeaderCmd::GetServers`] response
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[brw(big)]
pub struct GetServersResponse {
    #[br(temp)]
    #[bw(calc = u32::expect_from(servers.len()))]
    count: u32,
    #[br(count = count)]
    pub servers: Vec<ServerInfo>,
}

impl GetServersResponse {
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self { servers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_fits_header() {
        let mut buf = vec![];
        let mut cursor = Cursor::new(&mut buf);
        RequestHeaderCmd::Join.write(&mut cursor).unwrap();
        JoinRequestHeader {
            id: NodeId(7),
            voter: true,
            addr_len: 14,
        }
        .write(&mut cursor)
        .unwrap();
        assert!(buf.len() <= REQUEST_HEADER_SIZE);

        let mut cursor = Cursor::new(&buf);
        assert_eq!(
            RequestHeaderCmd::read(&mut cursor).unwrap(),
            RequestHeaderCmd::Join
        );
        let args = JoinRequestHeader::read(&mut cursor).unwrap();
        assert_eq!(args.id, NodeId(7));
        assert!(args.voter);
    }

    #[test]
    fn produce_stream_item_encoding() {
        let mut buf = vec![];
        ProduceStreamItem::Record(RecordSize(5))
            .write(&mut Cursor::new(&mut buf))
            .unwrap();
        assert_eq!(buf, [1, 0, 0, 5]);

        buf.clear();
        ProduceStreamItem::End
            .write(&mut Cursor::new(&mut buf))
            .unwrap();
        assert_eq!(buf, [0]);
    }
}
