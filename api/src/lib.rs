#![deny(clippy::as_conversions)]

use binrw::{binrw, Endian};
use binrw::{BinRead, BinWrite};
use derive_more::Display;
use std::io::Read;
use std::io::Seek;
use std::ops;

mod net;
pub use self::net::*;

mod log;
pub use self::log::*;

pub mod peer;

/// Logical offset in a log
///
/// In the user visible log every record gets its own offset,
/// starting at `0`, with no gaps. The Raft log uses the same
/// type for its indices, starting at `1`.
#[derive(
    Copy, Clone, Debug, Default, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
)]
#[br(big)]
#[bw(big)]
pub struct LogOffset(pub u64);

impl LogOffset {
    pub const BYTE_SIZE: usize = 8;

    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Previous offset, saturating at zero
    #[must_use]
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl ops::Add<u64> for LogOffset {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl ops::AddAssign<u64> for LogOffset {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl ops::Sub<Self> for LogOffset {
    type Output = u64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Node Id
///
/// Unique within a cluster, assigned by the operator.
#[derive(Copy, Clone, Debug, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[br(big)]
#[bw(big)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const BYTE_SIZE: usize = 8;
}

/// Raft term (election id)
#[derive(
    Copy, Clone, Debug, Default, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
)]
#[br(big)]
#[bw(big)]
pub struct TermId(pub u64);

impl TermId {
    pub const BYTE_SIZE: usize = 8;

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A size of a record
///
/// Even though the type here is `u32`, we store (read&write)
/// only 3Bs - it's just there's no better type to put it in
/// (like `u24`).
#[binrw]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[brw(big)]
pub struct RecordSize(
    #[br(big, parse_with(RecordSize::parse))]
    #[bw(big, write_with(RecordSize::write))]
    pub u32,
);

impl RecordSize {
    pub const BYTE_SIZE: usize = 3;
    /// Largest record that can be described
    pub const MAX: u32 = (1 << 24) - 1;

    fn parse<R: Read + Seek>(reader: &mut R, _endian: Endian, _: ()) -> binrw::BinResult<u32> {
        let mut bytes = [0u8; 3];
        reader.read_exact(&mut bytes)?;
        Ok(u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]))
    }

    fn write<W: binrw::io::Write + binrw::io::Seek>(
        &amount: &u32,
        writer: &mut W,
        _endian: Endian,
        _: (),
    ) -> binrw::BinResult<()> {
        let bytes = amount.to_be_bytes();
        writer.write_all(&bytes[1..])?;

        Ok(())
    }
}

#[test]
fn record_size_uses_three_bytes() {
    use std::io::Cursor;

    let mut buf = vec![];
    RecordSize(0x01_02_03)
        .write(&mut Cursor::new(&mut buf))
        .unwrap();
    assert_eq!(buf, [1, 2, 3]);
    assert_eq!(
        RecordSize::read(&mut Cursor::new(&buf)).unwrap(),
        RecordSize(0x01_02_03)
    );
}
