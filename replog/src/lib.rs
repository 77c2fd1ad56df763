//! Client library for `replogd`
//!
//! [`std::RawClient`] is a blocking client, [`tokio::AsyncClient`] (feature
//! `tokio`) an async one, with support for pipelined produce streams.
//! Both speak plain TCP or mutual TLS.
#![deny(clippy::as_conversions)]

#[cfg(feature = "rmp")]
pub mod rmp;
pub mod std;
#[cfg(feature = "tokio")]
pub mod tokio;

mod proto;

mod error {
    use ::std::io;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("io error: {0}")]
        Io(#[from] io::Error),
        #[error("data decoding error: {0}")]
        Decoding(#[from] binrw::Error),
        #[error("invalid protocol version: {0}")]
        ProtocolVersion(u8),
        #[error("invalid server name: {0}")]
        ServerName(String),
        #[error("tls error: {0}")]
        Tls(#[from] rustls::Error),
        #[error("record too large: {0}B")]
        RecordTooLarge(usize),
        #[error("offset out of range")]
        OffsetOutOfRange,
        #[error("not a leader (leader: {leader:?})")]
        NotLeader { leader: Option<String> },
        #[error("leadership lost, the record may or may not be committed (leader: {leader:?})")]
        LeadershipLost { leader: Option<String> },
        #[error("unauthorized")]
        Unauthorized,
        #[error("invalid request: {0}")]
        Invalid(String),
        #[error("server error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Address of the leader, if the server pointed to one
        pub fn leader(&self) -> Option<&str> {
            match self {
                Error::NotLeader { leader } | Error::LeadershipLost { leader } => leader.as_deref(),
                _ => None,
            }
        }
    }
}

pub use self::error::Error;
pub type Result<T> = ::std::result::Result<T, Error>;

pub use replog_api::{Consistency, LogOffset, Member, NodeId, ServerInfo};
