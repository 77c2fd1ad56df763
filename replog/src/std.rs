use replog_api::{
    ConnectionHello, Consistency, ConsumeRequestHeader, LeaveRequestHeader, NodeId,
    ProduceRequestHeader, RequestHeaderCmd, ResponseHeader, ServerInfo,
};
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::result;
use std::sync::Arc;
use tracing::{debug, trace};

use super::{proto, Error, Result};
pub use replog_api::LogOffset;

pub trait Client {
    type InRecord<'a>;
    type OutRecord;
    type Error;
    /// Append a record and wait for it to get commited in the log
    fn produce(&mut self, record: Self::InRecord<'_>) -> result::Result<LogOffset, Self::Error>;
    /// Read a commited record
    fn consume(
        &mut self,
        offset: LogOffset,
        consistency: Consistency,
    ) -> result::Result<Self::OutRecord, Self::Error>;
}

trait Stream: Read + Write + Send {}

impl<T> Stream for T where T: Read + Write + Send {}

fn read_response(conn: &mut dyn Stream) -> Result<Vec<u8>> {
    let mut header_buf = [0u8; ResponseHeader::BYTE_SIZE];
    conn.read_exact(&mut header_buf)?;
    let header = proto::response_header(&header_buf)?;

    let mut body = vec![0u8; proto::body_len(&header)];
    conn.read_exact(&mut body)?;
    trace!(status = ?header.status, len = body.len(), "Response");
    proto::into_result(header.status, body)
}

/// Blocking `replog` client
///
/// A single connection to a single node. Errors other than the ones
/// reported by the server (e.g. [`Error::NotLeader`]) leave the connection
/// in an unknown state; reconnect after them.
pub struct RawClient {
    conn: Box<dyn Stream>,
}

impl Client for RawClient {
    type InRecord<'a> = &'a [u8];
    type OutRecord = Vec<u8>;
    type Error = Error;

    fn produce(&mut self, record: &[u8]) -> Result<LogOffset> {
        RawClient::produce(self, record)
    }

    fn consume(&mut self, offset: LogOffset, consistency: Consistency) -> Result<Vec<u8>> {
        RawClient::consume(self, offset, consistency)
    }
}

impl RawClient {
    pub fn connect(addr: &str) -> Result<Self> {
        debug!(%addr, "Connecting");
        let conn = TcpStream::connect(addr)?;
        conn.set_nodelay(true)?;
        Self::init(Box::new(conn))
    }

    /// Connect using (mutual) TLS
    pub fn connect_tls(addr: &str, config: Arc<ClientConfig>) -> Result<Self> {
        debug!(%addr, "Connecting with TLS");
        let tls = ClientConnection::new(config, proto::server_name(addr)?)?;
        let conn = TcpStream::connect(addr)?;
        conn.set_nodelay(true)?;
        Self::init(Box::new(StreamOwned::new(tls, conn)))
    }

    fn init(mut conn: Box<dyn Stream>) -> Result<Self> {
        let mut hello_buf = [0u8; ConnectionHello::BYTE_SIZE];
        conn.read_exact(&mut hello_buf)?;
        proto::check_hello(&hello_buf)?;
        Ok(Self { conn })
    }

    fn send(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        for part in parts {
            self.conn.write_all(part)?;
        }
        self.conn.flush()
    }

    fn request(&mut self, parts: &[&[u8]]) -> Result<Vec<u8>> {
        self.send(parts)?;
        read_response(self.conn.as_mut())
    }

    /// Append a record and wait for it to get commited
    pub fn produce(&mut self, record: &[u8]) -> Result<LogOffset> {
        let header = proto::request_header(
            RequestHeaderCmd::Produce,
            &ProduceRequestHeader {
                size: proto::record_size(record.len())?,
            },
        );
        let body = self.request(&[&header, record])?;
        proto::produce_response(&body)
    }

    /// Read the commited record at `offset`
    pub fn consume(&mut self, offset: LogOffset, consistency: Consistency) -> Result<Vec<u8>> {
        let header = proto::request_header(
            RequestHeaderCmd::Consume,
            &ConsumeRequestHeader {
                offset,
                consistency,
            },
        );
        let body = self.request(&[&header])?;
        let (_offset, record) = proto::record(body)?;
        Ok(record)
    }

    /// Turn the connection into an endless stream of records, starting at `offset`
    pub fn consume_stream(
        mut self,
        offset: LogOffset,
        consistency: Consistency,
    ) -> Result<ConsumeStream> {
        let header = proto::request_header(
            RequestHeaderCmd::ConsumeStream,
            &ConsumeRequestHeader {
                offset,
                consistency,
            },
        );
        self.send(&[&header])?;
        Ok(ConsumeStream {
            conn: self.conn,
            failed: false,
        })
    }

    /// Add (or update) a member of the cluster
    pub fn join(&mut self, id: NodeId, addr: &str, voter: bool) -> Result<()> {
        let req = proto::join_request(id, addr, voter)?;
        self.request(&[&req])?;
        Ok(())
    }

    /// Remove a member from the cluster
    pub fn leave(&mut self, id: NodeId) -> Result<()> {
        let header = proto::request_header(RequestHeaderCmd::Leave, &LeaveRequestHeader { id });
        self.request(&[&header])?;
        Ok(())
    }

    pub fn get_servers(&mut self) -> Result<Vec<ServerInfo>> {
        let header = proto::request_header(RequestHeaderCmd::GetServers, &());
        let body = self.request(&[&header])?;
        proto::servers(&body)
    }
}

/// Records streamed by the server, see [`RawClient::consume_stream`]
///
/// Blocks waiting for new records once caught up. Ends after the
/// first error.
pub struct ConsumeStream {
    conn: Box<dyn Stream>,
    failed: bool,
}

impl Iterator for ConsumeStream {
    type Item = Result<(LogOffset, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let res = read_response(self.conn.as_mut()).and_then(proto::record);
        if res.is_err() {
            self.failed = true;
        }
        Some(res)
    }
}
