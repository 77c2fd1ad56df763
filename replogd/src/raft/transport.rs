//! Peer connections
//!
//! Peer RPCs travel over the same listener as client requests: a peer
//! connects, waits for [`ConnectionHello`], sends a request header with
//! [`RequestHeaderCmd::Peer`] and from then on the connection carries
//! length-framed [`PeerRequest`]/[`PeerResponse`] pairs.
use std::{
    collections::BTreeMap,
    io::{self, Cursor},
    sync::{Arc, Mutex},
    time::Duration,
};

use binrw::{io::NoSeek, BinRead, BinWrite, Endian};
use convi::ExpectFrom;
use replog_api::{
    peer::{FrameHeader, PeerRequest, PeerResponse},
    ConnectionHello, Membership, NodeId, RequestHeaderCmd, REPLOG_VERSION_0,
    REQUEST_HEADER_SIZE,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{rustls::pki_types::ServerName, TlsConnector};
use tracing::{debug, trace};

use super::{RaftError, RaftResult};

/// Any bidirectional byte stream (plain TCP or TLS)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

fn invalid_data(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Write a single length-prefixed frame
pub async fn write_frame<T>(stream: &mut (impl AsyncWrite + Unpin), value: &T) -> io::Result<()>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut buf = vec![0u8; FrameHeader::BYTE_SIZE];
    value
        .write_options(&mut NoSeek::new(&mut buf), Endian::Big, ())
        .map_err(invalid_data)?;

    let len = u32::expect_from(buf.len() - FrameHeader::BYTE_SIZE);
    if FrameHeader::MAX_LEN < len {
        return Err(invalid_data(format!("frame too large: {len}")));
    }
    FrameHeader { len }
        .write(&mut Cursor::new(&mut buf[..FrameHeader::BYTE_SIZE]))
        .expect("can't fail");

    stream.write_all(&buf).await?;
    stream.flush().await
}

/// Read a single length-prefixed frame
///
/// Returns `None` if the other side closed the connection cleanly.
pub async fn read_frame<T>(stream: &mut (impl AsyncRead + Unpin)) -> io::Result<Option<T>>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let mut header_buf = [0u8; FrameHeader::BYTE_SIZE];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let header = FrameHeader::read(&mut Cursor::new(&header_buf)).map_err(invalid_data)?;
    if FrameHeader::MAX_LEN < header.len {
        return Err(invalid_data(format!("frame too large: {}", header.len)));
    }

    let mut buf = vec![0u8; usize::expect_from(header.len)];
    stream.read_exact(&mut buf).await?;
    T::read_options(&mut Cursor::new(&buf), Endian::Big, ())
        .map(Some)
        .map_err(invalid_data)
}

/// Server name to verify the peer's certificate against
fn server_name(addr: &str) -> io::Result<ServerName<'static>> {
    let host = addr
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(addr)
        .trim_start_matches('[')
        .trim_end_matches(']');
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(invalid_data)
}

/// A connection to a single peer, re-established on demand
pub struct PeerClient {
    id: NodeId,
    addr: String,
    tls: Option<TlsConnector>,
    rpc_timeout: Duration,
    conn: Option<Box<dyn AsyncStream + Sync>>,
}

impl PeerClient {
    fn new(id: NodeId, addr: String, tls: Option<TlsConnector>, rpc_timeout: Duration) -> Self {
        Self {
            id,
            addr,
            tls,
            rpc_timeout,
            conn: None,
        }
    }

    async fn connect(&self) -> io::Result<Box<dyn AsyncStream + Sync>> {
        debug!(peer = %self.id, addr = %self.addr, "Connecting to peer");
        let tcp = TcpStream::connect(&self.addr).await?;
        tcp.set_nodelay(true)?;

        let mut stream: Box<dyn AsyncStream + Sync> = match &self.tls {
            Some(connector) => Box::new(connector.connect(server_name(&self.addr)?, tcp).await?),
            None => Box::new(tcp),
        };

        let mut hello_buf = [0u8; ConnectionHello::BYTE_SIZE];
        stream.read_exact(&mut hello_buf).await?;
        let hello = ConnectionHello::read(&mut Cursor::new(&hello_buf)).map_err(invalid_data)?;
        if hello.version != REPLOG_VERSION_0 {
            return Err(invalid_data(format!(
                "unsupported protocol version: {}",
                hello.version
            )));
        }

        let mut header = [0u8; REQUEST_HEADER_SIZE];
        header[0] = u8::from(RequestHeaderCmd::Peer);
        stream.write_all(&header).await?;

        Ok(stream)
    }

    /// The connection is only put back after a complete exchange, so a
    /// call cancelled halfway never leaves a half-read response behind.
    async fn call_inner(&mut self, req: &PeerRequest) -> io::Result<PeerResponse> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        write_frame(&mut conn, req).await?;
        let resp = read_frame(&mut conn).await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")
        })?;
        self.conn = Some(conn);
        Ok(resp)
    }

    /// Send a request and wait for the response, within the RPC timeout
    ///
    /// On any failure the connection is dropped, to be reconnected on the next call.
    pub async fn call(&mut self, req: &PeerRequest) -> RaftResult<PeerResponse> {
        let res = match timeout(self.rpc_timeout, self.call_inner(req)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "peer rpc timeout")),
        };
        res.map_err(|e| {
            trace!(peer = %self.id, %e, "Peer rpc failed");
            RaftError::Transport(e)
        })
    }
}

/// Outgoing connections to all known peers, by `NodeId`
pub struct PeerClients {
    tls: Option<TlsConnector>,
    rpc_timeout: Duration,
    clients: Mutex<BTreeMap<NodeId, (String, Arc<tokio::sync::Mutex<PeerClient>>)>>,
}

impl PeerClients {
    pub fn new(tls: Option<TlsConnector>, rpc_timeout: Duration) -> Self {
        Self {
            tls,
            rpc_timeout,
            clients: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get the client for `id`, replacing it if the peer moved to another address
    pub fn get(&self, id: NodeId, addr: &str) -> Arc<tokio::sync::Mutex<PeerClient>> {
        let mut clients = self.clients.lock().expect("Locking failed");
        match clients.get(&id) {
            Some((existing_addr, client)) if existing_addr == addr => client.clone(),
            _ => {
                let client = Arc::new(tokio::sync::Mutex::new(PeerClient::new(
                    id,
                    addr.to_owned(),
                    self.tls.clone(),
                    self.rpc_timeout,
                )));
                clients.insert(id, (addr.to_owned(), client.clone()));
                client
            }
        }
    }

    /// Drop connections to nodes that are not members anymore
    pub fn retain(&self, membership: &Membership) {
        self.clients
            .lock()
            .expect("Locking failed")
            .retain(|id, (addr, _)| {
                membership
                    .get(*id)
                    .map(|m| m.addr() == *addr)
                    .unwrap_or(false)
            });
    }

    pub async fn call(&self, id: NodeId, addr: &str, req: &PeerRequest) -> RaftResult<PeerResponse> {
        let client = self.get(id, addr);
        let mut client = client.lock().await;
        client.call(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_api::{peer::RequestVote, LogOffset, TermId};

    #[tokio::test]
    async fn frames_go_through_a_pipe() -> anyhow::Result<()> {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let req = PeerRequest::RequestVote(RequestVote {
            term: TermId(3),
            candidate_id: NodeId(2),
            last_log_index: LogOffset(10),
            last_log_term: TermId(2),
        });
        write_frame(&mut a, &req).await?;
        write_frame(&mut a, &req).await?;
        drop(a);

        assert_eq!(read_frame::<PeerRequest>(&mut b).await?, Some(req.clone()));
        assert_eq!(read_frame::<PeerRequest>(&mut b).await?, Some(req));
        assert_eq!(read_frame::<PeerRequest>(&mut b).await?, None);
        Ok(())
    }

    #[test]
    fn server_name_from_addr() -> anyhow::Result<()> {
        assert_eq!(
            server_name("localhost:4000")?,
            ServerName::try_from("localhost")?
        );
        assert!(matches!(
            server_name("127.0.0.1:4000")?,
            ServerName::IpAddress(_)
        ));
        assert!(matches!(server_name("[::1]:4000")?, ServerName::IpAddress(_)));
        Ok(())
    }
}
