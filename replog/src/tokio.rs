use ::tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    join,
    net::TcpStream,
};
use ::tokio_rustls::{rustls::ClientConfig, TlsConnector};
use replog_api::{
    ConnectionHello, Consistency, ConsumeRequestHeader, LeaveRequestHeader, LogOffset, NodeId,
    ProduceRequestHeader, RequestHeaderCmd, ResponseHeader, ServerInfo,
};
use std::{io, sync::Arc};
use tracing::{debug, trace};

use crate::{proto, Error, Result};

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Read one response; `None` if the server closed the connection before it
async fn read_response_opt(conn: &mut (impl AsyncRead + Unpin)) -> Result<Option<Vec<u8>>> {
    let mut header_buf = [0u8; ResponseHeader::BYTE_SIZE];
    match conn.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = proto::response_header(&header_buf)?;

    let mut body = vec![0u8; proto::body_len(&header)];
    conn.read_exact(&mut body).await?;
    trace!(status = ?header.status, len = body.len(), "Response");
    proto::into_result(header.status, body).map(Some)
}

async fn read_response(conn: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    read_response_opt(conn).await?.ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        ))
    })
}

/// Async `replog` client
pub struct AsyncClient {
    conn: Box<dyn AsyncStream>,
}

impl AsyncClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        debug!(%addr, "Connecting");
        let conn = TcpStream::connect(addr).await?;
        conn.set_nodelay(true)?;
        Self::init(Box::new(conn)).await
    }

    /// Connect using (mutual) TLS
    pub async fn connect_tls(addr: &str, config: Arc<ClientConfig>) -> Result<Self> {
        debug!(%addr, "Connecting with TLS");
        let server_name = proto::server_name(addr)?;
        let conn = TcpStream::connect(addr).await?;
        conn.set_nodelay(true)?;
        let conn = TlsConnector::from(config).connect(server_name, conn).await?;
        Self::init(Box::new(conn)).await
    }

    async fn init(mut conn: Box<dyn AsyncStream>) -> Result<Self> {
        let mut hello_buf = [0u8; ConnectionHello::BYTE_SIZE];
        conn.read_exact(&mut hello_buf).await?;
        proto::check_hello(&hello_buf)?;
        Ok(Self { conn })
    }

    async fn send(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        for part in parts {
            self.conn.write_all(part).await?;
        }
        self.conn.flush().await
    }

    async fn request(&mut self, parts: &[&[u8]]) -> Result<Vec<u8>> {
        self.send(parts).await?;
        read_response(&mut self.conn).await
    }

    /// Append a record and wait for it to get commited
    pub async fn produce(&mut self, record: &[u8]) -> Result<LogOffset> {
        let header = proto::request_header(
            RequestHeaderCmd::Produce,
            &ProduceRequestHeader {
                size: proto::record_size(record.len())?,
            },
        );
        let body = self.request(&[&header, record]).await?;
        proto::produce_response(&body)
    }

    /// Read the commited record at `offset`
    pub async fn consume(&mut self, offset: LogOffset, consistency: Consistency) -> Result<Vec<u8>> {
        let header = proto::request_header(
            RequestHeaderCmd::Consume,
            &ConsumeRequestHeader {
                offset,
                consistency,
            },
        );
        let body = self.request(&[&header]).await?;
        let (_offset, record) = proto::record(body)?;
        Ok(record)
    }

    /// Append many records over a single stream
    ///
    /// Records are sent without waiting for responses. Results come back
    /// in the order of `records`; a failed record does not stop the rest.
    pub async fn produce_stream<I, R>(mut self, records: I) -> Result<Vec<Result<LogOffset>>>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        let items = records
            .into_iter()
            .map(|record| proto::produce_stream_item(record.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let count = items.len();

        let header = proto::request_header(RequestHeaderCmd::ProduceStream, &());
        self.conn.write_all(&header).await?;

        let (mut read, mut write) = ::tokio::io::split(self.conn);

        let (write_res, read_res) = join!(
            async {
                for item in &items {
                    write.write_all(item).await?;
                }
                write.write_all(&proto::produce_stream_end()).await?;
                write.flush().await?;
                Ok::<_, Error>(())
            },
            async {
                let mut results = Vec::with_capacity(count);
                while results.len() < count {
                    match read_response_opt(&mut read).await {
                        Ok(Some(body)) => results.push(proto::produce_response(&body)),
                        Ok(None) => break,
                        Err(e @ (Error::Io(_) | Error::Decoding(_))) => return Err(e),
                        Err(e) => results.push(Err(e)),
                    }
                }
                Ok(results)
            }
        );

        write_res?;
        let results = read_res?;
        if results.len() < count {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("got {} responses for {count} records", results.len()),
            )));
        }
        Ok(results)
    }

    /// Turn the connection into an endless stream of records, starting at `offset`
    pub async fn consume_stream(
        mut self,
        offset: LogOffset,
        consistency: Consistency,
    ) -> Result<AsyncConsumeStream> {
        let header = proto::request_header(
            RequestHeaderCmd::ConsumeStream,
            &ConsumeRequestHeader {
                offset,
                consistency,
            },
        );
        self.send(&[&header]).await?;
        Ok(AsyncConsumeStream { conn: self.conn })
    }

    /// Add (or update) a member of the cluster
    pub async fn join(&mut self, id: NodeId, addr: &str, voter: bool) -> Result<()> {
        let req = proto::join_request(id, addr, voter)?;
        self.request(&[&req]).await?;
        Ok(())
    }

    /// Remove a member from the cluster
    pub async fn leave(&mut self, id: NodeId) -> Result<()> {
        let header = proto::request_header(RequestHeaderCmd::Leave, &LeaveRequestHeader { id });
        self.request(&[&header]).await?;
        Ok(())
    }

    pub async fn get_servers(&mut self) -> Result<Vec<ServerInfo>> {
        let header = proto::request_header(RequestHeaderCmd::GetServers, &());
        let body = self.request(&[&header]).await?;
        proto::servers(&body)
    }
}

/// Records streamed by the server, see [`AsyncClient::consume_stream`]
pub struct AsyncConsumeStream {
    conn: Box<dyn AsyncStream>,
}

impl AsyncConsumeStream {
    /// Wait for the next record
    ///
    /// After an error the stream is over.
    pub async fn next(&mut self) -> Result<(LogOffset, Vec<u8>)> {
        let body = read_response(&mut self.conn).await?;
        proto::record(body)
    }
}
