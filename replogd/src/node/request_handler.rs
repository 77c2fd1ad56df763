use binrw::{io::NoSeek, BinRead, BinWrite, Endian};
use convi::ExpectFrom;
use replog_api::{
    peer::PeerRequest, ConnectionHello, Consistency, ConsumeRequestHeader, GetServersResponse,
    JoinRequestHeader, LeaveRequestHeader, LogOffset, Member, ProduceRequestHeader,
    ProduceResponse, ProduceStreamItem, RecordHeader, RecordSize, RequestHeaderCmd,
    ResponseHeader, ServerInfo, Status, REPLOG_VERSION_0, REQUEST_HEADER_SIZE,
};
use std::{
    io::{self, Cursor},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    join,
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    auth::{Action, WILDCARD},
    log::LogError,
    raft::{
        transport::{read_frame, write_frame, AsyncStream},
        MembershipChange, Proposal, RaftError,
    },
    task::AutoJoinHandle,
    tls,
};

use super::NodeShared;

/// Max records read from the log at once while streaming
const CONSUME_STREAM_BATCH: u64 = 256;
/// Max appended, but not yet responded to records of a single produce stream
const PRODUCE_STREAM_QUEUE: usize = 256;
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid data")]
    Invalid,
    #[error("invalid data: {0}")]
    ParseError(#[from] binrw::Error),
    #[error("io: {0}")]
    IO(#[from] io::Error),
    #[error("join: {0}")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("tls handshake timed out")]
    HandshakeTimeout,
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Failure of a single request, reported to the client
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("offset out of range")]
    OffsetOutOfRange,
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Raft(#[from] RaftError),
    #[error(transparent)]
    Log(#[from] LogError),
}

impl ServiceError {
    pub fn status(&self) -> Status {
        match self {
            ServiceError::Unauthorized => Status::Unauthorized,
            ServiceError::OffsetOutOfRange | ServiceError::Log(LogError::OffsetNotFound(_)) => {
                Status::OffsetOutOfRange
            }
            ServiceError::Invalid(_) => Status::Invalid,
            ServiceError::Raft(e) => match e {
                RaftError::NotLeader { .. } => Status::NotLeader,
                RaftError::LeadershipLost => Status::LeadershipLost,
                RaftError::MembershipChangeInProgress
                | RaftError::UnknownMember(_)
                | RaftError::LastVoter => Status::Invalid,
                _ => Status::Internal,
            },
            ServiceError::Log(_) => Status::Internal,
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

pub struct RequestHandler {
    local_addr: SocketAddr,
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl RequestHandler {
    /// Bind `listen_addr` and start serving it on a dedicated thread
    pub fn new(shared: Arc<NodeShared>, listen_addr: SocketAddr) -> anyhow::Result<Self> {
        // bind here, so that a taken port fails node creation
        let listener = std::net::TcpListener::bind(listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .thread_name("replogd-rpc")
            .enable_all()
            .build()?;

        let inner = Arc::new(RequestHandlerInner {
            shared: shared.clone(),
        });

        let join_handle = AutoJoinHandle::spawn_res(
            "request-handler",
            shared.is_node_shutting_down.clone(),
            move || -> Result<(), io::Error> {
                let _guard = scopeguard::guard((), |_| {
                    info!("RequestHandler is done");
                });
                let res: Result<(), io::Error> = rt.block_on(async {
                    let listener = TcpListener::from_std(listener)?;
                    inner.handle_requests(listener).await;
                    Ok(())
                });

                res?;

                info!("Waiting for RequestHandler to complete all connections...");
                rt.shutdown_timeout(Duration::from_secs(10));

                Ok(())
            },
        )?;

        info!(%local_addr, "Listening");

        Ok(Self {
            join_handle,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

struct RequestHandlerInner {
    shared: Arc<NodeShared>,
}

impl RequestHandlerInner {
    async fn handle_requests(self: &Arc<Self>, listener: TcpListener) {
        while !self.shared.is_node_shutting_down() {
            let (stream, peer_addr) =
                // bound by a timeout, so we can exit after `is_node_shutting_down` is set in a reasonable time
                match timeout(Duration::from_millis(500), listener.accept()).await {
                    Ok(Ok(o)) => o,
                    Ok(Err(e)) => {
                        error!(%e, "request handling listener accept error");
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    Err(_) => {
                        // just a timeout
                        continue;
                    }
                };

            debug!(%peer_addr, "New connection");

            let self_copy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = self_copy.handle_connection(stream).await {
                    debug!(%peer_addr, %e, "Connection error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> ConnectionResult<()> {
        // We always prepare exact buffers to be sent immediately
        stream.set_nodelay(true)?;
        match &self.shared.tls_acceptor {
            Some(acceptor) => {
                let stream = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                    .await
                    .map_err(|_| ConnectionError::HandshakeTimeout)??;
                let subject = tls::subject(stream.get_ref().1.peer_certificates());
                trace!(%subject, "TLS handshake complete");
                self.handle_connection_loop(stream, &subject).await
            }
            None => self.handle_connection_loop(stream, "").await,
        }
    }

    fn authorize(&self, subject: &str, action: Action) -> ServiceResult<()> {
        if self
            .shared
            .authorizer()
            .authorize(subject, WILDCARD, action.as_str())
        {
            Ok(())
        } else {
            debug!(%subject, %action, "Request denied");
            Err(ServiceError::Unauthorized)
        }
    }

    async fn handle_connection_loop<S: AsyncStream>(
        &self,
        mut stream: S,
        subject: &str,
    ) -> ConnectionResult<()> {
        let mut buf = vec![];
        ConnectionHello {
            version: REPLOG_VERSION_0,
        }
        .write(&mut NoSeek::new(&mut buf))?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        // Header breakdown:
        // * 1B - cmd
        // * if Produce: 3B record size
        // * if Consume*: 8B offset + 1B consistency
        // * if Join: 8B id + 1B voter + 2B addr length
        // * if Leave: 8B id
        //
        // Max: 14B of constant header, so we can read constant header once
        // and move straight to action.
        while !self.shared.is_node_shutting_down() {
            let mut header = [0u8; REQUEST_HEADER_SIZE];
            match stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let cmd = RequestHeaderCmd::from(header[0]);
            let cursor = &mut Cursor::new(&header[1..]);

            match cmd {
                RequestHeaderCmd::Peer => {
                    return self.handle_peer_connection(stream, subject).await;
                }
                RequestHeaderCmd::Produce => {
                    let args = ProduceRequestHeader::read(cursor)?;
                    debug!(?cmd, ?args);
                    self.handle_produce_request(&mut stream, subject, args.size)
                        .await?;
                }
                RequestHeaderCmd::ProduceStream => {
                    debug!(?cmd);
                    return self.handle_produce_stream_request(stream, subject).await;
                }
                RequestHeaderCmd::Consume => {
                    let args = ConsumeRequestHeader::read(cursor)?;
                    debug!(?cmd, ?args);
                    self.handle_consume_request(&mut stream, subject, args)
                        .await?;
                }
                RequestHeaderCmd::ConsumeStream => {
                    let args = ConsumeRequestHeader::read(cursor)?;
                    debug!(?cmd, ?args);
                    return self
                        .handle_consume_stream_request(stream, subject, args)
                        .await;
                }
                RequestHeaderCmd::Join => {
                    let args = JoinRequestHeader::read(cursor)?;
                    debug!(?cmd, ?args);
                    self.handle_join_request(&mut stream, subject, args).await?;
                }
                RequestHeaderCmd::Leave => {
                    let args = LeaveRequestHeader::read(cursor)?;
                    debug!(?cmd, ?args);
                    let res = self.leave(subject, args).await;
                    self.write_result(&mut stream, res.map(|()| vec![])).await?;
                }
                RequestHeaderCmd::GetServers => {
                    debug!(?cmd);
                    let res = self.get_servers(subject);
                    self.write_result(&mut stream, res).await?;
                }
                RequestHeaderCmd::Other => {
                    let e = ServiceError::Invalid(format!("unknown command: {}", header[0]));
                    self.write_error(&mut stream, &e).await?;
                    return Err(ConnectionError::Invalid);
                }
            }
        }

        Ok(())
    }

    /// Serve Raft RPCs for the rest of the connection
    async fn handle_peer_connection<S: AsyncStream>(
        &self,
        mut stream: S,
        subject: &str,
    ) -> ConnectionResult<()> {
        if let Err(e) = self.authorize(subject, Action::Replicate) {
            warn!(%subject, "Peer connection denied");
            self.write_error(&mut stream, &e).await?;
            return Ok(());
        }

        let raft = self.shared.raft();
        while !self.shared.is_node_shutting_down() {
            let Some(req) = read_frame::<PeerRequest>(&mut stream).await? else {
                return Ok(());
            };
            match raft.handle_peer_request(req).await {
                Ok(resp) => write_frame(&mut stream, &resp).await?,
                Err(e) => {
                    // the peer will time out and retry on a new connection
                    warn!(%e, "Failed to handle peer request");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn handle_produce_request(
        &self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        subject: &str,
        size: RecordSize,
    ) -> ConnectionResult<()> {
        // the payload has to be consumed even if the request is refused
        let payload = read_payload(stream, size).await?;
        let res = match self.authorize(subject, Action::Produce) {
            Ok(()) => self
                .shared
                .raft()
                .propose_command(payload)
                .await
                .map_err(ServiceError::from),
            Err(e) => Err(e),
        };
        self.write_result(stream, res.map(produce_response_body))
            .await
    }

    async fn handle_produce_stream_request<S: AsyncStream>(
        &self,
        stream: S,
        subject: &str,
    ) -> ConnectionResult<()> {
        let allowed = self.authorize(subject, Action::Produce).is_ok();
        let raft = self.shared.raft();

        let (mut read, mut write) = tokio::io::split(stream);
        let (tx, rx) = flume::bounded::<ServiceResult<Proposal>>(PRODUCE_STREAM_QUEUE);

        let (read_res, write_res) = join!(
            async {
                let tx = tx;
                loop {
                    let Some(size) = read_produce_stream_item(&mut read).await? else {
                        trace!("Produce stream finished");
                        break;
                    };
                    let payload = read_payload(&mut read, size).await?;
                    let proposal = if allowed {
                        raft.start_command(payload).await.map_err(ServiceError::from)
                    } else {
                        Err(ServiceError::Unauthorized)
                    };
                    if tx.send_async(proposal).await.is_err() {
                        break;
                    }
                }
                Ok::<_, ConnectionError>(())
            },
            async {
                // proposals are appended in order, so awaiting them in order keeps the
                // responses in order too
                while let Ok(proposal) = rx.recv_async().await {
                    let res = match proposal {
                        Ok(proposal) => proposal.wait().await.map_err(ServiceError::from),
                        Err(e) => Err(e),
                    };
                    self.write_result(&mut write, res.map(produce_response_body))
                        .await?;
                }
                write.shutdown().await?;
                Ok::<_, ConnectionError>(())
            }
        );

        read_res?;
        write_res
    }

    async fn consume(
        &self,
        subject: &str,
        args: ConsumeRequestHeader,
    ) -> ServiceResult<(LogOffset, Vec<u8>)> {
        self.check_consume(subject, args.consistency)?;
        let raft = self.shared.raft();
        if raft.records_end() <= args.offset {
            return Err(ServiceError::OffsetOutOfRange);
        }
        let user_log = self.shared.user_log().clone();
        let offset = args.offset;
        let record = tokio::task::spawn_blocking(move || user_log.read(offset))
            .await
            .map_err(RaftError::from)??;
        Ok((offset, record))
    }

    fn check_consume(&self, subject: &str, consistency: Consistency) -> ServiceResult<()> {
        self.authorize(subject, Action::Consume)?;
        let raft = self.shared.raft();
        if consistency == Consistency::Strong && !raft.is_leader() {
            return Err(RaftError::NotLeader {
                leader: raft.leader_addr(),
            }
            .into());
        }
        Ok(())
    }

    async fn handle_consume_request(
        &self,
        stream: &mut (impl AsyncWrite + Unpin),
        subject: &str,
        args: ConsumeRequestHeader,
    ) -> ConnectionResult<()> {
        match self.consume(subject, args).await {
            Ok((offset, record)) => write_record(stream, offset, &record).await,
            Err(e) => self.write_error(stream, &e).await,
        }
    }

    /// Stream committed records from `args.offset` on, until the client disconnects
    async fn handle_consume_stream_request<S: AsyncStream>(
        &self,
        mut stream: S,
        subject: &str,
        args: ConsumeRequestHeader,
    ) -> ConnectionResult<()> {
        if let Err(e) = self.check_consume(subject, args.consistency) {
            return self.write_error(&mut stream, &e).await;
        }
        let user_log = self.shared.user_log().clone();
        if args.offset < user_log.lowest_offset() {
            return self
                .write_error(&mut stream, &ServiceError::OffsetOutOfRange)
                .await;
        }

        let _open = self.shared.consume_stream_guard();
        let (mut read, mut write) = tokio::io::split(stream);
        let mut records_end_rx = self.shared.raft().subscribe_records_end();
        let mut next = args.offset;
        let mut peek = [0u8; 1];

        while !self.shared.is_node_shutting_down() {
            let records_end = *records_end_rx.borrow_and_update();

            if next < records_end {
                let batch_end = records_end.min(next + CONSUME_STREAM_BATCH);
                let user_log = user_log.clone();
                let records = tokio::task::spawn_blocking(move || {
                    (next.as_u64()..batch_end.as_u64())
                        .map(|offset| user_log.read(LogOffset(offset)))
                        .collect::<Result<Vec<_>, _>>()
                })
                .await?;

                let records = match records {
                    Ok(records) => records,
                    Err(e) => return self.write_error(&mut write, &ServiceError::from(e)).await,
                };
                for record in records {
                    write_record(&mut write, next, &record).await?;
                    next = next.next();
                }
                trace!(%next, "Consume stream sent a batch");
                continue;
            }

            tokio::select! {
                res = records_end_rx.changed() => if res.is_err() {
                    return Ok(());
                },
                res = read.read(&mut peek) => match res {
                    Ok(0) | Err(_) => {
                        debug!(%next, "Consumer disconnected");
                        return Ok(());
                    }
                    Ok(_) => return Err(ConnectionError::Invalid),
                },
                _ = sleep(Duration::from_millis(500)) => {},
            }
        }
        Ok(())
    }

    async fn handle_join_request(
        &self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        subject: &str,
        args: JoinRequestHeader,
    ) -> ConnectionResult<()> {
        let mut addr = vec![0u8; usize::from(args.addr_len)];
        stream.read_exact(&mut addr).await?;

        let res = match String::from_utf8(addr) {
            Ok(addr) => self.join(subject, Member::new(args.id, addr, args.voter)).await,
            Err(_) => Err(ServiceError::Invalid("address is not utf8".into())),
        };
        self.write_result(stream, res.map(|()| vec![])).await
    }

    async fn join(&self, subject: &str, member: Member) -> ServiceResult<()> {
        self.authorize(subject, Action::Join)?;
        if member.addr().is_empty() {
            return Err(ServiceError::Invalid("empty address".into()));
        }
        info!(id = %member.id, addr = %member.addr(), voter = member.voter, "Join requested");
        self.shared
            .raft()
            .change_membership(MembershipChange::Upsert(member))
            .await?;
        Ok(())
    }

    async fn leave(&self, subject: &str, args: LeaveRequestHeader) -> ServiceResult<()> {
        self.authorize(subject, Action::Leave)?;
        info!(id = %args.id, "Leave requested");
        self.shared
            .raft()
            .change_membership(MembershipChange::Remove(args.id))
            .await?;
        Ok(())
    }

    fn get_servers(&self, subject: &str) -> ServiceResult<Vec<u8>> {
        self.authorize(subject, Action::Consume)?;
        let raft = self.shared.raft();
        let leader_id = raft.role_state().leader_id;
        let servers = raft
            .committed_membership()
            .members()
            .iter()
            .map(|member| ServerInfo {
                member: member.clone(),
                is_leader: Some(member.id) == leader_id,
            })
            .collect();

        let mut body = vec![];
        GetServersResponse::new(servers)
            .write_options(&mut NoSeek::new(&mut body), Endian::Big, ())
            .expect("can't fail");
        Ok(body)
    }

    /// Body of an error response: leader address where there's one to redirect to
    fn error_body(&self, e: &ServiceError) -> Vec<u8> {
        match e {
            ServiceError::Raft(RaftError::NotLeader { leader }) => {
                leader.clone().unwrap_or_default().into_bytes()
            }
            ServiceError::Raft(RaftError::LeadershipLost) => self
                .shared
                .raft()
                .leader_addr()
                .unwrap_or_default()
                .into_bytes(),
            ServiceError::Unauthorized | ServiceError::OffsetOutOfRange => vec![],
            ServiceError::Log(LogError::OffsetNotFound(_)) => vec![],
            e => e.to_string().into_bytes(),
        }
    }

    async fn write_error(
        &self,
        stream: &mut (impl AsyncWrite + Unpin),
        e: &ServiceError,
    ) -> ConnectionResult<()> {
        let status = e.status();
        if status == Status::Internal {
            warn!(%e, "Request failed");
        } else {
            debug!(%e, "Request failed");
        }
        write_response(stream, status, &[&self.error_body(e)]).await
    }

    async fn write_result(
        &self,
        stream: &mut (impl AsyncWrite + Unpin),
        res: ServiceResult<Vec<u8>>,
    ) -> ConnectionResult<()> {
        match res {
            Ok(body) => write_response(stream, Status::Ok, &[&body]).await,
            Err(e) => self.write_error(stream, &e).await,
        }
    }
}

fn produce_response_body(offset: LogOffset) -> Vec<u8> {
    let mut body = Vec::with_capacity(ProduceResponse::BYTE_SIZE);
    ProduceResponse { offset }
        .write(&mut NoSeek::new(&mut body))
        .expect("can't fail");
    body
}

async fn read_payload(
    stream: &mut (impl AsyncRead + Unpin),
    size: RecordSize,
) -> ConnectionResult<Vec<u8>> {
    let mut payload = vec![0u8; usize::expect_from(size.0)];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Read the next item of a produce stream; `None` at the end of it
async fn read_produce_stream_item(
    stream: &mut (impl AsyncRead + Unpin),
) -> ConnectionResult<Option<RecordSize>> {
    let mut buf = [0u8; ProduceStreamItem::MAX_BYTE_SIZE];
    match stream.read_exact(&mut buf[..1]).await {
        Ok(_) => {}
        // client went away without saying goodbye
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if buf[0] != 0 {
        stream.read_exact(&mut buf[1..]).await?;
    }
    match ProduceStreamItem::read(&mut Cursor::new(&buf[..]))? {
        ProduceStreamItem::Record(size) => Ok(Some(size)),
        ProduceStreamItem::End => Ok(None),
    }
}

async fn write_record(
    stream: &mut (impl AsyncWrite + Unpin),
    offset: LogOffset,
    record: &[u8],
) -> ConnectionResult<()> {
    let mut header = Vec::with_capacity(RecordHeader::BYTE_SIZE);
    RecordHeader { offset }
        .write(&mut NoSeek::new(&mut header))
        .expect("can't fail");
    write_response(stream, Status::Ok, &[&header, record]).await
}

async fn write_response(
    stream: &mut (impl AsyncWrite + Unpin),
    status: Status,
    body: &[&[u8]],
) -> ConnectionResult<()> {
    let len: usize = body.iter().map(|part| part.len()).sum();
    let mut buf = Vec::with_capacity(ResponseHeader::BYTE_SIZE + len);
    ResponseHeader {
        status,
        len: u32::expect_from(len),
    }
    .write(&mut NoSeek::new(&mut buf))?;
    for part in body {
        buf.extend_from_slice(part);
    }
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_map_to_status() {
        assert_eq!(ServiceError::Unauthorized.status(), Status::Unauthorized);
        assert_eq!(
            ServiceError::Log(LogError::OffsetNotFound(LogOffset(0))).status(),
            Status::OffsetOutOfRange
        );
        assert_eq!(
            ServiceError::Raft(RaftError::NotLeader { leader: None }).status(),
            Status::NotLeader
        );
        assert_eq!(
            ServiceError::Raft(RaftError::MembershipChangeInProgress).status(),
            Status::Invalid
        );
        assert_eq!(
            ServiceError::Raft(RaftError::ShuttingDown).status(),
            Status::Internal
        );
    }

    #[tokio::test]
    async fn produce_stream_items() -> anyhow::Result<()> {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[1, 0, 0, 3, b'a', b'b', b'c', 0]).await?;

        let size = read_produce_stream_item(&mut server).await?;
        assert_eq!(size, Some(RecordSize(3)));
        assert_eq!(read_payload(&mut server, RecordSize(3)).await?, b"abc");
        assert_eq!(read_produce_stream_item(&mut server).await?, None);

        drop(client);
        assert_eq!(read_produce_stream_item(&mut server).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn record_response_layout() -> anyhow::Result<()> {
        let mut buf = vec![];
        write_record(&mut buf, LogOffset(3), b"xy").await?;
        assert_eq!(buf, [0, 0, 0, 0, 10, 0, 0, 0, 0, 0, 0, 0, 3, b'x', b'y']);
        Ok(())
    }
}
