//! Request encoding and response decoding shared by both clients
use ::std::io::Cursor;

use binrw::{BinRead, BinWrite, Endian};
use convi::ExpectFrom;
use replog_api::{
    ConnectionHello, GetServersResponse, JoinRequestHeader, LogOffset, ProduceResponse,
    ProduceStreamItem, RecordHeader, RecordSize, RequestHeaderCmd, ResponseHeader, ServerInfo,
    Status, NodeId, REPLOG_VERSION_0, REQUEST_HEADER_SIZE,
};
use rustls::pki_types::ServerName;

use crate::{Error, Result};

pub(crate) fn request_header<A>(cmd: RequestHeaderCmd, args: &A) -> [u8; REQUEST_HEADER_SIZE]
where
    A: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut buf = [0u8; REQUEST_HEADER_SIZE];
    buf[0] = u8::from(cmd);
    args.write_options(&mut Cursor::new(&mut buf[1..]), Endian::Big, ())
        .expect("can't fail");
    buf
}

pub(crate) fn record_size(len: usize) -> Result<RecordSize> {
    match u32::try_from(len) {
        Ok(size) if size <= RecordSize::MAX => Ok(RecordSize(size)),
        _ => Err(Error::RecordTooLarge(len)),
    }
}

/// Header of a join request, followed by the address
pub(crate) fn join_request(id: NodeId, addr: &str, voter: bool) -> Result<Vec<u8>> {
    let addr_len = u16::try_from(addr.len())
        .map_err(|_| Error::Invalid(format!("address too long: {addr}")))?;
    let mut buf = request_header(
        RequestHeaderCmd::Join,
        &JoinRequestHeader { id, voter, addr_len },
    )
    .to_vec();
    buf.extend_from_slice(addr.as_bytes());
    Ok(buf)
}

/// Produce stream item announcing a record, followed by the record itself
pub(crate) fn produce_stream_item(record: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(ProduceStreamItem::MAX_BYTE_SIZE + record.len());
    ProduceStreamItem::Record(record_size(record.len())?)
        .write(&mut Cursor::new(&mut buf))
        .expect("can't fail");
    buf.extend_from_slice(record);
    Ok(buf)
}

pub(crate) fn produce_stream_end() -> Vec<u8> {
    let mut buf = vec![];
    ProduceStreamItem::End
        .write(&mut Cursor::new(&mut buf))
        .expect("can't fail");
    buf
}

pub(crate) fn check_hello(buf: &[u8; ConnectionHello::BYTE_SIZE]) -> Result<()> {
    let hello = ConnectionHello::read(&mut Cursor::new(buf))?;
    if hello.version != REPLOG_VERSION_0 {
        return Err(Error::ProtocolVersion(hello.version));
    }
    Ok(())
}

pub(crate) fn response_header(buf: &[u8; ResponseHeader::BYTE_SIZE]) -> Result<ResponseHeader> {
    Ok(ResponseHeader::read(&mut Cursor::new(buf))?)
}

pub(crate) fn body_len(header: &ResponseHeader) -> usize {
    usize::expect_from(header.len)
}

fn leader_from(body: Vec<u8>) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Turn a response into the body, or the error the server reported
pub(crate) fn into_result(status: Status, body: Vec<u8>) -> Result<Vec<u8>> {
    match status {
        Status::Ok => Ok(body),
        Status::OffsetOutOfRange => Err(Error::OffsetOutOfRange),
        Status::NotLeader => Err(Error::NotLeader {
            leader: leader_from(body),
        }),
        Status::LeadershipLost => Err(Error::LeadershipLost {
            leader: leader_from(body),
        }),
        Status::Unauthorized => Err(Error::Unauthorized),
        Status::Invalid => Err(Error::Invalid(String::from_utf8_lossy(&body).into_owned())),
        Status::Internal => Err(Error::Internal(String::from_utf8_lossy(&body).into_owned())),
    }
}

pub(crate) fn produce_response(body: &[u8]) -> Result<LogOffset> {
    Ok(ProduceResponse::read(&mut Cursor::new(body))?.offset)
}

pub(crate) fn record(mut body: Vec<u8>) -> Result<(LogOffset, Vec<u8>)> {
    let header = RecordHeader::read(&mut Cursor::new(&body))?;
    body.drain(..RecordHeader::BYTE_SIZE);
    Ok((header.offset, body))
}

pub(crate) fn servers(body: &[u8]) -> Result<Vec<ServerInfo>> {
    Ok(GetServersResponse::read_options(&mut Cursor::new(body), Endian::Big, ())?.servers)
}

/// Name to verify the server certificate against: the host part of `addr`
pub(crate) fn server_name(addr: &str) -> Result<ServerName<'static>> {
    let host = addr
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(addr)
        .trim_start_matches('[')
        .trim_end_matches(']');
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|_| Error::ServerName(host.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_api::ConsumeRequestHeader;
    use replog_api::Consistency;

    #[test]
    fn consume_header_layout() {
        let buf = request_header(
            RequestHeaderCmd::Consume,
            &ConsumeRequestHeader {
                offset: LogOffset(0x0102),
                consistency: Consistency::Relaxed,
            },
        );
        assert_eq!(buf, [16, 0, 0, 0, 0, 0, 0, 1, 2, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn errors_carry_leader() {
        match into_result(Status::NotLeader, b"10.0.0.1:8080".to_vec()) {
            Err(Error::NotLeader { leader }) => assert_eq!(leader.as_deref(), Some("10.0.0.1:8080")),
            other => panic!("unexpected: {other:?}"),
        }
        match into_result(Status::NotLeader, vec![]) {
            Err(Error::NotLeader { leader }) => assert_eq!(leader, None),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            into_result(Status::Ok, vec![1, 2]),
            Ok(body) if body == [1, 2]
        ));
    }

    #[test]
    fn oversized_record_is_refused() {
        assert!(record_size(1 << 24).is_err());
        assert_eq!(record_size(3).ok(), Some(RecordSize(3)));
    }

    #[test]
    fn server_names() -> Result<()> {
        assert!(matches!(server_name("localhost:8080")?, ServerName::DnsName(_)));
        assert!(matches!(server_name("127.0.0.1:1")?, ServerName::IpAddress(_)));
        Ok(())
    }
}
