mod common;

use replog::std::Client;
use replog::{Consistency, Error, LogOffset};
use std::thread;

use common::*;

fn record(b: u8) -> Vec<u8> {
    std::iter::repeat(b).take(usize::from(b)).collect()
}

#[test]
fn basic_sanity() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let mut client = server.new_client()?;

    assert_eq!(client.produce(&[1, 2, 3])?, LogOffset(0));
    assert_eq!(client.produce(&[4, 3, 2])?, LogOffset(1));
    assert_eq!(client.consume(LogOffset(0), Consistency::Strong)?, [1, 2, 3]);
    assert_eq!(client.consume(LogOffset(1), Consistency::Relaxed)?, [4, 3, 2]);

    Ok(())
}

#[test]
fn consume_past_the_end_is_out_of_range() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;
    let mut client = server.new_client()?;

    assert!(matches!(
        client.consume(LogOffset(0), Consistency::Strong),
        Err(Error::OffsetOutOfRange)
    ));

    client.produce(b"one")?;
    assert!(matches!(
        client.consume(LogOffset(1), Consistency::Strong),
        Err(Error::OffsetOutOfRange)
    ));
    // the connection is still usable after an error response
    assert_eq!(client.consume(LogOffset(0), Consistency::Strong)?, b"one");

    Ok(())
}

#[test]
fn empty_record() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;
    let mut client = server.new_client()?;

    let offset = client.produce(&[])?;
    assert_eq!(client.consume(offset, Consistency::Strong)?, Vec::<u8>::new());
    Ok(())
}

#[test]
fn basic_serial() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let mut writer_client = server.new_client()?;
    let mut reader_client = server.new_client()?;

    for b in 0u8..100 {
        assert_eq!(writer_client.produce(&record(b))?, LogOffset(u64::from(b)));
    }

    for b in 0u8..100 {
        assert_eq!(
            reader_client.consume(LogOffset(u64::from(b)), Consistency::Strong)?,
            record(b)
        );
    }

    Ok(())
}

#[test]
fn basic_concurrent() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let mut writer_client = server.new_client()?;
    let reader_client = server.new_client()?;

    let writer_task = thread::spawn(move || {
        for b in 0u8..100 {
            writer_client.produce(&record(b)).unwrap();
        }
    });

    let reader_task = thread::spawn(move || {
        let stream = reader_client
            .consume_stream(LogOffset(0), Consistency::Strong)
            .unwrap();
        for (b, item) in (0u8..100).zip(stream) {
            let (offset, data) = item.unwrap();
            assert_eq!(offset, LogOffset(u64::from(b)));
            assert_eq!(data, record(b));
        }
    });

    writer_task.join().unwrap();
    reader_task.join().unwrap();

    Ok(())
}

#[test]
fn concurrent_writers_get_distinct_offsets() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let writers: Vec<_> = (0u8..4)
        .map(|w| {
            let mut client = server.new_client().unwrap();
            thread::spawn(move || {
                (0u8..25)
                    .map(|i| client.produce(&[w, i]).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut offsets: Vec<_> = writers
        .into_iter()
        .flat_map(|writer| writer.join().unwrap())
        .collect();
    offsets.sort();
    assert_eq!(offsets, (0..100).map(LogOffset).collect::<Vec<_>>());

    Ok(())
}

#[test]
fn data_survives_restart() -> anyhow::Result<()> {
    let mut server = TestNode::bootstrap()?;

    {
        let mut client = server.new_client()?;
        for b in 0u8..10 {
            client.produce(&record(b))?;
        }
    }

    server.restart()?;
    server.wait_for_role(replogd::Role::Leader)?;

    let mut client = server.new_client()?;
    for b in 0u8..10 {
        assert_eq!(
            client.consume(LogOffset(u64::from(b)), Consistency::Strong)?,
            record(b)
        );
    }
    assert_eq!(client.produce(b"after")?, LogOffset(10));

    Ok(())
}

#[test]
fn get_servers_single_node() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;
    let mut client = server.new_client()?;

    let servers = client.get_servers()?;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].member.id, server.id());
    assert_eq!(servers[0].member.addr(), server.addr());
    assert!(servers[0].member.voter);
    assert!(servers[0].is_leader);

    Ok(())
}

#[test]
fn last_voter_cant_leave() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;
    let mut client = server.new_client()?;

    assert!(matches!(client.leave(server.id()), Err(Error::Invalid(_))));
    assert_eq!(client.get_servers()?.len(), 1);

    Ok(())
}

#[test]
fn records_below_retention_floor_are_gone() -> anyhow::Result<()> {
    let server = TestNode::bootstrap_with(|params| {
        params.max_store_bytes = 64;
        params.max_log_bytes = Some(128);
    })?;
    let mut client = server.new_client()?;

    for b in 0u8..20 {
        assert_eq!(client.produce(&[b; 16])?, LogOffset(u64::from(b)));
    }

    // 16 bytes and a length prefix each, three records per segment:
    // only the active segment and the one before it fit
    for consistency in [Consistency::Strong, Consistency::Relaxed] {
        for offset in 0..15 {
            assert!(matches!(
                client.consume(LogOffset(offset), consistency),
                Err(Error::OffsetOutOfRange)
            ));
        }
    }
    for b in 15u8..20 {
        assert_eq!(
            client.consume(LogOffset(u64::from(b)), Consistency::Strong)?,
            [b; 16]
        );
    }

    let mut stream = server
        .new_client()?
        .consume_stream(LogOffset(0), Consistency::Strong)?;
    assert!(matches!(stream.next(), Some(Err(Error::OffsetOutOfRange))));

    assert_eq!(client.produce(b"more")?, LogOffset(20));
    Ok(())
}

#[test]
fn msgpack_client() -> anyhow::Result<()> {
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Event {
        name: String,
        value: u32,
    }

    let server = TestNode::bootstrap()?;
    let mut client = replog::rmp::MsgPackClient::<Event>::new(server.new_client()?);

    let event = Event {
        name: "temperature".into(),
        value: 21,
    };
    let offset = client.produce(&event)?;
    assert_eq!(client.consume(offset, Consistency::Strong)?, event);

    Ok(())
}
