mod common;

use common::*;
use replog::{Consistency, Error, LogOffset};
use std::time::Duration;
use tokio::test;

fn record(b: u8) -> Vec<u8> {
    std::iter::repeat(b).take(usize::from(b)).collect()
}

#[test]
async fn basic_sanity() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let mut client = server.new_client_async().await?;

    client.produce(&[1, 2, 3]).await?;
    client.produce(&[4, 3, 2]).await?;
    assert_eq!(client.consume(LogOffset(0), Consistency::Strong).await?, [1, 2, 3]);
    assert_eq!(client.consume(LogOffset(1), Consistency::Strong).await?, [4, 3, 2]);

    Ok(())
}

#[test]
async fn produce_stream_keeps_order() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let client = server.new_client_async().await?;
    let offsets = client
        .produce_stream((0u8..100).map(record))
        .await?
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(offsets, (0..100).map(LogOffset).collect::<Vec<_>>());

    let mut client = server.new_client_async().await?;
    for b in 0u8..100 {
        assert_eq!(
            client
                .consume(LogOffset(u64::from(b)), Consistency::Strong)
                .await?,
            record(b)
        );
    }

    Ok(())
}

#[test]
async fn consume_stream_waits_for_new_records() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let mut writer_client = server.new_client_async().await?;
    writer_client.produce(b"first").await?;

    let mut stream = server
        .new_client_async()
        .await?
        .consume_stream(LogOffset(0), Consistency::Strong)
        .await?;
    assert_eq!(stream.next().await?, (LogOffset(0), b"first".to_vec()));

    // nothing there yet
    assert!(
        tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .is_err()
    );

    writer_client.produce(b"second").await?;
    assert_eq!(stream.next().await?, (LogOffset(1), b"second".to_vec()));

    Ok(())
}

#[test]
async fn consume_stream_from_the_middle() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let mut writer_client = server.new_client_async().await?;
    for b in 0u8..10 {
        writer_client.produce(&record(b)).await?;
    }

    let mut stream = server
        .new_client_async()
        .await?
        .consume_stream(LogOffset(5), Consistency::Relaxed)
        .await?;
    for b in 5u8..10 {
        assert_eq!(stream.next().await?, (LogOffset(u64::from(b)), record(b)));
    }

    Ok(())
}

#[test]
async fn basic_concurrent() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;

    let mut writer_client = server.new_client_async().await?;
    let mut stream = server
        .new_client_async()
        .await?
        .consume_stream(LogOffset(0), Consistency::Strong)
        .await?;

    let writer_task = tokio::spawn(async move {
        for b in 0u8..100 {
            writer_client.produce(&record(b)).await.unwrap();
        }
    });

    let reader_task = tokio::spawn(async move {
        for b in 0u8..100 {
            let (offset, data) = stream.next().await.unwrap();
            assert_eq!(offset, LogOffset(u64::from(b)));
            assert_eq!(data, record(b));
        }
    });

    writer_task.await?;
    reader_task.await?;

    Ok(())
}

#[test]
async fn consume_out_of_range() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;
    let mut client = server.new_client_async().await?;

    assert!(matches!(
        client.consume(LogOffset(7), Consistency::Strong).await,
        Err(Error::OffsetOutOfRange)
    ));
    Ok(())
}

#[test]
async fn consume_stream_ends_when_client_disconnects() -> anyhow::Result<()> {
    let server = TestNode::bootstrap()?;
    let ctrl = server.ctrl();

    let mut writer_client = server.new_client_async().await?;
    writer_client.produce(b"first").await?;

    let mut stream = server
        .new_client_async()
        .await?
        .consume_stream(LogOffset(0), Consistency::Strong)
        .await?;
    assert_eq!(stream.next().await?, (LogOffset(0), b"first".to_vec()));
    assert_eq!(ctrl.consume_streams(), 1);

    // waiting for new records when the client goes away
    drop(stream);
    writer_client.produce(b"second").await?;
    wait_until("the consume stream to end", || ctrl.consume_streams() == 0)?;

    for _ in 0..20 {
        let mut stream = server
            .new_client_async()
            .await?
            .consume_stream(LogOffset(1), Consistency::Relaxed)
            .await?;
        assert_eq!(stream.next().await?, (LogOffset(1), b"second".to_vec()));
    }
    wait_until("all consume streams to end", || ctrl.consume_streams() == 0)?;

    // and the node keeps serving
    assert_eq!(writer_client.produce(b"third").await?, LogOffset(2));
    assert_eq!(
        writer_client
            .consume(LogOffset(2), Consistency::Strong)
            .await?,
        b"third"
    );

    Ok(())
}
