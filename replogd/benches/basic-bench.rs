#[path = "../tests/common.rs"]
mod common;

use common::TestNode;
use convi::ExpectFrom;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use replog::std::Client;
use replog::{Consistency, LogOffset};

fn criterion_benchmark(c: &mut Criterion) {
    let records = [
        [1u8].as_slice(),
        [2u8; 1000].as_slice(),
        [3u8; 100000].as_slice(),
    ];

    {
        let mut produce = c.benchmark_group("produce");
        for record in records {
            let server = TestNode::bootstrap().unwrap();
            let mut client = server.new_client().unwrap();
            produce.throughput(criterion::Throughput::Bytes(u64::expect_from(record.len())));
            produce.bench_with_input(
                BenchmarkId::from_parameter(record.len()),
                record,
                |b, record| b.iter(|| client.produce(record).unwrap()),
            );
        }
        produce.finish();
    }
    {
        let mut roundtrip = c.benchmark_group("roundtrip");
        for record in records {
            let server = TestNode::bootstrap().unwrap();
            let mut client = server.new_client().unwrap();
            roundtrip.throughput(criterion::Throughput::Bytes(u64::expect_from(record.len())));
            roundtrip.bench_with_input(
                BenchmarkId::from_parameter(record.len()),
                record,
                |b, record| {
                    b.iter(|| {
                        let offset = client.produce(record).unwrap();
                        let read = client.consume(offset, Consistency::Strong).unwrap();
                        assert_eq!(record.len(), read.len());
                    })
                },
            );
        }
        roundtrip.finish();
    }
    {
        let mut consume = c.benchmark_group("consume relaxed");
        for record in records {
            let server = TestNode::bootstrap().unwrap();
            let mut client = server.new_client().unwrap();
            for _ in 0..100 {
                client.produce(record).unwrap();
            }
            let mut offset = 0;
            consume.throughput(criterion::Throughput::Bytes(u64::expect_from(record.len())));
            consume.bench_with_input(
                BenchmarkId::from_parameter(record.len()),
                record,
                |b, record| {
                    b.iter(|| {
                        let read = client
                            .consume(LogOffset(offset % 100), Consistency::Relaxed)
                            .unwrap();
                        assert_eq!(record.len(), read.len());
                        offset += 1;
                    })
                },
            );
        }
        consume.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
