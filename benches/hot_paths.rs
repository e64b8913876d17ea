//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! Every inbound message pays for line encoding, a topic match and one log
//! write; every upload cycle pays for hashing the whole snapshot.

use bytes::Bytes;
use chrono::{Local, TimeZone};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use telemetry_bridge::ingress::topic_matches;
use telemetry_bridge::log::{InMemoryLogStore, LogEntry, LogFile};
use telemetry_bridge::store::memory::content_id_for;

fn entry(payload: Bytes) -> LogEntry {
    let timestamp = Local
        .with_ymd_and_hms(2026, 10, 16, 12, 0, 0)
        .single()
        .unwrap_or_else(Local::now);
    LogEntry::with_timestamp(timestamp, "sensors/room-1/temp", payload)
}

/// Benchmark LogEntry::encode_line - runs once per received message
fn bench_encode_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_line");
    group.throughput(Throughput::Elements(1));

    for payload_len in [8, 128, 1024] {
        let text = entry(Bytes::from("2".repeat(payload_len)));
        group.bench_function(format!("utf8_{}", payload_len), |b| {
            b.iter(|| black_box(&text).encode_line())
        });
    }

    let escaped = entry(Bytes::from_static(b"line one\nline two\t\\ end"));
    group.bench_function("utf8_escaped", |b| {
        b.iter(|| black_box(&escaped).encode_line())
    });

    let binary = entry(Bytes::from((0..=255u8).collect::<Vec<u8>>()));
    group.bench_function("binary_256", |b| b.iter(|| black_box(&binary).encode_line()));

    group.finish();
}

/// Benchmark LogEntry::decode_line - used by recovery checks and tests
fn bench_decode_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_line");
    group.throughput(Throughput::Elements(1));

    let plain = entry(Bytes::from_static(b"21.5")).encode_line();
    let plain = &plain[..plain.len() - 1];
    group.bench_function("plain", |b| b.iter(|| LogEntry::decode_line(black_box(plain))));

    let binary = entry(Bytes::from((0..=255u8).collect::<Vec<u8>>())).encode_line();
    let binary = &binary[..binary.len() - 1];
    group.bench_function("binary_256", |b| {
        b.iter(|| LogEntry::decode_line(black_box(binary)))
    });

    group.finish();
}

/// Benchmark topic filter matching
fn bench_topic_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_match");
    group.throughput(Throughput::Elements(1));

    let cases = [
        ("multi_level", "sensores/#", "sensores/building-a/floor-3/temp"),
        ("single_level", "sensores/+/temp", "sensores/room-1/temp"),
        ("miss", "sensores/#", "actuators/valve-7"),
    ];
    for (name, filter, topic) in cases {
        group.bench_function(name, |b| {
            b.iter(|| topic_matches(black_box(filter), black_box(topic)))
        });
    }

    group.finish();
}

/// Benchmark LogFile::write_entry + commit on the in-memory store
fn bench_log_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_write");
    group.throughput(Throughput::Elements(1));

    let sample = entry(Bytes::from_static(b"21.5"));
    group.bench_function("write_commit", |b| {
        let mut file = LogFile::open(InMemoryLogStore::new(), "bench.txt")
            .unwrap_or_else(|e| panic!("open: {}", e));
        b.iter(|| {
            let _ = file.write_entry(black_box(&sample));
            file.commit();
        })
    });

    group.finish();
}

/// Benchmark content id derivation for snapshot-sized inputs
fn bench_content_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_id");

    for size in [4 * 1024, 256 * 1024] {
        let data = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("bytes_{}", size), |b| {
            b.iter(|| content_id_for(black_box(&data)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_line,
    bench_decode_line,
    bench_topic_match,
    bench_log_write,
    bench_content_id,
);

criterion_main!(benches);
