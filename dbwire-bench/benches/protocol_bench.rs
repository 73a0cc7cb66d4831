//! Protocol encoding/decoding benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dbwire_protocol::value::{encode_row, split_row};
use dbwire_protocol::{
    ClientMessage, Collection, ColumnType, DataModel, Decoder, Encoder, Frame, ServerMessage,
    ServerMessageType, Statement, Value,
};

fn create_test_statement(payload_size: usize) -> Statement {
    Statement::insert(Collection::new("events").in_schema("bench"), DataModel::Table)
        .with_row(vec![
            Value::from(12345i64),
            Value::from("x".repeat(payload_size)),
            Value::from(serde_json::json!({"source": "bench", "attempt": 1})),
        ])
}

fn create_test_row(payload_size: usize) -> Vec<Value> {
    vec![
        Value::from(42i64),
        Value::from(7u64),
        Value::from(3.25f64),
        Value::from(true),
        Value::from("x".repeat(payload_size)),
        Value::Null,
    ]
}

const ROW_TYPES: [ColumnType; 6] = [
    ColumnType::Sint,
    ColumnType::Uint,
    ColumnType::Double,
    ColumnType::Bool,
    ColumnType::String,
    ColumnType::String,
];

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_chunked");

    // Block size 4096: the larger payloads span several physical frames.
    for size in [100, 10_000, 1_000_000] {
        let frame = Frame::new(ServerMessageType::Row as u8, "x".repeat(size));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode_chunked(4096)));
        });
    }

    group.finish();
}

fn bench_frame_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_reassembly");

    for size in [100, 10_000, 1_000_000] {
        let frame = Frame::new(ServerMessageType::Row as u8, "x".repeat(size));
        let encoded = frame.encode_chunked(4096);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::with_max_block_size(4096);
                decoder.extend(encoded);
                black_box(decoder.decode_frame().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_statement_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("statement_encode");

    for size in [100, 1000, 10000] {
        let msg = ClientMessage::Execute(Box::new(create_test_statement(size)));

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, msg| {
            b.iter(|| black_box(Encoder::encode_client(msg).unwrap()));
        });
    }

    group.finish();
}

fn bench_statement_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("statement_decode");

    for size in [100, 1000, 10000] {
        let msg = ClientMessage::Execute(Box::new(create_test_statement(size)));
        let encoded = Encoder::encode_client(&msg).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_client().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_row_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_decode");

    for size in [10, 1000] {
        let payload = encode_row(&create_test_row(size));

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                let fields = split_row(payload, ROW_TYPES.len()).unwrap();
                let values: Vec<Value> = fields
                    .iter()
                    .zip(ROW_TYPES)
                    .enumerate()
                    .map(|(i, (field, ty))| Value::decode(i, ty, field.as_deref()).unwrap())
                    .collect();
                black_box(values)
            });
        });
    }

    group.finish();
}

fn bench_result_set_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_set_decode");

    for rows in [10, 100, 1000] {
        let mut wire = BytesMut::new();
        for _ in 0..rows {
            let msg = ServerMessage::Row(encode_row(&create_test_row(32)));
            wire.extend_from_slice(&Encoder::encode_server(&msg, 4096).unwrap());
        }

        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &wire, |b, wire| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(wire);
                let mut count = 0;
                while let Some(msg) = decoder.decode_server().unwrap() {
                    black_box(msg);
                    count += 1;
                }
                count
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_reassembly,
    bench_statement_encode,
    bench_statement_decode,
    bench_row_decode,
    bench_result_set_decode,
);
criterion_main!(benches);
