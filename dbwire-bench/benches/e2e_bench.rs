//! End-to-end session benchmarks against the in-process mock server.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dbwire_client::mock::{result_set, MockOptions, MockServer};
use dbwire_client::{Session, Statement, Value};
use dbwire_protocol::ColumnType;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::Mutex;

struct TestSetup {
    _server: MockServer,
    session: Arc<Mutex<Session>>,
}

/// Starts a server answering every statement with `rows` rows.
fn setup_server_and_session(rt: &Runtime, rows: usize) -> TestSetup {
    rt.block_on(async {
        let data: Vec<Vec<Value>> = (0..rows)
            .map(|i| vec![Value::from(i as i64), Value::from(format!("user-{}", i))])
            .collect();
        let server = MockServer::start(MockOptions::default(), move |_: &Statement| {
            result_set(&[("id", ColumnType::Sint), ("name", ColumnType::String)], &data)
        })
        .await
        .unwrap();

        let session = Session::open(server.config().with_client_name("bench"))
            .await
            .unwrap();

        TestSetup {
            _server: server,
            session: Arc::new(Mutex::new(session)),
        }
    })
}

fn bench_ping_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_session(&rt, 1);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.to_async(&rt).iter(|| async {
            let mut session = setup.session.lock().await;
            black_box(session.ping().await.unwrap())
        });
    });

    group.finish();
}

fn bench_query_rows(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("e2e_query");

    for rows in [1, 100, 1000] {
        let setup = setup_server_and_session(&rt, rows);
        let statement = Statement::sql("SELECT id, name FROM users");

        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &statement, |b, statement| {
            b.to_async(&rt).iter(|| async {
                let mut session = setup.session.lock().await;
                let mut stream = session.execute(statement).await.unwrap();
                let rows = stream.fetch_all().await.unwrap();
                stream.dump().await.unwrap();
                black_box(rows)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ping_latency, bench_query_rows);
criterion_main!(benches);
