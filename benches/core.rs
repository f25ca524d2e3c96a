//! Benchmarks for the balancing and buffer-pool hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use doforward::balancer::{Algorithm, Balancer};
use doforward::config::NodeSpec;
use doforward::node::{Application, NodeId, Transport};
use doforward::pool::{BufferPool, PoolSettings};
use doforward::service::ServiceSettings;
use doforward::Server;
use std::time::Duration;

/// Mint real node handles through a server so the balancer sees the same
/// ids production code does.
fn node_ids(count: u16) -> Vec<NodeId> {
    let server = Server::new();
    let service = server
        .add_service(
            Transport::Tcp,
            Application::None,
            ServiceSettings {
                name: "bench".to_string(),
                host: "127.0.0.1".parse().unwrap(),
                port: 1,
                ..Default::default()
            },
        )
        .unwrap();

    (0..count)
        .map(|i| {
            server
                .add_node(
                    service,
                    NodeSpec {
                        name: None,
                        transport: Transport::Tcp,
                        application: Application::None,
                        host: "127.0.0.1".parse().unwrap(),
                        port: 10_000 + i,
                    },
                )
                .unwrap()
        })
        .collect()
}

fn bench_balancers(c: &mut Criterion) {
    let ids = node_ids(16);

    let mut group = c.benchmark_group("balancer");
    group.throughput(Throughput::Elements(1));

    for algorithm in [Algorithm::RoundRobin, Algorithm::ConnectionCount] {
        let balancer = Balancer::new(algorithm);
        for &id in &ids {
            balancer.associate(id);
        }
        group.bench_function(format!("select/{algorithm:?}"), |b| {
            b.iter(|| {
                let node = balancer.select().unwrap();
                black_box(node);
                balancer.release(node);
            })
        });
    }

    group.finish();
}

fn bench_pool(c: &mut Criterion) {
    let pool: BufferPool<u8> = BufferPool::new(PoolSettings::new(8192, 64, 256, 16)).unwrap();

    let mut group = c.benchmark_group("pool");
    group.throughput(Throughput::Elements(1));
    group.bench_function("poll_return", |b| {
        b.iter(|| {
            let buf = pool.poll(Some(Duration::ZERO)).unwrap();
            black_box(buf.len());
            // Dropping returns the buffer.
        })
    });
    group.finish();
}

criterion_group!(benches, bench_balancers, bench_pool);
criterion_main!(benches);
