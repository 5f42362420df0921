//! Dispatch pipeline benchmark suite.
//!
//! Measures store dispatch cost at different middleware depths and the
//! queue-and-flush path of a client on the in-memory transport:
//! - Middleware depths: 0, 1, 4, 16
//! - Queue sizes: 10, 100, 1000
//!
//! Run with: cargo bench --bench dispatch
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use resilient_ws::store::actions;
use resilient_ws::{Client, ClientState, EventBus, MemoryTransport, Store};
use serde_json::json;
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const MIDDLEWARE_DEPTHS: &[usize] = &[0, 1, 4, 16];
const QUEUE_SIZES: &[usize] = &[10, 100, 1000];

// ============================================================================
// Benchmark: Store Dispatch
// ============================================================================

fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dispatch");

    for &depth in MIDDLEWARE_DEPTHS {
        let store = store_with_depth(depth);
        group.bench_with_input(BenchmarkId::new("middleware", depth), &store, |b, store| {
            b.to_async(&rt).iter(|| async {
                store
                    .dispatch(actions::MESSAGE, Some(json!({ "price": 42 })))
                    .await
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn store_with_depth(depth: usize) -> Store<ClientState> {
    let store = Store::new(ClientState::default(), Arc::new(EventBus::new()));
    ClientState::register(&store);
    for _ in 0..depth {
        store.use_fn(|_, next| async move { next.run().await });
    }
    store
}

// ============================================================================
// Benchmark: Queue Flush
// ============================================================================

fn bench_queue_flush(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue_flush");
    group.sample_size(20);

    for &size in QUEUE_SIZES {
        group.bench_with_input(BenchmarkId::new("flush", size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move { black_box(queue_and_flush(size).await) });
        });
    }

    group.finish();
}

/// Queues `size` messages while idle, connects and waits for the flush.
async fn queue_and_flush(size: usize) -> usize {
    let transport = MemoryTransport::new();
    let client = Client::builder("ws://bench.local/socket")
        .transport(transport.clone())
        .auto_connect(false)
        .max_queue_size(size)
        .build()
        .unwrap();

    for n in 0..size {
        client.send(&n).unwrap();
    }
    client.connect().unwrap();

    loop {
        if let Some(peer) = transport.last_peer()
            && peer.sent().len() == size
        {
            client.close().await.unwrap();
            return size;
        }
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Criterion Setup
// ============================================================================

criterion_group!(benches, bench_dispatch, bench_queue_flush);
criterion_main!(benches);
