use std::hint::black_box;
use std::time::Duration;

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures_util::future::join_all;
use futures_util::{StreamExt, stream};
use http::{Request, Response};
use rebound::prelude::{Body, FixedBackoff, RetryingClient, StatusRetryRule, transport_fn};
use rebound::{Cause, StreamDuplicator};
use tokio::runtime::Runtime;

const PAYLOAD_BYTES: usize = 256 * 1024;
const CHUNK_BYTES: usize = 16 * 1024;

fn benchmark_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build benchmark runtime")
}

fn payload_chunks() -> Vec<Bytes> {
    let payload = Bytes::from(vec![b'x'; PAYLOAD_BYTES]);
    payload
        .chunks(CHUNK_BYTES)
        .map(Bytes::copy_from_slice)
        .collect()
}

fn bench_fan_out(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let chunks = payload_chunks();

    let mut group = c.benchmark_group("duplicator_fan_out_256k");
    group.sample_size(40);
    group.throughput(Throughput::Bytes(PAYLOAD_BYTES as u64));
    for readers in [1_usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(readers), &readers, |b, &readers| {
            b.to_async(&runtime).iter(|| {
                let upstream = stream::iter(chunks.clone().into_iter().map(Ok::<_, Cause>));
                let duplicator = StreamDuplicator::new(upstream);
                let handles: Vec<_> = (0..readers).map(|_| duplicator.duplicate()).collect();
                duplicator.close();
                async move {
                    let totals = join_all(handles.into_iter().map(|handle| {
                        handle.fold(0_usize, |total, chunk| async move {
                            total + chunk.map_or(0, |chunk| chunk.len())
                        })
                    }))
                    .await;
                    black_box(totals)
                }
            });
        });
    }
    group.finish();
}

fn bench_retry_loop(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let client = {
        let _guard = runtime.enter();
        RetryingClient::builder(StatusRetryRule::standard().backoff(FixedBackoff::no_delay()))
            .max_total_attempts(3)
            .response_timeout_for_each_attempt(Duration::from_secs(1))
            .build(transport_fn(|ctx, request: Request<Body>| async move {
                let _ = request.into_body().collect().await;
                let status = if ctx.is_last_attempt() { 200 } else { 503 };
                Ok(Response::builder()
                    .status(status)
                    .body(Body::from("ok"))
                    .expect("build benchmark response"))
            }))
    };
    let chunks = payload_chunks();

    let mut group = c.benchmark_group("retry_loop_upload_256k");
    group.sample_size(40);
    group.throughput(Throughput::Bytes(PAYLOAD_BYTES as u64));
    group.bench_function("three_attempts", |b| {
        b.to_async(&runtime).iter(|| {
            let upstream = stream::iter(chunks.clone().into_iter().map(Ok::<_, std::io::Error>));
            let request = Request::post("http://bench.test/upload")
                .body(Body::from_byte_stream(upstream))
                .expect("build benchmark request");
            let call = client.execute(request);
            async move { black_box(call.await.expect("benchmark call").status()) }
        });
    });
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default().warm_up_time(Duration::from_secs(1));
    targets = bench_fan_out, bench_retry_loop
);
criterion_main!(benches);
