use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tunnel_common::TunnelConfig;
use tunnel_core::{PooledBuffer, PooledPacket};
use tunnel_crypto::SymmetricKeypair;
use tunnel_session::{OrderedPipeline, PeerSession, PipelineConfig};

const BATCH: usize = 256;

fn bench_identity_pipeline(c: &mut Criterion) {
    tunnel_common::init_tracing_with_default("warn");

    let mut group = c.benchmark_group("ordered_pipeline");
    group.throughput(Throughput::Elements(BATCH as u64));

    for workers in [1, 4] {
        let pipeline: OrderedPipeline<u64, u64, ()> = OrderedPipeline::new(
            PipelineConfig::new("bench", BATCH, workers),
            |x: &u64| Ok(x.wrapping_mul(31)),
            |_, _| {},
        )
        .unwrap();

        group.bench_with_input(BenchmarkId::new("identity", workers), &workers, |b, _| {
            b.iter(|| {
                for i in 0..BATCH as u64 {
                    pipeline.enqueue(i).unwrap();
                }
                for _ in 0..BATCH {
                    pipeline.dequeue().unwrap();
                }
            })
        });
    }
    group.finish();
}

fn bench_seal_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("peer_session");

    for size in [64usize, 1400] {
        let config = TunnelConfig {
            pipeline_capacity: BATCH,
            ..TunnelConfig::default()
        };
        let alice = PeerSession::with_local_index(&config, 1).unwrap();
        let bob = PeerSession::with_local_index(&config, 2).unwrap();

        group.throughput(Throughput::Bytes((size * BATCH) as u64));
        group.bench_with_input(BenchmarkId::new("seal_open", size), &size, |b, &size| {
            // Fresh keys per iteration keep the replay window out of the way.
            b.iter(|| {
                let (a, k) = SymmetricKeypair::random_pair();
                alice.install_keypair(a, 2).unwrap();
                bob.install_keypair(k, 1).unwrap();

                for _ in 0..BATCH {
                    let packet =
                        PooledPacket::new(size, PooledBuffer::unpooled(vec![0x45; size])).unwrap();
                    alice.submit_outbound(packet).unwrap();
                }
                for _ in 0..BATCH {
                    let sealed = alice.next_outbound().unwrap();
                    bob.submit_datagram(sealed.as_bytes()).unwrap();
                }
                for _ in 0..BATCH {
                    bob.next_inbound().unwrap();
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_identity_pipeline, bench_seal_open);
criterion_main!(benches);
