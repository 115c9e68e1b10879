use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use amoskys::envelope::{compute_event_id, seal, verify, EventClass};
use amoskys::registry::SignerRegistry;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

fn signer() -> (SigningKey, SignerRegistry) {
    let mut csprng = OsRng;
    let key = SigningKey::generate(&mut csprng);
    let registry = SignerRegistry::from_pairs(vec![("bench-agent".to_string(), key.verifying_key())]);
    (key, registry)
}

fn bench_seal(c: &mut Criterion) {
    let (key, _) = signer();
    let mut group = c.benchmark_group("envelope_seal");
    for payload_len in [64usize, 1024, 16 * 1024] {
        let payload = vec![0u8; payload_len];
        group.throughput(Throughput::Bytes(payload_len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(payload_len), &payload, |b, payload| {
            b.iter(|| {
                black_box(seal(
                    &key,
                    "bench-agent".into(),
                    EventClass::Auth,
                    0,
                    1,
                    payload.clone(),
                ))
            });
        });
    }
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let (key, registry) = signer();
    let env = seal(&key, "bench-agent".into(), EventClass::Auth, 0, 1, vec![0u8; 1024]);
    c.bench_function("envelope_verify", |b| {
        b.iter(|| black_box(verify(black_box(&env), black_box(&registry))));
    });
}

fn bench_compute_event_id(c: &mut Criterion) {
    let (key, _) = signer();
    let env = seal(&key, "bench-agent".into(), EventClass::Auth, 0, 1, vec![0u8; 1024]);
    c.bench_function("compute_event_id", |b| {
        b.iter(|| black_box(compute_event_id(black_box(&env))));
    });
}

criterion_group!(benches, bench_seal, bench_verify, bench_compute_event_id);
criterion_main!(benches);
