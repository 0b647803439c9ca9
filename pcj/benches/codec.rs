use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pcj::msg::{BroadcastMsg, Message};
use pcj::wire::to_bytes;
use rand::Rng;

fn broadcast_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let values: Vec<i64> = (0..size).map(|_| rng.gen()).collect();

    Message::Broadcast(BroadcastMsg::Request {
        group: 0,
        requester: 3,
        req: 17,
        storage: "shared".to_string(),
        name: "x".to_string(),
        value: to_bytes(&values),
    })
    .encode(16384)
}

fn bench_codec(c: &mut Criterion) {
    let payload = broadcast_payload(1024);

    c.bench_function("encode broadcast 8k", |b| {
        b.iter(|| {
            black_box(broadcast_payload(black_box(1024)));
        })
    });

    c.bench_function("decode broadcast 8k", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&payload)).unwrap());
        })
    });
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
