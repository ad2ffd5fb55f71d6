use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use peer8_codec::Message;

fn criterion_benchmark(c: &mut Criterion) {
    let sample = Message::Data {
        sender: 7,
        payload: vec![0u8; 512],
        flags: 0,
    };

    let encoded = sample.encode();

    let mut group = c.benchmark_group("packet");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_message", |bencher| {
        bencher.iter(|| sample.encode());
    });

    group.bench_function("decode_message", |bencher| {
        bencher.iter(|| Message::decode(&encoded).unwrap());
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
