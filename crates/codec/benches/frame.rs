use bytes::BytesMut;
use commux_codec::{Decoder, Message, MessageId, Value, encode};
use criterion::{Criterion, criterion_group, criterion_main};

fn criterion_benchmark(c: &mut Criterion) {
    let message = Message::request(
        MessageId(1),
        "echo",
        "/service/deep/path",
        Value::String("x".repeat(512)),
    );

    let mut encoded = BytesMut::new();
    encode(&message, &mut encoded).unwrap();

    c.bench_function("encode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(1024);
            encode(&message, &mut buf).unwrap();
        })
    });

    c.bench_function("decode", |b| {
        b.iter(|| {
            let mut decoder = Decoder::default();
            decoder.extend(&encoded);
            decoder.decode().unwrap().unwrap()
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
