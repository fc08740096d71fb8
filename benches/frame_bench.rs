use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use peer_protocol::core::codec::FrameCodec;
use peer_protocol::core::frame::{Frame, FrameCipher};
use peer_protocol::utils::crypto::Crypto;
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    let body_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &body_sizes {
        let body = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || Frame::plain(1, &body),
                |frame| {
                    let mut buf = BytesMut::with_capacity(size + 16);
                    FrameCodec::default().encode(frame, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        let mut wire = BytesMut::new();
        FrameCodec::default()
            .encode(Frame::plain(1, &body), &mut wire)
            .unwrap();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || wire.clone(),
                |mut buf| {
                    let decoded = FrameCodec::default().decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_frame_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_cipher");
    let cipher = Crypto::new(&[7u8; 32]);

    for &size in &[64usize, 4096, 65536] {
        let payload = vec![1u8; size];
        let sealed = FrameCipher::seal(&cipher, &payload).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("seal_{size}b"), |b| {
            b.iter(|| FrameCipher::seal(&cipher, &payload).unwrap())
        });
        group.bench_function(format!("open_{size}b"), |b| {
            b.iter(|| FrameCipher::open(&cipher, &sealed).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_frame_cipher);
criterion_main!(benches);
