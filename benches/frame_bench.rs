use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use pooled_transport::core::{FrameReader, FrameWriter, SessionId, TcpFrame, TcpFrameCodec};
use pooled_transport::pool::BufferArena;
use pooled_transport::transport::reliability::{ReceivedFrame, ReliabilityEngine, ReliabilitySettings};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [16usize, 256, 1024, 8192];

    for &size in &payload_sizes {
        let arena = BufferArena::new(size + 64, 16);
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("writer_tcp_{size}b"), |b| {
            b.iter(|| {
                let mut writer = FrameWriter::new(&arena, 1).unwrap();
                writer.write_bytes(&payload).unwrap();
                black_box(writer.to_tcp_frame().unwrap());
            })
        });

        group.bench_function(format!("writer_udp_stamped_{size}b"), |b| {
            let id = SessionId::new(*b"BNCH");
            b.iter(|| {
                let mut writer = FrameWriter::new(&arena, 1).unwrap();
                writer.write_bytes(&payload).unwrap();
                let mut frame = writer.to_udp_frame().unwrap();
                frame.stamp(id, 7, 0).unwrap();
                black_box(frame);
            })
        });

        group.bench_function(format!("codec_encode_{size}b"), |b| {
            b.iter_batched(
                || TcpFrame::new(1, payload.clone()),
                |frame| {
                    let mut buf = BytesMut::with_capacity(size + 4);
                    TcpFrameCodec::default().encode(frame, &mut buf).unwrap();
                    buf
                },
                BatchSize::SmallInput,
            )
        });

        let encoded = TcpFrame::new(1, payload.clone()).to_bytes().unwrap();
        group.bench_function(format!("codec_decode_{size}b"), |b| {
            b.iter_batched(
                || BytesMut::from(&encoded[..]),
                |mut buf| TcpFrameCodec::default().decode(&mut buf).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_reader_fields(c: &mut Criterion) {
    let arena = BufferArena::new(256, 4);
    let mut writer = FrameWriter::new(&arena, 1).unwrap();
    writer
        .write_i32(42)
        .and_then(|w| w.write_f32(1.5))
        .and_then(|w| w.write_str("player-name"))
        .and_then(|w| w.write_f64(-2.25))
        .unwrap();
    let frame = writer.to_tcp_frame().unwrap();
    let body = TcpFrame::from_bytes(frame.as_bytes()).unwrap().payload;

    c.bench_function("reader_mixed_fields", |b| {
        b.iter(|| {
            let mut reader = FrameReader::new(&body);
            black_box(reader.read_i32().unwrap());
            black_box(reader.read_f32().unwrap());
            black_box(reader.read_str().unwrap());
            black_box(reader.read_f64().unwrap());
        })
    });
}

fn bench_receive_window(c: &mut Criterion) {
    c.bench_function("receive_window_reverse_64", |b| {
        b.iter_batched(
            || ReliabilityEngine::new(ReliabilitySettings::default()),
            |mut engine| {
                for sequence in (1..=64u16).rev() {
                    black_box(engine.update_received(ReceivedFrame {
                        sequence,
                        packet_type: 1,
                        payload: Bytes::new(),
                    }));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_frame_encode_decode,
    bench_reader_fields,
    bench_receive_window
);
criterion_main!(benches);
