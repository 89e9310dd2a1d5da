/// Benchmarks for message reassembly on the receive path.
///
/// Frames are served from memory so only buffer management and UTF-8 validation are measured:
/// messages that fit the buffer, messages that force it to grow, and heavily fragmented ones.
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use textsock::CancellationToken;
use textsock::buffer::ReceiveBuffer;
use textsock::reassembler::Reassembler;
use textsock::transport::{Received, Transport};

/// Replays one message forever, `fragment` bytes per frame.
struct Replay {
    message: Vec<u8>,
    fragment: usize,
    offset: AtomicUsize,
}

impl Replay {
    fn new(len: usize, fragment: usize) -> Self {
        Self {
            message: "abcdefghij".repeat(len.div_ceil(10)).into_bytes()[..len].to_vec(),
            fragment,
            offset: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for Replay {
    async fn receive(&self, buf: &mut [u8]) -> textsock::Result<Received> {
        let offset = self.offset.load(Ordering::Relaxed);
        let len = (self.message.len() - offset)
            .min(self.fragment)
            .min(buf.len());

        buf[..len].copy_from_slice(&self.message[offset..offset + len]);

        let end_of_message = offset + len == self.message.len();
        let next = if end_of_message { 0 } else { offset + len };
        self.offset.store(next, Ordering::Relaxed);

        Ok(Received::Frame {
            len,
            end_of_message,
        })
    }

    async fn send_text(&self, _text: &str) -> textsock::Result<()> {
        Ok(())
    }

    async fn close(&self) -> textsock::Result<()> {
        Ok(())
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime should build")
}

fn bench_fits_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble/fits_buffer");
    let rt = runtime();
    let token = CancellationToken::new();

    for size in [64_usize, 1024, 16 * 1024] {
        let transport = Replay::new(size, size);
        let mut reassembler = Reassembler::new(
            ReceiveBuffer::with_capacity(size).expect("capacity is positive"),
            false,
        );

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(reassembler.next_message(&transport, &token))
                    .expect("message should reassemble")
            });
        });
    }

    group.finish();
}

fn bench_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble/growth");
    let rt = runtime();
    let token = CancellationToken::new();

    for size in [4 * 1024_usize, 64 * 1024, 1024 * 1024] {
        let transport = Replay::new(size, 4096);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            // A fresh buffer every iteration so each message pays for growing from 1 KiB.
            b.iter(|| {
                let mut reassembler = Reassembler::new(
                    ReceiveBuffer::with_capacity(1024).expect("capacity is positive"),
                    true,
                );
                rt.block_on(reassembler.next_message(&transport, &token))
                    .expect("message should reassemble")
            });
        });
    }

    group.finish();
}

fn bench_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble/fragmented");
    let rt = runtime();
    let token = CancellationToken::new();
    let size = 16 * 1024;

    for fragment in [16_usize, 256, 4096] {
        let transport = Replay::new(size, fragment);
        let mut reassembler = Reassembler::new(
            ReceiveBuffer::with_capacity(size).expect("capacity is positive"),
            true,
        );

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(fragment),
            &fragment,
            |b, _| {
                b.iter(|| {
                    rt.block_on(reassembler.next_message(&transport, &token))
                        .expect("message should reassemble")
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_fits_buffer, bench_growth, bench_fragmented);
criterion_main!(benches);
