#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use aero_wire_protocol::cmd::{QueueOnSubmittedWorkDone, QueueWriteBuffer};
#[cfg(not(target_arch = "wasm32"))]
use aero_wire_protocol::{
    ChunkedCommandHandler, ChunkedCommandSerializer, MemoryTransport, ObjectHandle, WireCmd,
};
#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

#[cfg(not(target_arch = "wasm32"))]
const MAX_ALLOCATION_SIZE: usize = 64 * 1024;

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("AERO_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn write_buffer(len: usize) -> QueueWriteBuffer {
    QueueWriteBuffer {
        queue: ObjectHandle::new(1, 1),
        buffer: ObjectHandle::new(2, 1),
        buffer_offset: 0,
        data_len: len as u64,
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_serialize");

    // Small fixed-size commands: the per-command overhead path.
    group.throughput(Throughput::Elements(1024));
    group.bench_function("work_done_x1024", |b| {
        let mut s = ChunkedCommandSerializer::new(MemoryTransport::new(MAX_ALLOCATION_SIZE));
        b.iter(|| {
            for serial in 0..1024u64 {
                let cmd = QueueOnSubmittedWorkDone {
                    queue: ObjectHandle::new(1, 1),
                    request_serial: serial,
                };
                s.serialize(black_box(&cmd), &[]).unwrap();
            }
            s.flush().unwrap();
            black_box(s.inner_mut().take_flushed());
        });
    });

    // Trailing payloads either side of the chunking threshold.
    for len in [4 * 1024, 60 * 1024, 1024 * 1024] {
        let data = vec![0x5Au8; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("write_buffer", len), &data, |b, data| {
            let mut s = ChunkedCommandSerializer::new(MemoryTransport::new(MAX_ALLOCATION_SIZE));
            b.iter(|| {
                s.serialize(&write_buffer(data.len()), black_box(data)).unwrap();
                s.flush().unwrap();
                black_box(s.inner_mut().take_flushed());
            });
        });
    }

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_reassemble(c: &mut Criterion) {
    let data = vec![0xA5u8; 1024 * 1024];
    let mut s = ChunkedCommandSerializer::new(MemoryTransport::new(MAX_ALLOCATION_SIZE));
    s.serialize(&write_buffer(data.len()), &data).unwrap();
    s.flush().unwrap();
    let stream = s.inner_mut().take_flushed();

    let mut group = c.benchmark_group("wire_reassemble");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    for chunk in [4 * 1024, MAX_ALLOCATION_SIZE] {
        group.bench_with_input(BenchmarkId::new("write_buffer_1m", chunk), &stream, |b, stream| {
            b.iter(|| {
                let mut handler = ChunkedCommandHandler::new();
                let mut dispatched = 0usize;
                for piece in stream.chunks(chunk) {
                    handler
                        .handle_bytes(piece, |header, body| {
                            let cmd = WireCmd::decode(header.command_id, body)?;
                            black_box(cmd);
                            dispatched += 1;
                            Ok(())
                        })
                        .unwrap();
                }
                black_box(dispatched);
            });
        });
    }
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_serialize, bench_reassemble
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
