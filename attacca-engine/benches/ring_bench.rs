//! Sample ring buffer throughput benchmarks

use attacca_engine::node::ring_buffer::SampleRingBuffer;
use attacca_engine::SampleBuffer;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

fn bench_write_read_cycle(c: &mut Criterion) {
    const CHUNK: usize = 4_096;

    let mut group = c.benchmark_group("ring_buffer");
    group.throughput(Throughput::Elements(CHUNK as u64));

    for channels in [1u16, 2, 6] {
        let (mut writer, mut reader) = SampleRingBuffer::new(channels, 16_384).unwrap().split();
        let mut src = SampleBuffer::with_capacity(channels, CHUNK);
        for ch in 0..channels as usize {
            for (i, s) in src.channel_mut(ch).iter_mut().enumerate() {
                *s = i as f32;
            }
        }
        src.set_frame_len(CHUNK);
        let mut dst = SampleBuffer::with_capacity(channels, CHUNK);

        group.bench_function(format!("write_read_{}ch", channels), |b| {
            b.iter(|| {
                let written = writer.write(&src, CHUNK);
                let read = reader.read(&mut dst, CHUNK);
                assert_eq!(written, read);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_read_cycle);
criterion_main!(benches);
