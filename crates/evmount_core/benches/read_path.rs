use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use evmount_core::ewf::{EwfWriter, WriterOptions};
use evmount_core::{CacheOptions, ImageAccess};
use tempfile::TempDir;

const IMAGE_SIZE: usize = 16 * 1024 * 1024;

fn build_image(dir: &TempDir) -> Vec<std::path::PathBuf> {
    let mut state = 0x2545_F491u32;
    let data: Vec<u8> = (0..IMAGE_SIZE)
        .map(|i| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            if (i / 65536) % 2 == 0 {
                (state >> 16) as u8
            } else {
                (i % 97) as u8
            }
        })
        .collect();

    EwfWriter::new(WriterOptions::default())
        .write_image(&data[..], IMAGE_SIZE as u64, &dir.path().join("bench"))
        .expect("bench image")
        .segments
}

fn bench_sequential_read(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let segments = build_image(&dir);

    let mut group = c.benchmark_group("read_path");
    group.throughput(Throughput::Bytes(IMAGE_SIZE as u64));

    group.bench_function("sequential_128k", |b| {
        let access = ImageAccess::open(&segments, &CacheOptions::default()).expect("open");
        let mut buf = vec![0u8; 128 * 1024];
        b.iter(|| {
            let mut offset = 0u64;
            while offset < access.size() {
                offset += access.read(offset, &mut buf).expect("read") as u64;
            }
            black_box(&buf);
        });
    });

    group.bench_function("strided_4k", |b| {
        let access = ImageAccess::open(&segments, &CacheOptions::default()).expect("open");
        let mut buf = vec![0u8; 4096];
        b.iter(|| {
            for i in 0..1024u64 {
                let offset = (i * 1_048_573) % (IMAGE_SIZE as u64 - 4096);
                access.read(offset, &mut buf).expect("read");
            }
            black_box(&buf);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_sequential_read);
criterion_main!(benches);
