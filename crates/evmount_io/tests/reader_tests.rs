use evmount_core::ewf::{EwfWriter, WriterOptions};
use evmount_core::{BlockSource, CacheOptions, CoreError};
use evmount_io::{ImageFormat, Reader, create_reader, detect_format, discover_segments};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 31 % 251) as u8).collect()
}

fn write_segments(dir: &TempDir, data: &[u8]) -> Vec<PathBuf> {
    let options = WriterOptions {
        sectors_per_chunk: 64,
        bytes_per_sector: 512,
        chunks_per_table: 2,
        max_segment_size: 120_000,
        compression_level: None,
        ..Default::default()
    };
    EwfWriter::new(options)
        .write_image(data, data.len() as u64, &dir.path().join("case"))
        .unwrap()
        .segments
}

#[test]
fn test_detect_format() {
    let dir = TempDir::new().unwrap();
    let segments = write_segments(&dir, &pattern(64 * 1024));
    assert_eq!(detect_format(&segments[0]).unwrap(), ImageFormat::Ewf);

    let raw = dir.path().join("disk.dd");
    fs::write(&raw, pattern(4096)).unwrap();
    assert_eq!(detect_format(&raw).unwrap(), ImageFormat::Raw);

    let tiny = dir.path().join("tiny.bin");
    fs::write(&tiny, b"EVF").unwrap();
    assert_eq!(detect_format(&tiny).unwrap(), ImageFormat::Raw);
}

#[test]
fn test_discover_segments_orders_by_header() {
    let dir = TempDir::new().unwrap();
    let segments = write_segments(&dir, &pattern(512 * 1024));
    assert!(segments.len() > 2, "fixture should span several segments");

    fs::write(dir.path().join("case.txt"), b"notes").unwrap();
    fs::write(dir.path().join("case.E7Z"), b"not a segment").unwrap();

    let found = discover_segments(segments.last().unwrap()).unwrap();
    assert_eq!(found, segments);
}

#[test]
fn test_create_reader_ewf_from_first_segment() {
    let dir = TempDir::new().unwrap();
    let data = pattern(512 * 1024);
    let segments = write_segments(&dir, &data);

    let mut reader = create_reader(&segments[..1], &CacheOptions::default()).unwrap();
    assert_eq!(reader.size(), data.len() as u64);

    let mut buf = vec![0u8; 10_000];
    assert_eq!(reader.read_at(300_000, &mut buf).unwrap(), buf.len());
    assert_eq!(&buf[..], &data[300_000..310_000]);
    assert!(reader.stats().is_some());
    reader.close().unwrap();
}

#[test]
fn test_create_reader_raw() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("disk.dd");
    let data = pattern(8192);
    fs::write(&raw, &data).unwrap();

    let mut reader = create_reader(&[&raw], &CacheOptions::default()).unwrap();
    assert_eq!(reader.size(), 8192);
    let mut buf = vec![0u8; 100];
    assert_eq!(reader.read_at(8150, &mut buf).unwrap(), 42);
    assert_eq!(&buf[..42], &data[8150..]);
    assert!(reader.stats().is_none());

    let err = create_reader(&[&raw, &raw], &CacheOptions::default()).err().unwrap();
    assert!(matches!(err, CoreError::InvalidFormat(_)));
}

#[test]
fn test_reader_falls_back_for_empty_file() {
    let dir = TempDir::new().unwrap();
    let empty = dir.path().join("empty.dd");
    fs::write(&empty, b"").unwrap();

    let reader = Reader::new(&empty).unwrap();
    assert!(!reader.is_mmap());
    assert_eq!(reader.size(), 0);
}

#[test]
fn test_create_reader_without_paths() {
    let none: [PathBuf; 0] = [];
    assert!(create_reader(&none, &CacheOptions::default()).is_err());
}
