#![allow(dead_code)]

use evmount_core::ewf::{AcquisitionMetadata, EwfWriter, WriterOptions};
use std::path::{Path, PathBuf};

/// Deterministic bytes mixing noise, runs and zero stretches so chunks end
/// up compressed, stored and sparse.
pub fn sample_image(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state = seed;
    for i in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        let byte = match (i / 8192) % 4 {
            0 => (state >> 16) as u8,
            1 => (i % 61) as u8,
            2 => 0,
            _ => (state >> 24) as u8 & 0x0F,
        };
        data.push(byte);
    }
    data
}

/// Chunk size 32 KiB made from 32-byte sectors so odd image sizes stay sector aligned.
pub fn small_sector_options() -> WriterOptions {
    WriterOptions {
        sectors_per_chunk: 1024,
        bytes_per_sector: 32,
        metadata: AcquisitionMetadata::from_pairs([
            ("c", "2024-117"),
            ("n", "HDD-3"),
            ("e", "R. Analyst"),
            ("a", "test image"),
        ]),
        ..Default::default()
    }
}

pub fn write_ewf(dir: &Path, data: &[u8], options: WriterOptions) -> Vec<PathBuf> {
    let summary = EwfWriter::new(options)
        .write_image(data, data.len() as u64, &dir.join("image"))
        .expect("writing fixture");
    summary.segments
}
