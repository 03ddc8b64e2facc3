//! Chunk lookup, read and decode, with a single-slot decoded cache.

use super::directory::Directory;
use super::format::{SPARSE_RECORD_SIZE, adler32, le_u32};
use super::segment_cache::SegmentCache;
use super::table_cache::TableCache;
use crate::config::CacheOptions;
use crate::error::{CoreError, Result};
use crate::stats::CacheStats;
use flate2::read::ZlibDecoder;
use std::io::{Read, Seek, SeekFrom};
use tracing::trace;

/// Slack allowed above the chunk size for stored chunks (checksum, zlib overhead).
pub const CHUNK_SLACK: u64 = 4096;

#[derive(Debug, Default)]
struct ChunkSlot {
    chunk: Option<u64>,
    data: Vec<u8>,
}

/// Turns chunk numbers into decoded bytes.
///
/// Owns the directory and both cache tiers. Every access stamps the table
/// and segment it touches with a logical clock that drives LRU eviction.
#[derive(Debug)]
pub struct ChunkPipeline {
    directory: Directory,
    segments: SegmentCache,
    tables: TableCache,
    slot: ChunkSlot,
    scratch: Vec<u8>,
    stored: Vec<u8>,
    clock: u64,
    stats: CacheStats,
}

impl ChunkPipeline {
    pub fn new(directory: Directory, options: &CacheOptions) -> Self {
        let stats = CacheStats {
            segment_count: directory.segments.len(),
            table_count: directory.tables.len(),
            total_table_bytes: directory.total_table_size(),
            ..Default::default()
        };
        Self {
            segments: SegmentCache::new(directory.segments.len(), options.max_open_segments),
            tables: TableCache::new(directory.tables.len(), options.max_table_cache),
            directory,
            slot: ChunkSlot::default(),
            scratch: Vec::new(),
            stored: Vec::new(),
            clock: 0,
            stats,
        }
    }

    #[inline]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    #[inline]
    pub fn stats_mut(&mut self) -> &mut CacheStats {
        &mut self.stats
    }

    #[inline]
    pub fn buffer_capacity(&self) -> u64 {
        self.directory.chunk_size + CHUNK_SLACK
    }

    pub fn segment_cache(&self) -> &SegmentCache {
        &self.segments
    }

    pub fn table_cache(&self) -> &TableCache {
        &self.tables
    }

    /// Number of the chunk currently held in the decoded slot.
    pub fn resident_chunk(&self) -> Option<u64> {
        self.slot.chunk
    }

    /// Returns the decoded bytes of `chunk`.
    ///
    /// A failed decode leaves the previously resident chunk in place.
    pub fn read_chunk(&mut self, chunk: u64) -> Result<&[u8]> {
        if self.slot.chunk == Some(chunk) {
            self.stats.chunk_hits += 1;
            return Ok(&self.slot.data);
        }
        self.stats.chunk_misses += 1;

        self.decode_into_scratch(chunk)?;
        std::mem::swap(&mut self.slot.data, &mut self.scratch);
        self.slot.chunk = Some(chunk);
        Ok(&self.slot.data)
    }

    fn decode_into_scratch(&mut self, chunk: u64) -> Result<()> {
        let capacity = self.buffer_capacity();
        let Self {
            directory,
            segments,
            tables,
            scratch,
            stored,
            clock,
            stats,
            ..
        } = self;

        let table_index = directory
            .find_table(chunk)
            .ok_or(CoreError::ChunkNotFound { chunk })?;
        let table = &directory.tables[table_index];

        *clock += 1;
        tables.touch(table_index, *clock);
        segments.touch(table.segment, *clock);

        let offsets = tables.acquire(directory, table, segments, stats)?;
        let local = (chunk - table.chunk_from) as usize;
        let (offset, compressed) = offsets.entry(local).ok_or(CoreError::ChunkNotFound { chunk })?;

        let length = match offsets.entry(local + 1) {
            Some((next, _)) => next.checked_sub(offset),
            None => {
                let (first, _) = offsets.entry(0).unwrap_or((offset, false));
                offset
                    .checked_sub(first)
                    .and_then(|used| table.sectors_size.checked_sub(used))
            }
        }
        .ok_or_else(|| {
            CoreError::InvalidFormat(format!("table entries for chunk {chunk} are out of order"))
        })?;
        let position = offsets.base_offset + offset;

        if length > capacity {
            return Err(CoreError::ChunkTooLarge {
                chunk,
                length,
                limit: capacity,
            });
        }
        let expected = directory.chunk_len(chunk);

        let segment = &directory.segments[table.segment];
        let file = segments.acquire(segment, table.segment, stats)?;
        stored.resize(length as usize, 0);
        file.seek(SeekFrom::Start(position))
            .and_then(|_| file.read_exact(&mut stored[..]))
            .map_err(|source| CoreError::ChunkIo { chunk, source })?;
        stats.bytes_read_compressed += length;

        decode_payload(chunk, stored, compressed, expected, scratch)?;
        stats.bytes_read_raw += expected as u64;

        trace!(chunk, position, length, compressed, "decoded chunk");
        Ok(())
    }

    pub fn close(&mut self) {
        self.segments.close_all();
        self.tables.clear();
        self.slot = ChunkSlot::default();
        self.stats.open_segments = 0;
        self.stats.table_cache_bytes = 0;
    }
}

/// Decodes one stored chunk into `out`.
///
/// Compressed chunks are zlib streams. Uncompressed chunks carry a trailing
/// Adler-32 of their payload. A bare four-byte record stands for a run of
/// zero bytes of the recorded length.
pub fn decode_payload(
    chunk: u64,
    stored: &[u8],
    compressed: bool,
    expected: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.clear();

    if compressed {
        ZlibDecoder::new(stored)
            .take(expected as u64 + 1)
            .read_to_end(out)
            .map_err(|source| CoreError::Decompress { chunk, source })?;
        if out.len() != expected {
            return Err(CoreError::ChunkLength {
                chunk,
                expected,
                actual: out.len(),
            });
        }
        return Ok(());
    }

    if stored.len() as u64 == SPARSE_RECORD_SIZE {
        let zeros = le_u32(stored, 0) as usize;
        if zeros != expected {
            return Err(CoreError::ChunkLength {
                chunk,
                expected,
                actual: zeros,
            });
        }
        out.resize(expected, 0);
        return Ok(());
    }

    if stored.len() < expected + 4 {
        return Err(CoreError::ChunkLength {
            chunk,
            expected,
            actual: stored.len().saturating_sub(4),
        });
    }
    let payload = &stored[..expected];
    let recorded = le_u32(stored, expected);
    let computed = adler32(payload);
    if recorded != computed {
        return Err(CoreError::ChunkChecksum {
            chunk,
            stored: recorded,
            computed,
        });
    }
    out.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn with_checksum(data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        out.extend_from_slice(&adler32(data).to_le_bytes());
        out
    }

    #[test]
    fn test_uncompressed_payload() {
        let mut out = Vec::new();
        decode_payload(0, &with_checksum(b"evidence"), false, 8, &mut out).unwrap();
        assert_eq!(out, b"evidence");
    }

    #[test]
    fn test_uncompressed_checksum_mismatch() {
        let mut stored = with_checksum(b"evidence");
        stored[0] = b'E';
        let mut out = Vec::new();
        let err = decode_payload(5, &stored, false, 8, &mut out).unwrap_err();
        assert!(matches!(err, CoreError::ChunkChecksum { chunk: 5, .. }));
    }

    #[test]
    fn test_uncompressed_too_short() {
        let mut out = Vec::new();
        let err = decode_payload(1, &with_checksum(b"abc"), false, 8, &mut out).unwrap_err();
        assert!(matches!(err, CoreError::ChunkLength { actual: 3, .. }));
    }

    #[test]
    fn test_compressed_payload() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
        enc.write_all(&data).unwrap();
        let stored = enc.finish().unwrap();

        let mut out = Vec::new();
        decode_payload(2, &stored, true, data.len(), &mut out).unwrap();
        assert_eq!(out, data);

        let err = decode_payload(2, &stored, true, 1000, &mut out).unwrap_err();
        assert!(matches!(err, CoreError::ChunkLength { expected: 1000, .. }));
    }

    #[test]
    fn test_corrupt_zlib_stream() {
        let mut out = Vec::new();
        let err = decode_payload(3, &[0x78, 0x9c, 0xFF, 0xFF, 0x00, 0x12], true, 64, &mut out)
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_sparse_record() {
        let mut out = vec![1, 2, 3];
        decode_payload(4, &512u32.to_le_bytes(), false, 512, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 512]);

        let err = decode_payload(4, &100u32.to_le_bytes(), false, 512, &mut out).unwrap_err();
        assert!(matches!(err, CoreError::ChunkLength { actual: 100, .. }));
    }
}
