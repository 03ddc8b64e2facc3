//! Writes a raw stream as EWF version 1 segment files.
//!
//! Segment 1 opens with `header` and `volume`. Each segment then carries one
//! or more `sectors`/`table`/`table2` groups and ends with `next`, or `done`
//! for the final segment.

use super::format::{
    COMPRESSED_FLAG, FileHeader, OFFSET_MASK, SECTION_DESCRIPTOR_SIZE, SectionDescriptor,
    TABLE_HEADER_SIZE, TableHeader, VolumeSection, adler32,
};
use super::metadata::AcquisitionMetadata;
use crate::error::{CoreError, Result};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DESCRIPTOR: u64 = SECTION_DESCRIPTOR_SIZE as u64;

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    /// zlib level, or `None` to store every chunk verbatim.
    pub compression_level: Option<u32>,
    /// Store all-zero chunks as four-byte sparse records.
    pub sparse_zero_chunks: bool,
    pub chunks_per_table: u32,
    pub max_segment_size: u64,
    pub guid: [u8; 16],
    pub metadata: AcquisitionMetadata,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            sectors_per_chunk: 64,
            bytes_per_sector: 512,
            compression_level: Some(6),
            sparse_zero_chunks: false,
            chunks_per_table: 2048,
            max_segment_size: 1500 * 1024 * 1024,
            guid: [0; 16],
            metadata: AcquisitionMetadata::default(),
        }
    }
}

impl WriterOptions {
    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.sectors_per_chunk as u64 * self.bytes_per_sector as u64
    }

    fn validate(&self, image_size: u64) -> Result<()> {
        if self.chunk_size() == 0 {
            return Err(CoreError::InvalidOption(
                "chunk size must be non-zero".to_string(),
            ));
        }
        if self.chunks_per_table == 0 {
            return Err(CoreError::InvalidOption(
                "tables must hold at least one chunk".to_string(),
            ));
        }
        if image_size % self.bytes_per_sector as u64 != 0 {
            return Err(CoreError::InvalidOption(format!(
                "image size {image_size} is not a multiple of {} byte sectors",
                self.bytes_per_sector
            )));
        }
        if self.max_segment_size > OFFSET_MASK as u64 {
            return Err(CoreError::InvalidOption(
                "segments may not exceed 2 GiB".to_string(),
            ));
        }
        if let Some(level) = self.compression_level {
            if level > 9 {
                return Err(CoreError::InvalidOption(format!(
                    "zlib level {level} is out of range"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub segments: Vec<PathBuf>,
    pub chunks: u64,
    pub compressed_chunks: u64,
    pub sparse_chunks: u64,
    pub bytes_written: u64,
}

/// File name extension of segment `number`: E01..E99, then EAA, EAB and so on.
pub fn segment_extension(number: u16) -> Result<String> {
    match number {
        0 => Err(CoreError::InvalidOption(
            "segment numbers start at 1".to_string(),
        )),
        1..=99 => Ok(format!("E{number:02}")),
        _ => {
            let k = (number - 100) as u32;
            let first = b'E' as u32 + k / 676;
            if first > b'Z' as u32 {
                return Err(CoreError::InvalidOption(format!(
                    "segment number {number} has no file extension"
                )));
            }
            let second = b'A' as u32 + (k / 26) % 26;
            let third = b'A' as u32 + k % 26;
            Ok([first, second, third]
                .iter()
                .map(|&c| char::from(c as u8))
                .collect())
        }
    }
}

pub struct EwfWriter {
    options: WriterOptions,
}

impl EwfWriter {
    pub fn new(options: WriterOptions) -> Self {
        Self { options }
    }

    /// Writes `image_size` bytes from `input` into segments named after `base`.
    pub fn write_image<R: Read>(&self, input: R, image_size: u64, base: &Path) -> Result<WriteSummary> {
        self.write_image_with(input, image_size, base, |_| true)
    }

    /// Like [`EwfWriter::write_image`], reporting the bytes consumed after
    /// every chunk. Returning `false` from `progress` aborts the write.
    pub fn write_image_with<R, F>(
        &self,
        mut input: R,
        image_size: u64,
        base: &Path,
        mut progress: F,
    ) -> Result<WriteSummary>
    where
        R: Read,
        F: FnMut(u64) -> bool,
    {
        let opts = &self.options;
        opts.validate(image_size)?;

        let chunk_size = opts.chunk_size();
        let total_chunks = image_size.div_ceil(chunk_size);
        let chunk_count = u32::try_from(total_chunks).map_err(|_| {
            CoreError::InvalidOption(format!("{total_chunks} chunks exceed the volume limit"))
        })?;

        let volume = VolumeSection {
            media_type: 0x01,
            chunk_count,
            sectors_per_chunk: opts.sectors_per_chunk,
            bytes_per_sector: opts.bytes_per_sector,
            sector_count: image_size / opts.bytes_per_sector as u64,
            media_flags: 0x01,
            compression_level: u8::from(opts.compression_level.is_some()),
            error_block_size: 64,
            guid: opts.guid,
            ..Default::default()
        };

        let mut summary = WriteSummary::default();
        let mut encoder = ChunkEncoder::new(opts, chunk_size as usize);
        let mut next_chunk = 0u64;
        let mut consumed = 0u64;
        let mut number: u16 = 1;

        loop {
            let path = base.with_extension(segment_extension(number)?);
            let mut out = BufWriter::new(File::create(&path)?);
            out.write_all(&FileHeader { segment_number: number }.encode())?;

            if number == 1 {
                let text = opts.metadata.to_header_text();
                write_section(&mut out, "header", &deflate(text.as_bytes(), 9)?)?;
                write_section(&mut out, "volume", &volume.encode())?;
            }

            let mut groups = 0;
            while next_chunk < total_chunks {
                let count = (total_chunks - next_chunk).min(opts.chunks_per_table as u64);
                let worst = group_upper_bound(count, chunk_size);
                let position = out.stream_position()?;
                if groups > 0 && position + worst + DESCRIPTOR > opts.max_segment_size {
                    break;
                }

                for chunk in next_chunk..next_chunk + count {
                    let len = if chunk + 1 == total_chunks && image_size % chunk_size != 0 {
                        (image_size % chunk_size) as usize
                    } else {
                        chunk_size as usize
                    };
                    encoder.fill(&mut input, len, consumed)?;
                    consumed += len as u64;
                    if !progress(consumed) {
                        return Err(CoreError::Io(std::io::Error::new(
                            std::io::ErrorKind::Interrupted,
                            "acquisition cancelled",
                        )));
                    }
                    encoder.stage(len, &mut summary)?;
                }
                write_group(&mut out, &mut encoder)?;
                next_chunk += count;
                groups += 1;
            }

            let done = next_chunk == total_chunks;
            let here = out.stream_position()?;
            let name = if done { "done" } else { "next" };
            out.write_all(&SectionDescriptor::encode(name, here, DESCRIPTOR))?;
            out.flush()?;

            summary.bytes_written += out.stream_position()?;
            debug!(segment = number, path = %path.display(), groups, "wrote segment");
            summary.segments.push(path);

            if done {
                break;
            }
            number = number
                .checked_add(1)
                .ok_or_else(|| CoreError::InvalidOption("too many segments".to_string()))?;
        }

        summary.chunks = total_chunks;
        info!(
            segments = summary.segments.len(),
            chunks = summary.chunks,
            compressed = summary.compressed_chunks,
            sparse = summary.sparse_chunks,
            "wrote EWF image"
        );
        Ok(summary)
    }
}

/// Encodes chunks for the group being written.
struct ChunkEncoder {
    level: Option<u32>,
    sparse: bool,
    input: Vec<u8>,
    /// Stored bytes of the staged chunks, back to back.
    staged: Vec<u8>,
    /// Offset into `staged` and compression flag per staged chunk.
    entries: Vec<(u64, bool)>,
}

impl ChunkEncoder {
    fn new(options: &WriterOptions, chunk_size: usize) -> Self {
        Self {
            level: options.compression_level,
            sparse: options.sparse_zero_chunks,
            input: vec![0; chunk_size],
            staged: Vec::new(),
            entries: Vec::new(),
        }
    }

    fn fill<R: Read>(&mut self, input: &mut R, len: usize, consumed: u64) -> Result<()> {
        input.read_exact(&mut self.input[..len]).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CoreError::InvalidFormat(format!("input ended after about {consumed} bytes"))
            } else {
                CoreError::Io(e)
            }
        })
    }

    fn stage(&mut self, len: usize, summary: &mut WriteSummary) -> Result<()> {
        let data = &self.input[..len];
        let at = self.staged.len() as u64;

        if self.sparse && data.iter().all(|&b| b == 0) {
            self.staged.extend_from_slice(&(len as u32).to_le_bytes());
            self.entries.push((at, false));
            summary.sparse_chunks += 1;
            return Ok(());
        }

        if let Some(level) = self.level {
            let packed = deflate(data, level)?;
            if packed.len() < len {
                self.staged.extend_from_slice(&packed);
                self.entries.push((at, true));
                summary.compressed_chunks += 1;
                return Ok(());
            }
        }

        self.staged.extend_from_slice(data);
        self.staged.extend_from_slice(&adler32(data).to_le_bytes());
        self.entries.push((at, false));
        Ok(())
    }
}

fn group_upper_bound(count: u64, chunk_size: u64) -> u64 {
    let sectors = DESCRIPTOR + count * (chunk_size + 4);
    let table = DESCRIPTOR + TABLE_HEADER_SIZE as u64 + count * 4 + 4;
    sectors + 2 * table
}

/// Writes the staged chunks as a `sectors` section followed by its tables.
fn write_group<W: Write + Seek>(out: &mut W, encoder: &mut ChunkEncoder) -> Result<()> {
    let sectors_at = out.stream_position()?;
    let sectors_size = DESCRIPTOR + encoder.staged.len() as u64;
    let table_at = sectors_at + sectors_size;
    out.write_all(&SectionDescriptor::encode("sectors", table_at, sectors_size))?;
    out.write_all(&encoder.staged)?;

    let mut body = TableHeader::encode(encoder.entries.len() as u32, sectors_at).to_vec();
    let entries_at = body.len();
    for &(at, compressed) in &encoder.entries {
        let relative = DESCRIPTOR + at;
        if relative > OFFSET_MASK as u64 {
            return Err(CoreError::InvalidOption(
                "chunk offset does not fit a table entry".to_string(),
            ));
        }
        let flag = if compressed { COMPRESSED_FLAG } else { 0 };
        body.extend_from_slice(&(relative as u32 | flag).to_le_bytes());
    }
    let checksum = adler32(&body[entries_at..]);
    body.extend_from_slice(&checksum.to_le_bytes());

    write_section(out, "table", &body)?;
    write_section(out, "table2", &body)?;

    encoder.staged.clear();
    encoder.entries.clear();
    Ok(())
}

fn write_section<W: Write + Seek>(out: &mut W, name: &str, body: &[u8]) -> Result<()> {
    let here = out.stream_position()?;
    let size = DESCRIPTOR + body.len() as u64;
    out.write_all(&SectionDescriptor::encode(name, here + size, size))?;
    out.write_all(body)?;
    Ok(())
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_extensions() {
        assert_eq!(segment_extension(1).unwrap(), "E01");
        assert_eq!(segment_extension(99).unwrap(), "E99");
        assert_eq!(segment_extension(100).unwrap(), "EAA");
        assert_eq!(segment_extension(101).unwrap(), "EAB");
        assert_eq!(segment_extension(126).unwrap(), "EBA");
        assert_eq!(segment_extension(100 + 676).unwrap(), "FAA");
        assert!(segment_extension(0).is_err());
        assert!(segment_extension(u16::MAX).is_err());
    }

    #[test]
    fn test_options_validation() {
        let opts = WriterOptions::default();
        assert!(opts.validate(512 * 10).is_ok());
        assert!(opts.validate(513).is_err());

        let bad = WriterOptions {
            compression_level: Some(12),
            ..Default::default()
        };
        assert!(bad.validate(512).is_err());
    }

    #[test]
    fn test_sparse_and_compressed_staging() {
        let opts = WriterOptions {
            sparse_zero_chunks: true,
            ..Default::default()
        };
        let mut encoder = ChunkEncoder::new(&opts, 1024);
        let mut summary = WriteSummary::default();

        encoder.stage(1024, &mut summary).unwrap();
        assert_eq!(encoder.staged.len(), 4);
        assert_eq!(summary.sparse_chunks, 1);

        encoder.input.fill(b'a');
        encoder.stage(1024, &mut summary).unwrap();
        assert_eq!(summary.compressed_chunks, 1);
        assert_eq!(encoder.entries, vec![(0, false), (4, true)]);
    }
}
