//! Read access to EWF (E01) containers.

pub mod chunk;
pub mod directory;
pub mod format;
pub mod metadata;
pub mod segment_cache;
pub mod table_cache;
pub mod writer;

pub use chunk::ChunkPipeline;
pub use directory::{Directory, Section, SectionIter, Segment, Table};
pub use metadata::AcquisitionMetadata;
pub use writer::{EwfWriter, WriteSummary, WriterOptions};

use crate::config::CacheOptions;
use crate::error::{CoreError, Result};
use crate::stats::{CacheStats, StatsReporter};
use crate::traits::BlockSource;
use std::fmt::Write as _;
use std::path::Path;

/// A scanned EWF container readable as a flat image.
#[derive(Debug)]
pub struct EwfImage {
    pipeline: ChunkPipeline,
    reporter: Option<StatsReporter>,
}

impl EwfImage {
    /// Scans the segment files and prepares the cache tiers.
    ///
    /// # Arguments
    ///
    /// * `paths` - Every segment file of the container, in any order
    /// * `options` - Cache budgets and statistics reporting
    pub fn open<P: AsRef<Path>>(paths: &[P], options: &CacheOptions) -> Result<Self> {
        options.validate()?;
        let directory = Directory::scan(paths)?;
        let reporter = options
            .stats_path
            .as_deref()
            .map(|base| StatsReporter::new(base, options.stats_interval()));

        Ok(Self {
            pipeline: ChunkPipeline::new(directory, options),
            reporter,
        })
    }

    #[inline]
    pub fn directory(&self) -> &Directory {
        self.pipeline.directory()
    }

    #[inline]
    pub fn pipeline(&self) -> &ChunkPipeline {
        &self.pipeline
    }

    #[inline]
    pub fn chunk_count(&self) -> u64 {
        self.directory().total_chunks
    }

    /// Decoded bytes of a single chunk.
    pub fn read_chunk(&mut self, chunk: u64) -> Result<&[u8]> {
        self.pipeline.read_chunk(chunk)
    }

    fn read_range(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let (image_size, chunk_size) = {
            let dir = self.directory();
            (dir.image_size, dir.chunk_size)
        };
        if offset >= image_size {
            return Ok(0);
        }
        let len = (buffer.len() as u64).min(image_size - offset) as usize;

        let mut done = 0;
        while done < len {
            let position = offset + done as u64;
            let chunk = position / chunk_size;
            let intra = (position % chunk_size) as usize;

            let data = self.pipeline.read_chunk(chunk)?;
            if intra >= data.len() {
                return Err(CoreError::InvalidFormat(format!(
                    "chunk {chunk} ends before image offset {position}"
                )));
            }
            let n = (data.len() - intra).min(len - done);
            buffer[done..done + n].copy_from_slice(&data[intra..intra + n]);
            done += n;
        }
        Ok(len)
    }

    fn report(&mut self, force: bool) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.update(self.pipeline.stats(), force);
        }
    }
}

impl BlockSource for EwfImage {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        {
            let stats = self.pipeline.stats_mut();
            stats.read_operations += 1;
            stats.bytes_requested += buffer.len() as u64;
        }

        match self.read_range(offset, buffer) {
            Ok(n) => {
                self.report(false);
                Ok(n)
            }
            Err(e) => {
                self.pipeline.stats_mut().record_error(e.to_string());
                self.report(true);
                Err(e)
            }
        }
    }

    fn size(&self) -> u64 {
        self.directory().image_size
    }

    fn info(&self) -> String {
        render_info(self.directory())
    }

    fn stats(&self) -> Option<CacheStats> {
        Some(self.pipeline.stats().clone())
    }

    fn close(&mut self) -> Result<()> {
        self.pipeline.close();
        self.report(true);
        Ok(())
    }
}

fn render_info(dir: &Directory) -> String {
    let v = &dir.volume;
    let mut out = String::new();

    let _ = writeln!(out, "EWF image");
    let _ = writeln!(out, "  Image size:        {} bytes", dir.image_size);
    let _ = writeln!(out, "  Bytes per sector:  {}", v.bytes_per_sector);
    let _ = writeln!(out, "  Sector count:      {}", v.sector_count);
    let _ = writeln!(out, "  Sectors per chunk: {}", v.sectors_per_chunk);
    let _ = writeln!(out, "  Chunk size:        {} bytes", dir.chunk_size);
    let _ = writeln!(out, "  Chunk count:       {}", dir.total_chunks);
    let _ = writeln!(out, "  Error block size:  {}", v.error_block_size);
    let _ = writeln!(out, "  Compression level: {}", v.compression_level);
    let _ = writeln!(out, "  Media type:        {:#04x}", v.media_type);
    let _ = writeln!(out, "  Media flags:       {:#04x}", v.media_flags);
    let _ = writeln!(
        out,
        "  C/H/S:             {}/{}/{}",
        v.chs_cylinders, v.chs_heads, v.chs_sectors
    );
    let _ = writeln!(out, "  GUID:              {}", hex::encode(v.guid));
    if let Some(md5) = dir.stored_md5 {
        let _ = writeln!(out, "  Stored MD5:        {}", hex::encode(md5));
    }

    if !dir.metadata.is_empty() {
        let _ = writeln!(out, "Acquisition");
        for (key, value) in dir.metadata.iter() {
            let _ = writeln!(out, "  {:<18} {value}", format!("{}:", metadata::label(key)));
        }
    }

    let _ = writeln!(out, "Segment files ({})", dir.segments.len());
    for segment in &dir.segments {
        let _ = writeln!(out, "  {:>3}: {}", segment.number, segment.path.display());
    }
    let _ = writeln!(
        out,
        "Tables: {} ({} bytes)",
        dir.tables.len(),
        dir.total_table_size()
    );
    out
}
