//! One-pass scan of every segment's section chain.
//!
//! The scan produces an immutable [`Directory`]: which segment holds which
//! table, which chunk range each table covers, and the image geometry. Offset
//! arrays are not loaded here; the table cache does that on demand.

use super::format::{
    FileHeader, SECTION_DESCRIPTOR_SIZE, SectionDescriptor, SectionKind, TABLE_HEADER_SIZE,
    TableHeader, VOLUME_SECTION_SIZE, VolumeSection, FILE_HEADER_SIZE,
};
use super::metadata::AcquisitionMetadata;
use crate::error::{CoreError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Hard stop for corrupt chains that loop or never terminate.
pub const MAX_SECTIONS_PER_SEGMENT: usize = 65_536;

/// Header sections larger than this are skipped rather than inflated.
const MAX_HEADER_SECTION: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Absolute offset of the descriptor in its segment file.
    pub offset: u64,
    pub descriptor: SectionDescriptor,
}

impl Section {
    #[inline]
    pub fn body_offset(&self) -> u64 {
        self.offset + SECTION_DESCRIPTOR_SIZE as u64
    }
}

/// Walks a section chain lazily.
///
/// The walk stops after a section that points to itself or a `done`
/// section, and fails once more than the configured number of sections has
/// been produced. [`SectionIter::restart`] rewinds to the first section.
pub struct SectionIter<R> {
    reader: R,
    start: u64,
    cursor: Option<u64>,
    yielded: usize,
    limit: usize,
}

impl<R: Read + Seek> SectionIter<R> {
    pub fn new(reader: R, start: u64) -> Self {
        Self {
            reader,
            start,
            cursor: Some(start),
            yielded: 0,
            limit: MAX_SECTIONS_PER_SEGMENT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn restart(&mut self) {
        self.cursor = Some(self.start);
        self.yielded = 0;
    }

    /// Gives access to the underlying reader between steps.
    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn step(&mut self, offset: u64) -> Result<Section> {
        if self.yielded >= self.limit {
            return Err(CoreError::InvalidFormat(format!(
                "section chain exceeds {} sections",
                self.limit
            )));
        }

        let mut raw = [0u8; SECTION_DESCRIPTOR_SIZE];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut raw).map_err(|e| {
            CoreError::InvalidFormat(format!("cannot read section descriptor at {offset}: {e}"))
        })?;

        let descriptor = SectionDescriptor::parse(&raw)?;
        if !descriptor.checksum_ok {
            warn!(
                offset,
                section = %descriptor.name(),
                "section descriptor checksum mismatch"
            );
        }
        self.yielded += 1;
        Ok(Section { offset, descriptor })
    }
}

impl<R: Read + Seek> Iterator for SectionIter<R> {
    type Item = Result<Section>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.cursor?;
        match self.step(offset) {
            Ok(section) => {
                let last = section.descriptor.next == offset
                    || section.descriptor.kind() == SectionKind::Done;
                self.cursor = if last {
                    None
                } else {
                    Some(section.descriptor.next)
                };
                Some(Ok(section))
            }
            Err(e) => {
                self.cursor = None;
                Some(Err(e))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub number: u16,
    pub path: PathBuf,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub index: usize,
    /// Index into [`Directory::segments`].
    pub segment: usize,
    /// Offset of the table body in the segment file.
    pub offset: u64,
    /// Body size of the `table` section, i.e. the descriptor size less the
    /// 76-byte descriptor. This is what the table cache charges against its budget.
    pub size: u64,
    pub entry_count: u32,
    pub chunk_from: u64,
    pub chunk_to: u64,
    /// Body size of the `sectors` section this table indexes.
    pub sectors_size: u64,
}

impl Table {
    #[inline]
    pub fn covers(&self, chunk: u64) -> bool {
        (self.chunk_from..=self.chunk_to).contains(&chunk)
    }
}

#[derive(Debug, Clone)]
pub struct Directory {
    pub segments: Vec<Segment>,
    pub tables: Vec<Table>,
    pub volume: VolumeSection,
    pub metadata: AcquisitionMetadata,
    pub stored_md5: Option<[u8; 16]>,
    pub chunk_size: u64,
    pub image_size: u64,
    pub total_chunks: u64,
}

impl Directory {
    /// Scans the given segment files, in any order.
    pub fn scan<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        if paths.is_empty() {
            return Err(CoreError::InvalidFormat(
                "no segment files given".to_string(),
            ));
        }

        let segments = order_segments(paths)?;
        let mut scan = ScanState::default();
        for (index, segment) in segments.iter().enumerate() {
            scan.walk_segment(index, segment)?;
        }
        let directory = scan.finish(segments)?;

        info!(
            segments = directory.segments.len(),
            tables = directory.tables.len(),
            chunks = directory.total_chunks,
            chunk_size = directory.chunk_size,
            image_size = directory.image_size,
            "scanned EWF container"
        );
        Ok(directory)
    }

    /// Index of the table covering `chunk`.
    pub fn find_table(&self, chunk: u64) -> Option<usize> {
        self.tables.iter().position(|t| t.covers(chunk))
    }

    /// Decoded length of `chunk`; only the final chunk may be short.
    pub fn chunk_len(&self, chunk: u64) -> usize {
        if chunk + 1 == self.total_chunks {
            let tail = self.image_size % self.chunk_size;
            if tail != 0 {
                return tail as usize;
            }
        }
        self.chunk_size as usize
    }

    pub fn total_table_size(&self) -> u64 {
        self.tables.iter().map(|t| t.size).sum()
    }
}

fn order_segments<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Segment>> {
    let mut segments = Vec::with_capacity(paths.len());

    for path in paths {
        let given = path.as_ref();
        let open_err = |source| CoreError::SegmentOpen {
            path: given.to_path_buf(),
            source,
        };
        let canonical = std::fs::canonicalize(given).map_err(open_err)?;
        let mut file = File::open(&canonical).map_err(open_err)?;
        let file_size = file.metadata().map_err(open_err)?.len();

        let mut raw = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut raw).map_err(|e| {
            CoreError::InvalidFormat(format!("{}: no file header ({e})", canonical.display()))
        })?;
        let header = FileHeader::parse(&raw).map_err(|_| {
            CoreError::InvalidFormat(format!("{} is not an EWF segment", canonical.display()))
        })?;

        segments.push(Segment {
            number: header.segment_number,
            path: canonical,
            file_size,
        });
    }

    segments.sort_by_key(|s| s.number);
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 && segments[i - 1].number == segment.number {
            return Err(CoreError::DuplicateSegment {
                number: segment.number,
            });
        }
        let expected = (i + 1) as u16;
        if segment.number != expected {
            return Err(CoreError::MissingSegment {
                expected,
                found: segment.number,
            });
        }
    }
    Ok(segments)
}

#[derive(Default)]
struct ScanState {
    volume: Option<VolumeSection>,
    header: Option<AcquisitionMetadata>,
    header2: Option<AcquisitionMetadata>,
    stored_md5: Option<[u8; 16]>,
    sectors_size: Option<u64>,
    next_chunk: u64,
    tables: Vec<Table>,
}

impl ScanState {
    fn walk_segment(&mut self, index: usize, segment: &Segment) -> Result<()> {
        let file = File::open(&segment.path).map_err(|source| CoreError::SegmentOpen {
            path: segment.path.clone(),
            source,
        })?;
        let mut sections = SectionIter::new(file, FILE_HEADER_SIZE as u64);

        while let Some(section) = sections.next() {
            let section = section?;
            let kind = section.descriptor.kind();
            let body_size = section.descriptor.body_size();

            match kind {
                SectionKind::Volume | SectionKind::Disk if self.volume.is_none() => {
                    let len = body_size.min(VOLUME_SECTION_SIZE as u64);
                    let body = read_body(sections.reader_mut(), section.body_offset(), len)?;
                    let volume = VolumeSection::parse(&body)?;
                    debug!(
                        chunks = volume.chunk_count,
                        sectors_per_chunk = volume.sectors_per_chunk,
                        bytes_per_sector = volume.bytes_per_sector,
                        sectors = volume.sector_count,
                        "volume section"
                    );
                    self.volume = Some(volume);
                }
                SectionKind::Header | SectionKind::Header2 => {
                    let utf16 = kind == SectionKind::Header2;
                    let slot = if utf16 {
                        &mut self.header2
                    } else {
                        &mut self.header
                    };
                    if slot.is_some() {
                        continue;
                    }
                    if body_size > MAX_HEADER_SECTION {
                        warn!(size = body_size, "skipping oversized header section");
                        continue;
                    }
                    let body = read_body(sections.reader_mut(), section.body_offset(), body_size)?;
                    match AcquisitionMetadata::from_section(&body, utf16) {
                        Ok(Some(meta)) => *slot = Some(meta),
                        Ok(None) => warn!(section = %section.descriptor.name(), "header section has no main category"),
                        Err(e) => warn!(section = %section.descriptor.name(), error = %e, "unreadable header section"),
                    }
                }
                SectionKind::Sectors => {
                    self.sectors_size = Some(body_size);
                }
                SectionKind::Table => {
                    self.register_table(index, segment, &section, sections.reader_mut())?;
                }
                SectionKind::Hash if self.stored_md5.is_none() && body_size >= 16 => {
                    let body = read_body(sections.reader_mut(), section.body_offset(), 16)?;
                    let mut md5 = [0u8; 16];
                    md5.copy_from_slice(&body);
                    self.stored_md5 = Some(md5);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn register_table(
        &mut self,
        segment_index: usize,
        segment: &Segment,
        section: &Section,
        reader: &mut File,
    ) -> Result<()> {
        let order_err = |missing| CoreError::SectionOrder {
            path: segment.path.clone(),
            section: "table".to_string(),
            missing,
        };
        if self.volume.is_none() {
            return Err(order_err("a volume section"));
        }
        let sectors_size = self
            .sectors_size
            .take()
            .ok_or_else(|| order_err("a sectors section"))?;

        let size = section.descriptor.body_size();
        let raw = read_body(reader, section.body_offset(), TABLE_HEADER_SIZE as u64)?;
        let header = TableHeader::parse(&raw)?;
        if !header.checksum_ok {
            return Err(CoreError::TableChecksum {
                location: format!("offset {} in {}", section.offset, segment.path.display()),
            });
        }

        let needed = TABLE_HEADER_SIZE as u64 + header.entry_count as u64 * 4;
        if size < needed {
            return Err(CoreError::InvalidFormat(format!(
                "table at {} in {} holds {} bytes but needs {needed} for {} entries",
                section.offset,
                segment.path.display(),
                size,
                header.entry_count
            )));
        }
        if header.entry_count == 0 {
            warn!(path = %segment.path.display(), offset = section.offset, "empty table section");
            return Ok(());
        }

        let chunk_from = self.next_chunk;
        self.next_chunk += header.entry_count as u64;
        self.tables.push(Table {
            index: self.tables.len(),
            segment: segment_index,
            offset: section.body_offset(),
            size,
            entry_count: header.entry_count,
            chunk_from,
            chunk_to: self.next_chunk - 1,
            sectors_size,
        });
        Ok(())
    }

    fn finish(self, segments: Vec<Segment>) -> Result<Directory> {
        let volume = self.volume.ok_or(CoreError::VolumeMissing)?;

        if self.next_chunk != volume.chunk_count as u64 {
            return Err(CoreError::ChunkCountMismatch {
                declared: volume.chunk_count as u64,
                found: self.next_chunk,
            });
        }
        let chunk_size = volume.chunk_size();
        if chunk_size == 0 {
            return Err(CoreError::InvalidFormat(
                "volume declares a zero chunk size".to_string(),
            ));
        }

        Ok(Directory {
            segments,
            tables: self.tables,
            image_size: volume.image_size(),
            total_chunks: self.next_chunk,
            chunk_size,
            metadata: self.header2.or(self.header).unwrap_or_default(),
            stored_md5: self.stored_md5,
            volume,
        })
    }
}

/// Reads `len` bytes at `offset`, failing softly on allocation.
pub(crate) fn read_body<R: Read + Seek>(reader: &mut R, offset: u64, len: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| CoreError::Allocation {
        bytes: usize::MAX,
        purpose: "section body",
    })?;
    let mut body = Vec::new();
    body.try_reserve_exact(len)
        .map_err(|_| CoreError::Allocation {
            bytes: len,
            purpose: "section body",
        })?;
    body.resize(len, 0);

    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut body).map_err(|e| {
        CoreError::InvalidFormat(format!("section body at {offset} is truncated: {e}"))
    })?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chain(sections: &[(&str, u64)]) -> Vec<u8> {
        let mut out = FileHeader { segment_number: 1 }.encode().to_vec();
        let count = sections.len();
        for (i, (name, body)) in sections.iter().enumerate() {
            let here = out.len() as u64;
            let size = SECTION_DESCRIPTOR_SIZE as u64 + body;
            let next = if i + 1 == count { here } else { here + size };
            out.extend_from_slice(&SectionDescriptor::encode(name, next, size));
            out.resize(out.len() + *body as usize, 0);
        }
        out
    }

    #[test]
    fn test_section_iter_walks_chain() {
        let bytes = chain(&[("header", 10), ("volume", 0), ("done", 0)]);
        let names: Vec<String> = SectionIter::new(Cursor::new(bytes), 13)
            .map(|s| s.unwrap().descriptor.name())
            .collect();
        assert_eq!(names, ["header", "volume", "done"]);
    }

    #[test]
    fn test_section_iter_restart() {
        let bytes = chain(&[("sectors", 4), ("next", 0)]);
        let mut iter = SectionIter::new(Cursor::new(bytes), 13);
        assert_eq!(iter.by_ref().count(), 2);
        assert!(iter.next().is_none());
        iter.restart();
        assert_eq!(iter.count(), 2);
    }

    #[test]
    fn test_section_iter_bounded_on_cycle() {
        let mut bytes = FileHeader { segment_number: 1 }.encode().to_vec();
        let a = bytes.len() as u64;
        let b = a + SECTION_DESCRIPTOR_SIZE as u64;
        bytes.extend_from_slice(&SectionDescriptor::encode("table2", b, 76));
        bytes.extend_from_slice(&SectionDescriptor::encode("table2", a, 76));

        let results: Vec<_> = SectionIter::new(Cursor::new(bytes), a).with_limit(10).collect();
        assert_eq!(results.len(), 11);
        assert!(results[..10].iter().all(|r| r.is_ok()));
        assert!(matches!(results[10], Err(CoreError::InvalidFormat(_))));
    }

    #[test]
    fn test_section_iter_truncated_descriptor() {
        let mut bytes = chain(&[("volume", 0), ("done", 0)]);
        bytes.truncate(13 + 76 + 20);
        let results: Vec<_> = SectionIter::new(Cursor::new(bytes), 13).collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }

    #[test]
    fn test_read_body_truncated() {
        let mut cursor = Cursor::new(vec![0u8; 10]);
        assert!(read_body(&mut cursor, 4, 4).is_ok());
        assert!(read_body(&mut cursor, 4, 40).is_err());
    }
}
