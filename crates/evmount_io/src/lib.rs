mod mmap_reader;
mod reader;

pub use mmap_reader::MmapReader;
pub use reader::DiskReader;

use evmount_core::ewf::format::{EVF_SIGNATURE, FILE_HEADER_SIZE, FileHeader};
use evmount_core::{BlockSource, CacheOptions, CoreError, EwfImage, Result};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Container kind recognised from the leading bytes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Ewf,
    Raw,
}

/// Sniffs the first bytes of `path` for the EVF signature.
pub fn detect_format(path: impl AsRef<Path>) -> Result<ImageFormat> {
    let mut file = File::open(path.as_ref())?;
    let mut magic = [0u8; 8];
    match file.read_exact(&mut magic) {
        Ok(()) if magic == EVF_SIGNATURE => Ok(ImageFormat::Ewf),
        Ok(()) => Ok(ImageFormat::Raw),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(ImageFormat::Raw),
        Err(e) => Err(e.into()),
    }
}

/// Finds every segment belonging to the same set as `first`.
///
/// Siblings are files sharing the stem of `first` whose extension looks like
/// a segment extension (`E01`, `E99`, `EAA`, ...). The result is sorted by
/// the segment number stored in each file header, so the order does not
/// depend on how the extensions sort as text.
pub fn discover_segments(first: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let first = first.as_ref();
    let stem = first
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CoreError::InvalidOption(format!("bad segment path {}", first.display())))?;
    let dir = match first.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let dir_text = dir
        .to_str()
        .ok_or_else(|| CoreError::InvalidOption(format!("bad segment path {}", first.display())))?;

    let pattern = format!(
        "{}/{}.[E-Ze-z][0-9A-Za-z][0-9A-Za-z]",
        glob::Pattern::escape(dir_text),
        glob::Pattern::escape(stem)
    );
    let entries = glob::glob(&pattern).map_err(|e| CoreError::InvalidOption(e.to_string()))?;

    let mut found = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| CoreError::Io(e.into_error()))?;
        match segment_number(&path) {
            Ok(number) => found.push((number, path)),
            Err(e) => tracing::debug!(path = %path.display(), "skipping non-segment sibling: {e}"),
        }
    }

    if found.is_empty() {
        return Ok(vec![first.to_path_buf()]);
    }
    found.sort_by_key(|(number, _)| *number);
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

fn segment_number(path: &Path) -> Result<u16> {
    let mut header = [0u8; FILE_HEADER_SIZE];
    File::open(path)?.read_exact(&mut header)?;
    Ok(FileHeader::parse(&header)?.segment_number)
}

/// Opens the right reader for `paths`.
///
/// EWF containers go through the chunk pipeline with `options`. Anything
/// else is treated as a single raw image, memory mapped when possible.
pub fn create_reader<P: AsRef<Path>>(
    paths: &[P],
    options: &CacheOptions,
) -> Result<Box<dyn BlockSource>> {
    let first = paths
        .first()
        .ok_or_else(|| CoreError::InvalidOption("no image files given".to_string()))?;

    match detect_format(first)? {
        ImageFormat::Ewf => {
            let image = if paths.len() == 1 {
                let segments = discover_segments(first)?;
                tracing::debug!(count = segments.len(), "discovered segments");
                EwfImage::open(&segments, options)?
            } else {
                EwfImage::open(paths, options)?
            };
            Ok(Box::new(image))
        }
        ImageFormat::Raw => {
            if paths.len() > 1 {
                return Err(CoreError::InvalidFormat(
                    "raw images consist of exactly one file".to_string(),
                ));
            }
            Ok(Box::new(Reader::new(first)?))
        }
    }
}

pub enum Reader {
    Mmap(MmapReader),
    Disk(DiskReader),
}

impl Reader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        match MmapReader::new(path_ref) {
            Ok(r) => Ok(Reader::Mmap(r)),
            Err(e) => {
                tracing::debug!("mmap unavailable, using positional reads: {e}");
                Ok(Reader::Disk(DiskReader::new(path_ref)?))
            }
        }
    }

    #[inline]
    pub fn is_mmap(&self) -> bool {
        matches!(self, Reader::Mmap(_))
    }
}

impl BlockSource for Reader {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        match self {
            Reader::Mmap(r) => r.read_at(offset, buffer),
            Reader::Disk(r) => r.read_at(offset, buffer),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Reader::Mmap(r) => r.size(),
            Reader::Disk(r) => r.size(),
        }
    }

    fn info(&self) -> String {
        match self {
            Reader::Mmap(r) => r.info(),
            Reader::Disk(r) => r.info(),
        }
    }
}
