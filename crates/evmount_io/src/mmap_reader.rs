use evmount_core::{BlockSource, CoreError, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

/// Memory-mapped raw image.
pub struct MmapReader {
    mmap: Mmap,
    size: u64,
}

impl MmapReader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;

        let size = file.seek(SeekFrom::End(0))?;

        if size == 0 {
            return Err(CoreError::InvalidFormat(
                "Cannot mmap empty file".to_string(),
            ));
        }

        // SAFETY: the mapping is read-only and evidence files are not modified while open.
        let mmap = unsafe { Mmap::map(&file) }?;

        if mmap.len() == 0 {
            return Err(CoreError::InvalidFormat(
                "mmap returned empty mapping (block device not supported)".to_string(),
            ));
        }

        #[cfg(target_os = "linux")]
        {
            use memmap2::Advice;
            let _ = mmap.advise(Advice::Random);
        }

        Ok(Self { mmap, size })
    }

    #[inline]
    pub fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        if start >= self.mmap.len() {
            return None;
        }
        let end = start.saturating_add(len).min(self.mmap.len());
        Some(&self.mmap[start..end])
    }
}

impl BlockSource for MmapReader {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        if let Some(slice) = self.slice(offset, buffer.len()) {
            let len = slice.len();
            buffer[..len].copy_from_slice(slice);
            Ok(len)
        } else {
            Ok(0)
        }
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn info(&self) -> String {
        format!("Raw image (memory mapped)\n  Image size: {} bytes\n", self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mmap_reader_basic() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let test_data = b"Hello, World! This is test data for MmapReader.";
        temp_file.write_all(test_data).unwrap();
        temp_file.flush().unwrap();

        let mut reader = MmapReader::new(temp_file.path()).unwrap();
        assert_eq!(reader.size(), test_data.len() as u64);

        let mut buffer = vec![0u8; 9];
        assert_eq!(reader.read_at(7, &mut buffer).unwrap(), 9);
        assert_eq!(&buffer, b"World! Th");
    }

    #[test]
    fn test_mmap_reader_beyond_eof() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"Short").unwrap();
        temp_file.flush().unwrap();

        let reader = MmapReader::new(temp_file.path()).unwrap();
        assert_eq!(reader.slice(0, 100).unwrap().len(), 5);
        assert!(reader.slice(100, 10).is_none());
    }

    #[test]
    fn test_mmap_reader_empty_file() {
        let temp_file = NamedTempFile::new().unwrap();
        assert!(MmapReader::new(temp_file.path()).is_err());
    }
}
