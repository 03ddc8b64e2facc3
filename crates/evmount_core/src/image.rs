//! Byte-range access to an image with an optional copy-on-write overlay.
//!
//! Reads consult the write cache first and fall back to the source. Writes
//! only ever reach the write cache. The source and the cache each sit behind
//! their own mutex; when both are needed the cache lock is taken first.

use crate::config::{CacheOptions, WriteCacheOptions};
use crate::cow::{CowStore, ImageIdentity};
use crate::error::{CoreError, Result};
use crate::ewf::EwfImage;
use crate::stats::CacheStats;
use crate::traits::BlockSource;
use parking_lot::Mutex;
use std::path::Path;
use tracing::info;

pub struct ImageAccess {
    source: Mutex<Box<dyn BlockSource>>,
    size: u64,
    cache: Option<Mutex<CowStore>>,
}

impl ImageAccess {
    /// Opens the segment files of an EWF container.
    pub fn open<P: AsRef<Path>>(paths: &[P], options: &CacheOptions) -> Result<Self> {
        let image = EwfImage::open(paths, options)?;
        Ok(Self::from_source(Box::new(image)))
    }

    pub fn from_source(source: Box<dyn BlockSource>) -> Self {
        let size = source.size();
        Self {
            source: Mutex::new(source),
            size,
            cache: None,
        }
    }

    /// Attaches a write cache, creating or resuming it.
    ///
    /// The leading bytes of the image are hashed so a cache is never
    /// replayed onto a different image.
    pub fn attach_cache(&mut self, options: &WriteCacheOptions) -> Result<()> {
        options.validate()?;
        let identity = {
            let mut source = self.source.lock();
            ImageIdentity::compute(&mut **source, options.hash_size)?
        };
        let store = CowStore::open_with(options, self.size, identity)?;
        info!(
            path = %options.path.display(),
            assigned = store.assigned_count(),
            identity = %identity.to_hex(),
            "write cache attached"
        );
        self.cache = Some(Mutex::new(store));
        Ok(())
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.cache.is_some()
    }

    pub fn info(&self) -> String {
        self.source.lock().info()
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.source.lock().stats()
    }

    /// Number of blocks the write cache holds, if one is attached.
    pub fn cached_blocks(&self) -> Option<usize> {
        self.cache.as_ref().map(|c| c.lock().assigned_count())
    }

    /// Reads up to `buffer.len()` bytes at `offset`.
    ///
    /// Ranges running past the end are truncated; an offset at or past the
    /// end reads nothing.
    pub fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = (buffer.len() as u64).min(self.size - offset) as usize;
        let buffer = &mut buffer[..len];

        let Some(cache) = &self.cache else {
            return self.read_source(offset, buffer);
        };

        let block_size = cache.lock().block_size();
        let mut done = 0;
        while done < len {
            let position = offset + done as u64;
            let block = position / block_size;
            let intra = position % block_size;
            let n = ((block_size - intra) as usize).min(len - done);
            let piece = &mut buffer[done..done + n];

            let hit = cache.lock().read(block, intra, piece)?;
            if hit.is_none() {
                self.read_source(position, piece)?;
            }
            done += n;
        }
        Ok(len)
    }

    /// Writes `data` at `offset` into the write cache.
    ///
    /// Partial writes to blocks not yet in the cache are completed with the
    /// source's bytes first, zero-filled past the image end.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let cache = self.cache.as_ref().ok_or(CoreError::ReadOnly)?;
        if offset >= self.size {
            return Ok(0);
        }
        let len = (data.len() as u64).min(self.size - offset) as usize;

        let mut store = cache.lock();
        let block_size = store.block_size();
        let mut merged = Vec::new();
        let mut done = 0;

        while done < len {
            let position = offset + done as u64;
            let block = position / block_size;
            let intra = position % block_size;
            let n = ((block_size - intra) as usize).min(len - done);
            let piece = &data[done..done + n];

            if store.is_assigned(block) || (intra == 0 && n as u64 == block_size) {
                store.write(block, intra, piece)?;
            } else {
                merged.clear();
                merged.resize(block_size as usize, 0);
                let start = block * block_size;
                let available = (self.size - start).min(block_size) as usize;
                self.read_source(start, &mut merged[..available])?;
                merged[intra as usize..intra as usize + n].copy_from_slice(piece);
                store.write(block, 0, &merged)?;
            }
            done += n;
        }
        Ok(len)
    }

    fn read_source(&self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let mut source = self.source.lock();
        let mut done = 0;
        while done < buffer.len() {
            let n = source.read_at(offset + done as u64, &mut buffer[done..])?;
            if n == 0 {
                return Err(CoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("source ended at {} of {}", offset + done as u64, self.size),
                )));
            }
            done += n;
        }
        Ok(done)
    }

    /// Flushes the write cache and releases the source.
    pub fn close(self) -> Result<()> {
        let cache_result = match self.cache {
            Some(cache) => cache.into_inner().close(),
            None => Ok(()),
        };
        let source_result = self.source.into_inner().close();
        cache_result.and(source_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Memory(Vec<u8>);

    impl BlockSource for Memory {
        fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
            if offset >= self.0.len() as u64 {
                return Ok(0);
            }
            let start = offset as usize;
            let n = buffer.len().min(self.0.len() - start);
            buffer[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn writable(dir: &TempDir, data: Vec<u8>, block_size: u64) -> ImageAccess {
        let mut access = ImageAccess::from_source(Box::new(Memory(data)));
        let options = WriteCacheOptions::new(dir.path().join("cache")).with_block_size(block_size);
        access.attach_cache(&options).unwrap();
        access
    }

    #[test]
    fn test_read_truncates_at_end() {
        let access = ImageAccess::from_source(Box::new(Memory(pattern(1000))));
        let mut buf = vec![0u8; 64];
        assert_eq!(access.read(980, &mut buf).unwrap(), 20);
        assert_eq!(&buf[..20], &pattern(1000)[980..]);
        assert_eq!(access.read(1000, &mut buf).unwrap(), 0);
        assert_eq!(access.read(5000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_without_cache_is_refused() {
        let access = ImageAccess::from_source(Box::new(Memory(pattern(100))));
        assert!(!access.is_writable());
        assert!(matches!(access.write(0, b"x"), Err(CoreError::ReadOnly)));
    }

    #[test]
    fn test_partial_write_merges_source_bytes() {
        let dir = TempDir::new().unwrap();
        let original = pattern(10_000);
        let access = writable(&dir, original.clone(), 4096);

        assert_eq!(access.write(5000, b"overlay").unwrap(), 7);
        assert_eq!(access.cached_blocks(), Some(1));

        let mut expected = original.clone();
        expected[5000..5007].copy_from_slice(b"overlay");
        let mut buf = vec![0u8; 10_000];
        assert_eq!(access.read(0, &mut buf).unwrap(), 10_000);
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_write_into_short_last_block() {
        let dir = TempDir::new().unwrap();
        let access = writable(&dir, pattern(5000), 4096);

        assert_eq!(access.write(4990, &[0xFF; 64]).unwrap(), 10);
        let mut buf = vec![0u8; 20];
        assert_eq!(access.read(4985, &mut buf).unwrap(), 15);
        assert_eq!(&buf[..5], &pattern(5000)[4985..4990]);
        assert_eq!(&buf[5..15], &[0xFF; 10]);
        assert_eq!(access.write(5000, b"past end").unwrap(), 0);
    }

    #[test]
    fn test_write_spanning_blocks() {
        let dir = TempDir::new().unwrap();
        let access = writable(&dir, pattern(3 * 4096), 4096);

        let data = vec![0xAA; 4096 + 200];
        assert_eq!(access.write(4000, &data).unwrap(), data.len());
        assert_eq!(access.cached_blocks(), Some(3));

        let mut buf = vec![0u8; 4096 + 400];
        access.read(3900, &mut buf).unwrap();
        assert_eq!(&buf[..100], &pattern(3 * 4096)[3900..4000]);
        assert!(buf[100..100 + data.len()].iter().all(|&b| b == 0xAA));
        assert_eq!(&buf[100 + data.len()..], &pattern(3 * 4096)[8296..8396]);
    }

    #[test]
    fn test_close_flushes_and_reopen_sees_writes() {
        let dir = TempDir::new().unwrap();
        let access = writable(&dir, pattern(8192), 4096);
        access.write(100, b"persisted").unwrap();
        access.close().unwrap();

        let access = writable(&dir, pattern(8192), 4096);
        let mut buf = [0u8; 9];
        access.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
