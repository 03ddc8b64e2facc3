//! Core trait describing a readable image.
//!
//! Concrete sources (raw files, memory maps, EWF containers) live behind this
//! trait so the access façade can treat them uniformly.

use crate::error::Result;
use crate::stats::CacheStats;

/// A random-access source of image bytes.
///
/// Implementations are driven through `&mut self`; callers sharing a source
/// between threads wrap it in a mutex, which is what
/// [`ImageAccess`](crate::ImageAccess) does.
///
/// # Example
///
/// ```ignore
/// struct Zeroes(u64);
///
/// impl BlockSource for Zeroes {
///     fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
///         let n = buffer.len().min(self.0.saturating_sub(offset) as usize);
///         buffer[..n].fill(0);
///         Ok(n)
///     }
///
///     fn size(&self) -> u64 {
///         self.0
///     }
/// }
/// ```
pub trait BlockSource: Send {
    /// Reads bytes starting at `offset`.
    ///
    /// # Arguments
    ///
    /// * `offset` - The byte offset to start reading from
    /// * `buffer` - The buffer to read data into
    ///
    /// # Returns
    ///
    /// The number of bytes read. This equals `buffer.len()` unless the end of
    /// the image is reached; an offset at or past the end yields `Ok(0)`.
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Returns the total size of the image in bytes.
    fn size(&self) -> u64;

    /// Human-readable description of the source.
    fn info(&self) -> String {
        format!("Image size: {} bytes\n", self.size())
    }

    /// Cache counters, for sources that keep any.
    fn stats(&self) -> Option<CacheStats> {
        None
    }

    /// Releases resources held by the source.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
