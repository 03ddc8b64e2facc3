//! Append-only copy-on-write block store.
//!
//! Layout: a 512-byte [`StoreHeader`], then one little-endian `u64` per
//! image block (`UNASSIGNED` or the file offset of the block), then whole
//! blocks in allocation order. A block is allocated by its first full-block
//! write and never moves afterwards.

pub mod header;

pub use header::{ImageIdentity, StoreHeader, UNASSIGNED};

use crate::config::WriteCacheOptions;
use crate::error::{CoreError, Result};
use header::STORE_HEADER_SIZE;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug)]
pub struct CowStore {
    file: File,
    path: PathBuf,
    header: StoreHeader,
    map: Vec<u64>,
    /// End of the last fully written block; new blocks go here.
    append_at: u64,
}

impl CowStore {
    /// Opens or creates a store for an image of `image_size` bytes.
    pub fn open(
        path: impl AsRef<Path>,
        image_size: u64,
        block_size: u64,
        identity: ImageIdentity,
    ) -> Result<Self> {
        let options = WriteCacheOptions::new(path.as_ref())
            .with_block_size(block_size)
            .with_hash_size(identity.hash_size);
        Self::open_with(&options, image_size, identity)
    }

    /// Opens a store described by `options`.
    ///
    /// An empty file is initialised with an all-unassigned map. A non-empty
    /// file must match the image size, block size and identity, otherwise
    /// [`CoreError::StoreMismatch`] is returned and nothing is modified.
    pub fn open_with(
        options: &WriteCacheOptions,
        image_size: u64,
        identity: ImageIdentity,
    ) -> Result<Self> {
        options.validate()?;
        let path = options.path.clone();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(options.overwrite)
            .open(&path)?;
        let len = file.metadata()?.len();

        let store = if len == 0 {
            let header = StoreHeader::new(options.block_size, image_size, identity);
            let data_offset = header.data_offset()?;
            let map = init_store(&mut file, &header)?;
            info!(
                path = %path.display(),
                blocks = header.block_count,
                block_size = header.block_size,
                "created write cache"
            );
            Self {
                append_at: data_offset,
                file,
                path,
                header,
                map,
            }
        } else {
            let header = read_header(&mut file, len)?;
            header.check_compatible(options.block_size, image_size, &identity)?;
            let map = load_map(&mut file, &header, len)?;
            let data_offset = header.data_offset()?;
            let assigned = map.iter().filter(|&&e| e != UNASSIGNED).count();
            let append_at = map
                .iter()
                .filter(|&&e| e != UNASSIGNED)
                .map(|&e| e + header.block_size)
                .max()
                .unwrap_or(data_offset)
                .max(data_offset);
            info!(
                path = %path.display(),
                blocks = header.block_count,
                assigned,
                "resumed write cache"
            );
            Self {
                file,
                path,
                header,
                map,
                append_at,
            }
        };
        Ok(store)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    #[inline]
    pub fn block_size(&self) -> u64 {
        self.header.block_size
    }

    #[inline]
    pub fn block_count(&self) -> u64 {
        self.header.block_count
    }

    pub fn is_assigned(&self, block: u64) -> bool {
        self.map
            .get(block as usize)
            .is_some_and(|&entry| entry != UNASSIGNED)
    }

    pub fn assigned_count(&self) -> usize {
        self.map.iter().filter(|&&e| e != UNASSIGNED).count()
    }

    fn entry(&self, block: u64, offset: u64) -> Result<u64> {
        if block >= self.header.block_count {
            return Err(CoreError::OutOfBounds {
                offset: block,
                max: self.header.block_count,
            });
        }
        if offset >= self.header.block_size {
            return Err(CoreError::OutOfBounds {
                offset,
                max: self.header.block_size,
            });
        }
        Ok(self.map[block as usize])
    }

    /// Reads from a block, clamped to the block end.
    ///
    /// Returns `Ok(None)` when the block was never written.
    pub fn read(&mut self, block: u64, offset: u64, buffer: &mut [u8]) -> Result<Option<usize>> {
        let entry = self.entry(block, offset)?;
        if entry == UNASSIGNED {
            return Ok(None);
        }

        let n = buffer.len().min((self.header.block_size - offset) as usize);
        self.file.seek(SeekFrom::Start(entry + offset))?;
        self.file.read_exact(&mut buffer[..n])?;
        Ok(Some(n))
    }

    /// Writes into a block, clamped to the block end.
    ///
    /// An unassigned block only accepts a write of the whole block; anything
    /// shorter fails with [`CoreError::PartialWrite`] and leaves it unassigned.
    pub fn write(&mut self, block: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let entry = self.entry(block, offset)?;
        let block_size = self.header.block_size;
        let n = data.len().min((block_size - offset) as usize);

        if entry != UNASSIGNED {
            self.file.seek(SeekFrom::Start(entry + offset))?;
            self.file.write_all(&data[..n])?;
            return Ok(n);
        }

        if offset != 0 || (data.len() as u64) < block_size {
            return Err(CoreError::PartialWrite { block });
        }

        let at = self.append_at;
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_all(&data[..n])?;
        self.file.sync_data()?;

        let slot = self.header.block_map_offset + block * 8;
        self.file.seek(SeekFrom::Start(slot))?;
        self.file.write_all(&at.to_le_bytes())?;
        self.file.flush()?;

        self.map[block as usize] = at;
        self.append_at = at + block_size;
        debug!(block, offset = at, "allocated cache block");
        Ok(n)
    }

    /// Pushes all writes to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        debug!(path = %self.path.display(), "closed write cache");
        Ok(())
    }
}

fn init_store(file: &mut File, header: &StoreHeader) -> Result<Vec<u64>> {
    let count = usize::try_from(header.block_count).map_err(|_| CoreError::Allocation {
        bytes: usize::MAX,
        purpose: "block map",
    })?;
    let mut map = Vec::new();
    map.try_reserve_exact(count)
        .map_err(|_| CoreError::Allocation {
            bytes: count.saturating_mul(8),
            purpose: "block map",
        })?;
    map.resize(count, UNASSIGNED);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.seek(SeekFrom::Start(header.block_map_offset))?;
    let unassigned = UNASSIGNED.to_le_bytes().repeat(4096);
    let mut remaining = count * 8;
    while remaining > 0 {
        let n = remaining.min(unassigned.len());
        file.write_all(&unassigned[..n])?;
        remaining -= n;
    }
    file.sync_all()?;
    Ok(map)
}

fn read_header(file: &mut File, len: u64) -> Result<StoreHeader> {
    let mut raw = [0u8; STORE_HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut raw)
        .map_err(|_| CoreError::StoreMismatch(format!("file of {len} bytes has no header")))?;
    StoreHeader::decode(&raw)
}

/// Reads the persisted block map of a header already checked against the image.
fn load_map(file: &mut File, header: &StoreHeader, len: u64) -> Result<Vec<u64>> {
    let data_offset = header.data_offset()?;
    if len < data_offset {
        return Err(CoreError::StoreMismatch(format!(
            "block map ends at {data_offset} but the file has {len} bytes"
        )));
    }

    let count = usize::try_from(header.block_count).map_err(|_| {
        CoreError::StoreMismatch(format!("{} map entries", header.block_count))
    })?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(count.saturating_mul(8))
        .map_err(|_| CoreError::Allocation {
            bytes: count.saturating_mul(8),
            purpose: "block map",
        })?;
    bytes.resize(count * 8, 0);
    file.seek(SeekFrom::Start(header.block_map_offset))?;
    file.read_exact(&mut bytes)?;

    let mut map = Vec::with_capacity(count);
    for (block, raw) in bytes.chunks_exact(8).enumerate() {
        let mut entry = [0u8; 8];
        entry.copy_from_slice(raw);
        let entry = u64::from_le_bytes(entry);
        if entry != UNASSIGNED
            && (entry < data_offset || entry.saturating_add(header.block_size) > len)
        {
            return Err(CoreError::StoreMismatch(format!(
                "block {block} points to {entry}, outside the data area"
            )));
        }
        map.push(entry);
    }
    Ok(map)
}
