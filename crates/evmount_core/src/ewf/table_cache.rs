//! RAM-bounded cache of decoded chunk offset tables.

use super::directory::{Directory, Table, read_body};
use super::format::{TABLE_HEADER_SIZE, TableHeader, decode_entry, le_u32};
use super::segment_cache::SegmentCache;
use crate::error::{CoreError, Result};
use crate::stats::CacheStats;
use tracing::debug;

/// The decoded body of a `table` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTable {
    pub base_offset: u64,
    pub entries: Vec<u32>,
}

impl OffsetTable {
    pub fn parse(body: &[u8], expected_entries: u32) -> Result<Self> {
        let header = TableHeader::parse(body)?;
        if !header.checksum_ok {
            return Err(CoreError::TableChecksum {
                location: format!("table of {expected_entries} entries"),
            });
        }
        if header.entry_count != expected_entries {
            return Err(CoreError::InvalidFormat(format!(
                "table header lists {} entries, directory expects {expected_entries}",
                header.entry_count
            )));
        }

        let count = header.entry_count as usize;
        let end = TABLE_HEADER_SIZE + count * 4;
        if body.len() < end {
            return Err(CoreError::InvalidFormat(format!(
                "table body holds {} bytes, {count} entries need {end}",
                body.len()
            )));
        }

        let entries = (0..count)
            .map(|i| le_u32(body, TABLE_HEADER_SIZE + i * 4))
            .collect();
        Ok(Self {
            base_offset: header.base_offset,
            entries,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset relative to the base and the compression flag of entry `i`.
    #[inline]
    pub fn entry(&self, i: usize) -> Option<(u64, bool)> {
        self.entries.get(i).map(|&raw| decode_entry(raw))
    }
}

#[derive(Debug, Default)]
struct Slot {
    table: Option<OffsetTable>,
    last_used: u64,
}

/// Holds decoded tables while their summed size stays within a byte budget.
///
/// A single table larger than the budget is still loaded; everything else is
/// evicted to make room for it.
#[derive(Debug)]
pub struct TableCache {
    slots: Vec<Slot>,
    used_bytes: u64,
    max_bytes: u64,
}

impl TableCache {
    pub fn new(table_count: usize, max_bytes: u64) -> Self {
        Self {
            slots: (0..table_count).map(|_| Slot::default()).collect(),
            used_bytes: 0,
            max_bytes,
        }
    }

    pub fn touch(&mut self, table: usize, now: u64) {
        if let Some(slot) = self.slots.get_mut(table) {
            slot.last_used = now;
        }
    }

    /// Returns the offset array of `table`, reading it through `segments` on a miss.
    ///
    /// The table is read and decoded before anything is evicted.
    pub fn acquire(
        &mut self,
        directory: &Directory,
        table: &Table,
        segments: &mut SegmentCache,
        stats: &mut CacheStats,
    ) -> Result<&OffsetTable> {
        let index = table.index;
        if index >= self.slots.len() {
            return Err(CoreError::InvalidFormat(format!(
                "table index {index} out of range"
            )));
        }

        if self.slots[index].table.is_some() {
            stats.table_hits += 1;
        } else {
            stats.table_misses += 1;
            let segment = directory.segments.get(table.segment).ok_or_else(|| {
                CoreError::InvalidFormat(format!("table {index} names unknown segment"))
            })?;
            let file = segments.acquire(segment, table.segment, stats)?;
            let body = read_body(file, table.offset, table.size)?;
            let decoded = OffsetTable::parse(&body, table.entry_count)?;

            while self.used_bytes + table.size > self.max_bytes {
                if !self.evict_oldest(index, &directory.tables) {
                    break;
                }
            }

            self.slots[index].table = Some(decoded);
            self.used_bytes += table.size;
            stats.tables_loaded += 1;
            stats.table_bytes_read += table.size;
            debug!(
                table = index,
                bytes = table.size,
                cached = self.used_bytes,
                "loaded offset table"
            );
        }
        stats.table_cache_bytes = self.used_bytes;

        self.slots[index]
            .table
            .as_ref()
            .ok_or_else(|| CoreError::InvalidFormat(format!("table {index} vanished from cache")))
    }

    /// Drops the least recently used table other than `keep`; ties go to the lowest index.
    fn evict_oldest(&mut self, keep: usize, tables: &[Table]) -> bool {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, slot)| *i != keep && slot.table.is_some())
            .min_by_key(|(i, slot)| (slot.last_used, *i))
            .map(|(i, _)| i);

        let Some(i) = victim else {
            return false;
        };
        self.slots[i].table = None;
        let size = tables.get(i).map_or(0, |t| t.size);
        self.used_bytes = self.used_bytes.saturating_sub(size);
        debug!(table = i, bytes = size, "released offset table");
        true
    }

    #[inline]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn is_cached(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|s| s.table.is_some())
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.table = None;
        }
        self.used_bytes = 0;
    }
}
