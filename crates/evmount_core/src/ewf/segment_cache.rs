//! Bounded pool of open segment file handles.

use super::directory::Segment;
use crate::error::{CoreError, Result};
use crate::stats::CacheStats;
use std::fs::File;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    file: Option<File>,
    last_used: u64,
}

/// Keeps at most `max_open` segment files open, evicting by last access.
#[derive(Debug)]
pub struct SegmentCache {
    slots: Vec<Slot>,
    open: usize,
    max_open: usize,
}

impl SegmentCache {
    pub fn new(segment_count: usize, max_open: usize) -> Self {
        Self {
            slots: (0..segment_count).map(|_| Slot::default()).collect(),
            open: 0,
            max_open: max_open.max(1),
        }
    }

    /// Stamps a segment as used at logical time `now`.
    pub fn touch(&mut self, segment: usize, now: u64) {
        if let Some(slot) = self.slots.get_mut(segment) {
            slot.last_used = now;
        }
    }

    /// Returns an open handle for `segment`, opening it if needed.
    ///
    /// The new file is opened before anything is evicted, so a failed open
    /// leaves the pool as it was.
    pub fn acquire(
        &mut self,
        segment: &Segment,
        index: usize,
        stats: &mut CacheStats,
    ) -> Result<&mut File> {
        if index >= self.slots.len() {
            return Err(CoreError::InvalidFormat(format!(
                "segment index {index} out of range"
            )));
        }

        if self.slots[index].file.is_some() {
            stats.segment_hits += 1;
        } else {
            stats.segment_misses += 1;
            let file = open_segment(segment)?;
            while self.open >= self.max_open {
                if !self.evict_oldest(index) {
                    break;
                }
            }
            debug!(segment = segment.number, path = %segment.path.display(), "opened segment");
            self.slots[index].file = Some(file);
            self.open += 1;
        }
        stats.open_segments = self.open;

        self.slots[index]
            .file
            .as_mut()
            .ok_or_else(|| CoreError::InvalidFormat(format!("segment {index} lost its handle")))
    }

    /// Closes the least recently used open segment other than `keep`.
    fn evict_oldest(&mut self, keep: usize) -> bool {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, slot)| *i != keep && slot.file.is_some())
            .min_by_key(|(i, slot)| (slot.last_used, *i))
            .map(|(i, _)| i);

        match victim {
            Some(i) => {
                self.slots[i].file = None;
                self.open -= 1;
                debug!(segment_index = i, "closed segment");
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn open_count(&self) -> usize {
        self.open
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|s| s.file.is_some())
    }

    pub fn close_all(&mut self) {
        for slot in &mut self.slots {
            slot.file = None;
        }
        self.open = 0;
    }
}

fn open_segment(segment: &Segment) -> Result<File> {
    let file = File::open(&segment.path).map_err(|source| CoreError::SegmentOpen {
        path: segment.path.clone(),
        source,
    })?;

    #[cfg(target_os = "linux")]
    {
        use rustix::fs::{Advice, fadvise};

        let _ = fadvise(&file, 0, None, Advice::Random);
    }

    Ok(file)
}
