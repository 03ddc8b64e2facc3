//! Cache counters and the periodic statistics report.

use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub segment_hits: u64,
    pub segment_misses: u64,
    pub table_hits: u64,
    pub table_misses: u64,
    pub chunk_hits: u64,
    pub chunk_misses: u64,

    pub read_operations: u64,
    pub errors: u64,
    pub last_error: Option<String>,

    /// Bytes asked for by callers of the read path.
    pub bytes_requested: u64,
    /// Chunk bytes read from segment files, as stored.
    pub bytes_read_compressed: u64,
    /// Chunk bytes produced by decoding.
    pub bytes_read_raw: u64,
    pub table_bytes_read: u64,
    pub tables_loaded: u64,

    pub open_segments: usize,
    pub table_cache_bytes: u64,
    pub total_table_bytes: u64,
    pub segment_count: usize,
    pub table_count: usize,
}

impl CacheStats {
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        self.last_error = Some(message.into());
    }

    #[inline]
    pub fn ratio(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 * 100.0 / total as f64
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let row = |out: &mut String, name: &str, hits: u64, misses: u64| {
            let _ = writeln!(
                out,
                "  {name:<10} {hits:>12} hits {misses:>12} misses  ({:5.1}%)",
                Self::ratio(hits, misses)
            );
        };

        let _ = writeln!(out, "Cache statistics:");
        row(&mut out, "segments", self.segment_hits, self.segment_misses);
        row(&mut out, "tables", self.table_hits, self.table_misses);
        row(&mut out, "chunks", self.chunk_hits, self.chunk_misses);

        let _ = writeln!(out, "Read path:");
        let _ = writeln!(out, "  read operations      {:>14}", self.read_operations);
        let _ = writeln!(out, "  bytes requested      {:>14}", self.bytes_requested);
        let _ = writeln!(out, "  bytes read (stored)  {:>14}", self.bytes_read_compressed);
        let _ = writeln!(out, "  bytes read (decoded) {:>14}", self.bytes_read_raw);
        let _ = writeln!(
            out,
            "  tables loaded        {:>14} ({} bytes)",
            self.tables_loaded, self.table_bytes_read
        );

        let _ = writeln!(out, "Resources:");
        let _ = writeln!(
            out,
            "  open segments        {:>14} of {}",
            self.open_segments, self.segment_count
        );
        let _ = writeln!(
            out,
            "  table cache          {:>14} of {} bytes ({} tables)",
            self.table_cache_bytes, self.total_table_bytes, self.table_count
        );

        let _ = writeln!(out, "Errors: {}", self.errors);
        if let Some(last) = &self.last_error {
            let _ = writeln!(out, "  last: {last}");
        }
        out
    }
}

/// Rewrites a statistics file at most once per refresh interval.
#[derive(Debug)]
pub struct StatsReporter {
    path: PathBuf,
    refresh: Duration,
    last: Option<Instant>,
}

impl StatsReporter {
    /// The report goes to `<base>_<pid>` so several mounts can share a base.
    pub fn new(base: &Path, refresh: Duration) -> Self {
        let mut name = base.as_os_str().to_owned();
        name.push(format!("_{}", std::process::id()));
        Self {
            path: PathBuf::from(name),
            refresh,
            last: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the report if forced or if the interval has elapsed.
    ///
    /// A failed write is logged and retried on the next call.
    pub fn update(&mut self, stats: &CacheStats, force: bool) {
        let due = match self.last {
            None => true,
            Some(at) => at.elapsed() >= self.refresh,
        };
        if !(force || due) {
            return;
        }

        match std::fs::write(&self.path, stats.render()) {
            Ok(()) => self.last = Some(Instant::now()),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot write stats report");
            }
        }
    }
}
