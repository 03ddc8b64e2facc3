use anyhow::{Context, Result};
use evmount_core::{BlockSource, CacheOptions, CacheStats, EwfImage};
use evmount_io::{ImageFormat, detect_format, discover_segments};
use humansize::{BINARY, format_size};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct ChunkFailure {
    pub chunk: u64,
    pub integrity: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub image_size: u64,
    pub chunk_count: u64,
    pub chunks_checked: u64,
    pub interrupted: bool,
    pub failures: Vec<ChunkFailure>,
    pub elapsed_secs: f64,
    pub stats: Option<CacheStats>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.failures.is_empty()
    }
}

/// Decodes every chunk of the container, collecting the failures.
///
/// `on_chunk` receives the decoded length of each chunk and returns false to
/// stop early.
pub fn verify_image<F>(image: &mut EwfImage, mut on_chunk: F) -> VerifyReport
where
    F: FnMut(u64) -> bool,
{
    let start_time = Instant::now();
    let chunk_count = image.chunk_count();
    let mut failures = Vec::new();
    let mut checked = 0;
    let mut interrupted = false;

    for chunk in 0..chunk_count {
        let outcome = image.read_chunk(chunk).map(|data| data.len() as u64);
        let len = match outcome {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!(chunk, "chunk failed verification: {e}");
                failures.push(ChunkFailure {
                    chunk,
                    integrity: e.is_integrity(),
                    error: e.to_string(),
                });
                image.directory().chunk_len(chunk) as u64
            }
        };
        checked += 1;
        if !on_chunk(len) {
            interrupted = true;
            break;
        }
    }

    VerifyReport {
        image_size: image.size(),
        chunk_count,
        chunks_checked: checked,
        interrupted,
        failures,
        elapsed_secs: start_time.elapsed().as_secs_f64(),
        stats: image.stats(),
    }
}

pub fn run_verify(
    files: &[PathBuf],
    options: &CacheOptions,
    json: bool,
    running: Arc<AtomicBool>,
) -> Result<bool> {
    let first = files.first().context("No image files given")?;
    if detect_format(first)? != ImageFormat::Ewf {
        anyhow::bail!("{} is not an EWF segment file", first.display());
    }
    let segments = if files.len() == 1 {
        discover_segments(first)?
    } else {
        files.to_vec()
    };
    let mut image = EwfImage::open(&segments, options).context("Failed to open EWF image")?;

    let pb = ProgressBar::new(image.size());
    if json {
        pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:50.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .context("invalid progress bar template")?
            .progress_chars("##-"),
    );

    let report = verify_image(&mut image, |len| {
        pb.inc(len);
        running.load(Ordering::SeqCst)
    });
    pb.finish_and_clear();
    image.close()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(report.is_clean())
}

fn print_summary(report: &VerifyReport) {
    for failure in &report.failures {
        println!("chunk {:>10}: {}", failure.chunk, failure.error);
    }

    println!("\n╔════════════════════════════════════════╗");
    if report.interrupted {
        println!("║   === Verification Interrupted ===     ║");
    } else if report.failures.is_empty() {
        println!("║       === Verification Passed ===      ║");
    } else {
        println!("║       === Verification FAILED ===      ║");
    }
    println!("╠════════════════════════════════════════╣");
    println!(
        "║ Image Size:         {:>18} ║",
        format_size(report.image_size, BINARY)
    );
    println!(
        "║ Chunks Checked:     {:>18} ║",
        format!("{}/{}", report.chunks_checked, report.chunk_count)
    );
    println!("║ Failed Chunks:      {:>18} ║", report.failures.len());
    println!("║ Elapsed:            {:>17.1}s ║", report.elapsed_secs);
    println!("╚════════════════════════════════════════╝");

    if let Some(stats) = &report.stats {
        println!();
        print!("{}", stats.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmount_core::ewf::{EwfWriter, WriterOptions};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn write_image(dir: &TempDir, data: &[u8]) -> Vec<PathBuf> {
        let options = WriterOptions {
            compression_level: None,
            ..Default::default()
        };
        EwfWriter::new(options)
            .write_image(data, data.len() as u64, &dir.path().join("verify"))
            .unwrap()
            .segments
    }

    #[test]
    fn test_clean_image_verifies() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..5 * 32768u32).map(|i| (i % 199) as u8).collect();
        let segments = write_image(&dir, &data);

        let mut image = EwfImage::open(&segments, &CacheOptions::default()).unwrap();
        let mut seen = 0;
        let report = verify_image(&mut image, |len| {
            seen += len;
            true
        });
        assert!(report.is_clean());
        assert_eq!(report.chunks_checked, 5);
        assert_eq!(seen, data.len() as u64);
    }

    #[test]
    fn test_corrupt_chunk_is_reported() {
        let dir = TempDir::new().unwrap();
        let data = vec![0x5Au8; 4 * 32768];
        let segments = write_image(&dir, &data);

        let bytes = std::fs::read(&segments[0]).unwrap();
        let needle = vec![0x5Au8; 64];
        let at = bytes
            .windows(needle.len())
            .position(|w| w == &needle[..])
            .unwrap();
        let mut file = OpenOptions::new().write(true).open(&segments[0]).unwrap();
        file.seek(SeekFrom::Start(at as u64 + 10)).unwrap();
        file.write_all(&[0xA5]).unwrap();
        drop(file);

        let mut image = EwfImage::open(&segments, &CacheOptions::default()).unwrap();
        let report = verify_image(&mut image, |_| true);
        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].chunk, 0);
        assert!(report.failures[0].integrity);
        assert_eq!(report.chunks_checked, 4);
    }

    #[test]
    fn test_cancel_stops_early() {
        let dir = TempDir::new().unwrap();
        let data = vec![1u8; 6 * 32768];
        let segments = write_image(&dir, &data);

        let mut image = EwfImage::open(&segments, &CacheOptions::default()).unwrap();
        let mut calls = 0;
        let report = verify_image(&mut image, |_| {
            calls += 1;
            calls < 2
        });
        assert!(report.interrupted);
        assert_eq!(report.chunks_checked, 2);
        assert!(!report.is_clean());
    }
}
