use anyhow::{Context, Result};
use evmount_core::ewf::{AcquisitionMetadata, EwfWriter, WriteSummary, WriterOptions};
use humansize::{BINARY, format_size};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub struct AcquireRequest {
    pub segment_size_mib: u64,
    pub compress: bool,
    pub sparse: bool,
    pub case: Option<String>,
    pub examiner: Option<String>,
}

/// Header metadata recorded with a new acquisition.
pub fn acquisition_metadata(request: &AcquireRequest, source: &Path) -> AcquisitionMetadata {
    let now = chrono::Local::now().format("%Y %-m %-d %-H %-M %-S").to_string();
    let mut fields = vec![
        ("a".to_string(), source.display().to_string()),
        ("c".to_string(), request.case.clone().unwrap_or_default()),
        ("e".to_string(), request.examiner.clone().unwrap_or_default()),
        ("av".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ("ov".to_string(), std::env::consts::OS.to_string()),
        ("m".to_string(), now.clone()),
        ("u".to_string(), now),
    ];
    fields.retain(|(_, v)| !v.is_empty());
    AcquisitionMetadata::from_pairs(fields)
}

pub fn writer_options(request: &AcquireRequest, source: &Path) -> WriterOptions {
    let defaults = WriterOptions::default();
    let max_segment_size = request.segment_size_mib.saturating_mul(1024 * 1024);
    // A table group must fit a segment, so small segments get small tables.
    let chunks_per_table = (max_segment_size / (2 * defaults.chunk_size()))
        .clamp(1, defaults.chunks_per_table as u64) as u32;
    WriterOptions {
        compression_level: request.compress.then_some(6),
        sparse_zero_chunks: request.sparse,
        max_segment_size,
        chunks_per_table,
        metadata: acquisition_metadata(request, source),
        ..defaults
    }
}

pub fn run_acquire(
    input: &Path,
    output: &Path,
    request: AcquireRequest,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let start_time = Instant::now();
    let mut file =
        File::open(input).with_context(|| format!("Failed to open input: {}", input.display()))?;
    let size = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;

    println!("Acquiring: {}", input.display());
    println!("Input size: {}", format_size(size, BINARY));

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:50.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .context("invalid progress bar template")?
            .progress_chars("##-"),
    );

    let writer = EwfWriter::new(writer_options(&request, input));
    let result = writer.write_image_with(BufReader::new(file), size, output, |consumed| {
        pb.set_position(consumed);
        running.load(Ordering::SeqCst)
    });
    pb.finish_and_clear();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) if !running.load(Ordering::SeqCst) => {
            println!("\n⚠️  Acquisition cancelled; partial segments were left in place");
            return Err(e).context("Acquisition cancelled");
        }
        Err(e) => return Err(e).context("Acquisition failed"),
    };

    print_summary(&summary, size, start_time.elapsed().as_secs_f64());
    Ok(())
}

fn print_summary(summary: &WriteSummary, input_size: u64, elapsed: f64) {
    println!("\n╔════════════════════════════════════════╗");
    println!("║       === Acquisition Finished ===     ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Input Size:         {:>18} ║", format_size(input_size, BINARY));
    println!(
        "║ Written:            {:>18} ║",
        format_size(summary.bytes_written, BINARY)
    );
    println!("║ Segments:           {:>18} ║", summary.segments.len());
    println!("║ Chunks:             {:>18} ║", summary.chunks);
    println!("║ Compressed Chunks:  {:>18} ║", summary.compressed_chunks);
    println!("║ Sparse Chunks:      {:>18} ║", summary.sparse_chunks);
    println!("║ Elapsed:            {:>17.1}s ║", elapsed);
    println!("╚════════════════════════════════════════╝");
    for segment in &summary.segments {
        println!("  {}", segment.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmount_core::{BlockSource, CacheOptions, EwfImage};
    use tempfile::TempDir;

    fn request() -> AcquireRequest {
        AcquireRequest {
            segment_size_mib: 1,
            compress: true,
            sparse: true,
            case: Some("2026-041".to_string()),
            examiner: None,
        }
    }

    #[test]
    fn test_metadata_skips_empty_fields() {
        let metadata = acquisition_metadata(&request(), Path::new("/dev/sdb"));
        assert_eq!(metadata.get("c"), Some("2026-041"));
        assert_eq!(metadata.get("a"), Some("/dev/sdb"));
        assert_eq!(metadata.get("e"), None);
        assert!(metadata.get("m").is_some());
    }

    #[test]
    fn test_acquire_round_trip() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("disk.dd");
        let mut state = 0x9E37_79B9u32;
        let mut data: Vec<u8> = (0..3 * 1024 * 1024)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        data[1024 * 1024..1024 * 1024 + 65536].fill(0);
        std::fs::write(&raw, &data).unwrap();

        let output = dir.path().join("evidence");
        run_acquire(&raw, &output, request(), Arc::new(AtomicBool::new(true))).unwrap();

        let first = output.with_extension("E01");
        let segments = evmount_io::discover_segments(&first).unwrap();
        assert!(segments.len() > 1);

        let mut image = EwfImage::open(&segments, &CacheOptions::default()).unwrap();
        assert_eq!(image.size(), data.len() as u64);
        assert_eq!(image.directory().metadata.get("c"), Some("2026-041"));

        let mut buf = vec![0u8; data.len()];
        assert_eq!(image.read_at(0, &mut buf).unwrap(), data.len());
        assert!(buf == data);
    }

    #[test]
    fn test_cancelled_acquisition_fails() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("disk.dd");
        std::fs::write(&raw, vec![7u8; 256 * 1024]).unwrap();

        let result = run_acquire(
            &raw,
            &dir.path().join("evidence"),
            request(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(result.is_err());
    }
}
