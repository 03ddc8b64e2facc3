use anyhow::{Context, Result};
use evmount_core::{CacheOptions, ImageAccess, WriteCacheOptions};
use humansize::{BINARY, format_size};
use std::fs;
use std::path::{Path, PathBuf};

pub struct ReadRequest {
    pub offset: u64,
    pub length: usize,
    pub cache: Option<PathBuf>,
    pub out: Option<PathBuf>,
}

pub struct WriteRequest {
    pub cache: PathBuf,
    pub offset: u64,
    pub input: PathBuf,
    pub block_size: u64,
    pub overwrite: bool,
}

pub fn open_image(files: &[PathBuf], options: &CacheOptions) -> Result<ImageAccess> {
    let source = evmount_io::create_reader(files, options)
        .with_context(|| format!("Failed to open image: {}", display_files(files)))?;
    Ok(ImageAccess::from_source(source))
}

fn display_files(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn run_info(files: &[PathBuf], options: &CacheOptions) -> Result<()> {
    let image = open_image(files, options)?;
    print!("{}", image.info());
    println!(
        "Total: {} ({} bytes)",
        format_size(image.size(), BINARY),
        image.size()
    );
    image.close()?;
    Ok(())
}

pub fn run_read(files: &[PathBuf], options: &CacheOptions, request: ReadRequest) -> Result<()> {
    let mut image = open_image(files, options)?;
    if let Some(cache) = &request.cache {
        if !cache.exists() {
            anyhow::bail!("Overlay store does not exist: {}", cache.display());
        }
        let cache_options = WriteCacheOptions::new(cache);
        let cache_options = match existing_block_size(cache)? {
            Some(block_size) => cache_options.with_block_size(block_size),
            None => cache_options,
        };
        image
            .attach_cache(&cache_options)
            .with_context(|| format!("Failed to attach overlay: {}", cache.display()))?;
    }

    let mut buffer = vec![0u8; request.length];
    let n = image
        .read(request.offset, &mut buffer)
        .with_context(|| format!("Failed to read {} bytes at {}", request.length, request.offset))?;
    buffer.truncate(n);

    match &request.out {
        Some(path) => {
            fs::write(path, &buffer)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {n} bytes to {}", path.display());
        }
        None => {
            println!("Bytes read: {n}\n");
            print!("{}", hex_dump(&buffer, request.offset));
        }
    }

    image.close()?;
    Ok(())
}

/// Block size recorded in an existing overlay store header.
fn existing_block_size(path: &Path) -> Result<Option<u64>> {
    use evmount_core::cow::header::{STORE_HEADER_SIZE, StoreHeader};
    use std::io::Read;

    let mut raw = vec![0u8; STORE_HEADER_SIZE];
    let mut file = fs::File::open(path)?;
    match file.read_exact(&mut raw) {
        Ok(()) => Ok(Some(StoreHeader::decode(&raw)?.block_size)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn run_write(files: &[PathBuf], options: &CacheOptions, request: WriteRequest) -> Result<()> {
    let data = fs::read(&request.input)
        .with_context(|| format!("Failed to read {}", request.input.display()))?;

    let mut image = open_image(files, options)?;
    let cache_options = WriteCacheOptions::new(&request.cache)
        .with_block_size(request.block_size)
        .with_overwrite(request.overwrite);
    image
        .attach_cache(&cache_options)
        .with_context(|| format!("Failed to attach overlay: {}", request.cache.display()))?;

    let written = image
        .write(request.offset, &data)
        .with_context(|| format!("Failed to write at offset {}", request.offset))?;
    if written < data.len() {
        println!(
            "Image ends at {}; {} of {} bytes written",
            image.size(),
            written,
            data.len()
        );
    } else {
        println!("Wrote {written} bytes at offset {}", request.offset);
    }
    if let Some(blocks) = image.cached_blocks() {
        println!("Overlay holds {blocks} modified block(s)");
    }

    image.close()?;
    Ok(())
}

/// Formats a buffer as hex (16 bytes per line).
/// Format: `OFFSET | HEX BYTES | ASCII`
pub fn hex_dump(data: &[u8], base: u64) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Offset           | 00 01 02 03 04 05 06 07  08 09 0A 0B 0C 0D 0E 0F | ASCII"
    );
    let _ = writeln!(out, "{}", "-".repeat(83));

    for (i, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:016x} | ", base + (i * 16) as u64);
        for (j, byte) in chunk.iter().enumerate() {
            let _ = write!(out, "{byte:02x} ");
            if j == 7 {
                out.push(' ');
            }
        }

        for j in chunk.len()..16 {
            out.push_str("   ");
            if j == 7 {
                out.push(' ');
            }
        }

        out.push_str("| ");
        for byte in chunk {
            let ch = if byte.is_ascii_graphic() || *byte == b' ' {
                *byte as char
            } else {
                '.'
            };
            out.push(ch);
        }
        out.push('\n');
    }
    out
}
