//! evmount - read-only access to EWF evidence images
//!
//! Inspects, reads, verifies and acquires E01 containers, with an optional
//! copy-on-write overlay for examiner edits.

mod acquire;
mod inspect;
mod verify;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evmount_core::CacheOptions;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "evmount")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Table cache budget in MiB
    #[arg(long, global = true)]
    maxmem: Option<u64>,

    /// Maximum number of segment files kept open
    #[arg(long, global = true)]
    maxfiles: Option<usize>,

    /// Cache options as a `key=value,...` list (maxmem, maxfiles, stats, refresh)
    #[arg(long, global = true)]
    inopts: Option<String>,

    /// JSON file holding cache options
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write cache statistics to `<path>_<pid>`
    #[arg(long, global = true)]
    stats: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Log to this file instead of stderr
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print image geometry, acquisition metadata and segment files
    Info {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Read a byte range from the image
    Read {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long, default_value_t = 512)]
        length: usize,

        /// Overlay store whose modifications are applied to the read
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Write raw bytes here instead of a hex dump
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Write bytes through a copy-on-write overlay store
    Write {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long)]
        cache: PathBuf,

        #[arg(long)]
        offset: u64,

        /// File holding the bytes to write
        #[arg(long)]
        input: PathBuf,

        #[arg(long, default_value_t = 1024 * 1024)]
        block_size: u64,

        /// Discard an existing overlay store first
        #[arg(long, default_value_t = false)]
        overwrite_cache: bool,
    },

    /// Decode every chunk and report integrity failures
    Verify {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Write a raw image or device as EWF segments
    Acquire {
        input: PathBuf,

        /// Output base path; segments get .E01, .E02, ...
        output: PathBuf,

        /// Maximum segment size in MiB
        #[arg(long, default_value_t = 1500)]
        segment_size: u64,

        #[arg(long, default_value_t = false)]
        no_compress: bool,

        /// Store all-zero chunks as sparse records
        #[arg(long, default_value_t = false)]
        sparse: bool,

        #[arg(long)]
        case: Option<String>,

        #[arg(long)]
        examiner: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.log.as_deref())?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let options = cache_options(&args)?;

    match args.command {
        Command::Info { files } => inspect::run_info(&files, &options),
        Command::Read {
            files,
            offset,
            length,
            cache,
            out,
        } => inspect::run_read(
            &files,
            &options,
            inspect::ReadRequest {
                offset,
                length,
                cache,
                out,
            },
        ),
        Command::Write {
            files,
            cache,
            offset,
            input,
            block_size,
            overwrite_cache,
        } => inspect::run_write(
            &files,
            &options,
            inspect::WriteRequest {
                cache,
                offset,
                input,
                block_size,
                overwrite: overwrite_cache,
            },
        ),
        Command::Verify { files, json } => {
            let ok = verify::run_verify(&files, &options, json, running)?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Acquire {
            input,
            output,
            segment_size,
            no_compress,
            sparse,
            case,
            examiner,
        } => acquire::run_acquire(
            &input,
            &output,
            acquire::AcquireRequest {
                segment_size_mib: segment_size,
                compress: !no_compress,
                sparse,
                case,
                examiner,
            },
            running,
        ),
    }
}

fn init_logging(verbose: bool, log: Option<&Path>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

/// Layers the option sources: JSON config, then `--inopts`, then the
/// dedicated flags.
fn cache_options(args: &Args) -> Result<CacheOptions> {
    let mut options = match &args.config {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open config: {}", path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("Invalid config: {}", path.display()))?
        }
        None => CacheOptions::default(),
    };

    if let Some(list) = &args.inopts {
        options = options
            .merge_list(list)
            .context("Invalid --inopts value")?;
    }
    if let Some(mib) = args.maxmem {
        options = options.with_max_table_cache_mib(mib);
    }
    if let Some(count) = args.maxfiles {
        options = options.with_max_open_segments(count);
    }
    if let Some(path) = &args.stats {
        let refresh = options.stats_refresh;
        options = options.with_stats(path, refresh);
    }

    options.validate().context("Invalid cache options")?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_inopts() {
        let args = parse(&[
            "evmount",
            "--inopts",
            "maxmem=4,maxfiles=2,refresh=3",
            "--maxfiles",
            "7",
            "info",
            "image.E01",
        ]);
        let options = cache_options(&args).unwrap();
        assert_eq!(options.max_table_cache, 4 * 1024 * 1024);
        assert_eq!(options.max_open_segments, 7);
        assert_eq!(options.stats_refresh, 3);
    }

    #[test]
    fn test_config_file_is_loaded() {
        let mut config = tempfile::NamedTempFile::new().unwrap();
        write!(config, r#"{{"max_open_segments": 3}}"#).unwrap();
        config.flush().unwrap();

        let path = config.path().to_str().unwrap();
        let args = parse(&["evmount", "--config", path, "verify", "a.E01"]);
        let options = cache_options(&args).unwrap();
        assert_eq!(options.max_open_segments, 3);
        assert_eq!(options.max_table_cache, CacheOptions::default().max_table_cache);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let args = parse(&["evmount", "--maxfiles", "0", "info", "a.E01"]);
        assert!(cache_options(&args).is_err());

        let args = parse(&["evmount", "--inopts", "bogus=1", "info", "a.E01"]);
        assert!(cache_options(&args).is_err());
    }

    #[test]
    fn test_write_requires_cache() {
        assert!(Args::try_parse_from(["evmount", "write", "a.E01", "--offset", "0"]).is_err());
    }
}
