use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Offset {offset} is out of bounds (max: {max})")]
    OutOfBounds { offset: u64, max: u64 },

    #[error("Cannot open segment {}: {source}", path.display())]
    SegmentOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Segment {number} appears more than once")]
    DuplicateSegment { number: u16 },

    #[error("Segment {expected} is missing (found segment {found} instead)")]
    MissingSegment { expected: u16, found: u16 },

    #[error("Section '{section}' in {} appears before {missing}", path.display())]
    SectionOrder {
        path: PathBuf,
        section: String,
        missing: &'static str,
    },

    #[error("No volume section found in any segment")]
    VolumeMissing,

    #[error(
        "Tables describe {found} chunks but the volume declares {declared}; \
         maybe some segment files are missing"
    )]
    ChunkCountMismatch { declared: u64, found: u64 },

    #[error("Table header checksum mismatch: {location}")]
    TableChecksum { location: String },

    #[error("Chunk {chunk} is not covered by any table")]
    ChunkNotFound { chunk: u64 },

    #[error("Chunk {chunk} occupies {length} bytes on disk (limit {limit})")]
    ChunkTooLarge { chunk: u64, length: u64, limit: u64 },

    #[error("Chunk {chunk} decoded to {actual} bytes, expected {expected}")]
    ChunkLength {
        chunk: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Chunk {chunk} checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChunkChecksum {
        chunk: u64,
        stored: u32,
        computed: u32,
    },

    #[error("Chunk {chunk} failed to inflate: {source}")]
    Decompress {
        chunk: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Reading chunk {chunk} failed: {source}")]
    ChunkIo {
        chunk: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot allocate {bytes} bytes for {purpose}")]
    Allocation { bytes: usize, purpose: &'static str },

    #[error("Cache file does not match the image: {0}")]
    StoreMismatch(String),

    #[error("Block {block} is unallocated; only full-block writes may allocate it")]
    PartialWrite { block: u64 },

    #[error("Image is read-only (no write cache attached)")]
    ReadOnly,

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

impl CoreError {
    /// Errno value handed to a filesystem adapter for this error.
    pub fn errno(&self) -> i32 {
        match self {
            CoreError::Allocation { .. } => libc::ENOMEM,
            CoreError::InvalidOption(_) | CoreError::OutOfBounds { .. } => libc::EINVAL,
            CoreError::ReadOnly => libc::EROFS,
            _ => libc::EIO,
        }
    }

    /// True for errors caused by damaged image content rather than the environment.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CoreError::ChunkLength { .. }
                | CoreError::ChunkChecksum { .. }
                | CoreError::Decompress { .. }
                | CoreError::ChunkTooLarge { .. }
                | CoreError::TableChecksum { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let alloc = CoreError::Allocation {
            bytes: 1 << 40,
            purpose: "offset table",
        };
        assert_eq!(alloc.errno(), libc::ENOMEM);
        assert_eq!(
            CoreError::InvalidOption("maxfiles=0".into()).errno(),
            libc::EINVAL
        );
        assert_eq!(CoreError::ChunkNotFound { chunk: 9 }.errno(), libc::EIO);
        assert_eq!(CoreError::VolumeMissing.errno(), libc::EIO);
    }

    #[test]
    fn test_integrity_classification() {
        let crc = CoreError::ChunkChecksum {
            chunk: 3,
            stored: 1,
            computed: 2,
        };
        assert!(crc.is_integrity());
        let table = CoreError::TableChecksum {
            location: "offset 1024 in image.E01".to_string(),
        };
        assert!(table.is_integrity());
        assert_eq!(table.errno(), libc::EIO);
        assert!(!CoreError::PartialWrite { block: 0 }.is_integrity());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = CoreError::ChunkLength {
            chunk: 7,
            expected: 32768,
            actual: 100,
        };
        let text = err.to_string();
        assert!(text.contains("Chunk 7"));
        assert!(text.contains("32768"));
    }
}
