//! Persisted header of the write-back store and the image identity it pins.

use crate::error::{CoreError, Result};
use crate::traits::BlockSource;
use sha2::{Digest, Sha256};

pub const STORE_SIGNATURE: [u8; 8] = *b"EVMCACHE";
pub const STORE_VERSION: u32 = 1;
pub const MIN_STORE_VERSION: u32 = 1;
pub const STORE_HEADER_SIZE: usize = 512;

/// Block map value of a block that has never been written.
pub const UNASSIGNED: u64 = u64::MAX;

const HASH_READ_SIZE: usize = 1024 * 1024;

/// SHA-256 over the first `hash_size` bytes of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageIdentity {
    pub hash_size: u64,
    pub digest: [u8; 32],
}

impl ImageIdentity {
    pub fn compute(source: &mut dyn BlockSource, hash_size: u64) -> Result<Self> {
        let limit = hash_size.min(source.size());
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_READ_SIZE.min(limit as usize).max(1)];
        let mut offset = 0u64;

        while offset < limit {
            let want = ((limit - offset) as usize).min(buffer.len());
            let got = source.read_at(offset, &mut buffer[..want])?;
            if got == 0 {
                return Err(CoreError::InvalidFormat(format!(
                    "image ended at {offset} while hashing {limit} bytes"
                )));
            }
            hasher.update(&buffer[..got]);
            offset += got as u64;
        }

        Ok(Self {
            hash_size,
            digest: hasher.finalize().into(),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub version: u32,
    pub block_size: u64,
    pub image_size: u64,
    pub identity: ImageIdentity,
    pub block_map_offset: u64,
    pub block_count: u64,
}

impl StoreHeader {
    pub fn new(block_size: u64, image_size: u64, identity: ImageIdentity) -> Self {
        Self {
            version: STORE_VERSION,
            block_size,
            image_size,
            identity,
            block_map_offset: STORE_HEADER_SIZE as u64,
            block_count: image_size.div_ceil(block_size),
        }
    }

    /// First byte after the block map, where block data starts.
    pub fn data_offset(&self) -> Result<u64> {
        self.block_count
            .checked_mul(8)
            .and_then(|map| map.checked_add(self.block_map_offset))
            .ok_or_else(|| {
                CoreError::StoreMismatch(format!(
                    "block map of {} entries at {} overflows the file offset range",
                    self.block_count, self.block_map_offset
                ))
            })
    }

    pub fn encode(&self) -> [u8; STORE_HEADER_SIZE] {
        let mut out = [0u8; STORE_HEADER_SIZE];
        out[..8].copy_from_slice(&STORE_SIGNATURE);
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[16..24].copy_from_slice(&self.block_size.to_le_bytes());
        out[24..32].copy_from_slice(&self.image_size.to_le_bytes());
        out[32..40].copy_from_slice(&self.identity.hash_size.to_le_bytes());
        out[40..72].copy_from_slice(&self.identity.digest);
        out[72..80].copy_from_slice(&self.block_map_offset.to_le_bytes());
        out[80..88].copy_from_slice(&self.block_count.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STORE_HEADER_SIZE {
            return Err(CoreError::StoreMismatch(format!(
                "header is {} bytes, expected {STORE_HEADER_SIZE}",
                bytes.len()
            )));
        }
        if bytes[..8] != STORE_SIGNATURE {
            return Err(CoreError::StoreMismatch(
                "not an evmount cache file".to_string(),
            ));
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if !(MIN_STORE_VERSION..=STORE_VERSION).contains(&version) {
            return Err(CoreError::StoreMismatch(format!(
                "cache file version {version} is not supported"
            )));
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[40..72]);
        let header = Self {
            version,
            block_size: u64_at(16),
            image_size: u64_at(24),
            identity: ImageIdentity {
                hash_size: u64_at(32),
                digest,
            },
            block_map_offset: u64_at(72),
            block_count: u64_at(80),
        };

        if header.block_size == 0 {
            return Err(CoreError::StoreMismatch("zero block size".to_string()));
        }
        if header.block_map_offset < STORE_HEADER_SIZE as u64 {
            return Err(CoreError::StoreMismatch(
                "block map overlaps the header".to_string(),
            ));
        }
        if header.block_count != header.image_size.div_ceil(header.block_size) {
            return Err(CoreError::StoreMismatch(format!(
                "block map holds {} entries, image needs {}",
                header.block_count,
                header.image_size.div_ceil(header.block_size)
            )));
        }
        header.data_offset()?;
        Ok(header)
    }

    /// Refuses a store that was created for a different image or layout.
    pub fn check_compatible(
        &self,
        block_size: u64,
        image_size: u64,
        identity: &ImageIdentity,
    ) -> Result<()> {
        if self.image_size != image_size {
            return Err(CoreError::StoreMismatch(format!(
                "cache was made for a {} byte image, this one has {image_size}",
                self.image_size
            )));
        }
        if self.block_size != block_size {
            return Err(CoreError::StoreMismatch(format!(
                "cache uses {} byte blocks, {block_size} requested",
                self.block_size
            )));
        }
        if self.identity != *identity {
            return Err(CoreError::StoreMismatch(format!(
                "image hash {} does not match the cache ({})",
                identity.to_hex(),
                self.identity.to_hex()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pattern(u64);

    impl BlockSource for Pattern {
        fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
            let n = buffer.len().min(self.0.saturating_sub(offset) as usize);
            for (i, b) in buffer[..n].iter_mut().enumerate() {
                *b = ((offset + i as u64) % 251) as u8;
            }
            Ok(n)
        }

        fn size(&self) -> u64 {
            self.0
        }
    }

    fn identity() -> ImageIdentity {
        ImageIdentity {
            hash_size: 4096,
            digest: [7; 32],
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = StoreHeader::new(1024 * 1024, 2_097_153, identity());
        assert_eq!(header.block_count, 3);
        assert_eq!(header.data_offset().unwrap(), 512 + 24);

        let decoded = StoreHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_block_map_offset_overflow() {
        let header = StoreHeader::new(1, 1 << 62, identity());
        assert!(matches!(header.data_offset(), Err(CoreError::StoreMismatch(_))));
        assert!(matches!(
            StoreHeader::decode(&header.encode()),
            Err(CoreError::StoreMismatch(_))
        ));
    }

    #[test]
    fn test_decode_rejects_foreign_files() {
        let mut raw = StoreHeader::new(4096, 8192, identity()).encode();
        raw[0] = b'X';
        assert!(matches!(StoreHeader::decode(&raw), Err(CoreError::StoreMismatch(_))));

        let mut raw = StoreHeader::new(4096, 8192, identity()).encode();
        raw[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(StoreHeader::decode(&raw), Err(CoreError::StoreMismatch(_))));

        assert!(StoreHeader::decode(&raw[..100]).is_err());
    }

    #[test]
    fn test_compatibility_checks() {
        let header = StoreHeader::new(4096, 8192, identity());
        assert!(header.check_compatible(4096, 8192, &identity()).is_ok());
        assert!(header.check_compatible(4096, 8193, &identity()).is_err());
        assert!(header.check_compatible(512, 8192, &identity()).is_err());

        let other = ImageIdentity {
            digest: [8; 32],
            ..identity()
        };
        assert!(header.check_compatible(4096, 8192, &other).is_err());
    }

    #[test]
    fn test_identity_is_stable_and_bounded() {
        let a = ImageIdentity::compute(&mut Pattern(10_000), 4096).unwrap();
        let b = ImageIdentity::compute(&mut Pattern(50_000), 4096).unwrap();
        assert_eq!(a, b);

        let whole = ImageIdentity::compute(&mut Pattern(10_000), 1 << 30).unwrap();
        assert_ne!(a.digest, whole.digest);
        assert_eq!(a.to_hex().len(), 64);
    }
}
