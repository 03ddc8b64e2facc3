//! On-disk structures of EWF version 1 segment files.
//!
//! All integers are little-endian. Checksums are Adler-32.

use crate::error::{CoreError, Result};

pub const EVF_SIGNATURE: [u8; 8] = *b"EVF\x09\x0d\x0a\xff\x00";
pub const FILE_HEADER_SIZE: usize = 13;
pub const SECTION_DESCRIPTOR_SIZE: usize = 76;
pub const VOLUME_SECTION_SIZE: usize = 1052;
pub const TABLE_HEADER_SIZE: usize = 24;

/// Top bit of a table entry marks a zlib-compressed chunk.
pub const COMPRESSED_FLAG: u32 = 0x8000_0000;
pub const OFFSET_MASK: u32 = 0x7FFF_FFFF;

/// Size of a sparse chunk record: a bare little-endian length.
pub const SPARSE_RECORD_SIZE: u64 = 4;

#[inline]
pub fn adler32(data: &[u8]) -> u32 {
    adler2::adler32_slice(data)
}

#[inline]
pub(crate) fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
pub(crate) fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
pub(crate) fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// The 13-byte header opening every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub segment_number: u16,
}

impl FileHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(CoreError::InvalidFormat(format!(
                "file header needs {FILE_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[..8] != EVF_SIGNATURE {
            return Err(CoreError::InvalidFormat(
                "missing EVF signature".to_string(),
            ));
        }
        Ok(Self {
            segment_number: le_u16(bytes, 9),
        })
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[..8].copy_from_slice(&EVF_SIGNATURE);
        out[8] = 1;
        out[9..11].copy_from_slice(&self.segment_number.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Header,
    Header2,
    Volume,
    Disk,
    Data,
    Sectors,
    Table,
    Table2,
    Hash,
    Next,
    Done,
    Other,
}

/// A 76-byte section descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub type_name: [u8; 16],
    /// Absolute offset of the following descriptor in the same file.
    pub next: u64,
    /// Size of the section including this descriptor.
    pub size: u64,
    pub checksum: u32,
    pub checksum_ok: bool,
}

impl SectionDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SECTION_DESCRIPTOR_SIZE {
            return Err(CoreError::InvalidFormat(format!(
                "section descriptor needs {SECTION_DESCRIPTOR_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut type_name = [0u8; 16];
        type_name.copy_from_slice(&bytes[..16]);
        let checksum = le_u32(bytes, 72);

        Ok(Self {
            type_name,
            next: le_u64(bytes, 16),
            size: le_u64(bytes, 24),
            checksum,
            checksum_ok: adler32(&bytes[..72]) == checksum,
        })
    }

    pub fn encode(name: &str, next: u64, size: u64) -> [u8; SECTION_DESCRIPTOR_SIZE] {
        let mut out = [0u8; SECTION_DESCRIPTOR_SIZE];
        let name = name.as_bytes();
        let len = name.len().min(16);
        out[..len].copy_from_slice(&name[..len]);
        out[16..24].copy_from_slice(&next.to_le_bytes());
        out[24..32].copy_from_slice(&size.to_le_bytes());
        let checksum = adler32(&out[..72]);
        out[72..76].copy_from_slice(&checksum.to_le_bytes());
        out
    }

    pub fn name(&self) -> String {
        let end = self
            .type_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.type_name.len());
        String::from_utf8_lossy(&self.type_name[..end]).into_owned()
    }

    pub fn kind(&self) -> SectionKind {
        match self.name().as_str() {
            "header" => SectionKind::Header,
            "header2" => SectionKind::Header2,
            "volume" => SectionKind::Volume,
            "disk" => SectionKind::Disk,
            "data" => SectionKind::Data,
            "sectors" => SectionKind::Sectors,
            "table" => SectionKind::Table,
            "table2" => SectionKind::Table2,
            "hash" => SectionKind::Hash,
            "next" => SectionKind::Next,
            "done" => SectionKind::Done,
            _ => SectionKind::Other,
        }
    }

    #[inline]
    pub fn body_size(&self) -> u64 {
        self.size.saturating_sub(SECTION_DESCRIPTOR_SIZE as u64)
    }
}

/// Geometry and acquisition parameters from a `volume` or `disk` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSection {
    pub media_type: u8,
    pub chunk_count: u32,
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    pub sector_count: u64,
    pub chs_cylinders: u32,
    pub chs_heads: u32,
    pub chs_sectors: u32,
    pub media_flags: u8,
    pub palm_start_sector: u32,
    pub smart_start_sector: u32,
    pub compression_level: u8,
    pub error_block_size: u32,
    pub guid: [u8; 16],
}

impl VolumeSection {
    /// Bytes needed to reach the end of the GUID; older writers truncate the rest.
    const MIN_SIZE: usize = 80;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(CoreError::InvalidFormat(format!(
                "volume section too short ({} bytes)",
                bytes.len()
            )));
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&bytes[64..80]);

        Ok(Self {
            media_type: bytes[0],
            chunk_count: le_u32(bytes, 4),
            sectors_per_chunk: le_u32(bytes, 8),
            bytes_per_sector: le_u32(bytes, 12),
            sector_count: le_u64(bytes, 16),
            chs_cylinders: le_u32(bytes, 24),
            chs_heads: le_u32(bytes, 28),
            chs_sectors: le_u32(bytes, 32),
            media_flags: bytes[36],
            palm_start_sector: le_u32(bytes, 40),
            smart_start_sector: le_u32(bytes, 48),
            compression_level: bytes[52],
            error_block_size: le_u32(bytes, 56),
            guid,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; VOLUME_SECTION_SIZE];
        out[0] = self.media_type;
        out[4..8].copy_from_slice(&self.chunk_count.to_le_bytes());
        out[8..12].copy_from_slice(&self.sectors_per_chunk.to_le_bytes());
        out[12..16].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        out[16..24].copy_from_slice(&self.sector_count.to_le_bytes());
        out[24..28].copy_from_slice(&self.chs_cylinders.to_le_bytes());
        out[28..32].copy_from_slice(&self.chs_heads.to_le_bytes());
        out[32..36].copy_from_slice(&self.chs_sectors.to_le_bytes());
        out[36] = self.media_flags;
        out[40..44].copy_from_slice(&self.palm_start_sector.to_le_bytes());
        out[48..52].copy_from_slice(&self.smart_start_sector.to_le_bytes());
        out[52] = self.compression_level;
        out[56..60].copy_from_slice(&self.error_block_size.to_le_bytes());
        out[64..80].copy_from_slice(&self.guid);
        let checksum = adler32(&out[..VOLUME_SECTION_SIZE - 4]);
        out[VOLUME_SECTION_SIZE - 4..].copy_from_slice(&checksum.to_le_bytes());
        out
    }

    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.sectors_per_chunk as u64 * self.bytes_per_sector as u64
    }

    #[inline]
    pub fn image_size(&self) -> u64 {
        self.sector_count.saturating_mul(self.bytes_per_sector as u64)
    }
}

/// The fixed prefix of a `table` section body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHeader {
    pub entry_count: u32,
    pub base_offset: u64,
    pub checksum_ok: bool,
}

impl TableHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TABLE_HEADER_SIZE {
            return Err(CoreError::InvalidFormat(format!(
                "table header needs {TABLE_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            entry_count: le_u32(bytes, 0),
            base_offset: le_u64(bytes, 8),
            checksum_ok: adler32(&bytes[..20]) == le_u32(bytes, 20),
        })
    }

    pub fn encode(entry_count: u32, base_offset: u64) -> [u8; TABLE_HEADER_SIZE] {
        let mut out = [0u8; TABLE_HEADER_SIZE];
        out[..4].copy_from_slice(&entry_count.to_le_bytes());
        out[8..16].copy_from_slice(&base_offset.to_le_bytes());
        let checksum = adler32(&out[..20]);
        out[20..24].copy_from_slice(&checksum.to_le_bytes());
        out
    }
}

/// Splits a raw table entry into its offset and compression flag.
#[inline]
pub fn decode_entry(raw: u32) -> (u64, bool) {
    ((raw & OFFSET_MASK) as u64, raw & COMPRESSED_FLAG != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header() {
        let bytes = FileHeader { segment_number: 7 }.encode();
        assert_eq!(&bytes[..8], b"EVF\x09\x0d\x0a\xff\x00");
        assert_eq!(FileHeader::parse(&bytes).unwrap().segment_number, 7);

        let mut bad = bytes;
        bad[0] = b'X';
        assert!(matches!(
            FileHeader::parse(&bad),
            Err(CoreError::InvalidFormat(_))
        ));
        assert!(FileHeader::parse(&bytes[..5]).is_err());
    }

    #[test]
    fn test_section_descriptor() {
        let bytes = SectionDescriptor::encode("table", 4242, 1000);
        let desc = SectionDescriptor::parse(&bytes).unwrap();
        assert_eq!(desc.name(), "table");
        assert_eq!(desc.kind(), SectionKind::Table);
        assert_eq!(desc.next, 4242);
        assert_eq!(desc.size, 1000);
        assert_eq!(desc.body_size(), 1000 - 76);
        assert!(desc.checksum_ok);

        let mut corrupt = bytes;
        corrupt[20] ^= 0xFF;
        assert!(!SectionDescriptor::parse(&corrupt).unwrap().checksum_ok);
    }

    #[test]
    fn test_unknown_section_kind() {
        let desc = SectionDescriptor::parse(&SectionDescriptor::encode("ltree", 0, 76)).unwrap();
        assert_eq!(desc.kind(), SectionKind::Other);
        assert_eq!(desc.body_size(), 0);
    }

    #[test]
    fn test_volume_section() {
        let volume = VolumeSection {
            media_type: 1,
            chunk_count: 4,
            sectors_per_chunk: 64,
            bytes_per_sector: 512,
            sector_count: 200,
            compression_level: 1,
            error_block_size: 64,
            guid: [0xAB; 16],
            ..Default::default()
        };
        let bytes = volume.encode();
        assert_eq!(bytes.len(), VOLUME_SECTION_SIZE);
        assert_eq!(
            le_u32(&bytes, VOLUME_SECTION_SIZE - 4),
            adler32(&bytes[..VOLUME_SECTION_SIZE - 4])
        );

        let parsed = VolumeSection::parse(&bytes).unwrap();
        assert_eq!(parsed, volume);
        assert_eq!(parsed.chunk_size(), 32768);
        assert_eq!(parsed.image_size(), 102400);
        assert!(VolumeSection::parse(&bytes[..40]).is_err());
    }

    #[test]
    fn test_table_header_and_entries() {
        let header = TableHeader::parse(&TableHeader::encode(16, 0x1000)).unwrap();
        assert_eq!(header.entry_count, 16);
        assert_eq!(header.base_offset, 0x1000);
        assert!(header.checksum_ok);

        assert_eq!(decode_entry(0x8000_004C), (0x4C, true));
        assert_eq!(decode_entry(0x0000_004C), (0x4C, false));
    }
}
