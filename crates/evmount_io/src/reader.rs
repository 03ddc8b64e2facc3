//! Positional reader for raw (dd) images and block devices.

use evmount_core::{BlockSource, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A read-only source over a raw image file or device.
///
/// `DiskReader` works on anything that can be opened and seeked:
/// - Raw image files (`.dd`, `.raw`, `.img`)
/// - Block devices (`/dev/sdb`, `/dev/nvme0n1p2`)
///
/// The file is only ever opened read-only.
///
/// # Example
///
/// ```ignore
/// use evmount_io::DiskReader;
/// use evmount_core::BlockSource;
///
/// let mut reader = DiskReader::new("evidence.dd")?;
/// let mut mbr = vec![0u8; 512];
/// reader.read_at(0, &mut mbr)?;
/// ```
pub struct DiskReader {
    file: File,
    path: PathBuf,
    size: u64,
}

impl DiskReader {
    /// Opens `path` read-only and records its size.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the raw image or device
    ///
    /// # Returns
    ///
    /// The reader, or an error if the file cannot be opened or sized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(false).open(path)?;

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{Advice, fadvise};

            let _ = fadvise(&file, 0, None, Advice::Random);
        }

        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }
}

impl BlockSource for DiskReader {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let want = buffer.len().min((self.size - offset) as usize);
        self.file.seek(SeekFrom::Start(offset))?;

        let mut done = 0;
        while done < want {
            match self.file.read(&mut buffer[done..want]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn info(&self) -> String {
        format!(
            "Raw image\n  Path:       {}\n  Image size: {} bytes\n",
            self.path.display(),
            self.size
        )
    }
}
