#![forbid(unsafe_code)]

use std::{
    fs::File,
    io::{self, ErrorKind},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use crate::types::{ApfsError, Paddr, Result};

/// Random-access source of fixed-size blocks addressed by physical block number.
///
/// Implementations must tolerate concurrent reads of different addresses.
pub trait BlockSource: Send + Sync + 'static {
    /// Size in bytes of every block this source serves.
    fn block_size(&self) -> usize;

    /// Reads the block at `paddr` into `dst`, which is exactly `block_size()` long.
    fn read_block(&self, paddr: Paddr, dst: &mut [u8]) -> Result<()>;

    /// Reads the block at `paddr` into a freshly allocated buffer.
    fn read_block_vec(&self, paddr: Paddr) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size()];
        self.read_block(paddr, &mut buf)?;
        Ok(buf)
    }
}

fn block_offset(paddr: Paddr, block_size: usize) -> Result<u64> {
    paddr
        .0
        .checked_mul(block_size as u64)
        .ok_or(ApfsError::Invalid("block address overflows device offset"))
}

#[cfg(unix)]
/// Unix positioned reads.
pub mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    /// Reads exact number of bytes at offset using Unix pread semantics.
    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
/// Windows positioned reads.
pub mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    /// Reads exact number of bytes at offset using Windows seek_read semantics.
    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }
}

/// Read-only block source backed by a container image file.
#[derive(Clone)]
pub struct FileBlockSource {
    inner: Arc<File>,
    block_size: usize,
    base_offset: u64,
}

impl FileBlockSource {
    /// Wraps an open file whose block 0 starts at byte 0.
    pub fn new(file: File, block_size: usize) -> Result<Self> {
        Self::with_offset(file, block_size, 0)
    }

    /// Wraps an open file whose block 0 starts at `base_offset` (e.g. a partition start).
    pub fn with_offset(file: File, block_size: usize, base_offset: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(ApfsError::Invalid("block size must be non-zero"));
        }
        Ok(Self {
            inner: Arc::new(file),
            block_size,
            base_offset,
        })
    }

    /// Opens `path` read-only.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let file = File::open(path).map_err(ApfsError::from)?;
        Self::new(file, block_size)
    }

    /// Returns the number of whole blocks available after the base offset.
    pub fn block_count(&self) -> Result<u64> {
        let len = self.inner.metadata().map_err(ApfsError::from)?.len();
        Ok(len.saturating_sub(self.base_offset) / self.block_size as u64)
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(&self.inner, off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(&self.inner, off, dst)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "FileBlockSource unsupported on this platform",
        ))
    }
}

impl BlockSource for FileBlockSource {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, paddr: Paddr, dst: &mut [u8]) -> Result<()> {
        if dst.len() != self.block_size {
            return Err(ApfsError::Invalid("destination is not one block long"));
        }
        let off = block_offset(paddr, self.block_size)?
            .checked_add(self.base_offset)
            .ok_or(ApfsError::Invalid("block address overflows device offset"))?;
        tracing::trace!(paddr = paddr.0, off, "block read");
        self.read_exact(off, dst).map_err(ApfsError::from)
    }
}

/// In-memory block image, mostly useful for tests and synthetic containers.
///
/// Counts every successful read so callers can observe traversal cost.
pub struct MemBlockSource {
    image: RwLock<Vec<u8>>,
    block_size: usize,
    reads: AtomicU64,
}

impl MemBlockSource {
    /// Creates an image of `block_count` zeroed blocks.
    pub fn new(block_size: usize, block_count: usize) -> Result<Self> {
        let len = block_size
            .checked_mul(block_count)
            .ok_or(ApfsError::Invalid("image size overflows"))?;
        Self::from_image(vec![0u8; len], block_size)
    }

    /// Wraps an existing image; a trailing partial block is unreadable.
    pub fn from_image(image: Vec<u8>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(ApfsError::Invalid("block size must be non-zero"));
        }
        Ok(Self {
            image: RwLock::new(image),
            block_size,
            reads: AtomicU64::new(0),
        })
    }

    /// Overwrites block `paddr`, growing the image if needed.
    pub fn write_block(&self, paddr: Paddr, src: &[u8]) -> Result<()> {
        if src.len() != self.block_size {
            return Err(ApfsError::Invalid("source is not one block long"));
        }
        let start = block_offset(paddr, self.block_size)? as usize;
        let mut image = self.image.write();
        if image.len() < start + self.block_size {
            image.resize(start + self.block_size, 0);
        }
        image[start..start + self.block_size].copy_from_slice(src);
        Ok(())
    }

    /// Number of blocks served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of whole blocks in the image.
    pub fn block_count(&self) -> u64 {
        (self.image.read().len() / self.block_size) as u64
    }
}

impl BlockSource for MemBlockSource {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, paddr: Paddr, dst: &mut [u8]) -> Result<()> {
        if dst.len() != self.block_size {
            return Err(ApfsError::Invalid("destination is not one block long"));
        }
        let start = block_offset(paddr, self.block_size)?;
        let image = self.image.read();
        let end = start
            .checked_add(self.block_size as u64)
            .ok_or(ApfsError::Invalid("block address overflows device offset"))?;
        if end > image.len() as u64 {
            return Err(ApfsError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "block address beyond image",
            )));
        }
        dst.copy_from_slice(&image[start as usize..end as usize]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
