#![forbid(unsafe_code)]
//! Block device port and block-granular I/O.
//!
//! The port exposes sector geometry and byte-addressed reads/writes;
//! `BlockIo` layers volume-block addressing on top and chunks every
//! transfer to the device's reported maximum.

use esfs_error::{EsfsError, Result};
use esfs_types::{BlockSize, ByteOffset, BOOT_SUPER_BLOCK_SIZE, SUPERBLOCK_OFFSET};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed block device with sector geometry.
///
/// All accesses are sector-aligned at the hardware level; the port
/// implementations here accept arbitrary byte ranges and leave
/// block-alignment to the caller. Callers must keep each access within
/// `max_access_sector_count()` sectors; `BlockIo` does this chunking.
pub trait BlockDevicePort: Send + Sync {
    /// Sector size in bytes.
    fn sector_size(&self) -> u64;

    /// Largest number of sectors a single access may cover.
    fn max_access_sector_count(&self) -> u64;

    /// Total device length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_bounds(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let len = u64::try_from(len)
        .map_err(|_| EsfsError::Format("access length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| EsfsError::Format("access range overflows u64".to_owned()))?;
    if end.0 > device_len {
        return Err(EsfsError::Format(format!(
            "access out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

// ── File-backed device ──────────────────────────────────────────────────────

const FILE_DEVICE_SECTOR_SIZE: u64 = 512;
const FILE_DEVICE_MAX_ACCESS_SECTORS: u64 = 256;

/// File-backed device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position.
#[derive(Debug, Clone)]
pub struct FileDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileDevice {
    /// Open an existing volume image, read-write if permitted.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) a volume image of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }
}

impl BlockDevicePort for FileDevice {
    fn sector_size(&self) -> u64 {
        FILE_DEVICE_SECTOR_SIZE
    }

    fn max_access_sector_count(&self) -> u64 {
        FILE_DEVICE_MAX_ACCESS_SECTORS
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(EsfsError::ReadOnly);
        }
        check_bounds(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── RAM-backed device ───────────────────────────────────────────────────────

/// RAM-backed device, used by tests and as a ramdisk port.
#[derive(Debug)]
pub struct MemoryDevice {
    data: Mutex<Vec<u8>>,
    sector_size: u64,
    max_access_sectors: u64,
}

impl MemoryDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; len]),
            sector_size: FILE_DEVICE_SECTOR_SIZE,
            max_access_sectors: FILE_DEVICE_MAX_ACCESS_SECTORS,
        }
    }

    /// Override the reported transfer limit (tests exercise small limits).
    #[must_use]
    pub fn with_max_access_sectors(mut self, sectors: u64) -> Self {
        self.max_access_sectors = sectors;
        self
    }

    /// Snapshot a byte range, for raw inspection in tests.
    #[must_use]
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        data[offset..offset + len].to_vec()
    }
}

impl BlockDevicePort for MemoryDevice {
    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn max_access_sector_count(&self) -> u64 {
        self.max_access_sectors
    }

    fn len_bytes(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        check_bounds(offset, buf.len(), data.len() as u64)?;
        let start = usize::try_from(offset.0)
            .map_err(|_| EsfsError::Format("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let len = data.len() as u64;
        check_bounds(offset, buf.len(), len)?;
        let start = usize::try_from(offset.0)
            .map_err(|_| EsfsError::Format("offset overflows usize".to_owned()))?;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block-granular I/O ──────────────────────────────────────────────────────

/// Block-addressed view of a device, chunking transfers to the port's
/// reported maximum.
#[derive(Clone)]
pub struct BlockIo {
    dev: Arc<dyn BlockDevicePort>,
    block_size: BlockSize,
}

impl BlockIo {
    pub fn new(dev: Arc<dyn BlockDevicePort>, block_size: BlockSize) -> Result<Self> {
        if block_size.get() % dev.sector_size() != 0 {
            return Err(EsfsError::Format(format!(
                "block size {block_size} is not a multiple of the sector size {}",
                dev.sector_size()
            )));
        }
        Ok(Self { dev, block_size })
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size.get()
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevicePort> {
        &self.dev
    }

    /// Largest byte count a single port access may cover.
    #[must_use]
    pub fn max_transfer_bytes(&self) -> u64 {
        (self.dev.sector_size() * self.dev.max_access_sector_count()).max(self.block_size.get())
    }

    /// Largest run of whole blocks a single port access may cover.
    #[must_use]
    pub fn max_blocks_per_access(&self) -> u64 {
        (self.max_transfer_bytes() / self.block_size.get()).max(1)
    }

    fn byte_offset(&self, block: u64, offset_into_block: u64) -> Result<ByteOffset> {
        let base = self
            .block_size
            .block_to_byte(block)
            .and_then(|b| b.checked_add(offset_into_block))
            .ok_or_else(|| EsfsError::Format("block offset overflows u64".to_owned()))?;
        Ok(ByteOffset(base))
    }

    /// Read `buf.len()` bytes starting `offset_into_block` bytes into `block`.
    pub fn read_at(&self, block: u64, offset_into_block: u64, buf: &mut [u8]) -> Result<()> {
        let mut offset = self.byte_offset(block, offset_into_block)?;
        let max = usize::try_from(self.max_transfer_bytes())
            .map_err(|_| EsfsError::Format("transfer limit overflows usize".to_owned()))?;
        trace!(target: "esfs::block", block, len = buf.len(), "read");
        for chunk in buf.chunks_mut(max) {
            self.dev.read_exact_at(offset, chunk)?;
            offset = offset
                .checked_add(chunk.len() as u64)
                .ok_or_else(|| EsfsError::Format("read range overflows u64".to_owned()))?;
        }
        Ok(())
    }

    /// Write `buf` starting `offset_into_block` bytes into `block`.
    pub fn write_at(&self, block: u64, offset_into_block: u64, buf: &[u8]) -> Result<()> {
        let mut offset = self.byte_offset(block, offset_into_block)?;
        let max = usize::try_from(self.max_transfer_bytes())
            .map_err(|_| EsfsError::Format("transfer limit overflows usize".to_owned()))?;
        trace!(target: "esfs::block", block, len = buf.len(), "write");
        for chunk in buf.chunks(max) {
            self.dev.write_all_at(offset, chunk)?;
            offset = offset
                .checked_add(chunk.len() as u64)
                .ok_or_else(|| EsfsError::Format("write range overflows u64".to_owned()))?;
        }
        Ok(())
    }

    /// Read whole blocks; `buf.len()` must be a multiple of the block size.
    pub fn read_blocks(&self, first_block: u64, buf: &mut [u8]) -> Result<()> {
        self.read_at(first_block, 0, buf)
    }

    /// Write whole blocks.
    pub fn write_blocks(&self, first_block: u64, buf: &[u8]) -> Result<()> {
        self.write_at(first_block, 0, buf)
    }

    /// Write `count` zeroed blocks starting at `first_block`.
    pub fn write_zero_blocks(&self, first_block: u64, count: u64) -> Result<()> {
        let block_size = self.block_size.get();
        let run = self.max_blocks_per_access().min(count.max(1));
        let zeroes = vec![
            0_u8;
            usize::try_from(run * block_size)
                .map_err(|_| EsfsError::Format("zero run overflows usize".to_owned()))?
        ];
        let mut block = first_block;
        let mut remaining = count;
        while remaining > 0 {
            let this_run = remaining.min(run);
            let len = usize::try_from(this_run * block_size)
                .map_err(|_| EsfsError::Format("zero run overflows usize".to_owned()))?;
            self.write_blocks(block, &zeroes[..len])?;
            block += this_run;
            remaining -= this_run;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

// ── Superblock region access ────────────────────────────────────────────────

/// Read the 8 KiB primary superblock region (byte offset 8192).
pub fn read_superblock_region(dev: &dyn BlockDevicePort) -> Result<Vec<u8>> {
    let mut region = vec![
        0_u8;
        usize::try_from(BOOT_SUPER_BLOCK_SIZE)
            .map_err(|_| EsfsError::Format("region size overflows usize".to_owned()))?
    ];
    dev.read_exact_at(ByteOffset(SUPERBLOCK_OFFSET), &mut region)?;
    Ok(region)
}

/// Write an 8 KiB superblock region at `offset`.
pub fn write_superblock_region(
    dev: &dyn BlockDevicePort,
    offset: ByteOffset,
    region: &[u8],
) -> Result<()> {
    if region.len() as u64 != BOOT_SUPER_BLOCK_SIZE {
        return Err(EsfsError::Format(format!(
            "superblock region must be {BOOT_SUPER_BLOCK_SIZE} bytes, got {}",
            region.len()
        )));
    }
    dev.write_all_at(offset, region)
}
