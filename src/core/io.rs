//! Storage media the config store runs on
//!
//! A medium is a flat, chunk-addressed byte range. Program and erase
//! operations work on whole chunks; erased bytes read back as `0xFF`.

use crate::error::{CfstoreError, Result};
use crate::flags::{DataRetentionLevel, Ddsp};
use crate::record::CHUNK_SIZE;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Value of an erased byte
pub const ERASED_BYTE: u8 = 0xFF;

/// Identity and capabilities of one detected medium
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub id: u32,
    pub drl: DataRetentionLevel,
    pub ddsp: Ddsp,
}

impl Default for StorageDescriptor {
    fn default() -> Self {
        StorageDescriptor {
            id: 0,
            drl: DataRetentionLevel::NonVolatileInternal,
            ddsp: Ddsp::empty(),
        }
    }
}

/// Chunk-addressed, power-loss-prone storage
pub trait StorageMedium: Send {
    fn descriptor(&self) -> &StorageDescriptor;

    /// Usable size in bytes, a multiple of the chunk size
    fn capacity(&self) -> u64;

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write whole chunks at a chunk-aligned offset
    fn program(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Reset whole chunks to the erased state
    fn erase(&mut self, offset: u64, len: u64) -> Result<()>;

    fn sync(&mut self) -> Result<()>;
}

fn check_aligned(offset: u64, len: u64) -> Result<()> {
    let chunk = CHUNK_SIZE as u64;
    if offset % chunk != 0 || len % chunk != 0 {
        return Err(CfstoreError::Misaligned { offset, len });
    }
    Ok(())
}

fn check_range(capacity: u64, offset: u64, len: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(CfstoreError::InvalidArgument(format!(
            "range {}+{} exceeds medium capacity {}",
            offset, len, capacity
        ))),
    }
}

/// Byte image shared between a [`MemoryMedium`] and its observers
///
/// Cloning shares the same bytes, so a test can keep a copy, drop the store
/// (simulating power loss), tamper with the image and open a new store on
/// it.
#[derive(Debug, Clone)]
pub struct SharedImage(Arc<Mutex<Vec<u8>>>);

impl SharedImage {
    /// A fully erased image of `capacity` bytes, rounded down to whole chunks
    pub fn erased(capacity: usize) -> Self {
        let capacity = capacity / CHUNK_SIZE * CHUNK_SIZE;
        SharedImage(Arc::new(Mutex::new(vec![ERASED_BYTE; capacity])))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current bytes
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Overwrite raw bytes, bypassing alignment rules
    pub fn write_raw(&self, offset: usize, bytes: &[u8]) {
        let mut image = self.0.lock();
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// XOR one byte of the image with `mask`
    pub fn flip_bits(&self, offset: usize, mask: u8) {
        self.0.lock()[offset] ^= mask;
    }
}

/// RAM-backed medium
#[derive(Debug, Clone)]
pub struct MemoryMedium {
    image: SharedImage,
    descriptor: StorageDescriptor,
}

impl MemoryMedium {
    pub fn new(capacity: usize) -> Self {
        Self::with_image(SharedImage::erased(capacity), StorageDescriptor::default())
    }

    /// Attach to an existing image, e.g. after a simulated restart
    pub fn with_image(image: SharedImage, descriptor: StorageDescriptor) -> Self {
        MemoryMedium { image, descriptor }
    }

    pub fn with_descriptor(mut self, descriptor: StorageDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn image(&self) -> SharedImage {
        self.image.clone()
    }
}

impl StorageMedium for MemoryMedium {
    fn descriptor(&self) -> &StorageDescriptor {
        &self.descriptor
    }

    fn capacity(&self) -> u64 {
        self.image.len() as u64
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let image = self.image.0.lock();
        check_range(image.len() as u64, offset, buf.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&image[start..start + buf.len()]);
        Ok(())
    }

    fn program(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_aligned(offset, data.len() as u64)?;
        let mut image = self.image.0.lock();
        check_range(image.len() as u64, offset, data.len() as u64)?;
        let start = offset as usize;
        image[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<()> {
        check_aligned(offset, len)?;
        let mut image = self.image.0.lock();
        check_range(image.len() as u64, offset, len)?;
        let start = offset as usize;
        image[start..start + len as usize].fill(ERASED_BYTE);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File-backed medium of fixed capacity
pub struct FileMedium {
    file: File,
    path: PathBuf,
    capacity: u64,
    descriptor: StorageDescriptor,
}

impl FileMedium {
    /// Create (or truncate) a file and fill it with erased chunks
    pub fn create<P: AsRef<Path>>(
        path: P,
        capacity: u64,
        descriptor: StorageDescriptor,
    ) -> Result<Self> {
        check_aligned(0, capacity)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let erased = vec![ERASED_BYTE; CHUNK_SIZE * 256];
        let mut remaining = capacity as usize;
        while remaining > 0 {
            let n = remaining.min(erased.len());
            file.write_all(&erased[..n])?;
            remaining -= n;
        }
        file.flush()?;

        Ok(FileMedium {
            file,
            path: path.as_ref().to_path_buf(),
            capacity,
            descriptor,
        })
    }

    /// Open an existing image; its length must be a whole number of chunks
    pub fn open<P: AsRef<Path>>(path: P, descriptor: StorageDescriptor) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let capacity = file.metadata()?.len();
        check_aligned(0, capacity)?;

        Ok(FileMedium {
            file,
            path: path.as_ref().to_path_buf(),
            capacity,
            descriptor,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageMedium for FileMedium {
    fn descriptor(&self) -> &StorageDescriptor {
        &self.descriptor
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.capacity, offset, buf.len() as u64)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn program(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_aligned(offset, data.len() as u64)?;
        check_range(self.capacity, offset, data.len() as u64)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<()> {
        check_aligned(offset, len)?;
        check_range(self.capacity, offset, len)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&vec![ERASED_BYTE; len as usize])?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
