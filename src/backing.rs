//! Backing-store access for card media.
//!
//! A card exclusively owns one storage backend for its whole lifetime.
//! Images use raw linear byte addressing; erased media reads 0xff, so
//! non-sparse image creation fills with that pattern.

use std::fs;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::warn;

/// Fill pattern of erased flash media.
pub const ERASED_BYTE: u8 = 0xff;

const FILL_CHUNK: usize = 64 * 1024;

/// Byte-addressed storage behind a card.
///
/// Reads beyond the end of the medium are legal and yield no bytes; the
/// card model pads them with [`ERASED_BYTE`]. Writes beyond the end are
/// clipped.
pub trait Storage {
    fn size(&self) -> u64;
    fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&mut self, addr: u64, buf: &[u8]) -> io::Result<usize>;
}

/// A raw image file.
pub struct FileImage {
    file: fs::File,
    size: u64,
}

impl FileImage {
    /// Open an existing image read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileImage> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(FileImage { file, size })
    }

    /// Create a fresh image of `size` bytes. Sparse images rely on the
    /// filesystem to materialize holes (which read as zero, not as erased
    /// media); dense images are filled with [`ERASED_BYTE`].
    pub fn create<P: AsRef<Path>>(path: P, size: u64, sparse: bool) -> io::Result<FileImage> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        if sparse {
            file.set_len(size)?;
        } else {
            let chunk = [ERASED_BYTE; FILL_CHUNK];
            let mut remaining = size;
            while remaining > 0 {
                let n = remaining.min(FILL_CHUNK as u64) as usize;
                file.write_all(&chunk[..n])?;
                remaining -= n as u64;
            }
        }
        Ok(FileImage { file, size })
    }
}

impl Storage for FileImage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        if addr >= self.size {
            return Ok(0);
        }
        let count = buf.len().min((self.size - addr) as usize);
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.read_exact(&mut buf[..count])?;
        Ok(count)
    }

    fn write_at(&mut self, addr: u64, buf: &[u8]) -> io::Result<usize> {
        if addr >= self.size {
            return Ok(0);
        }
        let count = buf.len().min((self.size - addr) as usize);
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.write_all(&buf[..count])?;
        Ok(count)
    }
}

/// An in-memory image, initialized to erased media. Backs the tests.
pub struct MemImage {
    data: Vec<u8>,
}

impl MemImage {
    pub fn new(size: usize) -> MemImage {
        MemImage { data: vec![ERASED_BYTE; size] }
    }

    pub fn from_vec(data: Vec<u8>) -> MemImage {
        MemImage { data }
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl Storage for MemImage {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        if addr >= self.size() {
            return Ok(0);
        }
        let addr = addr as usize;
        let count = buf.len().min(self.data.len() - addr);
        buf[..count].copy_from_slice(&self.data[addr..addr + count]);
        Ok(count)
    }

    fn write_at(&mut self, addr: u64, buf: &[u8]) -> io::Result<usize> {
        if addr >= self.size() {
            return Ok(0);
        }
        let addr = addr as usize;
        let count = buf.len().min(self.data.len() - addr);
        self.data[addr..addr + count].copy_from_slice(&buf[..count]);
        Ok(count)
    }
}

/// Read `buf.len()` bytes at `addr`, padding anything past the end of the
/// medium (or lost to an I/O error) with the erased pattern.
pub(crate) fn read_filling(store: &mut dyn Storage, addr: u64, buf: &mut [u8]) {
    match store.read_at(addr, buf) {
        Ok(n) => buf[n..].fill(ERASED_BYTE),
        Err(err) => {
            warn!("backing store read at 0x{addr:08x} failed: {err}");
            buf.fill(ERASED_BYTE);
        }
    }
}

#[test]
fn test_mem_image_bounds() {
    let mut img = MemImage::new(1024);
    assert_eq!(img.write_at(1000, &[0u8; 64]).unwrap(), 24);
    let mut buf = [0u8; 64];
    assert_eq!(img.read_at(1000, &mut buf).unwrap(), 24);
    assert_eq!(&buf[..24], &[0u8; 24]);
    assert_eq!(img.read_at(2048, &mut buf).unwrap(), 0);
}

#[test]
fn test_read_filling_pads_erased() {
    let mut img = MemImage::new(16);
    let mut buf = [0u8; 32];
    read_filling(&mut img, 8, &mut buf);
    assert_eq!(&buf[..8], &[ERASED_BYTE; 8]);
    assert_eq!(&buf[8..], &[ERASED_BYTE; 24]);
}
