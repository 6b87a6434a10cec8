//! VHD image: open, dispatch by disk type, close
//!
//! An `Image` owns its backing file, footer, and (for sparse disks) the
//! dynamic header and allocation table. Reads and writes take `&mut self`,
//! so at most one physical operation is in flight per image and the
//! multi-step sparse write sequence cannot interleave with another.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::bat::AllocationTable;
use crate::error::{Result, VhdError};
use crate::fixed::FixedDisk;
use crate::footer::Footer;
use crate::format::{DiskType, BLOCK_SIZE, FOOTER_SIZE, LOCATOR_COUNT};
use crate::header::Header;
use crate::io::{file_len, read_exact_at};
use crate::sparse::{block_range_len, SparseDisk};

const BLOCK: u64 = BLOCK_SIZE as u64;

/// Options for opening an image
#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Whether to reject footers and headers whose checksum does not match
    pub verify_checksums: bool,
    /// Reject writes; `open_path` opens the file read-only
    pub read_only: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            read_only: false,
        }
    }
}

/// Per-type backend state
#[derive(Debug, Clone)]
enum Disk {
    Fixed(FixedDisk),
    Dynamic(SparseDisk),
    Differencing(SparseDisk),
}

/// An opened VHD image
#[derive(Debug)]
pub struct Image<F> {
    file: Option<F>,
    footer: Footer,
    disk: Disk,
    options: ImageOptions,
}

impl Image<File> {
    /// Open the image at `path`
    pub fn open_path<P: AsRef<Path>>(path: P, options: ImageOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(path)?;
        Self::open_with_options(file, options)
    }
}

impl<F: Read + Seek> Image<F> {
    /// Open an image with default options (checksum verification enabled)
    pub fn open(file: F) -> Result<Self> {
        Self::open_with_options(file, ImageOptions::default())
    }

    /// Open an image with custom options
    pub fn open_with_options(mut file: F, options: ImageOptions) -> Result<Self> {
        let len = file_len(&mut file)?;
        if len < FOOTER_SIZE as u64 {
            return Err(VhdError::InvalidFormat(format!(
                "file of {len} bytes is too small for a footer"
            )));
        }

        let mut raw = [0u8; FOOTER_SIZE];
        read_exact_at(&mut file, len - FOOTER_SIZE as u64, &mut raw)?;
        let footer = Footer::parse(&raw, 0)?;

        if let Err(e) = footer.verify_checksum() {
            if options.verify_checksums {
                return Err(e);
            }
            warn!(error = %e, "ignoring footer checksum mismatch");
        }

        let disk = match footer.disk_type {
            DiskType::Fixed => Disk::Fixed(FixedDisk::new(&footer)),
            DiskType::Dynamic => {
                Disk::Dynamic(SparseDisk::load(&mut file, &footer, options.verify_checksums)?)
            }
            DiskType::Differencing => {
                Disk::Differencing(SparseDisk::load(&mut file, &footer, options.verify_checksums)?)
            }
            other => return Err(VhdError::UnknownDiskType(other.as_u32())),
        };

        let table_entries = match &disk {
            Disk::Dynamic(d) | Disk::Differencing(d) => d.allocation_table().len(),
            Disk::Fixed(_) => 0,
        };
        debug!(
            disk_type = %footer.disk_type,
            file_len = len,
            current_size = footer.current_size,
            table_entries,
            "opened image"
        );

        Ok(Image {
            file: Some(file),
            footer,
            disk,
            options,
        })
    }

    /// Get the footer
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// Get the dynamic header, if any
    pub fn header(&self) -> Option<&Header> {
        self.sparse().map(SparseDisk::header)
    }

    /// Get the allocation table, if any
    pub fn allocation_table(&self) -> Option<&AllocationTable> {
        self.sparse().map(SparseDisk::allocation_table)
    }

    /// Sparse addressing state of Dynamic and Differencing disks
    pub fn sparse(&self) -> Option<&SparseDisk> {
        match &self.disk {
            Disk::Fixed(_) => None,
            Disk::Dynamic(d) | Disk::Differencing(d) => Some(d),
        }
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    /// Current disk size in bytes
    pub fn size(&self) -> u64 {
        self.footer.current_size
    }

    /// Number of 512-byte blocks
    pub fn block_count(&self) -> u64 {
        self.footer.current_size / BLOCK
    }

    pub fn options(&self) -> &ImageOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Read `buf.len()` bytes at logical `position`
    ///
    /// Returns the number of bytes read, which is always the full buffer.
    pub fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.file.as_mut().ok_or(VhdError::Closed)?;
        match &self.disk {
            Disk::Fixed(d) => d.read(file, position, buf)?,
            Disk::Dynamic(d) => d.read(file, position, buf)?,
            Disk::Differencing(_) => {
                return Err(VhdError::Unsupported("differencing disk reads".into()))
            }
        }
        Ok(buf.len())
    }

    /// Read blocks `[first_lba, last_lba)`
    pub fn read_blocks(&mut self, first_lba: u64, last_lba: u64) -> Result<Vec<u8>> {
        if last_lba < first_lba {
            return Err(VhdError::InvalidArgument(format!(
                "block range {first_lba}..{last_lba} is reversed"
            )));
        }

        let file = self.file.as_mut().ok_or(VhdError::Closed)?;
        match &self.disk {
            Disk::Fixed(d) => {
                if last_lba > self.footer.current_size / BLOCK {
                    return Err(VhdError::InvalidArgument(format!(
                        "block {last_lba} beyond disk size {}",
                        self.footer.current_size
                    )));
                }
                let mut buf = vec![0u8; block_range_len(first_lba, last_lba)?];
                d.read(file, first_lba * BLOCK, &mut buf)?;
                Ok(buf)
            }
            Disk::Dynamic(d) => d.read_blocks(file, first_lba, last_lba),
            Disk::Differencing(_) => Err(VhdError::Unsupported("differencing disk reads".into())),
        }
    }

    /// Read the block bitmap of an allocated sector
    pub fn read_sector_bitmap(&mut self, sector: u64) -> Result<Vec<u8>> {
        let file = self.file.as_mut().ok_or(VhdError::Closed)?;
        match &self.disk {
            Disk::Fixed(_) => Err(VhdError::InvalidArgument(
                "fixed disks have no sector bitmaps".into(),
            )),
            Disk::Dynamic(d) | Disk::Differencing(d) => d.read_sector_bitmap(file, sector),
        }
    }

    /// Read the raw data of parent locator slot `index`
    pub fn parent_locator_data(&mut self, index: usize) -> Result<Vec<u8>> {
        if index >= LOCATOR_COUNT {
            return Err(VhdError::InvalidArgument(format!(
                "locator index {index} out of range"
            )));
        }
        let locator = match &self.disk {
            Disk::Differencing(d) => d.header().parent_locators[index],
            _ => {
                return Err(VhdError::InvalidArgument(
                    "parent locators belong to differencing disks".into(),
                ))
            }
        };
        if locator.is_empty() {
            return Err(VhdError::InvalidArgument(format!(
                "locator slot {index} is empty"
            )));
        }

        let file = self.file.as_mut().ok_or(VhdError::Closed)?;
        let mut data = vec![0u8; locator.data_length as usize];
        read_exact_at(file, locator.data_offset, &mut data)?;
        Ok(data)
    }

    /// Decode every parent locator that holds a path
    pub fn parent_paths(&mut self) -> Result<Vec<String>> {
        let locators: Vec<_> = match &self.disk {
            Disk::Differencing(d) => d.header().parent_locators().map(|(i, l)| (i, *l)).collect(),
            _ => return Ok(Vec::new()),
        };

        let mut paths = Vec::new();
        for (index, locator) in locators {
            let data = self.parent_locator_data(index)?;
            if let Some(path) = locator.decode_path(&data) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Release the backing file; later operations fail with `Closed`
    pub fn close(&mut self) -> Result<()> {
        self.file.take().ok_or(VhdError::Closed)?;
        debug!("closed image");
        Ok(())
    }

    /// Borrow the backing file, `None` once closed
    pub fn get_ref(&self) -> Option<&F> {
        self.file.as_ref()
    }

    /// Consume the image, returning the backing file if still open
    pub fn into_inner(self) -> Option<F> {
        self.file
    }
}

impl<F: Read + Write + Seek> Image<F> {
    fn check_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(VhdError::InvalidArgument("image opened read-only".into()));
        }
        Ok(())
    }

    /// Write `buf` at logical `position`
    ///
    /// Dynamic disks allocate sectors on demand and grow when the write
    /// ends past the current size. Returns the number of bytes written.
    pub fn write_at(&mut self, position: u64, buf: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let file = self.file.as_mut().ok_or(VhdError::Closed)?;
        match &mut self.disk {
            Disk::Fixed(d) => d.write(file, position, buf)?,
            Disk::Dynamic(d) => d.write(file, &mut self.footer, position, buf)?,
            Disk::Differencing(_) => {
                return Err(VhdError::Unsupported("differencing disk writes".into()))
            }
        }
        Ok(buf.len())
    }

    /// Write whole 512-byte blocks starting at `lba`
    pub fn write_blocks(&mut self, lba: u64, data: &[u8]) -> Result<usize> {
        if data.len() as u64 % BLOCK != 0 {
            return Err(VhdError::InvalidArgument(format!(
                "{} bytes is not a whole number of blocks",
                data.len()
            )));
        }
        let position = lba
            .checked_mul(BLOCK)
            .ok_or_else(|| VhdError::InvalidArgument(format!("block {lba} out of range")))?;
        self.write_at(position, data)
    }

    /// Replace the block bitmap of an allocated sector
    pub fn write_sector_bitmap(&mut self, sector: u64, bitmap: &[u8]) -> Result<()> {
        self.check_writable()?;
        let file = self.file.as_mut().ok_or(VhdError::Closed)?;
        match &self.disk {
            Disk::Fixed(_) => Err(VhdError::InvalidArgument(
                "fixed disks have no sector bitmaps".into(),
            )),
            Disk::Dynamic(d) | Disk::Differencing(d) => d.write_sector_bitmap(file, sector, bitmap),
        }
    }

    /// Grow a dynamic disk to `new_size` bytes (rounded up to 512)
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        self.check_writable()?;
        let file = self.file.as_mut().ok_or(VhdError::Closed)?;
        match &mut self.disk {
            Disk::Dynamic(d) => {
                if new_size < self.footer.current_size {
                    return Err(VhdError::InvalidArgument(format!(
                        "cannot shrink disk from {} to {new_size} bytes",
                        self.footer.current_size
                    )));
                }
                if new_size == self.footer.current_size {
                    return Ok(());
                }
                d.grow(file, &mut self.footer, new_size)
            }
            Disk::Fixed(_) => Err(VhdError::Unsupported("resizing fixed disks".into())),
            Disk::Differencing(_) => {
                Err(VhdError::Unsupported("resizing differencing disks".into()))
            }
        }
    }

    /// Flush the backing file
    pub fn flush(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(VhdError::Closed)?;
        file.flush()?;
        Ok(())
    }
}

/// Open a VHD file read-write with default options
pub fn open<P: AsRef<Path>>(path: P) -> Result<Image<File>> {
    Image::open_path(path, ImageOptions::default())
}

/// Check if a file ends with a VHD footer
pub fn is_vhd<P: AsRef<Path>>(path: P) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let Ok(len) = file_len(&mut file) else {
        return false;
    };
    let mut raw = [0u8; FOOTER_SIZE];
    len >= FOOTER_SIZE as u64
        && read_exact_at(&mut file, len - FOOTER_SIZE as u64, &mut raw).is_ok()
        && Footer::parse(&raw, 0).is_ok()
}
