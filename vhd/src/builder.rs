//! Creation of new Fixed and Dynamic images
//!
//! Dynamic layout: footer copy at 0, header at 512, allocation table at
//! 1536 (padded with free entries to a 512-byte boundary), trailing
//! footer. No sectors are allocated.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;
use uuid::Uuid;

use crate::bat::AllocationTable;
use crate::error::{Result, VhdError};
use crate::footer::Footer;
use crate::format::{DiskType, BLOCK_SIZE, DEFAULT_SECTOR_SIZE, FOOTER_SIZE, HEADER_SIZE};
use crate::header::Header;
use crate::image::{Image, ImageOptions};
use crate::sparse::padded_table;

/// Offset of the allocation table in a new dynamic image
const TABLE_OFFSET: u64 = (FOOTER_SIZE + HEADER_SIZE) as u64;

/// Builder for creating VHD files
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    disk_type: DiskType,
    size: u64,
    sector_size: u32,
    unique_id: Option<Uuid>,
    timestamp: Option<u32>,
    creator_application: Option<[u8; 4]>,
}

impl ImageBuilder {
    fn new(disk_type: DiskType, size: u64) -> Self {
        let block = BLOCK_SIZE as u64;
        ImageBuilder {
            disk_type,
            size: size.div_ceil(block) * block,
            sector_size: DEFAULT_SECTOR_SIZE,
            unique_id: None,
            timestamp: None,
            creator_application: None,
        }
    }

    /// Fixed disk of `size` bytes (rounded up to 512)
    pub fn fixed(size: u64) -> Self {
        Self::new(DiskType::Fixed, size)
    }

    /// Dynamic disk of `size` bytes (rounded up to 512)
    pub fn dynamic(size: u64) -> Self {
        Self::new(DiskType::Dynamic, size)
    }

    /// Bytes covered by one allocation table entry (dynamic only)
    pub fn sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn unique_id(mut self, id: Uuid) -> Self {
        self.unique_id = Some(id);
        self
    }

    /// Creation time in seconds since 2000-01-01
    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn creator_application(mut self, tag: [u8; 4]) -> Self {
        self.creator_application = Some(tag);
        self
    }

    fn footer(&self) -> Footer {
        let mut footer = Footer::new(self.disk_type, self.size);
        if let Some(id) = self.unique_id {
            footer.unique_id = id;
        }
        if let Some(timestamp) = self.timestamp {
            footer.timestamp = timestamp;
        }
        if let Some(tag) = self.creator_application {
            footer.creator_application = tag;
        }
        footer.update_checksum();
        footer
    }

    /// Write a complete image to `writer`, returning its footer
    pub fn build<W: Write>(&self, mut writer: W) -> Result<Footer> {
        let footer = self.footer();

        match self.disk_type {
            DiskType::Dynamic => {
                if self.sector_size == 0 || self.sector_size % BLOCK_SIZE != 0 {
                    return Err(VhdError::InvalidArgument(format!(
                        "sector size {} is not a positive multiple of {BLOCK_SIZE}",
                        self.sector_size
                    )));
                }
                let entries = u32::try_from(self.size.div_ceil(self.sector_size as u64))
                    .map_err(|_| {
                        VhdError::InvalidArgument(format!("disk size {} too large", self.size))
                    })?;

                let header = Header::new(TABLE_OFFSET, entries, self.sector_size);
                let table = padded_table(&AllocationTable::new(entries));

                writer.write_all(&footer.to_bytes())?;
                writer.write_all(&header.to_bytes())?;
                writer.write_all(&table)?;
                writer.write_all(&footer.to_bytes())?;
                debug!(size = self.size, entries, "built dynamic image");
            }
            DiskType::Fixed => {
                const CHUNK: usize = 64 * 1024;
                let zeros = [0u8; CHUNK];
                let mut remaining = self.size;
                while remaining > 0 {
                    let n = remaining.min(CHUNK as u64) as usize;
                    writer.write_all(&zeros[..n])?;
                    remaining -= n as u64;
                }
                writer.write_all(&footer.to_bytes())?;
                debug!(size = self.size, "built fixed image");
            }
            other => {
                return Err(VhdError::Unsupported(format!("creating {other} disks")));
            }
        }

        writer.flush()?;
        Ok(footer)
    }

    /// Create the image file at `path` and open it read-write
    pub fn create<P: AsRef<Path>>(&self, path: P) -> Result<Image<File>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        self.build(BufWriter::new(&mut file))?;
        Image::open_with_options(file, ImageOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{self, FOOTER_CHECKSUM_OFFSET, HEADER_CHECKSUM_OFFSET};
    use crate::format::SECTOR_FREE;

    #[test]
    fn test_fixed_layout() {
        let mut data = Vec::new();
        let footer = ImageBuilder::fixed(1000).build(&mut data).unwrap();
        assert_eq!(footer.current_size, 1024);
        assert_eq!(data.len(), 1024 + 512);
        assert!(data[..1024].iter().all(|&b| b == 0));
        assert_eq!(&data[1024..1032], b"conectix");
        assert_eq!(checksum::verify(&data[1024..], FOOTER_CHECKSUM_OFFSET), Ok(()));
    }

    #[test]
    fn test_dynamic_layout() {
        let id = Uuid::from_bytes([0x11; 16]);
        let mut data = Vec::new();
        ImageBuilder::dynamic(10 * 1024 * 1024)
            .unique_id(id)
            .timestamp(551_314_691)
            .creator_application(*b"test")
            .build(&mut data)
            .unwrap();

        // 5 entries of 2 MiB, padded to one block
        assert_eq!(data.len(), 512 + 1024 + 512 + 512);
        assert_eq!(&data[0..512], &data[2048..2560]);
        assert_eq!(&data[512..520], b"cxsparse");
        assert_eq!(checksum::verify(&data[512..1536], HEADER_CHECKSUM_OFFSET), Ok(()));
        assert!(data[1536..2048]
            .chunks(4)
            .all(|e| e == SECTOR_FREE.to_be_bytes()));

        let footer = Footer::parse(&data, 0).unwrap();
        assert_eq!(footer.unique_id, id);
        assert_eq!(footer.timestamp, 551_314_691);
        assert_eq!(&footer.creator_application, b"test");
        assert_eq!(footer.data_offset, 512);

        let header = Header::parse(&data, 512).unwrap();
        assert_eq!(header.max_table_entries, 5);
        assert_eq!(header.table_offset, 1536);
    }

    #[test]
    fn test_invalid_sector_size() {
        let mut data = Vec::new();
        assert!(matches!(
            ImageBuilder::dynamic(4096).sector_size(1000).build(&mut data),
            Err(VhdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhd");

        let mut image = ImageBuilder::dynamic(1 << 20).create(&path).unwrap();
        image.write_at(512, b"on disk").unwrap();
        image.flush().unwrap();
        drop(image);

        let mut image = Image::open_path(&path, ImageOptions::default()).unwrap();
        let mut buf = [0u8; 7];
        image.read_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"on disk");
    }
}
