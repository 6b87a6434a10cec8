//! Sparse addressing and I/O engine for Dynamic and Differencing disks
//!
//! The logical address space is split into sectors of `header.sector_size`
//! bytes (2 MiB by default), each made of 512-byte blocks. An allocated
//! sector is stored as `bitmap_blocks` blocks of bitmap (one bit per
//! block, most significant bit first) followed by the sector data, at the
//! block address recorded in the allocation table.
//!
//! Allocation is append-only: a new sector takes the place of the
//! trailing footer, which moves to the new end of file. Freed space is
//! never reused.

use std::io::{Read, Seek, Write};

use tracing::{debug, warn};

use crate::bat::AllocationTable;
use crate::error::{Result, VhdError};
use crate::footer::Footer;
use crate::format::{BLOCK_SIZE, FOOTER_SIZE, HEADER_SIZE, SECTOR_FREE, TABLE_ENTRY_SIZE};
use crate::header::Header;
use crate::io::{align_up, file_len, read_exact_at, write_all_at, write_zeroes};

const BLOCK: u64 = BLOCK_SIZE as u64;

/// Header and allocation table of a sparse disk
#[derive(Debug, Clone)]
pub struct SparseDisk {
    /// File offset of the dynamic header
    header_offset: u64,
    pub(crate) header: Header,
    pub(crate) bat: AllocationTable,
}

impl SparseDisk {
    /// Read the header and allocation table named by `footer`
    pub(crate) fn load<F: Read + Seek>(file: &mut F, footer: &Footer, verify_checksums: bool) -> Result<Self> {
        let header_offset = footer.data_offset;
        let mut raw = vec![0u8; HEADER_SIZE];
        read_exact_at(file, header_offset, &mut raw)?;
        let header = Header::parse(&raw, 0)?;

        if let Err(e) = header.verify_checksum() {
            if verify_checksums {
                return Err(e);
            }
            warn!(error = %e, "ignoring header checksum mismatch");
        }

        if header.sector_size == 0 || header.sector_size % BLOCK_SIZE != 0 {
            return Err(VhdError::InvalidFormat(format!(
                "sector size {} is not a positive multiple of {BLOCK_SIZE}",
                header.sector_size
            )));
        }

        let table_len = header.max_table_entries as u64 * TABLE_ENTRY_SIZE as u64;
        let len = file_len(file)?;
        if header.table_offset.checked_add(table_len).is_none_or(|end| end > len) {
            return Err(VhdError::InvalidFormat(format!(
                "allocation table of {} entries at {} exceeds file of {len} bytes",
                header.max_table_entries, header.table_offset
            )));
        }

        let mut table = vec![0u8; table_len as usize];
        read_exact_at(file, header.table_offset, &mut table)?;
        let bat = AllocationTable::parse(&table)?;

        Ok(SparseDisk {
            header_offset,
            header,
            bat,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn allocation_table(&self) -> &AllocationTable {
        &self.bat
    }

    /// Bytes of logical data per sector
    pub fn sector_size(&self) -> u64 {
        self.header.sector_size as u64
    }

    /// Blocks per sector
    pub fn blocks_per_sector(&self) -> u64 {
        self.sector_size() / BLOCK
    }

    /// Blocks holding one sector bitmap
    pub fn bitmap_blocks(&self) -> u64 {
        (self.blocks_per_sector() + BLOCK * 8 - 1) / (BLOCK * 8)
    }

    /// Bytes of one sector bitmap
    pub fn bitmap_size(&self) -> usize {
        (self.bitmap_blocks() * BLOCK) as usize
    }

    /// Sector holding block `lba`
    pub fn sector_number(&self, lba: u64) -> u64 {
        lba / self.blocks_per_sector()
    }

    /// Index of block `lba` inside its sector
    pub fn block_in_sector(&self, lba: u64) -> u64 {
        lba % self.blocks_per_sector()
    }

    fn entry(&self, sector: u64) -> u32 {
        u32::try_from(sector)
            .map(|s| self.bat.get(s))
            .unwrap_or(SECTOR_FREE)
    }

    /// File offset of a sector's bitmap, `None` if the sector is free
    pub fn sector_address(&self, sector: u64) -> Option<u64> {
        match self.entry(sector) {
            SECTOR_FREE => None,
            entry => Some(entry as u64 * BLOCK),
        }
    }

    /// File offset of a sector's data, `None` if the sector is free
    fn data_address(&self, sector: u64) -> Option<u64> {
        self.sector_address(sector)
            .map(|address| address + self.bitmap_blocks() * BLOCK)
    }

    pub fn needs_allocation(&self, sector: u64) -> bool {
        self.entry(sector) == SECTOR_FREE
    }

    /// Read `buf.len()` bytes at logical `position`
    ///
    /// Free sectors read as zeros without touching the file.
    pub(crate) fn read<F: Read + Seek>(&self, file: &mut F, mut position: u64, buf: &mut [u8]) -> Result<()> {
        position
            .checked_add(buf.len() as u64)
            .ok_or_else(|| VhdError::InvalidArgument("position overflows".into()))?;
        let sector_size = self.sector_size();
        let mut done = 0;

        while done < buf.len() {
            let sector = position / sector_size;
            let sector_offset = position % sector_size;
            let chunk = (buf.len() - done).min((sector_size - sector_offset) as usize);
            let dst = &mut buf[done..done + chunk];

            match self.data_address(sector) {
                None => dst.fill(0),
                Some(address) => read_exact_at(file, address + sector_offset, dst)?,
            }

            done += chunk;
            position += chunk as u64;
        }
        Ok(())
    }

    /// Read blocks `[first_lba, last_lba)` one sector run at a time
    pub(crate) fn read_blocks<F: Read + Seek>(&self, file: &mut F, first_lba: u64, last_lba: u64) -> Result<Vec<u8>> {
        let len = block_range_len(first_lba, last_lba)?;
        let mut out = vec![0u8; len];
        let mut lba = first_lba;

        while lba < last_lba {
            let sector = self.sector_number(lba);
            let block = self.block_in_sector(lba);
            let run = (self.blocks_per_sector() - block).min(last_lba - lba);
            let start = ((lba - first_lba) * BLOCK) as usize;
            let dst = &mut out[start..start + (run * BLOCK) as usize];

            if let Some(address) = self.data_address(sector) {
                read_exact_at(file, address + block * BLOCK, dst)?;
            }

            lba += run;
        }
        Ok(out)
    }

    /// Read a sector's bitmap
    pub(crate) fn read_sector_bitmap<F: Read + Seek>(&self, file: &mut F, sector: u64) -> Result<Vec<u8>> {
        let address = self
            .sector_address(sector)
            .ok_or(VhdError::SectorNotAllocated(sector as u32))?;
        let mut bitmap = vec![0u8; self.bitmap_size()];
        read_exact_at(file, address, &mut bitmap)?;
        Ok(bitmap)
    }

    /// Replace a sector's bitmap
    pub(crate) fn write_sector_bitmap<F: Write + Seek>(&self, file: &mut F, sector: u64, bitmap: &[u8]) -> Result<()> {
        if bitmap.len() != self.bitmap_size() {
            return Err(VhdError::InvalidArgument(format!(
                "bitmap is {} bytes, sector bitmap is {}",
                bitmap.len(),
                self.bitmap_size()
            )));
        }
        let address = self
            .sector_address(sector)
            .ok_or(VhdError::SectorNotAllocated(sector as u32))?;
        write_all_at(file, address, bitmap)
    }
}

impl SparseDisk {
    /// Write `buf` at logical `position`, allocating sectors as needed
    ///
    /// Grows the disk first when the write ends past its current size.
    /// A failure part way through leaves earlier chunks in place.
    pub(crate) fn write<F: Read + Write + Seek>(
        &mut self,
        file: &mut F,
        footer: &mut Footer,
        mut position: u64,
        buf: &[u8],
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let end = position
            .checked_add(buf.len() as u64)
            .ok_or_else(|| VhdError::InvalidArgument("position overflows".into()))?;
        if end > footer.current_size {
            self.grow(file, footer, end)?;
        }

        let sector_size = self.sector_size();
        let mut done = 0;

        while done < buf.len() {
            let sector = position / sector_size;
            let sector_offset = position % sector_size;
            let chunk = (buf.len() - done).min((sector_size - sector_offset) as usize);

            if self.needs_allocation(sector) {
                self.allocate_sector(file, footer, sector)?;
            }

            let mut bitmap = self.read_sector_bitmap(file, sector)?;
            let address = self
                .data_address(sector)
                .ok_or(VhdError::SectorNotAllocated(sector as u32))?;
            write_all_at(file, address + sector_offset, &buf[done..done + chunk])?;

            let first_block = sector_offset / BLOCK;
            let last_block = (sector_offset + chunk as u64 - 1) / BLOCK;
            let mut changed = false;
            for block in first_block..=last_block {
                let byte = (block / 8) as usize;
                let mask = 0x80u8 >> (block % 8);
                if bitmap[byte] & mask == 0 {
                    bitmap[byte] |= mask;
                    changed = true;
                }
            }
            if changed {
                self.write_sector_bitmap(file, sector, &bitmap)?;
            }

            done += chunk;
            position += chunk as u64;
        }
        Ok(())
    }

    /// Append storage for `sector` at the end of file
    fn allocate_sector<F: Read + Write + Seek>(&mut self, file: &mut F, footer: &mut Footer, sector: u64) -> Result<()> {
        let sector = u32::try_from(sector)
            .ok()
            .filter(|&s| s != SECTOR_FREE)
            .ok_or_else(|| VhdError::InvalidArgument(format!("sector {sector} out of range")))?;

        if sector >= self.bat.len() {
            self.resize_table(file, footer, sector + 1)?;
        }

        let block_start = align_up(trailing_footer_position(file)?, BLOCK);
        let block_address = u32::try_from(block_start / BLOCK)
            .ok()
            .filter(|&a| a != SECTOR_FREE)
            .ok_or_else(|| {
                VhdError::Unsupported(format!("block offset {block_start} exceeds table range"))
            })?;

        let sector_bytes = self.bitmap_size() as u64 + self.sector_size();
        write_zeroes(file, block_start, sector_bytes)?;
        write_footer(file, footer, block_start + sector_bytes)?;

        self.bat.set(sector, block_address)?;
        let entry_offset = self.header.table_offset + sector as u64 * TABLE_ENTRY_SIZE as u64;
        write_all_at(file, entry_offset, &block_address.to_be_bytes())?;

        debug!(sector, block_address, "allocated sector");
        Ok(())
    }

    /// Grow the allocation table to `len` entries and persist it
    ///
    /// The table grows in place while it fits its 512-byte padding;
    /// otherwise it moves to the end of file. Returns `true` if it changed.
    pub(crate) fn resize_table<F: Read + Write + Seek>(
        &mut self,
        file: &mut F,
        footer: &mut Footer,
        len: u32,
    ) -> Result<bool> {
        let old_len = self.bat.len();
        if len < old_len {
            return Err(VhdError::InvalidArgument(format!(
                "cannot shrink allocation table from {old_len} to {len} entries"
            )));
        }
        if !self.bat.resize(len) {
            return Ok(false);
        }

        let table = padded_table(&self.bat);
        let capacity = align_up(old_len as u64 * TABLE_ENTRY_SIZE as u64, BLOCK);

        if table.len() as u64 <= capacity {
            write_all_at(file, self.header.table_offset, &table)?;
            debug!(old_len, len, "grew allocation table in place");
        } else {
            let table_offset = align_up(trailing_footer_position(file)?, BLOCK);
            write_all_at(file, table_offset, &table)?;
            write_footer(file, footer, table_offset + table.len() as u64)?;
            debug!(old_len, len, from = self.header.table_offset, to = table_offset, "relocated allocation table");
            self.header.table_offset = table_offset;
        }

        self.header.max_table_entries = len;
        self.write_header(file)?;
        Ok(true)
    }

    /// Extend the disk to at least `new_size` bytes
    pub(crate) fn grow<F: Read + Write + Seek>(&mut self, file: &mut F, footer: &mut Footer, new_size: u64) -> Result<()> {
        let new_size = align_up(new_size, BLOCK);
        let sectors = u32::try_from(new_size.div_ceil(self.sector_size()))
            .map_err(|_| VhdError::InvalidArgument(format!("disk size {new_size} too large")))?;

        if sectors > self.bat.len() {
            self.resize_table(file, footer, sectors)?;
        }

        debug!(from = footer.current_size, to = new_size, "growing disk");
        footer.current_size = new_size;
        let position = trailing_footer_position(file)?;
        write_footer(file, footer, position)?;
        write_footer(file, footer, 0)?;
        Ok(())
    }

    fn write_header<F: Write + Seek>(&mut self, file: &mut F) -> Result<()> {
        self.header.update_checksum();
        write_all_at(file, self.header_offset, &self.header.to_bytes())
    }
}

/// Allocation table bytes padded with free entries to a block boundary
pub(crate) fn padded_table(bat: &AllocationTable) -> Vec<u8> {
    let mut table = bat.to_bytes();
    let padded = align_up(table.len() as u64, BLOCK) as usize;
    while table.len() < padded {
        table.extend_from_slice(&SECTOR_FREE.to_be_bytes());
    }
    table
}

/// Byte length of blocks `[first_lba, last_lba)`
pub(crate) fn block_range_len(first_lba: u64, last_lba: u64) -> Result<usize> {
    last_lba
        .checked_sub(first_lba)
        .and_then(|count| count.checked_mul(BLOCK))
        .filter(|&len| len <= isize::MAX as u64 && last_lba.checked_mul(BLOCK).is_some())
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| {
            VhdError::InvalidArgument(format!("block range {first_lba}..{last_lba} out of range"))
        })
}

/// Offset of the trailing footer, where appended data begins
fn trailing_footer_position<F: Seek>(file: &mut F) -> Result<u64> {
    let len = file_len(file)?;
    len.checked_sub(FOOTER_SIZE as u64)
        .ok_or_else(|| VhdError::InvalidFormat(format!("file of {len} bytes has no footer")))
}

fn write_footer<F: Write + Seek>(file: &mut F, footer: &mut Footer, position: u64) -> Result<()> {
    footer.update_checksum();
    write_all_at(file, position, &footer.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DiskType, DEFAULT_SECTOR_SIZE};
    use std::io::Cursor;

    /// Dynamic image with a small sector size, laid out by hand
    fn small_image(sector_size: u32, sectors: u32) -> (Cursor<Vec<u8>>, Footer, SparseDisk) {
        let size = sector_size as u64 * sectors as u64;
        let mut footer = Footer::new(DiskType::Dynamic, size);
        let bat = AllocationTable::new(sectors);
        let mut header = Header::new(1536, sectors, sector_size);
        header.update_checksum();
        footer.update_checksum();

        let mut data = Vec::new();
        data.extend_from_slice(&footer.to_bytes());
        data.extend_from_slice(&header.to_bytes());
        data.extend_from_slice(&padded_table(&bat));
        data.extend_from_slice(&footer.to_bytes());

        let disk = SparseDisk {
            header_offset: 512,
            header,
            bat,
        };
        (Cursor::new(data), footer, disk)
    }

    #[test]
    fn test_addressing() {
        let (_, _, disk) = small_image(DEFAULT_SECTOR_SIZE, 4);
        assert_eq!(disk.blocks_per_sector(), 4096);
        assert_eq!(disk.bitmap_blocks(), 1);
        assert_eq!(disk.bitmap_size(), 512);
        assert_eq!(disk.sector_number(4095), 0);
        assert_eq!(disk.sector_number(4096), 1);
        assert_eq!(disk.block_in_sector(4097), 1);
        assert_eq!(disk.sector_address(0), None);
        assert!(disk.needs_allocation(u64::MAX));
    }

    #[test]
    fn test_load() {
        let (mut file, footer, disk) = small_image(4096, 3);
        let loaded = SparseDisk::load(&mut file, &footer, true).unwrap();
        assert_eq!(loaded.header, disk.header);
        assert_eq!(loaded.bat.len(), 3);
    }

    #[test]
    fn test_load_rejects_bad_sector_size() {
        let (mut file, footer, mut disk) = small_image(4096, 3);
        disk.header.sector_size = 1000;
        disk.write_header(&mut file).unwrap();
        assert!(matches!(
            SparseDisk::load(&mut file, &footer, true),
            Err(VhdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_load_rejects_table_beyond_file() {
        let (mut file, footer, mut disk) = small_image(4096, 3);
        disk.header.max_table_entries = u32::MAX;
        disk.write_header(&mut file).unwrap();
        assert!(matches!(
            SparseDisk::load(&mut file, &footer, true),
            Err(VhdError::InvalidFormat(_))
        ));

        disk.header.max_table_entries = 3;
        disk.header.table_offset = u64::MAX - 4;
        disk.write_header(&mut file).unwrap();
        assert!(matches!(
            SparseDisk::load(&mut file, &footer, true),
            Err(VhdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_multi_block_bitmap() {
        // 8 MiB sectors: 16384 blocks, 2048 bitmap bytes, 4 bitmap blocks
        let (mut file, mut footer, mut disk) = small_image(8 << 20, 1);
        assert_eq!(disk.blocks_per_sector(), 16384);
        assert_eq!(disk.bitmap_blocks(), 4);
        assert_eq!(disk.bitmap_size(), 2048);

        // Block 9000 has its bit in bitmap byte 1125, the third bitmap block
        let position = 9000 * 512 + 10;
        disk.write(&mut file, &mut footer, position, b"deep").unwrap();

        let address = disk.sector_address(0).unwrap();
        let data_start = (address + 4 * 512) as usize;
        assert_eq!(&file.get_ref()[data_start + position as usize..][..4], b"deep");

        let bitmap = disk.read_sector_bitmap(&mut file, 0).unwrap();
        assert_eq!(bitmap.len(), 2048);
        assert_eq!(bitmap[1125], 0x80);
        assert_eq!(bitmap.iter().filter(|&&b| b != 0).count(), 1);

        // Last block of the sector lands in the last bitmap byte
        disk.write(&mut file, &mut footer, (8 << 20) - 1, b"z").unwrap();
        let bitmap = disk.read_sector_bitmap(&mut file, 0).unwrap();
        assert_eq!(bitmap[2047], 0x01);

        let mut buf = [0u8; 4];
        disk.read(&mut file, position, &mut buf).unwrap();
        assert_eq!(&buf, b"deep");
    }

    #[test]
    fn test_write_allocates_and_marks_bitmap() {
        let (mut file, mut footer, mut disk) = small_image(4096, 3);
        let before = file.get_ref().len() as u64;

        disk.write(&mut file, &mut footer, 4096 + 1024, &[0xAB; 600]).unwrap();

        let address = disk.sector_address(1).unwrap();
        assert_eq!(address, before - 512);
        assert_eq!(file.get_ref().len() as u64, address + 512 + 4096 + 512);

        let bitmap = disk.read_sector_bitmap(&mut file, 1).unwrap();
        // Blocks 2 and 3 of the sector
        assert_eq!(bitmap[0], 0b0011_0000);
        assert!(bitmap[1..].iter().all(|&b| b == 0));

        let mut buf = vec![0u8; 4096];
        disk.read(&mut file, 4096, &mut buf).unwrap();
        assert!(buf[..1024].iter().all(|&b| b == 0));
        assert!(buf[1024..1624].iter().all(|&b| b == 0xAB));
        assert!(buf[1624..].iter().all(|&b| b == 0));

        // Trailing footer moved to the new end of file
        let len = file.get_ref().len();
        let trailing = Footer::parse(file.get_ref(), len - 512).unwrap();
        assert!(trailing.verify_checksum().is_ok());

        // Table entry persisted
        let reloaded = SparseDisk::load(&mut file, &footer, true).unwrap();
        assert_eq!(reloaded.bat.get(1), (address / 512) as u32);
    }

    #[test]
    fn test_free_sector_bitmap_access() {
        let (mut file, _, disk) = small_image(4096, 3);
        assert!(matches!(
            disk.read_sector_bitmap(&mut file, 2),
            Err(VhdError::SectorNotAllocated(2))
        ));
        assert!(matches!(
            disk.write_sector_bitmap(&mut file, 2, &[0u8; 512]),
            Err(VhdError::SectorNotAllocated(2))
        ));
        assert!(matches!(
            disk.write_sector_bitmap(&mut file, 2, &[0u8; 3]),
            Err(VhdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_write_past_end_grows_disk() {
        let (mut file, mut footer, mut disk) = small_image(4096, 2);
        assert_eq!(footer.current_size, 8192);

        disk.write(&mut file, &mut footer, 8192 + 100, b"tail").unwrap();
        assert_eq!(footer.current_size, 8192 + 512);
        assert_eq!(disk.bat.len(), 3);
        assert_eq!(disk.header.max_table_entries, 3);

        let leading = Footer::parse(file.get_ref(), 0).unwrap();
        assert_eq!(leading.current_size, 8192 + 512);

        let mut buf = [0u8; 4];
        disk.read(&mut file, 8192 + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn test_table_relocates_past_padding() {
        let (mut file, mut footer, mut disk) = small_image(4096, 2);
        let old_offset = disk.header.table_offset;

        // 128 entries fill one padded block, 200 do not
        assert!(disk.resize_table(&mut file, &mut footer, 128).unwrap());
        assert_eq!(disk.header.table_offset, old_offset);
        assert!(!disk.resize_table(&mut file, &mut footer, 128).unwrap());

        assert!(disk.resize_table(&mut file, &mut footer, 200).unwrap());
        assert_ne!(disk.header.table_offset, old_offset);

        let reloaded = SparseDisk::load(&mut file, &footer, true).unwrap();
        assert_eq!(reloaded.header.table_offset, disk.header.table_offset);
        assert_eq!(reloaded.bat.len(), 200);
        assert_eq!(reloaded.bat.allocated_count(), 0);

        assert!(matches!(
            disk.resize_table(&mut file, &mut footer, 10),
            Err(VhdError::InvalidArgument(_))
        ));
    }
}
