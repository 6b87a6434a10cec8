//! Block Allocation Table
//!
//! One big-endian u32 per sector: the block address (in 512-byte units)
//! where the sector's bitmap and data begin, or `SECTOR_FREE`.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, VhdError};
use crate::format::{SECTOR_FREE, TABLE_ENTRY_SIZE};

/// In-memory allocation table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocationTable {
    entries: Vec<u32>,
}

impl AllocationTable {
    /// Create a table of `len` free entries
    pub fn new(len: u32) -> Self {
        AllocationTable {
            entries: vec![SECTOR_FREE; len as usize],
        }
    }

    /// Parse a table from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % TABLE_ENTRY_SIZE != 0 {
            return Err(VhdError::InvalidFormat(format!(
                "allocation table length {} is not a multiple of {TABLE_ENTRY_SIZE}",
                bytes.len()
            )));
        }

        let entries = bytes
            .chunks_exact(TABLE_ENTRY_SIZE)
            .map(BigEndian::read_u32)
            .collect();
        Ok(AllocationTable { entries })
    }

    /// Serialize all entries
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.entries.len() * TABLE_ENTRY_SIZE];
        BigEndian::write_u32_into(&self.entries, &mut buf);
        buf
    }

    /// Number of entries
    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block address of `sector`; out-of-range sectors read as free
    pub fn get(&self, sector: u32) -> u32 {
        self.entries
            .get(sector as usize)
            .copied()
            .unwrap_or(SECTOR_FREE)
    }

    /// Returns `true` if `sector` has no backing storage yet
    pub fn needs_allocation(&self, sector: u32) -> bool {
        self.get(sector) == SECTOR_FREE
    }

    /// Record the block address of `sector`
    pub fn set(&mut self, sector: u32, address: u32) -> Result<()> {
        let len = self.len();
        let entry = self.entries.get_mut(sector as usize).ok_or_else(|| {
            VhdError::InvalidArgument(format!("sector {sector} beyond table of {len} entries"))
        })?;
        *entry = address;
        Ok(())
    }

    /// Grow with free entries or truncate to `len`
    ///
    /// Returns `true` if the length changed. The header's entry count is
    /// left to the caller.
    pub fn resize(&mut self, len: u32) -> bool {
        if len == self.len() {
            return false;
        }
        self.entries.resize(len as usize, SECTOR_FREE);
        true
    }

    /// All entries in sector order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().copied()
    }

    /// Number of allocated sectors
    pub fn allocated_count(&self) -> usize {
        self.entries.iter().filter(|&&e| e != SECTOR_FREE).count()
    }
}
