//! Fixed disk backend
//!
//! Disk data is stored linearly, so a logical position maps directly to
//! a file offset.

use std::io::{Read, Seek, Write};

use crate::error::{Result, VhdError};
use crate::footer::Footer;
use crate::format::NULL_OFFSET;
use crate::io::{read_exact_at, write_all_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FixedDisk {
    /// File offset of logical position 0
    base: u64,
    /// Disk size in bytes
    size: u64,
}

impl FixedDisk {
    pub(crate) fn new(footer: &Footer) -> Self {
        let base = if footer.data_offset == NULL_OFFSET {
            0
        } else {
            footer.data_offset
        };
        FixedDisk {
            base,
            size: footer.current_size,
        }
    }

    fn physical(&self, position: u64, len: usize) -> Result<u64> {
        let end = position
            .checked_add(len as u64)
            .ok_or_else(|| VhdError::InvalidArgument("position overflows".into()))?;
        if end > self.size {
            return Err(VhdError::InvalidArgument(format!(
                "range {position}..{end} beyond disk size {}",
                self.size
            )));
        }
        Ok(self.base + position)
    }

    pub(crate) fn read<F: Read + Seek>(&self, file: &mut F, position: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.physical(position, buf.len())?;
        read_exact_at(file, offset, buf)
    }

    pub(crate) fn write<F: Write + Seek>(&self, file: &mut F, position: u64, buf: &[u8]) -> Result<()> {
        let offset = self.physical(position, buf.len())?;
        write_all_at(file, offset, buf)
    }
}
