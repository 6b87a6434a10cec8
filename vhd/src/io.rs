//! Positioned I/O over the backing file

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::trace;

use crate::error::{Result, VhdError};

/// Read until the buffer is full or EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..])? {
            0 => break, // EOF
            n => total += n,
        }
    }
    Ok(total)
}

/// Fill `buf` from `position`; a short read is an error
pub(crate) fn read_exact_at<F: Read + Seek>(file: &mut F, position: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(position))?;
    let actual = read_full(file, buf)?;
    trace!(position, len = buf.len(), actual, "physical read");
    if actual != buf.len() {
        return Err(VhdError::ShortTransfer {
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}

/// Write all of `buf` at `position`; a short write is an error
pub(crate) fn write_all_at<F: Write + Seek>(file: &mut F, position: u64, buf: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(position))?;
    let mut total = 0;
    while total < buf.len() {
        match file.write(&buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    trace!(position, len = buf.len(), actual = total, "physical write");
    if total != buf.len() {
        return Err(VhdError::ShortTransfer {
            expected: buf.len(),
            actual: total,
        });
    }
    Ok(())
}

/// Size of the backing file
pub(crate) fn file_len<F: Seek>(file: &mut F) -> Result<u64> {
    Ok(file.seek(SeekFrom::End(0))?)
}

/// Write `len` zero bytes starting at `offset`
pub(crate) fn write_zeroes<F: Write + Seek>(file: &mut F, mut offset: u64, mut len: u64) -> Result<()> {
    const CHUNK: usize = 64 * 1024;
    let buf = [0u8; CHUNK];
    while len > 0 {
        let to_write = len.min(CHUNK as u64) as usize;
        write_all_at(file, offset, &buf[..to_write])?;
        offset += to_write as u64;
        len -= to_write as u64;
    }
    Ok(())
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}
