//! Dynamic disk header (1024 bytes)
//!
//! Present only on Dynamic and Differencing disks, at the offset named
//! by the footer's data offset (normally 512).

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use uuid::Uuid;

use crate::checksum::{self, HEADER_CHECKSUM_OFFSET};
use crate::error::{Result, VhdError};
use crate::format::{
    Version, HEADER_SIGNATURE, HEADER_SIZE, LOCATOR_COUNT, LOCATOR_SIZE, NULL_OFFSET,
};
use crate::locator::Locator;

/// Offset of the parent name field
const PARENT_NAME_OFFSET: usize = 64;

/// Size of the parent name field in bytes
const PARENT_NAME_SIZE: usize = 512;

/// Offset of the first parent locator entry
const LOCATORS_OFFSET: usize = 576;

/// Offset of the trailing reserved region
const RESERVED2_OFFSET: usize = 768;

/// Dynamic disk header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Next structure offset, unused (sentinel)
    pub data_offset: u64,
    /// Absolute byte offset of the allocation table
    pub table_offset: u64,
    /// Header format version (1.0)
    pub header_version: Version,
    /// Number of allocation table entries
    pub max_table_entries: u32,
    /// Bytes of logical data covered by one table entry
    pub sector_size: u32,
    /// Stored checksum
    pub checksum: u32,
    /// Unique ID of the parent image (differencing disks)
    pub parent_unique_id: Uuid,
    /// Modification time of the parent image, VHD epoch seconds
    pub parent_timestamp: u32,
    /// Reserved, replayed verbatim
    pub reserved1: [u8; 4],
    /// Raw parent name, UTF-16 big-endian
    pub parent_name: [u8; PARENT_NAME_SIZE],
    /// All eight locator slots, empty ones included
    pub parent_locators: [Locator; LOCATOR_COUNT],
    /// Reserved, replayed verbatim
    pub reserved2: [u8; 256],
}

impl Header {
    /// Create a header for a new dynamic disk
    pub fn new(table_offset: u64, max_table_entries: u32, sector_size: u32) -> Self {
        Header {
            data_offset: NULL_OFFSET,
            table_offset,
            header_version: Version::new(1, 0),
            max_table_entries,
            sector_size,
            checksum: 0,
            parent_unique_id: Uuid::nil(),
            parent_timestamp: 0,
            reserved1: [0u8; 4],
            parent_name: [0u8; PARENT_NAME_SIZE],
            parent_locators: [Locator::default(); LOCATOR_COUNT],
            reserved2: [0u8; 256],
        }
    }

    /// Parse a header from `bytes` starting at `offset`
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self> {
        let raw = bytes
            .get(offset..offset + HEADER_SIZE)
            .ok_or_else(|| {
                VhdError::InvalidFormat(format!(
                    "header needs {HEADER_SIZE} bytes, got {}",
                    bytes.len().saturating_sub(offset)
                ))
            })?;

        if &raw[0..8] != HEADER_SIGNATURE {
            return Err(VhdError::InvalidSignature {
                found: String::from_utf8_lossy(&raw[0..8]).into_owned(),
                expected: "cxsparse",
            });
        }

        let mut cursor = Cursor::new(&raw[8..40]);
        let data_offset = cursor.read_u64::<BigEndian>()?;
        let table_offset = cursor.read_u64::<BigEndian>()?;
        let header_version = Version::parse(&raw[24..24 + Version::SIZE]);
        cursor.set_position(20);
        let max_table_entries = cursor.read_u32::<BigEndian>()?;
        let sector_size = cursor.read_u32::<BigEndian>()?;
        let checksum = cursor.read_u32::<BigEndian>()?;

        let mut parent_id = [0u8; 16];
        parent_id.copy_from_slice(&raw[40..56]);
        let parent_timestamp = BigEndian::read_u32(&raw[56..60]);

        let mut reserved1 = [0u8; 4];
        reserved1.copy_from_slice(&raw[60..64]);

        let mut parent_name = [0u8; PARENT_NAME_SIZE];
        parent_name.copy_from_slice(&raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_SIZE]);

        let mut parent_locators = [Locator::default(); LOCATOR_COUNT];
        for (i, slot) in parent_locators.iter_mut().enumerate() {
            *slot = Locator::parse(raw, LOCATORS_OFFSET + i * LOCATOR_SIZE)?;
        }

        let mut reserved2 = [0u8; 256];
        reserved2.copy_from_slice(&raw[RESERVED2_OFFSET..HEADER_SIZE]);

        Ok(Header {
            data_offset,
            table_offset,
            header_version,
            max_table_entries,
            sector_size,
            checksum,
            parent_unique_id: Uuid::from_bytes(parent_id),
            parent_timestamp,
            reserved1,
            parent_name,
            parent_locators,
            reserved2,
        })
    }

    /// Serialize into `buf` at `offset`, computing and patching the checksum
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let len = buf.len();
        let window = buf.get_mut(offset..offset + HEADER_SIZE).ok_or_else(|| {
            VhdError::InvalidArgument(format!(
                "header needs {HEADER_SIZE} bytes at offset {offset}, buffer is {len}"
            ))
        })?;
        let mut raw = [0u8; HEADER_SIZE];
        self.encode(&mut raw);
        window.copy_from_slice(&raw);
        Ok(())
    }

    /// Serialize to a fresh 1024-byte buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = [0u8; HEADER_SIZE];
        self.encode(&mut raw);
        raw.to_vec()
    }

    fn encode(&self, raw: &mut [u8; HEADER_SIZE]) {
        raw[0..8].copy_from_slice(HEADER_SIGNATURE);
        BigEndian::write_u64(&mut raw[8..16], self.data_offset);
        BigEndian::write_u64(&mut raw[16..24], self.table_offset);
        self.header_version.write(&mut raw[24..24 + Version::SIZE]);
        BigEndian::write_u32(&mut raw[28..32], self.max_table_entries);
        BigEndian::write_u32(&mut raw[32..36], self.sector_size);
        raw[36..40].fill(0);
        raw[40..56].copy_from_slice(self.parent_unique_id.as_bytes());
        BigEndian::write_u32(&mut raw[56..60], self.parent_timestamp);
        raw[60..64].copy_from_slice(&self.reserved1);
        raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_SIZE]
            .copy_from_slice(&self.parent_name);
        for (i, locator) in self.parent_locators.iter().enumerate() {
            let at = LOCATORS_OFFSET + i * LOCATOR_SIZE;
            raw[at..at + LOCATOR_SIZE].copy_from_slice(&locator.to_bytes());
        }
        raw[RESERVED2_OFFSET..HEADER_SIZE].copy_from_slice(&self.reserved2);

        let sum = checksum::checksum(&raw[..]);
        BigEndian::write_u32(&mut raw[36..40], sum);
    }

    /// Checksum the header would carry if written now
    pub fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        checksum::stored_checksum(&bytes, HEADER_CHECKSUM_OFFSET)
    }

    /// Check the stored checksum against the computed one
    pub fn verify_checksum(&self) -> Result<()> {
        let actual = self.compute_checksum();
        if actual != self.checksum {
            return Err(VhdError::ChecksumMismatch {
                structure: "header",
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Store the computed checksum
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Decode the parent name up to the first NUL
    pub fn parent_name(&self) -> String {
        let units: Vec<u16> = self
            .parent_name
            .chunks_exact(2)
            .map(BigEndian::read_u16)
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    /// Encode `name` as UTF-16 big-endian into the parent name field
    pub fn set_parent_name(&mut self, name: &str) -> Result<()> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > PARENT_NAME_SIZE / 2 {
            return Err(VhdError::InvalidArgument(format!(
                "parent name is {} UTF-16 units, limit is {}",
                units.len(),
                PARENT_NAME_SIZE / 2
            )));
        }

        self.parent_name = [0u8; PARENT_NAME_SIZE];
        for (i, unit) in units.iter().enumerate() {
            BigEndian::write_u16(&mut self.parent_name[i * 2..i * 2 + 2], *unit);
        }
        Ok(())
    }

    /// Non-empty parent locator slots with their slot index
    pub fn parent_locators(&self) -> impl Iterator<Item = (usize, &Locator)> {
        self.parent_locators
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{PlatformCode, DEFAULT_SECTOR_SIZE};

    fn sample_header() -> Header {
        let mut header = Header::new(1536, 5, DEFAULT_SECTOR_SIZE);
        header.reserved1 = [1, 2, 3, 4];
        header.reserved2[0] = 0xEE;
        header.reserved2[255] = 0x77;
        header
    }

    #[test]
    fn test_header_round_trip() {
        let bytes = sample_header().to_bytes();
        assert_eq!(&bytes[0..8], b"cxsparse");
        assert_eq!(BigEndian::read_u64(&bytes[8..16]), NULL_OFFSET);
        assert_eq!(BigEndian::read_u64(&bytes[16..24]), 1536);
        assert_eq!(&bytes[24..28], &[0, 1, 0, 0]);

        let parsed = Header::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.max_table_entries, 5);
        assert_eq!(parsed.sector_size, DEFAULT_SECTOR_SIZE);
        assert_eq!(parsed.reserved1, [1, 2, 3, 4]);
        assert!(parsed.verify_checksum().is_ok());
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_header_invalid_signature() {
        let mut bytes = sample_header().to_bytes();
        bytes[0..8].copy_from_slice(b"conectix");
        match Header::parse(&bytes, 0) {
            Err(VhdError::InvalidSignature { found, expected }) => {
                assert_eq!(found, "conectix");
                assert_eq!(expected, "cxsparse");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_header_parse_at_offset() {
        let mut buf = vec![0xFFu8; 512 + HEADER_SIZE];
        sample_header().write(&mut buf, 512).unwrap();
        assert_eq!(&buf[..512], &[0xFFu8; 512][..]);
        let parsed = Header::parse(&buf, 512).unwrap();
        assert_eq!(parsed.table_offset, 1536);

        assert!(matches!(
            Header::parse(&buf, 600),
            Err(VhdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_header_checksum_detects_corruption() {
        let mut bytes = sample_header().to_bytes();
        bytes[30] ^= 0x01;
        let parsed = Header::parse(&bytes, 0).unwrap();
        assert!(matches!(
            parsed.verify_checksum(),
            Err(VhdError::ChecksumMismatch { structure: "header", .. })
        ));
    }

    #[test]
    fn test_parent_name_and_locators() {
        let mut header = sample_header();
        header.set_parent_name("parent.vhd").unwrap();
        header.parent_locators[2] = Locator {
            platform_code: PlatformCode::W2ku.as_u32(),
            data_space: 512,
            data_length: 20,
            reserved: 0,
            data_offset: 0x600,
        };
        header.parent_unique_id = Uuid::from_bytes([0xAB; 16]);

        let bytes = header.to_bytes();
        assert_eq!(&bytes[64..68], &[0, b'p', 0, b'a']);

        let parsed = Header::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.parent_name(), "parent.vhd");
        assert_eq!(parsed.parent_unique_id, Uuid::from_bytes([0xAB; 16]));

        let used: Vec<_> = parsed.parent_locators().collect();
        assert_eq!(used.len(), 1);
        assert_eq!(used[0].0, 2);
        assert_eq!(used[0].1.data_offset, 0x600);
        assert_eq!(used[0].1.platform(), PlatformCode::W2ku);

        let long = "x".repeat(257);
        assert!(header.set_parent_name(&long).is_err());
    }
}
