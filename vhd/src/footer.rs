//! Hard disk footer (512 bytes)
//!
//! Every VHD ends with a footer; Dynamic and Differencing disks carry an
//! identical copy at offset 0. Some writers emit the copy shifted by one
//! byte, a leading 0x00 followed by only 511 bytes of footer. Such a
//! footer is parsed from offset + 1 and written back with the same shift.

use std::io::Cursor;
use std::time::SystemTime;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use tracing::warn;
use uuid::Uuid;

use crate::checksum::{self, FOOTER_CHECKSUM_OFFSET};
use crate::error::{Result, VhdError};
use crate::format::{
    now_timestamp, timestamp_to_system_time, DiskType, Features, Version, FOOTER_SIGNATURE,
    FOOTER_SIZE, HOST_OS_MACINTOSH, HOST_OS_WINDOWS, NULL_OFFSET,
};
use crate::geometry::DiskGeometry;

/// Creator application tag written into new footers
pub const CREATOR_APPLICATION: [u8; 4] = *b"rvhd";

/// Size of the trailing reserved region
const RESERVED_SIZE: usize = 427;

/// Offset of the trailing reserved region
const RESERVED_OFFSET: usize = 85;

/// Hard disk footer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    /// Feature flags, unknown bits retained
    pub features: Features,
    /// File format version (1.0)
    pub format_version: Version,
    /// Absolute offset of the dynamic header, `NULL_OFFSET` for fixed disks
    pub data_offset: u64,
    /// Creation time, seconds since 2000-01-01T00:00:00Z
    pub timestamp: u32,
    /// Tag of the application that created the image
    pub creator_application: [u8; 4],
    /// Version of the creating application
    pub creator_version: Version,
    /// Host OS code of the creator
    pub creator_host_os: u32,
    /// Disk size at creation time
    pub original_size: u64,
    /// Current disk size
    pub current_size: u64,
    /// CHS geometry
    pub geometry: DiskGeometry,
    /// Disk type
    pub disk_type: DiskType,
    /// Stored checksum
    pub checksum: u32,
    /// Unique ID of the image
    pub unique_id: Uuid,
    /// Saved-state flag
    pub saved_state: u8,
    /// Reserved, replayed verbatim
    pub reserved: [u8; RESERVED_SIZE],
    /// Footer was found shifted by one byte
    pub is_short: bool,
}

impl Footer {
    /// Create a footer for a new disk of `size` bytes
    pub fn new(disk_type: DiskType, size: u64) -> Self {
        let data_offset = if disk_type.is_sparse() {
            FOOTER_SIZE as u64
        } else {
            NULL_OFFSET
        };
        let creator_host_os = if cfg!(windows) {
            HOST_OS_WINDOWS
        } else {
            HOST_OS_MACINTOSH
        };
        let creator_version = Version::new(
            env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        );

        let mut footer = Footer {
            features: Features::RESERVED,
            format_version: Version::new(1, 0),
            data_offset,
            timestamp: now_timestamp(),
            creator_application: CREATOR_APPLICATION,
            creator_version,
            creator_host_os,
            original_size: size,
            current_size: size,
            geometry: DiskGeometry::from_capacity(size),
            disk_type,
            checksum: 0,
            unique_id: Uuid::new_v4(),
            saved_state: 0,
            reserved: [0u8; RESERVED_SIZE],
            is_short: false,
        };
        footer.update_checksum();
        footer
    }

    /// Parse a footer from `bytes` starting at `offset`
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self> {
        let is_short = bytes.get(offset) == Some(&0)
            && bytes.get(offset + 1..offset + 9) == Some(&FOOTER_SIGNATURE[..]);
        let (start, needed) = if is_short {
            (offset + 1, FOOTER_SIZE - 1)
        } else {
            (offset, FOOTER_SIZE)
        };

        let available = bytes.len().saturating_sub(start);
        if available < needed {
            return Err(VhdError::InvalidFormat(format!(
                "footer needs {needed} bytes, got {available}"
            )));
        }
        if is_short {
            warn!(offset, "footer is shifted by one byte");
        }

        // A short footer loses its last reserved byte
        let mut raw = [0u8; FOOTER_SIZE];
        raw[..needed].copy_from_slice(&bytes[start..start + needed]);

        if &raw[0..8] != FOOTER_SIGNATURE {
            return Err(VhdError::InvalidSignature {
                found: String::from_utf8_lossy(&raw[0..8]).into_owned(),
                expected: "conectix",
            });
        }

        let mut cursor = Cursor::new(&raw[..]);
        cursor.set_position(8);
        let features = Features::from_bits_retain(cursor.read_u32::<BigEndian>()?);
        let format_version = Version::parse(&raw[12..12 + Version::SIZE]);
        cursor.set_position(16);
        let data_offset = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_u32::<BigEndian>()?;

        let mut creator_application = [0u8; 4];
        creator_application.copy_from_slice(&raw[28..32]);
        let creator_version = Version::parse(&raw[32..32 + Version::SIZE]);
        cursor.set_position(36);
        let creator_host_os = cursor.read_u32::<BigEndian>()?;
        let original_size = cursor.read_u64::<BigEndian>()?;
        let current_size = cursor.read_u64::<BigEndian>()?;
        let geometry = DiskGeometry::new(
            cursor.read_u16::<BigEndian>()?,
            cursor.read_u8()?,
            cursor.read_u8()?,
        );
        let disk_type = DiskType::from(cursor.read_u32::<BigEndian>()?);
        let checksum = cursor.read_u32::<BigEndian>()?;

        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&raw[68..84]);
        let saved_state = raw[84];

        let mut reserved = [0u8; RESERVED_SIZE];
        reserved.copy_from_slice(&raw[RESERVED_OFFSET..FOOTER_SIZE]);

        Ok(Footer {
            features,
            format_version,
            data_offset,
            timestamp,
            creator_application,
            creator_version,
            creator_host_os,
            original_size,
            current_size,
            geometry,
            disk_type,
            checksum,
            unique_id: Uuid::from_bytes(unique_id),
            saved_state,
            reserved,
            is_short,
        })
    }

    /// Serialize into `buf` at `offset`, computing and patching the checksum
    ///
    /// Always writes a 512-byte window; a short footer is written as a
    /// 0x00 byte followed by its first 511 bytes.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let len = buf.len();
        let window = buf.get_mut(offset..offset + FOOTER_SIZE).ok_or_else(|| {
            VhdError::InvalidArgument(format!(
                "footer needs {FOOTER_SIZE} bytes at offset {offset}, buffer is {len}"
            ))
        })?;
        window.copy_from_slice(&self.to_bytes());
        Ok(())
    }

    /// Serialize to a fresh 512-byte buffer
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut window = [0u8; FOOTER_SIZE];
        self.encode(&mut window);
        window
    }

    fn encode(&self, window: &mut [u8; FOOTER_SIZE]) {
        let mut raw = [0u8; FOOTER_SIZE];
        raw[0..8].copy_from_slice(FOOTER_SIGNATURE);
        BigEndian::write_u32(&mut raw[8..12], self.features.bits());
        self.format_version.write(&mut raw[12..12 + Version::SIZE]);
        BigEndian::write_u64(&mut raw[16..24], self.data_offset);
        BigEndian::write_u32(&mut raw[24..28], self.timestamp);
        raw[28..32].copy_from_slice(&self.creator_application);
        self.creator_version.write(&mut raw[32..32 + Version::SIZE]);
        BigEndian::write_u32(&mut raw[36..40], self.creator_host_os);
        BigEndian::write_u64(&mut raw[40..48], self.original_size);
        BigEndian::write_u64(&mut raw[48..56], self.current_size);
        BigEndian::write_u16(&mut raw[56..58], self.geometry.cylinders);
        raw[58] = self.geometry.heads;
        raw[59] = self.geometry.sectors;
        BigEndian::write_u32(&mut raw[60..64], self.disk_type.as_u32());
        raw[68..84].copy_from_slice(self.unique_id.as_bytes());
        raw[84] = self.saved_state;
        raw[RESERVED_OFFSET..FOOTER_SIZE].copy_from_slice(&self.reserved);

        let checksum_offset = if self.is_short {
            window[0] = 0;
            window[1..].copy_from_slice(&raw[..FOOTER_SIZE - 1]);
            FOOTER_CHECKSUM_OFFSET + 1
        } else {
            window.copy_from_slice(&raw);
            FOOTER_CHECKSUM_OFFSET
        };

        let sum = checksum::checksum(&window[..]);
        BigEndian::write_u32(&mut window[checksum_offset..checksum_offset + 4], sum);
    }

    /// Checksum the footer would carry if written now
    pub fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        let field = if self.is_short {
            FOOTER_CHECKSUM_OFFSET + 1
        } else {
            FOOTER_CHECKSUM_OFFSET
        };
        checksum::stored_checksum(&bytes, field)
    }

    /// Check the stored checksum against the computed one
    pub fn verify_checksum(&self) -> Result<()> {
        let actual = self.compute_checksum();
        if actual != self.checksum {
            return Err(VhdError::ChecksumMismatch {
                structure: "footer",
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

    /// Returns `true` if a dynamic header follows at `data_offset`
    pub fn has_header(&self) -> bool {
        self.disk_type.is_sparse() && self.data_offset != NULL_OFFSET
    }

    /// Creation time as `SystemTime`
    pub fn modified_time(&self) -> SystemTime {
        timestamp_to_system_time(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fixed_footer() {
        let footer = Footer::new(DiskType::Fixed, 10 * 1024 * 1024);
        assert_eq!(footer.data_offset, NULL_OFFSET);
        assert_eq!(footer.geometry, DiskGeometry::new(301, 4, 17));
        assert_eq!(footer.features, Features::RESERVED);
        assert!(!footer.has_header());
        assert!(footer.verify_checksum().is_ok());

        let bytes = footer.to_bytes();
        assert_eq!(&bytes[0..8], b"conectix");
        assert_eq!(checksum::verify(&bytes, FOOTER_CHECKSUM_OFFSET), Ok(()));
    }

    #[test]
    fn test_new_dynamic_footer() {
        let footer = Footer::new(DiskType::Dynamic, 1 << 30);
        assert_eq!(footer.data_offset, 512);
        assert!(footer.has_header());
        assert_ne!(footer.unique_id, Uuid::nil());

        let parsed = Footer::parse(&footer.to_bytes(), 0).unwrap();
        assert_eq!(parsed, footer);
    }

    #[test]
    fn test_write_at_offset_matches_to_bytes() {
        let footer = Footer::new(DiskType::Fixed, 4096);
        let mut buf = vec![0xEEu8; 1024];
        footer.write(&mut buf, 256).unwrap();
        assert_eq!(&buf[256..768], &footer.to_bytes()[..]);
        assert!(buf[..256].iter().chain(&buf[768..]).all(|&b| b == 0xEE));

        assert!(matches!(
            footer.write(&mut buf, 600),
            Err(VhdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_signature() {
        let mut bytes = Footer::new(DiskType::Fixed, 4096).to_bytes();
        bytes[0..8].copy_from_slice(b"cxsparse");
        match Footer::parse(&bytes, 0) {
            Err(VhdError::InvalidSignature { found, expected }) => {
                assert_eq!(found, "cxsparse");
                assert_eq!(expected, "conectix");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(
            Footer::parse(&[0u8; 100], 0),
            Err(VhdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = Footer::new(DiskType::Fixed, 4096).to_bytes();
        bytes[50] ^= 0x10;
        let footer = Footer::parse(&bytes, 0).unwrap();
        assert!(matches!(
            footer.verify_checksum(),
            Err(VhdError::ChecksumMismatch { structure: "footer", .. })
        ));
    }

    #[test]
    fn test_short_footer_round_trip() {
        let footer = Footer::new(DiskType::Dynamic, 1 << 20);
        let full = footer.to_bytes();

        let mut shifted = vec![0u8; FOOTER_SIZE];
        shifted[1..].copy_from_slice(&full[..FOOTER_SIZE - 1]);
        // Checksum over the shifted window; the dropped byte is zero
        assert_eq!(checksum::verify(&shifted, FOOTER_CHECKSUM_OFFSET + 1), Ok(()));

        let parsed = Footer::parse(&shifted, 0).unwrap();
        assert!(parsed.is_short);
        assert_eq!(parsed.current_size, 1 << 20);
        assert_eq!(parsed.unique_id, footer.unique_id);
        assert!(parsed.verify_checksum().is_ok());
        assert_eq!(&parsed.to_bytes()[..], &shifted[..]);
    }

    #[test]
    fn test_short_footer_ignores_following_bytes() {
        let footer = Footer::new(DiskType::Dynamic, 1 << 20);
        let full = footer.to_bytes();

        // Shifted copy followed directly by more data
        let mut buf = vec![0u8; FOOTER_SIZE + 8];
        buf[1..FOOTER_SIZE].copy_from_slice(&full[..FOOTER_SIZE - 1]);
        buf[FOOTER_SIZE..].copy_from_slice(b"cxsparse");

        let parsed = Footer::parse(&buf, 0).unwrap();
        assert!(parsed.is_short);
        assert_eq!(parsed.reserved[RESERVED_SIZE - 1], 0);
        assert!(parsed.verify_checksum().is_ok());
    }
}
