//! Parent locator entries of a differencing disk header
//!
//! | Field          | Size | Offset |
//! |----------------|------|--------|
//! | Platform code  | 4    | 0      |
//! | Data space     | 4    | 4      |
//! | Data length    | 4    | 8      |
//! | Reserved       | 4    | 12     |
//! | Data offset    | 8    | 16     |

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, VhdError};
use crate::format::{PlatformCode, LOCATOR_SIZE};

/// One 24-byte parent locator entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Locator {
    /// Platform-specific format of the locator data
    pub platform_code: u32,
    /// Space reserved for the locator data
    pub data_space: u32,
    /// Length of the locator data in bytes
    pub data_length: u32,
    /// Reserved, replayed verbatim
    pub reserved: u32,
    /// Absolute file offset of the locator data
    pub data_offset: u64,
}

impl Locator {
    /// Parse a locator from `bytes` starting at `offset`
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self> {
        let raw = bytes
            .get(offset..offset + LOCATOR_SIZE)
            .ok_or_else(|| VhdError::InvalidFormat("locator entry truncated".into()))?;

        Ok(Locator {
            platform_code: BigEndian::read_u32(&raw[0..4]),
            data_space: BigEndian::read_u32(&raw[4..8]),
            data_length: BigEndian::read_u32(&raw[8..12]),
            reserved: BigEndian::read_u32(&raw[12..16]),
            data_offset: BigEndian::read_u64(&raw[16..24]),
        })
    }

    /// Write the locator into `bytes` starting at `offset`
    pub fn write(&self, bytes: &mut [u8], offset: usize) -> Result<()> {
        let raw = bytes
            .get_mut(offset..offset + LOCATOR_SIZE)
            .ok_or_else(|| VhdError::InvalidArgument("locator buffer too small".into()))?;
        raw.copy_from_slice(&self.to_bytes());
        Ok(())
    }

    /// Convert to bytes
    pub fn to_bytes(&self) -> [u8; LOCATOR_SIZE] {
        let mut raw = [0u8; LOCATOR_SIZE];
        BigEndian::write_u32(&mut raw[0..4], self.platform_code);
        BigEndian::write_u32(&mut raw[4..8], self.data_space);
        BigEndian::write_u32(&mut raw[8..12], self.data_length);
        BigEndian::write_u32(&mut raw[12..16], self.reserved);
        BigEndian::write_u64(&mut raw[16..24], self.data_offset);
        raw
    }

    pub fn platform(&self) -> PlatformCode {
        PlatformCode::from(self.platform_code)
    }

    /// An unused slot points nowhere
    pub fn is_empty(&self) -> bool {
        self.platform_code == 0 && self.data_offset == 0
    }

    /// Decode locator data read from `data_offset` into a path
    ///
    /// Returns `None` for Mac alias blobs and unknown platforms.
    pub fn decode_path(&self, data: &[u8]) -> Option<String> {
        let data = &data[..data.len().min(self.data_length as usize)];
        let path = match self.platform() {
            PlatformCode::W2ku | PlatformCode::W2ru => {
                let units: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .take_while(|&u| u != 0)
                    .collect();
                String::from_utf16(&units).ok()?
            }
            PlatformCode::MacX => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                String::from_utf8(data[..end].to_vec()).ok()?
            }
            // Deprecated codes store a plain byte string
            PlatformCode::Wi2k | PlatformCode::Wi2r => data
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect(),
            PlatformCode::Mac | PlatformCode::None | PlatformCode::Unknown(_) => return None,
        };
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_layout() {
        let locator = Locator {
            platform_code: PlatformCode::W2ku.as_u32(),
            data_space: 512,
            data_length: 40,
            reserved: 0xAABB_CCDD,
            data_offset: 0x0000_0001_0000_0600,
        };

        let bytes = locator.to_bytes();
        assert_eq!(&bytes[0..4], b"W2ku");
        assert_eq!(&bytes[12..16], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&bytes[16..24], &[0, 0, 0, 1, 0, 0, 0x06, 0]);

        let mut buf = [0u8; 48];
        locator.write(&mut buf, 24).unwrap();
        assert_eq!(&buf[24..], &bytes[..]);
        assert_eq!(Locator::parse(&buf, 24).unwrap(), locator);
    }

    #[test]
    fn test_parse_truncated() {
        assert!(matches!(
            Locator::parse(&[0u8; 20], 0),
            Err(VhdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_empty_slot() {
        assert!(Locator::default().is_empty());
        assert_eq!(Locator::default().platform(), PlatformCode::None);
    }

    #[test]
    fn test_decode_utf16_path() {
        let path = "C:\\disks\\parent.vhd";
        let data: Vec<u8> = path.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let locator = Locator {
            platform_code: PlatformCode::W2ku.as_u32(),
            data_space: 512,
            data_length: data.len() as u32,
            ..Default::default()
        };
        let mut padded = data.clone();
        padded.resize(512, 0);
        assert_eq!(locator.decode_path(&padded).as_deref(), Some(path));
    }

    #[test]
    fn test_decode_macx_url() {
        let url = b"file://localhost/Users/me/parent.vhd";
        let locator = Locator {
            platform_code: PlatformCode::MacX.as_u32(),
            data_length: url.len() as u32,
            ..Default::default()
        };
        assert_eq!(
            locator.decode_path(url).as_deref(),
            Some("file://localhost/Users/me/parent.vhd")
        );

        let alias = Locator {
            platform_code: PlatformCode::Mac.as_u32(),
            data_length: 4,
            ..Default::default()
        };
        assert_eq!(alias.decode_path(b"blob"), None);
    }
}
