//! Binary format definitions shared by the VHD structures
//!
//! A VHD file has one of two layouts:
//! 1. Fixed: raw disk data followed by a 512-byte footer
//! 2. Dynamic / Differencing: footer copy, 1024-byte header, block
//!    allocation table, allocated sectors, trailing footer
//!
//! All multi-byte integers are big-endian.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, VhdError};

/// Footer signature "conectix"
pub const FOOTER_SIGNATURE: &[u8; 8] = b"conectix";

/// Dynamic disk header signature "cxsparse"
pub const HEADER_SIGNATURE: &[u8; 8] = b"cxsparse";

/// Footer size in bytes
pub const FOOTER_SIZE: usize = 512;

/// Dynamic disk header size in bytes
pub const HEADER_SIZE: usize = 1024;

/// Parent locator entry size in bytes
pub const LOCATOR_SIZE: usize = 24;

/// Number of parent locator slots in a header
pub const LOCATOR_COUNT: usize = 8;

/// Size of one allocation table entry in bytes
pub const TABLE_ENTRY_SIZE: usize = 4;

/// Addressable block size in bytes
pub const BLOCK_SIZE: u32 = 512;

/// Default sparse sector size: 4096 blocks of 512 bytes (2 MiB)
pub const DEFAULT_SECTOR_SIZE: u32 = 4096 * BLOCK_SIZE;

/// Allocation table value of a sector that was never allocated
pub const SECTOR_FREE: u32 = 0xFFFF_FFFF;

/// Data offset value meaning "no next structure" (Fixed disks)
pub const NULL_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// VHD epoch (2000-01-01T00:00:00Z) in seconds since the Unix epoch
pub const VHD_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// VHD epoch in milliseconds since the Unix epoch
pub const VHD_EPOCH_MILLIS: u64 = VHD_EPOCH_UNIX_SECS * 1000;

/// Creator host OS "Wi2k"
pub const HOST_OS_WINDOWS: u32 = 0x5769_326B;

/// Creator host OS "Mac "
pub const HOST_OS_MACINTOSH: u32 = 0x4D61_6320;

/// Name of a creator host OS code, if known
pub fn host_os_name(code: u32) -> Option<&'static str> {
    match code {
        HOST_OS_WINDOWS => Some("Windows"),
        HOST_OS_MACINTOSH => Some("Macintosh"),
        _ => None,
    }
}

/// Render a 4-byte tag (creator application, platform code) as text
pub fn tag_string(tag: [u8; 4]) -> String {
    tag.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

/// Disk type field of the footer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskType {
    /// No disk
    None,
    /// Flat image: data followed by the footer
    Fixed,
    /// Sparse image growing on demand
    Dynamic,
    /// Sparse image holding changes against a parent image
    Differencing,
    /// Deprecated or reserved code, kept for round-trip
    Reserved(u32),
}

impl DiskType {
    /// Raw on-disk value
    pub fn as_u32(self) -> u32 {
        match self {
            DiskType::None => 0,
            DiskType::Fixed => 2,
            DiskType::Dynamic => 3,
            DiskType::Differencing => 4,
            DiskType::Reserved(value) => value,
        }
    }

    /// Returns `true` if the disk carries a dynamic header and allocation table
    pub fn is_sparse(self) -> bool {
        matches!(self, DiskType::Dynamic | DiskType::Differencing)
    }
}

impl From<u32> for DiskType {
    fn from(value: u32) -> Self {
        match value {
            0 => DiskType::None,
            2 => DiskType::Fixed,
            3 => DiskType::Dynamic,
            4 => DiskType::Differencing,
            other => DiskType::Reserved(other),
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskType::None => write!(f, "None"),
            DiskType::Fixed => write!(f, "Fixed"),
            DiskType::Dynamic => write!(f, "Dynamic"),
            DiskType::Differencing => write!(f, "Differencing"),
            DiskType::Reserved(value) => write!(f, "Reserved ({value})"),
        }
    }
}

bitflags! {
    /// Footer feature flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Disk is a candidate for deletion on shutdown
        const TEMPORARY = 0x0000_0001;
        /// Always set by conforming writers
        const RESERVED = 0x0000_0002;
    }
}

/// Parent locator platform codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformCode {
    /// Unused slot
    None,
    /// Relative Windows path (deprecated)
    Wi2r,
    /// Absolute Windows path (deprecated)
    Wi2k,
    /// Relative Windows path, UTF-16LE
    W2ru,
    /// Absolute Windows path, UTF-16LE
    W2ku,
    /// Mac OS alias blob
    Mac,
    /// Mac OS X file URL, UTF-8
    MacX,
    /// Any other code, kept for round-trip
    Unknown(u32),
}

impl PlatformCode {
    /// Raw on-disk value
    pub fn as_u32(self) -> u32 {
        match self {
            PlatformCode::None => 0x0000_0000,
            PlatformCode::Wi2r => 0x5769_3272,
            PlatformCode::Wi2k => 0x5769_326B,
            PlatformCode::W2ru => 0x5732_7275,
            PlatformCode::W2ku => 0x5732_6B75,
            PlatformCode::Mac => 0x4D61_6320,
            PlatformCode::MacX => 0x4D61_6358,
            PlatformCode::Unknown(value) => value,
        }
    }
}

impl From<u32> for PlatformCode {
    fn from(value: u32) -> Self {
        match value {
            0x0000_0000 => PlatformCode::None,
            0x5769_3272 => PlatformCode::Wi2r,
            0x5769_326B => PlatformCode::Wi2k,
            0x5732_7275 => PlatformCode::W2ru,
            0x5732_6B75 => PlatformCode::W2ku,
            0x4D61_6320 => PlatformCode::Mac,
            0x4D61_6358 => PlatformCode::MacX,
            other => PlatformCode::Unknown(other),
        }
    }
}

impl fmt::Display for PlatformCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformCode::None => write!(f, "None"),
            PlatformCode::Unknown(value) => write!(f, "Unknown ({value:#010x})"),
            other => {
                let mut tag = [0u8; 4];
                BigEndian::write_u32(&mut tag, other.as_u32());
                write!(f, "{}", tag_string(tag).trim_end())
            }
        }
    }
}

/// A `major.minor` version pair stored as two big-endian u16
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    /// Encoded size in bytes
    pub const SIZE: usize = 4;

    pub const fn new(major: u16, minor: u16) -> Self {
        Version { major, minor }
    }

    /// Parse from the first 4 bytes of `bytes`
    pub fn parse(bytes: &[u8]) -> Self {
        let bytes = &bytes[..Self::SIZE];
        Version {
            major: BigEndian::read_u16(&bytes[0..2]),
            minor: BigEndian::read_u16(&bytes[2..4]),
        }
    }

    /// Write into the first 4 bytes of `bytes`
    pub fn write(&self, bytes: &mut [u8]) {
        let bytes = &mut bytes[..Self::SIZE];
        BigEndian::write_u16(&mut bytes[0..2], self.major);
        BigEndian::write_u16(&mut bytes[2..4], self.minor);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = VhdError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u16> {
            match parts.next() {
                None | Some("") => Ok(0),
                Some(part) => part
                    .parse()
                    .map_err(|_| VhdError::InvalidArgument(format!("invalid version {s:?}"))),
            }
        };
        let major = next()?;
        let minor = next()?;
        Ok(Version { major, minor })
    }
}

/// Convert a VHD timestamp (seconds since 2000-01-01) to `SystemTime`
pub fn timestamp_to_system_time(timestamp: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(VHD_EPOCH_MILLIS + timestamp as u64 * 1000)
}

/// Convert a `SystemTime` to a VHD timestamp, saturating at both ends of the range
pub fn system_time_to_timestamp(time: SystemTime) -> u32 {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.saturating_sub(VHD_EPOCH_UNIX_SECS).min(u32::MAX as u64) as u32
}

/// Current time as a VHD timestamp
pub fn now_timestamp() -> u32 {
    system_time_to_timestamp(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_type_conversion() {
        assert_eq!(DiskType::from(2), DiskType::Fixed);
        assert_eq!(DiskType::from(3), DiskType::Dynamic);
        assert_eq!(DiskType::from(4), DiskType::Differencing);
        assert_eq!(DiskType::from(0), DiskType::None);
        assert_eq!(DiskType::from(6), DiskType::Reserved(6));
        assert_eq!(DiskType::Reserved(6).as_u32(), 6);
        assert!(DiskType::Differencing.is_sparse());
        assert!(!DiskType::Fixed.is_sparse());
    }

    #[test]
    fn test_platform_codes() {
        assert_eq!(PlatformCode::from(0x5732_6B75), PlatformCode::W2ku);
        assert_eq!(PlatformCode::MacX.to_string(), "MacX");
        assert_eq!(PlatformCode::Mac.to_string(), "Mac");
        assert_eq!(PlatformCode::from(0x1234).as_u32(), 0x1234);
    }

    #[test]
    fn test_version_parse_and_display() {
        let v: Version = "10.0".parse().unwrap();
        assert_eq!(v, Version::new(10, 0));
        assert_eq!(v.to_string(), "10.0");
        assert_eq!("1".parse::<Version>().unwrap(), Version::new(1, 0));
        assert!("x.1".parse::<Version>().is_err());

        let mut buf = [0u8; 4];
        Version::new(1, 3).write(&mut buf);
        assert_eq!(buf, [0, 1, 0, 3]);
        assert_eq!(Version::parse(&buf), Version::new(1, 3));
    }

    #[test]
    fn test_epoch_conversion() {
        // 2017-06-20T22:58:11Z
        let time = timestamp_to_system_time(551_314_691);
        let millis = time.duration_since(UNIX_EPOCH).unwrap().as_millis();
        assert_eq!(millis, 1_497_999_491_000);
        assert_eq!(system_time_to_timestamp(time), 551_314_691);
        assert_eq!(system_time_to_timestamp(UNIX_EPOCH), 0);

        let epoch = timestamp_to_system_time(0).duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(epoch.as_millis() as u64, VHD_EPOCH_MILLIS);
    }

    #[test]
    fn test_host_os_names() {
        assert_eq!(host_os_name(HOST_OS_WINDOWS), Some("Windows"));
        assert_eq!(host_os_name(0), None);
        assert_eq!(tag_string(*b"win "), "win ");
    }
}
