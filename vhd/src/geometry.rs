//! CHS disk geometry stored in the footer
//!
//! The footer records a cylinders/heads/sectors-per-track triple derived
//! from the disk size with a staged approximation. The computation below
//! follows the published VHD algorithm step for step, including its
//! integer truncation.

use std::fmt;

use crate::format::BLOCK_SIZE;

/// Largest sector count representable in the geometry field
pub const MAX_GEOMETRY_SECTORS: u64 = 65535 * 16 * 255;

/// Cylinder/head/sector-per-track triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl DiskGeometry {
    pub const fn new(cylinders: u16, heads: u8, sectors: u8) -> Self {
        DiskGeometry {
            cylinders,
            heads,
            sectors,
        }
    }

    /// Compute the geometry for a disk of `total_sectors` 512-byte sectors
    pub fn from_total_sectors(total_sectors: u64) -> Self {
        let total = total_sectors.min(MAX_GEOMETRY_SECTORS);

        let sectors: u64;
        let heads: u64;
        let cylinder_times_heads: u64;

        if total >= 65535 * 16 * 63 {
            sectors = 255;
            heads = 16;
            cylinder_times_heads = total / sectors;
        } else {
            let mut s = 17;
            let mut cth = total / s;
            let mut h = (cth + 1023) / 1024;

            if h < 4 {
                h = 4;
            }
            if cth >= h * 1024 || h > 16 {
                s = 31;
                h = 16;
                cth = total / s;
            }
            if cth >= h * 1024 {
                s = 63;
                h = 16;
                cth = total / s;
            }

            sectors = s;
            heads = h;
            cylinder_times_heads = cth;
        }

        DiskGeometry {
            cylinders: (cylinder_times_heads / heads) as u16,
            heads: heads as u8,
            sectors: sectors as u8,
        }
    }

    /// Compute the geometry for a disk of `size` bytes
    pub fn from_capacity(size: u64) -> Self {
        Self::from_total_sectors(size / BLOCK_SIZE as u64)
    }

    /// Number of sectors addressed by this geometry
    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors as u64
    }

    /// Capacity addressed by this geometry in bytes
    pub fn capacity(&self) -> u64 {
        self.total_sectors() * BLOCK_SIZE as u64
    }
}

impl fmt::Display for DiskGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cylinders, self.heads, self.sectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_mib_disk() {
        // 10 MiB = 20480 sectors
        let geometry = DiskGeometry::from_capacity(10 * 1024 * 1024);
        assert_eq!(geometry, DiskGeometry::new(301, 4, 17));
    }

    #[test]
    fn test_large_disk_uses_255_sectors() {
        let geometry = DiskGeometry::from_total_sectors(65535 * 16 * 63);
        assert_eq!(geometry.sectors, 255);
        assert_eq!(geometry.heads, 16);
    }

    #[test]
    fn test_clamped_to_maximum() {
        let geometry = DiskGeometry::from_total_sectors(u64::MAX);
        assert_eq!(geometry, DiskGeometry::new(65535, 16, 255));
        assert_eq!(geometry.total_sectors(), MAX_GEOMETRY_SECTORS);
    }

    #[test]
    fn test_escalates_sectors_per_track() {
        // Enough sectors to overflow 17 spt with 16 heads
        let geometry = DiskGeometry::from_total_sectors(17 * 16 * 1024 + 1);
        assert_eq!(geometry.sectors, 31);
        assert_eq!(geometry.heads, 16);

        // Enough to overflow 31 spt as well
        let geometry = DiskGeometry::from_total_sectors(31 * 16 * 1024 + 1);
        assert_eq!(geometry.sectors, 63);
        assert_eq!(geometry.heads, 16);
    }

    #[test]
    fn test_deterministic_and_bounded() {
        for total in [0u64, 1, 63, 4096, 20480, 1 << 20, 1 << 24, 1 << 28, 1 << 34] {
            let a = DiskGeometry::from_total_sectors(total);
            let b = DiskGeometry::from_total_sectors(total);
            assert_eq!(a, b);
            assert!(a.total_sectors() <= total.min(MAX_GEOMETRY_SECTORS));
        }
    }
}
