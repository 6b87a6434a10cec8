//! One's-complement checksum used by the VHD footer and dynamic header
//!
//! The checksum is the bitwise complement of the 32-bit wrapping sum of
//! every byte of the structure, taken with the checksum field itself
//! treated as zero.

use byteorder::{BigEndian, ByteOrder};

/// Offset of the checksum field inside the footer
pub const FOOTER_CHECKSUM_OFFSET: usize = 64;

/// Offset of the checksum field inside the dynamic header
pub const HEADER_CHECKSUM_OFFSET: usize = 36;

/// One's complement of the byte sum of `data`
pub fn checksum(data: &[u8]) -> u32 {
    !data
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}

/// Checksum of `data` with the 4-byte field at `field_offset` treated as zero
pub fn checksum_excluding(data: &[u8], field_offset: usize) -> u32 {
    let field = field_offset..field_offset + 4;
    !data
        .iter()
        .enumerate()
        .filter(|(i, _)| !field.contains(i))
        .fold(0u32, |sum, (_, &b)| sum.wrapping_add(b as u32))
}

/// Read the stored checksum at `field_offset`
pub fn stored_checksum(data: &[u8], field_offset: usize) -> u32 {
    BigEndian::read_u32(&data[field_offset..field_offset + 4])
}

/// Verify the stored checksum of a structure
/// Returns Err with (expected, actual) values on mismatch
pub fn verify(data: &[u8], field_offset: usize) -> Result<(), (u32, u32)> {
    let expected = stored_checksum(data, field_offset);
    let actual = checksum_excluding(data, field_offset);
    if expected == actual {
        Ok(())
    } else {
        Err((expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_of_zeros() {
        assert_eq!(checksum(&[0u8; 512]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_checksum_known_value() {
        // 0x01 + 0x02 + 0xFF = 0x102
        assert_eq!(checksum(&[0x01, 0x02, 0xFF]), !0x102u32);
    }

    #[test]
    fn test_checksum_ignores_field_value() {
        let mut data = [7u8; 128];
        let a = checksum_excluding(&data, 36);
        data[36..40].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let b = checksum_excluding(&data, 36);
        assert_eq!(a, b);

        // Stable under repeated computation
        assert_eq!(checksum_excluding(&data, 36), b);

        // Equivalent to zeroing the field first
        data[36..40].fill(0);
        assert_eq!(checksum(&data), a);
    }

    #[test]
    fn test_verify() {
        let mut data = [3u8; 64];
        let sum = checksum_excluding(&data, 8);
        BigEndian::write_u32(&mut data[8..12], sum);
        assert!(verify(&data, 8).is_ok());

        data[0] ^= 0xFF;
        let (expected, actual) = verify(&data, 8).unwrap_err();
        assert_eq!(expected, sum);
        assert_ne!(expected, actual);
    }
}
