//! Raw bit copying into and out of byte slices. Bits are stored LSB first: the first bit written
//!  at a byte boundary ends up in the lowest bit of that byte.

use std::cmp::min;

/// Writes the lowest `num_bits` bits of `value` to `dest`, starting at bit `bit_offset`.
///
/// The caller guarantees that `dest` is big enough.
pub fn write_bits(dest: &mut [u8], bit_offset: usize, value: u64, num_bits: usize) {
    debug_assert!(num_bits <= 64);
    debug_assert!(bit_offset + num_bits <= dest.len() * 8);

    let mut value = value;
    let mut remaining = num_bits;
    let mut pos = bit_offset;

    while remaining > 0 {
        let byte_idx = pos / 8;
        let bit_in_byte = pos % 8;
        let n = min(8 - bit_in_byte, remaining);
        let mask = ((1u16 << n) - 1) as u8;

        let bits = (value as u8) & mask;
        dest[byte_idx] = (dest[byte_idx] & !(mask << bit_in_byte)) | (bits << bit_in_byte);

        value = value.checked_shr(n as u32).unwrap_or(0);
        remaining -= n;
        pos += n;
    }
}

/// Reads `num_bits` bits from `src` starting at bit `bit_offset`. The caller guarantees that the
///  bits are inside the slice.
pub fn read_bits(src: &[u8], bit_offset: usize, num_bits: usize) -> u64 {
    debug_assert!(num_bits <= 64);
    debug_assert!(bit_offset + num_bits <= src.len() * 8);

    let mut result = 0u64;
    let mut shift = 0usize;
    let mut remaining = num_bits;
    let mut pos = bit_offset;

    while remaining > 0 {
        let byte_idx = pos / 8;
        let bit_in_byte = pos % 8;
        let n = min(8 - bit_in_byte, remaining);
        let mask = ((1u16 << n) - 1) as u8;

        let bits = (src[byte_idx] >> bit_in_byte) & mask;
        result |= (bits as u64) << shift;

        shift += n;
        remaining -= n;
        pos += n;
    }
    result
}

/// number of bits needed to represent `value`, at least 1
pub fn bits_to_hold_u64(value: u64) -> usize {
    if value == 0 {
        1
    }
    else {
        (64 - value.leading_zeros()) as usize
    }
}

pub fn bits_to_hold_u32(value: u32) -> usize {
    bits_to_hold_u64(value.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::aligned_byte(0, 0xab, 8)]
    #[case::unaligned_byte(3, 0xab, 8)]
    #[case::single_bit(7, 1, 1)]
    #[case::across_bytes(5, 0x1ff, 9)]
    #[case::full_u64(0, u64::MAX, 64)]
    #[case::full_u64_unaligned(6, 0x8000_0000_0000_0001, 64)]
    fn test_write_read(#[case] offset: usize, #[case] value: u64, #[case] num_bits: usize) {
        let mut buf = vec![0u8; 16];
        write_bits(&mut buf, offset, value, num_bits);
        assert_eq!(read_bits(&buf, offset, num_bits), value);
    }

    #[test]
    fn test_write_preserves_neighbours() {
        let mut buf = vec![0xffu8; 2];
        write_bits(&mut buf, 4, 0, 4);
        assert_eq!(buf, vec![0x0f, 0xff]);
    }

    #[test]
    fn test_lsb_first() {
        let mut buf = vec![0u8; 1];
        write_bits(&mut buf, 0, 1, 1);
        write_bits(&mut buf, 1, 0, 1);
        write_bits(&mut buf, 2, 1, 1);
        assert_eq!(buf[0], 0b101);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(255, 8)]
    #[case(256, 9)]
    #[case(u64::MAX, 64)]
    fn test_bits_to_hold(#[case] value: u64, #[case] expected: usize) {
        assert_eq!(bits_to_hold_u64(value), expected);
    }
}
