use crate::bits::bit_ops::{bits_to_hold_u32, read_bits, write_bits};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use anyhow::{anyhow, bail};
use std::fmt::{Debug, Formatter};

/// maximum number of bytes in a var-int encoded u32
const MAX_VAR_U32_BYTES: usize = 5;
/// maximum number of bytes in a var-int encoded u64
const MAX_VAR_U64_BYTES: usize = 10;

/// A growable buffer that stores values as a contiguous stream of bits.
///
/// Writing appends at the end (growing the backing storage as needed), reading consumes from an
///  independent read position. Reads never go past [BitBuffer::bit_len] - they fail instead of
///  returning garbage, which is what makes it safe to parse untrusted network data with it.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct BitBuffer {
    data: Vec<u8>,
    bit_len: usize,
    read_pos: usize,
}

impl Debug for BitBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BITS{{{}@{}:{:?}}}", self.bit_len, self.read_pos, self.as_bytes())
    }
}

impl BitBuffer {
    pub fn new() -> BitBuffer {
        Self::default()
    }

    pub fn with_capacity(num_bytes: usize) -> BitBuffer {
        BitBuffer {
            data: Vec::with_capacity(num_bytes),
            bit_len: 0,
            read_pos: 0,
        }
    }

    /// Wraps storage (typically recycled from a pool), discarding its previous contents while
    ///  keeping its allocation
    pub fn from_storage(mut storage: Vec<u8>) -> BitBuffer {
        storage.clear();
        BitBuffer {
            data: storage,
            bit_len: 0,
            read_pos: 0,
        }
    }

    /// a buffer that contains exactly the given bytes, positioned at the start for reading
    pub fn from_bytes(bytes: &[u8]) -> BitBuffer {
        let mut result = BitBuffer::with_capacity(bytes.len());
        result.write_bytes(bytes);
        result
    }

    pub fn into_storage(self) -> Vec<u8> {
        self.data
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn byte_len(&self) -> usize {
        self.bit_len.div_ceil(8)
    }

    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    /// the read position in bits
    pub fn position(&self) -> usize {
        self.read_pos
    }

    pub fn set_position(&mut self, bit_pos: usize) -> anyhow::Result<()> {
        if bit_pos > self.bit_len {
            bail!("read position {} is after the end of the buffer ({} bits)", bit_pos, self.bit_len);
        }
        self.read_pos = bit_pos;
        Ok(())
    }

    pub fn remaining_bits(&self) -> usize {
        self.bit_len - self.read_pos
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.byte_len()]
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.bit_len = 0;
        self.read_pos = 0;
    }

    /// Replaces the buffer's contents, e.g. with a reassembled message. The read position is reset.
    pub fn replace_contents(&mut self, bytes: &[u8], bit_len: usize) {
        debug_assert!(bit_len <= bytes.len() * 8);
        self.clear();
        self.data.extend_from_slice(bytes);
        self.bit_len = bit_len;
    }

    fn ensure_bits(&mut self, additional_bits: usize) {
        let required_bytes = (self.bit_len + additional_bits).div_ceil(8);
        if self.data.len() < required_bytes {
            self.data.resize(required_bytes, 0);
        }
    }

    fn check_readable(&self, num_bits: usize) -> anyhow::Result<()> {
        if self.read_pos + num_bits > self.bit_len {
            bail!("read overflow: reading {} bits at position {} of a {} bit buffer", num_bits, self.read_pos, self.bit_len);
        }
        Ok(())
    }

    // ------------------------------ raw bits

    pub fn write_bits(&mut self, value: u64, num_bits: usize) {
        assert!((1..=64).contains(&num_bits), "number of bits must be between 1 and 64, was {}", num_bits);

        self.ensure_bits(num_bits);
        write_bits(&mut self.data, self.bit_len, value, num_bits);
        self.bit_len += num_bits;
    }

    pub fn read_bits(&mut self, num_bits: usize) -> anyhow::Result<u64> {
        if !(1..=64).contains(&num_bits) {
            bail!("number of bits must be between 1 and 64, was {}", num_bits);
        }
        self.check_readable(num_bits)?;

        let result = read_bits(&self.data, self.read_pos, num_bits);
        self.read_pos += num_bits;
        Ok(result)
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(value as u64, 1);
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    // ------------------------------ fixed width integers

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value.into(), 8);
    }
    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }
    pub fn read_i8(&mut self) -> anyhow::Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(value.into(), 16);
    }
    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_u16(value as u16);
    }
    pub fn read_i16(&mut self) -> anyhow::Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(value.into(), 32);
    }
    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        Ok(self.read_bits(32)? as u32)
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }
    pub fn read_i32(&mut self) -> anyhow::Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bits(value, 64);
    }
    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        self.read_bits(64)
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }
    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    // ------------------------------ arbitrary width integers

    pub fn write_u32_bits(&mut self, value: u32, num_bits: usize) {
        assert!((1..=32).contains(&num_bits));
        self.write_bits(value.into(), num_bits);
    }

    pub fn read_u32_bits(&mut self, num_bits: usize) -> anyhow::Result<u32> {
        if !(1..=32).contains(&num_bits) {
            bail!("number of bits for u32 must be between 1 and 32, was {}", num_bits);
        }
        Ok(self.read_bits(num_bits)? as u32)
    }

    /// writes the lowest `num_bits` bits of the two's complement representation
    pub fn write_i32_bits(&mut self, value: i32, num_bits: usize) {
        assert!((1..=32).contains(&num_bits));
        self.write_bits((value as u32).into(), num_bits);
    }

    pub fn read_i32_bits(&mut self, num_bits: usize) -> anyhow::Result<i32> {
        let raw = self.read_u32_bits(num_bits)?;
        Ok(sign_extend(raw.into(), num_bits) as i32)
    }

    pub fn write_u64_bits(&mut self, value: u64, num_bits: usize) {
        self.write_bits(value, num_bits);
    }

    pub fn read_u64_bits(&mut self, num_bits: usize) -> anyhow::Result<u64> {
        self.read_bits(num_bits)
    }

    pub fn write_i64_bits(&mut self, value: i64, num_bits: usize) {
        self.write_bits(value as u64, num_bits);
    }

    pub fn read_i64_bits(&mut self, num_bits: usize) -> anyhow::Result<i64> {
        let raw = self.read_bits(num_bits)?;
        Ok(sign_extend(raw, num_bits))
    }

    // ------------------------------ floating point

    pub fn write_f32(&mut self, value: f32) {
        if self.bit_len % 8 == 0 {
            self.write_aligned(&value.to_le_bytes());
        }
        else {
            self.write_bits(value.to_bits().into(), 32);
        }
    }

    pub fn read_f32(&mut self) -> anyhow::Result<f32> {
        if self.read_pos % 8 == 0 {
            let mut bytes = [0u8; 4];
            self.read_aligned(&mut bytes)?;
            Ok(f32::from_le_bytes(bytes))
        }
        else {
            Ok(f32::from_bits(self.read_bits(32)? as u32))
        }
    }

    pub fn write_f64(&mut self, value: f64) {
        if self.bit_len % 8 == 0 {
            self.write_aligned(&value.to_le_bytes());
        }
        else {
            self.write_bits(value.to_bits(), 64);
        }
    }

    pub fn read_f64(&mut self) -> anyhow::Result<f64> {
        if self.read_pos % 8 == 0 {
            let mut bytes = [0u8; 8];
            self.read_aligned(&mut bytes)?;
            Ok(f64::from_le_bytes(bytes))
        }
        else {
            Ok(f64::from_bits(self.read_bits(64)?))
        }
    }

    /// Writes a value in the range 0..=1 using `num_bits` bits. Values outside the range are clamped.
    pub fn write_unit_f32(&mut self, value: f32, num_bits: usize) {
        assert!((1..=32).contains(&num_bits));
        let max = max_for_bits(num_bits);
        let unit = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        let encoded = (unit as f64 * max as f64).round() as u64;
        self.write_bits(encoded, num_bits);
    }

    pub fn read_unit_f32(&mut self, num_bits: usize) -> anyhow::Result<f32> {
        let encoded = self.read_u32_bits(num_bits)?;
        Ok((encoded as f64 / max_for_bits(num_bits) as f64) as f32)
    }

    /// Writes a value in the range -1..=1 using `num_bits` bits
    pub fn write_signed_f32(&mut self, value: f32, num_bits: usize) {
        self.write_unit_f32((value + 1.0) * 0.5, num_bits);
    }

    pub fn read_signed_f32(&mut self, num_bits: usize) -> anyhow::Result<f32> {
        Ok(self.read_unit_f32(num_bits)? * 2.0 - 1.0)
    }

    /// Writes a value in the range `min..=max` using `num_bits` bits
    pub fn write_ranged_f32(&mut self, value: f32, min: f32, max: f32, num_bits: usize) {
        assert!(max > min, "empty range {}..{}", min, max);
        self.write_unit_f32((value - min) / (max - min), num_bits);
    }

    pub fn read_ranged_f32(&mut self, min: f32, max: f32, num_bits: usize) -> anyhow::Result<f32> {
        if max <= min {
            bail!("empty range {}..{}", min, max);
        }
        Ok(min + (max - min) * self.read_unit_f32(num_bits)?)
    }

    // ------------------------------ ranged integers

    /// Writes `value` using just enough bits to cover `min..=max`
    pub fn write_ranged_u32(&mut self, value: u32, min: u32, max: u32) {
        assert!(min <= max && (min..=max).contains(&value), "value {} is outside the range {}..={}", value, min, max);
        self.write_u32_bits(value - min, bits_to_hold_u32(max - min));
    }

    pub fn read_ranged_u32(&mut self, min: u32, max: u32) -> anyhow::Result<u32> {
        if min > max {
            bail!("empty range {}..={}", min, max);
        }
        let raw = self.read_u32_bits(bits_to_hold_u32(max - min))?;
        min.checked_add(raw)
            .filter(|v| *v <= max)
            .ok_or_else(|| anyhow!("ranged value {} exceeds the range {}..={}", raw, min, max))
    }

    pub fn write_ranged_i32(&mut self, value: i32, min: i32, max: i32) {
        assert!(min <= max && (min..=max).contains(&value), "value {} is outside the range {}..={}", value, min, max);
        let range = max.abs_diff(min);
        self.write_u32_bits(value.abs_diff(min), bits_to_hold_u32(range));
    }

    pub fn read_ranged_i32(&mut self, min: i32, max: i32) -> anyhow::Result<i32> {
        if min > max {
            bail!("empty range {}..={}", min, max);
        }
        let range = max.abs_diff(min);
        let raw = self.read_u32_bits(bits_to_hold_u32(range))?;
        if raw > range {
            bail!("ranged value {} exceeds the range {}..={}", raw, min, max);
        }
        Ok((min as i64 + raw as i64) as i32)
    }

    // ------------------------------ variable length integers

    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value.into());
    }

    pub fn read_var_u32(&mut self) -> anyhow::Result<u32> {
        let value = self.read_var(MAX_VAR_U32_BYTES)?;
        u32::try_from(value).map_err(|_| anyhow!("malformed var-int: value {} exceeds u32", value))
    }

    pub fn write_var_u64(&mut self, value: u64) {
        let mut value = value;
        loop {
            let low = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.write_u8(low);
                break;
            }
            self.write_u8(low | 0x80);
        }
    }

    pub fn read_var_u64(&mut self) -> anyhow::Result<u64> {
        self.read_var(MAX_VAR_U64_BYTES)
    }

    fn read_var(&mut self, max_bytes: usize) -> anyhow::Result<u64> {
        let mut result = 0u64;
        for i in 0..max_bytes {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64).checked_shl(7 * i as u32).unwrap_or(0);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        bail!("malformed var-int: continuation runs past {} bytes", max_bytes)
    }

    /// zig-zag encoded, so that small negative numbers stay small
    pub fn write_var_i32(&mut self, value: i32) {
        self.write_var_u32(((value << 1) ^ (value >> 31)) as u32);
    }

    pub fn read_var_i32(&mut self) -> anyhow::Result<i32> {
        let raw = self.read_var_u32()?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }

    pub fn write_var_i64(&mut self, value: i64) {
        self.write_var_u64(((value << 1) ^ (value >> 63)) as u64);
    }

    pub fn read_var_i64(&mut self) -> anyhow::Result<i64> {
        let raw = self.read_var_u64()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    // ------------------------------ byte blocks and strings

    fn write_aligned(&mut self, bytes: &[u8]) {
        debug_assert!(self.bit_len % 8 == 0);
        self.data.truncate(self.bit_len / 8);
        self.data.extend_from_slice(bytes);
        self.bit_len += bytes.len() * 8;
    }

    fn read_aligned(&mut self, dest: &mut [u8]) -> anyhow::Result<()> {
        debug_assert!(self.read_pos % 8 == 0);
        self.check_readable(dest.len() * 8)?;
        let start = self.read_pos / 8;
        dest.copy_from_slice(&self.data[start..start + dest.len()]);
        self.read_pos += dest.len() * 8;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.bit_len % 8 == 0 {
            self.write_aligned(bytes);
        }
        else {
            for &b in bytes {
                self.write_u8(b);
            }
        }
    }

    pub fn read_bytes(&mut self, num_bytes: usize) -> anyhow::Result<Vec<u8>> {
        self.check_readable(num_bytes * 8)?;

        let mut result = vec![0u8; num_bytes];
        if self.read_pos % 8 == 0 {
            self.read_aligned(&mut result)?;
        }
        else {
            for b in result.iter_mut() {
                *b = self.read_u8()?;
            }
        }
        Ok(result)
    }

    pub fn write_len_prefixed_bytes(&mut self, bytes: &[u8]) {
        self.write_var_u32(bytes.len().prechecked_cast());
        self.write_bytes(bytes);
    }

    pub fn read_len_prefixed_bytes(&mut self) -> anyhow::Result<Vec<u8>> {
        let len: usize = self.read_var_u32()?.safe_cast();
        // check before allocating - the length comes from the network
        self.check_readable(len.saturating_mul(8))?;
        self.read_bytes(len)
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_len_prefixed_bytes(value.as_bytes());
    }

    pub fn read_string(&mut self) -> anyhow::Result<String> {
        let bytes = self.read_len_prefixed_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| anyhow!("string is not valid UTF-8: {}", e))
    }

    /// Writes zero bits up to the next byte boundary
    pub fn pad_to_byte(&mut self) {
        let padding = (8 - self.bit_len % 8) % 8;
        if padding > 0 {
            self.write_bits(0, padding);
        }
    }

    /// Moves the read position to the next byte boundary
    pub fn skip_to_byte(&mut self) -> anyhow::Result<()> {
        let target = self.read_pos.div_ceil(8) * 8;
        self.set_position(target)
    }

    /// the unread rest of the buffer, starting at the (byte aligned) read position
    pub fn remaining_bytes(&self) -> anyhow::Result<&[u8]> {
        if self.read_pos % 8 != 0 {
            bail!("read position {} is not byte aligned", self.read_pos);
        }
        Ok(&self.data[self.read_pos / 8..self.byte_len()])
    }
}

fn max_for_bits(num_bits: usize) -> u64 {
    if num_bits >= 64 {
        u64::MAX
    }
    else {
        (1u64 << num_bits) - 1
    }
}

fn sign_extend(raw: u64, num_bits: usize) -> i64 {
    if num_bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - num_bits;
    ((raw << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_mixed_sequence() {
        let mut buf = BitBuffer::new();
        buf.write_bool(true);
        buf.write_u32_bits(5, 3);
        buf.write_string("hällo");
        buf.write_f32(1.5);
        buf.write_i16(-1234);
        buf.write_var_i64(-3);
        buf.write_f64(-0.25);

        assert_eq!(buf.read_bool().unwrap(), true);
        assert_eq!(buf.read_u32_bits(3).unwrap(), 5);
        assert_eq!(buf.read_string().unwrap(), "hällo");
        assert_eq!(buf.read_f32().unwrap(), 1.5);
        assert_eq!(buf.read_i16().unwrap(), -1234);
        assert_eq!(buf.read_var_i64().unwrap(), -3);
        assert_eq!(buf.read_f64().unwrap(), -0.25);
        assert_eq!(buf.remaining_bits(), 0);
    }

    #[test]
    fn test_no_alignment_waste() {
        let mut buf = BitBuffer::new();
        for _ in 0..10 {
            buf.write_bool(true);
        }
        assert_eq!(buf.bit_len(), 10);
        assert_eq!(buf.byte_len(), 2);
    }

    #[rstest]
    #[case::aligned(0)]
    #[case::unaligned(3)]
    fn test_float_alignment(#[case] prefix_bits: usize) {
        let mut buf = BitBuffer::new();
        if prefix_bits > 0 {
            buf.write_bits(0b101, prefix_bits);
        }
        buf.write_f32(std::f32::consts::PI);
        buf.write_f64(std::f64::consts::E);

        if prefix_bits > 0 {
            buf.read_bits(prefix_bits).unwrap();
        }
        assert_eq!(buf.read_f32().unwrap(), std::f32::consts::PI);
        assert_eq!(buf.read_f64().unwrap(), std::f64::consts::E);
    }

    #[rstest]
    #[case::minus_one(-1, 4)]
    #[case::min_in_range(-8, 4)]
    #[case::max_in_range(7, 4)]
    #[case::zero(0, 1)]
    #[case::full(i32::MIN, 32)]
    fn test_signed_bits(#[case] value: i32, #[case] num_bits: usize) {
        let mut buf = BitBuffer::new();
        buf.write_i32_bits(value, num_bits);
        assert_eq!(buf.bit_len(), num_bits);
        assert_eq!(buf.read_i32_bits(num_bits).unwrap(), value);
    }

    #[test]
    fn test_signed_bits_64() {
        let mut buf = BitBuffer::new();
        buf.write_i64_bits(-5, 40);
        assert_eq!(buf.read_i64_bits(40).unwrap(), -5);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(127, 1)]
    #[case(128, 2)]
    #[case(16383, 2)]
    #[case(16384, 3)]
    #[case(u32::MAX, 5)]
    fn test_var_u32_len(#[case] value: u32, #[case] expected_bytes: usize) {
        let mut buf = BitBuffer::new();
        buf.write_var_u32(value);
        assert_eq!(buf.byte_len(), expected_bytes);
        assert_eq!(buf.read_var_u32().unwrap(), value);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(-1, 1)]
    #[case(1, 1)]
    #[case(-64, 1)]
    #[case(64, 2)]
    #[case(i32::MIN, 5)]
    #[case(i32::MAX, 5)]
    fn test_var_i32_zigzag(#[case] value: i32, #[case] expected_bytes: usize) {
        let mut buf = BitBuffer::new();
        buf.write_var_i32(value);
        assert_eq!(buf.byte_len(), expected_bytes);
        assert_eq!(buf.read_var_i32().unwrap(), value);
    }

    #[test]
    fn test_var_u64_extremes() {
        let mut buf = BitBuffer::new();
        buf.write_var_u64(u64::MAX);
        buf.write_var_i64(i64::MIN);
        assert_eq!(buf.read_var_u64().unwrap(), u64::MAX);
        assert_eq!(buf.read_var_i64().unwrap(), i64::MIN);
    }

    #[test]
    fn test_malformed_var_int() {
        let mut buf = BitBuffer::from_bytes(&[0xff; 12]);
        assert!(buf.read_var_u64().is_err());

        let mut buf = BitBuffer::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(buf.read_var_u32().is_err());
    }

    #[test]
    fn test_var_int_truncated() {
        let mut buf = BitBuffer::from_bytes(&[0x80, 0x80]);
        assert!(buf.read_var_u32().is_err());
    }

    #[test]
    fn test_read_overflow() {
        let mut buf = BitBuffer::new();
        buf.write_u8(1);
        buf.write_bool(true);

        assert_eq!(buf.read_u8().unwrap(), 1);
        assert!(buf.read_u8().is_err());
        // a failed read does not consume anything
        assert_eq!(buf.position(), 8);
        assert_eq!(buf.read_bool().unwrap(), true);
        assert!(buf.read_bool().is_err());
    }

    #[test]
    fn test_len_prefix_exceeding_buffer() {
        let mut buf = BitBuffer::new();
        buf.write_var_u32(1_000_000);
        buf.write_u8(1);
        assert!(buf.read_len_prefixed_bytes().is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = BitBuffer::new();
        buf.write_len_prefixed_bytes(&[0xc3, 0x28]);
        assert!(buf.read_string().is_err());
    }

    #[rstest]
    #[case::lower_bound(10, 10, 20, 4)]
    #[case::upper_bound(20, 10, 20, 4)]
    #[case::single_value(5, 5, 5, 1)]
    #[case::wide(70_000, 0, 100_000, 17)]
    fn test_ranged_u32(#[case] value: u32, #[case] min: u32, #[case] max: u32, #[case] expected_bits: usize) {
        let mut buf = BitBuffer::new();
        buf.write_ranged_u32(value, min, max);
        assert_eq!(buf.bit_len(), expected_bits);
        assert_eq!(buf.read_ranged_u32(min, max).unwrap(), value);
    }

    #[rstest]
    #[case(-100, -100, 100)]
    #[case(0, -100, 100)]
    #[case(100, -100, 100)]
    #[case(i32::MIN, i32::MIN, i32::MAX)]
    #[case(i32::MAX, i32::MIN, i32::MAX)]
    fn test_ranged_i32(#[case] value: i32, #[case] min: i32, #[case] max: i32) {
        let mut buf = BitBuffer::new();
        buf.write_ranged_i32(value, min, max);
        assert_eq!(buf.read_ranged_i32(min, max).unwrap(), value);
    }

    #[test]
    fn test_ranged_out_of_range_on_read() {
        let mut buf = BitBuffer::new();
        buf.write_u32_bits(15, 4);
        assert!(buf.read_ranged_u32(0, 10).is_err());
    }

    #[rstest]
    #[case::unit_zero(0.0, 8)]
    #[case::unit_one(1.0, 8)]
    #[case::unit_mid(0.5, 12)]
    #[case::unit_fine(0.123, 16)]
    fn test_unit_f32(#[case] value: f32, #[case] num_bits: usize) {
        let mut buf = BitBuffer::new();
        buf.write_unit_f32(value, num_bits);
        assert_eq!(buf.bit_len(), num_bits);
        let read = buf.read_unit_f32(num_bits).unwrap();
        assert!((read - value).abs() <= 1.0 / max_for_bits(num_bits) as f32);
    }

    #[rstest]
    #[case(-1.0)]
    #[case(-0.3)]
    #[case(0.0)]
    #[case(1.0)]
    fn test_signed_f32(#[case] value: f32) {
        let mut buf = BitBuffer::new();
        buf.write_signed_f32(value, 16);
        let read = buf.read_signed_f32(16).unwrap();
        assert!((read - value).abs() < 0.001);
    }

    #[test]
    fn test_ranged_f32() {
        let mut buf = BitBuffer::new();
        buf.write_ranged_f32(37.5, -50.0, 50.0, 20);
        let read = buf.read_ranged_f32(-50.0, 50.0, 20).unwrap();
        assert!((read - 37.5).abs() < 0.001);
    }

    #[test]
    fn test_unit_f32_clamps() {
        let mut buf = BitBuffer::new();
        buf.write_unit_f32(2.0, 8);
        buf.write_unit_f32(-1.0, 8);
        assert_eq!(buf.read_unit_f32(8).unwrap(), 1.0);
        assert_eq!(buf.read_unit_f32(8).unwrap(), 0.0);
    }

    #[test]
    fn test_padding() {
        let mut buf = BitBuffer::new();
        buf.write_bits(1, 3);
        buf.pad_to_byte();
        buf.write_u8(7);
        assert_eq!(buf.bit_len(), 16);

        buf.read_bits(3).unwrap();
        buf.skip_to_byte().unwrap();
        assert_eq!(buf.remaining_bytes().unwrap(), &[7]);
    }

    #[test]
    fn test_unaligned_bytes() {
        let mut buf = BitBuffer::new();
        buf.write_bool(false);
        buf.write_bytes(&[1, 2, 3]);
        buf.read_bool().unwrap();
        assert_eq!(buf.read_bytes(3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_write_after_partial_byte_keeps_data() {
        let mut buf = BitBuffer::new();
        buf.write_bits(0b11, 2);
        buf.pad_to_byte();
        buf.write_bytes(&[0xaa]);
        assert_eq!(buf.as_bytes(), &[0b11, 0xaa]);
    }

    #[test]
    fn test_from_storage_reuses_allocation() {
        let storage = Vec::with_capacity(100);
        let mut buf = BitBuffer::from_storage(storage);
        buf.write_u8(1);
        let storage = buf.into_storage();
        assert!(storage.capacity() >= 100);
    }

    #[test]
    fn test_replace_contents() {
        let mut buf = BitBuffer::from_bytes(&[1, 2, 3]);
        buf.read_u8().unwrap();
        buf.replace_contents(&[9, 8], 12);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.bit_len(), 12);
        assert_eq!(buf.read_u8().unwrap(), 9);
    }
}
