//! Payloads of the protocol's own messages:
//!
//! ```ascii
//! Acknowledge:             repeated (lane: u8, sequence number: u16)
//! Ping / Pong:             ping number (u8)
//! Connect:                 application identifier (string)
//! ConnectResponse:         -
//! ConnectionEstablished:   -
//! Disconnect:              reason (string)
//! ```
//!
//! Strings are a var-int byte length followed by UTF-8 bytes.

use crate::bits::BitBuffer;
use crate::message::header::{decode_lane, encode_lane};
use crate::message::Lane;

pub const ACK_BITS: usize = 24;

pub fn write_ack(buf: &mut BitBuffer, lane: Lane, sequence_number: u16) {
    buf.write_u8(encode_lane(lane));
    buf.write_u16(sequence_number);
}

pub fn read_acks(buf: &mut BitBuffer) -> anyhow::Result<Vec<(Lane, u16)>> {
    let mut result = Vec::new();
    while buf.remaining_bits() >= ACK_BITS {
        let lane = decode_lane(buf.read_u8()?)?;
        let sequence_number = buf.read_u16()?;
        result.push((lane, sequence_number));
    }
    Ok(result)
}

pub fn write_ping_number(buf: &mut BitBuffer, ping_number: u8) {
    buf.write_u8(ping_number);
}

pub fn read_ping_number(buf: &mut BitBuffer) -> anyhow::Result<u8> {
    buf.read_u8()
}

/// upper bound for the var-int length prefix of a string
const MAX_TEXT_LEN_PREFIX: usize = 5;

/// the longest text in bytes that fits into a message payload of `max_payload` bytes
pub fn max_text_len(max_payload: usize) -> usize {
    max_payload.saturating_sub(MAX_TEXT_LEN_PREFIX)
}

/// Cuts `text` down to fit into a message payload of `max_payload` bytes, on a char boundary
pub fn truncate_text(text: &str, max_payload: usize) -> &str {
    let max_len = max_text_len(max_payload);
    if text.len() <= max_len {
        return text;
    }

    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub fn write_text(buf: &mut BitBuffer, text: &str) {
    buf.write_string(text);
}

pub fn read_text(buf: &mut BitBuffer) -> anyhow::Result<String> {
    buf.read_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryMethod;
    use rstest::rstest;

    #[test]
    fn test_acks() {
        let mut buf = BitBuffer::new();
        write_ack(&mut buf, Lane::new(DeliveryMethod::ReliableOrdered, 3), 1023);
        write_ack(&mut buf, Lane::UNSEQUENCED, 0);
        assert_eq!(buf.byte_len(), 6);

        let acks = read_acks(&mut BitBuffer::from_bytes(buf.as_bytes())).unwrap();
        assert_eq!(acks, vec![(Lane::new(DeliveryMethod::ReliableOrdered, 3), 1023), (Lane::UNSEQUENCED, 0)]);
    }

    #[test]
    fn test_acks_trailing_garbage() {
        let mut buf = BitBuffer::new();
        write_ack(&mut buf, Lane::UNSEQUENCED, 5);
        buf.write_u8(7);

        let acks = read_acks(&mut buf).unwrap();
        assert_eq!(acks, vec![(Lane::UNSEQUENCED, 5)]);
    }

    #[test]
    fn test_acks_invalid_lane() {
        let mut buf = BitBuffer::new();
        buf.write_u8(0xe0);
        buf.write_u16(1);
        assert!(read_acks(&mut buf).is_err());
    }

    #[rstest]
    #[case::short("bye", 100, "bye")]
    #[case::exact("abcde", 10, "abcde")]
    #[case::ascii("abcdefgh", 10, "abcde")]
    #[case::multi_byte("aäöü", 10, "aäö")]
    #[case::split_char("aäöü", 9, "aä")]
    #[case::tiny_payload("abc", 3, "")]
    fn test_truncate_text(#[case] text: &str, #[case] max_payload: usize, #[case] expected: &str) {
        let truncated = truncate_text(text, max_payload);
        assert_eq!(truncated, expected);

        let mut buf = BitBuffer::new();
        write_text(&mut buf, truncated);
        assert!(buf.byte_len() <= max_payload.max(1));
    }

    #[test]
    fn test_text() {
        let mut buf = BitBuffer::new();
        write_text(&mut buf, "bye");
        assert_eq!(read_text(&mut buf).unwrap(), "bye");
        assert!(read_text(&mut buf).is_err());
    }
}
