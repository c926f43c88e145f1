use crate::message::{DeliveryMethod, Lane, MessageType};
use crate::sequence::NUM_SEQUENCE_NUMBERS;
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};

pub const MAX_CHANNELS_PER_DELIVERY_METHOD: u8 = 32;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone)]
    struct TypeFlags: u8 {
        const MASK_TYPE = 0b0111_1111;
        const FRAGMENT  = 0b1000_0000;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone)]
    struct LaneFlags: u8 {
        const MASK_METHOD  = 0b1110_0000;
        const MASK_CHANNEL = 0b0001_1111;
    }
}

/// Per-message header, all numbers in network byte order (BE):
///
/// ```ascii
/// 0: type (u8):
///    * bit 0-6: message type
///    * bit 7:   set if the payload is a fragment of a bigger message
/// 1: lane (u8):
///    * bit 0-4: sequence channel
///    * bit 5-7: delivery method
/// 2: sequence number (u16) - 0 for messages that are not sequenced
/// 4: payload length in *bits* (u16)
/// 6: payload, padded to full bytes
/// ```
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub is_fragment: bool,
    pub lane: Lane,
    pub sequence_number: u16,
    pub payload_bits: u16,
}

impl Debug for MessageHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let frag = if self.is_fragment { "+FRAG" } else { "" };
        write!(f, "MSG{{{:?}{}:{}@{}:{}b}}", self.message_type, frag, self.lane, self.sequence_number, self.payload_bits)
    }
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 6;
    pub const MAX_PAYLOAD_BYTES: usize = u16::MAX as usize / 8;

    pub fn new(message_type: MessageType, lane: Lane, sequence_number: u16, payload_bits: u16) -> MessageHeader {
        MessageHeader {
            message_type,
            is_fragment: false,
            lane,
            sequence_number,
            payload_bits,
        }
    }

    pub fn payload_len(&self) -> usize {
        (self.payload_bits as usize).div_ceil(8)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut type_byte = TypeFlags::from_bits_retain(u8::from(self.message_type)) & TypeFlags::MASK_TYPE;
        if self.is_fragment {
            type_byte |= TypeFlags::FRAGMENT;
        }
        buf.put_u8(type_byte.bits());

        buf.put_u8(encode_lane(self.lane));

        buf.put_u16(self.sequence_number);
        buf.put_u16(self.payload_bits);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete message header: {} bytes remaining", buf.remaining());
        }

        let type_byte = TypeFlags::from_bits_retain(buf.get_u8());
        let raw_type = (type_byte & TypeFlags::MASK_TYPE).bits();
        let message_type = MessageType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown message type {}", raw_type))?;

        let lane = decode_lane(buf.get_u8())?;

        let sequence_number = buf.get_u16();
        if sequence_number >= NUM_SEQUENCE_NUMBERS {
            bail!("sequence number {} is outside the sequence number ring", sequence_number);
        }

        let payload_bits = buf.get_u16();

        Ok(MessageHeader {
            message_type,
            is_fragment: type_byte.contains(TypeFlags::FRAGMENT),
            lane,
            sequence_number,
            payload_bits,
        })
    }
}

/// lane byte: bit 0-4 sequence channel, bit 5-7 delivery method
pub fn encode_lane(lane: Lane) -> u8 {
    (u8::from(lane.method) << 5) | (lane.channel & LaneFlags::MASK_CHANNEL.bits())
}

pub fn decode_lane(raw: u8) -> anyhow::Result<Lane> {
    let lane_byte = LaneFlags::from_bits_retain(raw);
    let raw_method = (lane_byte & LaneFlags::MASK_METHOD).bits() >> 5;
    let method = DeliveryMethod::try_from(raw_method)
        .map_err(|_| anyhow!("unknown delivery method {}", raw_method))?;
    let channel = (lane_byte & LaneFlags::MASK_CHANNEL).bits();
    Ok(Lane::new(method, channel))
}
