//! Messages that do not fit into a single datagram are split into chunks that travel as separate
//!  messages with the `FRAGMENT` flag set, on the same lane as the original message. Each chunk's
//!  payload starts with a [FragmentHeader], followed by the chunk's slice of the original payload.
//!
//! The receiver collects chunks per fragment group and releases the reassembled message once all
//!  chunks are there. Chunks go through the lane's receiver channel like any other message, so
//!  reliable lanes guarantee that all chunks arrive eventually, while a single lost chunk loses the
//!  whole message on unreliable lanes.

use crate::bits::BitBuffer;
use crate::buffers::MessagePool;
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use anyhow::bail;
use bit_set::BitSet;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Encoded as four var-ints at the start of a chunk's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub group: u32,
    /// length of the complete message in bits
    pub total_bits: u32,
    pub chunk_byte_size: u32,
    pub chunk_index: u32,
}

impl FragmentHeader {
    pub fn ser(&self, buf: &mut BitBuffer) {
        buf.write_var_u32(self.group);
        buf.write_var_u32(self.total_bits);
        buf.write_var_u32(self.chunk_byte_size);
        buf.write_var_u32(self.chunk_index);
    }

    pub fn deser(buf: &mut BitBuffer) -> anyhow::Result<FragmentHeader> {
        Ok(FragmentHeader {
            group: buf.read_var_u32()?,
            total_bits: buf.read_var_u32()?,
            chunk_byte_size: buf.read_var_u32()?,
            chunk_index: buf.read_var_u32()?,
        })
    }

    pub fn serialized_len(&self) -> usize {
        var_u32_len(self.group) + var_u32_len(self.total_bits) + var_u32_len(self.chunk_byte_size) + var_u32_len(self.chunk_index)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bits.div_ceil(8).safe_cast()
    }

    pub fn num_chunks(&self) -> usize {
        self.total_bytes().div_ceil(self.chunk_byte_size.safe_cast())
    }

    /// number of payload bytes in the chunk with this header's index
    fn chunk_len(&self) -> usize {
        let chunk_byte_size: usize = self.chunk_byte_size.safe_cast();
        let offset = chunk_byte_size * self.chunk_index as usize;
        chunk_byte_size.min(self.total_bytes() - offset)
    }

    fn validate(&self, max_message_size: usize) -> anyhow::Result<()> {
        if self.group == 0 {
            bail!("fragment group 0 is not used");
        }
        if self.total_bits == 0 {
            bail!("fragmented message with zero length");
        }
        if self.total_bytes() > max_message_size {
            bail!("fragmented message of {} bytes exceeds the maximum of {} bytes", self.total_bytes(), max_message_size);
        }
        if self.chunk_byte_size == 0 {
            bail!("zero chunk size");
        }
        if self.chunk_index as usize >= self.num_chunks() {
            bail!("chunk index {} is out of bounds for {} chunks", self.chunk_index, self.num_chunks());
        }
        Ok(())
    }
}

fn var_u32_len(value: u32) -> usize {
    let significant_bits = 32 - value.leading_zeros() as usize;
    significant_bits.div_ceil(7).max(1)
}

/// The biggest chunk size for which a chunk including its fragment header fits into a message
///  payload of `max_payload` bytes.
///
/// The header's length depends on the chunk size (and the resulting number of chunks), so this
///  starts with an upper bound and reduces it until everything fits.
pub fn best_chunk_size(group: u32, total_bytes: usize, max_payload: usize) -> usize {
    let mut chunk_size = max_payload.saturating_sub(4).max(1);
    loop {
        let num_chunks = total_bytes.div_ceil(chunk_size);
        let header = FragmentHeader {
            group,
            total_bits: (total_bytes * 8).prechecked_cast(),
            chunk_byte_size: chunk_size.prechecked_cast(),
            chunk_index: num_chunks.saturating_sub(1).prechecked_cast(),
        };

        if chunk_size == 1 || chunk_size + header.serialized_len() <= max_payload {
            return chunk_size;
        }
        chunk_size -= 1;
    }
}

/// Splits outgoing messages, assigning each split message a new fragment group id
pub struct Fragmenter {
    next_group: u32,
    max_fragmentation_groups: u32,
}

impl Fragmenter {
    pub fn new(max_fragmentation_groups: u32) -> Fragmenter {
        Fragmenter {
            next_group: 1,
            max_fragmentation_groups,
        }
    }

    fn next_group_id(&mut self) -> u32 {
        let result = self.next_group;
        self.next_group += 1;
        if self.next_group >= self.max_fragmentation_groups {
            self.next_group = 1;
        }
        result
    }

    /// Splits a message into chunks that fit into `max_payload` bytes each, including their
    ///  fragment header. The chunks' storage comes from the pool.
    pub fn split(&mut self, message: &OutgoingMessage, max_payload: usize, pool: &Arc<MessagePool>) -> anyhow::Result<Vec<OutgoingMessage>> {
        let total_bytes = message.byte_len();
        if total_bytes == 0 {
            bail!("empty messages are never fragmented");
        }
        if total_bytes > (u32::MAX / 8) as usize {
            bail!("message of {} bytes is too big for fragmentation", total_bytes);
        }

        let group = self.next_group_id();
        let chunk_byte_size = best_chunk_size(group, total_bytes, max_payload);
        let payload = message.payload_bytes();

        let chunks = payload.chunks(chunk_byte_size)
            .enumerate()
            .map(|(chunk_index, chunk_data)| {
                let mut chunk = pool.create_outgoing(message.message_type());
                chunk.set_fragment(true);
                FragmentHeader {
                    group,
                    total_bits: message.bit_len().prechecked_cast(),
                    chunk_byte_size: chunk_byte_size.prechecked_cast(),
                    chunk_index: chunk_index.prechecked_cast(),
                }.ser(&mut chunk);
                chunk.write_bytes(chunk_data);
                chunk
            })
            .collect::<Vec<_>>();

        debug!("split message of {} bytes into {} chunks of up to {} bytes in fragment group {}", total_bytes, chunks.len(), chunk_byte_size, group);
        Ok(chunks)
    }
}

struct ReassemblyGroup {
    total_bits: u32,
    chunk_byte_size: u32,
    data: Vec<u8>,
    received_chunks: BitSet,
    num_received: usize,
    num_chunks: usize,
    last_updated: Instant,
}

impl ReassemblyGroup {
    fn new(header: &FragmentHeader, now: Instant) -> ReassemblyGroup {
        ReassemblyGroup {
            total_bits: header.total_bits,
            chunk_byte_size: header.chunk_byte_size,
            data: vec![0; header.total_bytes()],
            received_chunks: BitSet::with_capacity(header.num_chunks()),
            num_received: 0,
            num_chunks: header.num_chunks(),
            last_updated: now,
        }
    }

    fn matches(&self, header: &FragmentHeader) -> bool {
        self.total_bits == header.total_bits && self.chunk_byte_size == header.chunk_byte_size
    }

    fn is_complete(&self) -> bool {
        self.num_received == self.num_chunks
    }
}

/// Collects the chunks of fragmented messages received on a connection
pub struct FragmentAssembler {
    groups: FxHashMap<u32, ReassemblyGroup>,
    max_message_size: usize,
    group_timeout: Duration,
    /// group ids rotate through `1..max_fragmentation_groups`
    num_group_ids: u32,
}

impl FragmentAssembler {
    pub fn new(max_message_size: usize, group_timeout: Duration, max_fragmentation_groups: u32) -> FragmentAssembler {
        FragmentAssembler {
            groups: FxHashMap::default(),
            max_message_size,
            group_timeout,
            num_group_ids: max_fragmentation_groups.saturating_sub(1).max(1),
        }
    }

    /// Signed distance of group id `group` from `reference` in the rotation of group ids, in the
    ///  same way as [crate::sequence::relative_sequence_number]
    fn relative_group_id(&self, group: u32, reference: u32) -> i64 {
        let ring = self.num_group_ids as i64;
        let diff = (group as i64 - reference as i64).rem_euclid(ring);
        if diff >= ring / 2 {
            diff - ring
        }
        else {
            diff
        }
    }

    /// Groups more than a quarter rotation away from a new group belong to a previous rotation.
    ///  They are evicted before their group id comes around again, so that the chunks of a new
    ///  message are never merged with stale chunks of an old one.
    fn evict_previous_rotation(&mut self, new_group: u32) {
        let max_distance = (self.num_group_ids / 4).max(1) as i64;
        let before = self.groups.len();

        let stale = self.groups.keys()
            .copied()
            .filter(|&group| self.relative_group_id(group, new_group).abs() > max_distance)
            .collect::<Vec<_>>();
        for group in stale {
            self.groups.remove(&group);
        }

        let num_evicted = before - self.groups.len();
        if num_evicted > 0 {
            debug!("discarded {} incomplete fragment groups from a previous group id rotation", num_evicted);
        }
    }

    pub fn num_incomplete_groups(&self) -> usize {
        self.groups.len()
    }

    /// Adds a received chunk, returning the reassembled message when this chunk completes its
    ///  group. The returned message is the chunk's message with its payload replaced by the
    ///  complete payload and the fragment flag cleared.
    ///
    /// Invalid chunks are logged and dropped.
    pub fn insert(&mut self, now: Instant, mut chunk: IncomingMessage) -> Option<IncomingMessage> {
        let header = match self.parse_chunk(&mut chunk) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping invalid fragment from {:?}: {}", chunk.sender(), e);
                return None;
            }
        };

        let chunk_data = match chunk.remaining_bytes() {
            Ok(data) => data,
            Err(e) => {
                warn!("dropping invalid fragment from {:?}: {}", chunk.sender(), e);
                return None;
            }
        };
        if chunk_data.len() != header.chunk_len() {
            warn!("dropping fragment {} of group {} from {:?}: expected {} bytes, got {}", header.chunk_index, header.group, chunk.sender(), header.chunk_len(), chunk_data.len());
            return None;
        }

        if !self.groups.contains_key(&header.group) {
            self.evict_previous_rotation(header.group);
        }
        let group = self.groups.entry(header.group)
            .or_insert_with(|| ReassemblyGroup::new(&header, now));
        if !group.matches(&header) {
            debug!("fragment group {} from {:?} changed its layout - discarding stale chunks", header.group, chunk.sender());
            *group = ReassemblyGroup::new(&header, now);
        }

        let chunk_index: usize = header.chunk_index.safe_cast();
        if !group.received_chunks.insert(chunk_index) {
            trace!("duplicate chunk {} of fragment group {}", chunk_index, header.group);
            return None;
        }

        let offset = chunk_index * header.chunk_byte_size as usize;
        group.data[offset..offset + chunk_data.len()].copy_from_slice(chunk_data);
        group.num_received += 1;
        group.last_updated = now;

        trace!("received chunk {} of fragment group {}: {} of {}", chunk_index, header.group, group.num_received, group.num_chunks);
        if !group.is_complete() {
            return None;
        }

        let group = self.groups.remove(&header.group)?;
        chunk.replace_contents(&group.data, group.total_bits.safe_cast());
        chunk.set_fragment(false);
        debug!("reassembled message of {} bytes from fragment group {}", group.data.len(), header.group);
        Some(chunk)
    }

    fn parse_chunk(&self, chunk: &mut IncomingMessage) -> anyhow::Result<FragmentHeader> {
        chunk.set_position(0)?;
        let header = FragmentHeader::deser(chunk)?;
        header.validate(self.max_message_size)?;
        Ok(header)
    }

    /// Discards incomplete groups that did not receive a chunk for the configured timeout
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.group_timeout;
        let before = self.groups.len();
        self.groups.retain(|_, group| now.saturating_duration_since(group.last_updated) < timeout);

        let num_expired = before - self.groups.len();
        if num_expired > 0 {
            debug!("discarded {} incomplete fragment groups after {:?} without progress", num_expired, timeout);
        }
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeliveryMethod, Lane, MessageType};
    use rstest::rstest;
    use std::net::SocketAddr;

    const MAX_PAYLOAD: usize = 100;

    fn pool() -> Arc<MessagePool> {
        Arc::new(MessagePool::new(128, 64))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn to_incoming(chunk: &OutgoingMessage, now: Instant) -> IncomingMessage {
        let mut msg = IncomingMessage::new(
            chunk.message_type(),
            SocketAddr::from(([127, 0, 0, 1], 1234)),
            Lane::new(DeliveryMethod::ReliableOrdered, 0),
            0,
            now,
            BitBuffer::from_bytes(chunk.payload_bytes()),
        );
        msg.set_fragment(chunk.is_fragment());
        msg
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(127)]
    #[case(128)]
    #[case(16_383)]
    #[case(16_384)]
    #[case(u32::MAX)]
    fn test_var_u32_len(#[case] value: u32) {
        let mut buf = BitBuffer::new();
        buf.write_var_u32(value);
        assert_eq!(var_u32_len(value), buf.byte_len());
    }

    #[rstest]
    #[case::small(1, 1000, 100)]
    #[case::big_group(100_000, 1000, 100)]
    #[case::big_message(5, 10_000_000, 1400)]
    #[case::tiny_mtu(5, 1000, 8)]
    fn test_best_chunk_size(#[case] group: u32, #[case] total_bytes: usize, #[case] max_payload: usize) {
        let chunk_size = best_chunk_size(group, total_bytes, max_payload);
        let num_chunks = total_bytes.div_ceil(chunk_size);
        let header = FragmentHeader {
            group,
            total_bits: (total_bytes * 8) as u32,
            chunk_byte_size: chunk_size as u32,
            chunk_index: (num_chunks - 1) as u32,
        };
        assert!(chunk_size + header.serialized_len() <= max_payload);
        // one more byte would not fit
        assert!(chunk_size + 1 + header.serialized_len() > max_payload);
    }

    #[rstest]
    #[case::exact_multiple(3, 0)]
    #[case::remainder(3, 17)]
    #[case::single_partial_chunk(1, 1)]
    fn test_round_trip_reversed(#[case] num_full_chunks: usize, #[case] remainder: usize) {
        let pool = pool();
        let now = Instant::now();
        let mut fragmenter = Fragmenter::new(1024);

        let chunk_size = best_chunk_size(1, MAX_PAYLOAD * 4, MAX_PAYLOAD);
        let data = payload(num_full_chunks * chunk_size + remainder);

        let mut message = OutgoingMessage::new(MessageType::UserData);
        message.write_bytes(&data);
        // odd bit length
        message.write_bool(true);

        let chunks = fragmenter.split(&message, MAX_PAYLOAD, &pool).unwrap();
        assert!(chunks.iter().all(|c| c.is_fragment() && c.byte_len() <= MAX_PAYLOAD));

        let mut assembler = FragmentAssembler::new(1_000_000, Duration::from_secs(30), 1024);
        let mut result = None;
        for (i, chunk) in chunks.iter().enumerate().rev() {
            let reassembled = assembler.insert(now, to_incoming(chunk, now));
            if i > 0 {
                assert!(reassembled.is_none());
            }
            else {
                result = reassembled;
            }
        }

        let mut result = result.unwrap();
        assert_eq!(result.message_type(), MessageType::UserData);
        assert!(!result.is_fragment());
        assert_eq!(result.bit_len(), data.len() * 8 + 1);
        assert_eq!(result.read_bytes(data.len()).unwrap(), data);
        assert!(result.read_bool().unwrap());
        assert_eq!(assembler.num_incomplete_groups(), 0);
    }

    #[test]
    fn test_group_ids_rotate() {
        let pool = pool();
        let mut fragmenter = Fragmenter::new(3);
        let mut message = OutgoingMessage::new(MessageType::UserData);
        message.write_bytes(&payload(300));

        let groups = (0..4)
            .map(|_| {
                let chunks = fragmenter.split(&message, MAX_PAYLOAD, &pool).unwrap();
                let mut first = to_incoming(&chunks[0], Instant::now());
                FragmentHeader::deser(&mut first).unwrap().group
            })
            .collect::<Vec<_>>();
        assert_eq!(groups, vec![1, 2, 1, 2]);
    }

    fn chunk_with_header(header: FragmentHeader, data_len: usize) -> IncomingMessage {
        let mut buf = BitBuffer::new();
        header.ser(&mut buf);
        buf.write_bytes(&payload(data_len));
        let mut msg = IncomingMessage::new(MessageType::UserData, SocketAddr::from(([127, 0, 0, 1], 1234)), Lane::UNSEQUENCED, 0, Instant::now(), buf);
        msg.set_fragment(true);
        msg
    }

    #[rstest]
    #[case::index_out_of_bounds(FragmentHeader { group: 1, total_bits: 800, chunk_byte_size: 50, chunk_index: 2 }, 50)]
    #[case::group_zero(FragmentHeader { group: 0, total_bits: 800, chunk_byte_size: 50, chunk_index: 0 }, 50)]
    #[case::zero_chunk_size(FragmentHeader { group: 1, total_bits: 800, chunk_byte_size: 0, chunk_index: 0 }, 50)]
    #[case::zero_length(FragmentHeader { group: 1, total_bits: 0, chunk_byte_size: 50, chunk_index: 0 }, 0)]
    #[case::too_big(FragmentHeader { group: 1, total_bits: 8_000_008, chunk_byte_size: 50, chunk_index: 0 }, 50)]
    #[case::wrong_chunk_len(FragmentHeader { group: 1, total_bits: 800, chunk_byte_size: 50, chunk_index: 0 }, 49)]
    #[case::wrong_last_chunk_len(FragmentHeader { group: 1, total_bits: 760, chunk_byte_size: 50, chunk_index: 1 }, 50)]
    fn test_invalid_chunk(#[case] header: FragmentHeader, #[case] data_len: usize) {
        let mut assembler = FragmentAssembler::new(1_000_000, Duration::from_secs(30), 1024);
        assert!(assembler.insert(Instant::now(), chunk_with_header(header, data_len)).is_none());
        assert_eq!(assembler.num_incomplete_groups(), 0);
    }

    #[test]
    fn test_truncated_header() {
        let mut assembler = FragmentAssembler::new(1_000_000, Duration::from_secs(30), 1024);
        let mut buf = BitBuffer::new();
        buf.write_var_u32(1);
        buf.write_u8(0x80);
        let msg = IncomingMessage::new(MessageType::UserData, SocketAddr::from(([127, 0, 0, 1], 1234)), Lane::UNSEQUENCED, 0, Instant::now(), buf);
        assert!(assembler.insert(Instant::now(), msg).is_none());
    }

    #[test]
    fn test_stale_group_is_replaced() {
        let now = Instant::now();
        let mut assembler = FragmentAssembler::new(1_000_000, Duration::from_secs(30), 1024);

        assert!(assembler.insert(now, chunk_with_header(FragmentHeader { group: 5, total_bits: 800, chunk_byte_size: 50, chunk_index: 0 }, 50)).is_none());

        // same group id with a different layout: the old chunk must not count
        assert!(assembler.insert(now, chunk_with_header(FragmentHeader { group: 5, total_bits: 480, chunk_byte_size: 30, chunk_index: 1 }, 30)).is_none());
        let result = assembler.insert(now, chunk_with_header(FragmentHeader { group: 5, total_bits: 480, chunk_byte_size: 30, chunk_index: 0 }, 30));
        assert_eq!(result.unwrap().bit_len(), 480);
    }

    #[test]
    fn test_reused_group_id_with_same_layout() {
        let now = Instant::now();
        let mut assembler = FragmentAssembler::new(1_000_000, Duration::from_secs(30), 1024);
        let header = FragmentHeader { group: 5, total_bits: 800, chunk_byte_size: 50, chunk_index: 0 };

        // the first message on group 5 loses its second chunk
        assert!(assembler.insert(now, chunk_with_header(header, 50)).is_none());

        // group ids move on through the rotation
        for group in [100, 200, 300, 400] {
            assert!(assembler.insert(now, chunk_with_header(FragmentHeader { group, ..header }, 50)).is_none());
        }
        assert_eq!(assembler.num_incomplete_groups(), 3);

        // a new message on group 5 with the same layout must wait for all of its own chunks
        assert!(assembler.insert(now, chunk_with_header(FragmentHeader { chunk_index: 1, ..header }, 50)).is_none());
        assert!(assembler.insert(now, chunk_with_header(header, 50)).is_some());
    }

    #[rstest]
    #[case::neighbours(5, 6, 2)]
    #[case::wrap_around(1022, 2, 2)]
    #[case::quarter_rotation(5, 5 + 255, 2)]
    #[case::beyond_quarter_rotation(5, 5 + 256, 1)]
    fn test_concurrent_groups(#[case] first: u32, #[case] second: u32, #[case] expected_groups: usize) {
        let now = Instant::now();
        let mut assembler = FragmentAssembler::new(1_000_000, Duration::from_secs(30), 1024);
        let header = FragmentHeader { group: first, total_bits: 800, chunk_byte_size: 50, chunk_index: 0 };

        assembler.insert(now, chunk_with_header(header, 50));
        assembler.insert(now, chunk_with_header(FragmentHeader { group: second, ..header }, 50));
        assert_eq!(assembler.num_incomplete_groups(), expected_groups);
    }

    #[test]
    fn test_duplicate_chunk() {
        let now = Instant::now();
        let mut assembler = FragmentAssembler::new(1_000_000, Duration::from_secs(30), 1024);
        let header = FragmentHeader { group: 5, total_bits: 800, chunk_byte_size: 50, chunk_index: 0 };

        assert!(assembler.insert(now, chunk_with_header(header, 50)).is_none());
        assert!(assembler.insert(now, chunk_with_header(header, 50)).is_none());
        let result = assembler.insert(now, chunk_with_header(FragmentHeader { chunk_index: 1, ..header }, 50));
        assert!(result.is_some());
    }

    #[test]
    fn test_expire() {
        let start = Instant::now();
        let timeout = Duration::from_secs(30);
        let mut assembler = FragmentAssembler::new(1_000_000, timeout, 1024);

        assembler.insert(start, chunk_with_header(FragmentHeader { group: 1, total_bits: 800, chunk_byte_size: 50, chunk_index: 0 }, 50));
        assembler.insert(start + Duration::from_secs(20), chunk_with_header(FragmentHeader { group: 2, total_bits: 800, chunk_byte_size: 50, chunk_index: 0 }, 50));

        assembler.expire(start + Duration::from_secs(29));
        assert_eq!(assembler.num_incomplete_groups(), 2);

        assembler.expire(start + timeout);
        assert_eq!(assembler.num_incomplete_groups(), 1);

        assembler.expire(start + Duration::from_secs(50));
        assert_eq!(assembler.num_incomplete_groups(), 0);
    }
}
