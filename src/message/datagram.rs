use crate::message::header::MessageHeader;
use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};

/// Packs encoded messages into datagrams, starting a new datagram whenever the next message would
///  exceed the MTU.
pub struct DatagramWriter {
    mtu: usize,
    current: BytesMut,
    num_in_current: usize,
    finished: Vec<Bytes>,
}

impl DatagramWriter {
    pub fn new(mtu: usize) -> DatagramWriter {
        DatagramWriter {
            mtu,
            current: BytesMut::with_capacity(mtu),
            num_in_current: 0,
            finished: Vec::new(),
        }
    }

    pub fn write_message(&mut self, header: &MessageHeader, payload: &[u8]) {
        debug_assert_eq!(header.payload_len(), payload.len());

        let len = MessageHeader::SERIALIZED_LEN + payload.len();
        if self.num_in_current > 0 && self.current.len() + len > self.mtu {
            self.finish_current();
        }

        header.ser(&mut self.current);
        self.current.put_slice(payload);
        self.num_in_current += 1;
    }

    fn finish_current(&mut self) {
        if self.num_in_current > 0 {
            self.finished.push(self.current.split().freeze());
            self.num_in_current = 0;
        }
    }

    pub fn has_pending(&self) -> bool {
        self.num_in_current > 0 || !self.finished.is_empty()
    }

    /// returns all datagrams including the partially filled last one
    pub fn take_datagrams(&mut self) -> Vec<Bytes> {
        self.finish_current();
        std::mem::take(&mut self.finished)
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.num_in_current = 0;
        self.finished.clear();
    }
}

/// a datagram containing a single message
pub fn single_message_datagram(header: &MessageHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MessageHeader::SERIALIZED_LEN + payload.len());
    header.ser(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Iterates over the messages in a received datagram. Iteration stops after the first malformed
///  message since there is no way to find the start of the next one.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> MessageReader<'a> {
    pub fn new(datagram: &'a [u8]) -> MessageReader<'a> {
        MessageReader {
            buf: datagram,
            failed: false,
        }
    }
}

impl<'a> Iterator for MessageReader<'a> {
    type Item = anyhow::Result<(MessageHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }

        let header = match MessageHeader::deser(&mut self.buf) {
            Ok(header) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let payload_len = header.payload_len();
        if payload_len > self.buf.len() {
            self.failed = true;
            return Some(Err(anyhow!("{:?} declares a payload of {} bytes, but only {} bytes remain in the datagram", header, payload_len, self.buf.len())));
        }

        let (payload, rest) = self.buf.split_at(payload_len);
        self.buf = rest;
        Some(Ok((header, payload)))
    }
}
