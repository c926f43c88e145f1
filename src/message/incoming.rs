use crate::bits::BitBuffer;
use crate::buffers::MessagePool;
use crate::message::{Lane, MessageType};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::time::Instant;

/// A received message. The payload is read through the [BitBuffer] API this type dereferences to.
pub struct IncomingMessage {
    message_type: MessageType,
    is_fragment: bool,
    sender: SocketAddr,
    lane: Lane,
    sequence_number: u16,
    received_at: Instant,
    buffer: BitBuffer,
    pool: Option<Arc<MessagePool>>,
}

impl Debug for IncomingMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IN{{{:?}{} from {:?} on {}@{}:{}b}}",
               self.message_type,
               if self.is_fragment { "+FRAG" } else { "" },
               self.sender,
               self.lane,
               self.sequence_number,
               self.buffer.bit_len(),
        )
    }
}

impl IncomingMessage {
    pub fn new(message_type: MessageType, sender: SocketAddr, lane: Lane, sequence_number: u16, received_at: Instant, buffer: BitBuffer) -> IncomingMessage {
        IncomingMessage {
            message_type,
            is_fragment: false,
            sender,
            lane,
            sequence_number,
            received_at,
            buffer,
            pool: None,
        }
    }

    pub(crate) fn new_pooled(message_type: MessageType, sender: SocketAddr, lane: Lane, sequence_number: u16, received_at: Instant, buffer: BitBuffer, pool: Arc<MessagePool>) -> IncomingMessage {
        IncomingMessage {
            message_type,
            is_fragment: false,
            sender,
            lane,
            sequence_number,
            received_at,
            buffer,
            pool: Some(pool),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is_fragment(&self) -> bool {
        self.is_fragment
    }

    pub(crate) fn set_fragment(&mut self, is_fragment: bool) {
        self.is_fragment = is_fragment;
    }

    /// the remote peer that sent this message
    pub fn sender(&self) -> SocketAddr {
        self.sender
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn sequence_channel(&self) -> u8 {
        self.lane.channel
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn buffer(&self) -> &BitBuffer {
        &self.buffer
    }
}

impl Deref for IncomingMessage {
    type Target = BitBuffer;

    fn deref(&self) -> &BitBuffer {
        &self.buffer
    }
}

impl DerefMut for IncomingMessage {
    fn deref_mut(&mut self) -> &mut BitBuffer {
        &mut self.buffer
    }
}

impl Drop for IncomingMessage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.return_to_pool(std::mem::take(&mut self.buffer));
        }
    }
}
