use crate::bits::BitBuffer;
use crate::buffers::MessagePool;
use crate::message::MessageType;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A message to be sent. The payload is written through the [BitBuffer] API this type
///  dereferences to.
///
/// Once handed to the peer for sending, a message is shared as `Arc<OutgoingMessage>` between all
///  connections it is sent to, and its storage goes back to the pool when the last of them is
///  done with it.
pub struct OutgoingMessage {
    message_type: MessageType,
    is_fragment: bool,
    buffer: BitBuffer,
    pool: Option<Arc<MessagePool>>,
}

impl Debug for OutgoingMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OUT{{{:?}{}:{}b}}", self.message_type, if self.is_fragment { "+FRAG" } else { "" }, self.buffer.bit_len())
    }
}

impl OutgoingMessage {
    /// creates a message that is not pooled
    pub fn new(message_type: MessageType) -> OutgoingMessage {
        OutgoingMessage {
            message_type,
            is_fragment: false,
            buffer: BitBuffer::new(),
            pool: None,
        }
    }

    pub(crate) fn new_pooled(message_type: MessageType, buffer: BitBuffer, pool: Arc<MessagePool>) -> OutgoingMessage {
        OutgoingMessage {
            message_type,
            is_fragment: false,
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

    pub fn buffer(&self) -> &BitBuffer {
        &self.buffer
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }
}

impl Deref for OutgoingMessage {
    type Target = BitBuffer;

    fn deref(&self) -> &BitBuffer {
        &self.buffer
    }
}

impl DerefMut for OutgoingMessage {
    fn deref_mut(&mut self) -> &mut BitBuffer {
        &mut self.buffer
    }
}

impl Drop for OutgoingMessage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.return_to_pool(std::mem::take(&mut self.buffer));
        }
    }
}
