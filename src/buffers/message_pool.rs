use crate::bits::BitBuffer;
use crate::message::{IncomingMessage, Lane, MessageType, OutgoingMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Pool of message storage, shared by the application and the network task.
///
/// Messages created from the pool return their storage when they are dropped, so release is
///  guaranteed on every code path. Outgoing messages that are sent to several connections are
///  shared as `Arc<OutgoingMessage>`, and the storage comes back when the last reference is gone.
pub struct MessagePool {
    initial_capacity: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pool_size: usize,
    num_created: AtomicUsize,
}

impl MessagePool {
    pub fn new(initial_capacity: usize, max_pool_size: usize) -> MessagePool {
        MessagePool {
            initial_capacity,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
            max_pool_size,
            num_created: AtomicUsize::new(0),
        }
    }

    pub fn get_from_pool(&self) -> BitBuffer {
        {
            let mut buffers = self.buffers.lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return BitBuffer::from_storage(buffer);
            }
        }

        debug!("no buffer in pool: creating new buffer");
        self.num_created.fetch_add(1, Ordering::Relaxed);
        BitBuffer::with_capacity(self.initial_capacity)
    }

    pub fn return_to_pool(&self, buffer: BitBuffer) {
        let storage = buffer.into_storage();

        let mut buffers = self.buffers.lock()
            .unwrap_or_else(|e| e.into_inner());
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(storage);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    /// number of buffers currently available for reuse
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// number of buffers that were allocated because the pool was empty
    pub fn num_created(&self) -> usize {
        self.num_created.load(Ordering::Relaxed)
    }

    pub fn create_outgoing(self: &Arc<Self>, message_type: MessageType) -> OutgoingMessage {
        OutgoingMessage::new_pooled(message_type, self.get_from_pool(), self.clone())
    }

    pub fn create_incoming(self: &Arc<Self>, message_type: MessageType, sender: SocketAddr, lane: Lane, sequence_number: u16, received_at: Instant) -> IncomingMessage {
        IncomingMessage::new_pooled(message_type, sender, lane, sequence_number, received_at, self.get_from_pool(), self.clone())
    }
}
