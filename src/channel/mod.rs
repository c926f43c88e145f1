//! Sender and receiver channels hold the per-lane sequencing state of a connection: send windows,
//!  stored messages pending acknowledgement, and receive windows for reordering and duplicate
//!  detection.
//!
//! Channels do no I/O. The connection feeds them with enqueued messages, acknowledgements and
//!  received messages, and they answer with the messages to put on the wire, the acks to send
//!  and the messages to release to the application.

pub mod reliable_receiver;
pub mod reliable_sender;
pub mod unreliable_receiver;
pub mod unreliable_sender;

use crate::config::PeerConfig;
use crate::message::{DeliveryMethod, IncomingMessage, OutgoingMessage, SendResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub use reliable_receiver::{ReliableOrderedReceiverChannel, ReliableSequencedReceiverChannel, ReliableUnorderedReceiverChannel};
pub use reliable_sender::ReliableSenderChannel;
pub use unreliable_receiver::{UnreliableReceiverChannel, UnreliableSequencedReceiverChannel};
pub use unreliable_sender::UnreliableSenderChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    First,
    /// resent because no ack arrived within the resend delay
    DelayResend,
    /// resent because a later message was acknowledged first
    GapResend,
}

/// a message that is due to go on the wire with a given sequence number
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    pub message: Arc<OutgoingMessage>,
    pub sequence_number: u16,
    pub kind: SendKind,
}

pub trait SenderChannel: Send {
    fn enqueue(&mut self, message: Arc<OutgoingMessage>) -> SendResult;

    /// Appends everything that is due for sending to `out`: resends first (for reliable
    ///  channels), then queued messages as far as the window allows.
    fn send_queued_messages(&mut self, now: Instant, out: &mut Vec<OutgoingRecord>);

    /// Processes an ack from the remote peer. Resends triggered by the ack are appended to `out`.
    fn receive_acknowledge(&mut self, now: Instant, sequence_number: u16, out: &mut Vec<OutgoingRecord>);

    /// number of messages that can be sent before the window is full
    fn allowed_sends(&self) -> u16;

    fn reset(&mut self);

    fn set_resend_delay(&mut self, resend_delay: Duration);

    fn queued_len(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct ReceiveOutput {
    /// sequence numbers to acknowledge
    pub acks: Vec<u16>,
    /// messages to pass on to the application
    pub released: Vec<IncomingMessage>,
}

impl ReceiveOutput {
    pub fn clear(&mut self) {
        self.acks.clear();
        self.released.clear();
    }
}

pub trait ReceiverChannel: Send {
    fn receive(&mut self, message: IncomingMessage, out: &mut ReceiveOutput);

    fn reset(&mut self);
}

pub fn new_sender_channel(method: DeliveryMethod, config: &PeerConfig, resend_delay: Duration) -> Box<dyn SenderChannel> {
    let window_size = config.window_size(method);
    if method.is_reliable() {
        Box::new(ReliableSenderChannel::new(window_size, resend_delay))
    }
    else {
        Box::new(UnreliableSenderChannel::new(window_size, resend_delay))
    }
}

pub fn new_receiver_channel(method: DeliveryMethod, config: &PeerConfig) -> Box<dyn ReceiverChannel> {
    let window_size = config.window_size(method);
    match method {
        DeliveryMethod::Unreliable => Box::new(UnreliableReceiverChannel),
        DeliveryMethod::UnreliableSequenced => Box::new(UnreliableSequencedReceiverChannel::new()),
        DeliveryMethod::ReliableUnordered => Box::new(ReliableUnorderedReceiverChannel::new(window_size)),
        DeliveryMethod::ReliableSequenced => Box::new(ReliableSequencedReceiverChannel::new(window_size)),
        DeliveryMethod::ReliableOrdered => Box::new(ReliableOrderedReceiverChannel::new(window_size)),
    }
}
