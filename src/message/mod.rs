//! Messages are the unit of data exchanged between peers, both for application data and for the
//!  protocol's own control traffic. Several messages can share a datagram.

pub mod datagram;
pub mod header;
pub mod incoming;
pub mod outgoing;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};

pub use incoming::IncomingMessage;
pub use outgoing::OutgoingMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    UserData = 0,
    Ping = 1,
    Pong = 2,
    Acknowledge = 3,
    Discovery = 4,
    DiscoveryResponse = 5,
    Connect = 6,
    ConnectResponse = 7,
    ConnectionEstablished = 8,
    Disconnect = 9,
    UnconnectedData = 10,
}

impl MessageType {
    /// Message types that are processed without an established connection
    pub fn is_unconnected(&self) -> bool {
        matches!(self, MessageType::Discovery | MessageType::DiscoveryResponse | MessageType::UnconnectedData)
    }
}

/// Delivery guarantees for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DeliveryMethod {
    /// may be lost, duplicated or reordered
    Unreliable = 0,
    /// may be lost, but messages older than the newest received message are dropped
    UnreliableSequenced = 1,
    /// always delivered, in any order
    ReliableUnordered = 2,
    /// always sent until acknowledged, but older messages are skipped once a newer one arrived
    ReliableSequenced = 3,
    /// always delivered, in the order they were sent
    ReliableOrdered = 4,
}

impl DeliveryMethod {
    pub fn is_reliable(&self) -> bool {
        matches!(self, DeliveryMethod::ReliableUnordered | DeliveryMethod::ReliableSequenced | DeliveryMethod::ReliableOrdered)
    }

    /// true for delivery methods where the sequence channel is meaningful, i.e. where messages
    ///  are ordered relative to other messages on the same channel
    pub fn is_sequenced(&self) -> bool {
        !matches!(self, DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered)
    }
}

/// A (delivery method, sequence channel) pair. Each lane has its own sequence numbers, sender
///  channel and receiver channel per connection: channel 1 for `ReliableOrdered` is unrelated to
///  channel 1 for `UnreliableSequenced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lane {
    pub method: DeliveryMethod,
    pub channel: u8,
}

impl Lane {
    /// the lane used for protocol messages that are not sequenced
    pub const UNSEQUENCED: Lane = Lane { method: DeliveryMethod::Unreliable, channel: 0 };

    pub fn new(method: DeliveryMethod, channel: u8) -> Lane {
        Lane { method, channel }
    }
}

impl Display for Lane {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}", self.method, self.channel)
    }
}

/// Outcome of handing a message to a connection for sending
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendResult {
    /// the message was handed to the network or will be in the next heartbeat
    Sent,
    /// the message is buffered until the send window has room for it
    Queued,
    /// the message was discarded, e.g. because an unreliable channel's window was full
    Dropped,
    FailedNotConnected,
}

impl SendResult {
    /// Combines the results for the fragments of a message: the message is only as 'sent' as
    ///  its worst fragment
    pub fn combine(self, other: SendResult) -> SendResult {
        std::cmp::max(self, other)
    }
}
