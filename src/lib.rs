//! Reliable messaging over UDP between peers.
//!
//! A [Peer] owns a UDP socket and manages connections to other peers. Messages are written
//!  bit-wise into an [OutgoingMessage] and sent with one of the [DeliveryMethod]s, which trade
//!  latency for delivery and ordering guarantees:
//!
//! * `Unreliable`: fire and forget
//! * `UnreliableSequenced`: fire and forget, but stale messages are dropped on arrival
//! * `ReliableUnordered`: resent until acknowledged, delivered in arrival order
//! * `ReliableSequenced`: resent until acknowledged, but only the newest message matters
//! * `ReliableOrdered`: resent until acknowledged and delivered in the order they were sent
//!
//! Sequenced and ordered delivery methods have several independent sequence channels, so that
//!  unrelated message streams do not hold each other up. Messages too big for a single datagram
//!  are fragmented and reassembled transparently.
//!
//! Connections are established with a handshake, kept alive with pings (which also measure the
//!  round trip time that resend delays are based on), and closed by a disconnect message or a
//!  timeout. Peers can find each other on the local network by broadcasting discovery requests.

pub mod bits;
pub mod buffers;
pub mod channel;
pub mod config;
pub mod connection;
pub mod fragmentation;
pub mod message;
pub mod peer;
pub mod safe_converter;
pub mod sequence;

pub use bits::BitBuffer;
pub use config::{PeerConfig, UnreliableSizeBehaviour};
pub use connection::ConnectionStatus;
pub use message::{DeliveryMethod, IncomingMessage, OutgoingMessage, SendResult};
pub use peer::{ConnectionInfo, Peer, PeerEvent};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
