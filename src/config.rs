use crate::connection::control;
use crate::message::header::{MessageHeader, MAX_CHANNELS_PER_DELIVERY_METHOD};
use crate::message::DeliveryMethod;
use crate::sequence::NUM_SEQUENCE_NUMBERS;
use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

/// What to do with an unreliable message that does not fit into a single datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreliableSizeBehaviour {
    /// split it into fragments like a reliable message. Losing any single fragment loses the
    ///  whole message.
    NormalFragmentation,
    /// do not send it, reporting it as dropped
    DropAboveMtu,
}

pub struct PeerConfig {
    /// Peers only talk to other peers with the same application identifier. It is sent with
    ///  every connect request and checked by the receiving side.
    pub app_identifier: String,

    /// Local address of the peer's UDP socket. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,

    /// This is the maximum size of a datagram's payload (i.e. without IP and UDP headers) that
    ///  the peer will send. Messages that do not fit are fragmented.
    ///
    /// With full Ethernet frames and no optional IP headers, the limit is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. The default leaves some room for tunnels
    ///  and optional headers, since the protocol does not attempt MTU discovery.
    pub mtu: usize,

    /// interval of the network task's heartbeat, i.e. of the send / resend / ack flushing pass
    pub tick_interval: Duration,

    pub ping_interval: Duration,

    /// A connection is closed if no pong was received for this long
    pub connection_timeout: Duration,

    /// interval for re-sending handshake messages while a connection is being established
    pub handshake_interval: Duration,
    pub max_handshake_attempts: u32,

    /// The resend delay for reliable messages is `resend_base_delay + rtt * resend_rtt_multiplier`
    pub resend_base_delay: Duration,
    pub resend_rtt_multiplier: f64,
    /// round trip time assumed before the first ping round trip was measured
    pub initial_rtt_estimate: Duration,

    /// This is the maximum number of *messages* (not bytes) in flight per unreliable channel.
    ///  Window sizes must be powers of two below half the sequence number ring.
    pub unreliable_window_size: u16,
    /// This is the maximum number of *messages* (not bytes) stored on the sender side pending
    ///  an ack, per reliable channel
    pub reliable_window_size: u16,

    /// number of independent sequence channels for each sequenced or ordered delivery method
    pub channels_per_delivery_method: u8,

    /// group ids of fragmented messages rotate through `1..max_fragmentation_groups`
    pub max_fragmentation_groups: u32,
    /// incomplete fragment groups are discarded after this time without a new fragment
    pub fragment_group_timeout: Duration,
    /// upper bound for the declared size of a fragmented message - protects against huge
    ///  allocations triggered by bogus fragment headers
    pub max_reassembled_message_size: usize,

    /// This is the number of message buffers that will be pooled at a given time - buffers in
    ///  excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    pub accept_incoming_connections: bool,
    pub max_connections: usize,
    pub accept_discovery_requests: bool,

    pub unreliable_size_behaviour: UnreliableSizeBehaviour,

    /// fraction of outgoing datagrams that are dropped deliberately, for testing
    pub simulated_loss: f64,
}

impl PeerConfig {
    pub fn new(app_identifier: &str) -> PeerConfig {
        PeerConfig {
            app_identifier: app_identifier.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            mtu: 1408,
            tick_interval: Duration::from_millis(5),
            ping_interval: Duration::from_secs(4),
            connection_timeout: Duration::from_secs(25),
            handshake_interval: Duration::from_secs(3),
            max_handshake_attempts: 5,
            resend_base_delay: Duration::from_millis(25),
            resend_rtt_multiplier: 2.1,
            initial_rtt_estimate: Duration::from_millis(100),
            unreliable_window_size: 128,
            reliable_window_size: 64,
            channels_per_delivery_method: 32,
            max_fragmentation_groups: 1024,
            fragment_group_timeout: Duration::from_secs(30),
            max_reassembled_message_size: 16*1024*1024,
            buffer_pool_size: 4096,
            accept_incoming_connections: true,
            max_connections: 64,
            accept_discovery_requests: true,
            unreliable_size_behaviour: UnreliableSizeBehaviour::NormalFragmentation,
            simulated_loss: 0.0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 100 {
            bail!("MTU of {} is too small", self.mtu);
        }
        if self.mtu - MessageHeader::SERIALIZED_LEN > MessageHeader::MAX_PAYLOAD_BYTES {
            bail!("MTU of {} exceeds the maximum payload of {} bytes per message", self.mtu, MessageHeader::MAX_PAYLOAD_BYTES);
        }
        if self.app_identifier.len() > control::max_text_len(self.max_message_payload()) {
            bail!("application identifier of {} bytes does not fit into a connect request", self.app_identifier.len());
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        for (name, window_size) in [("unreliable", self.unreliable_window_size), ("reliable", self.reliable_window_size)] {
            if window_size == 0 || window_size >= NUM_SEQUENCE_NUMBERS / 2 {
                bail!("{} window size must be between 1 and {}, was {}", name, NUM_SEQUENCE_NUMBERS / 2 - 1, window_size);
            }
            //NB: window slots are indexed by sequence number modulo window size
            if NUM_SEQUENCE_NUMBERS % window_size != 0 {
                bail!("{} window size must divide {}, was {}", name, NUM_SEQUENCE_NUMBERS, window_size);
            }
        }
        if self.channels_per_delivery_method == 0 || self.channels_per_delivery_method > MAX_CHANNELS_PER_DELIVERY_METHOD {
            bail!("channels per delivery method must be between 1 and {}, was {}", MAX_CHANNELS_PER_DELIVERY_METHOD, self.channels_per_delivery_method);
        }
        if self.max_fragmentation_groups < 2 {
            bail!("there must be at least one fragmentation group");
        }
        if !(0.0..1.0).contains(&self.simulated_loss) {
            bail!("simulated loss must be in the range [0, 1), was {}", self.simulated_loss);
        }
        if self.max_handshake_attempts == 0 {
            bail!("at least one handshake attempt is required");
        }

        Ok(())
    }

    pub fn window_size(&self, method: DeliveryMethod) -> u16 {
        if method.is_reliable() {
            self.reliable_window_size
        }
        else {
            self.unreliable_window_size
        }
    }

    /// the number of sequence channels available for a given delivery method
    pub fn num_channels(&self, method: DeliveryMethod) -> u8 {
        match method {
            DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => 1,
            _ => self.channels_per_delivery_method,
        }
    }

    /// maximum payload of a single message that still fits into a datagram
    pub fn max_message_payload(&self) -> usize {
        self.mtu - MessageHeader::SERIALIZED_LEN
    }
}
