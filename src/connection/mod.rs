//! A connection holds everything the peer knows about one remote peer: handshake state, sender
//!  and receiver channels per lane, round trip time and timeout, fragment reassembly and traffic
//!  statistics.
//!
//! Connections do no I/O and never look at the clock themselves. The network task feeds them
//!  with received messages and periodic heartbeats (passing the current time), and collects the
//!  datagrams to send and the events for the application afterwards. All of this happens on the
//!  network task, which owns the connections exclusively.
//!
//! Connection establishment is a three-way handshake:
//!
//! ```ascii
//! initiator                          responder
//!   InitiatedConnect   -- Connect -->
//!                                      RespondedConnect
//!                     <-- ConnectResponse --
//!   Connected          -- ConnectionEstablished -->
//!                                      Connected
//! ```
//!
//! Handshake messages are resent every `handshake_interval` until the next step arrives, giving
//!  up after `max_handshake_attempts`. Since the final `ConnectionEstablished` can get lost, the
//!  responder also treats any ping, ack or user message from the initiator as completing the
//!  handshake.

pub mod control;
pub mod latency;
pub mod statistics;

use crate::bits::BitBuffer;
use crate::buffers::MessagePool;
use crate::channel::{new_receiver_channel, new_sender_channel, OutgoingRecord, ReceiveOutput, ReceiverChannel, SenderChannel};
use crate::config::PeerConfig;
use crate::connection::control::ACK_BITS;
use crate::connection::latency::LatencyTracker;
use crate::connection::statistics::ConnectionStatistics;
use crate::fragmentation::FragmentAssembler;
use crate::message::datagram::DatagramWriter;
use crate::message::header::MessageHeader;
use crate::message::{IncomingMessage, Lane, MessageType, OutgoingMessage, SendResult};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// we sent a connect request and wait for the response
    InitiatedConnect,
    /// we received a connect request, responded and wait for confirmation
    RespondedConnect,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    /// a message that is ready for the application
    Data(IncomingMessage),
    StatusChanged {
        status: ConnectionStatus,
        reason: String,
    },
}

struct HandshakeState {
    num_attempts: u32,
    last_sent: Option<Instant>,
}

impl HandshakeState {
    fn new() -> HandshakeState {
        HandshakeState {
            num_attempts: 0,
            last_sent: None,
        }
    }
}

pub struct Connection {
    remote_addr: SocketAddr,
    config: Arc<PeerConfig>,
    pool: Arc<MessagePool>,

    status: ConnectionStatus,
    handshake: HandshakeState,
    latency: LatencyTracker,

    senders: FxHashMap<Lane, Box<dyn SenderChannel>>,
    receivers: FxHashMap<Lane, Box<dyn ReceiverChannel>>,
    fragments: FragmentAssembler,

    pending_acks: Vec<(Lane, u16)>,
    /// resends triggered by acks, going out with the next heartbeat
    pending_records: Vec<(Lane, OutgoingRecord)>,
    library_messages: Vec<(MessageType, BitBuffer)>,
    record_scratch: Vec<OutgoingRecord>,
    receive_output: ReceiveOutput,

    writer: DatagramWriter,
    events: Vec<ConnectionEvent>,
    statistics: ConnectionStatistics,

    //NB: channel state is confined to the network task: connections can be moved there but never
    //     be shared
    _not_sync: PhantomData<Cell<()>>,
}

impl Connection {
    /// a connection for which we send the connect request
    pub fn new_outgoing(remote_addr: SocketAddr, config: Arc<PeerConfig>, pool: Arc<MessagePool>, now: Instant) -> Connection {
        Self::new(remote_addr, config, pool, now, ConnectionStatus::InitiatedConnect)
    }

    /// a connection for a connect request that we received and accepted
    pub fn new_incoming(remote_addr: SocketAddr, config: Arc<PeerConfig>, pool: Arc<MessagePool>, now: Instant) -> Connection {
        Self::new(remote_addr, config, pool, now, ConnectionStatus::RespondedConnect)
    }

    fn new(remote_addr: SocketAddr, config: Arc<PeerConfig>, pool: Arc<MessagePool>, now: Instant, status: ConnectionStatus) -> Connection {
        debug!("new connection with {:?} in status {:?}", remote_addr, status);

        Connection {
            remote_addr,
            latency: LatencyTracker::new(now, config.ping_interval, config.connection_timeout),
            fragments: FragmentAssembler::new(config.max_reassembled_message_size, config.fragment_group_timeout, config.max_fragmentation_groups),
            writer: DatagramWriter::new(config.mtu),
            config,
            pool,
            status,
            handshake: HandshakeState::new(),
            senders: FxHashMap::default(),
            receivers: FxHashMap::default(),
            pending_acks: Vec::new(),
            pending_records: Vec::new(),
            library_messages: Vec::new(),
            record_scratch: Vec::new(),
            receive_output: ReceiveOutput::default(),
            events: Vec::new(),
            statistics: ConnectionStatistics::default(),
            _not_sync: PhantomData,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        self.latency.average_rtt()
    }

    pub fn statistics(&self) -> &ConnectionStatistics {
        &self.statistics
    }

    /// number of user messages waiting for room in a send window
    pub fn num_queued_messages(&self) -> usize {
        self.senders.values()
            .map(|s| s.queued_len())
            .sum()
    }

    pub fn resend_delay(&self) -> Duration {
        let rtt = self.latency.average_rtt()
            .unwrap_or(self.config.initial_rtt_estimate);
        self.config.resend_base_delay + rtt.mul_f64(self.config.resend_rtt_multiplier)
    }

    /// Hands a user message to the lane's sender channel. The message must fit into a single
    ///  datagram, i.e. fragmentation happens before this call.
    pub fn enqueue(&mut self, message: Arc<OutgoingMessage>, lane: Lane) -> SendResult {
        if self.status != ConnectionStatus::Connected {
            return SendResult::FailedNotConnected;
        }
        debug_assert!(message.byte_len() <= self.config.max_message_payload());

        let resend_delay = self.resend_delay();
        let config = &self.config;
        let sender = self.senders.entry(lane)
            .or_insert_with(|| new_sender_channel(lane.method, config, resend_delay));

        let result = sender.enqueue(message);
        if result == SendResult::Dropped {
            self.statistics.dropped_messages += 1;
        }
        result
    }

    pub fn on_datagram_received(&mut self, num_bytes: usize) {
        self.statistics.on_datagram_received(num_bytes);
    }

    /// Processes a message from this connection's remote peer
    pub fn receive_message(&mut self, now: Instant, header: &MessageHeader, payload: &[u8]) {
        trace!("received {:?} from {:?}", header, self.remote_addr);

        if self.status == ConnectionStatus::Disconnected {
            trace!("connection with {:?} is disconnected - dropping message", self.remote_addr);
            return;
        }

        match header.message_type {
            MessageType::UserData => self.on_user_data(now, header, payload),
            MessageType::Acknowledge => self.on_acknowledge(now, header, payload),
            MessageType::Ping => self.on_ping(now, header, payload),
            MessageType::Pong => self.on_pong(now, header, payload),
            MessageType::Connect => self.on_connect(header, payload),
            MessageType::ConnectResponse => self.on_connect_response(now),
            MessageType::ConnectionEstablished => {
                if self.status == ConnectionStatus::RespondedConnect {
                    self.on_established(now);
                }
            }
            MessageType::Disconnect => {
                let reason = control::read_text(&mut payload_buffer(header, payload))
                    .unwrap_or_else(|_| "remote peer disconnected".to_string());
                info!("remote peer {:?} disconnected: {}", self.remote_addr, reason);
                self.set_disconnected(reason);
            }
            MessageType::Discovery | MessageType::DiscoveryResponse | MessageType::UnconnectedData => {
                warn!("unconnected message {:?} was routed to connection {:?} - this is a bug", header.message_type, self.remote_addr);
            }
        }
    }

    fn on_user_data(&mut self, now: Instant, header: &MessageHeader, payload: &[u8]) {
        match self.status {
            ConnectionStatus::Connected => {}
            ConnectionStatus::RespondedConnect => self.on_established(now),
            _ => {
                debug!("user data from {:?} before the connection was established - dropping", self.remote_addr);
                return;
            }
        }

        let lane = header.lane;
        if lane.channel >= self.config.num_channels(lane.method) {
            warn!("message from {:?} on {} which is not configured - dropping", self.remote_addr, lane);
            return;
        }

        let mut message = self.pool.create_incoming(header.message_type, self.remote_addr, lane, header.sequence_number, now);
        message.replace_contents(payload, header.payload_bits.safe_cast());
        message.set_fragment(header.is_fragment);
        self.statistics.received_messages += 1;

        let config = &self.config;
        let receiver = self.receivers.entry(lane)
            .or_insert_with(|| new_receiver_channel(lane.method, config));
        receiver.receive(message, &mut self.receive_output);

        for sequence_number in self.receive_output.acks.drain(..) {
            self.pending_acks.push((lane, sequence_number));
        }
        for released in self.receive_output.released.drain(..) {
            if released.is_fragment() {
                if let Some(reassembled) = self.fragments.insert(now, released) {
                    self.events.push(ConnectionEvent::Data(reassembled));
                }
            }
            else {
                self.events.push(ConnectionEvent::Data(released));
            }
        }
    }

    fn on_acknowledge(&mut self, now: Instant, header: &MessageHeader, payload: &[u8]) {
        if self.status == ConnectionStatus::RespondedConnect {
            self.on_established(now);
        }
        if self.status != ConnectionStatus::Connected {
            return;
        }

        let acks = match control::read_acks(&mut payload_buffer(header, payload)) {
            Ok(acks) => acks,
            Err(e) => {
                debug!("invalid acknowledge message from {:?}: {}", self.remote_addr, e);
                return;
            }
        };

        for (lane, sequence_number) in acks {
            if let Some(sender) = self.senders.get_mut(&lane) {
                sender.receive_acknowledge(now, sequence_number, &mut self.record_scratch);
                for record in self.record_scratch.drain(..) {
                    self.pending_records.push((lane, record));
                }
            }
            else {
                debug!("ack from {:?} for {} which we never sent on - ignoring", self.remote_addr, lane);
            }
        }
    }

    fn on_ping(&mut self, now: Instant, header: &MessageHeader, payload: &[u8]) {
        if self.status == ConnectionStatus::RespondedConnect {
            self.on_established(now);
        }
        if self.status != ConnectionStatus::Connected {
            return;
        }

        match control::read_ping_number(&mut payload_buffer(header, payload)) {
            Ok(ping_number) => {
                let mut buf = BitBuffer::new();
                control::write_ping_number(&mut buf, ping_number);
                self.library_messages.push((MessageType::Pong, buf));
            }
            Err(e) => debug!("invalid ping from {:?}: {}", self.remote_addr, e),
        }
    }

    fn on_pong(&mut self, now: Instant, header: &MessageHeader, payload: &[u8]) {
        if self.status != ConnectionStatus::Connected {
            return;
        }

        let pong_number = match control::read_ping_number(&mut payload_buffer(header, payload)) {
            Ok(nr) => nr,
            Err(e) => {
                debug!("invalid pong from {:?}: {}", self.remote_addr, e);
                return;
            }
        };

        if self.latency.received_pong(now, pong_number).is_some() {
            let resend_delay = self.resend_delay();
            trace!("resend delay for {:?} is now {:?}", self.remote_addr, resend_delay);
            for sender in self.senders.values_mut() {
                sender.set_resend_delay(resend_delay);
            }
        }
    }

    fn on_connect(&mut self, header: &MessageHeader, payload: &[u8]) {
        match control::read_text(&mut payload_buffer(header, payload)) {
            Ok(app_identifier) if app_identifier == self.config.app_identifier => {}
            Ok(app_identifier) => {
                debug!("connect request from {:?} for application {:?} - ignoring", self.remote_addr, app_identifier);
                return;
            }
            Err(e) => {
                debug!("invalid connect request from {:?}: {}", self.remote_addr, e);
                return;
            }
        }

        match self.status {
            ConnectionStatus::RespondedConnect => {
                // our response was probably lost
                self.library_messages.push((MessageType::ConnectResponse, BitBuffer::new()));
            }
            ConnectionStatus::InitiatedConnect => {
                debug!("{:?} connected to us while we were connecting to it", self.remote_addr);
                self.status = ConnectionStatus::RespondedConnect;
                self.handshake = HandshakeState::new();
            }
            ConnectionStatus::Connected => {
                info!("remote peer {:?} reconnected - resetting the connection", self.remote_addr);
                self.reset_channels();
                self.status = ConnectionStatus::RespondedConnect;
                self.handshake = HandshakeState::new();
                self.events.push(ConnectionEvent::StatusChanged {
                    status: ConnectionStatus::RespondedConnect,
                    reason: "remote peer reconnected".to_string(),
                });
            }
            ConnectionStatus::Disconnected => {}
        }
    }

    fn on_connect_response(&mut self, now: Instant) {
        match self.status {
            ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => {
                self.on_established(now);
                self.library_messages.push((MessageType::ConnectionEstablished, BitBuffer::new()));
            }
            ConnectionStatus::Connected => {
                // our confirmation was lost
                self.library_messages.push((MessageType::ConnectionEstablished, BitBuffer::new()));
            }
            ConnectionStatus::Disconnected => {}
        }
    }

    fn on_established(&mut self, now: Instant) {
        info!("connection with {:?} established", self.remote_addr);
        self.status = ConnectionStatus::Connected;
        self.latency.restart(now);
        self.events.push(ConnectionEvent::StatusChanged {
            status: ConnectionStatus::Connected,
            reason: String::new(),
        });
    }

    /// Periodic processing: handshake resends, timeout detection, pings, (re)sending of user
    ///  messages and flushing of acks and protocol messages into datagrams
    pub fn heartbeat(&mut self, now: Instant) {
        match self.status {
            ConnectionStatus::Disconnected => return,
            ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => self.handshake_heartbeat(now),
            ConnectionStatus::Connected => {
                if self.latency.is_timed_out(now) {
                    warn!("connection with {:?} timed out", self.remote_addr);
                    self.disconnect("connection timed out");
                    return;
                }
                if self.latency.is_ping_due(now) {
                    let ping_number = self.latency.send_ping(now);
                    let mut buf = BitBuffer::new();
                    control::write_ping_number(&mut buf, ping_number);
                    self.library_messages.push((MessageType::Ping, buf));
                }
            }
        }

        self.flush(now);
        self.fragments.expire(now);
    }

    fn handshake_heartbeat(&mut self, now: Instant) {
        let is_due = match self.handshake.last_sent {
            None => true,
            Some(last_sent) => now.saturating_duration_since(last_sent) >= self.config.handshake_interval,
        };
        if !is_due {
            return;
        }

        if self.handshake.num_attempts >= self.config.max_handshake_attempts {
            warn!("no handshake response from {:?} after {} attempts - giving up", self.remote_addr, self.handshake.num_attempts);
            self.set_disconnected("failed to establish connection: no response from remote peer".to_string());
            return;
        }

        self.handshake.num_attempts += 1;
        self.handshake.last_sent = Some(now);

        if self.status == ConnectionStatus::InitiatedConnect {
            debug!("sending connect request to {:?} (attempt {})", self.remote_addr, self.handshake.num_attempts);
            let mut buf = BitBuffer::new();
            control::write_text(&mut buf, &self.config.app_identifier);
            self.library_messages.push((MessageType::Connect, buf));
        }
        else {
            debug!("sending connect response to {:?} (attempt {})", self.remote_addr, self.handshake.num_attempts);
            self.library_messages.push((MessageType::ConnectResponse, BitBuffer::new()));
        }
    }

    fn flush(&mut self, now: Instant) {
        if !self.pending_acks.is_empty() {
            let max_acks_per_message = self.config.max_message_payload() * 8 / ACK_BITS;
            for chunk in self.pending_acks.chunks(max_acks_per_message) {
                let mut buf = BitBuffer::new();
                for &(lane, sequence_number) in chunk {
                    control::write_ack(&mut buf, lane, sequence_number);
                }
                self.library_messages.push((MessageType::Acknowledge, buf));
            }
            self.pending_acks.clear();
        }

        for (message_type, buf) in self.library_messages.drain(..) {
            write_library_message(&mut self.writer, message_type, &buf);
        }

        if self.status != ConnectionStatus::Connected {
            self.pending_records.clear();
            return;
        }

        for (lane, record) in self.pending_records.drain(..) {
            write_record(&mut self.writer, &mut self.statistics, lane, &record);
        }
        for (&lane, sender) in self.senders.iter_mut() {
            sender.send_queued_messages(now, &mut self.record_scratch);
            for record in self.record_scratch.drain(..) {
                write_record(&mut self.writer, &mut self.statistics, lane, &record);
            }
        }
    }

    /// Returns the datagrams that are ready to be sent to the remote peer
    pub fn take_datagrams(&mut self) -> Vec<Bytes> {
        let datagrams = self.writer.take_datagrams();
        for datagram in &datagrams {
            self.statistics.on_datagram_sent(datagram.len());
        }
        datagrams
    }

    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Sends a disconnect message to the remote peer and closes the connection. Messages that
    ///  were not sent or acknowledged yet are discarded.
    pub fn disconnect(&mut self, reason: &str) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }

        debug!("disconnecting from {:?}: {}", self.remote_addr, reason);
        let mut buf = BitBuffer::new();
        //NB: the reason is application provided and must fit into a single message
        control::write_text(&mut buf, control::truncate_text(reason, self.config.max_message_payload()));
        write_library_message(&mut self.writer, MessageType::Disconnect, &buf);

        self.set_disconnected(reason.to_string());
    }

    fn set_disconnected(&mut self, reason: String) {
        self.status = ConnectionStatus::Disconnected;
        self.reset_channels();
        self.library_messages.clear();
        self.events.push(ConnectionEvent::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason,
        });
    }

    fn reset_channels(&mut self) {
        for sender in self.senders.values_mut() {
            sender.reset();
        }
        for receiver in self.receivers.values_mut() {
            receiver.reset();
        }
        self.fragments.clear();
        self.pending_acks.clear();
        self.pending_records.clear();
    }
}

fn payload_buffer(header: &MessageHeader, payload: &[u8]) -> BitBuffer {
    let mut buf = BitBuffer::with_capacity(payload.len());
    buf.replace_contents(payload, header.payload_bits.safe_cast());
    buf
}

fn write_library_message(writer: &mut DatagramWriter, message_type: MessageType, payload: &BitBuffer) {
    let header = MessageHeader::new(message_type, Lane::UNSEQUENCED, 0, payload.bit_len().prechecked_cast());
    writer.write_message(&header, payload.as_bytes());
}

fn write_record(writer: &mut DatagramWriter, statistics: &mut ConnectionStatistics, lane: Lane, record: &OutgoingRecord) {
    let mut header = MessageHeader::new(record.message.message_type(), lane, record.sequence_number, record.message.bit_len().prechecked_cast());
    header.is_fragment = record.message.is_fragment();
    writer.write_message(&header, record.message.payload_bytes());
    statistics.on_message_sent(record.kind);
}
