use crate::buffers::MessagePool;
use crate::config::{PeerConfig, UnreliableSizeBehaviour};
use crate::connection::{Connection, ConnectionEvent, ConnectionStatus};
use crate::connection::control;
use crate::fragmentation::Fragmenter;
use crate::message::datagram::{single_message_datagram, MessageReader};
use crate::message::header::MessageHeader;
use crate::message::{Lane, MessageType, OutgoingMessage, SendResult};
use crate::peer::send_pipeline::SendPipeline;
use crate::peer::{ConnectionInfo, PeerCommand, PeerEvent};
use crate::bits::BitBuffer;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, span, trace, warn, Level};
use uuid::Uuid;

/// upper bound for the size of a UDP datagram
const MAX_DATAGRAM_SIZE: usize = 65536;

/// The network task: it owns the socket's receive side and all connections, and it is the only
///  place where channel state is touched. The application talks to it through [PeerCommand]s and
///  receives [PeerEvent]s.
pub(crate) struct NetworkLoop {
    config: Arc<PeerConfig>,
    pool: Arc<MessagePool>,
    send_pipeline: SendPipeline,
    connections: FxHashMap<SocketAddr, Connection>,
    fragmenter: Fragmenter,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl NetworkLoop {
    pub fn new(config: Arc<PeerConfig>, pool: Arc<MessagePool>, send_pipeline: SendPipeline, events: mpsc::UnboundedSender<PeerEvent>) -> NetworkLoop {
        NetworkLoop {
            fragmenter: Fragmenter::new(config.max_fragmentation_groups),
            config,
            pool,
            send_pipeline,
            connections: FxHashMap::default(),
            events,
        }
    }

    pub async fn run(mut self, socket: Arc<UdpSocket>, mut commands: mpsc::Receiver<PeerCommand>) {
        info!("starting network loop on {:?}", self.send_pipeline.local_addr());

        let mut receive_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut ticks = time::interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                received = socket.recv_from(&mut receive_buf) => {
                    match received {
                        Ok((num_read, from)) => self.on_datagram(Instant::now(), from, &receive_buf[..num_read]),
                        Err(e) => {
                            //NB: e.g. ICMP 'port unreachable' is reported here on some platforms
                            debug!("error receiving from UDP socket: {}", e);
                        }
                    }
                }
                _ = ticks.tick() => {
                    self.on_tick(Instant::now()).await;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.on_command(Instant::now(), cmd).await {
                                break;
                            }
                        }
                        None => {
                            info!("peer handle was dropped - shutting down");
                            self.shutdown("peer shut down").await;
                            break;
                        }
                    }
                }
            }
        }

        info!("network loop on {:?} terminated", self.send_pipeline.local_addr());
    }

    pub fn on_datagram(&mut self, now: Instant, from: SocketAddr, datagram: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received datagram of {} bytes from {:?}", datagram.len(), from);

        if let Some(conn) = self.connections.get_mut(&from) {
            conn.on_datagram_received(datagram.len());
        }

        for message in MessageReader::new(datagram) {
            let (header, payload) = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!("malformed datagram from {:?}: {} - dropping the rest of it", from, e);
                    break;
                }
            };

            if header.message_type.is_unconnected() {
                self.on_unconnected_message(now, from, &header, payload);
            }
            else if let Some(conn) = self.connections.get_mut(&from) {
                conn.receive_message(now, &header, payload);
            }
            else if header.message_type == MessageType::Connect {
                self.on_connect_request(now, from, &header, payload);
            }
            else {
                trace!("{:?} from {:?} without a connection - dropping", header.message_type, from);
            }
        }

        self.forward_events(from);
    }

    fn on_connect_request(&mut self, now: Instant, from: SocketAddr, header: &MessageHeader, payload: &[u8]) {
        if !self.config.accept_incoming_connections {
            debug!("connect request from {:?}, but incoming connections are not accepted - ignoring", from);
            return;
        }
        if self.connections.len() >= self.config.max_connections {
            warn!("connect request from {:?}, but there are already {} connections - ignoring", from, self.connections.len());
            return;
        }

        let mut buf = BitBuffer::with_capacity(payload.len());
        buf.replace_contents(payload, header.payload_bits.safe_cast());
        match control::read_text(&mut buf) {
            Ok(app_identifier) if app_identifier == self.config.app_identifier => {}
            Ok(app_identifier) => {
                debug!("connect request from {:?} for application {:?} - ignoring", from, app_identifier);
                return;
            }
            Err(e) => {
                debug!("invalid connect request from {:?}: {}", from, e);
                return;
            }
        }

        info!("accepting connection from {:?}", from);
        let mut conn = Connection::new_incoming(from, self.config.clone(), self.pool.clone(), now);
        conn.on_datagram_received(MessageHeader::SERIALIZED_LEN + payload.len());
        self.connections.insert(from, conn);
    }

    fn on_unconnected_message(&mut self, now: Instant, from: SocketAddr, header: &MessageHeader, payload: &[u8]) {
        if header.is_fragment {
            debug!("fragmented {:?} from {:?} - unconnected messages are never fragmented, dropping", header.message_type, from);
            return;
        }
        if header.message_type == MessageType::Discovery && !self.config.accept_discovery_requests {
            trace!("discovery request from {:?}, but discovery is disabled - ignoring", from);
            return;
        }

        let mut message = self.pool.create_incoming(header.message_type, from, Lane::UNSEQUENCED, 0, now);
        message.replace_contents(payload, header.payload_bits.safe_cast());

        let event = match header.message_type {
            MessageType::Discovery => PeerEvent::DiscoveryRequest(message),
            MessageType::DiscoveryResponse => PeerEvent::DiscoveryResponse(message),
            _ => PeerEvent::UnconnectedData(message),
        };
        self.emit(event);
    }

    pub async fn on_tick(&mut self, now: Instant) {
        for conn in self.connections.values_mut() {
            conn.heartbeat(now);
        }

        let addrs = self.connections.keys().copied().collect::<Vec<_>>();
        for addr in addrs {
            self.flush_connection(addr).await;
        }

        self.connections.retain(|addr, conn| {
            if conn.status() == ConnectionStatus::Disconnected {
                debug!("removing connection with {:?}", addr);
                false
            }
            else {
                true
            }
        });
    }

    /// sends the connection's pending datagrams and forwards its events to the application
    async fn flush_connection(&mut self, addr: SocketAddr) {
        let datagrams: Vec<Bytes> = match self.connections.get_mut(&addr) {
            Some(conn) => conn.take_datagrams(),
            None => return,
        };
        for datagram in datagrams {
            self.send_pipeline.send_datagram(addr, &datagram).await;
        }
        self.forward_events(addr);
    }

    fn forward_events(&mut self, addr: SocketAddr) {
        let events = match self.connections.get_mut(&addr) {
            Some(conn) => conn.take_events(),
            None => return,
        };
        for event in events {
            match event {
                ConnectionEvent::Data(message) => self.emit(PeerEvent::Data(message)),
                ConnectionEvent::StatusChanged { status, reason } => self.emit(PeerEvent::StatusChanged { remote: addr, status, reason }),
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            trace!("application no longer receives events - dropping event");
        }
    }

    /// returns `false` if the loop should terminate
    pub async fn on_command(&mut self, now: Instant, cmd: PeerCommand) -> bool {
        match cmd {
            PeerCommand::Connect { to, reply } => {
                let result = self.connect(now, to);
                if result.is_ok() {
                    // send the connect request right away rather than with the next tick
                    if let Some(conn) = self.connections.get_mut(&to) {
                        conn.heartbeat(now);
                    }
                    self.flush_connection(to).await;
                }
                let _ = reply.send(result);
            }
            PeerCommand::Send { message, recipients, lane, reply } => {
                let result = self.send_user_message(message, &recipients, lane);
                let _ = reply.send(result);
            }
            PeerCommand::SendUnconnected { message, to } => {
                self.send_unconnected(message, to).await;
            }
            PeerCommand::Disconnect { remote, reason } => {
                match self.connections.get_mut(&remote) {
                    Some(conn) => conn.disconnect(&reason),
                    None => debug!("disconnect requested for {:?}, but there is no connection", remote),
                }
                self.flush_connection(remote).await;
                self.connections.remove(&remote);
            }
            PeerCommand::Connections { reply } => {
                let _ = reply.send(self.connection_infos());
            }
            PeerCommand::Shutdown { reason, reply } => {
                self.shutdown(&reason).await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn connect(&mut self, now: Instant, to: SocketAddr) -> anyhow::Result<()> {
        if self.connections.contains_key(&to) {
            bail!("there is already a connection with {:?}", to);
        }
        if self.connections.len() >= self.config.max_connections {
            bail!("maximum number of connections ({}) reached", self.config.max_connections);
        }

        info!("connecting to {:?}", to);
        self.connections.insert(to, Connection::new_outgoing(to, self.config.clone(), self.pool.clone(), now));
        Ok(())
    }

    /// Fragments the message if necessary and hands it to the recipients' connections. The
    ///  result is the worst of all recipients' results.
    fn send_user_message(&mut self, message: OutgoingMessage, recipients: &[SocketAddr], lane: Lane) -> SendResult {
        let max_payload = self.config.max_message_payload();

        let parts: Vec<Arc<OutgoingMessage>> = if message.byte_len() <= max_payload {
            vec![Arc::new(message)]
        }
        else if !lane.method.is_reliable() && self.config.unreliable_size_behaviour == UnreliableSizeBehaviour::DropAboveMtu {
            debug!("unreliable message of {} bytes exceeds the maximum of {} - dropping", message.byte_len(), max_payload);
            return SendResult::Dropped;
        }
        else {
            match self.fragmenter.split(&message, max_payload, &self.pool) {
                Ok(chunks) => chunks.into_iter().map(Arc::new).collect(),
                Err(e) => {
                    warn!("failed to fragment message of {} bytes: {}", message.byte_len(), e);
                    return SendResult::Dropped;
                }
            }
        };

        let mut result = SendResult::Sent;
        for addr in recipients {
            let recipient_result = match self.connections.get_mut(addr) {
                Some(conn) => parts.iter()
                    .map(|part| conn.enqueue(part.clone(), lane))
                    .fold(SendResult::Sent, SendResult::combine),
                None => {
                    debug!("sending to {:?} which is not connected", addr);
                    SendResult::FailedNotConnected
                }
            };
            result = result.combine(recipient_result);
        }
        result
    }

    async fn send_unconnected(&mut self, message: OutgoingMessage, to: SocketAddr) {
        let header = MessageHeader::new(message.message_type(), Lane::UNSEQUENCED, 0, message.bit_len().prechecked_cast());
        let datagram = single_message_datagram(&header, message.payload_bytes());
        trace!("sending unconnected {:?} to {:?}", message.message_type(), to);
        self.send_pipeline.send_datagram(to, &datagram).await;
    }

    fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.connections.values()
            .map(|conn| ConnectionInfo {
                remote_addr: conn.remote_addr(),
                status: conn.status(),
                average_rtt: conn.average_rtt(),
                num_queued_messages: conn.num_queued_messages(),
                statistics: conn.statistics().clone(),
            })
            .collect()
    }

    async fn shutdown(&mut self, reason: &str) {
        info!("shutting down peer on {:?}: {}", self.send_pipeline.local_addr(), reason);
        for conn in self.connections.values_mut() {
            conn.disconnect(reason);
        }
        let addrs = self.connections.keys().copied().collect::<Vec<_>>();
        for addr in addrs {
            self.flush_connection(addr).await;
        }
        self.connections.clear();
    }
}
