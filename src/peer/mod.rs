//! The peer is the application's entry point: it owns a UDP socket and a network task that
//!  manages all connections.
//!
//! The application talks to the network task through a command queue, and the task reports
//!  received messages, status changes and discovery traffic through an event queue. Connection
//!  state lives on the network task exclusively, so there is no locking around channels.

pub mod network_loop;
pub mod send_pipeline;

use crate::buffers::MessagePool;
use crate::config::PeerConfig;
use crate::connection::statistics::ConnectionStatistics;
use crate::connection::ConnectionStatus;
use crate::message::{DeliveryMethod, IncomingMessage, Lane, MessageType, OutgoingMessage, SendResult};
use crate::peer::network_loop::NetworkLoop;
use crate::peer::send_pipeline::{SendPipeline, SendSocket};
use anyhow::{anyhow, bail};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Something happened that the application should know about
#[derive(Debug)]
pub enum PeerEvent {
    /// a user message from a connected peer, in the order its delivery method guarantees
    Data(IncomingMessage),
    StatusChanged {
        remote: SocketAddr,
        status: ConnectionStatus,
        reason: String,
    },
    /// Some peer is looking for peers. The application may answer it with
    ///  [Peer::send_discovery_response].
    DiscoveryRequest(IncomingMessage),
    DiscoveryResponse(IncomingMessage),
    UnconnectedData(IncomingMessage),
}

/// snapshot of a connection's state
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub status: ConnectionStatus,
    pub average_rtt: Option<Duration>,
    pub num_queued_messages: usize,
    pub statistics: ConnectionStatistics,
}

pub(crate) enum PeerCommand {
    Connect {
        to: SocketAddr,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Send {
        message: OutgoingMessage,
        recipients: Vec<SocketAddr>,
        lane: Lane,
        reply: oneshot::Sender<SendResult>,
    },
    SendUnconnected {
        message: OutgoingMessage,
        to: SocketAddr,
    },
    Disconnect {
        remote: SocketAddr,
        reason: String,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Shutdown {
        reason: String,
        reply: oneshot::Sender<()>,
    },
}

pub struct Peer {
    config: Arc<PeerConfig>,
    pool: Arc<MessagePool>,
    local_addr: SocketAddr,
    commands: mpsc::Sender<PeerCommand>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    network_task: Option<JoinHandle<()>>,
}

impl Peer {
    /// Binds the UDP socket and starts the network task
    pub async fn start(config: PeerConfig) -> anyhow::Result<Peer> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = UdpSocket::bind(config.bind_addr).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        info!("bound peer socket to {:?}", local_addr);
        let socket = Arc::new(socket);

        let pool = Arc::new(MessagePool::new(64, config.buffer_pool_size));
        let send_socket: Arc<dyn SendSocket> = Arc::new(socket.clone());
        let send_pipeline = SendPipeline::new(send_socket, config.simulated_loss);

        let (command_send, command_recv) = mpsc::channel(1024);
        let (event_send, event_recv) = mpsc::unbounded_channel();

        let network_loop = NetworkLoop::new(config.clone(), pool.clone(), send_pipeline, event_send);
        let network_task = tokio::spawn(network_loop.run(socket, command_recv));

        Ok(Peer {
            config,
            pool,
            local_addr,
            commands: command_send,
            events: event_recv,
            network_task: Some(network_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// creates an empty user message backed by a pooled buffer
    pub fn create_message(&self) -> OutgoingMessage {
        self.pool.create_outgoing(MessageType::UserData)
    }

    pub fn message_pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    async fn send_command(&self, cmd: PeerCommand) -> anyhow::Result<()> {
        self.commands.send(cmd).await
            .map_err(|_| anyhow!("peer on {:?} is shut down", self.local_addr))
    }

    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> PeerCommand) -> anyhow::Result<T> {
        let (reply_send, reply_recv) = oneshot::channel();
        self.send_command(cmd(reply_send)).await?;
        reply_recv.await
            .map_err(|_| anyhow!("peer on {:?} shut down before replying", self.local_addr))
    }

    /// Initiates a connection. This returns once the connect request is sent; the application is
    ///  notified through a [PeerEvent::StatusChanged] when the connection is established or fails.
    pub async fn connect(&self, to: SocketAddr) -> anyhow::Result<()> {
        self.request(|reply| PeerCommand::Connect { to, reply }).await?
    }

    pub async fn send_message(&self, message: OutgoingMessage, to: SocketAddr, method: DeliveryMethod, channel: u8) -> anyhow::Result<SendResult> {
        self.send_to_many(message, &[to], method, channel).await
    }

    /// Sends the same message to several connected peers, sharing its buffer between them. The
    ///  result is the worst of all recipients' results.
    pub async fn send_to_many(&self, message: OutgoingMessage, recipients: &[SocketAddr], method: DeliveryMethod, channel: u8) -> anyhow::Result<SendResult> {
        if recipients.is_empty() {
            bail!("no recipients");
        }
        if message.message_type() != MessageType::UserData {
            bail!("only user data can be sent over connections, not {:?}", message.message_type());
        }
        let num_channels = self.config.num_channels(method);
        if channel >= num_channels {
            bail!("{:?} has {} sequence channel(s), channel {} does not exist", method, num_channels, channel);
        }

        let recipients = recipients.to_vec();
        let lane = Lane::new(method, channel);
        self.request(|reply| PeerCommand::Send { message, recipients, lane, reply }).await
    }

    /// Sends a message without a connection. Unconnected messages are not fragmented, so the
    ///  message must fit into a single datagram.
    pub async fn send_unconnected(&self, message: OutgoingMessage, to: SocketAddr) -> anyhow::Result<()> {
        self.send_unconnected_as(MessageType::UnconnectedData, message, to).await
    }

    async fn send_unconnected_as(&self, message_type: MessageType, message: OutgoingMessage, to: SocketAddr) -> anyhow::Result<()> {
        if message.byte_len() > self.config.max_message_payload() {
            bail!("unconnected message of {} bytes exceeds the maximum of {} bytes", message.byte_len(), self.config.max_message_payload());
        }
        let mut typed = self.pool.create_outgoing(message_type);
        typed.replace_contents(message.as_bytes(), message.bit_len());
        self.send_command(PeerCommand::SendUnconnected { message: typed, to }).await
    }

    /// broadcasts a discovery request to the local network
    pub async fn discover_local_peers(&self, port: u16) -> anyhow::Result<()> {
        debug!("discovering peers on port {}", port);
        let to = SocketAddr::from(([255, 255, 255, 255], port));
        self.send_unconnected_as(MessageType::Discovery, self.create_message(), to).await
    }

    /// sends a discovery request to a single known address
    pub async fn discover_known_peer(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.send_unconnected_as(MessageType::Discovery, self.create_message(), addr).await
    }

    pub async fn send_discovery_response(&self, message: OutgoingMessage, to: SocketAddr) -> anyhow::Result<()> {
        self.send_unconnected_as(MessageType::DiscoveryResponse, message, to).await
    }

    /// Closes a connection, notifying the remote peer. Messages that are not yet sent or
    ///  acknowledged are discarded.
    pub async fn disconnect(&self, remote: SocketAddr, reason: &str) -> anyhow::Result<()> {
        self.send_command(PeerCommand::Disconnect { remote, reason: reason.to_string() }).await
    }

    pub async fn connections(&self) -> anyhow::Result<Vec<ConnectionInfo>> {
        self.request(|reply| PeerCommand::Connections { reply }).await
    }

    /// waits for the next event, returning `None` after the network task terminated
    pub async fn recv_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    pub fn try_recv_event(&mut self) -> Option<PeerEvent> {
        self.events.try_recv().ok()
    }

    /// disconnects all connections and stops the network task
    pub async fn shutdown(mut self, reason: &str) -> anyhow::Result<()> {
        let reason = reason.to_string();
        self.request(|reply| PeerCommand::Shutdown { reason, reply }).await?;
        if let Some(network_task) = self.network_task.take() {
            network_task.await?;
        }
        Ok(())
    }
}
