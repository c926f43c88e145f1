use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", datagram.len(), to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}


/// All outgoing datagrams pass through here. A configurable fraction of them is dropped
///  deliberately to simulate a lossy network.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    simulated_loss: f64,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, simulated_loss: f64) -> SendPipeline {
        if simulated_loss > 0.0 {
            debug!("simulating loss of {}% of outgoing datagrams", simulated_loss * 100.0);
        }
        SendPipeline { socket, simulated_loss, }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    fn is_simulated_loss(&self) -> bool {
        self.simulated_loss > 0.0 && rand::thread_rng().gen::<f64>() < self.simulated_loss
    }

    pub async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        if self.is_simulated_loss() {
            trace!("simulated loss: dropping datagram to {:?}", to);
            return;
        }
        self.socket.do_send_datagram(to, datagram).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forwards_datagrams() {
        let to = SocketAddr::from(([1, 2, 3, 4], 5));
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_datagram()
            .once()
            .withf(move |addr, datagram| addr == &to && datagram == [1u8, 2, 3].as_slice())
            .returning(|_, _| ());

        let pipeline = SendPipeline::new(Arc::new(socket), 0.0);
        pipeline.send_datagram(to, &[1, 2, 3]).await;
    }

    #[tokio::test]
    async fn test_simulated_loss() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_datagram()
            .times(200..800)
            .returning(|_, _| ());

        let pipeline = SendPipeline::new(Arc::new(socket), 0.5);
        for _ in 0..1000 {
            pipeline.send_datagram(SocketAddr::from(([1, 2, 3, 4], 5)), &[1]).await;
        }
    }
}
