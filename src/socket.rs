use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Abstraction over the unreliable datagram service a connection emits
///  segments through. Delivery is best-effort: datagrams may be dropped,
///  duplicated or reordered, and the transport above has to cope. Introduced
///  as a trait to allow mocking the I/O away for tests (and to inject loss).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Hand one datagram to the network. Send errors are not surfaced to the
    ///  transport - an undeliverable datagram is indistinguishable from a
    ///  dropped one, and retransmission covers both.
    async fn send_to(&self, to: SocketAddr, datagram: &[u8]);

    fn local_addr(&self) -> SocketAddr;

    /// Release the underlying transport. Idempotent; a send after a close is
    ///  treated like any other undeliverable datagram.
    async fn close(&self);
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);

        if let Err(e) = UdpSocket::send_to(self, datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    async fn close(&self) {
        // tokio's UdpSocket has no explicit shutdown - the descriptor is
        //  released when the last handle drops, which keeps this idempotent
        trace!("UDP socket: closing {:?}", DatagramSocket::local_addr(self));
    }
}
