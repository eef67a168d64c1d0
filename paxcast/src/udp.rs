//! UDP transport over tokio.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::membership::Member;
use crate::transport::{Transport, TransportError};

/// Largest datagram we accept.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Datagrams buffered between the socket and the event loop.
const INBOUND_CAPACITY: usize = 1_024;

/// Fire-and-forget UDP transport.
///
/// Sends never wait: a full socket buffer loses the datagram, which the
/// protocol treats like any other loss.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a socket on `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(addr = %socket.local_addr()?, "udp transport bound");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive loop. Datagrams are forwarded until `token` is
    /// cancelled or the returned receiver is dropped.
    pub fn spawn_receiver(&self, token: CancellationToken) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            trace!(from = %from, len, "datagram");
                            match tx.try_send(buf[..len].to_vec()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!(from = %from, "inbound queue full, dropping datagram");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => break,
                            }
                        }
                        Err(e) => warn!(error = %e, "udp receive failed"),
                    },
                }
            }
            debug!("udp receiver stopped");
        });
        rx
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, to: Member, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.try_send_to(bytes, to.addr())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loopback_datagram() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind a");
        let b = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind b");
        let token = CancellationToken::new();
        let mut inbound = b.spawn_receiver(token.clone());

        let to = Member::new(b.local_addr().expect("addr"));
        a.send_to(to, b"ping").expect("send");

        let got = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("no timeout")
            .expect("datagram");
        assert_eq!(got, b"ping");

        token.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("receiver stops");
        assert!(closed.is_none());
    }
}
