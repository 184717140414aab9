use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::constants::{EPHEMERAL_BIND_TRIES, MAX_EPHEMERAL_PORT, MIN_EPHEMERAL_PORT};
use crate::error::TransportError;

/// UDP socket with a bounded receive discipline.
///
/// Each receive waits up to `timeout`, and absorbs up to `recv_tries`
/// consecutive timeouts before reporting [`TransportError::Timeout`].
#[derive(Debug)]
pub struct TftpSocket {
    socket: UdpSocket,
    timeout: Duration,
    recv_tries: u32,
}

impl TftpSocket {
    /// Bind to a fixed address
    pub async fn bind(
        addr: SocketAddr,
        timeout: Duration,
        recv_tries: u32,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self {
            socket,
            timeout,
            recv_tries: recv_tries.max(1),
        })
    }

    /// Bind to a random port in [1024, 65535], trying a few candidates
    pub async fn bind_ephemeral(
        ip: IpAddr,
        timeout: Duration,
        recv_tries: u32,
    ) -> Result<Self, TransportError> {
        for attempt in 1..=EPHEMERAL_BIND_TRIES {
            let port = rand::rng().random_range(MIN_EPHEMERAL_PORT..=MAX_EPHEMERAL_PORT);
            match Self::bind(SocketAddr::new(ip, port), timeout, recv_tries).await {
                Ok(socket) => {
                    debug!("Transfer socket bound to {}:{}", ip, port);
                    return Ok(socket);
                }
                Err(e) => {
                    debug!("Ephemeral bind attempt {} failed: {}", attempt, e);
                }
            }
        }
        Err(TransportError::EphemeralExhausted {
            tries: EPHEMERAL_BIND_TRIES,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Longest time a single `receive` call can block
    pub fn receive_window(&self) -> Duration {
        self.timeout * self.recv_tries
    }

    /// Send the whole buffer as one datagram
    pub async fn send(&self, addr: SocketAddr, buf: &[u8]) -> Result<(), TransportError> {
        let sent = self.socket.send_to(buf, addr).await?;
        if sent != buf.len() {
            return Err(TransportError::ShortWrite {
                sent,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    /// Receive one datagram from any source
    pub async fn receive(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        for _ in 0..self.recv_tries {
            match timeout(self.timeout, self.socket.recv_from(buf)).await {
                Ok(result) => return Ok(result?),
                Err(_) => continue,
            }
        }
        Err(TransportError::Timeout)
    }
}
