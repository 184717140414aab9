use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use bytes::Bytes;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use super::constants::RECV_BUFFER_SIZE;
use super::protocol::{ErrorCode, Packet};
use super::socket::TftpSocket;
use crate::config::TransferConfig;
use crate::error::{TransferError, TransportError};

/// What a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Delete,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "get" => Ok(Self::Read),
            "write" | "put" => Ok(Self::Write),
            "delete" | "del" => Ok(Self::Delete),
            _ => Err(format!(
                "unknown operation '{}' (expected read, write or delete)",
                s
            )),
        }
    }
}

/// Lifecycle of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Exchanging,
    Done,
    Aborted,
}

/// Other end of the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peer {
    /// Request sent to this address; the first reply from its host fixes the TID
    Pending(SocketAddr),
    Fixed(SocketAddr),
}

/// What one wait for a response produced
#[derive(Debug)]
pub(crate) enum Incoming {
    Packet(Packet),
    /// A datagram from the peer that does not decode
    Invalid,
    Timeout,
}

/// Block and byte counts of a finished transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub blocks: u64,
    pub bytes: u64,
}

/// One side of a transfer: its socket, the peer's transaction ID and the
/// stop-and-wait retry state.
///
/// At most one packet is outstanding. `last_sent` holds it so a soft failure
/// (timeout, garbage, out-of-order packet) can resend it.
pub(crate) struct Session {
    socket: TftpSocket,
    peer: Peer,
    state: SessionState,
    retries: u32,
    max_retries: u32,
    last_sent: Option<Bytes>,
    recv_buf: Vec<u8>,
}

impl Session {
    /// Server side: the peer is known from the request
    pub(crate) fn with_peer(socket: TftpSocket, peer: SocketAddr, config: &TransferConfig) -> Self {
        Self::new(socket, Peer::Fixed(peer), config)
    }

    /// Client side: the peer's port is learned from its first reply
    pub(crate) fn with_server(
        socket: TftpSocket,
        server: SocketAddr,
        config: &TransferConfig,
    ) -> Self {
        Self::new(socket, Peer::Pending(server), config)
    }

    fn new(socket: TftpSocket, peer: Peer, config: &TransferConfig) -> Self {
        Self {
            socket,
            peer,
            state: SessionState::Init,
            retries: 0,
            max_retries: config.max_retries.max(1),
            last_sent: None,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr()
    }

    fn peer_addr(&self) -> SocketAddr {
        match self.peer {
            Peer::Pending(addr) | Peer::Fixed(addr) => addr,
        }
    }

    /// Send the opening request. It is sent exactly once and never resent.
    pub(crate) async fn send_request(&mut self, packet: &Packet) -> Result<(), TransferError> {
        let bytes = packet.to_bytes()?;
        self.socket.send(self.peer_addr(), &bytes).await?;
        self.state = SessionState::Exchanging;
        debug!("Sent {} to {}", packet, self.peer_addr());
        Ok(())
    }

    /// Send a DATA or ACK packet and remember it for retransmission
    pub(crate) async fn send(&mut self, packet: &Packet) -> Result<(), TransferError> {
        let bytes = packet.to_bytes()?;
        self.socket.send(self.peer_addr(), &bytes).await?;
        self.last_sent = Some(bytes);
        self.state = SessionState::Exchanging;
        Ok(())
    }

    /// Best-effort ERROR to the peer. The session is over either way.
    pub(crate) async fn send_error(&mut self, code: ErrorCode, message: &str) {
        let peer = self.peer_addr();
        match Packet::error(code, message).to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send(peer, &bytes).await {
                    warn!("Failed to send error to {}: {}", peer, e);
                }
            }
            Err(e) => warn!("Failed to encode error packet: {}", e),
        }
        self.state = SessionState::Aborted;
    }

    /// Wait for the next packet from the peer.
    ///
    /// Datagrams from any other address are answered with `UnknownTid` and
    /// do not count against the retry budget, but they cannot extend the
    /// wait beyond one receive window.
    pub(crate) async fn recv(&mut self) -> Result<Incoming, TransferError> {
        let deadline = Instant::now() + self.socket.receive_window();
        loop {
            let (len, from) = match timeout_at(deadline, self.socket.receive(&mut self.recv_buf)).await {
                Err(_) | Ok(Err(TransportError::Timeout)) => return Ok(Incoming::Timeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };

            let current = self.peer;
            match current {
                Peer::Fixed(peer) if peer == from => {}
                Peer::Pending(server) if server.ip() == from.ip() => {
                    debug!("Transfer ID fixed to {}", from);
                    self.peer = Peer::Fixed(from);
                }
                _ => {
                    self.reject_stranger(from).await;
                    continue;
                }
            }

            return Ok(match Packet::decode(&self.recv_buf[..len]) {
                Ok(packet) => Incoming::Packet(packet),
                Err(e) => {
                    debug!("Undecodable packet from {}: {}", from, e);
                    Incoming::Invalid
                }
            });
        }
    }

    async fn reject_stranger(&self, from: SocketAddr) {
        warn!("Packet from unknown transfer ID {} (expecting {})", from, self.peer_addr());
        let reply = Packet::error(ErrorCode::UnknownTid, ErrorCode::UnknownTid.default_message());
        if let Ok(bytes) = reply.to_bytes() {
            let _ = self.socket.send(from, &bytes).await;
        }
    }

    /// The awaited packet arrived
    pub(crate) fn accept(&mut self) {
        self.retries = 0;
    }

    /// Count a timeout or invalid response and resend the outstanding packet.
    ///
    /// Once the budget is spent the session aborts without sending anything.
    pub(crate) async fn retry(&mut self, reason: &str) -> Result<(), TransferError> {
        self.retries += 1;
        if self.retries >= self.max_retries {
            warn!(
                "Lost connection to {} after {} attempts ({})",
                self.peer_addr(),
                self.retries,
                reason
            );
            self.state = SessionState::Aborted;
            return Err(TransferError::RetriesExhausted(self.retries));
        }
        debug!(
            "Retry {}/{} with {}: {}",
            self.retries,
            self.max_retries,
            self.peer_addr(),
            reason
        );
        if let Some(bytes) = &self.last_sent {
            self.socket.send(self.peer_addr(), bytes).await?;
        }
        Ok(())
    }

    /// Handle a response that is not the awaited one.
    ///
    /// A peer ERROR aborts at once; anything else is a soft failure.
    pub(crate) async fn reject(&mut self, incoming: Incoming) -> Result<(), TransferError> {
        match incoming {
            Incoming::Packet(Packet::Error { code, message }) => {
                warn!("Peer {} aborted transfer: {}: {}", self.peer_addr(), code, message);
                self.state = SessionState::Aborted;
                Err(TransferError::Peer { code, message })
            }
            Incoming::Packet(packet) => self.retry(&format!("unexpected {}", packet)).await,
            Incoming::Invalid => self.retry("malformed packet").await,
            Incoming::Timeout => self.retry("timeout").await,
        }
    }

    pub(crate) fn finish(&mut self) {
        self.state = SessionState::Done;
    }

    pub(crate) fn abort(&mut self) {
        self.state = SessionState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::protocol::Opcode;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn quick_config() -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(60),
            recv_tries: 1,
            max_retries: 3,
        }
    }

    async fn session_with(peer: SocketAddr) -> Session {
        let config = quick_config();
        let socket = TftpSocket::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            config.timeout,
            config.recv_tries,
        )
        .await
        .unwrap();
        Session::with_peer(socket, peer, &config)
    }

    #[tokio::test]
    async fn test_stranger_gets_unknown_tid_and_session_continues() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut session = session_with(peer.local_addr().unwrap()).await;
        let target = session.local_addr().unwrap();

        let ack = Packet::Ack { block: 1 }.to_bytes().unwrap();
        stranger.send_to(&ack, target).await.unwrap();
        peer.send_to(&ack, target).await.unwrap();

        match session.recv().await.unwrap() {
            Incoming::Packet(packet) => assert_eq!(packet, Packet::Ack { block: 1 }),
            other => panic!("Expected ACK, got {:?}", other),
        }

        let mut buf = [0u8; 64];
        let (len, _) = stranger.recv_from(&mut buf).await.unwrap();
        match Packet::decode(&buf[..len]).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownTid),
            other => panic!("Expected ERROR, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Init);
    }

    #[tokio::test]
    async fn test_retry_budget_resends_then_goes_quiet() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut session = session_with(peer.local_addr().unwrap()).await;

        let data = Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"hello"),
        };
        session.send(&data).await.unwrap();
        assert_eq!(session.state(), SessionState::Exchanging);

        let outcome = loop {
            let incoming = session.recv().await.unwrap();
            if let Err(e) = session.reject(incoming).await {
                break e;
            }
        };
        assert!(matches!(outcome, TransferError::RetriesExhausted(3)));
        assert_eq!(session.state(), SessionState::Aborted);

        let mut sent = 0;
        let mut buf = [0u8; 64];
        while let Ok(Ok((len, _))) =
            tokio::time::timeout(Duration::from_millis(150), peer.recv_from(&mut buf)).await
        {
            assert_eq!(Packet::decode(&buf[..len]).unwrap(), data);
            sent += 1;
        }
        assert_eq!(sent, 3);
    }

    #[tokio::test]
    async fn test_peer_error_aborts_without_retry() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut session = session_with(peer.local_addr().unwrap()).await;
        let target = session.local_addr().unwrap();

        let error = Packet::error(ErrorCode::DiskFull, "no room").to_bytes().unwrap();
        peer.send_to(&error, target).await.unwrap();

        let incoming = session.recv().await.unwrap();
        match session.reject(incoming).await {
            Err(TransferError::Peer { code, message }) => {
                assert_eq!(code, ErrorCode::DiskFull);
                assert_eq!(message, "no room");
            }
            other => panic!("Expected peer error, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_pending_peer_fixed_by_first_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = quick_config();
        let socket = TftpSocket::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            config.timeout,
            config.recv_tries,
        )
        .await
        .unwrap();
        let mut session = Session::with_server(socket, server.local_addr().unwrap(), &config);

        session
            .send_request(&Packet::read_request("a.txt"))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (len, client) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            Packet::decode(&buf[..len]).unwrap().opcode(),
            Opcode::ReadRequest
        );

        let data = Packet::Data {
            block: 1,
            payload: Bytes::new(),
        };
        transfer
            .send_to(&data.to_bytes().unwrap(), client)
            .await
            .unwrap();
        assert!(matches!(session.recv().await.unwrap(), Incoming::Packet(_)));

        // Now the well-known port is a stranger.
        server
            .send_to(&data.to_bytes().unwrap(), client)
            .await
            .unwrap();
        assert!(matches!(session.recv().await.unwrap(), Incoming::Timeout));
        let (len, _) = server.recv_from(&mut buf).await.unwrap();
        assert!(matches!(
            Packet::decode(&buf[..len]).unwrap(),
            Packet::Error {
                code: ErrorCode::UnknownTid,
                ..
            }
        ));
    }
}
