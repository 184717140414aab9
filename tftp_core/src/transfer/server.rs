//! Request dispatcher and server-side sessions.
//!
//! [`TftpServer`] owns the well-known socket. Each accepted request gets a
//! task of its own with a fresh ephemeral socket; the dispatcher never waits
//! on a session.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::constants::{DELETE_ACK_BLOCK, RECV_BUFFER_SIZE};
use super::protocol::{ErrorCode, Packet, is_octet_mode};
use super::receiver::receive_file;
use super::sender::send_file;
use super::session::{Operation, Session, TransferStats};
use super::socket::TftpSocket;
use super::utils::validate_file_name;
use crate::access::FileAccessArbiter;
use crate::config::{ServerConfig, TransferConfig};
use crate::error::{AccessError, TransferError, TransportError};

pub struct TftpServer {
    config: ServerConfig,
    socket: TftpSocket,
    arbiter: Arc<FileAccessArbiter>,
    sessions: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl TftpServer {
    /// Bind the well-known socket. The arbiter decides access to the store.
    pub async fn bind(
        config: ServerConfig,
        arbiter: Arc<FileAccessArbiter>,
    ) -> Result<Self, TransportError> {
        let socket = TftpSocket::bind(
            config.bind_addr(),
            config.transfer.timeout,
            config.transfer.recv_tries,
        )
        .await?;
        let sessions = Arc::new(Semaphore::new(config.max_sessions.max(1)));

        Ok(Self {
            config,
            socket,
            arbiter,
            sessions,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr()
    }

    /// Accept requests until `shutdown` fires, then wait for running sessions
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "TFTP server listening on {}, serving files from {}",
            self.socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            self.arbiter.root().display()
        );

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.receive(&mut buf) => received,
            };

            match received {
                Ok((len, from)) => self.dispatch(&buf[..len], from).await,
                Err(TransportError::Timeout) => continue,
                Err(e) => warn!("Receive on request socket failed: {}", e),
            }
        }

        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("Waiting for {} running sessions", self.tracker.len());
        }
        self.tracker.wait().await;
        info!("TFTP server stopped");
    }

    async fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Malformed request from {}: {}", from, e);
                self.refuse(from, ErrorCode::IllegalOperation, "malformed request")
                    .await;
                return;
            }
        };

        let (operation, filename, mode) = match packet {
            Packet::ReadRequest { filename, mode } => (Operation::Read, filename, mode),
            Packet::WriteRequest { filename, mode } => (Operation::Write, filename, mode),
            Packet::DeleteRequest { filename, mode } => (Operation::Delete, filename, mode),
            Packet::Error { code, message } => {
                // Errors are never answered.
                debug!("Ignoring error from {}: {}: {}", from, code, message);
                return;
            }
            other => {
                debug!("Unexpected {} on request socket from {}", other.opcode(), from);
                self.refuse(from, ErrorCode::IllegalOperation, "expected a request")
                    .await;
                return;
            }
        };

        if !is_octet_mode(&mode) {
            self.refuse(
                from,
                ErrorCode::IllegalOperation,
                &format!("unsupported mode '{}'", mode),
            )
            .await;
            return;
        }
        if let Err(reason) = validate_file_name(&filename) {
            warn!("Refusing {} of '{}' from {}: {}", operation, filename, from, reason);
            self.refuse(from, ErrorCode::AccessViolation, reason).await;
            return;
        }

        let permit = match self.sessions.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Session limit reached, refusing {} from {}", operation, from);
                self.refuse(from, ErrorCode::NotDefined, "server busy").await;
                return;
            }
        };

        let transfer = self.config.transfer;
        let socket =
            match TftpSocket::bind_ephemeral(self.config.bind_ip, transfer.timeout, transfer.recv_tries)
                .await
            {
                Ok(socket) => socket,
                Err(e) => {
                    error!("Cannot open transfer socket for {}: {}", from, e);
                    self.refuse(from, ErrorCode::NotDefined, "no transfer port available")
                        .await;
                    return;
                }
            };

        info!("{} request for '{}' from {}", operation, filename, from);
        let arbiter = self.arbiter.clone();
        self.tracker.spawn(run_session(
            socket, from, operation, filename, arbiter, transfer, permit,
        ));
    }

    async fn refuse(&self, to: SocketAddr, code: ErrorCode, message: &str) {
        match Packet::error(code, message).to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send(to, &bytes).await {
                    warn!("Failed to send error to {}: {}", to, e);
                }
            }
            Err(e) => warn!("Failed to encode error packet: {}", e),
        }
    }
}

async fn run_session(
    socket: TftpSocket,
    peer: SocketAddr,
    operation: Operation,
    filename: String,
    arbiter: Arc<FileAccessArbiter>,
    transfer: TransferConfig,
    _permit: OwnedSemaphorePermit,
) {
    let mut session = Session::with_peer(socket, peer, &transfer);
    if let Ok(local) = session.local_addr() {
        debug!("Session for {} bound to {}", peer, local);
    }
    let result = match operation {
        Operation::Read => serve_read(&mut session, &arbiter, &filename).await,
        Operation::Write => serve_write(&mut session, &arbiter, &filename).await,
        Operation::Delete => serve_delete(&mut session, &arbiter, &filename).await,
    };
    debug!("Session for {} ended {:?}", peer, session.state());

    match result {
        Ok(_) if operation == Operation::Delete => info!("Deleted '{}' for {}", filename, peer),
        Ok(stats) => info!(
            "Finished {} of '{}' with {} ({} blocks, {} bytes)",
            operation, filename, peer, stats.blocks, stats.bytes
        ),
        Err(e) => warn!("{} of '{}' with {} failed: {}", operation, filename, peer, e),
    }
}

/// Serve a read request: stream the file to the peer
async fn serve_read(
    session: &mut Session,
    arbiter: &FileAccessArbiter,
    name: &str,
) -> Result<TransferStats, TransferError> {
    let mut handle = match arbiter.open_for_read(name).await {
        Ok(handle) => handle,
        Err(e) => return Err(deny(session, e).await),
    };

    let result = send_file(session, handle.file()).await;
    let _ = arbiter.close_read(handle);
    result
}

/// Serve a write request: ACK 0, then receive the file from the peer
async fn serve_write(
    session: &mut Session,
    arbiter: &FileAccessArbiter,
    name: &str,
) -> Result<TransferStats, TransferError> {
    let mut handle = match arbiter.open_for_write(name).await {
        Ok(handle) => handle,
        Err(e) => return Err(deny(session, e).await),
    };

    let result = match session.send(&Packet::Ack { block: 0 }).await {
        Ok(()) => receive_file(session, handle.file()).await,
        Err(e) => Err(e),
    };

    if result.is_ok() {
        let _ = arbiter.close_write(handle);
    } else if let Err(e) = arbiter.abandon_write(handle).await {
        warn!("Could not remove partial upload '{}': {}", name, e);
    }
    result
}

/// Serve a delete request: confirm with the sentinel ACK or report why not
async fn serve_delete(
    session: &mut Session,
    arbiter: &FileAccessArbiter,
    name: &str,
) -> Result<TransferStats, TransferError> {
    if let Err(e) = arbiter.try_delete(name).await {
        return Err(deny(session, e).await);
    }
    session
        .send(&Packet::Ack {
            block: DELETE_ACK_BLOCK,
        })
        .await?;
    session.finish();
    Ok(TransferStats::default())
}

/// Report an admission failure to the peer
async fn deny(session: &mut Session, e: AccessError) -> TransferError {
    session.send_error(e.wire_code(), &e.to_string()).await;
    e.into()
}
