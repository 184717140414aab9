//! TFTP transfer engine over UDP.
//!
//! This module provides:
//! - The packet codec (RFC 1350 plus a delete request)
//! - A UDP socket with bounded receive retries and ephemeral ports
//! - Stop-and-wait sessions for read, write and delete
//! - The server dispatcher and the client driver

pub mod client;
pub mod constants;
pub mod protocol;
mod receiver;
mod sender;
pub mod server;
pub mod session;
pub mod socket;
pub mod utils;

// Re-export public API
pub use client::{TftpClient, TransferSummary};
pub use constants::{DELETE_ACK_BLOCK, TFTP_PORT};
pub use protocol::{ErrorCode, Opcode, Packet};
pub use server::TftpServer;
pub use session::{Operation, SessionState, TransferStats};
pub use socket::TftpSocket;
