pub mod access;
pub mod compression;
pub mod config;
pub mod error;
pub mod transfer;

pub use access::{FileAccessArbiter, FileAccessRecord};
pub use compression::{Compressor, HuffmanCompressor};
pub use config::{ClientConfig, ServerConfig, TransferConfig};
pub use error::{AccessError, CodecError, CompressionError, TransferError, TransportError};
pub use transfer::{
    ErrorCode, Operation, Packet, TftpClient, TftpServer, TransferSummary,
};
