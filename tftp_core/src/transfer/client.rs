use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use super::constants::{COMPRESSED_SUFFIX, DELETE_ACK_BLOCK};
use super::protocol::{ErrorCode, Packet};
use super::receiver::receive_file;
use super::sender::{send_file, wait_for_ack};
use super::session::{Operation, Session, TransferStats};
use super::socket::TftpSocket;
use super::utils::validate_file_name;
use crate::access::FileAccessArbiter;
use crate::compression::{Compressor, HuffmanCompressor};
use crate::config::ClientConfig;
use crate::error::{AccessError, CompressionError, TransferError};

/// Outcome of one client operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub operation: Operation,
    pub file_name: String,
    pub blocks: u64,
    pub bytes: u64,
}

impl TransferSummary {
    fn new(operation: Operation, file_name: &str, stats: TransferStats) -> Self {
        Self {
            operation,
            file_name: file_name.to_string(),
            blocks: stats.blocks,
            bytes: stats.bytes,
        }
    }
}

/// Drives one read, write or delete against a server.
///
/// Local files live under the configured root and go through the client's
/// own [`FileAccessArbiter`].
pub struct TftpClient {
    config: ClientConfig,
    arbiter: FileAccessArbiter,
    compressor: Arc<dyn Compressor>,
}

impl TftpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_compressor(config, Arc::new(HuffmanCompressor))
    }

    pub fn with_compressor(config: ClientConfig, compressor: Arc<dyn Compressor>) -> Self {
        let arbiter = FileAccessArbiter::new(config.root_dir.clone());
        Self {
            config,
            arbiter,
            compressor,
        }
    }

    pub async fn run(
        &self,
        operation: Operation,
        file_name: &str,
    ) -> Result<TransferSummary, TransferError> {
        match operation {
            Operation::Read => self.read(file_name).await,
            Operation::Write => self.write(file_name).await,
            Operation::Delete => self.delete(file_name).await,
        }
    }

    /// Fetch `file_name` from the server into the local root
    pub async fn read(&self, file_name: &str) -> Result<TransferSummary, TransferError> {
        // 1. Refuse to clobber a local file
        check_local_name(file_name)?;
        if self.arbiter.is_available(file_name).await {
            return Err(AccessError::AlreadyExists(file_name.to_string()).into());
        }
        let target = if self.config.compress {
            format!("{}{}", file_name, COMPRESSED_SUFFIX)
        } else {
            file_name.to_string()
        };
        let mut handle = self.arbiter.open_for_write(&target).await?;

        // 2. Request the file and receive it
        info!("Reading '{}' from {}", file_name, self.config.server);
        let result = match self.open_session().await {
            Ok(mut session) => {
                match session.send_request(&Packet::read_request(file_name)).await {
                    Ok(()) => receive_file(&mut session, handle.file()).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        let stats = match result {
            Ok(stats) => {
                let _ = self.arbiter.close_write(handle);
                stats
            }
            Err(e) => {
                if let Err(cleanup) = self.arbiter.abandon_write(handle).await {
                    warn!("Could not remove partial '{}': {}", target, cleanup);
                }
                return Err(e);
            }
        };

        // 3. Restore the original bytes
        if self.config.compress {
            let packed = self.arbiter.path_of(&target);
            let unpacked = self.run_compressor(packed, false).await;
            self.discard(&target).await;
            if let Err(e) = unpacked {
                let _ = tokio::fs::remove_file(self.arbiter.path_of(file_name)).await;
                return Err(e);
            }
        }

        info!(
            "Read '{}' ({} blocks, {} bytes on the wire)",
            file_name, stats.blocks, stats.bytes
        );
        Ok(TransferSummary::new(Operation::Read, file_name, stats))
    }

    /// Send a local file to the server under the same name
    pub async fn write(&self, file_name: &str) -> Result<TransferSummary, TransferError> {
        // 1. Prepare the bytes to send
        check_local_name(file_name)?;
        if !self.arbiter.is_available(file_name).await {
            return Err(AccessError::NotFound(file_name.to_string()).into());
        }
        let source = if self.config.compress {
            self.run_compressor(self.arbiter.path_of(file_name), true)
                .await?;
            format!("{}{}", file_name, COMPRESSED_SUFFIX)
        } else {
            file_name.to_string()
        };

        let mut handle = match self.arbiter.open_for_read(&source).await {
            Ok(handle) => handle,
            Err(e) => {
                if self.config.compress {
                    self.discard(&source).await;
                }
                return Err(e.into());
            }
        };

        // 2. Request the write, wait for ACK 0, then stream the file
        info!("Writing '{}' to {}", file_name, self.config.server);
        let result = match self.open_session().await {
            Ok(mut session) => {
                match session.send_request(&Packet::write_request(file_name)).await {
                    Ok(()) => match wait_for_ack(&mut session, 0).await {
                        Ok(()) => send_file(&mut session, handle.file()).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        let _ = self.arbiter.close_read(handle);
        if self.config.compress {
            self.discard(&source).await;
        }

        let stats = result?;
        info!(
            "Wrote '{}' ({} blocks, {} bytes on the wire)",
            file_name, stats.blocks, stats.bytes
        );
        Ok(TransferSummary::new(Operation::Write, file_name, stats))
    }

    /// Ask the server to delete `file_name`
    pub async fn delete(&self, file_name: &str) -> Result<TransferSummary, TransferError> {
        info!("Deleting '{}' on {}", file_name, self.config.server);
        let mut session = self.open_session().await?;
        session
            .send_request(&Packet::delete_request(file_name))
            .await?;

        match wait_for_ack(&mut session, DELETE_ACK_BLOCK).await {
            Ok(()) => {
                session.finish();
                info!("Deleted '{}'", file_name);
                Ok(TransferSummary::new(
                    Operation::Delete,
                    file_name,
                    TransferStats::default(),
                ))
            }
            Err(TransferError::RetriesExhausted(attempts)) => {
                session
                    .send_error(ErrorCode::NotDefined, "no ack received")
                    .await;
                Err(TransferError::RetriesExhausted(attempts))
            }
            Err(e) => {
                session.abort();
                Err(e)
            }
        }
    }

    async fn open_session(&self) -> Result<Session, TransferError> {
        let transfer = &self.config.transfer;
        let socket =
            TftpSocket::bind_ephemeral(self.config.bind_ip, transfer.timeout, transfer.recv_tries)
                .await?;
        Ok(Session::with_server(socket, self.config.server, transfer))
    }

    async fn run_compressor(&self, path: PathBuf, compress: bool) -> Result<PathBuf, TransferError> {
        let compressor = self.compressor.clone();
        let output = tokio::task::spawn_blocking(move || {
            if compress {
                compressor.compress(&path)
            } else {
                compressor.decompress(&path)
            }
        })
        .await
        .map_err(|e| CompressionError::Io(std::io::Error::other(e)))??;
        Ok(output)
    }

    /// Remove a temporary local file
    async fn discard(&self, name: &str) {
        if let Err(e) = self.arbiter.try_delete(name).await {
            warn!("Could not remove '{}': {}", name, e);
        }
    }
}

/// Local names must stay inside the client root
fn check_local_name(name: &str) -> Result<(), AccessError> {
    validate_file_name(name).map_err(|reason| AccessError::Violation {
        name: name.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::UdpSocket;

    fn config_for(root: &std::path::Path, server: SocketAddr, compress: bool) -> ClientConfig {
        let mut config = ClientConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server,
            root_dir: root.to_path_buf(),
            compress,
            ..ClientConfig::default()
        };
        config.transfer.timeout = Duration::from_millis(100);
        config.transfer.recv_tries = 1;
        config
    }

    #[test]
    fn test_operation_parsing() {
        assert_eq!("READ".parse::<Operation>().unwrap(), Operation::Read);
        assert_eq!("write".parse::<Operation>().unwrap(), Operation::Write);
        assert_eq!("Delete".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("list".parse::<Operation>().is_err());
    }

    #[tokio::test]
    async fn test_read_refuses_existing_local_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("have.txt"), b"mine").unwrap();
        let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let client = TftpClient::new(config_for(dir.path(), server, true));

        let result = client.read("have.txt").await;
        assert!(matches!(
            result,
            Err(TransferError::Access(AccessError::AlreadyExists(_)))
        ));
        assert_eq!(std::fs::read(dir.path().join("have.txt")).unwrap(), b"mine");
    }

    #[tokio::test]
    async fn test_write_missing_local_file() {
        let dir = tempdir().unwrap();
        let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let client = TftpClient::new(config_for(dir.path(), server, true));

        let result = client.write("absent.txt").await;
        assert!(matches!(
            result,
            Err(TransferError::Access(AccessError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_names_outside_root_are_refused_before_touching_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(dir.path().join("escape.txt"), b"outside").unwrap();
        let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let client = TftpClient::new(config_for(&root, server, true));

        let result = client.write("../escape.txt").await;
        assert!(matches!(
            result,
            Err(TransferError::Access(AccessError::Violation { .. }))
        ));
        assert!(!dir.path().join("escape.txt.cmp").exists());

        let result = client.read("../fetched.txt").await;
        assert!(matches!(
            result,
            Err(TransferError::Access(AccessError::Violation { .. }))
        ));
        assert!(!dir.path().join("fetched.txt.cmp").exists());
    }

    #[tokio::test]
    async fn test_read_short_final_block_sends_one_ack() {
        let dir = tempdir().unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = TftpClient::new(config_for(dir.path(), server_addr, false));

        let script = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(
                Packet::decode(&buf[..len]).unwrap(),
                Packet::read_request("small.bin")
            );

            // Reply from a separate port, as a real server would.
            let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let data = Packet::Data {
                block: 1,
                payload: bytes::Bytes::from(vec![0xAB; 300]),
            };
            transfer
                .send_to(&data.to_bytes().unwrap(), from)
                .await
                .unwrap();

            let mut acks = Vec::new();
            loop {
                match tokio::time::timeout(
                    Duration::from_millis(400),
                    transfer.recv_from(&mut buf),
                )
                .await
                {
                    Ok(Ok((len, _))) => acks.push(Packet::decode(&buf[..len]).unwrap()),
                    _ => break,
                }
            }
            acks
        });

        let summary = client.read("small.bin").await.unwrap();
        assert_eq!(summary.blocks, 1);
        assert_eq!(summary.bytes, 300);
        assert_eq!(
            std::fs::read(dir.path().join("small.bin")).unwrap(),
            vec![0xAB; 300]
        );

        let acks = script.await.unwrap();
        assert_eq!(acks, vec![Packet::Ack { block: 1 }]);
    }

    #[tokio::test]
    async fn test_failed_read_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = TftpClient::new(config_for(dir.path(), server_addr, true));

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let reply = Packet::error(ErrorCode::FileNotFound, "missing");
            server
                .send_to(&reply.to_bytes().unwrap(), from)
                .await
                .unwrap();
        });

        let result = client.read("ghost.txt").await;
        match result {
            Err(TransferError::Peer { code, message }) => {
                assert_eq!(code, ErrorCode::FileNotFound);
                assert_eq!(message, "missing");
            }
            other => panic!("Expected peer error, got {:?}", other),
        }
        assert!(!dir.path().join("ghost.txt").exists());
        assert!(!dir.path().join("ghost.txt.cmp").exists());
    }

    #[tokio::test]
    async fn test_delete_without_reply_sends_error_notice() {
        let dir = tempdir().unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = TftpClient::new(config_for(dir.path(), server_addr, false));

        let script = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let mut seen = Vec::new();
            while let Ok(Ok((len, _))) =
                tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf)).await
            {
                let packet = Packet::decode(&buf[..len]).unwrap();
                let done = matches!(packet, Packet::Error { .. });
                seen.push(packet);
                if done {
                    break;
                }
            }
            seen
        });

        let result = client.delete("stubborn.txt").await;
        assert!(matches!(result, Err(TransferError::RetriesExhausted(3))));

        let seen = script.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Packet::delete_request("stubborn.txt"));
        assert_eq!(
            seen[1],
            Packet::error(ErrorCode::NotDefined, "no ack received")
        );
    }
}
