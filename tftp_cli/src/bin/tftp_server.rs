//! TFTP server executable
//!
//! Serves the store root (default `~/tftpServer`) on UDP port 69.
//! Type `END_SERVER` or press Ctrl-C to stop; running transfers finish first.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp_cli::{init_logging, watch_for_shutdown};
use tftp_core::{FileAccessArbiter, ServerConfig, TftpServer};
use tokio_util::sync::CancellationToken;

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server with delete support",
    example = "Serve ~/tftpServer on all interfaces:\n  {command_name} 0.0.0.0",
    example = "Unprivileged port and custom root:\n  {command_name} 127.0.0.1 --port 6969 --root ./store"
)]
struct Args {
    #[argh(positional, description = "IPv4 address to listen on")]
    bind_ip: Ipv4Addr,

    #[argh(option, short = 'p', description = "request port (default 69)")]
    port: Option<u16>,

    #[argh(option, short = 'r', description = "directory holding the served files")]
    root: Option<PathBuf>,

    #[argh(option, description = "maximum concurrent transfers")]
    max_sessions: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args: Args = argh::from_env();
    let mut config = ServerConfig::load();
    config.bind_ip = IpAddr::V4(args.bind_ip);
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(root) = args.root {
        config.root_dir = root;
    }
    if let Some(max_sessions) = args.max_sessions {
        config.max_sessions = max_sessions;
    }

    std::fs::create_dir_all(&config.root_dir).with_context(|| {
        format!(
            "Failed to create store root {}",
            config.root_dir.display()
        )
    })?;

    let bind_addr = config.bind_addr();
    let arbiter = Arc::new(FileAccessArbiter::new(config.root_dir.clone()));
    let server = TftpServer::bind(config, arbiter)
        .await
        .with_context(|| format!("Failed to bind TFTP server socket on {}", bind_addr))?;

    let shutdown = CancellationToken::new();
    watch_for_shutdown(shutdown.clone());
    server.run(shutdown).await;
    Ok(())
}
