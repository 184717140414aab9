//! TFTP client executable
//!
//! Runs one read, write or delete against a server. Local files live in
//! `~/tftpClient` unless `--root` says otherwise.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp_cli::init_logging;
use tftp_core::{ClientConfig, Operation, TftpClient};
use tracing::info;

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP client with delete and compression support",
    example = "Upload ~/tftpClient/notes.txt:\n  {command_name} write notes.txt 192.168.1.10",
    example = "Download without compression:\n  {command_name} read image.bin 192.168.1.10 --raw"
)]
struct Args {
    #[argh(positional, description = "operation: read, write or delete")]
    operation: Operation,

    #[argh(positional, description = "file name")]
    file: String,

    #[argh(positional, description = "server IPv4 address")]
    server_ip: Ipv4Addr,

    #[argh(option, short = 'p', description = "server request port (default 69)")]
    port: Option<u16>,

    #[argh(option, short = 'r', description = "local directory for transferred files")]
    root: Option<PathBuf>,

    #[argh(switch, description = "transfer files without compression")]
    raw: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args: Args = argh::from_env();
    let mut config = ClientConfig::load();
    let port = args.port.unwrap_or(config.server.port());
    config.server = SocketAddr::new(IpAddr::V4(args.server_ip), port);
    if let Some(root) = args.root {
        config.root_dir = root;
    }
    if args.raw {
        config.compress = false;
    }

    std::fs::create_dir_all(&config.root_dir).with_context(|| {
        format!(
            "Failed to create local directory {}",
            config.root_dir.display()
        )
    })?;

    let client = TftpClient::new(config);
    let summary = client
        .run(args.operation, &args.file)
        .await
        .with_context(|| format!("Failed to {} '{}'", args.operation, args.file))?;

    info!(
        "Done: {} '{}' ({} blocks, {} bytes)",
        summary.operation, summary.file_name, summary.blocks, summary.bytes
    );
    Ok(())
}
