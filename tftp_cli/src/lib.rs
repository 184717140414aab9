//! Shared startup code for the `tftp_server` and `tftp_client` binaries.

use std::io::BufRead;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Line an operator types on stdin to stop the server
pub const END_SERVER: &str = "END_SERVER";

/// Initialize logging from `RUST_LOG`, defaulting to `info`
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Cancel `shutdown` when the operator types [`END_SERVER`] or presses Ctrl-C.
///
/// Stdin is read on a plain thread so a pending read never holds up exit.
pub fn watch_for_shutdown(shutdown: CancellationToken) {
    let console = shutdown.clone();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) if is_end_command(&line) => {
                    info!("{} received, shutting down", END_SERVER);
                    console.cancel();
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });
}

fn is_end_command(line: &str) -> bool {
    line.trim() == END_SERVER
}
