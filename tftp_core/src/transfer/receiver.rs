use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use super::constants::MAX_DATA_SIZE;
use super::protocol::{ErrorCode, Packet};
use super::session::{Incoming, Session, TransferStats};
use crate::error::TransferError;

/// Receive DATA blocks into `file`, acknowledging each one.
///
/// The caller has already sent whatever opens the exchange (ACK 0 on the
/// server, the read request on the client). Each ACK is sent exactly once
/// per accepted block; a duplicate block resends the last ACK through the
/// retry path.
pub(crate) async fn receive_file(
    session: &mut Session,
    file: &mut File,
) -> Result<TransferStats, TransferError> {
    let mut stats = TransferStats::default();
    let mut block: u16 = 0;

    loop {
        let expected = block.wrapping_add(1);
        let payload = wait_for_data(session, expected).await?;

        if let Err(e) = file.write_all(&payload).await {
            error!("Failed to write block {}: {}", expected, e);
            session
                .send_error(ErrorCode::NotDefined, "file write error")
                .await;
            return Err(e.into());
        }

        session.send(&Packet::Ack { block: expected }).await?;
        block = expected;
        stats.blocks += 1;
        stats.bytes += payload.len() as u64;

        if payload.len() < MAX_DATA_SIZE {
            if let Err(e) = file.flush().await {
                session
                    .send_error(ErrorCode::NotDefined, "file write error")
                    .await;
                return Err(e.into());
            }
            debug!("Received final block {} ({} bytes total)", block, stats.bytes);
            session.finish();
            return Ok(stats);
        }
    }
}

async fn wait_for_data(session: &mut Session, block: u16) -> Result<Bytes, TransferError> {
    loop {
        match session.recv().await? {
            Incoming::Packet(Packet::Data {
                block: received,
                payload,
            }) if received == block => {
                session.accept();
                return Ok(payload);
            }
            other => session.reject(other).await?,
        }
    }
}
