use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, error};

use super::constants::MAX_DATA_SIZE;
use super::protocol::{ErrorCode, Packet};
use super::session::{Incoming, Session, TransferStats};
use crate::error::TransferError;

/// Stream a file as DATA blocks, one block in flight at a time.
///
/// A block shorter than 512 bytes ends the transfer, so a file whose size
/// is a multiple of 512 ends with an empty block.
pub(crate) async fn send_file(
    session: &mut Session,
    file: &mut File,
) -> Result<TransferStats, TransferError> {
    let mut stats = TransferStats::default();
    let mut block: u16 = 0;

    loop {
        // 1. Read the next chunk
        let chunk = match read_chunk(file).await {
            Ok(chunk) => chunk,
            Err(e) => {
                error!("Failed to read block {}: {}", block.wrapping_add(1), e);
                session
                    .send_error(ErrorCode::NotDefined, "file read error")
                    .await;
                return Err(e.into());
            }
        };
        let last = chunk.len() < MAX_DATA_SIZE;
        let len = chunk.len() as u64;

        // 2. Send it and wait for the matching ACK
        block = block.wrapping_add(1);
        session
            .send(&Packet::Data {
                block,
                payload: chunk,
            })
            .await?;
        wait_for_ack(session, block).await?;

        stats.blocks += 1;
        stats.bytes += len;
        if last {
            debug!("Sent final block {} ({} bytes total)", block, stats.bytes);
            session.finish();
            return Ok(stats);
        }
    }
}

/// Wait until the peer acknowledges `block`, retrying the outstanding packet
/// on timeouts and stray packets
pub(crate) async fn wait_for_ack(session: &mut Session, block: u16) -> Result<(), TransferError> {
    loop {
        match session.recv().await? {
            Incoming::Packet(Packet::Ack { block: acked }) if acked == block => {
                session.accept();
                return Ok(());
            }
            other => session.reject(other).await?,
        }
    }
}

/// Read up to one block, tolerating short reads from the file
async fn read_chunk(file: &mut File) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(MAX_DATA_SIZE);
    let mut filled = 0;
    while filled < MAX_DATA_SIZE {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}
