//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte big-endian length][JSON payload]
//! Maximum frame size: 1MB (sanity limit)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Maximum allowed frame size (1MB)
const MAX_FRAME_SIZE: u32 = 1024 * 1024;

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read a length-prefixed frame from a stream
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;

    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
        return Err(Error::Protocol("Empty frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;

    Message::decode(&payload)
}

/// Encode a message into a complete frame, rejecting anything over the size
/// limit before it reaches a socket
pub(crate) fn encode_frame(msg: &Message) -> Result<Vec<u8>> {
    let payload = msg.encode()?;

    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            Error::Protocol(format!(
                "Message too large: {} bytes (max {})",
                payload.len(),
                MAX_FRAME_SIZE
            ))
        })?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write a length-prefixed frame to a stream
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = encode_frame(msg)?;
    write_encoded(writer, &frame).await
}

async fn write_encoded<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain an outbound queue onto a stream until the queue closes or `cancel`
/// fires. Messages already queued when `cancel` fires are still written.
///
/// A message that cannot be framed is dropped; only write errors end the loop.
pub(crate) async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> Result<()> {
    let result = loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break Ok(()),
            },
            _ = cancel.cancelled() => break Ok(()),
        };

        let frame = match encode_frame(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "Dropping unsendable message");
                continue;
            }
        };
        if let Err(e) = write_encoded(&mut writer, &frame).await {
            break Err(e);
        }
    };

    let _ = writer.shutdown().await;
    result
}
