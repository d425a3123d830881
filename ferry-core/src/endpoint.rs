//! Connection endpoint: one TCP stream, a single reader, a serialized writer.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::protocol::Message;
use crate::wire::{self, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN};

const LEN_SIZE: usize = 4;

/// Shared write handle for one connection. The length prefix and body go out
/// under a single lock acquisition, so frames from concurrent producers never
/// interleave on the wire.
pub struct Endpoint {
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

/// The single-owner read half of a connection. Reads are never concurrent on
/// one endpoint; the owning task loops on `next`.
pub struct FrameReader {
    reader: OwnedReadHalf,
}

impl Endpoint {
    /// Split a stream into the shared write handle and its single reader.
    pub fn pair(stream: TcpStream, cancel: CancellationToken) -> (Arc<Endpoint>, FrameReader) {
        let (reader, writer) = stream.into_split();
        (
            Arc::new(Endpoint {
                writer: Mutex::new(writer),
                cancel,
            }),
            FrameReader { reader },
        )
    }

    /// Encode and emit one frame. A failed write marks the endpoint dead by
    /// tripping its cancellation signal.
    pub async fn send(&self, msg: &Message) -> Result<(), SendError> {
        let frame = wire::encode_frame(msg)?;
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        drop(writer);
        if let Err(err) = result {
            self.cancel.cancel();
            return Err(SendError::Io(err));
        }
        Ok(())
    }

    /// Trip the cancellation signal. Idempotent; the task owning the reader
    /// observes the signal, drops both halves and thereby closes the stream.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl FrameReader {
    /// Next decoded frame. `Ok(None)` signals orderly EOF at a frame
    /// boundary; EOF inside a frame is an error.
    pub async fn next(&mut self) -> Result<Option<Message>, RecvError> {
        let mut len_buf = [0u8; LEN_SIZE];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(RecvError::Io(err)),
        }
        let len = u32::from_le_bytes(len_buf);
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(RecvError::BadLength(len));
        }
        let mut payload = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(RecvError::Io)?;
        Ok(Some(wire::decode_payload(&payload)?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("write failed: {0}")]
    Io(std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("frame length {0} out of range")]
    BadLength(u32),
    #[error("decode error: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("read failed: {0}")]
    Io(std::io::Error),
}
