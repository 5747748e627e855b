//! Length-prefixed framing over TCP.
//!
//! A frame is a 4-byte big-endian unsigned length `N` followed by exactly `N`
//! bytes of UTF-8 JSON. Framing failures never touch node state: the caller
//! drops the connection and moves on.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::message::Message;
use crate::types::PeerAddr;

/// Default cap on a single frame.
pub const DEFAULT_MAX_FRAME: usize = 128 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the {1} byte cap")]
    FrameTooLarge(usize, usize),
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("undecodable payload: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one raw frame. `Err(Truncated)` covers both a connection closed
/// before the length prefix completes and one closed mid-payload.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(eof_as_truncated)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(WireError::FrameTooLarge(len, max_frame));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(eof_as_truncated)?;
    Ok(payload)
}

fn eof_as_truncated(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Truncated
    } else {
        WireError::Io(e)
    }
}

/// Read one message frame and decode it.
pub async fn read_message<R>(reader: &mut R, max_frame: usize) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader, max_frame).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Encode one message and write it with its length prefix.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(msg)?;
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// One-shot request: connect, send one message, read one response, close.
/// The whole exchange is bounded by `timeout`.
pub async fn request(addr: &PeerAddr, msg: &Message, timeout: Duration) -> Result<Message, WireError> {
    let fut = async {
        let mut stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        write_message(&mut stream, msg).await?;
        let response = read_message(&mut stream, DEFAULT_MAX_FRAME).await?;
        Ok::<Message, WireError>(response)
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let msg = Message::Ping { nonce: 7 };
        let mut writer = std::io::Cursor::new(Vec::new());
        write_message(&mut writer, &msg).await.unwrap();
        let buf = writer.into_inner();
        let prefix = (buf.len() as u32 - 4).to_be_bytes();
        assert_eq!(buf[..4], prefix[..]);

        let mut cursor = std::io::Cursor::new(buf);
        let back = read_message(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap();
        assert!(matches!(back, Message::Ping { nonce: 7 }));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(1024u32).to_be_bytes());
        buf.extend_from_slice(&[b'x'; 1024]);
        let mut cursor = std::io::Cursor::new(buf);
        match read_frame(&mut cursor, 512).await {
            Err(WireError::FrameTooLarge(1024, 512)) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_payload_is_detected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(100u32).to_be_bytes());
        buf.extend_from_slice(b"short");
        let mut cursor = std::io::Cursor::new(buf);
        match read_frame(&mut cursor, DEFAULT_MAX_FRAME).await {
            Err(WireError::Truncated) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_payload_is_a_codec_error() {
        let payload = b"not json at all";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_message(&mut cursor, DEFAULT_MAX_FRAME).await,
            Err(WireError::Codec(_))
        ));
    }
}
