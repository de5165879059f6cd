//! Length-bounded JSON framing over unix stream sockets.
//!
//! One request/response exchange per connection: the writer sends a single
//! JSON object and shuts down its write half; the reader consumes bytes to
//! EOF under a hard size cap. Oversized frames are rejected before any JSON
//! parsing happens.

use crate::envelope::MAX_FRAME_SIZE;
use crate::error::WireError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Read one frame (bytes up to EOF), enforcing the size bound.
///
/// Returns `WireError::FrameTooLarge` without attempting to parse once the
/// cap is exceeded, and `WireError::Truncated` when the peer closes without
/// sending anything.
pub async fn read_frame<T: DeserializeOwned>(reader: &mut OwnedReadHalf) -> Result<T, WireError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() + n > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                actual: buf.len() + n,
                limit: MAX_FRAME_SIZE,
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    if buf.is_empty() {
        return Err(WireError::Truncated);
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one frame and close the write half so the peer sees EOF.
pub async fn write_frame<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    frame: &T,
) -> Result<(), WireError> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            actual: bytes.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&bytes).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read raw frame bytes without parsing, for callers that need to answer
/// malformed payloads with a structured error response.
pub async fn read_frame_bytes(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() + n > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                actual: buf.len() + n,
                limit: MAX_FRAME_SIZE,
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    if buf.is_empty() {
        return Err(WireError::Truncated);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{RequestFrame, ResponseFrame};
    use serde_json::{json, Map};
    use tokio::net::{UnixListener, UnixStream};

    #[tokio::test]
    async fn frame_roundtrip_over_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("echo.sock");
        let listener = UnixListener::bind(&path)?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut rd, mut wr) = stream.into_split();
            let req: RequestFrame = read_frame(&mut rd).await.unwrap();
            let resp = ResponseFrame::success(
                json!({"echo": req.method}),
                "rid".into(),
                0.0,
            );
            write_frame(&mut wr, &resp).await.unwrap();
        });

        let stream = UnixStream::connect(&path).await?;
        let (mut rd, mut wr) = stream.into_split();
        let req = RequestFrame::new("test-client", "ping", Map::new());
        write_frame(&mut wr, &req).await?;
        let resp: ResponseFrame = read_frame(&mut rd).await?;
        assert!(resp.is_success());

        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_rejected_before_parse() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.sock");
        let listener = UnixListener::bind(&path)?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut rd, _wr) = stream.into_split();
            read_frame_bytes(&mut rd).await
        });

        let mut stream = UnixStream::connect(&path).await?;
        let oversized = vec![b'x'; MAX_FRAME_SIZE + 1];
        tokio::io::AsyncWriteExt::write_all(&mut stream, &oversized).await?;
        tokio::io::AsyncWriteExt::shutdown(&mut stream).await?;

        let result = server.await?;
        assert!(matches!(result, Err(WireError::FrameTooLarge { .. })));
        Ok(())
    }
}
