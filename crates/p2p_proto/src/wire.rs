//! Length-prefixed framing used on every TCP stream.
//!
//! Wire format: [4-byte LE length][payload bytes]
//! Control-channel payloads are single JSON objects; direct peer payloads are
//! opaque bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetError::Protocol(format!(
            "frame too large: {} bytes",
            data.len()
        )));
    }
    let len = (data.len() as u32).to_le_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| NetError::TransportLost(format!("write length: {e}")))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| NetError::TransportLost(format!("write payload: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| NetError::TransportLost(format!("flush: {e}")))?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetError::TransportLost(format!("read length: {e}"))),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetError::Protocol(format!("frame too large: {len} bytes")));
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| NetError::TransportLost(format!("read payload: {e}")))?;
    Ok(Some(data))
}

pub fn encode_json<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

pub async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    msg: &T,
) -> Result<()> {
    let data = encode_json(msg)?;
    write_frame(writer, &data).await
}

pub async fn read_json<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>> {
    match read_frame(reader).await? {
        Some(data) => decode_json(&data).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Command, Response};

    #[tokio::test]
    async fn back_to_back_frames_stay_separate() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            write_frame(&mut a, b"first").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
            write_frame(&mut a, &[7u8; 300]).await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), vec![7u8; 300]);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_stream_reads_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        a.write_all(&len).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_payload_is_transport_loss() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, NetError::TransportLost(_)));
    }

    #[tokio::test]
    async fn json_over_frames() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_json(&mut a, &Command::Heartbeat { peer_id: "a1".into() })
            .await
            .unwrap();
        write_json(&mut a, &Response::success()).await.unwrap();

        let cmd: Command = read_json(&mut b).await.unwrap().unwrap();
        assert_eq!(cmd, Command::Heartbeat { peer_id: "a1".into() });
        let resp: Response = read_json(&mut b).await.unwrap().unwrap();
        assert!(resp.is_success());
    }
}
