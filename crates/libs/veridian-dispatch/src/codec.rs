//! Length-prefixed msgpack framing over an async byte stream.
//!
//! Every frame is a 4-byte big-endian payload length followed by the
//! msgpack payload.

use std::io::{self, ErrorKind};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload; anything larger is treated as
/// a protocol violation rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        rmp_serde::to_vec_named(frame).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "frame exceeds maximum length"));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    rmp_serde::from_slice(&payload).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::WorkerFrame;

    #[tokio::test]
    async fn frames_roundtrip_over_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &WorkerFrame::Subscribe).await.expect("write");
        let decoded: WorkerFrame = read_frame(&mut server).await.expect("read");
        assert_eq!(decoded, WorkerFrame::Subscribe);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &huge).await.expect("write prefix");
        let err = read_frame::<_, WorkerFrame>(&mut server).await.expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
