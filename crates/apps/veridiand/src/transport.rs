//! Node-to-node TCP transport for the secure message queue.
//!
//! Frames are a 4-byte big-endian length prefix followed by a msgpack
//! [`MqWireFrame`]. Outbound sends are fire-and-forget: one connection,
//! one frame, close. The inbound listener decodes frames and feeds the
//! engine directly.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use veridian_ipc::{InboundMessage, Transport, TransportError};
use veridian_mq::MqEngine;

/// One queue message on the wire between nodes. `sender_id` and
/// `message_id` form the receiver's deduplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqWireFrame {
    pub sender_id: String,
    pub message_id: String,
    pub payload: ByteBuf,
}

pub async fn write_mq_frame<W>(writer: &mut W, frame: &MqWireFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = rmp_serde::to_vec_named(frame)
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

pub async fn read_mq_frame<R>(reader: &mut R, max_len: usize) -> io::Result<MqWireFrame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(ErrorKind::InvalidData, "frame exceeds maximum message size"));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    rmp_serde::from_slice(&payload).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

pub struct TcpTransport {
    node_id: String,
}

impl TcpTransport {
    pub fn new(node_id: String) -> Self {
        Self { node_id }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, receiver_address: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut stream = TcpStream::connect(receiver_address)
            .await
            .map_err(|err| send_err(receiver_address, err))?;
        let frame = MqWireFrame {
            sender_id: self.node_id.clone(),
            message_id: random_wire_id(),
            payload: ByteBuf::from(bytes),
        };
        write_mq_frame(&mut stream, &frame)
            .await
            .map_err(|err| send_err(receiver_address, err))?;
        stream.shutdown().await.map_err(|err| send_err(receiver_address, err))
    }
}

/// Accept loop for inbound queue traffic.
pub async fn run_mq_listener(listener: TcpListener, engine: Arc<MqEngine>, max_message_size: usize) {
    log::info!("message queue listening on {:?}", listener.local_addr().ok());
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let engine = Arc::clone(&engine);
                tokio::spawn(handle_peer(stream, engine, max_message_size, peer));
            }
            Err(err) => {
                log::warn!("queue accept failed: {err}");
            }
        }
    }
}

async fn handle_peer(
    mut stream: TcpStream,
    engine: Arc<MqEngine>,
    max_message_size: usize,
    peer: SocketAddr,
) {
    loop {
        match read_mq_frame(&mut stream, max_message_size).await {
            Ok(frame) => {
                engine
                    .receive(InboundMessage {
                        sender_id: frame.sender_id,
                        message_id: frame.message_id,
                        payload: frame.payload.into_vec(),
                    })
                    .await;
            }
            Err(err) => {
                if err.kind() != ErrorKind::UnexpectedEof {
                    log::warn!("queue connection from {peer} failed: {err}");
                }
                break;
            }
        }
    }
}

fn send_err(address: &str, err: impl std::fmt::Display) -> TransportError {
    TransportError::Send { address: address.to_string(), reason: err.to_string() }
}

/// Transport-level message id, unique per send.
fn random_wire_id() -> String {
    let mut bytes = [0u8; 10];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_roundtrip_over_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = MqWireFrame {
            sender_id: "idp-1".to_string(),
            message_id: "m-1".to_string(),
            payload: ByteBuf::from(vec![1, 2, 3]),
        };
        write_mq_frame(&mut client, &frame).await.expect("write");
        let decoded = read_mq_frame(&mut server, 1024).await.expect("read");
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn frames_over_the_configured_size_are_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = MqWireFrame {
            sender_id: "idp-1".to_string(),
            message_id: "m-1".to_string(),
            payload: ByteBuf::from(vec![0u8; 512]),
        };
        write_mq_frame(&mut client, &frame).await.expect("write");
        let err = read_mq_frame(&mut server, 64).await.expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn tcp_send_delivers_one_tagged_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            read_mq_frame(&mut stream, 1024).await.expect("frame")
        });

        let transport = TcpTransport::new("rp-2".to_string());
        transport.send(&addr.to_string(), vec![9, 9, 9]).await.expect("send");

        let frame = accept.await.expect("join");
        assert_eq!(frame.sender_id, "rp-2");
        assert_eq!(frame.payload.as_ref(), &[9, 9, 9]);
        assert!(!frame.message_id.is_empty());
    }
}
