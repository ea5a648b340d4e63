//! Transport plumbing: framed reads/writes over any reliable stream, plus
//! the socket flags every long-lived connection carries.
//!
//! The framed helpers are generic over `AsyncRead`/`AsyncWrite` so a plain
//! TCP (or in-memory) stream satisfies the same contract as the TLS stream —
//! which is what the tests use.

pub mod tls;

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{self, Header, HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Peer closed or the socket errored mid-message.
    ConnectionLost,
    /// Header carried an unknown message type.
    Malformed,
    /// Payload length exceeded the allowed maximum for this context.
    Oversize,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ConnectionLost => write!(f, "connection lost"),
            FrameError::Malformed => write!(f, "malformed frame"),
            FrameError::Oversize => write!(f, "oversize payload"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Write a complete pre-framed message. Loops until every byte is out.
pub async fn send_all<W: AsyncWrite + Unpin>(stream: &mut W, msg: &[u8]) -> Result<(), FrameError> {
    stream
        .write_all(msg)
        .await
        .map_err(|_| FrameError::ConnectionLost)?;
    stream.flush().await.map_err(|_| FrameError::ConnectionLost)
}

/// Read one framed message: header, then exactly `payload_len` bytes.
/// EOF or a short read anywhere surfaces as `ConnectionLost`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_payload: usize,
) -> Result<(Header, Vec<u8>), FrameError> {
    let mut hdr = [0u8; HEADER_SIZE];
    stream
        .read_exact(&mut hdr)
        .await
        .map_err(|_| FrameError::ConnectionLost)?;

    let header = protocol::deserialize_header(&hdr).ok_or(FrameError::Malformed)?;
    if header.payload_len as usize > max_payload {
        return Err(FrameError::Oversize);
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|_| FrameError::ConnectionLost)?;
    }
    Ok((header, payload))
}

/// Flags carried by every long-lived TCP socket: no Nagle, 1 MiB buffers.
pub fn configure_stream(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_nodelay(true);
    let _ = sock.set_send_buffer_size(1024 * 1024);
    let _ = sock.set_recv_buffer_size(1024 * 1024);
}

/// Bind a UDP socket with buffers big enough to ride out voice bursts.
pub fn bind_udp(addr: std::net::SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let sock = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    let _ = sock.set_send_buffer_size(1024 * 1024);
    let _ = sock.set_recv_buffer_size(1024 * 1024);
    sock.bind(&addr.into())?;
    Ok(sock.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{make_text_chat, make_user_left, MsgType, MAX_PAYLOAD};

    #[tokio::test]
    async fn test_framed_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        send_all(&mut a, &make_text_chat("hello")).await.unwrap();
        send_all(&mut a, &make_user_left(3)).await.unwrap();

        let (h1, p1) = read_frame(&mut b, MAX_PAYLOAD).await.unwrap();
        assert_eq!(h1.msg_type, MsgType::TextChat);
        assert_eq!(p1, b"hello\0");

        let (h2, p2) = read_frame(&mut b, MAX_PAYLOAD).await.unwrap();
        assert_eq!(h2.msg_type, MsgType::UserLeft);
        assert_eq!(p2, 3u32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_eof_is_connection_lost() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert_eq!(
            read_frame(&mut b, MAX_PAYLOAD).await.unwrap_err(),
            FrameError::ConnectionLost
        );
    }

    #[tokio::test]
    async fn test_truncated_payload_is_connection_lost() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Header promises 10 bytes, only 3 arrive before the close.
        let mut msg = crate::protocol::serialize_header(Header {
            msg_type: MsgType::TextChat,
            payload_len: 10,
        })
        .to_vec();
        msg.extend_from_slice(&[1, 2, 3]);
        send_all(&mut a, &msg).await.unwrap();
        drop(a);
        assert_eq!(
            read_frame(&mut b, MAX_PAYLOAD).await.unwrap_err(),
            FrameError::ConnectionLost
        );
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let msg = crate::protocol::serialize_header(Header {
            msg_type: MsgType::ScreenFrame,
            payload_len: (MAX_PAYLOAD + 1) as u32,
        });
        send_all(&mut a, &msg).await.unwrap();
        assert_eq!(
            read_frame(&mut b, MAX_PAYLOAD).await.unwrap_err(),
            FrameError::Oversize
        );
    }

    #[tokio::test]
    async fn test_unknown_type_is_malformed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        send_all(&mut a, &[0x77, 0, 0, 0, 0]).await.unwrap();
        assert_eq!(
            read_frame(&mut b, MAX_PAYLOAD).await.unwrap_err(),
            FrameError::Malformed
        );
    }
}
