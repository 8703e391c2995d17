//! Wire-level send/receive helpers shared by every transport the
//! query engine can use. Grounded in the same UDP-size-cap and
//! TCP-length-prefix handling as the rest of this codebase's
//! nameserver-facing I/O.

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Read a DNS message from a TCP stream: a big-endian u16 length
/// prefix followed by that many bytes of message.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, TransportError> {
    let size = stream
        .read_u16()
        .await
        .map_err(|error| TransportError::Io { error })?;
    let expected = size as usize;
    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        match stream.read_buf(&mut bytes).await {
            Ok(0) => {
                return Err(TransportError::ShortRead {
                    expected,
                    actual: bytes.len(),
                })
            }
            Ok(_) => (),
            Err(error) => return Err(TransportError::Io { error }),
        }
    }
    Ok(bytes)
}

/// Send a serialised message over UDP to a connected socket, setting
/// the TC bit and truncating to 512 bytes if it is too big to fit in
/// a single UDP datagram without EDNS.
pub async fn send_udp_bytes(sock: &UdpSocket, bytes: &mut [u8]) -> Result<(), TransportError> {
    if bytes.len() < 12 {
        return Err(TransportError::MessageTooShort { length: bytes.len() });
    }
    if bytes.len() > 512 {
        bytes[2] |= 0b0000_0010;
        sock.send(&bytes[..512])
            .await
            .map_err(|error| TransportError::Io { error })?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send(bytes)
            .await
            .map_err(|error| TransportError::Io { error })?;
    }
    Ok(())
}

/// Like [`send_udp_bytes`] but for an unconnected socket.
pub async fn send_udp_bytes_to(
    sock: &UdpSocket,
    target: SocketAddr,
    bytes: &mut [u8],
) -> Result<(), TransportError> {
    if bytes.len() < 12 {
        return Err(TransportError::MessageTooShort { length: bytes.len() });
    }
    if bytes.len() > 512 {
        bytes[2] |= 0b0000_0010;
        sock.send_to(&bytes[..512], target)
            .await
            .map_err(|error| TransportError::Io { error })?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send_to(bytes, target)
            .await
            .map_err(|error| TransportError::Io { error })?;
    }
    Ok(())
}

/// Send a serialised message over TCP, with its two-byte big-endian
/// length prefix.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &mut [u8]) -> Result<(), TransportError> {
    if bytes.len() < 12 {
        return Err(TransportError::MessageTooShort { length: bytes.len() });
    }

    let len = if let Ok(len) = u16::try_from(bytes.len()) {
        bytes[2] &= 0b1111_1101;
        len
    } else {
        bytes[2] |= 0b0000_0010;
        u16::MAX
    };

    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|error| TransportError::Io { error })?;
    stream
        .write_all(&bytes[..(len as usize)])
        .await
        .map_err(|error| TransportError::Io { error })?;
    Ok(())
}

#[derive(Debug)]
pub enum TransportError {
    MessageTooShort { length: usize },
    ShortRead { expected: usize, actual: usize },
    Io { error: io::Error },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransportError::MessageTooShort { length } => {
                write!(f, "message too short to send ({length} bytes)")
            }
            TransportError::ShortRead { expected, actual } => {
                write!(f, "connection closed after {actual} of {expected} expected bytes")
            }
            TransportError::Io { error } => write!(f, "I/O error: {error}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io { error } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_header(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        if len >= 3 {
            // some junk in the flags byte so tests can observe the TC bit toggled
            bytes[2] = 0b0101_0101;
        }
        bytes
    }

    #[tokio::test]
    async fn send_udp_bytes_rejects_messages_shorter_than_a_header() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(sock.local_addr().unwrap()).await.unwrap();
        let mut bytes = fake_header(11);
        let result = send_udp_bytes(&sock, &mut bytes).await;
        assert!(matches!(result, Err(TransportError::MessageTooShort { length: 11 })));
    }

    #[tokio::test]
    async fn send_udp_bytes_sets_tc_bit_and_truncates_oversized_payloads() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();

        let mut bytes = fake_header(600);
        send_udp_bytes(&client, &mut bytes).await.unwrap();
        assert_eq!(0b0000_0010, bytes[2] & 0b0000_0010, "TC bit should be set on the caller's buffer too");

        let mut buf = [0u8; 1024];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(512, n);
        assert_eq!(0b0000_0010, buf[2] & 0b0000_0010, "received datagram must carry the TC bit");
    }

    #[tokio::test]
    async fn send_udp_bytes_clears_tc_bit_for_messages_that_fit() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();

        let mut bytes = fake_header(64);
        send_udp_bytes(&client, &mut bytes).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(64, n);
        assert_eq!(0, buf[2] & 0b0000_0010);
    }

    #[tokio::test]
    async fn send_tcp_bytes_writes_a_two_byte_length_prefix() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut bytes = fake_header(20);
            send_tcp_bytes(&mut stream, &mut bytes).await.unwrap();
        });

        let (mut server_stream, _) = listener.accept().await.unwrap();
        let mut len_buf = [0u8; 2];
        server_stream.read_exact(&mut len_buf).await.unwrap();
        assert_eq!(20, u16::from_be_bytes(len_buf));

        let mut body = vec![0u8; 20];
        server_stream.read_exact(&mut body).await.unwrap();
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn read_tcp_bytes_reports_a_short_read_on_early_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // Declare 20 bytes of body but only send 5, then close.
            stream.write_all(&20u16.to_be_bytes()).await.unwrap();
            stream.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        });

        let (mut server_stream, _) = listener.accept().await.unwrap();
        let result = read_tcp_bytes(&mut server_stream).await;
        client_task.await.unwrap();

        assert!(matches!(
            result,
            Err(TransportError::ShortRead { expected: 20, actual: 5 })
        ));
    }

    #[tokio::test]
    async fn read_tcp_bytes_round_trips_with_send_tcp_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let payload = fake_header(30);
        let expected = payload.clone();
        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut bytes = payload;
            send_tcp_bytes(&mut stream, &mut bytes).await.unwrap();
        });

        let (mut server_stream, _) = listener.accept().await.unwrap();
        let received = read_tcp_bytes(&mut server_stream).await.unwrap();
        client_task.await.unwrap();

        assert_eq!(expected, received.to_vec());
    }
}
