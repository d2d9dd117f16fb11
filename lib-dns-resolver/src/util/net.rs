use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message is slightly different to a DNS UDP message: it has a
/// big-endian u16 prefix giving the total length of the message.  This is
/// redundant (since the header is fixed-size and says how many fields there
/// are, and the fields contain length information), but it means the entire
/// message can be read before parsing begins.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, TcpError> {
    match stream.read_u16().await {
        Ok(size) => {
            let expected = size as usize;
            let mut bytes = BytesMut::with_capacity(expected);
            while bytes.len() < expected {
                match stream.read_buf(&mut bytes).await {
                    Ok(0) if bytes.len() < expected => {
                        let id = if bytes.len() >= 2 {
                            Some(u16::from_be_bytes([bytes[0], bytes[1]]))
                        } else {
                            None
                        };
                        return Err(TcpError::TooShort {
                            id,
                            expected,
                            actual: bytes.len(),
                        });
                    }
                    Err(err) => {
                        let id = if bytes.len() >= 2 {
                            Some(u16::from_be_bytes([bytes[0], bytes[1]]))
                        } else {
                            None
                        };
                        return Err(TcpError::IO { id, error: err });
                    }
                    _ => (),
                }
            }
            Ok(bytes)
        }
        Err(err) => Err(TcpError::IO {
            id: None,
            error: err,
        }),
    }
}

/// An error that can occur when reading a DNS TCP message.
#[derive(Debug, thiserror::Error)]
pub enum TcpError {
    #[error("TCP message shorter than its length prefix ({actual} < {expected})")]
    TooShort {
        id: Option<u16>,
        expected: usize,
        actual: usize,
    },
    #[error("TCP read error")]
    IO {
        id: Option<u16>,
        #[source]
        error: io::Error,
    },
}

impl TcpError {
    pub fn id(&self) -> Option<u16> {
        match self {
            TcpError::TooShort { id, .. } | TcpError::IO { id, .. } => *id,
        }
    }
}

/// Write a serialised message to a UDP channel, truncating it to the
/// payload limit (and setting the TC flag) if it does not fit.  The limit
/// is the peer's advertised EDNS payload size, or 512 for plain DNS.
pub async fn send_udp_bytes_to(
    sock: &UdpSocket,
    target: SocketAddr,
    bytes: &mut [u8],
    payload_limit: usize,
) -> Result<(), io::Error> {
    if bytes.len() < 12 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message too short to be DNS",
        ));
    }

    if bytes.len() > payload_limit {
        bytes[2] |= 0b0000_0010;
        sock.send_to(&bytes[..payload_limit], target).await?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send_to(bytes, target).await?;
    }

    Ok(())
}

/// Write a serialised message to a TCP channel.  This sends a two-byte
/// length prefix (big-endian u16) and sets or clears the TC flag as
/// appropriate.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &mut [u8]) -> Result<(), io::Error> {
    if bytes.len() < 12 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message too short to be DNS",
        ));
    }

    let len = if let Ok(len) = bytes.len().try_into() {
        bytes[2] &= 0b1111_1101;
        len
    } else {
        bytes[2] |= 0b0000_0010;
        u16::MAX
    };

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes[..(len as usize)]).await?;

    Ok(())
}
