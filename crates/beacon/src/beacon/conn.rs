use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time,
};

use crate::beacon::protocol::{
    handshake::ServerBoundHandshake, Packet, ProtocolError, MAX_FRAME_LENGTH, MAX_VAR_INT_BYTES,
};

/// Read buffer size. A handshake plus the follow-up status/login packet fits
/// comfortably; larger traffic only flows in the unbuffered pipe phase.
const READ_BUFFER_BYTES: usize = 4096;

/// A full frame as read off the wire: the raw bytes (length prefix included)
/// and the decoded packet.
#[derive(Debug, Clone)]
pub struct Frame {
    pub raw: Vec<u8>,
    pub packet: Packet,
}

async fn read_frame_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let mut raw = Vec::with_capacity(64);

    let mut num_read = 0u32;
    let mut len: i32 = 0;
    loop {
        let byte = r.read_u8().await?;
        raw.push(byte);
        len |= i32::from(byte & 0x7f).overflowing_shl(7 * num_read).0;
        num_read += 1;
        if byte & 0x80 == 0 {
            break;
        }
        if num_read as usize == MAX_VAR_INT_BYTES {
            return Err(ProtocolError::VarIntTooBig);
        }
    }

    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len < 0 || len as usize > MAX_FRAME_LENGTH {
        return Err(ProtocolError::FrameLength(i64::from(len)));
    }

    let body_start = raw.len();
    raw.resize(body_start + len as usize, 0);
    r.read_exact(&mut raw[body_start..]).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::TruncatedFrame
        } else {
            ProtocolError::Io(err)
        }
    })?;

    let packet = Packet::from_frame_body(&raw[body_start..])?;
    Ok(Frame { raw, packet })
}

/// The client side of a session: buffered packet IO plus the set-once slots
/// for the captured handshake.
///
/// The raw handshake frame is kept alongside the parsed struct because the
/// pipe phase replays the original bytes to the upstream; re-encoding could
/// produce a byte-different frame and trip upstream version sniffing.
#[derive(Debug)]
pub struct HandshakeConnection {
    stream: BufReader<TcpStream>,
    peer: SocketAddr,
    closed: bool,
    handshake: Option<ServerBoundHandshake>,
    handshake_frame: Option<Vec<u8>>,
}

impl HandshakeConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: BufReader::with_capacity(READ_BUFFER_BYTES, stream),
            peer,
            closed: false,
            handshake: None,
            handshake_frame: None,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        read_frame_from(&mut self.stream).await
    }

    pub async fn read_packet(&mut self) -> Result<Packet, ProtocolError> {
        Ok(self.read_frame().await?.packet)
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), ProtocolError> {
        let frame = packet.to_frame()?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Stores the parsed handshake and its raw frame. Set once by the
    /// gateway; read by the server worker that receives the connection.
    pub fn set_handshake(&mut self, handshake: ServerBoundHandshake, frame: Vec<u8>) {
        self.handshake = Some(handshake);
        self.handshake_frame = Some(frame);
    }

    pub fn handshake(&self) -> Option<&ServerBoundHandshake> {
        self.handshake.as_ref()
    }

    pub fn handshake_frame(&self) -> Option<&[u8]> {
        self.handshake_frame.as_deref()
    }

    /// Shuts the stream down. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }

    /// Hands out the underlying stream for the pipe phase. Any bytes already
    /// buffered stay readable through the `BufReader`.
    pub fn into_stream(self) -> BufReader<TcpStream> {
        self.stream
    }
}

/// The upstream side of a session.
#[derive(Debug)]
pub struct ServerConnection {
    stream: BufReader<TcpStream>,
    closed: bool,
}

impl ServerConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufReader::with_capacity(READ_BUFFER_BYTES, stream),
            closed: false,
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        read_frame_from(&mut self.stream).await
    }

    pub async fn read_packet(&mut self) -> Result<Packet, ProtocolError> {
        Ok(self.read_frame().await?.packet)
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), ProtocolError> {
        let frame = packet.to_frame()?;
        self.write_frame(&frame).await
    }

    /// Writes pre-encoded frame bytes verbatim.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }

    pub fn into_stream(self) -> BufReader<TcpStream> {
        self.stream
    }
}

/// How server workers reach their upstream. A seam so tests and future
/// transports can substitute the dial.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> anyhow::Result<ServerConnection>;
}

/// Plain TCP dial with a timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    dial_timeout: Duration,
}

impl TcpConnector {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

#[async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(&self, addr: &str) -> anyhow::Result<ServerConnection> {
        use anyhow::Context;

        let stream = if self.dial_timeout > Duration::from_millis(0) {
            time::timeout(self.dial_timeout, TcpStream::connect(addr))
                .await
                .with_context(|| format!("dial timeout {addr}"))??
        } else {
            TcpStream::connect(addr).await?
        };
        Ok(ServerConnection::new(stream))
    }
}
