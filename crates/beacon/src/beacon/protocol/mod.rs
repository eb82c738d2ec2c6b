pub mod handshake;
pub mod login;
pub mod status;

use thiserror::Error;

/// Largest declared frame length the codec accepts (2^21 - 1). The vanilla
/// client never produces longer frames without compression, which the proxy
/// does not negotiate.
pub const MAX_FRAME_LENGTH: usize = 2_097_151;

/// VarInts carry at most 5 bytes of 7 payload bits each.
pub const MAX_VAR_INT_BYTES: usize = 5;

/// VarLongs carry at most 10 bytes.
pub const MAX_VAR_LONG_BYTES: usize = 10;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("varint continues past its final permitted byte")]
    VarIntTooBig,
    #[error("varlong continues past its final permitted byte")]
    VarLongTooBig,
    #[error("declared frame length {0} is out of range")]
    FrameLength(i64),
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("stream ended mid-frame")]
    TruncatedFrame,
    #[error("need {0} more bytes in packet data")]
    ShortRead(usize),
    #[error("string of {got} bytes exceeds the field cap of {cap}")]
    StringTooLong { got: usize, cap: usize },
    #[error("string field is not valid utf-8")]
    BadUtf8(#[from] std::str::Utf8Error),
    #[error("unexpected packet id {got:#04x}, expected {want:#04x}")]
    UnexpectedPacketId { want: i32, got: i32 },
    #[error("{field} is out of range")]
    OutOfRange { field: &'static str },
    #[error("status json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// A decoded Minecraft packet: an id plus its opaque body.
///
/// On the wire a packet is framed as `VarInt(len(id) + len(data))`, then the
/// id as a VarInt, then the body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(id: i32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Decodes a packet from a frame body, i.e. everything after the length
    /// prefix.
    pub fn from_frame_body(body: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(body);
        let id = r.read_var_int()?;
        Ok(Self {
            id,
            data: r.remaining().to_vec(),
        })
    }

    /// Encodes the full frame, length prefix included.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.data.len() + MAX_VAR_INT_BYTES);
        {
            let mut w = PacketWriter::new(&mut body);
            w.write_var_int(self.id);
            w.write_slice(&self.data);
        }
        if body.len() > MAX_FRAME_LENGTH {
            return Err(ProtocolError::FrameLength(body.len() as i64));
        }

        let mut frame = Vec::with_capacity(body.len() + MAX_VAR_INT_BYTES);
        PacketWriter::new(&mut frame).write_var_int(body.len() as i32);
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// A cursor over a packet body. All reads consume from the front.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(ProtocolError::ShortRead(n - self.buf.len()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_var_int(&mut self) -> Result<i32> {
        let mut num_read = 0u32;
        let mut result: i32 = 0;
        loop {
            let byte = self.read_u8()?;
            let value = i32::from(byte & 0x7f);
            result |= value.overflowing_shl(7 * num_read).0;
            num_read += 1;
            if byte & 0x80 == 0 {
                break;
            }
            if num_read as usize == MAX_VAR_INT_BYTES {
                return Err(ProtocolError::VarIntTooBig);
            }
        }
        Ok(result)
    }

    pub fn read_var_long(&mut self) -> Result<i64> {
        let mut num_read = 0u32;
        let mut result: i64 = 0;
        loop {
            let byte = self.read_u8()?;
            let value = i64::from(byte & 0x7f);
            result |= value.overflowing_shl(7 * num_read).0;
            num_read += 1;
            if byte & 0x80 == 0 {
                break;
            }
            if num_read as usize == MAX_VAR_LONG_BYTES {
                return Err(ProtocolError::VarLongTooBig);
            }
        }
        Ok(result)
    }

    /// Reads a VarInt-prefixed UTF-8 string of at most `cap` bytes.
    pub fn read_string(&mut self, cap: usize) -> Result<&'a str> {
        let len = self.read_var_int()?;
        if len < 0 {
            return Err(ProtocolError::OutOfRange {
                field: "string length",
            });
        }
        let len = len as usize;
        if len > cap {
            return Err(ProtocolError::StringTooLong { got: len, cap });
        }
        Ok(std::str::from_utf8(self.take(len)?)?)
    }
}

/// Appends primitive fields to a packet body.
#[derive(Debug)]
pub struct PacketWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> PacketWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn write_u16(&mut self, x: u16) {
        self.buf.extend_from_slice(&x.to_be_bytes());
    }

    pub fn write_var_int(&mut self, x: i32) -> usize {
        let mut x = x as u32;
        let mut written = 0;
        loop {
            let mut byte = (x & 0x7f) as u8;
            x >>= 7;
            if x != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            written += 1;
            if x == 0 {
                break written;
            }
        }
    }

    pub fn write_var_long(&mut self, x: i64) -> usize {
        let mut x = x as u64;
        let mut written = 0;
        loop {
            let mut byte = (x & 0x7f) as u8;
            x >>= 7;
            if x != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            written += 1;
            if x == 0 {
                break written;
            }
        }
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_var_int(s.len() as i32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}
