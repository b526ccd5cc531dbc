use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest payload a single DATA packet may carry. A shorter payload ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Receive buffer size. Larger than any valid DATA packet so that oversized datagrams are
/// rejected instead of silently truncated.
const RECV_BUFFER_SIZE: usize = 2048;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Reasons a datagram could not be turned into a [`Packet`].
#[derive(Debug, PartialEq)]
pub enum DecodeError {
    /// The datagram ends before a fixed-width field does.
    Truncated { needed: usize, len: usize },

    /// A text field runs to the end of the datagram without a NUL byte.
    MissingTerminator(&'static str),

    /// A text field is not valid UTF-8.
    InvalidText(&'static str),

    /// A DATA packet carries more than [`DATA_BUFFER_SIZE`] bytes.
    OversizedPayload(usize),

    /// The mode field names a transfer mode we do not know.
    UnknownMode(String),

    /// The opcode is outside 1..=5.
    UnknownOpcode(u16),
}

impl DecodeError {
    /// An unknown opcode is a well-formed datagram we cannot act on, not a corrupt one.
    pub fn is_unknown_opcode(&self) -> bool {
        matches!(self, DecodeError::UnknownOpcode(_))
    }
}

impl error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Truncated { needed, len } => {
                write!(f, "packet too short: need {needed} bytes, got {len}")
            }
            DecodeError::MissingTerminator(field) => write!(f, "{field} is not NUL-terminated"),
            DecodeError::InvalidText(field) => write!(f, "{field} is not valid UTF-8"),
            DecodeError::OversizedPayload(len) => {
                write!(f, "data payload of {len} bytes exceeds {DATA_BUFFER_SIZE}")
            }
            DecodeError::UnknownMode(mode) => write!(f, "unknown transfer mode '{mode}'"),
            DecodeError::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
        }
    }
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse { error: DecodeError, src: SocketAddr },
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "socket I/O error: {e}"),
            SocketError::PacketParse { error, src } => {
                write!(f, "bad packet from {src}: {error}")
            }
            SocketError::Timeout(_) => write!(f, "socket receive timed out"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

///////////////////////////////////////////////////////////////
// Packets

/// The transfer mode named in a request. Only octet transfers are carried out; the other two
/// are recognised so that they can be refused politely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    NetAscii,
    Octet,
    Mail,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::NetAscii => "netascii",
            Mode::Octet => "octet",
            Mode::Mail => "mail",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes placed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    AccessViolation,
    IllegalOperation,

    /// A code we never send ourselves but may receive from another implementation.
    Other(u16),
}

impl ErrorCode {
    pub fn to_u16(self) -> u16 {
        match self {
            ErrorCode::NotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> ErrorCode {
        match code {
            1 => ErrorCode::NotFound,
            2 => ErrorCode::AccessViolation,
            4 => ErrorCode::IllegalOperation,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::NotFound,
            _ => ErrorCode::AccessViolation,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: Mode,
    },

    /// A write request packet
    WriteReq { path: String, mode: Mode },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself, at most [`DATA_BUFFER_SIZE`] bytes.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl OpCode {
    fn from_u16(raw: u16) -> Result<OpCode, DecodeError> {
        match raw {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            _ => Err(DecodeError::UnknownOpcode(raw)),
        }
    }
}

/// Bounds-checked cursor over a received datagram. Every field read goes through here, so a
/// short datagram produces a `DecodeError` instead of an out-of-range index.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let end = self.pos + 2;
        let bytes = self.buf.get(self.pos..end).ok_or(DecodeError::Truncated {
            needed: end,
            len: self.buf.len(),
        })?;
        self.pos = end;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a NUL-terminated string and moves past its terminator.
    fn text(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let buf = self.buf;
        let rest = &buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::MissingTerminator(field))?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| DecodeError::InvalidText(field))?;
        self.pos += nul + 1;
        Ok(s.to_string())
    }

    fn rest(&mut self) -> &'a [u8] {
        let buf = self.buf;
        let start = self.pos;
        self.pos = buf.len();
        &buf[start..]
    }
}

fn parse_mode(raw: &str) -> Result<Mode, DecodeError> {
    match raw.to_ascii_lowercase().as_str() {
        "netascii" => Ok(Mode::NetAscii),
        "octet" => Ok(Mode::Octet),
        "mail" => Ok(Mode::Mail),
        _ => Err(DecodeError::UnknownMode(raw.to_string())),
    }
}

/// Text fields end at the first NUL; anything after one could not survive the trip anyway.
fn push_text(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    buf.extend_from_slice(&bytes[..end]);
    buf.push(0);
}

impl Packet {
    /// Serialises the packet into its wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + DATA_BUFFER_SIZE);
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                let op = match self {
                    Packet::ReadReq { .. } => OpCode::Rrq,
                    _ => OpCode::Wrq,
                };
                buf.extend_from_slice(&(op as u16).to_be_bytes());
                push_text(&mut buf, path);
                push_text(&mut buf, mode.as_str());
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&(OpCode::Data as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&(OpCode::Ack as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&(OpCode::Error as u16).to_be_bytes());
                buf.extend_from_slice(&code.to_u16().to_be_bytes());
                push_text(&mut buf, message);
            }
        }
        buf
    }

    /// Parses a datagram. Trailing bytes after the last text field of a request or error are
    /// ignored; DATA takes everything after the block number as payload.
    pub fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
        let mut reader = Reader::new(buf);
        match OpCode::from_u16(reader.u16()?)? {
            op @ (OpCode::Rrq | OpCode::Wrq) => {
                let path = reader.text("filename")?;
                let mode = parse_mode(&reader.text("mode")?)?;
                Ok(if op == OpCode::Rrq {
                    Packet::ReadReq { path, mode }
                } else {
                    Packet::WriteReq { path, mode }
                })
            }
            OpCode::Data => {
                let block = reader.u16()?;
                let data = reader.rest();
                if data.len() > DATA_BUFFER_SIZE {
                    return Err(DecodeError::OversizedPayload(data.len()));
                }
                Ok(Packet::Data { block, data: data.to_vec() })
            }
            OpCode::Ack => Ok(Packet::Ack { block: reader.u16()? }),
            OpCode::Error => {
                let code = ErrorCode::from_u16(reader.u16()?);
                let message = reader.text("error message")?;
                Ok(Packet::Error { code, message })
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.send_raw(&packet.encode(), dst).await
    }

    /// Sends already-encoded bytes, used for retransmitting exactly what went out before.
    pub async fn send_raw(&self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(bytes, dst).await?;
        Ok(())
    }

    /// Waits without a deadline; only the dispatcher's listening socket does this.
    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        Self::parse(&buf[..total_written], src)
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        Self::parse(&buf[..total_written], src)
    }

    fn parse(buf: &[u8], src: SocketAddr) -> TftpResult<(Packet, SocketAddr)> {
        match Packet::decode(buf) {
            Ok(packet) => Ok((packet, src)),
            Err(error) => Err(SocketError::PacketParse { error, src }),
        }
    }
}
