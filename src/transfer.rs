// This module drives a single file transfer from its first packet to its last.
//
// A transfer has two ends. The source owns the file and streams it out in DATA blocks of
// DATA_BUFFER_SIZE bytes, waiting for the matching ACK after each one. The sink receives those
// blocks, appends them to its file and acknowledges each. Which end the client plays depends on
// the request: a read request makes the client the sink, a write request makes it the source.
// The server always plays the opposite role.
//
// Both loops are strictly lockstep: at most one block is in flight, and block numbers advance
// by one per exchange, wrapping from 65535 to 0. A block shorter than DATA_BUFFER_SIZE (possibly
// empty) is the last one.
//
// The waiting itself is handled by the retry Supervisor. This module only decides, for each
// incoming packet, whether it is the awaited reply, a stale duplicate or a reason to give up.

use crate::retry::{Peer, RetryPolicy, Supervisor, Verdict};
use crate::tftp::{DecodeError, ErrorCode, Packet, SocketError, TftpSocket, DATA_BUFFER_SIZE};
use std::error;
use std::fmt;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Which end of the transfer this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the file and sends DATA.
    Source,

    /// Receives DATA and writes the file.
    Sink,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Sink => f.write_str("sink"),
        }
    }
}

/// Why a transfer ended early.
#[derive(Debug)]
pub enum TransferError {
    /// The peer went quiet for every attempt the retry policy allowed.
    Timeout { attempts: u32 },

    /// The peer sent bytes that do not form a packet.
    MalformedPacket(String),

    /// The peer sent a well-formed packet that has no place at this point of the transfer.
    UnexpectedPacket(String),

    /// Our own socket failed.
    SocketFailure(io::Error),

    /// Reading or writing the local file failed.
    File(io::Error),

    /// The peer ended the transfer with an ERROR packet.
    Remote { code: ErrorCode, message: String },
}

impl TransferError {
    /// The ERROR packet to send the peer when this error ends a transfer, if any. Timeouts and
    /// errors the peer reported itself get none, and neither does a broken socket.
    pub fn wire_error(&self) -> Option<Packet> {
        match self {
            TransferError::MalformedPacket(msg) => Some(Packet::Error {
                code: ErrorCode::IllegalOperation,
                message: format!("Malformed packet: {msg}"),
            }),
            TransferError::UnexpectedPacket(msg) => Some(Packet::Error {
                code: ErrorCode::IllegalOperation,
                message: format!("Unexpected packet: {msg}"),
            }),
            TransferError::File(e) => Some(Packet::Error {
                code: e.kind().into(),
                message: format!("File I/O failed: {e}"),
            }),
            TransferError::Timeout { .. }
            | TransferError::SocketFailure(_)
            | TransferError::Remote { .. } => None,
        }
    }
}

impl error::Error for TransferError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TransferError::SocketFailure(e) | TransferError::File(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::Timeout { attempts } => {
                write!(f, "timed out waiting for the peer after {attempts} attempts")
            }
            TransferError::MalformedPacket(msg) => write!(f, "malformed packet: {msg}"),
            TransferError::UnexpectedPacket(msg) => write!(f, "unexpected packet: {msg}"),
            TransferError::SocketFailure(e) => write!(f, "socket failure: {e}"),
            TransferError::File(e) => write!(f, "file I/O error: {e}"),
            TransferError::Remote { code, message } => {
                write!(f, "peer reported error {}: {message}", code.to_u16())
            }
        }
    }
}

impl From<DecodeError> for TransferError {
    fn from(e: DecodeError) -> Self {
        if e.is_unknown_opcode() {
            TransferError::UnexpectedPacket(e.to_string())
        } else {
            TransferError::MalformedPacket(e.to_string())
        }
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::IO(e) => TransferError::SocketFailure(e),
            SocketError::PacketParse { error, .. } => error.into(),
            SocketError::Timeout(_) => TransferError::Timeout { attempts: 1 },
        }
    }
}

/// What a finished transfer moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// File bytes carried in DATA payloads.
    pub bytes: u64,

    /// DATA blocks exchanged, including an empty final block.
    pub blocks: u64,

    /// Packets sent again after a timeout or to answer a duplicate.
    pub retransmits: u32,
}

/// One transfer in progress. Owns the socket, the file and the block counter; all three are
/// released when [`TransferSession::run`] returns, whatever the outcome.
pub struct TransferSession {
    role: Role,
    sock: TftpSocket,
    peer: Peer,
    file: File,
    block: u16,
    request: Option<Packet>,
    supervisor: Supervisor,
    summary: TransferSummary,
}

impl TransferSession {
    pub fn new(
        role: Role,
        sock: TftpSocket,
        peer: Peer,
        file: File,
        policy: RetryPolicy,
    ) -> TransferSession {
        TransferSession {
            role,
            sock,
            peer,
            file,
            block: 0,
            request: None,
            supervisor: Supervisor::new(policy),
            summary: TransferSummary::default(),
        }
    }

    /// Makes the session open with the client's request instead of answering one.
    ///
    /// A sink sends the request in place of the opening ACK(0) and expects DATA(1) back. A
    /// source sends it and waits for ACK(0) before its first block.
    pub fn with_request(mut self, request: Packet) -> TransferSession {
        self.request = Some(request);
        self
    }

    pub async fn run(mut self) -> Result<TransferSummary, TransferError> {
        let outcome = match self.role {
            Role::Source => self.run_source().await,
            Role::Sink => self.run_sink().await,
        };
        self.summary.retransmits = self.supervisor.retransmits();

        match outcome {
            Ok(()) => {
                log::info!(
                    "Transfer with {} complete as {}: {} bytes in {} blocks, {} retransmits",
                    self.peer.addr(),
                    self.role,
                    self.summary.bytes,
                    self.summary.blocks,
                    self.summary.retransmits
                );
                Ok(self.summary)
            }
            Err(e) => {
                if let Some(packet) = e.wire_error() {
                    // Error packet is sent as a courtesy, we don't care how it goes.
                    let _ = self.sock.send(&packet, self.peer.addr()).await;
                }
                log::warn!(
                    "Transfer with {} failed at block {} as {}: {}",
                    self.peer.addr(),
                    self.block,
                    self.role,
                    e
                );
                Err(e)
            }
        }
    }

    async fn run_source(&mut self) -> Result<(), TransferError> {
        if let Some(request) = self.request.take() {
            let outbound = request.encode();
            self.supervisor
                .exchange(&self.sock, &mut self.peer, &outbound, |p| judge_ack(0, p))
                .await?;
        }

        self.block = 1;
        loop {
            let data = read_block_from_file(&mut self.file)
                .await
                .map_err(TransferError::File)?;
            let len = data.len();
            let expected = self.block;
            let outbound = Packet::Data { block: expected, data }.encode();

            self.supervisor
                .exchange(&self.sock, &mut self.peer, &outbound, |p| judge_ack(expected, p))
                .await?;
            self.summary.bytes += len as u64;
            self.summary.blocks += 1;

            if len < DATA_BUFFER_SIZE {
                return Ok(());
            }
            self.block = expected.wrapping_add(1);
        }
    }

    async fn run_sink(&mut self) -> Result<(), TransferError> {
        let mut outbound = self
            .request
            .take()
            .unwrap_or(Packet::Ack { block: 0 })
            .encode();

        self.block = 1;
        loop {
            let expected = self.block;
            let data = self
                .supervisor
                .exchange(&self.sock, &mut self.peer, &outbound, |p| judge_data(expected, p))
                .await?;
            write_block_to_file(&mut self.file, &data)
                .await
                .map_err(TransferError::File)?;
            self.summary.bytes += data.len() as u64;
            self.summary.blocks += 1;

            let ack = Packet::Ack { block: expected };
            if data.len() < DATA_BUFFER_SIZE {
                self.file.flush().await.map_err(TransferError::File)?;
                self.sock.send(&ack, self.peer.addr()).await?;
                self.supervisor
                    .linger(&self.sock, &self.peer, |p| match p {
                        Packet::Data { block, .. } if *block == expected => Some(ack.clone()),
                        _ => None,
                    })
                    .await;
                return Ok(());
            }
            outbound = ack.encode();
            self.block = expected.wrapping_add(1);
        }
    }
}

/// Source side: only ACK(expected) moves the transfer on; any other ACK is a stale duplicate.
fn judge_ack(expected: u16, packet: &Packet) -> Verdict<()> {
    match packet {
        &Packet::Ack { block } if block == expected => Verdict::Accept(()),
        Packet::Ack { .. } => Verdict::Ignore,
        Packet::Error { code, message } => Verdict::Abort(TransferError::Remote {
            code: *code,
            message: message.clone(),
        }),
        other => Verdict::Abort(TransferError::UnexpectedPacket(format!(
            "expected ACK for block {expected}, got {other:?}"
        ))),
    }
}

/// Sink side: DATA(expected) is new content. A block from the recent past was already written,
/// so it is only acknowledged again; a block from the future means the peer is out of step.
fn judge_data(expected: u16, packet: &Packet) -> Verdict<Vec<u8>> {
    match packet {
        Packet::Data { block, data } if *block == expected => Verdict::Accept(data.clone()),
        &Packet::Data { block, .. } if is_behind(block, expected) => {
            Verdict::Answer(Packet::Ack { block })
        }
        &Packet::Data { block, .. } => Verdict::Abort(TransferError::UnexpectedPacket(format!(
            "DATA block {block} while expecting block {expected}"
        ))),
        Packet::Error { code, message } => Verdict::Abort(TransferError::Remote {
            code: *code,
            message: message.clone(),
        }),
        other => Verdict::Abort(TransferError::UnexpectedPacket(format!(
            "expected DATA block {expected}, got {other:?}"
        ))),
    }
}

/// Whether `block` comes before `expected` in modulo-65536 order.
fn is_behind(block: u16, expected: u16) -> bool {
    (1..=0x7FFF).contains(&expected.wrapping_sub(block))
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for without being at EOF, so keep reading
    // into the remainder of the buffer until it is full or the file runs out.
    loop {
        let n = f.read(&mut buf[cursor..]).await?;
        cursor += n;
        if cursor == buf.len() || n == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

async fn write_block_to_file(f: &mut File, buf: &[u8]) -> Result<(), io::Error> {
    f.write_all(buf).await
}
