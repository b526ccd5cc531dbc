// A TFTP client and server (RFC 1350, octet mode only).
//
// A transfer begins with a request to read or write a file. If the server grants it, the file
// is sent in blocks of 512 bytes. Each DATA packet carries one block and must be acknowledged
// before the next one is sent, so the sender only ever has to keep one packet around for
// retransmission.
//
// On loss, whoever is waiting for a reply times out and retransmits its last packet (DATA or
// ACK). The sender of a lost block then resends it. Retransmitting after a timeout is bounded;
// when the budget runs out the transfer fails.
//
// Most errors end the transfer. An ERROR packet is sent as a courtesy, is never acknowledged and
// is never retransmitted.
//
// Packets (all integers are big-endian u16):
//
// opcode   operation   layout
// 1        RRQ         opcode | filename | 0x00 | mode | 0x00
// 2        WRQ         opcode | filename | 0x00 | mode | 0x00
// 3        DATA        opcode | block | 0-512 bytes
// 4        ACK         opcode | block
// 5        ERROR       opcode | code | message | 0x00
//
// Error codes produced here:
//
// 1    File not found
// 2    Access violation
// 4    Illegal TFTP operation
//
// Initial connection:
// - For a read, the client sends RRQ and receives DATA(1).
// - For a write, the client sends WRQ and receives ACK(0).
// The server answers from a port of its own, distinct from the one it listens on. From then on
// both ends only talk to that address pair.
//
// Normal termination: a DATA packet with fewer than 512 bytes (possibly none) is the last one.
// It is acknowledged like every other block. Whoever sends the final ACK waits a while in case
// the final DATA is sent again, which means the ACK was lost.

pub mod client;
pub mod retry;
pub mod server;
pub mod tftp;
pub mod transfer;

pub use client::{Client, Direction};
pub use retry::{Peer, RetryPolicy, Supervisor, Verdict};
pub use server::{Server, ServerConfig, ServerError};
pub use tftp::{DecodeError, ErrorCode, Mode, Packet, TftpSocket};
pub use transfer::{Role, TransferError, TransferSession, TransferSummary};
