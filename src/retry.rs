// Every step of a lockstep transfer has the same shape: put one packet on the wire, then wait
// for the one reply that lets the transfer move on. Anything else that shows up in the meantime
// (a duplicate of an older reply, a datagram from a stranger) must neither count as progress nor
// as silence. The Supervisor owns that loop so that the transfer engine only has to describe
// which replies it is waiting for.
//
// Retransmissions resend the exact bytes that went out the first time. Stale replies do not
// consume the retry budget and do not push the deadline back either, so a peer stuck repeating
// an old ACK still ends in a timeout.

use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use crate::transfer::TransferError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// How long to wait for a reply and how many times to resend before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time allowed for each reply.
    pub timeout: Duration,

    /// Number of retransmissions after the first send.
    pub max_retries: u32,

    /// How long a receiver stays around after its final ACK to answer a resent final block.
    pub linger: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            linger: DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

/// The remote end of a transfer.
///
/// A server knows its client's address from the request, so its peer starts out locked. A
/// client only knows the server's listening address; the server answers from a fresh port, so
/// the client's peer is unlocked until the first accepted reply pins it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    addr: SocketAddr,
    locked: bool,
}

impl Peer {
    pub fn locked(addr: SocketAddr) -> Peer {
        Peer { addr, locked: true }
    }

    pub fn unlocked(addr: SocketAddr) -> Peer {
        Peer { addr, locked: false }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn admits(&self, src: SocketAddr) -> bool {
        if self.locked {
            src == self.addr
        } else {
            src.ip() == self.addr.ip()
        }
    }

    fn lock(&mut self, src: SocketAddr) {
        if !self.locked {
            log::debug!("Peer {} now answering from {}", self.addr, src);
        }
        self.addr = src;
        self.locked = true;
    }
}

/// What the caller of [`Supervisor::exchange`] makes of a reply from the peer.
#[derive(Debug)]
pub enum Verdict<T> {
    /// This is the reply we were waiting for.
    Accept(T),

    /// A stale or duplicate reply. Keep waiting.
    Ignore,

    /// Send this packet back to the peer, then keep waiting.
    Answer(Packet),

    /// The transfer cannot continue.
    Abort(TransferError),
}

/// Runs send-and-await steps under a [`RetryPolicy`] and keeps count of retransmissions.
#[derive(Debug)]
pub struct Supervisor {
    policy: RetryPolicy,
    retransmits: u32,
}

/// Datagrams from anyone but the peer are answered with an error and otherwise ignored.
async fn reject_stranger(sock: &TftpSocket, src: SocketAddr) {
    log::warn!("Ignoring datagram from unknown sender {}", src);
    let error = Packet::Error {
        code: ErrorCode::IllegalOperation,
        message: "Unknown transfer ID".to_string(),
    };
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&error, src).await;
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Supervisor {
        Supervisor { policy, retransmits: 0 }
    }

    pub fn retransmits(&self) -> u32 {
        self.retransmits
    }

    /// Sends `outbound` to the peer and waits for a reply that `judge` accepts, resending the
    /// same bytes on every timeout until the retry budget runs out.
    pub async fn exchange<T, F>(
        &mut self,
        sock: &TftpSocket,
        peer: &mut Peer,
        outbound: &[u8],
        mut judge: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut(&Packet) -> Verdict<T>,
    {
        sock.send_raw(outbound, peer.addr()).await?;

        let mut retries_left = self.policy.max_retries;
        let mut deadline = Instant::now() + self.policy.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match sock.recv_with_timeout(remaining).await {
                Ok((packet, src)) => {
                    if !peer.admits(src) {
                        reject_stranger(sock, src).await;
                        continue;
                    }
                    match judge(&packet) {
                        Verdict::Accept(value) => {
                            peer.lock(src);
                            return Ok(value);
                        }
                        Verdict::Ignore => {
                            log::debug!("Discarding stale {:?} from {}", packet, src);
                        }
                        Verdict::Answer(reply) => {
                            self.retransmits += 1;
                            sock.send(&reply, src).await?;
                        }
                        Verdict::Abort(e) => return Err(e),
                    }
                }
                Err(SocketError::Timeout(_)) => {
                    if retries_left == 0 {
                        return Err(TransferError::Timeout {
                            attempts: self.policy.max_retries + 1,
                        });
                    }
                    retries_left -= 1;
                    self.retransmits += 1;
                    log::warn!(
                        "No reply from {} within {:?}, retransmitting ({} retries left)",
                        peer.addr(),
                        self.policy.timeout,
                        retries_left
                    );
                    sock.send_raw(outbound, peer.addr()).await?;
                    deadline = Instant::now() + self.policy.timeout;
                }
                Err(SocketError::PacketParse { error, src }) => {
                    if !peer.admits(src) {
                        reject_stranger(sock, src).await;
                        continue;
                    }
                    return Err(error.into());
                }
                Err(SocketError::IO(e)) => return Err(TransferError::SocketFailure(e)),
            }
        }
    }

    /// Stays on the line for `policy.linger` after the last packet of a transfer went out,
    /// answering whatever `judge` asks to answer. Nothing here can fail the transfer.
    pub async fn linger<F>(&mut self, sock: &TftpSocket, peer: &Peer, mut judge: F)
    where
        F: FnMut(&Packet) -> Option<Packet>,
    {
        let deadline = Instant::now() + self.policy.linger;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match sock.recv_with_timeout(remaining).await {
                Ok((packet, src)) if src == peer.addr() => {
                    if let Some(reply) = judge(&packet) {
                        log::debug!("Answering late {:?} from {}", packet, src);
                        self.retransmits += 1;
                        let _ = sock.send(&reply, src).await;
                    }
                }
                Ok(_) | Err(SocketError::PacketParse { .. }) => continue,
                Err(SocketError::Timeout(_)) | Err(SocketError::IO(_)) => return,
            }
        }
    }
}
