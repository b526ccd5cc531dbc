// The client starts a transfer by sending a request to the server's well-known port and then
// plays the role the request implies: after a read request it is the sink and writes what the
// server sends, after a write request it is the source and streams its own file. The server
// answers from a port of its own choosing, which the session locks onto on the first reply.

use crate::retry::{Peer, RetryPolicy};
use crate::tftp::{Mode, Packet, TftpSocket};
use crate::transfer::{Role, TransferError, TransferSession, TransferSummary};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{self, File};

/// Which way the file travels, as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Fetch a file from the server (RRQ).
    Read,

    /// Store a file on the server (WRQ).
    Write,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Direction, String> {
        match s {
            "r" => Ok(Direction::Read),
            "w" => Ok(Direction::Write),
            other => Err(format!("invalid mode '{other}', use 'r' for read or 'w' for write")),
        }
    }
}

pub struct Client {
    server: SocketAddr,
    policy: RetryPolicy,
}

impl Client {
    pub fn new(server: SocketAddr) -> Client {
        Client { server, policy: RetryPolicy::default() }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Client {
        self.policy = policy;
        self
    }

    pub async fn transfer(
        &self,
        direction: Direction,
        remote: &str,
        local: &Path,
    ) -> Result<TransferSummary, TransferError> {
        match direction {
            Direction::Read => self.get(remote, local).await,
            Direction::Write => self.put(local, remote).await,
        }
    }

    /// Fetches `remote` from the server into `local`.
    ///
    /// Blocks land in a `.part` file next to `local`, which replaces `local` only once the whole
    /// file has arrived. A failed transfer leaves `local` as it was and no partial file behind.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<TransferSummary, TransferError> {
        let partial = partial_path(local);
        let file = File::create(&partial).await.map_err(TransferError::File)?;
        let request = Packet::ReadReq { path: remote.to_string(), mode: Mode::Octet };
        log::info!("Requesting {} from {}", remote, self.server);

        let result = match self.start(Role::Sink, file, request).await {
            Ok(summary) => fs::rename(&partial, local)
                .await
                .map(|()| summary)
                .map_err(TransferError::File),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = fs::remove_file(&partial).await {
                log::warn!("Could not remove partial file {}: {}", partial.display(), e);
            }
        }
        result
    }

    /// Sends `local` to the server, to be stored as `remote`.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<TransferSummary, TransferError> {
        let file = File::open(local).await.map_err(TransferError::File)?;
        let request = Packet::WriteReq { path: remote.to_string(), mode: Mode::Octet };
        log::info!("Offering {} to {}", remote, self.server);

        self.start(Role::Source, file, request).await
    }

    async fn start(
        &self,
        role: Role,
        file: File,
        request: Packet,
    ) -> Result<TransferSummary, TransferError> {
        let sock = self.bind_local()?;
        TransferSession::new(role, sock, Peer::unlocked(self.server), file, self.policy)
            .with_request(request)
            .run()
            .await
    }

    fn bind_local(&self) -> Result<TftpSocket, TransferError> {
        let local: SocketAddr = match self.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        Ok(TftpSocket::bind(local)?)
    }
}

fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
