// This module contains the server-side request dispatcher.
//
// The server listens on a single well-known port for read and write requests. Nothing but
// requests is ever accepted there: any other datagram, or one that does not decode, is answered
// with an IllegalOperation error and otherwise dropped.
//
// An accepted request is handled in roughly the following stages:
//
// 1. Bind a fresh socket on a random port from the configured range. All further traffic for the
//    transfer goes through that socket, so the listening port stays free for new requests and
//    the client can tell transfers apart by the port it is answered from. If no port is free
//    the request is refused with AccessViolation.
// 2. Check whether the request can be serviced by interacting with the filesystem. A read needs
//    a file that can be opened for reading (NotFound otherwise), a write needs a file that can be
//    created or truncated (AccessViolation otherwise). Nothing is opened before step 1 succeeds.
// 3. Spawn a task that runs the transfer in the opposite role from the client: the server is the
//    source for a read request and the sink for a write request.
//
// Each spawned task owns its session outright. The dispatcher only remembers which client
// addresses have a transfer in flight, so that a request duplicated by the network does not
// start a second transfer to the same client. Whatever happens to one transfer, the listener
// carries on.
//
// Filenames are resolved against the configured root without any confinement. An absolute path
// or one containing `..` reaches wherever it points.

use crate::retry::{Peer, RetryPolicy};
use crate::tftp::{self, ErrorCode, Mode, Packet, SocketError, TftpSocket};
use crate::transfer::{Role, TransferSession};
use rand::Rng;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::task::JoinHandle;

/// Port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8888;

/// How many random ports to try before giving up on a transfer socket.
const BIND_ATTEMPTS: usize = 32;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Transfer sockets are bound to the same address.
    pub bind_ip: IpAddr,

    /// The well-known request port. Zero lets the OS pick one.
    pub port: u16,

    /// Ports transfer sockets are drawn from.
    pub transfer_ports: RangeInclusive<u16>,

    /// Directory request filenames are resolved against.
    pub root: PathBuf,

    pub policy: RetryPolicy,
}

impl ServerConfig {
    pub fn new(bind_ip: IpAddr) -> ServerConfig {
        ServerConfig {
            bind_ip,
            port: DEFAULT_PORT,
            transfer_ports: 1024..=65535,
            root: PathBuf::from("."),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> ServerConfig {
        self.port = port;
        self
    }

    pub fn with_transfer_ports(mut self, ports: RangeInclusive<u16>) -> ServerConfig {
        self.transfer_ports = ports;
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> ServerConfig {
        self.root = root.into();
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> ServerConfig {
        self.policy = policy;
        self
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind(SocketAddr, SocketError),
    BadConfig(String),
    Io(SocketError),
}

impl error::Error for ServerError {}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bind(addr, e) => write!(f, "could not bind {addr}: {e}"),
            Self::BadConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Io(e) => write!(f, "listener error: {e}"),
        }
    }
}

pub struct Server {
    sock: TftpSocket,
    config: ServerConfig,

    /// In-flight transfers keyed by client address. Only the dispatch loop touches this.
    transfers: HashMap<SocketAddr, JoinHandle<()>>,
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

/// Binds a socket on a random port from `ports`, retrying a bounded number of times.
fn bind_transfer_socket(ip: IpAddr, ports: &RangeInclusive<u16>) -> tftp::TftpResult<TftpSocket> {
    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = rng.gen_range(ports.clone());
        match TftpSocket::bind((ip, port).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::debug!("Couldn't bind transfer socket on port {}: {}", port, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        SocketError::IO(io::Error::new(io::ErrorKind::AddrInUse, "no transfer port available"))
    }))
}

async fn open_for(role: Role, path: &Path) -> Result<File, io::Error> {
    match role {
        Role::Source => File::open(path).await,
        Role::Sink => {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .await
        }
    }
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Server, ServerError> {
        if config.transfer_ports.is_empty() {
            return Err(ServerError::BadConfig(format!(
                "transfer port range {:?} is empty",
                config.transfer_ports
            )));
        }
        let addr = SocketAddr::new(config.bind_ip, config.port);
        let sock = TftpSocket::bind(addr).map_err(|e| ServerError::Bind(addr, e))?;
        Ok(Server { sock, config, transfers: HashMap::new() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.sock.local_addr().map_err(ServerError::Io)
    }

    /// Receives and dispatches requests forever.
    pub async fn serve(mut self) {
        match self.local_addr() {
            Ok(addr) => log::info!("Listening on {}", addr),
            Err(e) => log::warn!("Listening on unknown address: {}", e),
        }

        loop {
            match self.sock.recv().await {
                Ok((packet, src)) => self.dispatch(packet, src).await,
                Err(SocketError::PacketParse { error, src }) => {
                    log::warn!("Rejecting datagram from {}: {}", src, error);
                    send_error_packet(
                        &self.sock,
                        src,
                        ErrorCode::IllegalOperation,
                        "Illegal TFTP operation".to_string(),
                    )
                    .await;
                }
                Err(e) => log::error!("Listener receive failed: {}", e),
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet, src: SocketAddr) {
        let (role, path, mode) = match packet {
            Packet::ReadReq { path, mode } => {
                log::info!("RRQ from {}: {} ({})", src, path, mode);
                (Role::Source, path, mode)
            }
            Packet::WriteReq { path, mode } => {
                log::info!("WRQ from {}: {} ({})", src, path, mode);
                (Role::Sink, path, mode)
            }
            other => {
                log::warn!("Rejecting non-request {:?} from {}", other, src);
                send_error_packet(
                    &self.sock,
                    src,
                    ErrorCode::IllegalOperation,
                    "Illegal TFTP operation".to_string(),
                )
                .await;
                return;
            }
        };

        self.transfers.retain(|_, handle| !handle.is_finished());
        if self.transfers.contains_key(&src) {
            log::warn!("Ignoring repeated request from {}, transfer already in flight", src);
            return;
        }

        if mode != Mode::Octet {
            send_error_packet(
                &self.sock,
                src,
                ErrorCode::IllegalOperation,
                format!("Transfer mode '{mode}' is not supported"),
            )
            .await;
            return;
        }

        let sock = match bind_transfer_socket(self.config.bind_ip, &self.config.transfer_ports) {
            Ok(sock) => sock,
            Err(e) => {
                log::error!("No socket for transfer with {}: {}", src, e);
                send_error_packet(
                    &self.sock,
                    src,
                    ErrorCode::AccessViolation,
                    "No transfer port available".to_string(),
                )
                .await;
                return;
            }
        };

        let full_path = self.config.root.join(&path);
        let file = match open_for(role, &full_path).await {
            Ok(f) => f,
            Err(e) => {
                log::warn!("Cannot open {} for {}: {}", full_path.display(), src, e);
                let (code, message) = match role {
                    Role::Source => (ErrorCode::NotFound, "File not found"),
                    Role::Sink => (ErrorCode::AccessViolation, "Access violation"),
                };
                send_error_packet(&self.sock, src, code, message.to_string()).await;
                return;
            }
        };

        let session =
            TransferSession::new(role, sock, Peer::locked(src), file, self.config.policy);
        let handle = tokio::spawn(async move {
            // The session logs its own outcome.
            let _ = session.run().await;
        });
        self.transfers.insert(src, handle);
    }
}
