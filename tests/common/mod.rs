#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tempdir::TempDir;
use tftp_engine::{Packet, RetryPolicy, Server, ServerConfig, TftpSocket};
use tokio::task::JoinHandle;

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Short enough to keep the suite quick, long enough not to fire spuriously on loopback.
pub fn test_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_timeout(Duration::from_millis(300))
        .with_max_retries(3)
        .with_linger(Duration::from_millis(50))
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub root: TempDir,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn start_server() -> TestServer {
    let root = TempDir::new("tftp-root").expect("create server root");
    let config = ServerConfig::new(LOCALHOST)
        .with_port(0)
        .with_root(root.path())
        .with_policy(test_policy());
    let server = Server::bind(config).expect("bind server");
    let addr = server.local_addr().expect("server address");
    let task = tokio::spawn(server.serve());
    TestServer { addr, root, task }
}

pub fn raw_socket() -> TftpSocket {
    TftpSocket::bind((LOCALHOST, 0).into()).expect("bind raw socket")
}

pub async fn recv(sock: &TftpSocket) -> (Packet, SocketAddr) {
    sock.recv_with_timeout(Duration::from_secs(3))
        .await
        .expect("expected a packet")
}

/// Asserts that nothing arrives on `sock` for `quiet`.
pub async fn assert_silent(sock: &TftpSocket, quiet: Duration) {
    if let Ok((packet, src)) = sock.recv_with_timeout(quiet).await {
        panic!("unexpected {packet:?} from {src}");
    }
}

/// Deterministic, non-repeating-per-block content so misplaced blocks show up.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
