//! Transfer engine behaviour against a scripted peer: retransmission, stale and duplicate
//! packets, and block numbers wrapping around.

mod common;

use common::*;
use std::time::Duration;
use tempdir::TempDir;
use tftp_engine::{Client, Packet, Peer, RetryPolicy, Role, TransferError, TransferSession};
use tokio::fs::File;
use tokio_test::{assert_err, assert_ok};

async fn source_file(dir: &TempDir, name: &str, contents: &[u8]) -> File {
    let path = dir.path().join(name);
    tokio::fs::write(&path, contents).await.unwrap();
    File::open(&path).await.unwrap()
}

#[tokio::test]
async fn silent_peer_times_out_after_identical_retransmissions() {
    let dir = TempDir::new("engine").unwrap();
    let file = source_file(&dir, "data.bin", &pattern(100)).await;
    let peer = raw_socket();
    let policy = RetryPolicy::default()
        .with_timeout(Duration::from_millis(60))
        .with_max_retries(4)
        .with_linger(Duration::ZERO);

    let session = TransferSession::new(
        Role::Source,
        raw_socket(),
        Peer::locked(peer.local_addr().unwrap()),
        file,
        policy,
    );
    let result = session.run().await;
    assert!(matches!(assert_err!(result), TransferError::Timeout { attempts: 5 }));

    let expected = Packet::Data { block: 1, data: pattern(100) }.encode();
    for _ in 0..5 {
        let (packet, _) = recv(&peer).await;
        assert_eq!(packet.encode(), expected);
    }
    assert_silent(&peer, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn duplicate_ack_neither_advances_nor_refills_retries() {
    let dir = TempDir::new("engine").unwrap();
    let file = source_file(&dir, "data.bin", &pattern(1200)).await;
    let peer = raw_socket();
    let policy = RetryPolicy::default()
        .with_timeout(Duration::from_millis(100))
        .with_max_retries(3)
        .with_linger(Duration::ZERO);

    let session = TransferSession::new(
        Role::Source,
        raw_socket(),
        Peer::locked(peer.local_addr().unwrap()),
        file,
        policy,
    );
    let transfer = tokio::spawn(session.run());

    let (packet, src) = recv(&peer).await;
    assert!(matches!(packet, Packet::Data { block: 1, .. }));
    peer.send(&Packet::Ack { block: 1 }, src).await.unwrap();

    // Every copy of block 2 is answered with a stale ACK for block 1.
    let mut block_two_sends = 0;
    while let Ok((packet, src)) = peer.recv_with_timeout(Duration::from_millis(500)).await {
        match packet {
            Packet::Data { block: 2, data } => {
                assert_eq!(data, pattern(1200)[512..1024].to_vec());
                block_two_sends += 1;
                peer.send(&Packet::Ack { block: 1 }, src).await.unwrap();
            }
            other => panic!("transfer moved on to {other:?}"),
        }
    }

    assert!(matches!(
        assert_err!(transfer.await.unwrap()),
        TransferError::Timeout { attempts: 4 }
    ));
    assert_eq!(block_two_sends, 4);
}

#[tokio::test]
async fn duplicate_data_is_reacked_but_not_rewritten() {
    let dir = TempDir::new("engine").unwrap();
    let path = dir.path().join("received.bin");
    let file = File::create(&path).await.unwrap();
    let peer = raw_socket();

    let session = TransferSession::new(
        Role::Sink,
        raw_socket(),
        Peer::locked(peer.local_addr().unwrap()),
        file,
        test_policy(),
    );
    let transfer = tokio::spawn(session.run());

    let (packet, src) = recv(&peer).await;
    assert_eq!(packet, Packet::Ack { block: 0 });

    peer.send(&Packet::Data { block: 1, data: vec![b'a'; 512] }, src).await.unwrap();
    assert_eq!(recv(&peer).await.0, Packet::Ack { block: 1 });

    // Same block number, different bytes: if it were written, the file would show it.
    peer.send(&Packet::Data { block: 1, data: vec![b'z'; 512] }, src).await.unwrap();
    assert_eq!(recv(&peer).await.0, Packet::Ack { block: 1 });

    peer.send(&Packet::Data { block: 2, data: vec![b'b'; 10] }, src).await.unwrap();
    assert_eq!(recv(&peer).await.0, Packet::Ack { block: 2 });

    let summary = assert_ok!(transfer.await.unwrap());
    assert_eq!((summary.bytes, summary.blocks), (522, 2));
    assert!(summary.retransmits >= 1);

    let mut expected = vec![b'a'; 512];
    expected.extend_from_slice(&[b'b'; 10]);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), expected);
}

#[tokio::test]
async fn lost_final_ack_is_answered_while_lingering() {
    let dir = TempDir::new("engine").unwrap();
    let path = dir.path().join("received.bin");
    let file = File::create(&path).await.unwrap();
    let peer = raw_socket();
    let policy = test_policy().with_linger(Duration::from_millis(500));

    let session = TransferSession::new(
        Role::Sink,
        raw_socket(),
        Peer::locked(peer.local_addr().unwrap()),
        file,
        policy,
    );
    let transfer = tokio::spawn(session.run());

    let (_, src) = recv(&peer).await;
    let last = Packet::Data { block: 1, data: b"tail".to_vec() };
    peer.send(&last, src).await.unwrap();
    assert_eq!(recv(&peer).await.0, Packet::Ack { block: 1 });

    // Pretend that ACK never arrived.
    peer.send(&last, src).await.unwrap();
    assert_eq!(recv(&peer).await.0, Packet::Ack { block: 1 });

    assert_ok!(transfer.await.unwrap());
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"tail");
}

#[tokio::test]
async fn error_from_peer_fails_only_this_transfer() {
    let dir = TempDir::new("engine").unwrap();
    let file = source_file(&dir, "data.bin", &pattern(600)).await;
    let peer = raw_socket();

    let session = TransferSession::new(
        Role::Source,
        raw_socket(),
        Peer::locked(peer.local_addr().unwrap()),
        file,
        test_policy(),
    );
    let transfer = tokio::spawn(session.run());

    let (_, src) = recv(&peer).await;
    let error = Packet::Error {
        code: tftp_engine::ErrorCode::AccessViolation,
        message: "disk on fire".to_string(),
    };
    peer.send(&error, src).await.unwrap();

    match assert_err!(transfer.await.unwrap()) {
        TransferError::Remote { message, .. } => assert_eq!(message, "disk on fire"),
        other => panic!("unexpected error {other:?}"),
    }
    // Remote errors are not answered.
    assert_silent(&peer, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unexpected_packet_fails_with_courtesy_error() {
    let dir = TempDir::new("engine").unwrap();
    let path = dir.path().join("received.bin");
    let file = File::create(&path).await.unwrap();
    let peer = raw_socket();

    let session = TransferSession::new(
        Role::Sink,
        raw_socket(),
        Peer::locked(peer.local_addr().unwrap()),
        file,
        test_policy(),
    );
    let transfer = tokio::spawn(session.run());

    let (_, src) = recv(&peer).await;
    peer.send(&Packet::Ack { block: 0 }, src).await.unwrap();

    assert!(matches!(
        assert_err!(transfer.await.unwrap()),
        TransferError::UnexpectedPacket(_)
    ));
    let (packet, _) = recv(&peer).await;
    assert!(matches!(
        packet,
        Packet::Error { code: tftp_engine::ErrorCode::IllegalOperation, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_numbers_wrap_past_65535() {
    let server = start_server();
    // 65537 full blocks carry the counter through 65535, 0 and 1; the short tail goes out as
    // block 2 of the second lap. An ACK matched to the wrong lap would stall the transfer.
    let len = 65_537 * 512 + 7;
    let contents = pattern(len);
    let local_dir = TempDir::new("tftp-client").unwrap();
    let upload = local_dir.path().join("huge.bin");
    tokio::fs::write(&upload, &contents).await.unwrap();

    let policy = RetryPolicy::default()
        .with_timeout(Duration::from_secs(1))
        .with_max_retries(5)
        .with_linger(Duration::from_millis(50));
    let client = Client::new(server.addr).with_policy(policy);

    let summary = assert_ok!(client.put(&upload, "huge.bin").await);
    assert_eq!(summary.blocks, 65_538);
    assert_eq!(summary.bytes, len as u64);
    assert_eq!(tokio::fs::read(server.root.path().join("huge.bin")).await.unwrap(), contents);

    let download = local_dir.path().join("huge-copy.bin");
    let summary = assert_ok!(client.get("huge.bin", &download).await);
    assert_eq!(summary.blocks, 65_538);
    assert_eq!(tokio::fs::read(&download).await.unwrap(), contents);
}
