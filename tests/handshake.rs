//! End-to-end scenarios driven against a real `tokio::net::TcpListener`
//! standing in for the server, exercising the public `Client` facade rather
//! than the internal codec (that's covered by the unit tests in `message.rs`
//! and friends). Message bytes here are hand-encoded against the wire
//! layout in `SPEC_FULL.md` §4, not produced by the crate itself, so a
//! mismatch would be caught the same way a real server's bytes would be.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use entrysync::{
    BackoffConfig, Client, ClientConfig, ClientEvent, EntryFlags, EntryType, EntryValue,
    SessionState,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn handshake_and_initial_assignment_populate_table() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut hello = [0u8; 4];
        socket.read_exact(&mut hello).await.unwrap();
        assert_eq!(hello, [0x01, 0x03, 0x00, 0x00]);

        // SERVER_HELLO: client not previously seen, identity "ABC".
        socket
            .write_all(&[0x04, 0x00, 0x03, b'A', b'B', b'C'])
            .await
            .unwrap();
        // ENTRY_ASSIGNMENT: name "abc", BOOLEAN, id 42, seq 1, flags 0, value true.
        socket
            .write_all(&[
                0x10, 0x03, b'a', b'b', b'c', 0x00, 0x00, 0x2A, 0x00, 0x01, 0x00, 0x01,
            ])
            .await
            .unwrap();
        // SERVER_HELLO_COMPLETE
        socket.write_all(&[0x03]).await.unwrap();

        let mut complete = [0u8; 1];
        socket.read_exact(&mut complete).await.unwrap();
        assert_eq!(complete, [0x05]);

        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let mut config = ClientConfig::new("127.0.0.1");
    config.server_port = port;
    config.reconnect = false;

    let (client, _events) = Client::connect(config).await.unwrap();

    let entries = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let entries = client.entries().await.unwrap();
            if !entries.is_empty() {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("entry never arrived");

    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.name, "abc");
    assert_eq!(entry.id, 42);
    assert_eq!(entry.seq, 1);
    assert_eq!(entry.entry_type, EntryType::Boolean);
    assert_eq!(entry.value, EntryValue::Boolean(true));

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn proto_version_unsupported_is_terminal_and_not_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accept_count = Arc::new(AtomicUsize::new(0));
    let accept_count2 = accept_count.clone();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        accept_count2.fetch_add(1, Ordering::SeqCst);

        let mut hello = [0u8; 4];
        socket.read_exact(&mut hello).await.unwrap();

        // PROTO_VERSION_UNSUPPORTED: server speaks 4.0.
        socket.write_all(&[0x02, 0x04, 0x00]).await.unwrap();
        drop(socket);

        // A reconnect would show up as a second accepted connection; none
        // should arrive because a version rejection is terminal regardless
        // of the client's reconnect setting.
        let second = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(
            second.is_err(),
            "client reconnected after a version rejection"
        );
    });

    let mut config = ClientConfig::new("127.0.0.1");
    config.server_port = port;
    config.reconnect = true;

    let (client, mut events) = Client::connect(config).await.unwrap();

    let saw_disconnected = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::ConnectionStateChanged(SessionState::Disconnected) = event {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(saw_disconnected);

    client.close().await;
    server.await.unwrap();
    assert_eq!(accept_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn set_entry_for_new_name_proposes_with_unassigned_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut hello = [0u8; 4];
        socket.read_exact(&mut hello).await.unwrap();

        socket.write_all(&[0x04, 0x00, 0x00]).await.unwrap(); // SERVER_HELLO, empty identity
        socket.write_all(&[0x03]).await.unwrap(); // SERVER_HELLO_COMPLETE

        let mut complete = [0u8; 1];
        socket.read_exact(&mut complete).await.unwrap();
        assert_eq!(complete, [0x05]);

        // ENTRY_ASSIGNMENT proposal for "temp": BOOLEAN, id UNASSIGNED,
        // seq 1, flags 0, value true.
        let mut proposal = [0u8; 13];
        socket.read_exact(&mut proposal).await.unwrap();
        assert_eq!(
            proposal,
            [
                0x10, 0x04, b't', b'e', b'm', b'p', 0x00, 0xFF, 0xFF, 0x00, 0x01, 0x00, 0x01,
            ]
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let mut config = ClientConfig::new("127.0.0.1");
    config.server_port = port;
    config.reconnect = false;

    let (client, _events) = Client::connect(config).await.unwrap();

    client
        .set_entry(
            "temp",
            EntryType::Boolean,
            EntryValue::Boolean(true),
            EntryFlags::default(),
        )
        .await
        .unwrap();

    client.close().await;
    server.await.unwrap();
}

/// S5: after an unexpected drop, the reconnected session's first outbound
/// bytes are exactly a fresh CLIENT_HELLO — no replay of the entry proposal
/// the client queued before the connection was severed.
#[tokio::test]
async fn reconnect_burst_does_not_replay_prior_client_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // First connection: complete the handshake, read the queued
        // proposal, then drop the socket to simulate an unexpected close.
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut hello = [0u8; 4];
        socket.read_exact(&mut hello).await.unwrap();
        assert_eq!(hello, [0x01, 0x03, 0x00, 0x00]);
        socket.write_all(&[0x04, 0x00, 0x00]).await.unwrap(); // SERVER_HELLO
        socket.write_all(&[0x03]).await.unwrap(); // SERVER_HELLO_COMPLETE
        let mut complete = [0u8; 1];
        socket.read_exact(&mut complete).await.unwrap();
        assert_eq!(complete, [0x05]);
        let mut proposal = [0u8; 13];
        socket.read_exact(&mut proposal).await.unwrap();
        drop(socket);

        // Second connection: the only bytes that should arrive are a fresh
        // CLIENT_HELLO, with nothing else queued up behind it.
        let (mut socket2, _) = listener.accept().await.unwrap();
        let mut hello2 = [0u8; 4];
        socket2.read_exact(&mut hello2).await.unwrap();
        assert_eq!(hello2, [0x01, 0x03, 0x00, 0x00]);

        let mut trailing = [0u8; 1];
        let saw_more = tokio::time::timeout(
            Duration::from_millis(150),
            socket2.read_exact(&mut trailing),
        )
        .await;
        assert!(
            saw_more.is_err(),
            "expected no further bytes before the client's handshake completes"
        );

        socket2.write_all(&[0x04, 0x01, 0x00]).await.unwrap(); // SERVER_HELLO, previously seen
        socket2.write_all(&[0x03]).await.unwrap();
        let mut complete2 = [0u8; 1];
        socket2.read_exact(&mut complete2).await.unwrap();
        assert_eq!(complete2, [0x05]);
    });

    let mut config = ClientConfig::new("127.0.0.1");
    config.server_port = port;
    config.reconnect = true;
    config.reconnect_backoff = BackoffConfig {
        initial: Duration::from_millis(10),
        cap: Duration::from_millis(50),
        factor: 2.0,
        jitter: 0.0,
    };

    let (client, mut events) = Client::connect(config).await.unwrap();

    client
        .set_entry(
            "temp",
            EntryType::Boolean,
            EntryValue::Boolean(true),
            EntryFlags::default(),
        )
        .await
        .unwrap();

    // Wait for the client to observe the drop and come back Ready again.
    let reconnected = tokio::time::timeout(Duration::from_secs(2), async {
        let mut saw_disconnected = false;
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::ConnectionStateChanged(SessionState::Disconnected) => {
                    saw_disconnected = true;
                }
                ClientEvent::ConnectionStateChanged(SessionState::Ready) if saw_disconnected => {
                    return true;
                }
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(reconnected, "client never reconnected to Ready");

    client.close().await;
    server.await.unwrap();
}
