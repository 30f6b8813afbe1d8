//! Loopback TCP integration tests.

mod common;

use common::{WAIT, connected_pair, receive_exact, wait_until};
use multilink::prelude::*;

#[test]
fn framed_hello_world_roundtrip() {
    let (client, server) = connected_pair();

    let mut message = Message::new();
    message.append(b"Hello World!\n");
    assert!(client.send_message(&message));

    // 4-byte length prefix plus 13 payload bytes.
    let mut received = Message::new();
    assert!(wait_until(WAIT, || server.receive_message(&mut received) == 17));
    assert_eq!(received.to_vec(), b"Hello World!\n");

    client.shutdown();
    server.shutdown();

    assert!(wait_until(WAIT, || {
        client.local_has_shutdown()
            && client.remote_has_shutdown()
            && server.local_has_shutdown()
            && server.remote_has_shutdown()
    }));

    assert_eq!(client.bytes_to_send(), 0);
    assert_eq!(server.bytes_to_send(), 0);
    client.close();
    server.close();
}

#[test]
fn byte_integrity_across_many_sends() {
    let (client, server) = connected_pair();

    // A few dozen variable-sized blocks; receives must yield the exact
    // concatenation.
    let mut expected = Vec::new();
    let mut block = Vec::new();
    for i in 0..48usize {
        block.clear();
        block.extend((0..(i * 131) % 4096 + 1).map(|j| ((i * 7 + j * 13) % 251) as u8));
        assert!(wait_until(WAIT, || client.send(&block)));
        expected.extend_from_slice(&block);
    }

    let received = receive_exact(&server, expected.len());
    assert_eq!(received, expected);
}

#[test]
fn send_rejected_at_hard_limit_and_queue_unchanged() {
    common::init();

    // An unconnected socket has no driver draining its queue, which makes
    // the flow-control arithmetic exact.
    let client = TcpSocket::with_config(TransportConfig {
        send_hard_limit: 1024,
        ..TransportConfig::default()
    });

    assert!(client.send(&[1u8; 1000]));
    assert!(!client.send(&[2u8; 25]));
    assert_eq!(client.bytes_to_send(), 1000, "rejected send altered the queue");
    assert!(client.send(&[3u8; 24]));
    assert_eq!(client.bytes_to_send(), 1024);
    assert!(!client.send(&[4u8; 1]));

    // On a live connection the invariant holds under drain races: the queue
    // gauge never exceeds the hard limit.
    let (connected, server) = connected_pair();
    let mut refused = false;
    let payload = vec![0u8; 64 * 1024];
    for _ in 0..64 {
        if !connected.send(&payload) {
            refused = true;
            break;
        }
        assert!(connected.bytes_to_send() <= 128 * 1024);
    }
    // 4 MiB dwarfs the loopback socket buffers plus the peer's 128 KiB
    // receive queue, so at least one send must have been refused.
    assert!(refused, "hard limit never refused a send");

    connected.clear_buffers();
    connected.close();
    server.close();
}

#[test]
fn half_close_is_monotonic_and_send_refused() {
    let (client, server) = connected_pair();

    assert!(client.send(b"last words"));
    client.shutdown();
    assert!(!client.send(b"too late"));

    assert!(wait_until(WAIT, || client.local_has_shutdown()));
    assert!(wait_until(WAIT, || server.remote_has_shutdown()));

    // The bytes sent before the FIN still arrive.
    let received = receive_exact(&server, 10);
    assert_eq!(received, b"last words");

    // Predicates never revert.
    assert!(client.local_has_shutdown());
    assert!(server.remote_has_shutdown());

    server.shutdown();
    assert!(wait_until(WAIT, || client.remote_has_shutdown()));
    client.close();
    server.close();
}

#[test]
fn graceful_shutdown_with_pending_bytes() {
    let (client, server) = connected_pair();

    // 100 KiB queued, shutdown requested immediately: the FIN must trail
    // the data.
    let payload: Vec<u8> = (0..100 * 1024).map(|i| (i % 239) as u8).collect();
    assert!(client.send(&payload));
    client.shutdown();

    let received = receive_exact(&server, payload.len());
    assert_eq!(received, payload);
    assert!(wait_until(WAIT, || server.remote_has_shutdown()));

    server.shutdown();
    assert!(wait_until(WAIT, || {
        client.local_has_shutdown()
            && client.remote_has_shutdown()
            && server.local_has_shutdown()
            && server.remote_has_shutdown()
    }));

    assert_eq!(client.bytes_to_send(), 0);
    assert_eq!(client.bytes_to_receive(), 0);
    assert_eq!(server.bytes_to_send(), 0);
    assert_eq!(server.bytes_to_receive(), 0);
    client.close();
    server.close();
}

#[test]
fn receive_backpressure_suspends_and_resumes() {
    common::init();

    // Accepted sockets inherit the listener's limits.
    let listener = TcpListener::with_config(TransportConfig {
        receive_hard_limit: 2048,
        ..TransportConfig::default()
    });
    listener
        .listen(Endpoint::new("127.0.0.1".parse().unwrap(), 0), 8)
        .unwrap();

    let client = TcpSocket::new();
    client.connect(listener.local_endpoint().unwrap()).unwrap();
    let mut server = None;
    assert!(wait_until(WAIT, || {
        if server.is_none() {
            server = listener.accept();
        }
        server.is_some() && client.is_connected()
    }));
    listener.close();
    let server = server.unwrap();

    let payload = vec![7u8; 16 * 1024];
    assert!(client.send(&payload));

    // The receive queue caps at its hard limit while undrained.
    assert!(wait_until(WAIT, || server.bytes_to_receive() == 2048));
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(server.bytes_to_receive() <= 2048);

    // Draining reopens the gate and the rest flows through.
    let received = receive_exact(&server, payload.len());
    assert_eq!(received, payload);

    client.close();
    server.close();
}

#[test]
fn linger_and_keepalive_pass_through() {
    let (client, server) = connected_pair();

    client.set_keep_alive(true).unwrap();
    assert!(client.keep_alive());
    client.set_keep_alive(false).unwrap();
    assert!(!client.keep_alive());

    client.set_linger(3).unwrap();
    assert_eq!(client.linger(), 3);
    client.set_linger(0).unwrap();
    assert_eq!(client.linger(), 0);

    client.close();
    server.close();
}
