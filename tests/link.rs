//! Link multiplexing over real TCP connections.

mod common;

use common::{WAIT, connected_pair, wait_until};
use multilink::link::StreamId;
use multilink::prelude::*;

/// Poll `stream` on `link` until `len` bytes accumulated.
fn collect_stream<T: ReliableTransport>(link: &Link<T>, stream: StreamId, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 8192];
    wait_until(WAIT, || {
        let want = (len - out.len()).min(buf.len());
        let n = link.receive_on(stream, &mut buf[..want]);
        out.extend_from_slice(&buf[..n]);
        out.len() >= len
    });
    out
}

#[test]
fn two_streams_over_tcp() {
    let (client_socket, server_socket) = connected_pair();
    let server = Link::new(server_socket);
    let client = Link::new(client_socket);

    assert!(server.send_on(0, b"Hello World!\0"));
    assert!(server.send_on(1, b"Bye World!\0"));

    assert_eq!(collect_stream(&client, 0, 13), b"Hello World!\0");
    assert_eq!(collect_stream(&client, 1, 11), b"Bye World!\0");

    client.close();
    server.close();
}

#[test]
fn reversed_receive_order_sees_identical_payloads() {
    let (client_socket, server_socket) = connected_pair();
    let server = Link::new(server_socket);
    let client = Link::new(client_socket);

    assert!(server.send_on(0, b"Hello World!\0"));
    assert!(server.send_on(1, b"Bye World!\0"));

    // Asking for stream 1 first: the parser is parked on stream 0's
    // segment, so stream 1 reads zero until stream 0 drains.
    assert_eq!(collect_stream(&client, 1, 11), b"Bye World!\0");
    assert_eq!(collect_stream(&client, 0, 13), b"Hello World!\0");

    client.close();
    server.close();
}

#[test]
fn interleaved_streams_keep_per_stream_order() {
    let (client_socket, server_socket) = connected_pair();
    let server = Link::new(server_socket);
    let client = Link::new(client_socket);

    for round in 0..32u8 {
        assert!(wait_until(WAIT, || server.send_on(4, &[round])));
        assert!(wait_until(WAIT, || server.send_on(9, &[round ^ 0xFF])));
    }

    let mut four = Vec::new();
    let mut nine = Vec::new();
    let mut buf = [0u8; 64];
    assert!(wait_until(WAIT, || {
        let n = client.receive_on(4, &mut buf);
        four.extend_from_slice(&buf[..n]);
        let n = client.receive_on(9, &mut buf);
        nine.extend_from_slice(&buf[..n]);
        four.len() == 32 && nine.len() == 32
    }));

    assert_eq!(four, (0..32u8).collect::<Vec<_>>());
    assert_eq!(nine, (0..32u8).map(|r| r ^ 0xFF).collect::<Vec<_>>());

    client.close();
    server.close();
}

#[test]
fn framed_messages_per_stream_over_tcp() {
    let (client_socket, server_socket) = connected_pair();
    let server = Link::new(server_socket);
    let client = Link::new(client_socket);

    let mut position = Message::new();
    position.push(&-80i32);
    position.push(&60i32);
    assert!(server.send_message_on(2, &position));

    let mut greeting = Message::new();
    greeting.push(&String::from("Hello World!"));
    assert!(server.send_message_on(3, &greeting));

    let mut decoded = Message::new();
    assert!(wait_until(WAIT, || {
        // Bounce between the two streams until stream 2's frame lands.
        let n = client.receive_message_on(2, &mut decoded);
        if n == 0 {
            let mut other = Message::new();
            client.receive_message_on(3, &mut other);
        }
        n > 0
    }));
    assert_eq!(decoded.pop::<i32>(), Some(-80));
    assert_eq!(decoded.pop::<i32>(), Some(60));

    assert!(wait_until(WAIT, || {
        client.receive_message_on(3, &mut decoded) > 0
    }));
    assert_eq!(decoded.pop::<String>().as_deref(), Some("Hello World!"));

    client.close();
    server.close();
}

#[test]
fn large_transfer_chunked_across_segments() {
    let (client_socket, server_socket) = connected_pair();
    let server = Link::new(server_socket);
    let client = Link::new(client_socket);

    // Two maximum-size segments plus a remainder.
    let payload: Vec<u8> = (0..150_000usize).map(|i| (i % 241) as u8).collect();
    let mut sent = 0;
    assert!(wait_until(WAIT, || {
        // The whole payload exceeds the send buffer; feed it in slices.
        while sent < payload.len() {
            let end = (sent + 32 * 1024).min(payload.len());
            if !server.send_on(11, &payload[sent..end]) {
                return false;
            }
            sent = end;
        }
        true
    }));

    assert_eq!(collect_stream(&client, 11, payload.len()), payload);

    client.close();
    server.close();
}

#[test]
fn shutdown_is_delegated_to_the_transport() {
    let (client_socket, server_socket) = connected_pair();
    let server = Link::new(server_socket);
    let client = Link::new(client_socket);

    assert!(server.send_on(0, b"bye"));
    server.shutdown();

    assert_eq!(collect_stream(&client, 0, 3), b"bye");
    assert!(wait_until(WAIT, || client.remote_has_shutdown()));
    assert!(wait_until(WAIT, || server.local_has_shutdown()));

    client.shutdown();
    assert!(wait_until(WAIT, || server.remote_has_shutdown()));

    client.close();
    server.close();
}
