//! Shared test utilities for multilink integration tests.

// Allow dead code since not all test files use all utilities.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use multilink::prelude::*;

/// Generous bound for loopback I/O to settle.
pub const WAIT: Duration = Duration::from_secs(5);

/// Install the tracing subscriber and start the shared reactor.
///
/// Every test calls this first; both steps are idempotent. Tests never stop
/// the reactor (reactor lifecycle has its own integration binary, isolated
/// by running in its own process).
pub fn init() {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    multilink::reactor::start(2);
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Listener bound to an ephemeral loopback port.
pub fn loopback_listener() -> (TcpListener, Endpoint) {
    let listener = TcpListener::new();
    listener
        .listen("127.0.0.1:0".parse().unwrap(), 16)
        .expect("listen on loopback");
    let endpoint = listener.local_endpoint().expect("bound endpoint");
    (listener, endpoint)
}

/// A connected loopback (client, server) socket pair.
pub fn connected_pair() -> (TcpSocket, TcpSocket) {
    init();
    let (listener, endpoint) = loopback_listener();

    let client = TcpSocket::new();
    client.connect(endpoint).expect("initiate connect");

    let mut accepted = None;
    assert!(
        wait_until(WAIT, || {
            if accepted.is_none() {
                accepted = listener.accept();
            }
            accepted.is_some() && client.is_connected()
        }),
        "loopback connection did not establish"
    );
    listener.close();
    (client, accepted.unwrap())
}

/// Drain `transport` until `len` bytes arrived or the wait expires.
pub fn receive_exact<T: ReliableTransport>(transport: &T, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 8192];
    wait_until(WAIT, || {
        let want = (len - out.len()).min(buf.len());
        if want > 0 {
            let n = transport.receive(&mut buf[..want]);
            out.extend_from_slice(&buf[..n]);
        }
        out.len() >= len
    });
    out
}
