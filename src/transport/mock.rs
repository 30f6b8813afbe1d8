//! In-memory transport pair for tests.
//!
//! [`MockTransport::pair`] yields two connected ends of a loopback byte
//! stream that honors the full [`ReliableTransport`] contract (ordering,
//! buffer limits, half-close) without touching the network or the reactor.
//! Delivery is synchronous and deterministic: bytes move to the peer's
//! receive queue during `send`, `shutdown` and the peer's drains.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{ReliableTransport, StreamQueues, TransportConfig};

/// One end of an in-memory connected pair.
pub struct MockTransport {
    shared: Arc<MockShared>,
    side: usize,
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        MockTransport {
            shared: self.shared.clone(),
            side: self.side,
        }
    }
}

struct MockShared {
    // One lock for both sides keeps cross-side delivery atomic.
    state: Mutex<[SideState; 2]>,
    events: [Arc<Notify>; 2],
}

struct SideState {
    queues: StreamQueues,
    connected: bool,
    fin_requested: bool,
    fin_sent: bool,
    fin_received: bool,
    closed: bool,
}

impl SideState {
    fn new(config: TransportConfig) -> Self {
        SideState {
            queues: StreamQueues::new(config),
            connected: true,
            fin_requested: false,
            fin_sent: false,
            fin_received: false,
            closed: false,
        }
    }
}

impl MockTransport {
    /// Create a connected pair with default limits.
    pub fn pair() -> (MockTransport, MockTransport) {
        Self::pair_with_config(TransportConfig::default())
    }

    /// Create a connected pair with explicit limits on both ends.
    pub fn pair_with_config(config: TransportConfig) -> (MockTransport, MockTransport) {
        let shared = Arc::new(MockShared {
            state: Mutex::new([SideState::new(config.clone()), SideState::new(config)]),
            events: [Arc::new(Notify::new()), Arc::new(Notify::new())],
        });
        (
            MockTransport {
                shared: shared.clone(),
                side: 0,
            },
            MockTransport { shared, side: 1 },
        )
    }

    /// Move bytes from `from`'s send queue into the peer's receive queue and
    /// propagate a drained half-close.
    fn deliver(state: &mut [SideState; 2], from: usize) -> bool {
        let (sender, receiver) = if from == 0 {
            let (a, b) = state.split_at_mut(1);
            (&mut a[0], &mut b[0])
        } else {
            let (a, b) = state.split_at_mut(1);
            (&mut b[0], &mut a[0])
        };

        let mut progressed = false;
        let n = receiver.queues.receive_room().min(sender.queues.send.len());
        if n > 0 {
            let bytes: Vec<u8> = sender.queues.send.drain(..n).collect();
            receiver.queues.push_received(&bytes);
            progressed = true;
        }
        if sender.queues.send.is_empty() && sender.fin_requested && !sender.fin_sent {
            sender.fin_sent = true;
            receiver.fin_received = true;
            progressed = true;
        }
        progressed
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut [SideState; 2], usize) -> R) -> R {
        let mut state = self.shared.state.lock().unwrap();
        f(&mut state, self.side)
    }

    fn notify_peer(&self) {
        self.shared.events[1 - self.side].notify_one();
    }
}

impl ReliableTransport for MockTransport {
    fn connect(&self, _endpoint: Endpoint) -> Result<()> {
        // Pairs are born connected.
        Err(Error::AlreadyConnected)
    }

    fn is_connected(&self) -> bool {
        self.with_state(|state, side| state[side].connected)
    }

    fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let accepted = self.with_state(|state, side| {
            let me = &mut state[side];
            if me.closed || me.fin_requested || !me.queues.send_fits(data.len()) {
                return false;
            }
            me.queues.enqueue_send(data);
            Self::deliver(state, side);
            true
        });
        if accepted {
            self.notify_peer();
        }
        accepted
    }

    fn receive(&self, buf: &mut [u8]) -> usize {
        let n = self.with_state(|state, side| {
            let n = state[side].queues.dequeue_receive(buf);
            // Freed room lets the peer's backlog through.
            Self::deliver(state, 1 - side);
            n
        });
        if n > 0 {
            self.shared.events[self.side].notify_one();
        }
        n
    }

    fn send_message(&self, message: &Message) -> bool {
        let oversized = self.with_state(|state, side| {
            message.len() > state[side].queues.config.maximum_block_size
        });
        if oversized {
            tracing::warn!(size = message.len(), "message exceeds maximum block size");
            return false;
        }
        self.send(&StreamQueues::frame(message))
    }

    fn receive_message(&self, message: &mut Message) -> usize {
        self.with_state(|state, side| {
            let consumed = state[side].queues.dequeue_frame(message);
            Self::deliver(state, 1 - side);
            consumed
        })
    }

    fn shutdown(&self) {
        self.with_state(|state, side| {
            if !state[side].fin_requested {
                state[side].fin_requested = true;
                Self::deliver(state, side);
            }
        });
        self.notify_peer();
    }

    fn local_has_shutdown(&self) -> bool {
        self.with_state(|state, side| state[side].fin_sent)
    }

    fn remote_has_shutdown(&self) -> bool {
        self.with_state(|state, side| state[side].fin_received)
    }

    fn bytes_to_send(&self) -> usize {
        self.with_state(|state, side| state[side].queues.send.len())
    }

    fn bytes_to_receive(&self) -> usize {
        self.with_state(|state, side| state[side].queues.receive.len())
    }

    fn can_send(&self, len: usize) -> bool {
        self.with_state(|state, side| {
            let me = &state[side];
            !me.closed && !me.fin_requested && me.queues.send_fits(len)
        })
    }

    fn clear_buffers(&self) {
        self.with_state(|state, side| {
            state[side].queues.clear();
            Self::deliver(state, 1 - side);
        });
    }

    fn close(&self) {
        self.with_state(|state, side| {
            if state[side].closed {
                return;
            }
            if !state[side].queues.send.is_empty() {
                tracing::warn!(
                    unsent = state[side].queues.send.len(),
                    "closing with unsent data"
                );
            }
            state[side].closed = true;
            state[side].connected = false;
            // The peer observes end-of-stream.
            state[1 - side].fin_received = true;
        });
        self.notify_peer();
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        None
    }

    fn remote_endpoint(&self) -> Option<Endpoint> {
        None
    }

    fn events(&self) -> Arc<Notify> {
        self.shared.events[self.side].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_moves_bytes_in_order() {
        let (a, b) = MockTransport::pair();
        assert!(a.send(b"hello "));
        assert!(a.send(b"world"));

        let mut buf = [0u8; 32];
        let n = b.receive(&mut buf);
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(b.receive(&mut buf), 0);
    }

    #[test]
    fn test_framed_message_roundtrip() {
        let (a, b) = MockTransport::pair();
        let mut message = Message::new();
        message.append(b"Hello World!\n");
        assert!(a.send_message(&message));

        let mut received = Message::new();
        assert_eq!(b.receive_message(&mut received), 17);
        assert_eq!(received.to_vec(), b"Hello World!\n");
    }

    #[test]
    fn test_half_close_after_drain() {
        let (a, b) = MockTransport::pair();
        assert!(a.send(b"tail"));
        a.shutdown();
        assert!(a.local_has_shutdown());
        assert!(b.remote_has_shutdown());
        assert!(!a.send(b"more"));

        let mut buf = [0u8; 8];
        assert_eq!(b.receive(&mut buf), 4);
        assert_eq!(&buf[..4], b"tail");
    }

    #[test]
    fn test_fin_waits_for_receiver_backpressure() {
        let config = TransportConfig {
            receive_hard_limit: 4,
            ..TransportConfig::default()
        };
        let (a, b) = MockTransport::pair_with_config(config);
        assert!(a.send(b"12345678"));
        a.shutdown();

        // Receiver still holds undelivered bytes: FIN not yet through.
        assert!(!a.local_has_shutdown());

        let mut buf = [0u8; 8];
        let mut got = Vec::new();
        while got.len() < 8 {
            let n = b.receive(&mut buf);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"12345678");
        assert!(a.local_has_shutdown());
        assert!(b.remote_has_shutdown());
    }

    #[test]
    fn test_flow_control_rejects_overflow() {
        let config = TransportConfig {
            send_hard_limit: 4,
            receive_hard_limit: 2,
            ..TransportConfig::default()
        };
        let (a, _b) = MockTransport::pair_with_config(config);
        // 2 delivered to the peer, 2 parked in the send queue.
        assert!(a.send(b"abcd"));
        assert_eq!(a.bytes_to_send(), 2);
        assert!(!a.send(b"efg"));
        assert!(a.send(b"ef"));
    }
}
