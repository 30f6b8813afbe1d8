//! Datagram socket.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::reactor;
use crate::util::{HexBytes, bind_udp_socket};

/// Default aggregate receive gate for a datagram socket: 64 KiB.
pub const DEFAULT_UDP_RECEIVE_LIMIT: usize = 64 * 1024;

/// Largest datagram payload accepted or produced.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Buffer bounds for a [`UdpSocket`].
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Aggregate pending-byte level at which receiving is suspended until
    /// the application drains (default 64 KiB).
    pub receive_hard_limit: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            receive_hard_limit: DEFAULT_UDP_RECEIVE_LIMIT,
        }
    }
}

/// A bound datagram endpoint with per-peer receive queues.
///
/// Received payloads are grouped by remote endpoint and delivered in arrival
/// order per peer; across peers there is no ordering. Payload bytes of one
/// peer are concatenated, so datagram boundaries are not preserved by
/// [`receive_from`](UdpSocket::receive_from).
///
/// Sending is fire-and-forget: `send_to` queues the payload and the reactor
/// transmits it, retransmitting any kernel-truncated remainder. There is no
/// acknowledgment and no retry on loss.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    state: Mutex<UdpState>,
    /// Wakes the send driver when a datagram is queued.
    send_ready: Arc<Notify>,
    /// Wakes the recv driver when the aggregate gate reopens.
    recv_ready: Arc<Notify>,
    cancel: CancellationToken,
}

struct UdpState {
    bound: bool,
    closed: bool,
    local: Option<Endpoint>,
    send_queue: VecDeque<(SocketAddr, Bytes)>,
    peers: HashMap<Endpoint, VecDeque<u8>>,
    pending_bytes: usize,
    config: UdpConfig,
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl UdpSocket {
    /// Create an unbound socket with default limits.
    pub fn new() -> Self {
        Self::with_config(UdpConfig::default())
    }

    /// Create an unbound socket with explicit limits.
    pub fn with_config(config: UdpConfig) -> Self {
        UdpSocket {
            inner: Arc::new(UdpInner {
                state: Mutex::new(UdpState {
                    bound: false,
                    closed: false,
                    local: None,
                    send_queue: VecDeque::new(),
                    peers: HashMap::new(),
                    pending_bytes: 0,
                    config,
                }),
                send_ready: Arc::new(Notify::new()),
                recv_ready: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Bind to a local endpoint and start receiving.
    pub fn bind(&self, endpoint: Endpoint) -> Result<()> {
        self.bind_addr(SocketAddr::from(endpoint))
    }

    fn bind_addr(&self, addr: SocketAddr) -> Result<()> {
        let handle = reactor::handle().ok_or(Error::ReactorStopped)?;

        {
            let state = self.inner.state.lock().unwrap();
            if state.bound {
                return Err(Error::AlreadyConnected);
            }
            if state.closed {
                return Err(Error::io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "socket is closed",
                )));
            }
        }

        let socket = {
            let _guard = handle.enter();
            bind_udp_socket(addr).map_err(|e| Error::io_on(addr, e))?
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.local = socket.local_addr().ok().map(Endpoint::from);
            state.bound = true;
            tracing::debug!(local = ?state.local.map(|e| e.to_string()), "datagram socket bound");
        }

        let socket = Arc::new(socket);
        let weak = Arc::downgrade(&self.inner);
        handle.spawn(recv_driver(
            weak.clone(),
            socket.clone(),
            self.inner.recv_ready.clone(),
            self.inner.cancel.clone(),
        ));
        handle.spawn(send_driver(
            weak,
            socket,
            self.inner.send_ready.clone(),
            self.inner.cancel.clone(),
        ));
        Ok(())
    }

    /// Queue a datagram for `endpoint`.
    ///
    /// Binds to an ephemeral port of the target's address family when the
    /// socket is not yet bound. Oversized or empty payloads are refused.
    pub fn send_to(&self, data: &[u8], endpoint: Endpoint) -> Result<()> {
        if data.is_empty() || data.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("datagram payload of {} bytes", data.len()),
            )));
        }

        let target = SocketAddr::from(endpoint);

        let bound = self.inner.state.lock().unwrap().bound;
        if !bound {
            let wildcard: SocketAddr = if target.is_ipv6() {
                "[::]:0".parse().unwrap()
            } else {
                "0.0.0.0:0".parse().unwrap()
            };
            self.bind_addr(wildcard)?;
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(Error::io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "socket is closed",
                )));
            }
            state
                .send_queue
                .push_back((target, Bytes::copy_from_slice(data)));
        }
        self.inner.send_ready.notify_one();
        Ok(())
    }

    /// Drain up to `buf.len()` bytes queued from `endpoint`. Returns the
    /// number drained, zero when nothing is pending from that peer.
    ///
    /// Bytes of consecutive datagrams from one peer are concatenated;
    /// boundaries are not reported.
    pub fn receive_from(&self, endpoint: Endpoint, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let mut state = self.inner.state.lock().unwrap();
        let Some(queue) = state.peers.get_mut(&endpoint) else {
            return 0;
        };

        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        if queue.is_empty() {
            state.peers.remove(&endpoint);
        }

        let was_gated = state.pending_bytes >= state.config.receive_hard_limit;
        state.pending_bytes -= n;
        let reopened = was_gated && state.pending_bytes < state.config.receive_hard_limit;
        drop(state);

        if reopened {
            self.inner.recv_ready.notify_one();
        }
        n
    }

    /// Endpoints with undelivered data.
    pub fn pending_endpoints(&self) -> Vec<Endpoint> {
        self.inner.state.lock().unwrap().peers.keys().copied().collect()
    }

    /// Bytes queued from `endpoint`.
    pub fn bytes_to_receive(&self, endpoint: Endpoint) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .peers
            .get(&endpoint)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Drop all queued datagrams, re-arming a suspended receive.
    pub fn clear_buffers(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.peers.clear();
            state.pending_bytes = 0;
            state.send_queue.clear();
        }
        self.inner.recv_ready.notify_one();
    }

    /// Release the socket. Outstanding I/O is cancelled.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.bound = false;
        }
        self.inner.cancel.cancel();
    }

    /// The bound local endpoint, if any.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.state.lock().unwrap().local
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

async fn recv_driver(
    weak: Weak<UdpInner>,
    socket: Arc<tokio::net::UdpSocket>,
    recv_ready: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let gated = {
            let Some(inner) = weak.upgrade() else { return };
            let state = inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.pending_bytes >= state.config.receive_hard_limit
        };
        if gated {
            tokio::select! {
                _ = recv_ready.notified() => continue,
                _ = cancel.cancelled() => return,
            }
        }

        let result = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = cancel.cancelled() => return,
        };

        let Some(inner) = weak.upgrade() else { return };
        match result {
            Ok((n, peer)) => {
                if n == 0 {
                    continue;
                }
                let mut state = inner.state.lock().unwrap();
                state
                    .peers
                    .entry(Endpoint::from(peer))
                    .or_default()
                    .extend(buf[..n].iter().copied());
                state.pending_bytes += n;
                tracing::trace!(
                    peer = %peer,
                    bytes = n,
                    pending = state.pending_bytes,
                    head = %HexBytes(&buf[..n.min(16)]),
                    "datagram received"
                );
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                // ICMP unreachable surfacing through the socket. Ignore.
                tracing::trace!(error = %e, "transient datagram receive error");
            }
            Err(e) => {
                tracing::error!(error = %e, "datagram receive failed");
                return;
            }
        }
    }
}

async fn send_driver(
    weak: Weak<UdpInner>,
    socket: Arc<tokio::net::UdpSocket>,
    send_ready: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let Some(inner) = weak.upgrade() else { return };
            let state = inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.send_queue.front().cloned()
        };

        let Some((target, payload)) = next else {
            tokio::select! {
                _ = send_ready.notified() => continue,
                _ = cancel.cancelled() => return,
            }
        };

        let result = tokio::select! {
            r = socket.send_to(&payload, target) => r,
            _ = cancel.cancelled() => return,
        };

        let Some(inner) = weak.upgrade() else { return };
        let mut state = inner.state.lock().unwrap();
        match result {
            Ok(n) if n < payload.len() => {
                // Kernel accepted a prefix: retransmit the remainder.
                if let Some(front) = state.send_queue.front_mut() {
                    front.1 = payload.slice(n..);
                }
                tracing::debug!(target_addr = %target, sent = n, total = payload.len(), "partial datagram send");
            }
            Ok(_) => {
                state.send_queue.pop_front();
            }
            Err(e) => {
                // Datagrams are fire-and-forget: drop it and move on.
                state.send_queue.pop_front();
                tracing::debug!(target_addr = %target, error = %e, "datagram send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_from_unknown_peer_is_zero() {
        let socket = UdpSocket::new();
        let mut buf = [0u8; 4];
        let peer: Endpoint = "127.0.0.1:17002".parse().unwrap();
        assert_eq!(socket.receive_from(peer, &mut buf), 0);
        assert!(socket.pending_endpoints().is_empty());
        assert_eq!(socket.bytes_to_receive(peer), 0);
    }

    #[test]
    fn test_send_to_rejects_oversized_payload() {
        let socket = UdpSocket::new();
        let peer: Endpoint = "127.0.0.1:17002".parse().unwrap();
        let oversized = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(socket.send_to(&oversized, peer).is_err());
        assert!(socket.send_to(&[], peer).is_err());
    }
}
