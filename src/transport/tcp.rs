//! Buffered TCP socket.
//!
//! [`TcpSocket`] is a reliable byte-stream transport with bounded send and
//! receive queues, half-close semantics and non-blocking thread-safe calls.
//!
//! # Architecture
//!
//! ```text
//! application threads            reactor pool
//! ------------------             ---------------------------
//! send() ──► send queue ──────► send driver ──► kernel
//! receive() ◄── receive queue ◄─ recv driver ◄── kernel
//! ```
//!
//! The application-facing half enqueues and dequeues under the socket's
//! state mutex and never blocks. Two driver tasks per connection move bytes
//! between the queues and the kernel: the send driver keeps at most one
//! write outstanding and, once the queue drains with a shutdown requested,
//! performs the shutdown-for-send; the recv driver posts reads only while
//! the receive queue is below its hard limit. Both drivers hold a weak
//! reference to the socket, so dropping every handle turns pending
//! completions into no-ops.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::reactor;
use crate::transport::{ReliableTransport, StreamQueues, TransportConfig};

/// Size of the scratch block moved per driver iteration.
const IO_CHUNK: usize = 8192;

/// A reliable byte-stream socket over TCP.
///
/// Cheap to clone; all clones refer to the same connection. See the
/// [`ReliableTransport`] trait for the data-path contract.
///
/// # Example
///
/// ```rust,no_run
/// use multilink::reactor;
/// use multilink::transport::{ReliableTransport, TcpSocket};
///
/// reactor::start(2);
/// let socket = TcpSocket::new();
/// socket.connect("127.0.0.1:17001".parse().unwrap()).unwrap();
/// while !socket.is_connected() {
///     std::thread::sleep(std::time::Duration::from_millis(1));
/// }
/// socket.send(b"hello");
/// ```
#[derive(Clone)]
pub struct TcpSocket {
    inner: Arc<TcpInner>,
}

pub(crate) struct TcpInner {
    state: Mutex<TcpState>,
    /// Wakes the send driver: data queued or shutdown requested.
    send_ready: Arc<Notify>,
    /// Wakes the recv driver: queue drained below the hard limit.
    recv_ready: Arc<Notify>,
    /// Progress notification for layered consumers.
    events: Arc<Notify>,
    cancel: CancellationToken,
}

struct TcpState {
    queues: StreamQueues,
    connected: bool,
    connecting: bool,
    fin_requested: bool,
    fin_sent: bool,
    fin_received: bool,
    closed: bool,
    local: Option<Endpoint>,
    remote: Option<Endpoint>,
    /// Duplicate descriptor for option pass-through while the halves live
    /// in the drivers.
    raw: Option<std::net::TcpStream>,
    linger_seconds: Option<u32>,
    keep_alive: Option<bool>,
}

impl Drop for TcpInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TcpSocket {
    /// Create an unconnected socket with default buffer limits.
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    /// Create an unconnected socket with explicit buffer limits.
    pub fn with_config(config: TransportConfig) -> Self {
        TcpSocket {
            inner: Arc::new(TcpInner {
                state: Mutex::new(TcpState {
                    queues: StreamQueues::new(config),
                    connected: false,
                    connecting: false,
                    fin_requested: false,
                    fin_sent: false,
                    fin_received: false,
                    closed: false,
                    local: None,
                    remote: None,
                    raw: None,
                    linger_seconds: None,
                    keep_alive: None,
                }),
                send_ready: Arc::new(Notify::new()),
                recv_ready: Arc::new(Notify::new()),
                events: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Wrap a connection accepted by a listener.
    pub(crate) fn from_accepted(stream: TcpStream, config: TransportConfig) -> Self {
        let socket = Self::with_config(config);
        TcpInner::attach(&socket.inner, stream);
        socket
    }

    /// SO_LINGER timeout in seconds, zero when disabled.
    pub fn linger(&self) -> u32 {
        let state = self.inner.state.lock().unwrap();
        if let Some(raw) = &state.raw {
            match socket2::SockRef::from(raw).linger() {
                Ok(linger) => return linger.map(|d| d.as_secs() as u32).unwrap_or(0),
                Err(e) => tracing::error!(error = %e, "querying SO_LINGER failed"),
            }
        }
        state.linger_seconds.unwrap_or(0)
    }

    /// Set SO_LINGER, zero seconds to disable. Applied immediately on a
    /// live connection, otherwise stored and applied at connect time.
    pub fn set_linger(&self, seconds: u32) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.linger_seconds = Some(seconds);
        if let Some(raw) = &state.raw {
            let timeout = (seconds > 0).then(|| Duration::from_secs(u64::from(seconds)));
            socket2::SockRef::from(raw)
                .set_linger(timeout)
                .map_err(Error::io)?;
        }
        Ok(())
    }

    /// Whether SO_KEEPALIVE is enabled.
    pub fn keep_alive(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        if let Some(raw) = &state.raw {
            match socket2::SockRef::from(raw).keepalive() {
                Ok(enabled) => return enabled,
                Err(e) => tracing::error!(error = %e, "querying SO_KEEPALIVE failed"),
            }
        }
        state.keep_alive.unwrap_or(false)
    }

    /// Enable or disable SO_KEEPALIVE. Applied immediately on a live
    /// connection, otherwise stored and applied at connect time.
    pub fn set_keep_alive(&self, enabled: bool) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.keep_alive = Some(enabled);
        if let Some(raw) = &state.raw {
            socket2::SockRef::from(raw)
                .set_keepalive(enabled)
                .map_err(Error::io)?;
        }
        Ok(())
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpInner {
    /// Take ownership of an established stream and start the drivers.
    fn attach(inner: &Arc<TcpInner>, stream: TcpStream) {
        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "detaching accepted stream failed");
                return;
            }
        };

        {
            let state = inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            let sock = socket2::SockRef::from(&std_stream);
            if let Some(seconds) = state.linger_seconds {
                let timeout = (seconds > 0).then(|| Duration::from_secs(u64::from(seconds)));
                if let Err(e) = sock.set_linger(timeout) {
                    tracing::error!(error = %e, "applying SO_LINGER failed");
                }
            }
            if let Some(enabled) = state.keep_alive {
                if let Err(e) = sock.set_keepalive(enabled) {
                    tracing::error!(error = %e, "applying SO_KEEPALIVE failed");
                }
            }
        }

        let raw = std_stream.try_clone().ok();
        let stream = match TcpStream::from_std(std_stream) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "registering stream with the reactor failed");
                return;
            }
        };

        {
            let mut state = inner.state.lock().unwrap();
            state.local = stream.local_addr().ok().map(Endpoint::from);
            state.remote = stream.peer_addr().ok().map(Endpoint::from);
            state.connected = true;
            state.connecting = false;
            state.fin_requested = false;
            state.fin_sent = false;
            state.fin_received = false;
            state.raw = raw;
            tracing::debug!(
                local = ?state.local.map(|e| e.to_string()),
                remote = ?state.remote.map(|e| e.to_string()),
                "connection established"
            );
        }

        let (read_half, write_half) = stream.into_split();
        let weak = Arc::downgrade(inner);
        reactor::spawn(recv_driver(
            weak.clone(),
            read_half,
            inner.recv_ready.clone(),
            inner.events.clone(),
            inner.cancel.clone(),
        ));
        reactor::spawn(send_driver(
            weak,
            write_half,
            inner.send_ready.clone(),
            inner.events.clone(),
            inner.cancel.clone(),
        ));

        inner.events.notify_one();
    }
}

/// Errors that terminate the connection rather than a single operation.
fn is_reset(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::TimedOut
    )
}

async fn recv_driver(
    weak: Weak<TcpInner>,
    mut read_half: OwnedReadHalf,
    recv_ready: Arc<Notify>,
    events: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut chunk = [0u8; IO_CHUNK];

    loop {
        let room = {
            let Some(inner) = weak.upgrade() else { return };
            let state = inner.state.lock().unwrap();
            if state.closed || state.fin_received {
                return;
            }
            state.queues.receive_room()
        };

        // Suspended until a receive() drains back below the hard limit.
        if room == 0 {
            tokio::select! {
                _ = recv_ready.notified() => continue,
                _ = cancel.cancelled() => return,
            }
        }

        let result = tokio::select! {
            r = read_half.read(&mut chunk[..room.min(IO_CHUNK)]) => r,
            _ = cancel.cancelled() => return,
        };

        let Some(inner) = weak.upgrade() else { return };
        match result {
            Ok(0) => {
                let mut state = inner.state.lock().unwrap();
                state.fin_received = true;
                tracing::debug!(remote = ?state.remote.map(|e| e.to_string()), "peer half-closed");
                drop(state);
                events.notify_one();
                return;
            }
            Ok(n) => {
                let mut state = inner.state.lock().unwrap();
                state.queues.push_received(&chunk[..n]);
                drop(state);
                events.notify_one();
            }
            Err(e) if is_reset(&e) => {
                let mut state = inner.state.lock().unwrap();
                state.fin_received = true;
                state.fin_sent = true;
                state.connected = false;
                state.queues.send.clear();
                tracing::debug!(error = %e, "connection reset while receiving");
                drop(state);
                events.notify_one();
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "receive failed");
                return;
            }
        }
    }
}

async fn send_driver(
    weak: Weak<TcpInner>,
    mut write_half: OwnedWriteHalf,
    send_ready: Arc<Notify>,
    events: Arc<Notify>,
    cancel: CancellationToken,
) {
    enum Work {
        Write(Vec<u8>),
        Fin,
        Idle,
    }

    loop {
        let work = {
            let Some(inner) = weak.upgrade() else { return };
            let state = inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            if !state.queues.send.is_empty() {
                let n = state.queues.send.len().min(IO_CHUNK);
                Work::Write(state.queues.send.iter().take(n).copied().collect())
            } else if state.fin_requested && !state.fin_sent {
                Work::Fin
            } else {
                Work::Idle
            }
        };

        match work {
            Work::Idle => {
                tokio::select! {
                    _ = send_ready.notified() => {}
                    _ = cancel.cancelled() => return,
                }
            }
            Work::Write(block) => {
                let result = tokio::select! {
                    r = write_half.write(&block) => r,
                    _ = cancel.cancelled() => return,
                };
                let Some(inner) = weak.upgrade() else { return };
                match result {
                    Ok(n) => {
                        let mut state = inner.state.lock().unwrap();
                        state.queues.consume_sent(n);
                        drop(state);
                        events.notify_one();
                    }
                    Err(e) if is_reset(&e) => {
                        let mut state = inner.state.lock().unwrap();
                        state.fin_sent = true;
                        state.fin_received = true;
                        state.connected = false;
                        tracing::debug!(error = %e, "connection reset while sending");
                        drop(state);
                        events.notify_one();
                        return;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "send failed");
                        return;
                    }
                }
            }
            Work::Fin => {
                let result = tokio::select! {
                    r = write_half.shutdown() => r,
                    _ = cancel.cancelled() => return,
                };
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                match result {
                    Ok(()) => {
                        state.fin_sent = true;
                        tracing::debug!("local half-close completed");
                    }
                    Err(e) => {
                        state.fin_sent = true;
                        if is_reset(&e) {
                            state.fin_received = true;
                            state.connected = false;
                        }
                        tracing::debug!(error = %e, "shutdown for send failed");
                    }
                }
                drop(state);
                events.notify_one();
                return;
            }
        }
    }
}

impl ReliableTransport for TcpSocket {
    fn connect(&self, endpoint: Endpoint) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.connected || state.connecting {
                return Err(Error::AlreadyConnected);
            }
            // close() is terminal: the drivers are gone for good.
            if state.closed {
                return Err(Error::io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "socket is closed",
                )));
            }
            state.queues.clear();
            state.fin_requested = false;
            state.fin_sent = false;
            state.fin_received = false;
            state.connecting = true;
        }

        let weak = Arc::downgrade(&self.inner);
        let events = self.inner.events.clone();
        let addr = SocketAddr::from(endpoint);

        let spawned = reactor::spawn(async move {
            let result = TcpStream::connect(addr).await;
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(stream) => TcpInner::attach(&inner, stream),
                Err(e) => {
                    let mut state = inner.state.lock().unwrap();
                    state.connecting = false;
                    if is_reset(&e) {
                        state.fin_sent = true;
                        state.fin_received = true;
                    }
                    tracing::error!(target_addr = %addr, error = %e, "connect failed");
                    drop(state);
                    events.notify_one();
                }
            }
        });

        if !spawned {
            self.inner.state.lock().unwrap().connecting = false;
            return Err(Error::ReactorStopped);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().connected
    }

    fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.closed || state.fin_requested {
            tracing::warn!("send refused after shutdown");
            return false;
        }
        if !state.queues.send_fits(data.len()) {
            return false;
        }
        state.queues.enqueue_send(data);
        drop(state);
        self.inner.send_ready.notify_one();
        true
    }

    fn receive(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let n = {
            let mut state = self.inner.state.lock().unwrap();
            state.queues.dequeue_receive(buf)
        };
        if n > 0 {
            self.inner.recv_ready.notify_one();
        }
        n
    }

    fn send_message(&self, message: &Message) -> bool {
        {
            let state = self.inner.state.lock().unwrap();
            if message.len() > state.queues.config.maximum_block_size {
                tracing::warn!(
                    size = message.len(),
                    maximum = state.queues.config.maximum_block_size,
                    "message exceeds maximum block size"
                );
                return false;
            }
        }
        self.send(&StreamQueues::frame(message))
    }

    fn receive_message(&self, message: &mut Message) -> usize {
        let consumed = {
            let mut state = self.inner.state.lock().unwrap();
            state.queues.dequeue_frame(message)
        };
        if consumed > 0 {
            self.inner.recv_ready.notify_one();
        }
        consumed
    }

    fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.connected {
                tracing::warn!("cannot shut down an unconnected socket");
                return;
            }
            if state.fin_requested || state.fin_sent {
                return;
            }
            state.fin_requested = true;
        }
        self.inner.send_ready.notify_one();
    }

    fn local_has_shutdown(&self) -> bool {
        self.inner.state.lock().unwrap().fin_sent
    }

    fn remote_has_shutdown(&self) -> bool {
        self.inner.state.lock().unwrap().fin_received
    }

    fn bytes_to_send(&self) -> usize {
        self.inner.state.lock().unwrap().queues.send.len()
    }

    fn bytes_to_receive(&self) -> usize {
        self.inner.state.lock().unwrap().queues.receive.len()
    }

    fn can_send(&self, len: usize) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.closed && !state.fin_requested && state.queues.send_fits(len)
    }

    fn clear_buffers(&self) {
        self.inner.state.lock().unwrap().queues.clear();
        self.inner.recv_ready.notify_one();
    }

    fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            if state.connected {
                if !state.fin_sent && !state.queues.send.is_empty() {
                    tracing::warn!(
                        unsent = state.queues.send.len(),
                        "closing with unsent data, possible data loss"
                    );
                }
                if !state.fin_received {
                    tracing::warn!("closing before the remote half shut down");
                }
            }
            state.connected = false;
            state.connecting = false;
            state.raw = None;
        }
        // Dropping the halves in the drivers closes the descriptor, which
        // carries a best-effort FIN when none was sent yet.
        self.inner.cancel.cancel();
        self.inner.events.notify_one();
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.state.lock().unwrap().local
    }

    fn remote_endpoint(&self) -> Option<Endpoint> {
        self.inner.state.lock().unwrap().remote
    }

    fn events(&self) -> Arc<Notify> {
        self.inner.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_rejects_beyond_hard_limit() {
        let socket = TcpSocket::with_config(TransportConfig {
            send_hard_limit: 8,
            ..TransportConfig::default()
        });
        assert!(socket.send(&[0u8; 8]));
        assert_eq!(socket.bytes_to_send(), 8);
        // Queue unchanged on rejection.
        assert!(!socket.send(&[0u8; 1]));
        assert_eq!(socket.bytes_to_send(), 8);
    }

    #[test]
    fn test_send_rejects_empty_input() {
        let socket = TcpSocket::new();
        assert!(!socket.send(&[]));
    }

    #[test]
    fn test_receive_on_empty_queue_is_zero() {
        let socket = TcpSocket::new();
        let mut buf = [0u8; 16];
        assert_eq!(socket.receive(&mut buf), 0);
    }

    #[test]
    fn test_send_message_respects_maximum_block_size() {
        let socket = TcpSocket::with_config(TransportConfig {
            maximum_block_size: 4,
            ..TransportConfig::default()
        });
        let mut message = Message::new();
        message.append(b"hello");
        assert!(!socket.send_message(&message));

        let mut small = Message::new();
        small.append(b"hi");
        assert!(socket.send_message(&small));
        assert_eq!(socket.bytes_to_send(), 6);
    }

    #[test]
    fn test_clear_buffers_empties_queues() {
        let socket = TcpSocket::new();
        assert!(socket.send(b"pending"));
        socket.clear_buffers();
        assert_eq!(socket.bytes_to_send(), 0);
    }
}
