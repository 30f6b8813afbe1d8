//! TCP listener.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::reactor;
use crate::transport::{TcpSocket, TransportConfig};
use crate::util::bind_tcp_listener;

/// Accepts incoming TCP connections into a bounded queue.
///
/// While listening, the reactor keeps one accept outstanding and parks new
/// connections in the queue; accepting pauses once `backlog` connections are
/// waiting and resumes as [`accept`](TcpListener::accept) drains them.
///
/// # Example
///
/// ```rust,no_run
/// use multilink::reactor;
/// use multilink::transport::TcpListener;
///
/// reactor::start(2);
/// let listener = TcpListener::new();
/// listener.listen("127.0.0.1:17001".parse().unwrap(), 16).unwrap();
/// loop {
///     if let Some(connection) = listener.accept() {
///         // hand the socket off
///         # let _ = connection;
///         break;
///     }
///     std::thread::sleep(std::time::Duration::from_millis(1));
/// }
/// ```
#[derive(Clone)]
pub struct TcpListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    state: Mutex<ListenerState>,
    /// Wakes the accept driver once the queue has room again.
    accept_ready: Arc<Notify>,
    cancel: CancellationToken,
}

struct ListenerState {
    listening: bool,
    closed: bool,
    local: Option<Endpoint>,
    backlog: usize,
    pending: VecDeque<TcpSocket>,
    config: TransportConfig,
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TcpListener {
    /// Create a listener whose accepted sockets use default buffer limits.
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    /// Create a listener whose accepted sockets use the given limits.
    pub fn with_config(config: TransportConfig) -> Self {
        TcpListener {
            inner: Arc::new(ListenerInner {
                state: Mutex::new(ListenerState {
                    listening: false,
                    closed: false,
                    local: None,
                    backlog: 0,
                    pending: VecDeque::new(),
                    config,
                }),
                accept_ready: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Bind to `endpoint` and start accepting with the given backlog.
    ///
    /// The backlog bounds both the kernel queue and the library-side queue
    /// of accepted-but-unclaimed connections.
    pub fn listen(&self, endpoint: Endpoint, backlog: u32) -> Result<()> {
        let handle = reactor::handle().ok_or(Error::ReactorStopped)?;
        let addr = SocketAddr::from(endpoint);

        {
            let state = self.inner.state.lock().unwrap();
            if state.listening {
                return Err(Error::AlreadyConnected);
            }
            if state.closed {
                return Err(Error::io_on(
                    addr,
                    std::io::Error::new(std::io::ErrorKind::NotConnected, "listener is closed"),
                ));
            }
        }

        let listener = {
            let _guard = handle.enter();
            bind_tcp_listener(addr, backlog.max(1)).map_err(|e| Error::io_on(addr, e))?
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.local = listener.local_addr().ok().map(Endpoint::from);
            state.listening = true;
            state.backlog = backlog.max(1) as usize;
            tracing::debug!(
                local = ?state.local.map(|e| e.to_string()),
                backlog,
                "listening"
            );
        }

        let weak = Arc::downgrade(&self.inner);
        handle.spawn(accept_driver(
            weak,
            listener,
            self.inner.accept_ready.clone(),
            self.inner.cancel.clone(),
        ));
        Ok(())
    }

    /// Next queued accepted connection, or `None` when the queue is empty.
    pub fn accept(&self) -> Option<TcpSocket> {
        let socket = self.inner.state.lock().unwrap().pending.pop_front();
        if socket.is_some() {
            self.inner.accept_ready.notify_one();
        }
        socket
    }

    /// Stop accepting and release the listening socket. Connections already
    /// queued remain claimable via [`accept`](TcpListener::accept).
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.listening = false;
            state.closed = true;
        }
        self.inner.cancel.cancel();
    }

    /// Whether the listener is currently accepting.
    pub fn is_listening(&self) -> bool {
        self.inner.state.lock().unwrap().listening
    }

    /// The bound local endpoint, useful after an ephemeral-port bind.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.state.lock().unwrap().local
    }
}

impl Default for TcpListener {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_driver(
    weak: Weak<ListenerInner>,
    listener: tokio::net::TcpListener,
    accept_ready: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        // Pause while the accepted queue is at the backlog bound.
        let full = {
            let Some(inner) = weak.upgrade() else { return };
            let state = inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.pending.len() >= state.backlog
        };
        if full {
            tokio::select! {
                _ = accept_ready.notified() => continue,
                _ = cancel.cancelled() => return,
            }
        }

        let result = tokio::select! {
            r = listener.accept() => r,
            _ = cancel.cancelled() => return,
        };

        let Some(inner) = weak.upgrade() else { return };
        match result {
            Ok((stream, peer)) => {
                let config = inner.state.lock().unwrap().config.clone();
                let socket = TcpSocket::from_accepted(stream, config);
                let mut state = inner.state.lock().unwrap();
                tracing::debug!(peer = %peer, queued = state.pending.len() + 1, "accepted connection");
                state.pending.push_back(socket);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                // The peer vanished between SYN and accept. Keep listening.
                tracing::debug!(error = %e, "connection aborted before accept");
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                inner.state.lock().unwrap().listening = false;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_on_idle_listener_is_none() {
        let listener = TcpListener::new();
        assert!(listener.accept().is_none());
        assert!(!listener.is_listening());
        assert!(listener.local_endpoint().is_none());
    }
}
