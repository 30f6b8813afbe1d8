//! Transport layer.
//!
//! Provides the [`ReliableTransport`] trait and the concrete transports:
//! buffered TCP sockets, the accepting listener, the datagram socket and the
//! TLS channel adaptor.
//!
//! # The reliable-transport contract
//!
//! A reliable transport is an ordered byte stream with bounded send and
//! receive queues and half-close semantics. All calls are non-blocking and
//! thread-safe:
//!
//! - `send` either accepts the whole input or rejects it (`false`) when the
//!   hard send limit would be exceeded or the local half is already shut
//!   down. Accepted bytes are delivered in order.
//! - `receive` drains whatever is buffered, returning zero when nothing is.
//! - the framed variants ship a [`Message`] as `u32 LE length | payload`;
//!   a framed receive yields bytes only once the complete frame is buffered.
//! - `shutdown` requests a local half-close; the FIN goes out only after the
//!   send queue drains. `local_has_shutdown`/`remote_has_shutdown` are
//!   monotonic once true.
//!
//! Layered adaptors ([`TlsChannel`](crate::transport::TlsChannel) over any
//! transport, [`Link`](crate::link::Link) over any transport) consume this
//! trait rather than a concrete socket.

mod listener;
mod tcp;
mod tls;
mod udp;

#[cfg(any(test, feature = "testing"))]
mod mock;

pub use listener::*;
pub use tcp::*;
pub use tls::*;
pub use udp::*;

#[cfg(any(test, feature = "testing"))]
pub use mock::*;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::message::Message;

/// Default soft buffer threshold (diagnostics only): 64 KiB.
pub const DEFAULT_SOFT_LIMIT: usize = 64 * 1024;

/// Default hard buffer threshold (push refused beyond this): 128 KiB.
pub const DEFAULT_HARD_LIMIT: usize = 128 * 1024;

/// Default upper bound for a single framed [`Message`] payload.
pub const DEFAULT_MAXIMUM_BLOCK_SIZE: usize = 65535;

/// Buffer limits and framing bounds for one reliable transport.
///
/// The soft limits only produce diagnostics when crossed; the hard limits
/// refuse further pushes (`send` returns `false`) and gate receive posting.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Send queue level that triggers a diagnostic (default 64 KiB).
    pub send_soft_limit: usize,
    /// Send queue level beyond which `send` is refused (default 128 KiB).
    pub send_hard_limit: usize,
    /// Receive queue level that triggers a diagnostic (default 64 KiB).
    pub receive_soft_limit: usize,
    /// Receive queue level at which no further reads are posted
    /// (default 128 KiB).
    pub receive_hard_limit: usize,
    /// Upper bound on a single framed `Message` payload (default 65535,
    /// may be raised).
    pub maximum_block_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_soft_limit: DEFAULT_SOFT_LIMIT,
            send_hard_limit: DEFAULT_HARD_LIMIT,
            receive_soft_limit: DEFAULT_SOFT_LIMIT,
            receive_hard_limit: DEFAULT_HARD_LIMIT,
            maximum_block_size: DEFAULT_MAXIMUM_BLOCK_SIZE,
        }
    }
}

/// A reliable, ordered byte-stream transport with buffered non-blocking I/O.
///
/// Implemented by [`TcpSocket`] and [`TlsChannel`]; [`Link`](crate::link::Link)
/// and the synchronizer are generic over it. All methods are callable from
/// any thread and never suspend the caller.
pub trait ReliableTransport: Send + Sync + 'static {
    /// Asynchronously connect to a remote endpoint. The transport becomes
    /// connected once the reactor completes the attempt.
    fn connect(&self, endpoint: Endpoint) -> Result<()>;

    /// Whether the transport is part of an established connection.
    fn is_connected(&self) -> bool;

    /// Queue bytes for sending. Returns false when the local half is shut
    /// down or the hard send limit would be exceeded; the queue is unchanged
    /// in that case.
    fn send(&self, data: &[u8]) -> bool;

    /// Drain up to `buf.len()` received bytes. Returns the number drained,
    /// zero when the queue is empty.
    fn receive(&self, buf: &mut [u8]) -> usize;

    /// Queue a framed message (`u32 LE length | payload`) for sending.
    fn send_message(&self, message: &Message) -> bool;

    /// Dequeue one framed message. Returns the total number of bytes
    /// consumed (length prefix plus payload), or zero when no complete
    /// frame is buffered.
    fn receive_message(&self, message: &mut Message) -> usize;

    /// Request a local half-close. The FIN is transmitted once the send
    /// queue drains; subsequent `send` calls are refused.
    fn shutdown(&self);

    /// Whether the local FIN has actually been sent.
    fn local_has_shutdown(&self) -> bool;

    /// Whether the peer's end-of-stream has been observed.
    fn remote_has_shutdown(&self) -> bool;

    /// Bytes currently queued for sending.
    fn bytes_to_send(&self) -> usize;

    /// Bytes currently queued for receiving.
    fn bytes_to_receive(&self) -> usize;

    /// Whether a `send` of `len` bytes would currently be accepted.
    fn can_send(&self, len: usize) -> bool;

    /// Drop both queues. May re-arm a receive that was suspended by the
    /// hard limit.
    fn clear_buffers(&self);

    /// Cancel outstanding I/O and release the underlying handle. Logs a
    /// warning when unsent data remain.
    fn close(&self);

    /// Local endpoint of the established connection, if any.
    fn local_endpoint(&self) -> Option<Endpoint>;

    /// Remote endpoint of the established connection, if any.
    fn remote_endpoint(&self) -> Option<Endpoint>;

    /// Progress notifier: signalled whenever the reactor completes work on
    /// this transport (data arrived, send queue drained, connection state
    /// changed). Layered adaptors await this to drive their own state
    /// machines; it is a single-consumer notification.
    fn events(&self) -> Arc<Notify>;
}

/// Shared send/receive queue state for stream transports.
///
/// TCP sockets, TLS channels and the in-memory test transport all keep their
/// application-facing queues here so that limit enforcement, soft-threshold
/// diagnostics and message framing behave identically across them.
pub(crate) struct StreamQueues {
    pub(crate) send: VecDeque<u8>,
    pub(crate) receive: VecDeque<u8>,
    pub(crate) config: TransportConfig,
    /// Remaining bytes of an oversized frame being discarded.
    frame_skip: usize,
    send_soft_hit: bool,
    receive_soft_hit: bool,
}

impl StreamQueues {
    pub(crate) fn new(config: TransportConfig) -> Self {
        Self {
            send: VecDeque::new(),
            receive: VecDeque::new(),
            config,
            frame_skip: 0,
            send_soft_hit: false,
            receive_soft_hit: false,
        }
    }

    /// Whether `len` more bytes fit under the hard send limit.
    pub(crate) fn send_fits(&self, len: usize) -> bool {
        self.send.len() + len <= self.config.send_hard_limit
    }

    /// Append to the send queue, assuming the caller checked `send_fits`.
    pub(crate) fn enqueue_send(&mut self, data: &[u8]) {
        self.send.extend(data.iter().copied());

        if !self.send_soft_hit && self.send.len() > self.config.send_soft_limit {
            self.send_soft_hit = true;
            tracing::debug!(
                queued = self.send.len(),
                soft_limit = self.config.send_soft_limit,
                "send queue crossed soft limit"
            );
        }
    }

    /// Remove a transmitted prefix from the send queue.
    pub(crate) fn consume_sent(&mut self, n: usize) {
        self.send.drain(..n.min(self.send.len()));
        if self.send.len() <= self.config.send_soft_limit {
            self.send_soft_hit = false;
        }
    }

    /// Room left under the hard receive limit.
    pub(crate) fn receive_room(&self) -> usize {
        self.config
            .receive_hard_limit
            .saturating_sub(self.receive.len())
    }

    /// Append bytes delivered by the reactor to the receive queue.
    pub(crate) fn push_received(&mut self, data: &[u8]) {
        self.receive.extend(data.iter().copied());

        if !self.receive_soft_hit && self.receive.len() > self.config.receive_soft_limit {
            self.receive_soft_hit = true;
            tracing::debug!(
                queued = self.receive.len(),
                soft_limit = self.config.receive_soft_limit,
                "receive queue crossed soft limit"
            );
        }
    }

    /// Drain up to `buf.len()` bytes into `buf`.
    pub(crate) fn dequeue_receive(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.receive.len());
        for (slot, byte) in buf.iter_mut().zip(self.receive.drain(..n)) {
            *slot = byte;
        }
        if self.receive.len() <= self.config.receive_soft_limit {
            self.receive_soft_hit = false;
        }
        n
    }

    /// Encode a message as a frame: `u32 LE length | payload`.
    pub(crate) fn frame(message: &Message) -> Vec<u8> {
        let payload = message.to_vec();
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Dequeue one complete frame into `message`.
    ///
    /// Returns the total consumed size (prefix plus payload), or zero when
    /// no complete frame is present. A frame whose declared length exceeds
    /// `maximum_block_size` is a protocol violation: it is logged, its bytes
    /// are discarded as they arrive, and parsing continues with the next
    /// frame.
    pub(crate) fn dequeue_frame(&mut self, message: &mut Message) -> usize {
        message.clear();

        loop {
            if self.frame_skip > 0 {
                let discard = self.frame_skip.min(self.receive.len());
                self.receive.drain(..discard);
                self.frame_skip -= discard;
                if self.frame_skip > 0 {
                    return 0;
                }
            }

            if self.receive.len() < 4 {
                return 0;
            }

            let mut prefix = [0u8; 4];
            for (slot, byte) in prefix.iter_mut().zip(self.receive.iter()) {
                *slot = *byte;
            }
            let length = u32::from_le_bytes(prefix) as usize;

            if length > self.config.maximum_block_size {
                tracing::warn!(
                    length,
                    maximum = self.config.maximum_block_size,
                    "dropping oversized message frame"
                );
                self.receive.drain(..4);
                self.frame_skip = length;
                continue;
            }

            if self.receive.len() < 4 + length {
                return 0;
            }

            self.receive.drain(..4);
            let payload: Vec<u8> = self.receive.drain(..length).collect();
            message.append(&payload);

            if self.receive.len() <= self.config.receive_soft_limit {
                self.receive_soft_hit = false;
            }

            return 4 + length;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.send.clear();
        self.receive.clear();
        self.frame_skip = 0;
        self.send_soft_hit = false;
        self.receive_soft_hit = false;
    }
}
