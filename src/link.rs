//! Stream multiplexing over one reliable transport.
//!
//! A [`Link`] carries up to 256 independent, individually ordered byte
//! streams over a single underlying connection. Each application write is
//! chunked into segments tagged with the stream id:
//!
//! ```text
//! | stream_id: u8 | length: u32 LE | payload: length bytes |      length <= 65535
//! ```
//!
//! All chunks of one `send_on` call are contiguous on the wire; calls on
//! different streams interleave at segment granularity. On the receive side
//! a single parser walks the underlying queue, so a stream's reader only
//! makes progress while the segment at the head of the queue belongs to it:
//! a reader seeing zero bytes should poll the other stream ids to let the
//! parser advance.
//!
//! Stream ids below 200 are for applications; 200 and above are reserved
//! for library subsystems (the object synchronizer runs on 200).
//!
//! A `Link` also implements [`ReliableTransport`] itself, with the plain
//! calls mapped to stream 0, so single-stream code and connection lifecycle
//! management work unchanged.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::message::Message;
use crate::transport::{ReliableTransport, StreamQueues};

/// Identifier of one multiplexed stream.
pub type StreamId = u8;

/// Largest payload carried by a single segment.
pub const MAX_SEGMENT_SIZE: usize = 65535;

/// Stream ids at or above this value are reserved for library subsystems.
pub const RESERVED_STREAM_BASE: StreamId = 200;

/// Segment header: stream id plus little-endian length.
const SEGMENT_HEADER_SIZE: usize = 5;

/// Multiplexes independent byte streams over one reliable transport.
///
/// Cheap to clone; all clones share the transport and the receive parser.
pub struct Link<T: ReliableTransport> {
    inner: Arc<LinkInner<T>>,
}

impl<T: ReliableTransport> Clone for Link<T> {
    fn clone(&self) -> Self {
        Link {
            inner: self.inner.clone(),
        }
    }
}

struct LinkInner<T: ReliableTransport> {
    transport: T,
    parser: Mutex<SegmentParser>,
    /// Serializes senders so one call's segments stay contiguous.
    send_lock: Mutex<()>,
}

#[derive(Default)]
struct SegmentParser {
    current_stream: StreamId,
    remaining: usize,
    active: bool,
    /// Segment with an impossible header being drained and dropped.
    discard: bool,
}

impl<T: ReliableTransport> Link<T> {
    /// Set up a link over `transport`.
    ///
    /// The link takes over the transport's data path; bytes sent or
    /// received on the transport directly would corrupt the segment
    /// framing.
    pub fn new(transport: T) -> Self {
        Link {
            inner: Arc::new(LinkInner {
                transport,
                parser: Mutex::new(SegmentParser::default()),
                send_lock: Mutex::new(()),
            }),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Stable identity shared by all clones of this link.
    pub(crate) fn token(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Bytes a `send_on` of `len` payload bytes will place on the wire,
    /// including segment headers.
    fn wire_size(len: usize) -> usize {
        let segments = len.div_ceil(MAX_SEGMENT_SIZE).max(1);
        len + segments * SEGMENT_HEADER_SIZE
    }

    /// Queue `data` on stream `stream_id`.
    ///
    /// The payload is chunked into segments of at most 65535 bytes, all
    /// contiguous on the wire. Returns false (queue unchanged) when the
    /// transport cannot accept the whole wire size.
    pub fn send_on(&self, stream_id: StreamId, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }

        let _contiguous = self.inner.send_lock.lock().unwrap();

        if !self.inner.transport.can_send(Self::wire_size(data.len())) {
            return false;
        }

        for chunk in data.chunks(MAX_SEGMENT_SIZE) {
            let mut header = [0u8; SEGMENT_HEADER_SIZE];
            header[0] = stream_id;
            header[1..].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            if !self.inner.transport.send(&header) || !self.inner.transport.send(chunk) {
                // Capacity was checked above; hitting this means the
                // transport shut down mid-call.
                tracing::warn!(stream = stream_id, "transport refused a checked segment");
                return false;
            }
        }
        true
    }

    /// Drain payload bytes of stream `stream_id` into `buf`.
    ///
    /// Reads at most the bytes remaining in the current segment. Returns
    /// zero when nothing for this stream is at the head of the queue; poll
    /// other stream ids to advance the parser.
    pub fn receive_on(&self, stream_id: StreamId, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let mut parser = self.inner.parser.lock().unwrap();

        loop {
            if !self.advance_parser(&mut parser, stream_id) {
                return 0;
            }

            if parser.discard {
                let mut scratch = [0u8; 4096];
                let want = parser.remaining.min(scratch.len());
                let n = self.inner.transport.receive(&mut scratch[..want]);
                if n == 0 {
                    return 0;
                }
                parser.remaining -= n;
                if parser.remaining == 0 {
                    parser.active = false;
                    parser.discard = false;
                }
                continue;
            }

            let want = buf.len().min(parser.remaining);
            let n = self.inner.transport.receive(&mut buf[..want]);
            parser.remaining -= n;
            if parser.remaining == 0 {
                parser.active = false;
            }
            return n;
        }
    }

    /// Queue a framed message on stream `stream_id`.
    ///
    /// The frame must fit a single segment; larger messages are refused
    /// with a diagnostic.
    pub fn send_message_on(&self, stream_id: StreamId, message: &Message) -> bool {
        let frame = StreamQueues::frame(message);
        if frame.len() > MAX_SEGMENT_SIZE {
            tracing::warn!(
                size = message.len(),
                maximum = MAX_SEGMENT_SIZE - 4,
                "messages larger than one segment are unsupported"
            );
            return false;
        }
        self.send_on(stream_id, &frame)
    }

    /// Dequeue one framed message from stream `stream_id`.
    ///
    /// Yields the message only when the complete frame is buffered on this
    /// stream; returns the total consumed size, or zero.
    pub fn receive_message_on(&self, stream_id: StreamId, message: &mut Message) -> usize {
        let mut parser = self.inner.parser.lock().unwrap();

        loop {
            if !self.advance_parser(&mut parser, stream_id) {
                return 0;
            }

            if parser.discard {
                let mut scratch = [0u8; 4096];
                let want = parser.remaining.min(scratch.len());
                let n = self.inner.transport.receive(&mut scratch[..want]);
                if n == 0 {
                    return 0;
                }
                parser.remaining -= n;
                if parser.remaining == 0 {
                    parser.active = false;
                    parser.discard = false;
                }
                continue;
            }

            if self.inner.transport.bytes_to_receive() < parser.remaining {
                return 0;
            }

            let consumed = self.inner.transport.receive_message(message);
            if consumed == 0 {
                // The segment does not hold a whole frame: framing desync.
                tracing::warn!(
                    stream = stream_id,
                    segment = parser.remaining,
                    "segment does not contain a complete message frame"
                );
                parser.discard = true;
                continue;
            }
            parser.remaining -= consumed.min(parser.remaining);
            if parser.remaining == 0 {
                parser.active = false;
            }
            return consumed;
        }
    }

    /// Read the next segment header if none is active. Returns false when
    /// the caller should give up (no data, or the head segment belongs to a
    /// different stream).
    fn advance_parser(&self, parser: &mut SegmentParser, stream_id: StreamId) -> bool {
        loop {
            if parser.active {
                if parser.discard || parser.current_stream == stream_id {
                    return true;
                }
                return false;
            }

            if self.inner.transport.bytes_to_receive() < SEGMENT_HEADER_SIZE {
                return false;
            }

            let mut header = [0u8; SEGMENT_HEADER_SIZE];
            let n = self.inner.transport.receive(&mut header);
            if n < SEGMENT_HEADER_SIZE {
                // The byte count was checked under the parser lock; a short
                // read means someone reads the transport behind our back.
                tracing::warn!(read = n, "segment header short read");
                return false;
            }

            parser.current_stream = header[0];
            parser.remaining = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;

            if parser.remaining > MAX_SEGMENT_SIZE {
                tracing::warn!(
                    stream = parser.current_stream,
                    length = parser.remaining,
                    "impossible segment length, discarding segment"
                );
                parser.active = true;
                parser.discard = true;
                return true;
            }

            if parser.remaining == 0 {
                continue;
            }

            parser.active = true;
        }
    }
}

/// The plain transport contract, mapped to stream 0.
impl<T: ReliableTransport> ReliableTransport for Link<T> {
    fn connect(&self, endpoint: Endpoint) -> Result<()> {
        self.inner.transport.connect(endpoint)
    }

    fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    fn send(&self, data: &[u8]) -> bool {
        self.send_on(0, data)
    }

    fn receive(&self, buf: &mut [u8]) -> usize {
        self.receive_on(0, buf)
    }

    fn send_message(&self, message: &Message) -> bool {
        self.send_message_on(0, message)
    }

    fn receive_message(&self, message: &mut Message) -> usize {
        self.receive_message_on(0, message)
    }

    fn shutdown(&self) {
        self.inner.transport.shutdown();
    }

    fn local_has_shutdown(&self) -> bool {
        self.inner.transport.local_has_shutdown()
    }

    fn remote_has_shutdown(&self) -> bool {
        self.inner.transport.remote_has_shutdown()
    }

    fn bytes_to_send(&self) -> usize {
        self.inner.transport.bytes_to_send()
    }

    fn bytes_to_receive(&self) -> usize {
        self.inner.transport.bytes_to_receive()
    }

    fn can_send(&self, len: usize) -> bool {
        self.inner.transport.can_send(Self::wire_size(len))
    }

    fn clear_buffers(&self) {
        *self.inner.parser.lock().unwrap() = SegmentParser::default();
        self.inner.transport.clear_buffers();
    }

    fn close(&self) {
        *self.inner.parser.lock().unwrap() = SegmentParser::default();
        self.inner.transport.close();
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.transport.local_endpoint()
    }

    fn remote_endpoint(&self) -> Option<Endpoint> {
        self.inner.transport.remote_endpoint()
    }

    fn events(&self) -> Arc<Notify> {
        self.inner.transport.events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn pair() -> (Link<MockTransport>, Link<MockTransport>) {
        let (a, b) = MockTransport::pair();
        (Link::new(a), Link::new(b))
    }

    /// Poll one stream until `len` bytes have accumulated, draining other
    /// streams' turns by bouncing between the requested ids.
    fn collect(link: &Link<MockTransport>, stream: StreamId, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let mut spins = 0;
        while out.len() < len && spins < 1000 {
            let take = (len - out.len()).min(buf.len());
            let n = link.receive_on(stream, &mut buf[..take]);
            if n == 0 {
                spins += 1;
                continue;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_two_streams_deliver_independently() {
        let (server, client) = pair();
        assert!(server.send_on(0, b"Hello World!\0"));
        assert!(server.send_on(1, b"Bye World!\0"));

        assert_eq!(collect(&client, 0, 13), b"Hello World!\0");
        assert_eq!(collect(&client, 1, 11), b"Bye World!\0");
    }

    #[test]
    fn test_reversed_receive_order_yields_same_payloads() {
        let (server, client) = pair();
        assert!(server.send_on(0, b"Hello World!\0"));
        assert!(server.send_on(1, b"Bye World!\0"));

        // Stream 1 cannot progress until stream 0's head segment is drained.
        let mut buf = [0u8; 32];
        assert_eq!(client.receive_on(1, &mut buf), 0);

        assert_eq!(collect(&client, 0, 13), b"Hello World!\0");
        assert_eq!(collect(&client, 1, 11), b"Bye World!\0");
    }

    #[test]
    fn test_large_payload_is_chunked_and_reassembled() {
        let (server, client) = pair();
        let payload: Vec<u8> = (0..MAX_SEGMENT_SIZE + 4321).map(|i| (i % 251) as u8).collect();
        assert!(server.send_on(7, &payload));

        // Two segments: headers account for 10 extra wire bytes.
        assert_eq!(collect(&client, 7, payload.len()), payload);
    }

    #[test]
    fn test_send_rejected_when_wire_size_exceeds_capacity() {
        let config = crate::transport::TransportConfig {
            send_hard_limit: 16,
            ..Default::default()
        };
        let (a, _b) = MockTransport::pair_with_config(config);
        let link = Link::new(a);
        // 12 payload + 5 header = 17 > 16.
        assert!(!link.send_on(0, &[0u8; 12]));
        assert_eq!(link.bytes_to_send(), 0);
        // 11 payload + 5 header = 16 fits.
        assert!(link.send_on(0, &[0u8; 11]));
    }

    #[test]
    fn test_framed_message_per_stream() {
        let (server, client) = pair();
        let mut first = Message::new();
        first.push(&0xDEAD_BEEFu32);
        let mut second = Message::new();
        second.push(&String::from("stream five"));

        assert!(server.send_message_on(3, &first));
        assert!(server.send_message_on(5, &second));

        let mut decoded = Message::new();
        // Stream 5 waits for stream 3's segment to drain.
        assert_eq!(client.receive_message_on(5, &mut decoded), 0);
        assert_eq!(client.receive_message_on(3, &mut decoded), 8);
        assert_eq!(decoded.pop::<u32>(), Some(0xDEAD_BEEF));

        assert_eq!(client.receive_message_on(5, &mut decoded), 19);
        assert_eq!(decoded.pop::<String>().as_deref(), Some("stream five"));
    }

    #[test]
    fn test_oversized_message_frame_is_refused() {
        let (server, _client) = pair();
        let mut message = Message::new();
        message.append(&vec![0u8; MAX_SEGMENT_SIZE]);
        assert!(!server.send_message_on(0, &message));
        assert_eq!(server.bytes_to_send(), 0);
    }

    #[test]
    fn test_impossible_segment_header_is_discarded() {
        let (a, b) = MockTransport::pair();
        let link = Link::new(b);

        // Hand-craft a corrupt segment header (length > 65535), followed by
        // its declared payload, then a valid segment.
        let mut corrupt = vec![9u8];
        corrupt.extend_from_slice(&70000u32.to_le_bytes());
        assert!(a.send(&corrupt));
        assert!(a.send(&vec![0xAAu8; 70000]));

        let mut good = vec![2u8];
        good.extend_from_slice(&3u32.to_le_bytes());
        good.extend_from_slice(b"abc");
        assert!(a.send(&good));

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        let mut spins = 0;
        while got.len() < 3 && spins < 10000 {
            let n = link.receive_on(2, &mut buf);
            if n == 0 {
                spins += 1;
                continue;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"abc");
    }

    #[test]
    fn test_zero_fill_interleaving_across_streams() {
        let (server, client) = pair();
        // Interleave segments by alternating small sends on two streams.
        for i in 0..10u8 {
            assert!(server.send_on(0, &[i]));
            assert!(server.send_on(1, &[100 + i]));
        }

        let mut zero = Vec::new();
        let mut one = Vec::new();
        let mut buf = [0u8; 8];
        for _ in 0..100 {
            let n = client.receive_on(0, &mut buf);
            zero.extend_from_slice(&buf[..n]);
            let n = client.receive_on(1, &mut buf);
            one.extend_from_slice(&buf[..n]);
            if zero.len() == 10 && one.len() == 10 {
                break;
            }
        }
        assert_eq!(zero, (0..10u8).collect::<Vec<_>>());
        assert_eq!(one, (100..110u8).collect::<Vec<_>>());
    }
}
