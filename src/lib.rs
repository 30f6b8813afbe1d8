//! Asynchronous networking with stream multiplexing and object
//! synchronization.
//!
//! multilink provides a small stack of composable networking layers, all
//! driven by one process-wide [reactor](crate::reactor):
//!
//! - buffered, non-blocking [TCP sockets](crate::transport::TcpSocket) and
//!   [listeners](crate::transport::TcpListener) with bounded queues and
//!   graceful half-close;
//! - a [datagram socket](crate::transport::UdpSocket) with per-peer receive
//!   queues and aggregate flow control;
//! - a [TLS channel](crate::transport::TlsChannel) layering a TLS state
//!   machine over any reliable transport while preserving its streaming
//!   contract;
//! - a [`Link`](crate::link::Link) multiplexing up to 256 independent byte
//!   streams over one reliable transport;
//! - a [synchronizer](crate::sync) replicating typed objects from an
//!   authoritative server to its clients over a dedicated link stream.
//!
//! All data-path calls are non-blocking and thread-safe: they move bytes
//! between application-visible queues and never suspend the caller. The
//! reactor's worker pool performs the actual socket I/O through per-resource
//! driver tasks, so callbacks for one resource are serialized while distinct
//! resources proceed in parallel.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use multilink::prelude::*;
//!
//! multilink::reactor::start(2);
//!
//! let listener = TcpListener::new();
//! listener.listen("127.0.0.1:17001".parse().unwrap(), 16).unwrap();
//!
//! let client = TcpSocket::new();
//! client.connect("127.0.0.1:17001".parse().unwrap()).unwrap();
//!
//! let mut message = Message::new();
//! message.append(b"Hello World!\n");
//! while !client.is_connected() {
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! }
//! client.send_message(&message);
//! ```

pub mod endpoint;
pub mod error;
pub mod link;
pub mod message;
pub mod prelude;
pub mod reactor;
pub mod sync;
pub mod transport;

mod util;

pub use endpoint::{Endpoint, IpAddress};
pub use error::{Error, Result};
pub use link::{Link, StreamId};
pub use message::{Message, Wire};
pub use transport::{
    ReliableTransport, TcpListener, TcpSocket, TlsCertificate, TlsChannel, TlsKey, TlsRole,
    TlsVerification, TransportConfig, UdpConfig, UdpSocket, VerificationResult,
};
