//! Convenience re-exports for the common surface.
//!
//! ```rust
//! use multilink::prelude::*;
//! ```

pub use crate::endpoint::{Endpoint, IpAddress};
pub use crate::error::{Error, Result};
pub use crate::link::{Link, StreamId};
pub use crate::message::{Message, Wire};
pub use crate::sync::{
    Replicated, SyncClass, Synced, SyncedHandle, SyncedMember, SynchronizerClient,
    SynchronizerServer,
};
pub use crate::transport::{
    ReliableTransport, TcpListener, TcpSocket, TlsCertificate, TlsChannel, TlsKey, TlsRole,
    TlsVerification, TransportConfig, UdpConfig, UdpSocket, VerificationResult,
};
