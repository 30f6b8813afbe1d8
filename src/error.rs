//! Error types for multilink.
//!
//! All errors are `#[non_exhaustive]` to allow adding new variants without
//! breaking changes. Data-path operations (send/receive/accept) never return
//! these: per the library's contract they report would-block and exhaustion
//! conditions as `false` or zero-byte results, and terminal conditions through
//! the transport's status predicates. `Error` covers the synchronous
//! call-site failures: bad addresses, bad certificate or key material, and
//! operations attempted against a stopped reactor.

use std::net::SocketAddr;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Certificate and private-key loading error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateErrorKind {
    /// Input was not parseable PEM.
    InvalidPem,
    /// PEM input contained no certificate.
    NoCertificate,
    /// PEM input contained no private key.
    NoPrivateKey,
    /// Key is encrypted but no passphrase was supplied.
    MissingPassphrase,
    /// Decryption of an encrypted key failed (wrong passphrase or
    /// unsupported encryption scheme).
    DecryptionFailed,
    /// Key algorithm or encoding is not supported by the TLS backend.
    UnsupportedKey,
}

impl std::fmt::Display for CertificateErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPem => write!(f, "invalid PEM data"),
            Self::NoCertificate => write!(f, "no certificate found in PEM input"),
            Self::NoPrivateKey => write!(f, "no private key found in PEM input"),
            Self::MissingPassphrase => write!(f, "key is encrypted but no passphrase was given"),
            Self::DecryptionFailed => write!(f, "private key decryption failed"),
            Self::UnsupportedKey => write!(f, "unsupported private key"),
        }
    }
}

/// TLS channel configuration error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    /// A server channel needs a certificate/key pair before it can handshake.
    MissingKeyPair,
    /// The certificate/key pair was rejected by the TLS backend.
    InvalidKeyPair,
    /// The expected peer name could not be used as a TLS server name.
    InvalidPeerName,
    /// The TLS backend rejected the configuration.
    Backend,
}

impl std::fmt::Display for TlsErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingKeyPair => write!(f, "no certificate/key pair configured"),
            Self::InvalidKeyPair => write!(f, "certificate/key pair rejected"),
            Self::InvalidPeerName => write!(f, "expected peer name is not a valid server name"),
            Self::Backend => write!(f, "TLS backend rejected the configuration"),
        }
    }
}

/// Library error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O error raised at a synchronous call site (bind, listen, option
    /// pass-through). Asynchronous completion errors are logged and folded
    /// into the owning resource's state instead.
    #[error("I/O error{}: {source}", target.map(|t| format!(" on {}", t)).unwrap_or_default())]
    Io {
        target: Option<SocketAddr>,
        #[source]
        source: std::io::Error,
    },

    /// Address or endpoint string could not be parsed.
    #[error("invalid address: {input}")]
    InvalidAddress { input: Box<str> },

    /// Certificate or key material was rejected.
    #[error("certificate error: {kind}")]
    Certificate { kind: CertificateErrorKind },

    /// TLS channel configuration failure.
    #[error("TLS error: {kind}")]
    Tls { kind: TlsErrorKind },

    /// The operation needs the reactor, but `reactor::start` has not been
    /// called (or `reactor::stop` already tore it down).
    #[error("reactor is not running")]
    ReactorStopped,

    /// `connect` was called on a socket that is already part of an
    /// established connection.
    #[error("socket is already connected")]
    AlreadyConnected,
}

impl Error {
    pub(crate) fn io(source: std::io::Error) -> Self {
        Error::Io {
            target: None,
            source,
        }
    }

    pub(crate) fn io_on(target: SocketAddr, source: std::io::Error) -> Self {
        Error::Io {
            target: Some(target),
            source,
        }
    }

    pub(crate) fn certificate(kind: CertificateErrorKind) -> Self {
        Error::Certificate { kind }
    }

    pub(crate) fn tls(kind: TlsErrorKind) -> Self {
        Error::Tls { kind }
    }
}
