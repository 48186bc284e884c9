use std::io;

/// The failure taxonomy of the tunnel core.
///
/// Every variant here corresponds to one row of the error-handling table:
/// config/startup failures are fatal, dial/handshake failures drive the
/// client into `Backoff`, steady-state failures are session-fatal, and
/// `OversizePacket` is the one variant that never propagates as an error:
/// callers only ever see it via a counter.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("adapter create failed: {0}")]
    AdapterCreate(#[source] io::Error),

    #[error("adapter configure failed: {0}")]
    AdapterConfigure(#[source] io::Error),

    #[error("connection refused")]
    ConnectRefused(#[source] io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("dns resolution failed: {0}")]
    Dns(#[source] io::Error),

    #[error("negotiated tls version below configured floor")]
    TlsVersion,

    #[error("peer certificate authentication failed: {0}")]
    TlsAuth(String),

    #[error("tls alert: {0}")]
    TlsAlert(String),

    #[error("no common cipher suite")]
    NoCommonCipher,

    #[error("tls handshake timed out")]
    HandshakeTimeout,

    #[error("transport io error: {0}")]
    TransportIo(#[source] io::Error),

    #[error("adapter io error: {0}")]
    AdapterIo(#[source] io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("peer closed the connection")]
    PeerClose,

    #[error("no activity (including keepalive heartbeats) within the keepalive deadline")]
    KeepaliveTimeout,

    #[error("operation cancelled")]
    Cancelled,
}

/// Framing-layer integrity errors (§4.2). `OversizePacket` at the *encoder*
/// is a per-packet drop (never returned from `encode`, see `framing.rs`);
/// this variant only fires on the *decode* side, where an oversize length
/// prefix indicates stream corruption and is transport-fatal.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("zero-length frame")]
    InvalidFrame,
    #[error("frame truncated mid-read")]
    TruncatedFrame,
    #[error("frame length exceeds mtu cap")]
    OversizePacket,
}

pub type CoreResult<T> = Result<T, CoreError>;
