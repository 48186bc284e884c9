//! TLS-over-TCP transport (§4.3). Wraps a mutually-authenticated TLS stream
//! over a plain TCP socket: dial (Client) or accept (Server), enforce the
//! version floor and cipher-suite allow-list. TLS close-notify surfaces as a
//! clean EOF at a frame boundary, which `engine`'s ingress loop turns into a
//! distinguished [`CoreError::PeerClose`](crate::error::CoreError::PeerClose)
//! rather than a generic transport error.
//!
//! Certificate and key material is loaded once via `CertificateDer::pem_file_iter`
//! and `PrivateKeyDer::from_pem_file`; both the client and server `rustls`
//! configs require a peer certificate via `rustls::server::WebPkiClientVerifier`
//! rather than the no-client-auth setup a one-way TLS server would use.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::config::{ClientTransportConfig, ServerTransportConfig, TlsConfig, TlsVersionFloor};
use crate::error::{CoreError, CoreResult};

/// Certificate chain, private key, and trust anchors loaded from disk.
/// The core never touches the filesystem itself; [`Config::load_tls_material`]
/// is the one seam where PEM bytes become rustls-native types.
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
    key_kind: PrivateKeyKind,
    roots: RootCertStore,
}

#[derive(Clone, Copy)]
enum PrivateKeyKind {
    Pkcs1,
    Pkcs8,
    Sec1,
}

impl TlsMaterial {
    pub fn load(cfg: &TlsConfig) -> CoreResult<Self> {
        let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(&cfg.certificate_chain)
            .map_err(|e| CoreError::ConfigInvalid(format!("reading certificate chain: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::ConfigInvalid(format!("parsing certificate chain: {e}")))?;

        if certs.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "certificate chain file contains no certificates".into(),
            ));
        }

        let key = PrivateKeyDer::from_pem_file(&cfg.private_key)
            .map_err(|e| CoreError::ConfigInvalid(format!("reading private key: {e}")))?;
        let (key_kind, key_der) = match key {
            PrivateKeyDer::Pkcs1(k) => (PrivateKeyKind::Pkcs1, k.secret_pkcs1_der().to_vec()),
            PrivateKeyDer::Pkcs8(k) => (PrivateKeyKind::Pkcs8, k.secret_pkcs8_der().to_vec()),
            PrivateKeyDer::Sec1(k) => (PrivateKeyKind::Sec1, k.secret_sec1_der().to_vec()),
            _ => return Err(CoreError::ConfigInvalid("unsupported private key format".into())),
        };

        let mut roots = RootCertStore::empty();
        for ca_path in &cfg.trusted_cas {
            let ca_certs = CertificateDer::pem_file_iter(ca_path)
                .map_err(|e| CoreError::ConfigInvalid(format!("reading trusted CA: {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| CoreError::ConfigInvalid(format!("parsing trusted CA: {e}")))?;

            for cert in ca_certs {
                roots
                    .add(cert)
                    .map_err(|e| CoreError::ConfigInvalid(format!("adding trusted CA: {e}")))?;
            }
        }

        if roots.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "no usable trusted CA certificates were loaded".into(),
            ));
        }

        Ok(Self {
            certs,
            key_der,
            key_kind,
            roots,
        })
    }

    fn certs(&self) -> Vec<CertificateDer<'static>> {
        self.certs.clone()
    }

    fn key(&self) -> PrivateKeyDer<'static> {
        let der = self.key_der.clone();
        match self.key_kind {
            PrivateKeyKind::Pkcs1 => PrivateKeyDer::Pkcs1(der.into()),
            PrivateKeyKind::Pkcs8 => PrivateKeyDer::Pkcs8(der.into()),
            PrivateKeyKind::Sec1 => PrivateKeyDer::Sec1(der.into()),
        }
    }
}

fn protocol_versions(
    floor: TlsVersionFloor,
) -> &'static [&'static tokio_rustls::rustls::SupportedProtocolVersion] {
    match floor {
        TlsVersionFloor::Tls12 => tokio_rustls::rustls::ALL_VERSIONS,
        TlsVersionFloor::Tls13 => &[&tokio_rustls::rustls::version::TLS13],
    }
}

/// Resolve the configured cipher-suite allow-list against the crypto
/// provider's supported suites. An empty `names` accepts the provider's
/// full default set.
fn resolve_cipher_suites(names: &[String]) -> CoreResult<Vec<SupportedCipherSuite>> {
    let provider = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider();

    if names.is_empty() {
        return Ok(provider.cipher_suites.clone());
    }

    names
        .iter()
        .map(|name| {
            provider
                .cipher_suites
                .iter()
                .find(|suite| suite_name(suite).eq_ignore_ascii_case(name))
                .copied()
                .ok_or_else(|| CoreError::ConfigInvalid(format!("unknown cipher suite: {name}")))
        })
        .collect()
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Check the configured cipher-suite names resolve to suites the crypto
/// provider actually supports; called from [`Config::validate`].
pub fn validate_cipher_suite_names(names: &[String]) -> CoreResult<()> {
    resolve_cipher_suites(names).map(|_| ())
}

/// A mutually-authenticated, ordered, reliable byte stream (§3 `Transport`).
/// Distinguishes a peer-initiated close-notify from a generic I/O error so
/// the session state machine can tell the two apart (§4.6).
pub struct Transport {
    inner: TransportStream,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

enum TransportStream {
    Client(Box<client::TlsStream<TcpStream>>),
    Server(Box<server::TlsStream<TcpStream>>),
}

impl Transport {
    /// Dial the peer named by `cfg.peer`, presenting the client certificate,
    /// validating the server's chain against `material`'s trust anchors, and
    /// enforcing `tls.min_version`/`tls.cipher_suites`. Distinguishes a
    /// refused connection, a DNS failure, and a connect timeout per §7.
    pub async fn dial(
        cfg: &ClientTransportConfig,
        tls: &TlsConfig,
        material: &TlsMaterial,
    ) -> CoreResult<Self> {
        let tcp = timeout(
            Duration::from_millis(cfg.connect_timeout_ms),
            TcpStream::connect(cfg.peer),
        )
        .await
        .map_err(|_| CoreError::ConnectTimeout)?
        .map_err(CoreError::ConnectRefused)?;

        tcp.set_nodelay(true).map_err(CoreError::TransportIo)?;

        let local_addr = tcp.local_addr().map_err(CoreError::TransportIo)?;
        let remote_addr = tcp.peer_addr().map_err(CoreError::TransportIo)?;

        let suites = resolve_cipher_suites(&tls.cipher_suites)?;
        let provider = Arc::new(tokio_rustls::rustls::crypto::CryptoProvider {
            cipher_suites: suites,
            ..tokio_rustls::rustls::crypto::aws_lc_rs::default_provider()
        });

        let client_cfg = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(protocol_versions(tls.min_version))
            .map_err(|e| CoreError::ConfigInvalid(format!("building tls client config: {e}")))?
            .with_root_certificates(material.roots.clone())
            .with_client_auth_cert(material.certs(), material.key())
            .map_err(|e| CoreError::TlsAuth(e.to_string()))?;

        let server_name_str = tls
            .server_name
            .clone()
            .unwrap_or_else(|| cfg.peer.ip().to_string());
        let server_name = ServerName::try_from(server_name_str)
            .map_err(|e| CoreError::ConfigInvalid(format!("invalid tls server-name: {e}")))?;

        let connector = TlsConnector::from(Arc::new(client_cfg));
        let tls_stream = timeout(
            Duration::from_millis(cfg.handshake_timeout_ms),
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| CoreError::HandshakeTimeout)?
        .map_err(classify_handshake_error)?;

        Ok(Self {
            inner: TransportStream::Client(Box::new(tls_stream)),
            local_addr,
            remote_addr,
        })
    }

    /// Bind `cfg.listen` and return a listener that yields mutually
    /// authenticated [`Transport`]s. Every accepted connection is required
    /// to present a client certificate chaining to `material`'s trust
    /// anchors per §4.3.
    pub async fn listen(cfg: &ServerTransportConfig, tls: &TlsConfig, material: &TlsMaterial) -> CoreResult<TransportListener> {
        let listener = TcpListener::bind(cfg.listen)
            .await
            .map_err(CoreError::TransportIo)?;

        let suites = resolve_cipher_suites(&tls.cipher_suites)?;
        let provider = Arc::new(tokio_rustls::rustls::crypto::CryptoProvider {
            cipher_suites: suites,
            ..tokio_rustls::rustls::crypto::aws_lc_rs::default_provider()
        });

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(material.roots.clone()))
            .build()
            .map_err(|e| CoreError::ConfigInvalid(format!("building client verifier: {e}")))?;

        let server_cfg = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(protocol_versions(tls.min_version))
            .map_err(|e| CoreError::ConfigInvalid(format!("building tls server config: {e}")))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(material.certs(), material.key())
            .map_err(|e| CoreError::TlsAuth(e.to_string()))?;

        Ok(TransportListener {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(server_cfg)),
            handshake_timeout: Duration::from_millis(cfg.handshake_timeout_ms),
        })
    }

    /// Gracefully close: flush and send TLS close-notify (§4.7's drain
    /// behavior: "TLS close-notify is sent").
    pub async fn shutdown(&mut self) -> CoreResult<()> {
        use tokio::io::AsyncWriteExt;
        match &mut self.inner {
            TransportStream::Client(s) => s.shutdown().await,
            TransportStream::Server(s) => s.shutdown().await,
        }
        .map_err(CoreError::TransportIo)
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.inner {
            TransportStream::Client(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TransportStream::Server(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match &mut this.inner {
            TransportStream::Client(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            TransportStream::Server(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.inner {
            TransportStream::Client(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TransportStream::Server(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.inner {
            TransportStream::Client(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TransportStream::Server(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn classify_handshake_error(err: io::Error) -> CoreError {
    let message = err.to_string();
    if message.contains("AlertReceived") || message.contains("alert") {
        CoreError::TlsAlert(message)
    } else if message.contains("NoCipherSuitesInCommon") || message.contains("cipher") {
        CoreError::NoCommonCipher
    } else if message.contains("certificate") || message.contains("Certificate") {
        CoreError::TlsAuth(message)
    } else {
        CoreError::TransportIo(err)
    }
}

/// A bound listener producing mutually authenticated [`Transport`]s, one
/// per accepted and handshaken TCP connection.
pub struct TransportListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TransportListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one raw TCP connection, before any TLS is attempted. Lets the
    /// caller enforce max-concurrent-sessions by dropping excess
    /// connections "with no TLS handshake attempted" (§4.7) instead of
    /// paying for a handshake it's only going to discard.
    pub async fn accept_raw(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Drive `tcp`'s TLS handshake to completion, subject to the
    /// configured handshake timeout. Runs outside of any session's
    /// cancellation scope: a stalled handshake times out on its own and
    /// never blocks the next `accept_raw` (the caller spawns this per
    /// connection).
    pub async fn handshake(&self, tcp: TcpStream) -> CoreResult<Transport> {
        tcp.set_nodelay(true).map_err(CoreError::TransportIo)?;
        let local_addr = tcp.local_addr().map_err(CoreError::TransportIo)?;
        let remote_addr = tcp.peer_addr().map_err(CoreError::TransportIo)?;

        let tls_stream = timeout(self.handshake_timeout, self.acceptor.accept(tcp))
            .await
            .map_err(|_| CoreError::HandshakeTimeout)?
            .map_err(classify_handshake_error)?;

        Ok(Transport {
            inner: TransportStream::Server(Box::new(tls_stream)),
            local_addr,
            remote_addr,
        })
    }

    /// Convenience combining [`accept_raw`](Self::accept_raw) and
    /// [`handshake`](Self::handshake); callers that need the max-sessions
    /// gate should use the two steps separately.
    pub async fn accept(&self) -> CoreResult<Transport> {
        let (tcp, _) = self.accept_raw().await.map_err(CoreError::TransportIo)?;
        self.handshake(tcp).await
    }
}
