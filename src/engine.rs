//! The bidirectional forwarding engine (§4.5): two independent unidirectional
//! copiers wired between an [`Adapter`](crate::adapter) and a
//! [`Transport`](crate::transport). Each copier is a `tokio::select!` loop so
//! every suspension point (adapter I/O, transport I/O, rate-limiter wait) is
//! raced against the session's shared cancellation token, per §5's
//! "every suspension point MUST be cancellable" requirement.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::adapter::{PacketSink, PacketSource};
use crate::counters::{Counters, Observer};
use crate::error::{CoreError, CoreResult};
use crate::framing::{self, MTU_CAP};
use crate::ratelimit::TokenBucket;

/// Read-side keepalive deadline as a multiple of the configured heartbeat
/// cadence; three missed heartbeats is the conventional dead-peer
/// threshold.
const KEEPALIVE_DEADLINE_MULTIPLIER: u32 = 3;

pub struct ForwardingEngine {
    pub mtu: usize,
    pub egress_limiter: Option<Arc<TokenBucket>>,
    pub ingress_limiter: Option<Arc<TokenBucket>>,
    pub counters: Arc<Counters>,
    pub observer: Arc<dyn Observer>,
    pub peer_label: String,
    /// Grace window for the surviving direction to drain once the other
    /// side finishes (§4.5, §4.7's "request each session to drain with a
    /// shared deadline").
    pub drain_grace: Duration,
    /// Application-level keepalive cadence (§4.3). `None` (the default)
    /// disables heartbeats entirely: egress never emits them and ingress
    /// enforces no read deadline.
    pub keepalive_interval: Option<Duration>,
}

impl ForwardingEngine {
    /// Run until one side reports a fatal error, the peer closes cleanly, or
    /// `cancel` fires. Returns `Ok(())` only on cancellation; a clean peer
    /// close is reported as `Err(CoreError::PeerClose)` so callers can tell
    /// it apart from every other reason the engine stopped.
    pub async fn run<T, S, K>(
        &self,
        mut adapter_reader: S,
        mut adapter_writer: K,
        transport: T,
        cancel: CancellationToken,
    ) -> CoreResult<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        S: PacketSource,
        K: PacketSink,
    {
        let (mut transport_reader, mut transport_writer) = tokio::io::split(transport);

        let egress_cancel = cancel.clone();
        let egress = self.egress_loop(&mut adapter_reader, &mut transport_writer, egress_cancel);

        let ingress_cancel = cancel.clone();
        let ingress = self.ingress_loop(&mut transport_reader, &mut adapter_writer, ingress_cancel);

        tokio::pin!(egress);
        tokio::pin!(ingress);

        // Whichever side finishes first decides the outcome; the other is
        // cancelled and given a short grace window to drain before we move
        // on (§4.5's drain deadline).
        let result = tokio::select! {
            r = &mut egress => {
                cancel.cancel();
                let _ = tokio::time::timeout(self.drain_grace, &mut ingress).await;
                r
            }
            r = &mut ingress => {
                cancel.cancel();
                let _ = tokio::time::timeout(self.drain_grace, &mut egress).await;
                r
            }
        };

        // Send TLS close-notify on the way out regardless of outcome (§4.7:
        // "TLS close-notify is sent"). Best-effort: a transport that's
        // already broken can't be shut down any more gracefully than this.
        let mut transport = tokio::io::unsplit(transport_reader, transport_writer);
        let _ = transport.shutdown().await;

        result
    }

    async fn egress_loop<W, S>(
        &self,
        adapter: &mut S,
        transport: &mut W,
        cancel: CancellationToken,
    ) -> CoreResult<()>
    where
        W: AsyncWrite + Unpin,
        S: PacketSource,
    {
        // Sized to the wire cap, not `self.mtu`: a source that hands back more
        // than the configured interface MTU must still be caught by the
        // oversize check below instead of erroring out for not fitting.
        let mut buf = vec![0u8; MTU_CAP];
        let mut heartbeat = self.keepalive_interval.map(tokio::time::interval);

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = heartbeat_tick(&mut heartbeat) => {
                    if let Err(err) = framing::encode_heartbeat(transport).await {
                        return Err(self.classify_egress_encode_error(err));
                    }
                    continue;
                }
                r = adapter.read_packet(&mut buf) => r?,
            };

            if n == 0 {
                continue;
            }

            if n > self.mtu {
                self.counters.egress.add_oversize_drop();
                self.observer.on_oversize_drop(&self.peer_label, n);
                continue;
            }

            if let Some(limiter) = &self.egress_limiter {
                let wait = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    w = limiter.acquire(n as u64) => w,
                };
                if wait > Duration::ZERO {
                    self.counters.egress.add_rate_limit_wait(wait);
                    self.observer.on_rate_limit_wait(&self.peer_label, wait);
                }
            }

            if let Err(err) = framing::encode(transport, &buf[..n], MTU_CAP).await {
                return Err(self.classify_egress_encode_error(err));
            }

            self.counters.egress.add_frame(n);
        }
    }

    /// Turn an encode failure into the counted, observed `CoreError` it
    /// belongs to: a rejected payload is a framing error, a failed write is
    /// a transport error (§6, §7: the two are distinct counters and
    /// distinct error rows, and a write failure is never frame corruption).
    fn classify_egress_encode_error(&self, err: framing::EncodeError) -> CoreError {
        match err {
            framing::EncodeError::Invalid(framing_err) => {
                self.counters.egress.add_framing_error();
                self.observer.on_framing_error(&self.peer_label, &framing_err.to_string());
                CoreError::Framing(framing_err)
            }
            framing::EncodeError::Io(io_err) => {
                self.counters.egress.add_transport_error();
                self.observer.on_transport_error(&self.peer_label, &io_err.to_string());
                CoreError::TransportIo(io_err)
            }
        }
    }

    async fn ingress_loop<R, K>(
        &self,
        transport: &mut R,
        adapter: &mut K,
        cancel: CancellationToken,
    ) -> CoreResult<()>
    where
        R: AsyncRead + Unpin,
        K: PacketSink,
    {
        let mut buf = vec![0u8; MTU_CAP];
        let deadline = self
            .keepalive_interval
            .map(|interval| interval * KEEPALIVE_DEADLINE_MULTIPLIER);

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                r = ingress_read(transport, &mut buf, deadline) => r,
            };

            let n = match outcome {
                Ok(IngressOutcome::Packet(n)) => n,
                Ok(IngressOutcome::Heartbeat) => continue,
                // Clean EOF at a frame boundary: the peer sent close-notify.
                // Not a counted error (§4.3's distinguished `PeerClose`
                // condition, not a wire fault).
                Ok(IngressOutcome::Eof) => return Err(CoreError::PeerClose),
                Err(CoreError::Framing(err)) => {
                    self.counters.ingress.add_framing_error();
                    self.observer.on_framing_error(&self.peer_label, &err.to_string());
                    return Err(CoreError::Framing(err));
                }
                Err(err) => {
                    self.counters.ingress.add_transport_error();
                    self.observer.on_transport_error(&self.peer_label, &err.to_string());
                    return Err(err);
                }
            };

            if n > self.mtu {
                self.counters.ingress.add_oversize_drop();
                self.observer.on_oversize_drop(&self.peer_label, n);
                continue;
            }

            if let Some(limiter) = &self.ingress_limiter {
                let wait = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    w = limiter.acquire(n as u64) => w,
                };
                if wait > Duration::ZERO {
                    self.counters.ingress.add_rate_limit_wait(wait);
                    self.observer.on_rate_limit_wait(&self.peer_label, wait);
                }
            }

            adapter.write_packet(&buf[..n]).await.map_err(|err| {
                self.counters.ingress.add_transport_error();
                self.observer.on_transport_error(&self.peer_label, &err.to_string());
                err
            })?;

            self.counters.ingress.add_frame(n);
        }
    }
}

/// Await the next heartbeat tick, or never resolve if keepalive is disabled.
/// Keeps `egress_loop`'s `select!` uniform across the configured/unconfigured
/// cases instead of duplicating the loop body.
async fn heartbeat_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

enum IngressOutcome {
    Packet(usize),
    Heartbeat,
    Eof,
}

/// Read one frame-boundary outcome from `transport`. When `deadline` is
/// `Some`, heartbeats are recognized and consumed transparently and the read
/// is bounded by the keepalive deadline; otherwise this is a thin wrapper
/// over the strict codec, which never produces `Heartbeat`.
async fn ingress_read<R: AsyncRead + Unpin>(
    transport: &mut R,
    buf: &mut [u8],
    deadline: Option<Duration>,
) -> CoreResult<IngressOutcome> {
    match deadline {
        Some(deadline) => {
            let outcome = tokio::time::timeout(deadline, framing::decode_allow_heartbeat(transport, buf, MTU_CAP))
                .await
                .map_err(|_| CoreError::KeepaliveTimeout)?
                .map_err(CoreError::Framing)?;

            Ok(match outcome {
                framing::DecodeOutcome::Packet(n) => IngressOutcome::Packet(n),
                framing::DecodeOutcome::Heartbeat => IngressOutcome::Heartbeat,
                framing::DecodeOutcome::Eof => IngressOutcome::Eof,
            })
        }
        None => {
            let outcome = framing::decode(transport, buf, MTU_CAP)
                .await
                .map_err(CoreError::Framing)?;

            Ok(match outcome {
                Some(n) => IngressOutcome::Packet(n),
                None => IngressOutcome::Eof,
            })
        }
    }
}
