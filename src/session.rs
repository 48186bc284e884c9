//! The session lifecycle (§4.6): one [`VirtualInterface`](crate::adapter)
//! plus one [`Transport`](crate::transport) plus the two forwarders that
//! connect them, from Dialing/Handshaking through Running to Closed.
//! `Backoff` is not a state a `Session` ever occupies: it's the gap
//! between one failed attempt and the next, owned by the client supervisor
//! (§3: "Supervisor ... owns at most one Session").

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::adapter::{self, AdapterHandle};
use crate::config::{ClientTransportConfig, Config, InterfaceConfig, TlsConfig};
use crate::counters::{Counters, ObservedState, Observer};
use crate::engine::ForwardingEngine;
use crate::error::{CoreError, CoreResult};
use crate::ratelimit;
use crate::transport::{Transport, TlsMaterial};

/// Everything a session needs that outlives any single attempt.
pub struct SessionDeps {
    pub counters: Arc<Counters>,
    pub observer: Arc<dyn Observer>,
}

/// Drive one client-side attempt: dial, handshake, bring up the adapter,
/// run the forwarding engine, then tear everything down. Returns the
/// terminal error (if any) so the caller's backoff loop can classify it.
pub async fn run_client_attempt(
    config: &Config,
    material: &TlsMaterial,
    deps: &SessionDeps,
    cancel: CancellationToken,
) -> CoreResult<()> {
    let client_cfg = config
        .client
        .as_ref()
        .expect("validated Config guarantees [client] for Role::Client");
    let peer_label = client_cfg.peer.to_string();

    deps.observer
        .on_state_change(&peer_label, ObservedState::Dialing, "connecting");

    let transport = dial_with_cancellation(client_cfg, &config.tls, material, &cancel).await?;

    run_established(config, &peer_label, transport, client_cfg.drain_grace_ms, None, deps, cancel).await
}

async fn dial_with_cancellation(
    client_cfg: &ClientTransportConfig,
    tls: &TlsConfig,
    material: &TlsMaterial,
    cancel: &CancellationToken,
) -> CoreResult<Transport> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoreError::Cancelled),
        r = Transport::dial(client_cfg, tls, material) => r,
    }
}

/// Drive one server-side session from an already-accepted, already
/// handshaken [`Transport`] (§4.7: the listener performs accept+handshake;
/// everything after that is session lifecycle). `session_id` fills the
/// `{id}` placeholder in a multi-session interface-name template.
pub async fn run_accepted_session(
    config: &Config,
    transport: Transport,
    session_id: usize,
    drain_grace_ms: u64,
    deps: &SessionDeps,
    cancel: CancellationToken,
) -> CoreResult<()> {
    let peer_label = transport.remote_addr.to_string();
    run_established(
        config,
        &peer_label,
        transport,
        drain_grace_ms,
        Some(session_id),
        deps,
        cancel,
    )
    .await
}

async fn run_established(
    config: &Config,
    peer_label: &str,
    transport: Transport,
    drain_grace_ms: u64,
    session_id: Option<usize>,
    deps: &SessionDeps,
    cancel: CancellationToken,
) -> CoreResult<()> {
    deps.observer.on_state_change(
        peer_label,
        ObservedState::Handshaking,
        "tls handshake complete, bringing up adapter",
    );

    let interface = InterfaceConfig {
        name: adapter::resolve_name_template(&config.interface.name, session_id.unwrap_or(0)),
        ..config.interface.clone()
    };

    let adapter = AdapterHandle::open(&interface)?;
    adapter.up()?;
    let (adapter_reader, adapter_writer) = adapter.split();

    let (egress_limiter, ingress_limiter) = ratelimit::build_limiters(&config.rate_limit);

    let engine = ForwardingEngine {
        mtu: config.interface.mtu as usize,
        egress_limiter,
        ingress_limiter,
        counters: deps.counters.clone(),
        observer: deps.observer.clone(),
        peer_label: peer_label.to_string(),
        drain_grace: Duration::from_millis(drain_grace_ms),
        keepalive_interval: config.keepalive_interval_ms.map(Duration::from_millis),
    };

    deps.observer
        .on_state_change(peer_label, ObservedState::Running, "forwarding");

    let result = engine.run(adapter_reader, adapter_writer, transport, cancel).await;

    deps.observer
        .on_state_change(peer_label, ObservedState::Draining, "forwarders stopped");

    AdapterHandle::close(&interface.name);

    deps.observer
        .on_state_change(peer_label, ObservedState::Closed, "session torn down");

    result
}
