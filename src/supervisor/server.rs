//! Server-side supervisor (§4.7): accept connections, enforce
//! max-concurrent-sessions, and run one session per accepted connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::counters::{Counters, ObservedState, Observer};
use crate::error::CoreResult;
use crate::session::{self, SessionDeps};
use crate::transport::{Transport, TlsMaterial};

pub async fn run(
    config: &Config,
    material: &TlsMaterial,
    observer: Arc<dyn Observer>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> CoreResult<()> {
    let server_cfg = config
        .server
        .as_ref()
        .expect("validated Config guarantees [server] for Role::Server");

    let listener = Transport::listen(server_cfg, &config.tls, material).await?;
    let bind_label = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| server_cfg.listen.to_string());

    observer.on_state_change(&bind_label, ObservedState::Listening, "accepting connections");

    let active = Arc::new(AtomicUsize::new(0));
    let next_id = Arc::new(AtomicUsize::new(0));
    let sessions = Arc::new(Mutex::new(Vec::new()));
    let max_sessions = server_cfg.max_sessions;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = listener.accept_raw() => r,
        };

        let (tcp, remote_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("accept failed: {err}");
                continue;
            }
        };

        if active.load(Ordering::SeqCst) >= max_sessions {
            log::warn!("rejecting connection from {remote_addr}: at max-sessions ({max_sessions})");
            drop(tcp);
            continue;
        }

        let transport = match listener.handshake(tcp).await {
            Ok(t) => t,
            Err(err) => {
                log::warn!("handshake failed: peer={remote_addr}, err={err}");
                continue;
            }
        };

        let session_id = next_id.fetch_add(1, Ordering::SeqCst);
        active.fetch_add(1, Ordering::SeqCst);

        let deps = SessionDeps {
            counters: counters.clone(),
            observer: observer.clone(),
        };
        let session_cancel = cancel.child_token();
        let config = config.clone();
        let drain_grace_ms = server_cfg.drain_grace_ms;
        let active_for_task = active.clone();

        let handle = tokio::spawn(async move {
            let result = session::run_accepted_session(
                &config,
                transport,
                session_id,
                drain_grace_ms,
                &deps,
                session_cancel,
            )
            .await;

            if let Err(err) = &result {
                log::warn!("session {session_id} ended: peer={remote_addr}, err={err}");
            }

            active_for_task.fetch_sub(1, Ordering::SeqCst);
        });

        // Prune finished handles before tracking the new one, rather than
        // only at listener shutdown: otherwise this grows by one entry per
        // connection ever accepted over the server's lifetime.
        let mut sessions = sessions.lock().await;
        sessions.retain(|h| !h.is_finished());
        sessions.push(handle);
    }

    observer.on_state_change(&bind_label, ObservedState::Draining, "shutting down listener");

    let handles: Vec<_> = sessions.lock().await.drain(..).collect();
    let drain_deadline = Duration::from_millis(server_cfg.drain_grace_ms);
    let _ = tokio::time::timeout(drain_deadline, join_all(handles)).await;

    observer.on_state_change(&bind_label, ObservedState::Closed, "listener closed");

    Ok(())
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
