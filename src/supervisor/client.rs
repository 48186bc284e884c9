//! Client-side supervisor: dial, run a session to completion, then
//! reconnect with exponential backoff and jitter (§4.6's Backoff state).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ReconnectPolicy};
use crate::counters::{Counters, ObservedState, Observer};
use crate::error::{CoreError, CoreResult};
use crate::session::{self, SessionDeps};
use crate::transport::TlsMaterial;

pub async fn run(
    config: &Config,
    material: &TlsMaterial,
    observer: Arc<dyn Observer>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> CoreResult<()> {
    let client_cfg = config
        .client
        .as_ref()
        .expect("validated Config guarantees [client] for Role::Client");
    let peer_label = client_cfg.peer.to_string();
    let policy = &client_cfg.reconnect;

    let deps = SessionDeps {
        counters,
        observer: observer.clone(),
    };

    let mut delay_ms = policy.initial_ms;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let outcome = session::run_client_attempt(config, material, &deps, cancel.clone()).await;

        if cancel.is_cancelled() {
            return Ok(());
        }

        match outcome {
            Ok(()) => {
                delay_ms = policy.initial_ms;
                attempt = 0;
                continue;
            }
            Err(CoreError::Cancelled) => return Ok(()),
            Err(CoreError::PeerClose) => {
                // Graceful peer close: reset backoff and retry immediately,
                // same as a freshly-started supervisor would (§4.6's
                // `PeerClose` event: "graceful Drain, reconnect if Client").
                log::info!("peer closed the connection: peer={peer_label}, reconnecting");
                delay_ms = policy.initial_ms;
                attempt = 0;
                continue;
            }
            Err(err) => {
                attempt += 1;

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        log::error!(
                            "giving up after {attempt} attempts: peer={peer_label}, err={err}"
                        );
                        return Err(err);
                    }
                }

                log::warn!("session attempt {attempt} failed: peer={peer_label}, err={err}");
            }
        }

        let wait = next_backoff(policy, delay_ms);
        observer.on_state_change(
            &peer_label,
            ObservedState::Backoff,
            &format!("retrying in {wait:?} (attempt {attempt})"),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(wait) => {}
        }

        delay_ms = ((delay_ms as f64) * policy.multiplier)
            .min(policy.max_ms as f64)
            .max(policy.initial_ms as f64) as u64;
    }
}

fn next_backoff(policy: &ReconnectPolicy, delay_ms: u64) -> Duration {
    let jitter_span = (delay_ms as f64) * policy.jitter;
    let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let jittered = (delay_ms as f64 + offset).max(0.0);
    Duration::from_millis(jittered as u64)
}
