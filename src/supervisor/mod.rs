//! The process-wide supervisor (§3 `Supervisor`, §4.6, §4.7): owns at most
//! one [`Session`](crate::session) on the Client, or a listener plus a
//! bounded set of sessions on the Server.

pub mod client;
pub mod server;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::counters::{Counters, Observer};
use crate::error::CoreResult;
use crate::transport::TlsMaterial;

/// Entry point dispatched by `main` once configuration is loaded and
/// validated: run the client reconnect loop or the server accept loop
/// until `cancel` fires.
pub async fn run(
    config: Config,
    material: TlsMaterial,
    observer: Arc<dyn Observer>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> CoreResult<()> {
    match config.role {
        crate::config::Role::Client => {
            client::run(&config, &material, observer, counters, cancel).await
        }
        crate::config::Role::Server => {
            server::run(&config, &material, observer, counters, cancel).await
        }
    }
}
