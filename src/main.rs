#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sssonector::config::Config;
use sssonector::counters::{Counters, LoggingObserver};
use sssonector::supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;
    config.validate()?;

    let material = config.load_tls_material()?;
    let observer = Arc::new(LoggingObserver);
    let counters = Arc::new(Counters::default());

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown requested, draining sessions");
        shutdown_cancel.cancel();
    });

    supervisor::run(config, material, observer, counters, cancel)
        .await
        .map_err(anyhow::Error::from)
}
