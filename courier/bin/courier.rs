#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

use std::sync::Arc;

use courier::{Courier, find_config_file};
use courier_bounce::LogRecorder;
use courier_delivery::{LogNotifier, MemoryDataSource};

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

/// Runs courier against the in-memory store. Campaigns are never due until
/// an embedding application inserts them, so this mainly exercises the
/// configuration, the messengers and the bounce pipeline.
///
/// Provider webhooks are served on `POST /webhooks/service/{provider}` when
/// the configuration has a `listener` section.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let courier = Courier::load(&find_config_file()?)?;

    let services = courier.build(
        Arc::new(MemoryDataSource::new()),
        Arc::new(LogRecorder),
        Arc::new(LogNotifier),
    )?;

    services.run().await
}
