//! Delivery engine orchestration.

use std::sync::Arc;

use courier_common::{Signal, internal, tracing};
use courier_messenger::MessengerRegistry;
use courier_tracing::traced;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ManagerConfig,
    context::Context,
    fetcher::BatchFetcher,
    notify::Notifier,
    scheduler::Scheduler,
    store::DataSource,
    worker::Worker,
};

/// Capacity of the queue carrying lifecycle events from the fetcher to the
/// scheduler.
const EVENT_QUEUE_SIZE: usize = 64;

/// The campaign delivery engine.
///
/// Serving starts one scheduler, one fetcher and `concurrency` workers,
/// connected by bounded queues:
///
/// ```text
/// scheduler --campaigns--> fetcher --messages--> workers
///     ^                       |                     |
///     +-------events----------+                     |
///     +-------errors--------------------------------+
/// ```
pub struct Manager {
    config: ManagerConfig,
    store: Arc<dyn DataSource>,
    registry: Arc<MessengerRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn DataSource>,
        registry: Arc<MessengerRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            notifier,
        }
    }

    /// Runs the engine until a shutdown signal arrives.
    ///
    /// On shutdown the scheduler and fetcher stop at once, workers finish
    /// the message they are pushing, and every messenger is flushed and
    /// closed.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "s"))]
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) {
        let ctx = Context::new(self.config, self.store, self.registry, self.notifier);
        let concurrency = ctx.config.concurrency;

        let (fetch_tx, fetch_rx) = mpsc::channel(concurrency);
        let (delivery_tx, delivery_rx) = async_channel::bounded(concurrency * 2);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (errors_tx, errors_rx) = mpsc::channel(ctx.config.error_queue_size());

        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let scheduler = Scheduler::new(ctx.clone(), fetch_tx);
        tasks.spawn(scheduler.run(events_rx, errors_rx, token.clone()));

        let fetcher = BatchFetcher::new(ctx.clone(), delivery_tx, events_tx);
        tasks.spawn(fetcher.run(fetch_rx, token.clone()));

        for id in 0..concurrency {
            let worker = Worker::new(id, ctx.clone(), errors_tx.clone());
            tasks.spawn(worker.run(delivery_rx.clone(), token.clone()));
        }
        drop(errors_tx);
        drop(delivery_rx);

        internal!(
            level = INFO,
            "Delivery engine running with {concurrency} workers and messengers {:?}",
            ctx.registry.names()
        );

        loop {
            match shutdown.recv().await {
                Ok(Signal::Shutdown | Signal::Finalised) => {
                    internal!(level = INFO, "Delivery engine received shutdown signal");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    internal!(level = WARN, "Shutdown channel closed, stopping delivery engine");
                    break;
                }
            }
        }

        token.cancel();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                internal!(level = ERROR, "Delivery task failed: {e}");
            }
        }

        ctx.registry.close_all().await;
        internal!(level = INFO, "Delivery engine stopped");
    }
}
