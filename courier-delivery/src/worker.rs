use std::time::Duration;

use courier_common::{outgoing, tracing};
use courier_tracing::traced;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{context::Context, error::SubscriberError, fetcher::Delivery, scheduler::MessageError};

/// Pushes queued messages to their messenger.
///
/// Each worker pushes at most `message_rate` messages before pausing for a
/// second.
pub struct Worker {
    id: usize,
    ctx: Context,
    errors: mpsc::Sender<MessageError>,
}

impl Worker {
    pub const fn new(id: usize, ctx: Context, errors: mpsc::Sender<MessageError>) -> Self {
        Self { id, ctx, errors }
    }

    /// Delivers a single message. Returns `true` if the messenger accepted it.
    ///
    /// Messages of cancelled campaigns are dropped without a push. Failures
    /// are reported to the scheduler without waiting; when the error queue
    /// is full the report is dropped.
    pub async fn deliver(&self, delivery: Delivery) -> bool {
        let campaign = delivery.campaign();
        let message = delivery.message();

        if campaign.is_cancelled() {
            tracing::trace!(
                worker = self.id,
                campaign = campaign.id(),
                "Dropping message of stopped campaign"
            );
            return false;
        }

        let Some(messenger) = self.ctx.registry.get(&message.messenger) else {
            self.report(campaign.id(), format!("unknown messenger {}", message.messenger));
            return false;
        };

        match messenger.push(message).await {
            Ok(()) => {
                campaign.record_sent();
                outgoing!(
                    worker = self.id,
                    campaign = campaign.id(),
                    "Pushed message to {} via {}",
                    message.subscriber.email,
                    message.messenger
                );
                true
            }
            Err(e) => {
                let error = SubscriberError::Push {
                    subscriber: message.subscriber.email.clone(),
                    reason: e.to_string(),
                };
                outgoing!(level = WARN, worker = self.id, campaign = campaign.id(), "{error}");
                self.report(campaign.id(), error.to_string());
                false
            }
        }
    }

    fn report(&self, campaign_id: i64, error: String) {
        match self.errors.try_send(MessageError { campaign_id, error }) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                tracing::debug!(
                    campaign = report.campaign_id,
                    "Error queue full, dropping report"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Runs until `shutdown` is cancelled or the delivery queue closes.
    ///
    /// A message already taken from the queue is always pushed.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(worker = self.id)))]
    pub async fn run(self, queue: async_channel::Receiver<Delivery>, shutdown: CancellationToken) {
        let rate = self.ctx.config.message_rate;
        let mut attempts = 0usize;
        let mut delivered = 0usize;

        loop {
            let delivery = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Ok(delivery) => delivery,
                    Err(_) => break,
                },
            };

            let cancelled = delivery.campaign().is_cancelled();
            if self.deliver(delivery).await {
                delivered += 1;
            }

            if !cancelled {
                attempts += 1;
                if attempts >= rate {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    attempts = 0;
                }
            }
        }

        tracing::debug!(worker = self.id, delivered, "Worker stopped");
    }
}
