//! Subscriber batch fetching and message composition.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use courier_common::{
    CAMPAIGN_HEADER, Header, SUBSCRIBER_HEADER, Subscriber, internal, tracing,
};
use courier_messenger::Message;
use courier_tracing::traced;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    campaign::ActiveCampaign,
    context::Context,
    error::{DeliveryError, SubscriberError, SystemError},
    scheduler::CampaignEvent,
};

const LIST_UNSUBSCRIBE: &str = "List-Unsubscribe";
const LIST_UNSUBSCRIBE_POST: &str = "List-Unsubscribe-Post";
const ONE_CLICK: &str = "List-Unsubscribe=One-Click";

/// A rendered message on its way to a worker.
///
/// Counts as in flight for its campaign from creation until it is dropped,
/// whether a worker pushed it, skipped it or it never left the queue.
#[derive(Debug)]
pub struct Delivery {
    campaign: Arc<ActiveCampaign>,
    message: Message,
}

impl Delivery {
    pub fn new(campaign: Arc<ActiveCampaign>, message: Message) -> Self {
        campaign.track();
        Self { campaign, message }
    }

    pub const fn campaign(&self) -> &Arc<ActiveCampaign> {
        &self.campaign
    }

    pub const fn message(&self) -> &Message {
        &self.message
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.campaign.settle();
    }
}

/// Caps the number of messages queued within a time window.
#[derive(Debug)]
struct Window {
    limit: Option<(Duration, usize)>,
    started: Instant,
    count: usize,
}

impl Window {
    fn new(ctx: &Context) -> Self {
        let window = &ctx.config.sliding_window;
        Self {
            limit: window.is_active().then(|| (window.duration(), window.rate)),
            started: Instant::now(),
            count: 0,
        }
    }

    async fn admit(&mut self) {
        let Some((duration, rate)) = self.limit else {
            return;
        };

        let elapsed = self.started.elapsed();
        if elapsed >= duration {
            self.started = Instant::now();
            self.count = 0;
        } else if self.count >= rate {
            let wait = duration.saturating_sub(elapsed);
            internal!(
                level = INFO,
                "Sliding window limit of {rate} messages reached, pausing for {wait:?}"
            );
            tokio::time::sleep(wait).await;
            self.started = Instant::now();
            self.count = 0;
        }

        self.count += 1;
    }
}

pub struct BatchFetcher {
    ctx: Context,
    deliveries: async_channel::Sender<Delivery>,
    events: mpsc::Sender<CampaignEvent>,
    window: Window,
}

impl BatchFetcher {
    pub fn new(
        ctx: Context,
        deliveries: async_channel::Sender<Delivery>,
        events: mpsc::Sender<CampaignEvent>,
    ) -> Self {
        let window = Window::new(&ctx);
        Self {
            ctx,
            deliveries,
            events,
            window,
        }
    }

    /// Fetches the campaign's next batch of subscribers and queues one
    /// message per subscriber for delivery.
    ///
    /// Returns `true` when the batch was full, meaning more subscribers may
    /// follow. Subscribers whose message fails to render are skipped.
    /// Blocks while the delivery queue is full.
    pub async fn fetch_batch(&mut self, campaign: &Arc<ActiveCampaign>) -> Result<bool, DeliveryError> {
        let batch_size = self.ctx.config.batch_size;
        let subscribers = self
            .ctx
            .store
            .next_subscribers(campaign.id(), batch_size)
            .await?;
        // A full batch may be the last one; the next fetch then comes back
        // empty, so an audience that is a multiple of the batch size costs
        // one extra call.
        let has_more = subscribers.len() == batch_size;

        tracing::debug!(
            campaign = campaign.id(),
            count = subscribers.len(),
            has_more,
            "Fetched subscriber batch"
        );

        for subscriber in subscribers {
            if campaign.is_cancelled() {
                return Ok(false);
            }

            let message = match self.compose(campaign, subscriber).await {
                Ok(message) => message,
                Err(e) => {
                    internal!(level = WARN, campaign = campaign.id(), "{e}");
                    continue;
                }
            };

            self.window.admit().await;
            self.deliveries
                .send(Delivery::new(Arc::clone(campaign), message))
                .await
                .map_err(|_| SystemError::QueueClosed("delivery"))?;
        }

        Ok(has_more)
    }

    async fn compose(
        &self,
        campaign: &Arc<ActiveCampaign>,
        subscriber: Subscriber,
    ) -> Result<Message, SubscriberError> {
        let email = subscriber.email.clone();
        let template = Arc::clone(campaign.template());

        let (subscriber, rendered) = tokio::task::spawn_blocking(move || {
            let rendered = template.render(&subscriber);
            (subscriber, rendered)
        })
        .await
        .map_err(|e| SubscriberError::Render {
            subscriber: email.clone(),
            reason: e.to_string(),
        })?;

        let rendered = rendered.map_err(|e| SubscriberError::Render {
            subscriber: email,
            reason: e.to_string(),
        })?;

        let meta = campaign.campaign();
        let campaign_uuid = meta.uuid.to_string();
        let subscriber_uuid = subscriber.uuid.to_string();

        let mut headers = vec![
            Header::new(CAMPAIGN_HEADER, campaign_uuid.as_str()),
            Header::new(SUBSCRIBER_HEADER, subscriber_uuid.as_str()),
        ];
        if self.ctx.config.unsubscribe_header {
            let url = self
                .ctx
                .links
                .urls()
                .unsubscribe(&campaign_uuid, &subscriber_uuid);
            headers.push(Header::new(LIST_UNSUBSCRIBE_POST, ONE_CLICK));
            headers.push(Header::new(LIST_UNSUBSCRIBE, format!("<{url}>")));
        }
        headers.extend(meta.headers.iter().cloned());

        Ok(Message {
            from: meta.from_email.clone(),
            to: vec![subscriber.email.clone()],
            subject: rendered.subject,
            content_type: meta.content_type,
            body: rendered.body.into_bytes(),
            alt_body: rendered.alt_body.map(String::into_bytes),
            headers,
            messenger: meta.messenger.clone(),
            campaign: Some(Arc::clone(meta)),
            subscriber,
        })
    }

    async fn report(&self, event: CampaignEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Scheduler stopped, dropping {event:?}");
        }
    }

    /// Runs until `shutdown` is cancelled or the campaign queue closes.
    ///
    /// Campaigns with more subscribers go to the back of a local queue so
    /// every active campaign gets a batch in turn.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "s"))]
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<Arc<ActiveCampaign>>,
        shutdown: CancellationToken,
    ) {
        let mut pending: VecDeque<Arc<ActiveCampaign>> = VecDeque::new();

        loop {
            while let Ok(campaign) = queue.try_recv() {
                pending.push_back(campaign);
            }

            let campaign = match pending.pop_front() {
                Some(campaign) => campaign,
                None => tokio::select! {
                    () = shutdown.cancelled() => break,
                    next = queue.recv() => match next {
                        Some(campaign) => campaign,
                        None => break,
                    },
                },
            };

            if campaign.is_cancelled() {
                continue;
            }

            let result = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.fetch_batch(&campaign) => result,
            };

            match result {
                Ok(true) if !campaign.is_cancelled() => pending.push_back(campaign),
                Ok(_) => {
                    if !campaign.is_cancelled() {
                        self.report(CampaignEvent::Exhausted(campaign.id())).await;
                    }
                }
                Err(DeliveryError::System(SystemError::QueueClosed(name))) => {
                    internal!(level = DEBUG, "The {name} queue closed, stopping fetcher");
                    break;
                }
                Err(e) => {
                    internal!(
                        level = ERROR,
                        campaign = campaign.id(),
                        "Error fetching subscribers: {e}"
                    );
                    self.report(CampaignEvent::FetchFailed(campaign.id())).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Window;

    #[tokio::test(start_paused = true)]
    async fn window_waits_for_the_next_period() {
        let mut window = Window {
            limit: Some((std::time::Duration::from_secs(60), 2)),
            started: tokio::time::Instant::now(),
            count: 0,
        };

        let start = tokio::time::Instant::now();
        window.admit().await;
        window.admit().await;
        assert_eq!(start.elapsed().as_secs(), 0);

        window.admit().await;
        assert_eq!(start.elapsed().as_secs(), 60);
        assert_eq!(window.count, 1);

    }

    #[tokio::test(start_paused = true)]
    async fn disabled_window_never_waits() {
        let mut window = Window {
            limit: None,
            started: tokio::time::Instant::now(),
            count: 0,
        };

        let start = tokio::time::Instant::now();
        for _ in 0..1000 {
            window.admit().await;
        }
        assert_eq!(start.elapsed().as_secs(), 0);
    }
}
