//! Campaign scheduling and lifecycle.
//!
//! The scheduler is the single owner of the active set. It picks up due
//! campaigns on every tick, hands them to the fetcher, finishes them when
//! their audience is exhausted and pauses them when too many messages fail.

use std::{collections::HashMap, sync::Arc};

use courier_common::{Campaign, CampaignStatus, internal, tracing};
use courier_tracing::traced;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    campaign::ActiveCampaign,
    context::Context,
    error::{CampaignError, DeliveryError},
    notify::Notification,
    template::CampaignTemplate,
};

/// Reason attached to the notification of a campaign paused by the error
/// threshold.
pub const TOO_MANY_ERRORS: &str = "Too many errors";

/// Lifecycle events reported by the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignEvent {
    /// A fetch returned fewer subscribers than requested.
    Exhausted(i64),
    /// A fetch failed; the campaign is enqueued again on the next tick.
    FetchFailed(i64),
}

/// A failed push reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageError {
    pub campaign_id: i64,
    pub error: String,
}

struct Entry {
    campaign: Arc<ActiveCampaign>,
    queued: bool,
}

pub struct Scheduler {
    ctx: Context,
    fetch_queue: mpsc::Sender<Arc<ActiveCampaign>>,
    active: HashMap<i64, Entry>,
    error_counts: HashMap<i64, u64>,
    counting: JoinSet<()>,
}

impl Scheduler {
    pub fn new(ctx: Context, fetch_queue: mpsc::Sender<Arc<ActiveCampaign>>) -> Self {
        Self {
            ctx,
            fetch_queue,
            active: HashMap::new(),
            error_counts: HashMap::new(),
            counting: JoinSet::new(),
        }
    }

    /// Ids of the campaigns currently being processed, ascending.
    pub fn active_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_active(&self, campaign_id: i64) -> bool {
        self.active.contains_key(&campaign_id)
    }

    pub fn active_campaign(&self, campaign_id: i64) -> Option<&Arc<ActiveCampaign>> {
        self.active.get(&campaign_id).map(|entry| &entry.campaign)
    }

    /// Failures counted against the campaign since it was last paused.
    pub fn error_count(&self, campaign_id: i64) -> u64 {
        self.error_counts.get(&campaign_id).copied().unwrap_or_default()
    }

    /// Picks up newly due campaigns and enqueues them for fetching.
    ///
    /// Campaigns that could not be enqueued on an earlier tick, because the
    /// fetch queue was full or their last fetch failed, are retried first.
    /// Returns the number of campaigns that entered the active set.
    pub async fn tick(&mut self) -> Result<usize, DeliveryError> {
        self.enqueue_pending();

        let exclude = self.active_ids();
        let campaigns = self.ctx.store.next_campaigns(&exclude).await?;

        let mut started = 0;
        for campaign in campaigns {
            if self.active.contains_key(&campaign.id) {
                continue;
            }

            match self.start(campaign).await {
                Ok(()) => started += 1,
                Err(e) => internal!(level = ERROR, "{e}"),
            }
        }

        Ok(started)
    }

    async fn start(&mut self, campaign: Campaign) -> Result<(), DeliveryError> {
        let campaign = Arc::new(campaign);

        if !self.ctx.registry.contains(&campaign.messenger) {
            let error = CampaignError::UnknownMessenger {
                campaign: campaign.name.clone(),
                messenger: campaign.messenger.clone(),
            };
            self.transition(&campaign, CampaignStatus::Cancelled, Some(error.to_string()))
                .await;
            return Err(error.into());
        }

        let template = match CampaignTemplate::compile(Arc::clone(&campaign), &self.ctx.links) {
            Ok(template) => template,
            Err(error) => {
                self.transition(&campaign, CampaignStatus::Paused, Some(error.to_string()))
                    .await;
                return Err(error.into());
            }
        };

        let active = Arc::new(ActiveCampaign::new(template));
        let queued = enqueue(&self.fetch_queue, &active);

        internal!(
            level = INFO,
            campaign = campaign.id,
            queued,
            "Start processing campaign ({})",
            campaign.name
        );

        self.active.insert(
            campaign.id,
            Entry {
                campaign: active,
                queued,
            },
        );

        Ok(())
    }

    fn enqueue_pending(&mut self) {
        for entry in self.active.values_mut().filter(|entry| !entry.queued) {
            entry.queued = enqueue(&self.fetch_queue, &entry.campaign);
        }
    }

    /// Counts a failed push against the campaign's error threshold.
    ///
    /// Returns `true` if this report paused the campaign. Reports for
    /// campaigns that already left the active set are ignored.
    pub async fn on_message_error(&mut self, campaign_id: i64, error: &str) -> bool {
        let threshold = match u64::try_from(self.ctx.config.max_send_errors) {
            Ok(threshold) if threshold > 0 => threshold,
            _ => return false,
        };

        if !self.active.contains_key(&campaign_id) {
            tracing::trace!(campaign = campaign_id, "Ignoring error for inactive campaign");
            return false;
        }

        let count = self.error_counts.entry(campaign_id).or_default();
        *count += 1;
        tracing::debug!(
            campaign = campaign_id,
            count = *count,
            threshold,
            "Message error: {error}"
        );

        if *count < threshold {
            return false;
        }

        self.error_counts.remove(&campaign_id);
        let Some(entry) = self.active.remove(&campaign_id) else {
            return false;
        };
        entry.campaign.cancel();
        self.save_counts(Arc::clone(&entry.campaign));

        let campaign = Arc::clone(entry.campaign.campaign());
        internal!(
            level = WARN,
            campaign = campaign_id,
            "{}",
            CampaignError::TooManyErrors(campaign.name.clone())
        );
        self.transition(
            &campaign,
            CampaignStatus::Paused,
            Some(TOO_MANY_ERRORS.to_string()),
        )
        .await;

        true
    }

    /// Finishes a campaign whose audience has been fully fetched.
    ///
    /// Messages already queued are still delivered. Only a campaign the
    /// store still reports as running moves to finished; any other status
    /// was set by an operator and is left untouched. Exhausting a campaign
    /// that is not active is a no-op.
    pub async fn exhaust(&mut self, campaign_id: i64) {
        let Some(entry) = self.active.remove(&campaign_id) else {
            tracing::debug!(campaign = campaign_id, "Campaign already left the active set");
            return;
        };
        self.error_counts.remove(&campaign_id);
        self.save_counts(Arc::clone(&entry.campaign));

        match self.ctx.store.get_campaign(campaign_id).await {
            Ok(campaign) if campaign.status == CampaignStatus::Running => {
                internal!(
                    level = INFO,
                    campaign = campaign_id,
                    sent = entry.campaign.sent(),
                    "Campaign ({}) finished",
                    campaign.name
                );
                self.transition(&campaign, CampaignStatus::Finished, None)
                    .await;
            }
            Ok(campaign) => {
                entry.campaign.cancel();
                internal!(
                    level = INFO,
                    campaign = campaign_id,
                    "Stop processing campaign ({}), status is {}",
                    campaign.name,
                    campaign.status
                );
            }
            Err(e) => {
                internal!(
                    level = ERROR,
                    campaign = campaign_id,
                    "Failed to load campaign after it was exhausted: {e}"
                );
            }
        }
    }

    /// Adds the campaign's sent count to the store once every message it
    /// queued has been pushed or dropped.
    fn save_counts(&mut self, campaign: Arc<ActiveCampaign>) {
        let store = Arc::clone(&self.ctx.store);

        self.counting.spawn(async move {
            campaign.drained().await;

            let sent = campaign.sent();
            match store.update_campaign_counts(campaign.id(), sent).await {
                Ok(()) => tracing::debug!(campaign = campaign.id(), sent, "Saved campaign counts"),
                Err(e) => internal!(
                    level = ERROR,
                    campaign = campaign.id(),
                    "Failed to save campaign counts: {e}"
                ),
            }
        });
    }

    /// Waits for every pending count update to reach the store.
    pub async fn counts_saved(&mut self) {
        while let Some(result) = self.counting.join_next().await {
            if let Err(e) = result {
                internal!(level = ERROR, "Count update task failed: {e}");
            }
        }
    }

    fn fetch_failed(&mut self, campaign_id: i64) {
        if let Some(entry) = self.active.get_mut(&campaign_id) {
            entry.queued = false;
        }
    }

    pub async fn handle(&mut self, event: CampaignEvent) {
        match event {
            CampaignEvent::Exhausted(id) => self.exhaust(id).await,
            CampaignEvent::FetchFailed(id) => self.fetch_failed(id),
        }
    }

    async fn transition(&self, campaign: &Campaign, status: CampaignStatus, reason: Option<String>) {
        if let Err(e) = self
            .ctx
            .store
            .update_campaign_status(campaign.id, status)
            .await
        {
            internal!(
                level = ERROR,
                campaign = campaign.id,
                "Failed to set campaign status to {status}: {e}"
            );
        }

        self.ctx
            .notifier
            .notify(Notification {
                campaign_id: campaign.id,
                campaign_name: campaign.name.clone(),
                status,
                reason,
            })
            .await;
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// The first scan happens immediately. Campaigns still active on
    /// shutdown keep their running status and are picked up again on the
    /// next start.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "s"))]
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<CampaignEvent>,
        mut errors: mpsc::Receiver<MessageError>,
        shutdown: CancellationToken,
    ) {
        let mut timer = tokio::time::interval(self.ctx.config.scan_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let scan = self.ctx.config.scan_campaigns;

        if !scan {
            internal!(level = INFO, "Campaign scanning is disabled");
        }

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(event) = events.recv() => self.handle(event).await,
                Some(report) = errors.recv() => {
                    self.on_message_error(report.campaign_id, &report.error).await;
                }
                Some(result) = self.counting.join_next(), if !self.counting.is_empty() => {
                    if let Err(e) = result {
                        internal!(level = ERROR, "Count update task failed: {e}");
                    }
                }
                _ = timer.tick(), if scan => {
                    match self.tick().await {
                        Ok(started) if started > 0 => {
                            tracing::debug!("Started {started} campaigns");
                        }
                        Ok(_) => {}
                        Err(e) => internal!(level = ERROR, "Error scanning campaigns: {e}"),
                    }
                }
            }
        }

        internal!(
            level = INFO,
            "Scheduler stopped with {} active campaigns",
            self.active.len()
        );

        // Queued messages are dropped as the other tasks stop, which lets
        // these drain.
        let active: Vec<_> = self.active.values().map(|e| Arc::clone(&e.campaign)).collect();
        for campaign in active {
            self.save_counts(campaign);
        }
        self.counts_saved().await;
    }
}

fn enqueue(queue: &mpsc::Sender<Arc<ActiveCampaign>>, campaign: &Arc<ActiveCampaign>) -> bool {
    match queue.try_send(Arc::clone(campaign)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::debug!(
                campaign = campaign.id(),
                "Fetch queue full, campaign waits for the next tick"
            );
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
