use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use courier_common::Campaign;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::template::CampaignTemplate;

/// A campaign owned by the engine.
///
/// The scheduler is the only owner of the active set; fetcher and workers
/// hold clones of this handle and learn that the campaign was paused or
/// cancelled through its token.
pub struct ActiveCampaign {
    campaign: Arc<Campaign>,
    template: Arc<CampaignTemplate>,
    token: CancellationToken,
    sent: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl ActiveCampaign {
    pub fn new(template: CampaignTemplate) -> Self {
        Self {
            campaign: Arc::clone(template.campaign()),
            template: Arc::new(template),
            token: CancellationToken::new(),
            sent: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.campaign.id
    }

    pub fn campaign(&self) -> &Arc<Campaign> {
        &self.campaign
    }

    pub fn template(&self) -> &Arc<CampaignTemplate> {
        &self.template
    }

    /// Stop delivering: messages not yet pulled by a worker are dropped.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages handed to a messenger successfully.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn track(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn settle(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Messages composed for this campaign that no worker has finished with.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Resolves once every message composed so far has been pushed or
    /// dropped.
    pub async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl std::fmt::Debug for ActiveCampaign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCampaign")
            .field("id", &self.campaign.id)
            .field("name", &self.campaign.name)
            .field("cancelled", &self.is_cancelled())
            .field("sent", &self.sent())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
