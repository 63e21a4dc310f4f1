//! Contract with the persistence layer.

pub mod memory;

use async_trait::async_trait;
use courier_common::{Campaign, CampaignStatus, Subscriber};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Campaign {0} not found")]
    NotFound(i64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Everything the engine needs from the persistence layer.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Campaigns that are due (scheduled and past `send_at`, or running),
    /// skipping the given ids.
    async fn next_campaigns(&self, exclude: &[i64]) -> Result<Vec<Campaign>, StoreError>;

    /// Next batch of the campaign's audience, ordered by ascending
    /// subscriber id and strictly after the last batch handed out.
    async fn next_subscribers(
        &self,
        campaign_id: i64,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError>;

    /// Authoritative snapshot of a campaign.
    async fn get_campaign(&self, id: i64) -> Result<Campaign, StoreError>;

    async fn update_campaign_status(
        &self,
        id: i64,
        status: CampaignStatus,
    ) -> Result<(), StoreError>;

    /// Adds `sent` to the campaign's running total of delivered messages.
    ///
    /// Called once per processing run, after the campaign left the active
    /// set and its queued messages were pushed or dropped.
    async fn update_campaign_counts(&self, id: i64, sent: usize) -> Result<(), StoreError>;

    /// Durable tracking id for `url`. The same url always yields the same id.
    async fn create_link(&self, url: &str) -> Result<String, StoreError>;
}
