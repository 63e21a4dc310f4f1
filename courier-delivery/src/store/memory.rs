use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use courier_common::{Campaign, CampaignStatus, Subscriber};
use parking_lot::RwLock;

use super::{DataSource, StoreError};

#[derive(Debug, Default)]
struct State {
    campaigns: BTreeMap<i64, Campaign>,
    /// Audience per campaign, sorted by subscriber id
    audiences: HashMap<i64, Vec<Subscriber>>,
    /// Last subscriber id handed out per campaign
    cursors: HashMap<i64, i64>,
    links: HashMap<String, String>,
    fetch_calls: HashMap<i64, usize>,
    status_updates: Vec<(i64, CampaignStatus)>,
    sent: HashMap<i64, usize>,
    count_updates: Vec<(i64, usize)>,
}

/// In-memory data source
///
/// Keeps campaigns, audiences and links in a single `RwLock`ed state. It is
/// intended for tests and demos; it also counts calls so tests can assert on
/// how the engine used it.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataSource {
    state: Arc<RwLock<State>>,
    link_registrations: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryDataSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.state.write().campaigns.insert(campaign.id, campaign);
    }

    /// Add subscribers to a campaign's audience.
    pub fn insert_subscribers(
        &self,
        campaign_id: i64,
        subscribers: impl IntoIterator<Item = Subscriber>,
    ) {
        let mut state = self.state.write();
        let audience = state.audiences.entry(campaign_id).or_default();
        audience.extend(subscribers);
        audience.sort_by_key(|s| s.id);
        audience.dedup_by_key(|s| s.id);
    }

    /// Change a campaign's status the way an administrator would, without
    /// recording it as an engine update.
    pub fn set_status(&self, id: i64, status: CampaignStatus) {
        if let Some(campaign) = self.state.write().campaigns.get_mut(&id) {
            campaign.status = status;
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn campaign(&self, id: i64) -> Option<Campaign> {
        self.state.read().campaigns.get(&id).cloned()
    }

    /// Number of `next_subscribers` calls made for a campaign.
    #[must_use]
    pub fn fetch_calls(&self, campaign_id: i64) -> usize {
        self.state
            .read()
            .fetch_calls
            .get(&campaign_id)
            .copied()
            .unwrap_or_default()
    }

    /// Number of `create_link` calls made so far.
    #[must_use]
    pub fn link_registrations(&self) -> usize {
        self.link_registrations.load(Ordering::SeqCst)
    }

    /// Status changes made through [`DataSource::update_campaign_status`].
    #[must_use]
    pub fn status_updates(&self) -> Vec<(i64, CampaignStatus)> {
        self.state.read().status_updates.clone()
    }

    /// Total sent count saved for a campaign.
    #[must_use]
    pub fn sent(&self, campaign_id: i64) -> usize {
        self.state
            .read()
            .sent
            .get(&campaign_id)
            .copied()
            .unwrap_or_default()
    }

    /// Calls made to [`DataSource::update_campaign_counts`].
    #[must_use]
    pub fn count_updates(&self) -> Vec<(i64, usize)> {
        self.state.read().count_updates.clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn next_campaigns(&self, exclude: &[i64]) -> Result<Vec<Campaign>, StoreError> {
        self.check_available()?;

        let now = Utc::now();
        let mut state = self.state.write();
        let mut due = Vec::new();

        for campaign in state.campaigns.values_mut() {
            if exclude.contains(&campaign.id) {
                continue;
            }

            match campaign.status {
                CampaignStatus::Running => due.push(campaign.clone()),
                CampaignStatus::Scheduled if campaign.send_at.is_none_or(|at| at <= now) => {
                    campaign.status = CampaignStatus::Running;
                    due.push(campaign.clone());
                }
                _ => {}
            }
        }

        Ok(due)
    }

    async fn next_subscribers(
        &self,
        campaign_id: i64,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError> {
        self.check_available()?;

        let mut state = self.state.write();
        *state.fetch_calls.entry(campaign_id).or_default() += 1;

        let running = state
            .campaigns
            .get(&campaign_id)
            .is_some_and(|c| c.status == CampaignStatus::Running);
        if !running {
            return Ok(Vec::new());
        }

        let after = state.cursors.get(&campaign_id).copied().unwrap_or(i64::MIN);
        let batch: Vec<Subscriber> = state
            .audiences
            .get(&campaign_id)
            .map(|audience| {
                audience
                    .iter()
                    .filter(|s| s.id > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(last) = batch.last() {
            state.cursors.insert(campaign_id, last.id);
        }

        Ok(batch)
    }

    async fn get_campaign(&self, id: i64) -> Result<Campaign, StoreError> {
        self.check_available()?;

        self.state
            .read()
            .campaigns
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_campaign_status(
        &self,
        id: i64,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        self.check_available()?;

        let mut state = self.state.write();
        let campaign = state.campaigns.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        campaign.status = status;
        state.status_updates.push((id, status));

        Ok(())
    }

    async fn update_campaign_counts(&self, id: i64, sent: usize) -> Result<(), StoreError> {
        self.check_available()?;

        let mut state = self.state.write();
        if !state.campaigns.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        *state.sent.entry(id).or_default() += sent;
        state.count_updates.push((id, sent));

        Ok(())
    }

    async fn create_link(&self, url: &str) -> Result<String, StoreError> {
        self.check_available()?;
        self.link_registrations.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write();
        let next = state.links.len() + 1;
        Ok(state
            .links
            .entry(url.to_string())
            .or_insert_with(|| format!("{next:06}"))
            .clone())
    }
}
