use async_trait::async_trait;
use courier_common::{CampaignStatus, internal};

/// Admin notification about a campaign leaving the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub campaign_id: i64,
    pub campaign_name: String,
    pub status: CampaignStatus,
    pub reason: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        internal!(
            level = INFO,
            "Campaign {} ({}) is now {}{}",
            notification.campaign_name,
            notification.campaign_id,
            notification.status,
            notification
                .reason
                .map(|reason| format!(": {reason}"))
                .unwrap_or_default()
        );
    }
}
