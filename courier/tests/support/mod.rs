#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use courier_bounce::{RecordError, Recorder};
use courier_common::{
    Bounce, Campaign, CampaignStatus, ContentType, Subscriber, SubscriberStatus,
};
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct RecordingRecorder(Mutex<Vec<Bounce>>);

impl RecordingRecorder {
    pub fn recorded(&self) -> Vec<Bounce> {
        self.0.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().len()
    }
}

#[async_trait]
impl Recorder for RecordingRecorder {
    async fn record(&self, bounce: Bounce) -> Result<(), RecordError> {
        self.0.lock().push(bounce);
        Ok(())
    }
}

pub fn campaign(id: i64, messenger: &str) -> Campaign {
    Campaign {
        id,
        uuid: Uuid::new_v4(),
        name: format!("Newsletter #{id}"),
        subject: "Hello {{ subscriber.name }}".to_string(),
        from_email: "News <news@example.com>".to_string(),
        body: "<p>Hello {{ subscriber.name }}</p>".to_string(),
        alt_body: None,
        content_type: ContentType::Html,
        template_body: None,
        messenger: messenger.to_string(),
        status: CampaignStatus::Scheduled,
        send_at: None,
        headers: Vec::new(),
        tags: Vec::new(),
    }
}

pub fn subscribers(count: i64) -> Vec<Subscriber> {
    (1..=count)
        .map(|id| Subscriber {
            id,
            uuid: Uuid::new_v4(),
            email: format!("reader{id}@example.org"),
            name: format!("Reader {id}"),
            attribs: serde_json::Map::new(),
            status: SubscriberStatus::Enabled,
        })
        .collect()
}

/// Polls `condition` every 10ms, failing the test after five seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
