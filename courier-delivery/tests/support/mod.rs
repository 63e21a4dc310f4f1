#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_common::{
    Campaign, CampaignStatus, ContentType, Header, Subscriber, SubscriberStatus,
};
use courier_delivery::{Notification, Notifier};
use courier_messenger::{Message, Messenger, MessengerError};
use parking_lot::Mutex;
use uuid::Uuid;

/// Messenger that keeps every pushed message, or rejects all of them.
#[derive(Default)]
pub struct RecordingMessenger {
    pushed: Mutex<Vec<Message>>,
    attempts: Mutex<usize>,
    failing: bool,
    closed: AtomicBool,
}

impl RecordingMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub fn pushed(&self) -> Vec<Message> {
        self.pushed.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.pushed.lock().len()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    fn name(&self) -> &str {
        "email"
    }

    async fn push(&self, message: &Message) -> Result<(), MessengerError> {
        *self.attempts.lock() += 1;
        if self.failing {
            return Err(MessengerError::Status(554));
        }

        self.pushed.lock().push(message.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), MessengerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), MessengerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<Notification>>);

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.0.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.0.lock().push(notification);
    }
}

pub fn campaign(id: i64, status: CampaignStatus) -> Campaign {
    Campaign {
        id,
        uuid: Uuid::new_v4(),
        name: format!("Newsletter #{id}"),
        subject: "News for {{ subscriber.name }}".to_string(),
        from_email: "News <news@example.com>".to_string(),
        body: "<p>Hello {{ subscriber.name }}</p>".to_string(),
        alt_body: None,
        content_type: ContentType::Html,
        template_body: None,
        messenger: "email".to_string(),
        status,
        send_at: None,
        headers: vec![Header::new("X-Issue", id.to_string())],
        tags: Vec::new(),
    }
}

/// Subscribers with ids `1..=count`, inserted in reverse to check ordering.
pub fn subscribers(count: i64) -> Vec<Subscriber> {
    (1..=count)
        .rev()
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
