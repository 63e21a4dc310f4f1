#![allow(dead_code)]

pub mod mock_pop3;

use std::time::Duration;

use async_trait::async_trait;
use courier_bounce::{AuthProtocol, MailboxConfig, RecordError, Recorder};
use courier_common::{Bounce, CAMPAIGN_HEADER, SUBSCRIBER_HEADER};
use parking_lot::Mutex;

pub const CAMPAIGN_UUID: &str = "2b3c4d5e-0000-4000-8000-000000000001";

/// Recorder that keeps every bounce, optionally rejecting some emails as
/// unknown subscribers.
#[derive(Default)]
pub struct RecordingRecorder {
    recorded: Mutex<Vec<Bounce>>,
    unknown: Vec<String>,
}

impl RecordingRecorder {
    pub fn rejecting(unknown: &[&str]) -> Self {
        Self {
            unknown: unknown.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn recorded(&self) -> Vec<Bounce> {
        self.recorded.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.recorded.lock().len()
    }
}

#[async_trait]
impl Recorder for RecordingRecorder {
    async fn record(&self, bounce: Bounce) -> Result<(), RecordError> {
        if self.unknown.contains(&bounce.email) {
            return Err(RecordError::NotFound(bounce.email));
        }
        self.recorded.lock().push(bounce);
        Ok(())
    }
}

pub fn subscriber_uuid(n: usize) -> String {
    format!("7f8e9d0c-0000-4000-8000-{n:012}")
}

/// A delivery status notification quoting the headers of the message that
/// bounced.
pub fn bounce_email(subscriber: usize, status: &str) -> String {
    format!(
        "From: Mail Delivery System <mailer-daemon@example.org>\r\n\
         To: bounces@example.com\r\n\
         Subject: Undelivered Mail Returned to Sender\r\n\
         Date: Tue, 05 Nov 2024 16:33:54 +0000\r\n\
         Message-Id: <dsn-{subscriber}@example.org>\r\n\
         Content-Type: multipart/report; report-type=delivery-status; boundary=\"dsn\"\r\n\
         \r\n\
         --dsn\r\n\
         Content-Type: message/delivery-status\r\n\
         \r\n\
         Final-Recipient: rfc822; reader{subscriber}@example.org\r\n\
         Action: failed\r\n\
         Status: {status}\r\n\
         \r\n\
         --dsn\r\n\
         Content-Type: text/rfc822-headers\r\n\
         \r\n\
         {CAMPAIGN_HEADER}: {CAMPAIGN_UUID}\r\n\
         {SUBSCRIBER_HEADER}: {}\r\n\
         \r\n\
         --dsn--\r\n",
        subscriber_uuid(subscriber)
    )
}

/// An e-mail that landed in the bounce mailbox but carries no correlation
/// headers.
pub fn unrelated_email() -> String {
    "From: someone@example.net\r\n\
     Subject: Out of office\r\n\
     \r\n\
     I am away until Monday.\r\n"
        .to_string()
}

pub fn mailbox_config(port: u16, auth: AuthProtocol) -> MailboxConfig {
    ron::from_str::<MailboxConfig>(&format!(
        r#"(host: "127.0.0.1", port: {port}, username: "bounces", password: "secret", timeout_secs: 5)"#
    ))
    .map(|config| MailboxConfig { auth, ..config })
    .unwrap()
}

/// Polls `condition` until it holds, failing the test after five seconds.
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
