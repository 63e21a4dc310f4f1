//! Bounce e-mails collected from a POP3 mailbox.
//!
//! Every scan fetches the headers and first lines of up to `scan_limit`
//! messages, queues a bounce for each message that carries both correlation
//! headers and then deletes every scanned message. A bounce that does not fit
//! into the queue is lost: the message it came from is deleted regardless.

pub mod classify;
pub mod pop3;

use std::{sync::LazyLock, time::Duration};

use chrono::{DateTime, Utc};
use courier_common::{
    Bounce, CAMPAIGN_HEADER, SUBSCRIBER_HEADER, Signal, incoming, internal, tracing,
};
use courier_tracing::traced;
use mailparse::{MailHeader, MailHeaderMap};
use regex::bytes::Regex;
use serde::Deserialize;
use tokio::{
    sync::{broadcast, mpsc, mpsc::error::TrySendError},
    time::MissedTickBehavior,
};

use crate::error::MailboxError;
use pop3::Pop3Client;

/// Login mechanism for the mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProtocol {
    None,
    /// `USER`/`PASS`.
    #[default]
    Plain,
    /// `AUTH LOGIN`.
    Login,
    /// `AUTH CRAM-MD5`.
    Cram,
}

const fn default_port() -> u16 {
    110
}

const fn default_scan_interval_secs() -> u64 {
    15 * 60
}

const fn default_scan_limit() -> usize {
    1000
}

const fn default_fetch_lines() -> usize {
    100
}

const fn default_timeout_secs() -> u64 {
    10
}

fn default_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub auth: AuthProtocol,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Accepted for IMAP style configurations; POP3 has a single folder.
    #[serde(default = "default_folder")]
    pub folder: String,

    /// Connect with implicit TLS (usually port 995).
    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub tls_skip_verify: bool,

    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Maximum number of messages handled per scan; 0 scans everything.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,

    /// Body lines fetched with the headers of each message.
    #[serde(default = "default_fetch_lines")]
    pub fetch_lines: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl MailboxConfig {
    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Outcome of a single scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Messages fetched, and deleted.
    pub scanned: usize,
    /// Bounces queued.
    pub emitted: usize,
    /// Bounces lost to a full queue.
    pub dropped: usize,
    /// Messages without both correlation headers.
    pub skipped: usize,
}

pub struct Mailbox {
    config: MailboxConfig,
}

impl Mailbox {
    #[must_use]
    pub const fn new(config: MailboxConfig) -> Self {
        Self { config }
    }

    /// Runs one scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the mailbox cannot be reached or a command fails.
    /// Deletions are only committed by the final `QUIT`, so a failed scan
    /// leaves the mailbox untouched.
    pub async fn scan(&self, queue: &mpsc::Sender<Bounce>) -> Result<ScanReport, MailboxError> {
        let config = &self.config;
        let mut client = Pop3Client::connect(
            &config.host,
            config.port,
            config.tls,
            config.tls_skip_verify,
            config.timeout(),
        )
        .await?;

        match config.auth {
            AuthProtocol::None => {}
            AuthProtocol::Plain => client.login_plain(&config.username, &config.password).await?,
            AuthProtocol::Login => client.login_sasl(&config.username, &config.password).await?,
            AuthProtocol::Cram => client.login_cram(&config.username, &config.password).await?,
        }

        let (mut count, _) = client.stat().await?;
        if config.scan_limit > 0 {
            count = count.min(config.scan_limit);
        }

        let mut report = ScanReport {
            scanned: count,
            ..ScanReport::default()
        };

        for id in 1..=count {
            let raw = client.top(id, config.fetch_lines).await?;

            let Some(bounce) = bounce_from(&config.host, &raw) else {
                report.skipped += 1;
                continue;
            };

            match queue.try_send(bounce) {
                Ok(()) => report.emitted += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(message = id, "Bounce queue full, dropping mailbox bounce");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => return Err(MailboxError::QueueClosed),
            }
        }

        for id in 1..=count {
            client.dele(id).await?;
        }
        client.quit().await?;

        Ok(report)
    }

    /// Scans the mailbox every `scan_interval_secs` until shutdown.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "s"))]
    pub async fn serve(self, queue: mpsc::Sender<Bounce>, mut shutdown: broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(self.config.scan_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        internal!(
            level = INFO,
            "Scanning {}:{} for bounces every {}s",
            self.config.host,
            self.config.port,
            self.config.scan_interval_secs
        );

        loop {
            tokio::select! {
                biased;
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        break;
                    }
                }
                _ = timer.tick() => match self.scan(&queue).await {
                    Ok(report) => incoming!(
                        level = DEBUG,
                        scanned = report.scanned,
                        emitted = report.emitted,
                        dropped = report.dropped,
                        skipped = report.skipped,
                        "Scanned mailbox {}",
                        self.config.host
                    ),
                    Err(MailboxError::QueueClosed) => break,
                    Err(e) if e.is_transient() => {
                        internal!(level = WARN, error = %e, "Mailbox scan of {} failed", self.config.host);
                    }
                    Err(e) => {
                        internal!(level = ERROR, error = %e, "Mailbox scan of {} failed", self.config.host);
                    }
                },
            }
        }
    }
}

const UUID_VALUE: &str = r"[a-z0-9\-]{36}";
const ANY_VALUE: &str = r"[^\r\n]*";

fn header_pattern(name: &str, value: &str) -> Regex {
    Regex::new(&format!(r"(?mi)^{}:[ \t]*({value})", regex::escape(name)))
        .expect("valid header pattern")
}

static CAMPAIGN: LazyLock<Regex> = LazyLock::new(|| header_pattern(CAMPAIGN_HEADER, UUID_VALUE));
static SUBSCRIBER: LazyLock<Regex> =
    LazyLock::new(|| header_pattern(SUBSCRIBER_HEADER, UUID_VALUE));
static DATE: LazyLock<Regex> = LazyLock::new(|| header_pattern("Date", ANY_VALUE));
static FROM: LazyLock<Regex> = LazyLock::new(|| header_pattern("From", ANY_VALUE));
static SUBJECT: LazyLock<Regex> = LazyLock::new(|| header_pattern("Subject", ANY_VALUE));
static MESSAGE_ID: LazyLock<Regex> = LazyLock::new(|| header_pattern("Message-Id", ANY_VALUE));
static DELIVERED_TO: LazyLock<Regex> =
    LazyLock::new(|| header_pattern("Delivered-To", ANY_VALUE));
static RECEIVED: LazyLock<Regex> = LazyLock::new(|| header_pattern("Received", ANY_VALUE));

/// A header of the bounce e-mail itself, or failing that the last match of
/// `pattern` anywhere in the fetched bytes. Reports embed the headers of the
/// original message, which is where the correlation headers usually are.
fn lookup(headers: &[MailHeader<'_>], raw: &[u8], name: &str, pattern: &Regex) -> String {
    headers
        .get_first_value(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            pattern
                .captures_iter(raw)
                .last()
                .and_then(|captures| captures.get(1))
                .map(|value| String::from_utf8_lossy(value.as_bytes()).trim().to_string())
        })
        .unwrap_or_default()
}

/// Builds a bounce from the fetched part of a bounce e-mail. Returns `None`
/// when the e-mail cannot be correlated to a campaign and subscriber.
pub fn bounce_from(source: &str, raw: &[u8]) -> Option<Bounce> {
    let headers = mailparse::parse_headers(raw)
        .map(|(headers, _)| headers)
        .unwrap_or_default();

    let campaign = lookup(&headers, raw, CAMPAIGN_HEADER, &CAMPAIGN);
    let subscriber = lookup(&headers, raw, SUBSCRIBER_HEADER, &SUBSCRIBER);
    if campaign.is_empty() || subscriber.is_empty() {
        return None;
    }

    let created_at = mailparse::dateparse(&lookup(&headers, raw, "Date", &DATE))
        .ok()
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
        .unwrap_or_else(Utc::now);

    let mut received = headers.get_all_values("Received");
    if received.is_empty() {
        received = RECEIVED
            .captures_iter(raw)
            .filter_map(|captures| captures.get(1))
            .map(|value| String::from_utf8_lossy(value.as_bytes()).trim().to_string())
            .collect();
    }

    let (kind, reason) = classify::classify(raw);

    let mut bounce = Bounce::new(kind, source);
    bounce.campaign_uuid = campaign;
    bounce.subscriber_uuid = subscriber;
    bounce.created_at = Some(created_at);
    bounce.meta = serde_json::json!({
        "from": lookup(&headers, raw, "From", &FROM),
        "subject": lookup(&headers, raw, "Subject", &SUBJECT),
        "message_id": lookup(&headers, raw, "Message-Id", &MESSAGE_ID),
        "delivered_to": lookup(&headers, raw, "Delivered-To", &DELIVERED_TO),
        "received": received,
        "classify_reason": reason,
    });

    Some(bounce)
}

#[cfg(test)]
mod tests {
    use courier_common::BounceType;
    use pretty_assertions::assert_eq;

    use super::*;

    const CAMPAIGN_UUID: &str = "2b3c4d5e-0000-4000-8000-000000000001";
    const SUBSCRIBER_UUID: &str = "7f8e9d0c-0000-4000-8000-000000000002";

    fn report() -> Vec<u8> {
        format!(
            "Received: from mx.example.org by pop.example.com\r\n\
             From: Mail Delivery System <mailer-daemon@example.org>\r\n\
             Subject: Undelivered Mail Returned to Sender\r\n\
             Date: Tue, 05 Nov 2024 16:33:54 +0000\r\n\
             Message-Id: <bounce-1@example.org>\r\n\
             Content-Type: multipart/report; boundary=\"b\"\r\n\
             \r\n\
             --b\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             Status: 5.1.1\r\n\
             \r\n\
             --b\r\n\
             Content-Type: text/rfc822-headers\r\n\
             \r\n\
             {CAMPAIGN_HEADER}: {CAMPAIGN_UUID}\r\n\
             {SUBSCRIBER_HEADER}: {SUBSCRIBER_UUID}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_correlation_headers_from_embedded_message() {
        let bounce = bounce_from("pop.example.com", &report()).unwrap();

        assert_eq!(bounce.kind, BounceType::Hard);
        assert_eq!(bounce.source, "pop.example.com");
        assert_eq!(bounce.campaign_uuid, CAMPAIGN_UUID);
        assert_eq!(bounce.subscriber_uuid, SUBSCRIBER_UUID);
        assert_eq!(
            bounce.created_at.unwrap().to_rfc3339(),
            "2024-11-05T16:33:54+00:00"
        );
        assert_eq!(bounce.meta["subject"], "Undelivered Mail Returned to Sender");
        assert_eq!(bounce.meta["message_id"], "<bounce-1@example.org>");
        assert_eq!(
            bounce.meta["received"],
            serde_json::json!(["from mx.example.org by pop.example.com"])
        );
        assert_eq!(bounce.meta["classify_reason"], "smtp_status=5.1.1");
    }

    #[test]
    fn test_top_level_headers_win() {
        let raw = format!(
            "{CAMPAIGN_HEADER}: {CAMPAIGN_UUID}\r\n{SUBSCRIBER_HEADER}: {SUBSCRIBER_UUID}\r\n\r\nout of office\r\n"
        );
        let bounce = bounce_from("pop.example.com", raw.as_bytes()).unwrap();

        assert_eq!(bounce.campaign_uuid, CAMPAIGN_UUID);
        assert_eq!(bounce.kind, BounceType::Soft);
        assert_eq!(bounce.meta["classify_reason"], "default");
        assert!(bounce.created_at.is_some());
    }

    #[test]
    fn test_uncorrelated_messages_are_skipped() {
        let raw = format!("Subject: hello\r\n{CAMPAIGN_HEADER}: {CAMPAIGN_UUID}\r\n\r\n");
        assert!(bounce_from("pop.example.com", raw.as_bytes()).is_none());
        assert!(bounce_from("pop.example.com", b"").is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config: MailboxConfig = ron::from_str(r#"(host: "pop.example.com")"#).unwrap();

        assert_eq!(config.port, 110);
        assert_eq!(config.auth, AuthProtocol::Plain);
        assert_eq!(config.folder, "INBOX");
        assert_eq!(config.scan_interval(), Duration::from_secs(900));
        assert_eq!(config.scan_limit, 1000);
        assert_eq!(config.fetch_lines, 100);
        assert!(!config.tls);
    }
}
