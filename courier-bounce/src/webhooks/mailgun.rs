use std::collections::HashMap;

use async_trait::async_trait;
use courier_common::{Bounce, BounceType, CAMPAIGN_HEADER};
use reqwest::header::HeaderMap;
use serde::Deserialize;

use super::{Verification, Webhook, payload, unix_timestamp, verify_hmac_hex};
use crate::error::WebhookError;

const PROVIDER: &str = "mailgun";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailgunConfig {
    /// HTTP webhook signing key from the Mailgun dashboard.
    #[serde(default)]
    pub signing_key: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Signature {
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    signature: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct EventData {
    #[serde(default)]
    event: String,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    recipient: String,
    /// `permanent` or `temporary` for `failed` events.
    #[serde(default)]
    severity: String,
    /// SMTP code of legacy `bounced` events.
    #[serde(default)]
    code: u16,
    #[serde(default)]
    user_variables: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Notification {
    #[serde(default)]
    signature: Signature,
    #[serde(default)]
    event_data: EventData,
}

/// Mailgun webhooks, signed with HMAC-SHA256 over timestamp and token.
///
/// The campaign uuid is read from the `X-Courier-Campaign` user variable.
pub struct Mailgun {
    key: Verification<Vec<u8>>,
}

impl Mailgun {
    pub fn new(config: &MailgunConfig) -> Self {
        let key = config
            .signing_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(|key| key.as_bytes().to_vec());

        Self {
            key: Verification::new(key, config.insecure_skip_verify, PROVIDER),
        }
    }
}

fn classify(event: &EventData) -> Option<BounceType> {
    match event.event.as_str() {
        "failed" if event.severity == "permanent" => Some(BounceType::Hard),
        "failed" => Some(BounceType::Soft),
        "bounced" if (500..600).contains(&event.code) => Some(BounceType::Hard),
        "bounced" => Some(BounceType::Soft),
        "complained" => Some(BounceType::Complaint),
        _ => None,
    }
}

#[async_trait]
impl Webhook for Mailgun {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn verify(&self, _headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
        let Some(key) = self.key.key(PROVIDER)? else {
            return Ok(());
        };

        let notification: Notification = payload(PROVIDER, body)?;
        let Signature {
            timestamp,
            token,
            signature,
        } = notification.signature;

        if timestamp.is_empty() || token.is_empty() || signature.is_empty() {
            return Err(WebhookError::MissingSignature("signature"));
        }

        verify_hmac_hex(
            PROVIDER,
            key,
            &[timestamp.as_bytes(), token.as_bytes()],
            &signature,
        )
    }

    async fn parse(&self, _headers: &HeaderMap, body: &[u8]) -> Result<Vec<Bounce>, WebhookError> {
        let notification: Notification = payload(PROVIDER, body)?;
        let event = notification.event_data;

        let Some(kind) = classify(&event) else {
            return Ok(Vec::new());
        };

        #[allow(
            clippy::cast_possible_truncation,
            reason = "Mailgun timestamps are unix seconds with a fractional part"
        )]
        let created_at = unix_timestamp(event.timestamp as i64);

        let mut bounce = Bounce::new(kind, PROVIDER);
        bounce.email = event.recipient.to_lowercase();
        bounce.campaign_uuid = event
            .user_variables
            .get(CAMPAIGN_HEADER)
            .cloned()
            .unwrap_or_default();
        bounce.meta = serde_json::from_slice(body).unwrap_or_default();
        bounce.created_at = created_at;

        Ok(vec![bounce])
    }
}
