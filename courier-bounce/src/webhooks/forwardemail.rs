use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{Bounce, BounceType, CAMPAIGN_HEADER};
use reqwest::header::HeaderMap;
use serde::Deserialize;

use super::{Verification, Webhook, header, payload, verify_hmac_hex};
use crate::error::WebhookError;

const PROVIDER: &str = "forwardemail";
const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwardEmailConfig {
    /// Webhook signature key from the Forward Email domain settings.
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Notification {
    recipient: String,
    headers: HashMap<String, String>,
    bounce: Option<Details>,
    bounced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Details {
    category: String,
}

fn classify(category: &str) -> BounceType {
    match category {
        "block" | "recipient" | "virus" | "spam" => BounceType::Hard,
        _ => BounceType::Soft,
    }
}

/// Forward Email bounce webhooks, signed with HMAC-SHA256 over the body.
pub struct ForwardEmail {
    key: Verification<Vec<u8>>,
}

impl ForwardEmail {
    pub fn new(config: &ForwardEmailConfig) -> Self {
        let key = config
            .key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(|key| key.as_bytes().to_vec());

        Self {
            key: Verification::new(key, config.insecure_skip_verify, PROVIDER),
        }
    }
}

#[async_trait]
impl Webhook for ForwardEmail {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
        let Some(key) = self.key.key(PROVIDER)? else {
            return Ok(());
        };

        verify_hmac_hex(PROVIDER, key, &[body], header(headers, SIGNATURE_HEADER)?)
    }

    async fn parse(&self, _headers: &HeaderMap, body: &[u8]) -> Result<Vec<Bounce>, WebhookError> {
        let notification: Notification = payload(PROVIDER, body)?;
        let Some(details) = notification.bounce else {
            return Ok(Vec::new());
        };

        let mut bounce = Bounce::new(classify(&details.category), PROVIDER);
        bounce.email = notification.recipient.to_lowercase();
        bounce.campaign_uuid = notification
            .headers
            .get(CAMPAIGN_HEADER)
            .cloned()
            .unwrap_or_default();
        bounce.created_at = notification.bounced_at;
        bounce.meta = serde_json::from_slice(body).unwrap_or_default();

        Ok(vec![bounce])
    }
}
