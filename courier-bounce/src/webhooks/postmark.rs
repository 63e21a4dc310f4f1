use std::collections::HashMap;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use courier_common::{Bounce, BounceType, CAMPAIGN_HEADER};
use hmac::Mac;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::Deserialize;

use super::{HmacSha256, Verification, Webhook, payload};
use crate::error::WebhookError;

const PROVIDER: &str = "postmark";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostmarkConfig {
    /// Basic auth credentials set on the Postmark webhook URL.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Notification {
    record_type: String,
    #[serde(rename = "Type")]
    kind: String,
    email: String,
    metadata: HashMap<String, String>,
    bounced_at: Option<DateTime<Utc>>,
}

/// Expected credentials, held as a MAC under a per-process random key so
/// the comparison does not depend on where the supplied value diverges.
struct Credentials {
    key: [u8; 64],
    tag: Vec<u8>,
}

impl Credentials {
    fn new(username: &str, password: &str) -> Self {
        let key: [u8; 64] = rand::random();
        let tag = Self::mac(&key, format!("{username}:{password}").as_bytes()).finalize();

        Self {
            key,
            tag: tag.into_bytes().to_vec(),
        }
    }

    /// Keys are one SHA-256 block long.
    fn mac(key: &[u8; 64], value: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new(&(*key).into());
        mac.update(value);
        mac
    }

    fn matches(&self, supplied: &[u8]) -> bool {
        Self::mac(&self.key, supplied).verify_slice(&self.tag).is_ok()
    }
}

/// The credentials of a `Basic` authorization value. The scheme name is
/// case-insensitive.
fn basic_credentials(value: &str) -> Option<&str> {
    let (scheme, credentials) = value.trim_start().split_once(' ')?;
    scheme.eq_ignore_ascii_case("basic").then_some(credentials)
}

/// Postmark bounce webhooks, authenticated with HTTP Basic auth.
pub struct Postmark {
    credentials: Verification<Credentials>,
}

impl Postmark {
    pub fn new(config: &PostmarkConfig) -> Self {
        let credentials = match (config.username.as_deref(), config.password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials::new(username, password))
            }
            _ => None,
        };

        Self {
            credentials: Verification::new(credentials, config.insecure_skip_verify, PROVIDER),
        }
    }
}

fn classify(kind: &str) -> Option<BounceType> {
    match kind {
        "HardBounce" | "BadEmailAddress" | "ManuallyDeactivated" => Some(BounceType::Hard),
        "SoftBounce" | "Transient" | "DnsError" | "SpamNotification" | "VirusNotification"
        | "DMARCPolicy" => Some(BounceType::Soft),
        "SpamComplaint" => Some(BounceType::Complaint),
        _ => None,
    }
}

#[async_trait]
impl Webhook for Postmark {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn verify(&self, headers: &HeaderMap, _body: &[u8]) -> Result<(), WebhookError> {
        let Some(credentials) = self.credentials.key(PROVIDER)? else {
            return Ok(());
        };

        let supplied = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(basic_credentials)
            .ok_or(WebhookError::MissingSignature("Authorization"))?;
        let decoded = STANDARD
            .decode(supplied.trim())
            .map_err(|_| WebhookError::InvalidSignature(PROVIDER))?;

        if credentials.matches(&decoded) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature(PROVIDER))
        }
    }

    async fn parse(&self, _headers: &HeaderMap, body: &[u8]) -> Result<Vec<Bounce>, WebhookError> {
        let notification: Notification = payload(PROVIDER, body)?;
        if notification.record_type != "Bounce" {
            return Ok(Vec::new());
        }

        let kind = classify(&notification.kind).ok_or_else(|| WebhookError::UnsupportedEvent {
            provider: PROVIDER,
            event: notification.kind.clone(),
        })?;

        let mut bounce = Bounce::new(kind, PROVIDER);
        bounce.email = notification.email.to_lowercase();
        bounce.campaign_uuid = notification
            .metadata
            .get(CAMPAIGN_HEADER)
            .cloned()
            .unwrap_or_default();
        bounce.created_at = notification.bounced_at;
        bounce.meta = serde_json::from_slice(body).unwrap_or_default();

        Ok(vec![bounce])
    }
}
