//! Amazon SES notifications delivered through an SNS topic.
//!
//! SNS signs every message with an X.509 certificate published under
//! `sns.<region>.amazonaws.com`. Certificates are fetched once per URL path
//! and their public keys cached for the lifetime of the process.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use courier_common::{Bounce, BounceType, CAMPAIGN_HEADER, internal, outgoing};
use parking_lot::RwLock;
use regex::Regex;
use reqwest::{StatusCode, Url, header::HeaderMap};
use ring::signature::{
    RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY, RSA_PKCS1_2048_8192_SHA256, UnparsedPublicKey,
    VerificationAlgorithm,
};
use serde::Deserialize;

use super::payload;
use crate::error::WebhookError;

const PROVIDER: &str = "ses";

static CERT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^https://sns\.[a-z0-9\-]+\.amazonaws\.com(\.cn)?/SimpleNotificationService\-[a-z0-9]+\.pem$",
    )
    .expect("valid certificate URL pattern")
});

const fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SesConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Timeout for certificate downloads and subscription confirmations.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SesConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// SNS envelope. `message` carries the SES event as a JSON string.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Notification {
    #[serde(rename = "Type")]
    kind: String,
    message: String,
    message_id: String,
    subject: String,
    timestamp: String,
    token: String,
    topic_arn: String,
    signature: String,
    signature_version: String,
    #[serde(rename = "SigningCertURL")]
    signing_cert_url: String,
    #[serde(rename = "SubscribeURL")]
    subscribe_url: String,
    #[serde(rename = "UnsubscribeURL")]
    unsubscribe_url: String,
}

impl Notification {
    /// The string SNS signs: selected fields as `Key\nValue\n` pairs in
    /// byte order of their names, empty optional fields omitted.
    fn canonical(&self) -> String {
        let mut out = String::new();
        let mut field = |key: &str, value: &str| {
            out.push_str(key);
            out.push('\n');
            out.push_str(value);
            out.push('\n');
        };

        field("Message", &self.message);
        field("MessageId", &self.message_id);
        if !self.subject.is_empty() {
            field("Subject", &self.subject);
        }
        if !self.subscribe_url.is_empty() {
            field("SubscribeURL", &self.subscribe_url);
        }
        field("Timestamp", &self.timestamp);
        if !self.token.is_empty() {
            field("Token", &self.token);
        }
        field("TopicArn", &self.topic_arn);
        field("Type", &self.kind);

        out
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Event {
    event_type: String,
    notification_type: String,
    bounce: BounceDetails,
    mail: Mail,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BounceDetails {
    bounce_type: String,
    bounced_recipients: Vec<Recipient>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Recipient {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Mail {
    timestamp: Option<DateTime<Utc>>,
    headers_truncated: bool,
    destination: Vec<String>,
    headers: Vec<MailHeader>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MailHeader {
    name: String,
    value: String,
}

impl Event {
    fn kind(&self) -> &str {
        if self.event_type.is_empty() {
            &self.notification_type
        } else {
            &self.event_type
        }
    }

    fn classify(&self) -> Option<BounceType> {
        match self.kind() {
            "Bounce" if self.bounce.bounce_type == "Permanent" => Some(BounceType::Hard),
            // "Invalid domain" transient bounces never recover.
            "Bounce"
                if self.bounce.bounce_type == "Transient"
                    && self
                        .bounce
                        .bounced_recipients
                        .first()
                        .is_some_and(|r| r.status == "5.4.4") =>
            {
                Some(BounceType::Hard)
            }
            "Bounce" => Some(BounceType::Soft),
            "Complaint" => Some(BounceType::Complaint),
            _ => None,
        }
    }

    fn campaign_uuid(&self) -> String {
        if self.mail.headers_truncated {
            return String::new();
        }

        self.mail
            .headers
            .iter()
            .find(|h| h.name == CAMPAIGN_HEADER)
            .map(|h| h.value.clone())
            .unwrap_or_default()
    }
}

/// SES bounce and complaint notifications, including the SNS subscription
/// handshake.
pub struct Ses {
    client: reqwest::Client,
    insecure_skip_verify: bool,
    /// Public keys of signing certificates by URL path.
    keys: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl Ses {
    pub fn new(config: &SesConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        if config.insecure_skip_verify {
            internal!(
                level = WARN,
                "Signature verification of {PROVIDER} webhooks is disabled"
            );
        }

        Ok(Self {
            client,
            insecure_skip_verify: config.insecure_skip_verify,
            keys: RwLock::new(HashMap::new()),
        })
    }

    /// Seeds the certificate cache for `url` with a PEM certificate, as if it
    /// had been downloaded.
    pub fn cache_certificate(&self, url: &str, pem: &[u8]) -> Result<(), WebhookError> {
        let path = certificate_path(url)?;
        let key = public_key(pem)?;
        self.keys.write().insert(path, Arc::new(key));
        Ok(())
    }

    async fn signing_key(&self, url: &str) -> Result<Arc<Vec<u8>>, WebhookError> {
        let path = certificate_path(url)?;
        let cached = self.keys.read().get(&path).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }

        outgoing!("Fetching SNS signing certificate {url}");
        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(WebhookError::Certificate(format!(
                "{url} returned {}",
                response.status()
            )));
        }

        let key = Arc::new(public_key(&response.bytes().await?)?);
        self.keys.write().insert(path, Arc::clone(&key));

        Ok(key)
    }

    async fn verify_notification(&self, notification: &Notification) -> Result<(), WebhookError> {
        if self.insecure_skip_verify {
            return Ok(());
        }

        if notification.signature.is_empty() {
            return Err(WebhookError::MissingSignature("Signature"));
        }

        let algorithm: &'static dyn VerificationAlgorithm =
            match notification.signature_version.as_str() {
                "" | "1" => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
                "2" => &RSA_PKCS1_2048_8192_SHA256,
                _ => return Err(WebhookError::InvalidSignature(PROVIDER)),
            };

        let signature = STANDARD
            .decode(&notification.signature)
            .map_err(|_| WebhookError::InvalidSignature(PROVIDER))?;
        let key = self.signing_key(&notification.signing_cert_url).await?;

        UnparsedPublicKey::new(algorithm, key.as_slice())
            .verify(notification.canonical().as_bytes(), &signature)
            .map_err(|_| WebhookError::InvalidSignature(PROVIDER))
    }

    async fn confirm(&self, url: &str) -> Result<(), WebhookError> {
        outgoing!("Confirming SNS subscription change at {url}");

        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(WebhookError::Confirmation(response.status().as_u16()));
        }

        Ok(())
    }
}

/// Validates that a certificate URL is Amazon's and returns its cache key.
fn certificate_path(url: &str) -> Result<String, WebhookError> {
    if !CERT_URL.is_match(url) {
        return Err(WebhookError::Certificate(format!(
            "untrusted certificate URL {url}"
        )));
    }

    Url::parse(url)
        .map(|url| url.path().to_string())
        .map_err(|e| WebhookError::Certificate(e.to_string()))
}

/// Extracts the subject public key of the first certificate in a PEM bundle.
fn public_key(pem: &[u8]) -> Result<Vec<u8>, WebhookError> {
    let der = rustls_pemfile::certs(&mut &pem[..])
        .next()
        .ok_or_else(|| WebhookError::Certificate("no certificate in PEM".to_string()))?
        .map_err(|e| WebhookError::Certificate(e.to_string()))?;

    let (_, certificate) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| WebhookError::Certificate(e.to_string()))?;

    Ok(certificate.public_key().subject_public_key.data.to_vec())
}

#[async_trait]
impl super::Webhook for Ses {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn verify(&self, _headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
        let notification: Notification = payload(PROVIDER, body)?;
        self.verify_notification(&notification).await
    }

    async fn parse(&self, _headers: &HeaderMap, body: &[u8]) -> Result<Vec<Bounce>, WebhookError> {
        let notification: Notification = payload(PROVIDER, body)?;

        match notification.kind.as_str() {
            "SubscriptionConfirmation" => {
                self.confirm(&notification.subscribe_url).await?;
                return Ok(Vec::new());
            }
            "UnsubscribeConfirmation" => {
                self.confirm(&notification.unsubscribe_url).await?;
                return Ok(Vec::new());
            }
            _ => {}
        }

        let event: Event = payload(PROVIDER, notification.message.as_bytes())?;
        let Some(kind) = event.classify() else {
            return Ok(Vec::new());
        };

        let Some(email) = event.mail.destination.first() else {
            return Err(WebhookError::payload(
                PROVIDER,
                "no destination in notification",
            ));
        };

        let mut bounce = Bounce::new(kind, PROVIDER);
        bounce.email = email.to_lowercase();
        bounce.campaign_uuid = event.campaign_uuid();
        bounce.created_at = event.mail.timestamp;
        bounce.meta = serde_json::from_str(&notification.message).unwrap_or_default();

        Ok(vec![bounce])
    }
}
