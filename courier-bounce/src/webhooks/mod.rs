//! Bounce notifications pushed by e-mail providers.
//!
//! Every provider authenticates its callbacks differently:
//!
//! | provider       | scheme                                                   |
//! |----------------|----------------------------------------------------------|
//! | `ses`          | SNS message signed by an X.509 certificate (RSA)         |
//! | `sendgrid`     | ECDSA P-256 over timestamp and body                      |
//! | `mailgun`      | HMAC-SHA256 over timestamp and token                     |
//! | `postmark`     | HTTP Basic auth                                          |
//! | `forwardemail` | HMAC-SHA256 over the body                                |
//!
//! A provider without a configured secret rejects every callback unless
//! `insecure_skip_verify` is set in its configuration.

pub mod forwardemail;
pub mod mailgun;
pub mod postmark;
pub mod sendgrid;
pub mod ses;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{Bounce, internal};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use sha2::Sha256;

use crate::{config::WebhooksConfig, error::WebhookError};

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// One provider's webhook endpoint.
#[async_trait]
pub trait Webhook: Send + Sync {
    /// Name the provider is addressed by.
    fn provider(&self) -> &'static str;

    /// Authenticates a callback.
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError>;

    /// Normalises an authenticated callback. Events that are not bounces or
    /// complaints produce no records.
    async fn parse(&self, headers: &HeaderMap, body: &[u8]) -> Result<Vec<Bounce>, WebhookError>;
}

/// Builds the webhooks enabled in `config`.
pub fn from_config(config: &WebhooksConfig) -> Result<Vec<Arc<dyn Webhook>>, WebhookError> {
    let mut webhooks: Vec<Arc<dyn Webhook>> = Vec::new();

    if let Some(config) = &config.ses {
        webhooks.push(Arc::new(ses::Ses::new(config)?));
    }
    if let Some(config) = &config.sendgrid {
        webhooks.push(Arc::new(sendgrid::Sendgrid::new(config)?));
    }
    if let Some(config) = &config.mailgun {
        webhooks.push(Arc::new(mailgun::Mailgun::new(config)));
    }
    if let Some(config) = &config.postmark {
        webhooks.push(Arc::new(postmark::Postmark::new(config)));
    }
    if let Some(config) = &config.forwardemail {
        webhooks.push(Arc::new(forwardemail::ForwardEmail::new(config)));
    }

    Ok(webhooks)
}

/// Verification material of a provider.
pub(crate) enum Verification<K> {
    Key(K),
    /// Nothing configured: every callback is rejected.
    Missing,
    /// Explicitly disabled through `insecure_skip_verify`.
    Skipped,
}

impl<K> Verification<K> {
    pub(crate) fn new(key: Option<K>, insecure_skip_verify: bool, provider: &'static str) -> Self {
        match key {
            Some(key) => Self::Key(key),
            None if insecure_skip_verify => {
                internal!(
                    level = WARN,
                    "Signature verification of {provider} webhooks is disabled"
                );
                Self::Skipped
            }
            None => Self::Missing,
        }
    }

    /// The key to verify with, or `None` when verification is skipped.
    pub(crate) fn key(&self, provider: &'static str) -> Result<Option<&K>, WebhookError> {
        match self {
            Self::Key(key) => Ok(Some(key)),
            Self::Skipped => Ok(None),
            Self::Missing => Err(WebhookError::NotConfigured(provider)),
        }
    }
}

pub(crate) fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(WebhookError::MissingSignature(name))
}

pub(crate) fn payload<T: DeserializeOwned>(
    provider: &'static str,
    body: &[u8],
) -> Result<T, WebhookError> {
    serde_json::from_slice(body).map_err(|e| WebhookError::payload(provider, e))
}

/// Checks a hex encoded HMAC-SHA256 tag over the concatenation of `parts`.
pub(crate) fn verify_hmac_hex(
    provider: &'static str,
    key: &[u8],
    parts: &[&[u8]],
    signature: &str,
) -> Result<(), WebhookError> {
    let tag = hex::decode(signature).map_err(|_| WebhookError::InvalidSignature(provider))?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| WebhookError::Configuration {
        provider,
        reason: e.to_string(),
    })?;
    for part in parts {
        mac.update(part);
    }

    mac.verify_slice(&tag)
        .map_err(|_| WebhookError::InvalidSignature(provider))
}

/// Unix seconds to a timestamp; zero and out-of-range values are treated as
/// absent.
pub(crate) fn unix_timestamp(seconds: i64) -> Option<DateTime<Utc>> {
    (seconds > 0)
        .then(|| DateTime::from_timestamp(seconds, 0))
        .flatten()
}
