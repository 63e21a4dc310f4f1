use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{Bounce, BounceType, tracing};
use reqwest::header::HeaderMap;
use ring::signature::{ECDSA_P256_SHA256_ASN1, UnparsedPublicKey};
use serde::Deserialize;
use x509_parser::{prelude::FromDer, x509::SubjectPublicKeyInfo};

use super::{Verification, Webhook, header, payload, unix_timestamp};
use crate::error::WebhookError;

const PROVIDER: &str = "sendgrid";
const SIGNATURE_HEADER: &str = "X-Twilio-Email-Event-Webhook-Signature";
const TIMESTAMP_HEADER: &str = "X-Twilio-Email-Event-Webhook-Timestamp";

/// Uncompressed P-256 points are the tag byte plus two 32 byte coordinates.
const P256_POINT_LEN: usize = 65;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendgridConfig {
    /// Base64 DER public key shown with the signed event webhook settings.
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// An entry of the event batch. SendGrid flattens custom headers into the
/// event by dropping their dashes.
#[derive(Debug, Deserialize)]
struct Event {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    event: Option<String>,
    #[serde(rename = "XCourierCampaign", default)]
    campaign: Option<String>,
}

/// SendGrid signed event webhooks: ECDSA P-256 with SHA-256 over the
/// timestamp header followed by the raw body.
pub struct Sendgrid {
    key: Verification<Vec<u8>>,
}

impl Sendgrid {
    pub fn new(config: &SendgridConfig) -> Result<Self, WebhookError> {
        let key = config
            .key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .map(public_key)
            .transpose()?;

        Ok(Self {
            key: Verification::new(key, config.insecure_skip_verify, PROVIDER),
        })
    }
}

/// Extracts the EC point from a base64 DER `SubjectPublicKeyInfo`.
fn public_key(encoded: &str) -> Result<Vec<u8>, WebhookError> {
    let invalid = |reason: String| WebhookError::Configuration {
        provider: PROVIDER,
        reason,
    };

    let der = STANDARD
        .decode(encoded.trim())
        .map_err(|e| invalid(format!("key is not base64: {e}")))?;
    let (_, spki) = SubjectPublicKeyInfo::from_der(&der)
        .map_err(|e| invalid(format!("key is not a DER public key: {e}")))?;

    let point = spki.subject_public_key.data.to_vec();
    if point.len() != P256_POINT_LEN || point[0] != 0x04 {
        return Err(invalid("key is not an uncompressed P-256 point".to_string()));
    }

    Ok(point)
}

#[async_trait]
impl Webhook for Sendgrid {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
        let Some(key) = self.key.key(PROVIDER)? else {
            return Ok(());
        };

        let signature = STANDARD
            .decode(header(headers, SIGNATURE_HEADER)?)
            .map_err(|_| WebhookError::InvalidSignature(PROVIDER))?;
        let timestamp = header(headers, TIMESTAMP_HEADER)?;

        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);

        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, key)
            .verify(&message, &signature)
            .map_err(|_| WebhookError::InvalidSignature(PROVIDER))
    }

    async fn parse(&self, _headers: &HeaderMap, body: &[u8]) -> Result<Vec<Bounce>, WebhookError> {
        let events: Vec<serde_json::Value> = payload(PROVIDER, body)?;

        let mut bounces = Vec::new();
        for value in events {
            let event: Event = serde_json::from_value(value.clone())
                .map_err(|e| WebhookError::payload(PROVIDER, e))?;
            if event.event.as_deref() != Some("bounce") {
                continue;
            }
            let Some(email) = event.email.filter(|email| !email.trim().is_empty()) else {
                tracing::debug!("Skipping {PROVIDER} bounce without an address");
                continue;
            };

            let mut bounce = Bounce::new(BounceType::Hard, PROVIDER);
            bounce.email = email.to_lowercase();
            bounce.campaign_uuid = event.campaign.unwrap_or_default();
            bounce.created_at = event.timestamp.and_then(unix_timestamp);
            bounce.meta = value;
            bounces.push(bounce);
        }

        Ok(bounces)
    }
}
