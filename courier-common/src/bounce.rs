use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceType {
    Hard,
    Soft,
    Complaint,
}

impl fmt::Display for BounceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
            Self::Complaint => "complaint",
        })
    }
}

/// Canonical bounce record produced by every ingestion path.
///
/// Correlation fields are empty strings when the source did not carry them;
/// the recorder falls back to the subscriber email in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounce {
    #[serde(rename = "type")]
    pub kind: BounceType,

    /// Provider name or mailbox host.
    pub source: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub subscriber_uuid: String,

    #[serde(default)]
    pub campaign_uuid: String,

    /// Provider payload, kept opaque.
    #[serde(default)]
    pub meta: serde_json::Value,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Bounce {
    pub fn new(kind: BounceType, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            email: String::default(),
            subscriber_uuid: String::default(),
            campaign_uuid: String::default(),
            meta: serde_json::Value::Null,
            created_at: None,
        }
    }
}
