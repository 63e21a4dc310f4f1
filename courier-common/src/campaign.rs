use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a campaign.
///
/// Administrators move campaigns between `Draft`, `Scheduled` and `Running`.
/// The delivery engine only ever moves `Running` to `Paused` or `Finished`,
/// and a newly discovered campaign to `Cancelled` when its messenger is not
/// registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Finished,
    Cancelled,
}

impl CampaignStatus {
    /// Statuses the scheduler picks campaigns up from.
    #[must_use]
    pub const fn is_due(self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Richtext,
    Html,
    Plain,
}

impl ContentType {
    #[must_use]
    pub const fn is_plain(self) -> bool {
        matches!(self, Self::Plain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub subject: String,
    pub from_email: String,

    /// Content template, rendered per subscriber.
    pub body: String,

    /// Plaintext alternative. Ignored for plain campaigns.
    #[serde(default)]
    pub alt_body: Option<String>,

    #[serde(default)]
    pub content_type: ContentType,

    /// Base layout wrapping the rendered body through `{{ content }}`.
    #[serde(default)]
    pub template_body: Option<String>,

    /// Name of the messenger the campaign is delivered through.
    pub messenger: String,

    pub status: CampaignStatus,

    #[serde(default)]
    pub send_at: Option<DateTime<Utc>>,

    /// Extra headers appended to every message of the campaign.
    #[serde(default)]
    pub headers: Vec<Header>,

    #[serde(default)]
    pub tags: Vec<String>,
}
