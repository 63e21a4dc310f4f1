use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    #[default]
    Enabled,
    Disabled,
    Blocklisted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub uuid: Uuid,
    pub email: String,
    pub name: String,

    /// Arbitrary attributes, reachable from templates as `subscriber.attribs`.
    #[serde(default)]
    pub attribs: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub status: SubscriberStatus,
}
