//! HTTP postback messenger: every message is POSTed as JSON to a fixed URL.

use std::{borrow::Cow, time::Duration};

use async_trait::async_trait;
use courier_common::{ContentType, Header, SubscriberStatus, outgoing};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Message, Messenger, MessengerError};

const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

const fn default_timeout() -> u64 {
    5
}

const fn default_max_connections() -> usize {
    10
}

const fn default_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostbackConfig {
    pub name: String,
    pub root_url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Idle connections kept per host
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Additional attempts after the first failed one
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    uuid: Uuid,
    email: &'a str,
    name: &'a str,
    attribs: &'a serde_json::Map<String, serde_json::Value>,
    status: SubscriberStatus,
}

#[derive(Debug, Serialize)]
struct CampaignRef<'a> {
    from_email: &'a str,
    uuid: Uuid,
    name: &'a str,
    headers: &'a [Header],
    tags: &'a [String],
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    subject: &'a str,
    content_type: ContentType,
    body: Cow<'a, str>,
    recipients: Vec<Recipient<'a>>,
    campaign: Option<CampaignRef<'a>>,
}

impl<'a> From<&'a Message> for Payload<'a> {
    fn from(message: &'a Message) -> Self {
        let subscriber = &message.subscriber;

        Self {
            subject: &message.subject,
            content_type: message.content_type,
            body: String::from_utf8_lossy(&message.body),
            recipients: vec![Recipient {
                uuid: subscriber.uuid,
                email: &subscriber.email,
                name: &subscriber.name,
                attribs: &subscriber.attribs,
                status: subscriber.status,
            }],
            campaign: message.campaign.as_deref().map(|campaign| CampaignRef {
                from_email: &campaign.from_email,
                uuid: campaign.uuid,
                name: &campaign.name,
                headers: &campaign.headers,
                tags: &campaign.tags,
            }),
        }
    }
}

pub struct PostbackMessenger {
    name: String,
    url: String,
    credentials: Option<(String, Option<String>)>,
    retries: u32,
    client: reqwest::Client,
}

impl PostbackMessenger {
    /// # Errors
    ///
    /// If the HTTP client cannot be constructed.
    pub fn new(config: &PostbackConfig) -> Result<Self, MessengerError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.max_connections)
            .build()
            .map_err(|e| MessengerError::Configuration(e.to_string()))?;

        Ok(Self {
            name: config.name.clone(),
            url: config.root_url.clone(),
            credentials: config
                .username
                .clone()
                .map(|username| (username, config.password.clone())),
            retries: config.retries,
            client,
        })
    }

    async fn attempt(&self, payload: &Payload<'_>) -> Result<(), MessengerError> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| MessengerError::Transport(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::OK => Ok(()),
            status => Err(MessengerError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl Messenger for PostbackMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: &Message) -> Result<(), MessengerError> {
        let payload = Payload::from(message);

        let mut attempt = 0;
        loop {
            match self.attempt(&payload).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    outgoing!(
                        level = DEBUG,
                        "Postback to {} failed ({err}), retry {attempt}/{}",
                        self.url,
                        self.retries
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn flush(&self) -> Result<(), MessengerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), MessengerError> {
        Ok(())
    }
}
