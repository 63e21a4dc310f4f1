use serde::Deserialize;

use crate::{
    mailbox::MailboxConfig,
    webhooks::{
        forwardemail::ForwardEmailConfig, mailgun::MailgunConfig, postmark::PostmarkConfig,
        sendgrid::SendgridConfig, ses::SesConfig,
    },
};

const fn default_queue_size() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BounceConfig {
    /// Capacity of the queue between the ingestion paths and the recorder.
    /// Bounces arriving while it is full are dropped.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default)]
    pub webhooks: WebhooksConfig,

    /// POP3 mailbox to scan for bounce e-mails.
    #[serde(default)]
    pub mailbox: Option<MailboxConfig>,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            webhooks: WebhooksConfig::default(),
            mailbox: None,
        }
    }
}

/// Enabled webhook providers. A provider without an entry rejects every
/// callback as unknown.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub ses: Option<SesConfig>,

    #[serde(default)]
    pub sendgrid: Option<SendgridConfig>,

    #[serde(default)]
    pub mailgun: Option<MailgunConfig>,

    #[serde(default)]
    pub postmark: Option<PostmarkConfig>,

    #[serde(default)]
    pub forwardemail: Option<ForwardEmailConfig>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mailbox::AuthProtocol;

    #[test]
    fn test_empty_config() {
        let config: BounceConfig = ron::from_str("()").unwrap();

        assert_eq!(config.queue_size, 1000);
        assert!(config.mailbox.is_none());
        assert!(config.webhooks.ses.is_none());
        assert!(config.webhooks.postmark.is_none());
    }

    #[test]
    fn test_full_config() {
        let config: BounceConfig = ron::from_str(
            r#"(
                queue_size: 50,
                webhooks: (
                    mailgun: Some((signing_key: Some("key-1"))),
                    postmark: Some((insecure_skip_verify: true)),
                ),
                mailbox: Some((
                    host: "pop.example.com",
                    port: 995,
                    auth: cram,
                    username: "bounces",
                    password: "secret",
                    tls: true,
                )),
            )"#,
        )
        .unwrap();

        assert_eq!(config.queue_size, 50);
        assert_eq!(
            config.webhooks.mailgun.unwrap().signing_key.as_deref(),
            Some("key-1")
        );
        assert!(config.webhooks.postmark.unwrap().insecure_skip_verify);

        let mailbox = config.mailbox.unwrap();
        assert_eq!(mailbox.host, "pop.example.com");
        assert_eq!(mailbox.port, 995);
        assert_eq!(mailbox.auth, AuthProtocol::Cram);
        assert!(mailbox.tls);
        assert_eq!(mailbox.scan_limit, 1000);
        assert_eq!(mailbox.scan_interval_secs, 900);
    }
}
