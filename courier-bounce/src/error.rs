//! Error types for bounce ingestion.
//!
//! Webhook errors are returned to the caller of the webhook endpoint and
//! nothing is queued. Mailbox errors abort a single scan; the next scan
//! starts from scratch. Recorder errors are logged and the bounce dropped.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Unknown webhook provider: {0}")]
    UnknownProvider(String),

    /// No secret is configured and verification was not explicitly skipped.
    #[error("No verification secret configured for {0} webhooks")]
    NotConfigured(&'static str),

    #[error("Missing signature material: {0}")]
    MissingSignature(&'static str),

    #[error("Invalid {0} webhook signature")]
    InvalidSignature(&'static str),

    #[error("Invalid {provider} webhook configuration: {reason}")]
    Configuration {
        provider: &'static str,
        reason: String,
    },

    #[error("Malformed {provider} notification: {reason}")]
    Payload {
        provider: &'static str,
        reason: String,
    },

    #[error("Unsupported {provider} event: {event}")]
    UnsupportedEvent {
        provider: &'static str,
        event: String,
    },

    #[error("SNS certificate error: {0}")]
    Certificate(String),

    #[error("SNS subscription confirmation failed with status {0}")]
    Confirmation(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl WebhookError {
    /// Returns `true` if the request could not be authenticated.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::NotConfigured(_)
                | Self::MissingSignature(_)
                | Self::InvalidSignature(_)
                | Self::Certificate(_)
        )
    }

    /// Returns `true` if the request was authentic but its content unusable.
    #[must_use]
    pub const fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::UnknownProvider(_) | Self::Payload { .. } | Self::UnsupportedEvent { .. }
        )
    }

    pub(crate) fn payload(provider: &'static str, reason: impl ToString) -> Self {
        Self::Payload {
            provider,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out waiting for the POP3 server")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    /// The server answered `-ERR`.
    #[error("{command} failed: {message}")]
    Server { command: String, message: String },

    #[error("POP3 protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Bounce queue closed")]
    QueueClosed,
}

impl MailboxError {
    /// Returns `true` if retrying on the next scan interval may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout | Self::ConnectionClosed | Self::Tls(_)
        )
    }
}

/// Failure reported by a [`crate::Recorder`].
#[derive(Debug, Error)]
pub enum RecordError {
    /// Neither the subscriber uuid nor the email matched a subscriber.
    #[error("Bounced subscriber {0} not found")]
    NotFound(String),

    #[error("Failed to record bounce: {0}")]
    Store(String),
}
