//! Typed error handling for the delivery engine.
//!
//! Errors are split by blast radius:
//! - Campaign errors are fatal to one campaign: it leaves the active set
//!   with a status change and an admin notification
//! - Subscriber errors affect one message: it is skipped or counted
//!   against the campaign's error threshold
//! - System errors are store or queue problems: logged, retried next tick

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Campaign failure: {0}")]
    Campaign(#[from] CampaignError),

    #[error("Subscriber failure: {0}")]
    Subscriber(#[from] SubscriberError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Conditions no retry can fix; the operator has to intervene.
#[derive(Debug, Error)]
pub enum CampaignError {
    /// The campaign names a messenger that is not registered.
    #[error("Unknown messenger {messenger} for campaign {campaign}")]
    UnknownMessenger { campaign: String, messenger: String },

    #[error("Template for campaign {campaign} does not compile: {reason}")]
    TemplateCompile { campaign: String, reason: String },

    #[error("Campaign {0} exceeded the error threshold")]
    TooManyErrors(String),
}

#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("Failed to render message for {subscriber}: {reason}")]
    Render { subscriber: String, reason: String },

    #[error("Failed to push message for {subscriber}: {reason}")]
    Push { subscriber: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A queue between engine tasks was closed, usually during shutdown.
    #[error("Queue closed: {0}")]
    QueueClosed(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if the campaign has to leave the active set.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Campaign(_))
    }

    /// Returns `true` if only a single subscriber is affected.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Subscriber(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::System(SystemError::Store(error))
    }
}
