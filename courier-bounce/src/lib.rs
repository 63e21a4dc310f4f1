//! Bounce ingestion.
//!
//! Bounces reach the [`BounceManager`] from two directions: provider
//! webhooks passed to an [`Ingester`], and the optional POP3 [`Mailbox`]
//! scanner. Both normalise into [`courier_common::Bounce`] records on one
//! bounded queue; enqueueing never blocks and a full queue drops the bounce.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod manager;
pub mod recorder;
pub mod webhooks;

pub use config::{BounceConfig, WebhooksConfig};
pub use error::{MailboxError, RecordError, WebhookError};
pub use mailbox::{AuthProtocol, Mailbox, MailboxConfig, ScanReport};
pub use manager::{BounceManager, Ingester};
pub use recorder::{LogRecorder, Recorder};
pub use webhooks::Webhook;
