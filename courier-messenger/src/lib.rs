//! Transport registry: named messengers that deliver one rendered message
//! at a time.

pub mod error;
pub mod message;
pub mod postback;
pub mod smtp;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use courier_common::internal;

pub use error::MessengerError;
pub use message::Message;
pub use postback::{PostbackConfig, PostbackMessenger};
pub use smtp::{SmtpConfig, SmtpMessenger};

/// A delivery backend.
#[async_trait]
pub trait Messenger: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, message: &Message) -> Result<(), MessengerError>;

    async fn flush(&self) -> Result<(), MessengerError>;

    async fn close(&self) -> Result<(), MessengerError>;
}

/// Name-keyed messengers, populated at startup and read-only afterwards.
#[derive(Default)]
pub struct MessengerRegistry {
    messengers: HashMap<String, Arc<dyn Messenger>>,
}

impl MessengerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a messenger under its own name.
    ///
    /// # Errors
    ///
    /// If a messenger with the same name already exists.
    pub fn register(&mut self, messenger: Arc<dyn Messenger>) -> Result<(), MessengerError> {
        let name = messenger.name().to_string();
        if self.messengers.contains_key(&name) {
            return Err(MessengerError::Duplicate(name));
        }

        internal!("Registered messenger {name}");
        self.messengers.insert(name, messenger);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Messenger>> {
        self.messengers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.messengers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.messengers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.messengers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messengers.is_empty()
    }

    /// Flush and close every messenger. Failures are logged, not returned.
    pub async fn close_all(&self) {
        for (name, messenger) in &self.messengers {
            if let Err(err) = messenger.flush().await {
                tracing::warn!(messenger = %name, "Failed to flush messenger: {err}");
            }
            if let Err(err) = messenger.close().await {
                tracing::warn!(messenger = %name, "Failed to close messenger: {err}");
            }
        }
    }
}
