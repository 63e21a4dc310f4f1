use std::sync::Arc;

use courier_common::{Campaign, ContentType, Header, Subscriber};

/// A rendered message on its way to a messenger. Never persisted.
#[derive(Debug, Clone)]
pub struct Message {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub content_type: ContentType,
    pub body: Vec<u8>,
    pub alt_body: Option<Vec<u8>>,
    pub headers: Vec<Header>,

    /// Name of the messenger expected to deliver this message.
    pub messenger: String,

    pub campaign: Option<Arc<Campaign>>,
    pub subscriber: Subscriber,
}

impl Message {
    /// Value of the first header called `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}
