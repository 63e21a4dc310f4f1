use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessengerError {
    /// A messenger with the same name is already registered.
    #[error("Messenger already registered: {0}")]
    Duplicate(String),

    #[error("Unknown messenger: {0}")]
    Unknown(String),

    #[error("Invalid address {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    /// The backend could not hand the message over.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote endpoint answered with something other than 200.
    #[error("Unexpected response status: {0}")]
    Status(u16),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Messenger {0} is closed")]
    Closed(String),
}

impl MessengerError {
    pub(crate) fn address(address: &str, reason: impl ToString) -> Self {
        Self::Address {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}
