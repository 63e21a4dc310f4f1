pub mod bounce;
pub mod campaign;
pub mod logging;
pub mod subscriber;

pub use tracing;

pub use bounce::{Bounce, BounceType};
pub use campaign::{Campaign, CampaignStatus, ContentType, Header};
pub use subscriber::{Subscriber, SubscriberStatus};

/// Header carrying the campaign UUID on every outbound campaign message.
pub const CAMPAIGN_HEADER: &str = "X-Courier-Campaign";

/// Header carrying the subscriber UUID on every outbound campaign message.
pub const SUBSCRIBER_HEADER: &str = "X-Courier-Subscriber";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
