use async_trait::async_trait;
use courier_common::{Bounce, internal};

use crate::error::RecordError;

/// Persists bounces, typically by updating the subscriber and campaign
/// they belong to.
///
/// Called once for every bounce taken off the queue. A failed call is
/// logged and the bounce is not retried.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record(&self, bounce: Bounce) -> Result<(), RecordError>;
}

/// Recorder that only logs, for deployments without a subscriber store.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecorder;

#[async_trait]
impl Recorder for LogRecorder {
    async fn record(&self, bounce: Bounce) -> Result<(), RecordError> {
        internal!(
            level = INFO,
            kind = %bounce.kind,
            source = %bounce.source,
            campaign = %bounce.campaign_uuid,
            subscriber = %bounce.subscriber_uuid,
            email = %bounce.email,
            "Bounce received"
        );
        Ok(())
    }
}
