use std::sync::Arc;

use courier_messenger::MessengerRegistry;
use tokio::runtime::Handle;

use crate::{
    config::ManagerConfig, links::LinkTracker, notify::Notifier, store::DataSource,
    urls::UrlBuilder,
};

/// Collaborators shared by every engine task.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<ManagerConfig>,
    pub store: Arc<dyn DataSource>,
    pub registry: Arc<MessengerRegistry>,
    pub notifier: Arc<dyn Notifier>,
    pub links: Arc<LinkTracker>,
}

impl Context {
    /// # Panics
    ///
    /// When called outside of a tokio runtime; the link tracker keeps a
    /// handle to the current one.
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn DataSource>,
        registry: Arc<MessengerRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = Arc::new(config.normalised());
        let urls = UrlBuilder::new(config.root_url.clone(), config.individual_tracking);
        let links = Arc::new(LinkTracker::new(
            Arc::clone(&store),
            urls,
            Handle::current(),
        ));

        Self {
            config,
            store,
            registry,
            notifier,
            links,
        }
    }
}
