//! Click tracking.
//!
//! Destination URLs are registered with the data source once and cached for
//! the life of the process, across campaigns.

use std::{collections::HashMap, sync::Arc};

use courier_common::internal;
use parking_lot::RwLock;
use tokio::runtime::Handle;

use crate::{store::DataSource, urls::UrlBuilder};

pub struct LinkTracker {
    store: Arc<dyn DataSource>,
    urls: UrlBuilder,
    cache: RwLock<HashMap<String, String>>,
    runtime: Handle,
}

impl LinkTracker {
    /// `runtime` drives registration calls made from template rendering,
    /// which runs on blocking threads.
    pub fn new(store: Arc<dyn DataSource>, urls: UrlBuilder, runtime: Handle) -> Self {
        Self {
            store,
            urls,
            cache: RwLock::new(HashMap::new()),
            runtime,
        }
    }

    pub const fn urls(&self) -> &UrlBuilder {
        &self.urls
    }

    /// Tracking URL for `url` in the given campaign/subscriber context.
    ///
    /// Blocks on the data source on a cache miss, so it must be called off
    /// the async executor (rendering runs under `spawn_blocking`). When the
    /// registration fails the untracked URL is returned.
    ///
    /// The cache is checked and filled under separate locks. Concurrent first
    /// uses of the same URL may both register it; the data source hands out
    /// the same id for the same URL, so the cache still ends up with a single
    /// entry.
    pub fn resolve(&self, url: &str, campaign: &str, subscriber: &str) -> String {
        let url = url.replace("&amp;", "&");

        let cached = self.cache.read().get(&url).cloned();
        let id = match cached {
            Some(id) => id,
            None => match self.runtime.block_on(self.store.create_link(&url)) {
                Ok(id) => {
                    self.cache.write().insert(url.clone(), id.clone());
                    id
                }
                Err(err) => {
                    internal!(level = WARN, "Failed to register link {url}: {err}");
                    return url;
                }
            },
        };

        self.urls.link(&id, campaign, subscriber)
    }

    /// Cached tracking id for `url`, if any.
    pub fn get(&self, url: &str) -> Option<String> {
        self.cache.read().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}
