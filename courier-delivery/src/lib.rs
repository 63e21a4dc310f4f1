//! Campaign delivery engine.
//!
//! The [`Manager`] wires four cooperating tasks together through bounded
//! queues:
//!
//! - the [`scheduler::Scheduler`] discovers due campaigns and owns the
//!   active-campaign set and per-campaign error counts
//! - the [`fetcher::BatchFetcher`] streams each campaign's audience in
//!   batches, renders messages and blocks on the delivery queue
//! - [`worker::Worker`]s pull messages and push them through the
//!   [`courier_messenger::MessengerRegistry`]
//! - failures flow back to the scheduler on a best-effort error queue

pub mod campaign;
pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod links;
pub mod manager;
pub mod notify;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod urls;
pub mod worker;

pub use campaign::ActiveCampaign;
pub use config::{ManagerConfig, SlidingWindow};
pub use context::Context;
pub use error::{CampaignError, DeliveryError, SubscriberError, SystemError};
pub use links::LinkTracker;
pub use manager::Manager;
pub use notify::{LogNotifier, Notification, Notifier};
pub use store::{DataSource, StoreError, memory::MemoryDataSource};
pub use template::{CampaignTemplate, RenderedMessage};
pub use urls::UrlBuilder;
