pub mod config;
pub mod controller;
pub mod listener;

pub use config::{ConfigError, MessengersConfig, find_config_file};
pub use controller::{Courier, SHUTDOWN_BROADCAST, Services};
pub use listener::{ListenerConfig, ListenerError, WebhookListener};
