use std::{
    path::Path,
    str::FromStr,
    sync::{Arc, LazyLock},
};

use courier_bounce::{BounceConfig, BounceManager, Ingester, Recorder};
use courier_common::{Signal, internal, logging, tracing};
use courier_delivery::{DataSource, Manager, ManagerConfig, Notifier};
use courier_tracing::traced;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::{
    config::{self, ConfigError, MessengersConfig},
    listener::{ListenerConfig, WebhookListener},
};

/// Top level configuration: the delivery engine, the messengers it delivers
/// through and the bounce pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Courier {
    #[serde(alias = "engine", default)]
    pub delivery: ManagerConfig,

    #[serde(alias = "messenger", default)]
    pub messengers: MessengersConfig,

    #[serde(alias = "bounces", default)]
    pub bounce: BounceConfig,

    /// HTTP endpoint for provider webhooks. Without it, callbacks can only
    /// be fed in through [`Services::ingester`].
    #[serde(default)]
    pub listener: Option<ListenerConfig>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl FromStr for Courier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ron::from_str(s)?)
    }
}

impl Courier {
    /// Reads a RON configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not a valid configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        config::read(path)?.parse()
    }

    /// Builds the delivery engine and the bounce pipeline.
    ///
    /// The store, recorder and notifier belong to the embedding application;
    /// campaigns are read from the store and bounces handed to the recorder.
    ///
    /// # Errors
    ///
    /// If a messenger or webhook is misconfigured.
    pub fn build(
        self,
        store: Arc<dyn DataSource>,
        recorder: Arc<dyn Recorder>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Services, ConfigError> {
        let registry = Arc::new(self.messengers.registry()?);
        let delivery = Manager::new(self.delivery.normalised(), store, registry, notifier);
        let bounces = BounceManager::new(self.bounce, recorder)?;

        Ok(Services {
            delivery,
            bounces,
            listener: self.listener,
        })
    }
}

/// The running parts of courier, built from a [`Courier`] configuration.
pub struct Services {
    delivery: Manager,
    bounces: BounceManager,
    listener: Option<ListenerConfig>,
}

impl Services {
    /// Handle for feeding webhook callbacks and application bounces into
    /// the bounce pipeline.
    #[must_use]
    pub fn ingester(&self) -> Ingester {
        self.bounces.ingester()
    }

    /// Serves the delivery engine, the bounce pipeline and the webhook
    /// listener, if configured, until `signals` broadcasts a shutdown, then
    /// waits for them to wind down.
    pub async fn serve(self, signals: &broadcast::Sender<Signal>) {
        let listener = self.listener.map(|config| {
            let ingester = self.bounces.ingester();
            let shutdown = signals.subscribe();
            tokio::spawn(async move {
                let result = match WebhookListener::bind(&config, ingester).await {
                    Ok(listener) => listener.serve(shutdown).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    internal!(level = ERROR, "{e}");
                }
            })
        });
        let delivery = tokio::spawn(self.delivery.serve(signals.subscribe()));
        let bounces = tokio::spawn(self.bounces.serve(signals.subscribe()));

        let tasks = [
            ("delivery", Some(delivery)),
            ("bounce", Some(bounces)),
            ("listener", listener),
        ];
        for (name, handle) in tasks {
            let Some(handle) = handle else {
                continue;
            };
            if let Err(e) = handle.await {
                internal!(level = ERROR, "The {name} task failed: {e}");
            }
        }
    }

    /// Run everything until the process is asked to terminate.
    ///
    /// # Errors
    ///
    /// This function will return an error if the signal handlers cannot be
    /// installed.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!("Controller running");

        let ret = tokio::select! {
            () = self.serve(&SHUTDOWN_BROADCAST) => {
                Ok(())
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}
