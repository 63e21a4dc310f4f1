use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use courier_common::{Bounce, Signal, incoming, internal, tracing};
use courier_tracing::traced;
use reqwest::header::HeaderMap;
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
    },
    task::{JoinError, JoinHandle},
};

use crate::{
    config::BounceConfig,
    error::{RecordError, WebhookError},
    mailbox::Mailbox,
    recorder::Recorder,
    webhooks::{self, Webhook},
};

/// Entry point for bounces arriving from outside: webhook callbacks and
/// bounces produced by the embedding application.
///
/// Cheap to clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct Ingester {
    webhooks: Arc<HashMap<&'static str, Arc<dyn Webhook>>>,
    queue: mpsc::Sender<Bounce>,
}

impl Ingester {
    /// Authenticates and parses a provider callback and queues the bounces
    /// it carries, returning how many were queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is not enabled, or the callback
    /// fails verification or parsing. Nothing is queued in that case.
    pub async fn ingest(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<usize, WebhookError> {
        let webhook = self
            .webhooks
            .get(provider)
            .ok_or_else(|| WebhookError::UnknownProvider(provider.to_string()))?;

        webhook.verify(headers, body).await?;
        let bounces = webhook.parse(headers, body).await?;

        incoming!(
            provider = webhook.provider(),
            records = bounces.len(),
            "Webhook callback accepted"
        );

        let mut queued = 0;
        for bounce in bounces {
            if self.enqueue(bounce) {
                queued += 1;
            }
        }

        Ok(queued)
    }

    /// Queues a bounce without blocking. Returns `false` if it was dropped.
    pub fn submit(&self, bounce: Bounce) -> bool {
        self.enqueue(bounce)
    }

    /// Names of the enabled webhook providers.
    #[must_use]
    pub fn providers(&self) -> Vec<&'static str> {
        let mut providers: Vec<_> = self.webhooks.keys().copied().collect();
        providers.sort_unstable();
        providers
    }

    fn enqueue(&self, bounce: Bounce) -> bool {
        match self.queue.try_send(bounce) {
            Ok(()) => true,
            Err(TrySendError::Full(bounce)) => {
                internal!(
                    level = WARN,
                    source = %bounce.source,
                    email = %bounce.email,
                    "Bounce queue full, dropping bounce"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                internal!(level = WARN, "Bounce queue closed, dropping bounce");
                false
            }
        }
    }
}

/// Collects bounces from every ingestion path onto a single bounded queue
/// and hands them to the [`Recorder`] one at a time.
pub struct BounceManager {
    config: BounceConfig,
    recorder: Arc<dyn Recorder>,
    ingester: Ingester,
    queue: mpsc::Receiver<Bounce>,
}

impl BounceManager {
    /// Builds a manager with the webhooks enabled in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a webhook configuration is invalid.
    pub fn new(config: BounceConfig, recorder: Arc<dyn Recorder>) -> Result<Self, WebhookError> {
        let webhooks = webhooks::from_config(&config.webhooks)?;
        Ok(Self::with_webhooks(config, recorder, webhooks))
    }

    pub fn with_webhooks(
        config: BounceConfig,
        recorder: Arc<dyn Recorder>,
        webhooks: Vec<Arc<dyn Webhook>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let webhooks = webhooks
            .into_iter()
            .map(|webhook| (webhook.provider(), webhook))
            .collect();

        Self {
            config,
            recorder,
            ingester: Ingester {
                webhooks: Arc::new(webhooks),
                queue: tx,
            },
            queue: rx,
        }
    }

    #[must_use]
    pub fn ingester(&self) -> Ingester {
        self.ingester.clone()
    }

    /// Records queued bounces and scans the mailbox, if one is configured,
    /// until a shutdown signal arrives. Bounces still queued at that point
    /// are recorded before returning.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "s"))]
    pub async fn serve(mut self, mut shutdown: broadcast::Receiver<Signal>) {
        let scanner = self.config.mailbox.clone().map(|config| {
            let mailbox = Mailbox::new(config);
            tokio::spawn(mailbox.serve(self.ingester.queue.clone(), shutdown.resubscribe()))
        });

        internal!(
            level = INFO,
            "Bounce manager running with webhooks {:?}",
            self.ingester.providers()
        );

        loop {
            tokio::select! {
                biased;
                signal = shutdown.recv() => match signal {
                    Ok(Signal::Shutdown | Signal::Finalised) => {
                        internal!(level = INFO, "Bounce manager received shutdown signal");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        internal!(level = WARN, "Shutdown channel closed, stopping bounce manager");
                        break;
                    }
                },
                Some(bounce) = self.queue.recv() => self.record(bounce).await,
            }
        }

        // An interrupted scan never reaches QUIT, so the server keeps the
        // messages it had fetched.
        if let Some(scanner) = scanner
            && let Some(e) = stop_scanner(scanner).await
        {
            internal!(level = ERROR, "Mailbox scanner failed: {e}");
        }

        self.queue.close();
        while let Some(bounce) = self.queue.recv().await {
            self.record(bounce).await;
        }

        internal!(level = INFO, "Bounce manager stopped");
    }

    async fn record(&self, mut bounce: Bounce) {
        bounce.created_at.get_or_insert_with(Utc::now);

        let source = bounce.source.clone();
        let kind = bounce.kind;
        match self.recorder.record(bounce).await {
            Ok(()) => tracing::debug!(%source, %kind, "Bounce recorded"),
            Err(e @ RecordError::NotFound(_)) => {
                internal!(level = INFO, %source, "Bounce not recorded: {e}");
            }
            Err(e) => internal!(level = ERROR, %source, "Error recording bounce: {e}"),
        }
    }
}

/// Aborts the scanner task and returns the panic it died of, if any.
async fn stop_scanner(scanner: JoinHandle<()>) -> Option<JoinError> {
    scanner.abort();
    match scanner.await {
        Err(e) if e.is_panic() => Some(e),
        _ => None,
    }
}
