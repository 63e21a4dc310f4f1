//! HTTP endpoint for provider bounce webhooks.

use std::{net::SocketAddr, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use courier_bounce::Ingester;
use courier_common::{Signal, incoming, internal};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::timeout::TimeoutLayer;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind webhook listener to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Webhook listener failed: {0}")]
    Server(#[source] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "ListenerConfig::default_listen_address")]
    pub listen_address: String,

    /// Requests taking longer than this are answered with a timeout.
    #[serde(default = "ListenerConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ListenerConfig {
    fn default_listen_address() -> String {
        "127.0.0.1:9000".to_string()
    }

    const fn default_timeout_secs() -> u64 {
        30
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_address: Self::default_listen_address(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

/// Serves `POST /webhooks/service/{provider}` for every enabled provider.
pub struct WebhookListener {
    listener: TcpListener,
    router: Router,
}

impl WebhookListener {
    /// # Errors
    ///
    /// Returns an error if binding to the configured address fails.
    pub async fn bind(config: &ListenerConfig, ingester: Ingester) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|source| ListenerError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;

        let router = Router::new()
            .route("/webhooks/service/{provider}", post(handle))
            .with_state(ingester)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeout_secs)));

        Ok(Self { listener, router })
    }

    /// # Errors
    ///
    /// If the bound socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves callbacks until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails while running.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        if let Ok(address) = self.listener.local_addr() {
            internal!(level = INFO, "Webhook listener running on {address}");
        }

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                internal!(level = INFO, "Webhook listener received shutdown signal");
            })
            .await
            .map_err(ListenerError::Server)?;

        internal!(level = INFO, "Webhook listener stopped");
        Ok(())
    }
}

async fn handle(
    State(ingester): State<Ingester>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match ingester.ingest(&provider, &headers, &body).await {
        Ok(queued) => (StatusCode::OK, Json(json!({ "data": queued }))).into_response(),
        Err(e) => {
            let status = if e.is_unauthorized() {
                StatusCode::UNAUTHORIZED
            } else if e.is_bad_request() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            incoming!(level = WARN, "Rejected {provider} webhook ({status}): {e}");

            (status, Json(json!({ "message": e.to_string() }))).into_response()
        }
    }
}
