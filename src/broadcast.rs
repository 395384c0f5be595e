//! Broadcast of clinical facts onto an FDC3 desktop-agent bus.
//!
//! The bus is optional. A gateway built without one accepts every fact and
//! does nothing, so the rest of the pipeline never branches on bus presence.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::facts::ClinicalFact;

/// HTTP client timeout for bus requests
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Bus errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus rejected context: {0}")]
    Rejected(String),

    #[error("Invalid bus endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A bus that accepts FDC3 context objects
#[async_trait]
pub trait ContextBus: Send + Sync {
    async fn broadcast(&self, context: &Value) -> Result<(), BusError>;
}

/// Sends facts to the bus, if there is one
#[derive(Clone, Default)]
pub struct BroadcastGateway {
    bus: Option<Arc<dyn ContextBus>>,
}

impl BroadcastGateway {
    pub fn new(bus: Option<Arc<dyn ContextBus>>) -> Self {
        Self { bus }
    }

    /// A gateway with no bus attached
    pub fn disconnected() -> Self {
        Self { bus: None }
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    /// Forward `fact` to the bus and wait for it to be accepted.
    ///
    /// Without a bus this returns `Ok(())` immediately. Bus errors are
    /// returned as-is.
    pub async fn send(&self, fact: &ClinicalFact) -> Result<(), BusError> {
        let Some(bus) = &self.bus else {
            return Ok(());
        };

        let context = fact.to_context()?;
        debug!("Broadcasting context: {}", context);
        bus.broadcast(&context).await
    }
}

/// Desktop agent reached over HTTP: each context is POSTed as JSON
#[derive(Debug)]
pub struct HttpContextBus {
    http_client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpContextBus {
    pub fn new(endpoint: &str) -> Result<Self, BusError> {
        Self::with_timeout(endpoint, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, timeout: std::time::Duration) -> Result<Self, BusError> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| BusError::InvalidEndpoint(format!("'{}': {}", endpoint, e)))?;

        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(BusError::InvalidEndpoint(format!(
                "URL must use http or https scheme, got: {}",
                endpoint.scheme()
            )));
        }

        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        info!("FDC3 bus endpoint: {}", endpoint);

        Ok(Self {
            http_client,
            endpoint,
        })
    }
}

#[async_trait]
impl ContextBus for HttpContextBus {
    async fn broadcast(&self, context: &Value) -> Result<(), BusError> {
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .json(context)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(BusError::Rejected(format!("{}: {}", status, body)))
        }
    }
}
