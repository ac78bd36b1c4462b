//! # Response Publishing
//!
//! [`ResponsePublisher`] sends exactly one reply per call and returns only
//! once the transport accepted or rejected it. [`BusPublisher`] implements it
//! on top of a [`Connector`] in one of two modes:
//!
//! - [`SenderMode::PerCall`]: a fresh connection and sender for every reply,
//!   both closed before `publish` returns, whatever the outcome.
//! - [`SenderMode::Pooled`]: one shared connection and a cached sender per
//!   destination. A failed send evicts its sender (and, on connection
//!   errors, the connection) so the next publish starts from a clean slate.

use crate::descriptor::ConnectionDescriptor;
use crate::error::{PublishContext, Result, RpcError, TransportError};
use crate::message::{OutboundResponse, SendReceipt, DEFAULT_MAX_MESSAGE_SIZE};
use crate::transport::{BusConnection, Connector, ReplySender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Publishes one reply message per call
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        correlation_id: &str,
    ) -> Result<SendReceipt>;
}

#[async_trait]
impl<P: ResponsePublisher + ?Sized> ResponsePublisher for Arc<P> {
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        correlation_id: &str,
    ) -> Result<SendReceipt> {
        (**self).publish(destination, body, correlation_id).await
    }
}

/// How [`BusPublisher`] manages connections and senders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderMode {
    /// Fresh connection and sender per reply
    #[default]
    PerCall,
    /// Shared connection, cached sender per destination
    Pooled,
}

/// Configuration for [`BusPublisher`]
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub mode: SenderMode,
    /// Replies above this size fail before any I/O
    pub max_message_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            mode: SenderMode::PerCall,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Default)]
struct Pool {
    connection: Option<Arc<dyn BusConnection>>,
    senders: HashMap<String, Arc<dyn ReplySender>>,
}

/// [`ResponsePublisher`] over the transport traits
pub struct BusPublisher {
    connector: Arc<dyn Connector>,
    descriptor: Arc<ConnectionDescriptor>,
    config: PublisherConfig,
    pool: Mutex<Pool>,
}

impl BusPublisher {
    pub fn new(
        connector: Arc<dyn Connector>,
        descriptor: Arc<ConnectionDescriptor>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            connector,
            descriptor,
            config,
            pool: Mutex::new(Pool::default()),
        }
    }

    pub fn mode(&self) -> SenderMode {
        self.config.mode
    }

    /// Close pooled senders and the pooled connection. No-op in per-call mode.
    pub async fn close(&self) {
        let mut pool = self.pool.lock().await;
        for (destination, sender) in pool.senders.drain() {
            if let Err(e) = sender.close().await {
                warn!("Failed to close pooled sender for {}: {}", destination, e);
            }
        }
        if let Some(connection) = pool.connection.take() {
            if let Err(e) = connection.close().await {
                warn!("Failed to close pooled connection: {}", e);
            }
        }
    }

    async fn publish_per_call(
        &self,
        response: &OutboundResponse,
    ) -> std::result::Result<SendReceipt, TransportError> {
        let connection = self.connector.connect(&self.descriptor).await?;

        let result = match connection.open_sender(&response.destination).await {
            Ok(sender) => {
                let sent = sender.send(response).await;
                if let Err(e) = sender.close().await {
                    warn!("Failed to close sender for {}: {}", response.destination, e);
                }
                sent
            }
            Err(e) => Err(e),
        };

        if let Err(e) = connection.close().await {
            warn!("Failed to close reply connection: {}", e);
        }
        result
    }

    async fn pooled_sender(
        &self,
        destination: &str,
    ) -> std::result::Result<Arc<dyn ReplySender>, TransportError> {
        let mut pool = self.pool.lock().await;
        if let Some(sender) = pool.senders.get(destination) {
            return Ok(Arc::clone(sender));
        }

        let connection = match &pool.connection {
            Some(connection) => Arc::clone(connection),
            None => {
                let connection = self.connector.connect(&self.descriptor).await?;
                debug!("Opened pooled reply connection to {}", self.descriptor);
                pool.connection = Some(Arc::clone(&connection));
                connection
            }
        };

        let sender: Arc<dyn ReplySender> = Arc::from(connection.open_sender(destination).await?);
        pool.senders
            .insert(destination.to_string(), Arc::clone(&sender));
        Ok(sender)
    }

    async fn evict(&self, destination: &str, error: &TransportError) {
        let mut pool = self.pool.lock().await;
        if let Some(sender) = pool.senders.remove(destination) {
            if let Err(e) = sender.close().await {
                debug!("Closing evicted sender for {} failed: {}", destination, e);
            }
        }
        if error.is_connection_error() || matches!(error, TransportError::Closed) {
            for (_, sender) in pool.senders.drain() {
                let _ = sender.close().await;
            }
            if let Some(connection) = pool.connection.take() {
                let _ = connection.close().await;
            }
            warn!("Pooled reply connection dropped after: {}", error);
        }
    }

    async fn publish_pooled(
        &self,
        response: &OutboundResponse,
    ) -> std::result::Result<SendReceipt, TransportError> {
        let sender = self.pooled_sender(&response.destination).await?;
        match sender.send(response).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                self.evict(&response.destination, &e).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ResponsePublisher for BusPublisher {
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        correlation_id: &str,
    ) -> Result<SendReceipt> {
        let response = OutboundResponse::new(destination, body, correlation_id);
        let context = PublishContext::new(destination, correlation_id, response.size());

        if response.exceeds_limit(self.config.max_message_size) {
            return Err(RpcError::publish_failed(
                TransportError::message_too_large(response.size(), self.config.max_message_size),
                context,
            ));
        }

        let result = match self.config.mode {
            SenderMode::PerCall => self.publish_per_call(&response).await,
            SenderMode::Pooled => self.publish_pooled(&response).await,
        };

        match result {
            Ok(receipt) => {
                info!(
                    "Sent response message {} with correlation id {} to {}",
                    receipt.message_id, correlation_id, destination
                );
                Ok(receipt)
            }
            Err(e) => Err(RpcError::publish_failed(e, context)),
        }
    }
}

impl std::fmt::Debug for BusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusPublisher")
            .field("descriptor", &self.descriptor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
