//! # Transport Abstraction
//!
//! The bus client is an external collaborator. These traits describe the
//! small surface the responder needs from it:
//!
//! ```text
//! Connector ──connect(descriptor)──► BusConnection ──open_receiver(queue)──► RequestReceiver
//!                                          │                                      │
//!                                          └──open_sender(destination)──► ReplySender
//!                                                                                  ▼
//!                                                                  Delivery { request, settlement }
//! ```
//!
//! Deliveries use peek-lock semantics: a received message stays locked until
//! [`Delivery::acknowledge`] completes it. Dropping a [`Delivery`] without
//! acknowledging releases the lock, and the transport redelivers the message.

use crate::descriptor::ConnectionDescriptor;
use crate::error::TransportError;
use crate::message::{InboundRequest, OutboundResponse, SendReceipt};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Completes a locked message. Implementations release the lock on drop if
/// `complete` was never called.
#[async_trait]
pub trait Settlement: Send + Sync {
    async fn complete(self: Box<Self>) -> Result<(), TransportError>;
}

/// A locked inbound message
pub struct Delivery {
    request: InboundRequest,
    settlement: Box<dyn Settlement>,
}

impl Delivery {
    pub fn new(request: InboundRequest, settlement: Box<dyn Settlement>) -> Self {
        Self {
            request,
            settlement,
        }
    }

    /// Read-only view of the request
    pub fn request(&self) -> &InboundRequest {
        &self.request
    }

    /// Acknowledge the message. Consumes the delivery, so a message can be
    /// acknowledged at most once.
    pub async fn acknowledge(self) -> Result<(), TransportError> {
        self.settlement.complete().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Subscription to one request queue
#[async_trait]
pub trait RequestReceiver: Send {
    /// Wait for the next delivery. `None` means the subscription is closed.
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// lose a message.
    async fn receive(&mut self) -> Option<Result<Delivery, TransportError>>;

    /// Queue this receiver is bound to
    fn entity_path(&self) -> &str;
}

/// Sender bound to one destination
#[async_trait]
pub trait ReplySender: Send + Sync {
    /// Send one message; returns once the transport accepted or rejected it
    async fn send(&self, response: &OutboundResponse) -> Result<SendReceipt, TransportError>;

    /// Release the sender
    async fn close(&self) -> Result<(), TransportError>;

    fn destination(&self) -> &str;
}

/// An open client connection to the bus
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Fully qualified namespace of the bus
    fn namespace(&self) -> &str;

    async fn open_receiver(&self, queue: &str) -> Result<Box<dyn RequestReceiver>, TransportError>;

    async fn open_sender(&self, destination: &str) -> Result<Box<dyn ReplySender>, TransportError>;

    /// Close the connection and every receiver or sender still bound to it
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds connections from a descriptor
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn BusConnection>, TransportError>;
}

/// Picks a [`Connector`] by descriptor scheme (`memory`, `sb`, ...)
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector for a scheme, replacing any previous one
    pub fn register(&mut self, scheme: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(scheme.into().to_ascii_lowercase(), connector);
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<_> = self.connectors.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Connector for the descriptor's scheme
    pub fn connector_for(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn Connector>, TransportError> {
        self.connectors
            .get(descriptor.scheme())
            .cloned()
            .ok_or_else(|| {
                TransportError::connection_failed(format!(
                    "no transport registered for scheme '{}' (available: {})",
                    descriptor.scheme(),
                    self.schemes().join(", ")
                ))
            })
    }
}

#[async_trait]
impl Connector for ConnectorRegistry {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn BusConnection>, TransportError> {
        self.connector_for(descriptor)?.connect(descriptor).await
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
