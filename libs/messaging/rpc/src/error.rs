//! # Responder Error Types
//!
//! Two layers of errors:
//!
//! - [`TransportError`]: what the bus client reports (connection loss,
//!   missing entities, lock problems). Classified with
//!   [`TransportError::is_recoverable`] so callers can decide how loudly to
//!   complain.
//! - [`RpcError`]: the responder taxonomy. Startup failures
//!   (`SecretUnavailable`, `InvalidDescriptor`, `InvalidConfig`) are fatal;
//!   per-message failures (`MalformedRequest`, `PublishFailed`) leave the
//!   message unacknowledged; `TransportFault` is observational only.

use thiserror::Error;

/// Context attached to a failed publish to aid in debugging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishContext {
    /// Reply destination the response was addressed to
    pub destination: String,
    /// Correlation id carried by the response
    pub correlation_id: String,
    /// Size of the response payload in bytes
    pub message_size: usize,
}

impl PublishContext {
    pub fn new(
        destination: impl Into<String>,
        correlation_id: impl Into<String>,
        message_size: usize,
    ) -> Self {
        Self {
            destination: destination.into(),
            correlation_id: correlation_id.into(),
            message_size,
        }
    }
}

/// Errors raised by a bus client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Messaging entity not found: {0}")]
    EntityNotFound(String),

    #[error("Message too large: {size}B exceeds limit of {limit}B")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Message lock lost for {0}")]
    LockLost(String),

    #[error("Client closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the transport's own reconnection policy is expected to recover
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_) | TransportError::LockLost(_)
        )
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_) | TransportError::ConnectionLost(_)
        )
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        TransportError::ConnectionFailed(msg.into())
    }

    pub fn entity_not_found(entity: impl Into<String>) -> Self {
        TransportError::EntityNotFound(entity.into())
    }

    pub fn message_too_large(size: usize, limit: usize) -> Self {
        TransportError::MessageTooLarge { size, limit }
    }
}

/// Responder error taxonomy
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("Secret unavailable from vault {vault}: {reason}")]
    SecretUnavailable { vault: String, reason: String },

    #[error("Invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed request {message_id}: {reason}")]
    MalformedRequest { message_id: String, reason: String },

    #[error("Publish failed: {error} (destination: {destination}, id: {correlation_id}, size: {size}B)",
            destination = context.destination,
            correlation_id = context.correlation_id,
            size = context.message_size)]
    PublishFailed {
        error: TransportError,
        context: PublishContext,
    },

    #[error("Transport fault: {0}")]
    TransportFault(#[from] TransportError),
}

impl RpcError {
    pub fn secret_unavailable(vault: impl Into<String>, reason: impl Into<String>) -> Self {
        RpcError::SecretUnavailable {
            vault: vault.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RpcError::MalformedRequest {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    pub fn publish_failed(error: TransportError, context: PublishContext) -> Self {
        RpcError::PublishFailed { error, context }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        RpcError::InvalidConfig(msg.into())
    }

    /// Startup errors abort the process; everything else is isolated to one message
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::SecretUnavailable { .. }
                | RpcError::InvalidDescriptor(_)
                | RpcError::InvalidConfig(_)
        )
    }

    /// Failures that leave the inbound message unacknowledged for redelivery
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            RpcError::MalformedRequest { .. } | RpcError::PublishFailed { .. }
        )
    }
}

/// Result type alias for responder operations
pub type Result<T> = std::result::Result<T, RpcError>;
