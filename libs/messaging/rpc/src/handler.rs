//! # Request Handling
//!
//! Per-message state machine:
//!
//! ```text
//! Received ──publish ok──► Replied ──ack ok──► Acknowledged
//!     │                       │
//!     └──malformed / publish──┴──ack failed──► (no ack, lock released)
//!            failed ─► Failed
//! ```
//!
//! A reply is always published before the inbound message is acknowledged.
//! Every failure path leaves the message unacknowledged, so the transport
//! redelivers it (and eventually dead-letters it).

use crate::error::{Result, RpcError};
use crate::message::InboundRequest;
use crate::publisher::ResponsePublisher;
use crate::transport::Delivery;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the session event channel
const SESSION_EVENT_CAPACITY: usize = 64;

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Received,
    Replied,
    Acknowledged,
    Failed,
}

impl HandlerState {
    pub fn can_transition_to(self, next: HandlerState) -> bool {
        matches!(
            (self, next),
            (HandlerState::Received, HandlerState::Replied)
                | (HandlerState::Received, HandlerState::Failed)
                | (HandlerState::Replied, HandlerState::Acknowledged)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandlerState::Acknowledged | HandlerState::Failed)
    }
}

/// Session-level signals raised while handling requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The requester marked this message as the last of the simulation
    FinalMessage { message_id: String },
}

/// Builds the reply body for a request
pub trait ResponseComposer: Send + Sync {
    fn compose(&self, request: &InboundRequest) -> Result<String>;
}

/// Replies with the request body unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoComposer;

impl ResponseComposer for EchoComposer {
    fn compose(&self, request: &InboundRequest) -> Result<String> {
        Ok(request.body.clone())
    }
}

/// Result of a fully handled request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub message_id: String,
    /// Id the transport assigned to the reply
    pub reply_id: String,
    pub is_final: bool,
}

/// Processes one delivery at a time; shared across handler tasks
pub struct RequestHandler {
    publisher: Arc<dyn ResponsePublisher>,
    composer: Arc<dyn ResponseComposer>,
    events: broadcast::Sender<SessionEvent>,
}

impl RequestHandler {
    pub fn new(publisher: Arc<dyn ResponsePublisher>) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            publisher,
            composer: Arc::new(EchoComposer),
            events,
        }
    }

    pub fn with_composer(mut self, composer: Arc<dyn ResponseComposer>) -> Self {
        self.composer = composer;
        self
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Handle one delivery: validate, reply, then acknowledge
    pub async fn handle(&self, delivery: Delivery) -> Result<Completion> {
        let request = delivery.request();
        let message_id = request.id.clone();
        let is_final = request.is_final();
        let mut state = HandlerState::Received;

        info!(
            "Received request {} ({} bytes, delivery {})",
            message_id,
            request.size(),
            request.delivery_count
        );

        let prepared = Self::destination(request).and_then(|destination| {
            let body = self.composer.compose(request)?;
            Ok((destination, body))
        });
        let (destination, body) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                advance(&mut state, HandlerState::Failed, &message_id);
                warn!("Rejected request {}: {}", message_id, e);
                return Err(e);
            }
        };

        let receipt = match self.publisher.publish(&destination, &body, &message_id).await {
            Ok(receipt) => receipt,
            Err(e) => {
                advance(&mut state, HandlerState::Failed, &message_id);
                warn!("Reply to {} failed, leaving it unacknowledged: {}", message_id, e);
                return Err(e);
            }
        };
        advance(&mut state, HandlerState::Replied, &message_id);

        if let Err(e) = delivery.acknowledge().await {
            warn!(
                "Acknowledging {} failed after reply was sent, expect redelivery: {}",
                message_id, e
            );
            return Err(RpcError::TransportFault(e));
        }
        advance(&mut state, HandlerState::Acknowledged, &message_id);

        if is_final {
            info!("Processed final message {}, simulation complete", message_id);
            // No subscribers is fine
            let _ = self.events.send(SessionEvent::FinalMessage {
                message_id: message_id.clone(),
            });
        }

        Ok(Completion {
            message_id,
            reply_id: receipt.message_id,
            is_final,
        })
    }

    fn destination(request: &InboundRequest) -> Result<String> {
        if request.id.trim().is_empty() {
            return Err(RpcError::malformed("<empty>", "message id is empty"));
        }
        request
            .reply_destination()
            .map(str::to_string)
            .ok_or_else(|| RpcError::malformed(&request.id, "reply-to destination is missing"))
    }
}

fn advance(state: &mut HandlerState, next: HandlerState, message_id: &str) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal transition {:?} -> {:?}",
        state,
        next
    );
    debug!("Request {}: {:?} -> {:?}", message_id, state, next);
    *state = next;
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("subscribers", &self.events.receiver_count())
            .finish_non_exhaustive()
    }
}
