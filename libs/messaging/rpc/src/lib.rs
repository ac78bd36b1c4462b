//! # RPC Responder Core
//!
//! Request/reply over a message queue: requests arrive on `<id>_requests`,
//! each one is answered on its `reply_to` destination with the request's
//! message id as correlation id, and only then acknowledged.
//!
//! ## Components
//!
//! - [`ConnectionResolver`]: vault name to [`ConnectionDescriptor`]
//! - [`ResponsePublisher`]: one reply per call ([`BusPublisher`] over the transport)
//! - [`RequestHandler`]: per-message state machine, publish before acknowledge
//! - [`ErrorSink`]: out-of-band fault reporting on its own task
//! - [`ProcessorLoop`]: subscription owner with a concurrency cap
//!
//! The bus client sits behind the traits in [`transport`]; [`MemoryBroker`]
//! implements them in-process with peek-lock and dead-letter semantics.

pub mod connection;
pub mod descriptor;
pub mod error;
pub mod error_sink;
pub mod handler;
pub mod memory;
pub mod message;
pub mod processor;
pub mod publisher;
pub mod resolver;
pub mod test_utils;
pub mod transport;

pub use connection::{ResourceGuard, ResourceStats, ResourceTracker};
pub use descriptor::{ConnectionDescriptor, Endpoint};
pub use error::{PublishContext, Result, RpcError, TransportError};
pub use error_sink::{
    spawn_error_sink, ErrorSink, FaultContext, FaultReporter, FaultStage, TracingErrorSink,
};
pub use handler::{
    Completion, EchoComposer, HandlerState, RequestHandler, ResponseComposer, SessionEvent,
};
pub use memory::{BrokeredMessage, MemoryBroker, MemoryBrokerConfig, DEFAULT_MAX_DELIVERY_COUNT};
pub use message::{
    InboundRequest, OutboundResponse, SendReceipt, DEFAULT_MAX_MESSAGE_SIZE,
    FINAL_MESSAGE_PROPERTY, FINAL_MESSAGE_VALUE,
};
pub use processor::{
    FinalMessagePolicy, ProcessorConfig, ProcessorLoop, ProcessorStats, QueueNames, StopReason,
    DEFAULT_RECEIVE_BACKOFF,
};
pub use publisher::{BusPublisher, PublisherConfig, ResponsePublisher, SenderMode};
pub use resolver::{
    CachedResolver, ConnectionResolver, EnvResolver, KeyVaultConfig, KeyVaultResolver,
    StaticResolver,
};
pub use transport::{
    BusConnection, Connector, ConnectorRegistry, Delivery, ReplySender, RequestReceiver,
    Settlement,
};
