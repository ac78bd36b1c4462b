//! # Processor Loop
//!
//! Owns the subscription to the request queue and dispatches deliveries to
//! the [`RequestHandler`] as spawned tasks, bounded by a semaphore.
//!
//! ## Lifecycle
//!
//! 1. Connect and open a receiver on the request queue
//! 2. Acquire a permit, then receive the next delivery
//! 3. Spawn the handler with the permit; report failures to the error sink
//! 4. On shutdown (signal, closed subscription, or a final message under
//!    [`FinalMessagePolicy::Stop`]) stop receiving, drain in-flight handlers
//!    and close the connection
//!
//! The permit is taken before dequeuing, so a locked message is never held
//! without a free handler slot for it.

use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, RpcError, TransportError};
use crate::error_sink::{FaultContext, FaultReporter, FaultStage};
use crate::handler::{RequestHandler, SessionEvent};
use crate::transport::{BusConnection, Connector, RequestReceiver};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default pause after a receive error
pub const DEFAULT_RECEIVE_BACKOFF: Duration = Duration::from_secs(2);

/// Queue names derived from a simulation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub requests: String,
    pub responses: String,
}

impl QueueNames {
    pub fn for_simulation(simulation_id: &str) -> Self {
        Self {
            requests: format!("{simulation_id}_requests"),
            responses: format!("{simulation_id}_responses"),
        }
    }
}

/// What to do after handling a message flagged as final
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalMessagePolicy {
    /// Log and keep listening
    #[default]
    Continue,
    /// Drain and return from [`ProcessorLoop::run`]
    Stop,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum concurrently running handlers (1 = strictly sequential)
    pub concurrency_limit: usize,
    pub receive_backoff: Duration,
    pub final_message_policy: FinalMessagePolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            receive_backoff: DEFAULT_RECEIVE_BACKOFF,
            final_message_policy: FinalMessagePolicy::Continue,
        }
    }
}

/// Why [`ProcessorLoop::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    FinalMessage,
    SubscriptionClosed,
}

/// Counter snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub received: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub faults: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    /// Set on the snapshot returned by [`ProcessorLoop::run`]
    pub stopped_by: Option<StopReason>,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    faults: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Counters {
    fn start_handler(self: &Arc<Self>) -> InFlight {
        self.received.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(Arc::clone(self))
    }

    fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            stopped_by: None,
        }
    }
}

/// Decrements the in-flight count even if the handler task panics
struct InFlight(Arc<Counters>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Subscription owner and dispatcher
pub struct ProcessorLoop {
    connector: Arc<dyn Connector>,
    descriptor: Arc<ConnectionDescriptor>,
    handler: Arc<RequestHandler>,
    reporter: FaultReporter,
    config: ProcessorConfig,
    counters: Arc<Counters>,
}

impl ProcessorLoop {
    pub fn new(
        connector: Arc<dyn Connector>,
        descriptor: Arc<ConnectionDescriptor>,
        handler: Arc<RequestHandler>,
        reporter: FaultReporter,
        config: ProcessorConfig,
    ) -> Result<Self> {
        if config.concurrency_limit == 0 {
            return Err(RpcError::invalid_config("concurrency_limit must be at least 1"));
        }
        Ok(Self {
            connector,
            descriptor,
            handler,
            reporter,
            config,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Live counters
    pub fn stats(&self) -> ProcessorStats {
        self.counters.snapshot()
    }

    /// Process `request_queue` until stopped; returns the final counters
    ///
    /// Any message on `shutdown` (or its sender being dropped) stops the loop.
    pub async fn run(
        &self,
        request_queue: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<ProcessorStats> {
        let namespace = self.descriptor.namespace().to_string();

        let connection = match self.connector.connect(&self.descriptor).await {
            Ok(connection) => connection,
            Err(e) => {
                self.report(&namespace, request_queue, FaultStage::Connection, e.clone().into());
                return Err(e.into());
            }
        };
        let mut receiver = match connection.open_receiver(request_queue).await {
            Ok(receiver) => receiver,
            Err(e) => {
                self.report(&namespace, request_queue, FaultStage::Connection, e.clone().into());
                close_connection(connection.as_ref()).await;
                return Err(e.into());
            }
        };

        info!(
            "Listening on {} at {} (concurrency {}, final message policy {:?})",
            request_queue,
            connection.namespace(),
            self.config.concurrency_limit,
            self.config.final_message_policy
        );

        let reason = self
            .dispatch(receiver.as_mut(), &namespace, &mut shutdown)
            .await;
        drop(receiver);

        close_connection(connection.as_ref()).await;

        let mut stats = self.stats();
        stats.stopped_by = Some(reason);
        info!(
            "Processor stopped ({:?}): received {}, acknowledged {}, failed {}, faults {}",
            reason, stats.received, stats.acknowledged, stats.failed, stats.faults
        );
        Ok(stats)
    }

    async fn dispatch(
        &self,
        receiver: &mut dyn RequestReceiver,
        namespace: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> StopReason {
        let entity_path = receiver.entity_path().to_string();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit));
        let stop_on_final = self.config.final_message_policy == FinalMessagePolicy::Stop;
        let mut events = self.handler.subscribe();
        let mut tasks = JoinSet::new();

        let reason = loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.recv() => break StopReason::Shutdown,
                Ok(SessionEvent::FinalMessage { .. }) = events.recv(), if stop_on_final => {
                    break StopReason::FinalMessage;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(joined);
                    continue;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break StopReason::Shutdown,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => break StopReason::Shutdown,
                Ok(SessionEvent::FinalMessage { .. }) = events.recv(), if stop_on_final => {
                    break StopReason::FinalMessage;
                }
                next = receiver.receive() => next,
            };

            let delivery = match next {
                None => break StopReason::SubscriptionClosed,
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    drop(permit);
                    self.receive_failed(namespace, &entity_path, e);
                    let stopped = tokio::select! {
                        _ = shutdown.recv() => true,
                        _ = tokio::time::sleep(self.config.receive_backoff) => false,
                    };
                    if stopped {
                        break StopReason::Shutdown;
                    }
                    continue;
                }
            };

            let in_flight = self.counters.start_handler();
            let handler = Arc::clone(&self.handler);
            let reporter = self.reporter.clone();
            let counters = Arc::clone(&self.counters);
            let namespace = namespace.to_string();
            let entity_path = entity_path.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let _in_flight = in_flight;
                match handler.handle(delivery).await {
                    Ok(completion) => {
                        counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                        debug!("Request {} complete", completion.message_id);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        counters.faults.fetch_add(1, Ordering::Relaxed);
                        let stage = FaultStage::for_handler_error(&e);
                        reporter.report(FaultContext::new(namespace, entity_path, stage, e));
                    }
                }
            });
        };

        if !tasks.is_empty() {
            info!("Draining {} in-flight handler(s)", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            self.reap(joined);
        }
        reason
    }

    fn reap(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!("Handler task ended abnormally: {}", e);
        }
    }

    fn receive_failed(&self, namespace: &str, entity_path: &str, error: TransportError) {
        if error.is_recoverable() {
            debug!("Recoverable receive error on {}: {}", entity_path, error);
        } else {
            warn!(
                "Receive error on {}, retrying in {:?}: {}",
                entity_path, self.config.receive_backoff, error
            );
        }
        self.report(namespace, entity_path, FaultStage::Receive, error.into());
    }

    fn report(&self, namespace: &str, entity_path: &str, stage: FaultStage, cause: RpcError) {
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        self.reporter
            .report(FaultContext::new(namespace, entity_path, stage, cause));
    }
}

async fn close_connection(connection: &dyn BusConnection) {
    if let Err(e) = connection.close().await {
        warn!("Failed to close connection to {}: {}", connection.namespace(), e);
    }
}

impl std::fmt::Debug for ProcessorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorLoop")
            .field("descriptor", &self.descriptor)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
