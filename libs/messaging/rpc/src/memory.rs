//! # In-Memory Broker
//!
//! Process-local implementation of the transport traits with Service Bus
//! queue semantics:
//!
//! - **Peek-lock**: a received message is locked until completed. Dropping
//!   the [`Delivery`] without completing puts it back at the head of the
//!   queue with its delivery count incremented.
//! - **Dead-lettering**: a message released after `max_delivery_count`
//!   deliveries moves to the queue's dead-letter list instead.
//! - **Transport-assigned ids**: messages sent without an id get a UUID.
//! - **Fault injection**: failed connects, sends, completes and receives can
//!   be scheduled to exercise error paths.
//!
//! Used by the test suite and by the responder binary for `memory://`
//! descriptors.

use crate::connection::{ResourceGuard, ResourceStats, ResourceTracker};
use crate::descriptor::ConnectionDescriptor;
use crate::error::TransportError;
use crate::message::{InboundRequest, OutboundResponse, SendReceipt, DEFAULT_MAX_MESSAGE_SIZE};
use crate::transport::{
    BusConnection, Connector, Delivery, ReplySender, RequestReceiver, Settlement,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default number of deliveries before a message is dead-lettered
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Configuration for an in-memory broker
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Namespace descriptors must name to connect
    pub namespace: String,
    /// Deliveries before a released message is dead-lettered
    pub max_delivery_count: u32,
    /// Largest payload a queue accepts
    pub max_message_size: usize,
    /// Create queues on first use instead of failing with `EntityNotFound`
    pub auto_create_queues: bool,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            namespace: "local".to_string(),
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            auto_create_queues: false,
        }
    }
}

/// A message as stored on a queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokeredMessage {
    pub message_id: String,
    pub body: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub application_properties: HashMap<String, String>,
    pub delivery_count: u32,
}

impl From<InboundRequest> for BrokeredMessage {
    fn from(request: InboundRequest) -> Self {
        Self {
            message_id: request.id,
            body: request.body,
            correlation_id: request.correlation_hint,
            reply_to: request.reply_to,
            application_properties: request.application_properties,
            delivery_count: 0,
        }
    }
}

impl From<&OutboundResponse> for BrokeredMessage {
    fn from(response: &OutboundResponse) -> Self {
        Self {
            message_id: String::new(),
            body: response.body.clone(),
            correlation_id: Some(response.correlation_id.clone()),
            reply_to: None,
            application_properties: HashMap::new(),
            delivery_count: 0,
        }
    }
}

impl BrokeredMessage {
    fn to_request(&self) -> InboundRequest {
        InboundRequest {
            id: self.message_id.clone(),
            body: self.body.clone(),
            reply_to: self.reply_to.clone(),
            correlation_hint: self.correlation_id.clone(),
            application_properties: self.application_properties.clone(),
            delivery_count: self.delivery_count,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    ready: VecDeque<BrokeredMessage>,
    locked: HashMap<String, BrokeredMessage>,
    dead_letters: Vec<BrokeredMessage>,
    receive_faults: VecDeque<TransportError>,
    completed: u64,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            locked: HashMap::new(),
            dead_letters: Vec::new(),
            receive_faults: VecDeque::new(),
            completed: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    connect_failures: u32,
    send_failures: HashMap<String, VecDeque<TransportError>>,
    complete_failures: u32,
}

#[derive(Debug)]
struct BrokerInner {
    config: MemoryBrokerConfig,
    queues: Mutex<HashMap<String, QueueState>>,
    faults: Mutex<FaultPlan>,
    connections: ResourceTracker,
    senders: ResourceTracker,
    unclosed: AtomicU64,
}

impl BrokerInner {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        // A poisoned lock only means a test panicked mid-operation; the
        // queue data itself is still consistent.
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, queue: &str, mut message: BrokeredMessage) -> Result<String, TransportError> {
        if message.body.len() > self.config.max_message_size {
            return Err(TransportError::message_too_large(
                message.body.len(),
                self.config.max_message_size,
            ));
        }
        if message.message_id.is_empty() {
            message.message_id = Uuid::new_v4().to_string();
        }
        message.delivery_count = 0;
        let message_id = message.message_id.clone();

        let mut queues = self.queues();
        if !queues.contains_key(queue) {
            if !self.config.auto_create_queues {
                return Err(TransportError::entity_not_found(queue));
            }
            queues.insert(queue.to_string(), QueueState::new());
        }
        if let Some(state) = queues.get_mut(queue) {
            state.ready.push_back(message);
            state.notify.notify_one();
        }
        trace!("Enqueued message {} on {}", message_id, queue);
        Ok(message_id)
    }

    fn release(&self, queue: &str, lock_token: &str) {
        let mut queues = self.queues();
        let Some(state) = queues.get_mut(queue) else {
            return;
        };
        let Some(message) = state.locked.remove(lock_token) else {
            return;
        };
        if message.delivery_count >= self.config.max_delivery_count {
            warn!(
                "Message {} on {} dead-lettered after {} deliveries",
                message.message_id, queue, message.delivery_count
            );
            state.dead_letters.push(message);
        } else {
            debug!(
                "Lock released for message {} on {}, available for redelivery",
                message.message_id, queue
            );
            state.ready.push_front(message);
            state.notify.notify_one();
        }
    }
}

/// In-process message broker
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                queues: Mutex::new(HashMap::new()),
                faults: Mutex::new(FaultPlan::default()),
                connections: ResourceTracker::new("connection"),
                senders: ResourceTracker::new("sender"),
                unclosed: AtomicU64::new(0),
            }),
        }
    }

    /// Broker with the given queues already provisioned
    pub fn with_queues<I, S>(config: MemoryBrokerConfig, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let broker = Self::new(config);
        for queue in queues {
            broker.create_queue(queue.as_ref());
        }
        broker
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    /// Descriptor that connects to this broker
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::memory(self.namespace())
    }

    /// Provision a queue; no-op if it exists
    pub fn create_queue(&self, name: &str) {
        self.inner
            .queues()
            .entry(name.to_string())
            .or_insert_with(QueueState::new);
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.queues().contains_key(name)
    }

    /// Send a request the way a remote caller would
    pub fn send_request(
        &self,
        queue: &str,
        request: impl Into<BrokeredMessage>,
    ) -> Result<String, TransportError> {
        self.inner.enqueue(queue, request.into())
    }

    /// Messages waiting on a queue, oldest first
    pub fn messages(&self, queue: &str) -> Vec<BrokeredMessage> {
        self.inner
            .queues()
            .get(queue)
            .map(|state| state.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<BrokeredMessage> {
        self.inner
            .queues()
            .get(queue)
            .map(|state| state.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Messages completed (acknowledged) on a queue
    pub fn completed_count(&self, queue: &str) -> u64 {
        self.inner
            .queues()
            .get(queue)
            .map(|state| state.completed)
            .unwrap_or(0)
    }

    /// Messages currently locked by a receiver
    pub fn locked_count(&self, queue: &str) -> usize {
        self.inner
            .queues()
            .get(queue)
            .map(|state| state.locked.len())
            .unwrap_or(0)
    }

    /// Poll until a queue holds at least `count` messages
    pub async fn wait_for_messages(&self, queue: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.messages(queue).len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until `count` messages have been completed on a queue
    pub async fn wait_for_completed(&self, queue: &str, count: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.completed_count(queue) >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn connection_stats(&self) -> ResourceStats {
        self.inner.connections.stats()
    }

    pub fn sender_stats(&self) -> ResourceStats {
        self.inner.senders.stats()
    }

    /// Connections or senders dropped without being closed
    pub fn unclosed_resources(&self) -> u64 {
        self.inner.unclosed.load(Ordering::SeqCst)
    }

    /// Fail the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.faults().connect_failures += count;
    }

    /// Fail the next send to `destination` with `error`
    pub fn fail_next_send(&self, destination: &str, error: TransportError) {
        self.inner
            .faults()
            .send_failures
            .entry(destination.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail the next `count` completions; the affected messages are released
    /// for redelivery
    pub fn fail_next_completes(&self, count: u32) {
        self.inner.faults().complete_failures += count;
    }

    /// Make the next receive on `queue` return `error`
    pub fn inject_receive_fault(&self, queue: &str, error: TransportError) {
        let mut queues = self.inner.queues();
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new);
        state.receive_faults.push_back(error);
        state.notify.notify_one();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn BusConnection>, TransportError> {
        if descriptor.scheme() != "memory" || descriptor.namespace() != self.namespace() {
            return Err(TransportError::connection_failed(format!(
                "memory broker '{}' cannot serve {}",
                self.namespace(),
                descriptor
            )));
        }
        {
            let mut faults = self.inner.faults();
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(TransportError::connection_failed("simulated connect failure"));
            }
        }

        let guard = self.inner.connections.acquire();
        debug!("Memory connection opened to {}", descriptor);
        Ok(Arc::new(MemoryConnection {
            broker: Arc::clone(&self.inner),
            closed: Arc::new(AtomicBool::new(false)),
            guard: Mutex::new(Some(guard)),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    closed: Arc<AtomicBool>,
    guard: Mutex<Option<ResourceGuard>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let guard = self.guard.get_mut().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            self.broker.unclosed.fetch_add(1, Ordering::SeqCst);
            warn!("Memory connection dropped without close");
        }
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    fn namespace(&self) -> &str {
        &self.broker.config.namespace
    }

    async fn open_receiver(&self, queue: &str) -> Result<Box<dyn RequestReceiver>, TransportError> {
        self.ensure_open()?;
        let notify = {
            let mut queues = self.broker.queues();
            if !queues.contains_key(queue) {
                if !self.broker.config.auto_create_queues {
                    return Err(TransportError::entity_not_found(queue));
                }
                queues.insert(queue.to_string(), QueueState::new());
            }
            queues
                .get(queue)
                .map(|state| Arc::clone(&state.notify))
                .ok_or_else(|| TransportError::entity_not_found(queue))?
        };
        Ok(Box::new(MemoryReceiver {
            broker: Arc::clone(&self.broker),
            queue: queue.to_string(),
            notify,
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn open_sender(&self, destination: &str) -> Result<Box<dyn ReplySender>, TransportError> {
        self.ensure_open()?;
        let guard = self.broker.senders.acquire();
        Ok(Box::new(MemorySender {
            broker: Arc::clone(&self.broker),
            destination: destination.to_string(),
            closed: Arc::clone(&self.closed),
            guard: Mutex::new(Some(guard)),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let guard = self
            .guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(guard);
        // Wake parked receivers so they observe the close
        for state in self.broker.queues().values() {
            state.notify.notify_waiters();
        }
        Ok(())
    }
}

struct MemoryReceiver {
    broker: Arc<BrokerInner>,
    queue: String,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl MemoryReceiver {
    fn try_take(&self) -> Option<Result<Delivery, TransportError>> {
        let mut queues = self.broker.queues();
        let state = queues.get_mut(&self.queue)?;

        if let Some(fault) = state.receive_faults.pop_front() {
            return Some(Err(fault));
        }

        let mut message = state.ready.pop_front()?;
        message.delivery_count += 1;
        let lock_token = Uuid::new_v4().to_string();
        let request = message.to_request();
        state.locked.insert(lock_token.clone(), message);

        Some(Ok(Delivery::new(
            request,
            Box::new(MemorySettlement {
                broker: Arc::clone(&self.broker),
                queue: self.queue.clone(),
                lock_token,
                settled: false,
            }),
        )))
    }
}

#[async_trait]
impl RequestReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Option<Result<Delivery, TransportError>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a close or enqueue between
            // the check and the await is not missed
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(result) = self.try_take() {
                return Some(result);
            }
            notified.await;
        }
    }

    fn entity_path(&self) -> &str {
        &self.queue
    }
}

struct MemorySettlement {
    broker: Arc<BrokerInner>,
    queue: String,
    lock_token: String,
    settled: bool,
}

#[async_trait]
impl Settlement for MemorySettlement {
    async fn complete(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;
        {
            let mut faults = this.broker.faults();
            if faults.complete_failures > 0 {
                faults.complete_failures -= 1;
                return Err(TransportError::LockLost(this.lock_token.clone()));
            }
        }

        let mut queues = this.broker.queues();
        let state = queues
            .get_mut(&this.queue)
            .ok_or_else(|| TransportError::entity_not_found(this.queue.clone()))?;
        match state.locked.remove(&this.lock_token) {
            Some(message) => {
                state.completed += 1;
                drop(queues);
                this.settled = true;
                trace!("Completed message {} on {}", message.message_id, this.queue);
                Ok(())
            }
            None => Err(TransportError::LockLost(this.lock_token.clone())),
        }
    }
}

impl Drop for MemorySettlement {
    fn drop(&mut self) {
        if !self.settled {
            self.broker.release(&self.queue, &self.lock_token);
        }
    }
}

struct MemorySender {
    broker: Arc<BrokerInner>,
    destination: String,
    closed: Arc<AtomicBool>,
    guard: Mutex<Option<ResourceGuard>>,
}

impl Drop for MemorySender {
    fn drop(&mut self) {
        let guard = self.guard.get_mut().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            self.broker.unclosed.fetch_add(1, Ordering::SeqCst);
            warn!("Memory sender for {} dropped without close", self.destination);
        }
    }
}

#[async_trait]
impl ReplySender for MemorySender {
    async fn send(&self, response: &OutboundResponse) -> Result<SendReceipt, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost("connection closed".to_string()));
        }
        if self
            .guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
        {
            return Err(TransportError::Closed);
        }
        let injected = self
            .broker
            .faults()
            .send_failures
            .get_mut(&self.destination)
            .and_then(VecDeque::pop_front);
        if let Some(error) = injected {
            return Err(error);
        }

        let message_id = self.broker.enqueue(&self.destination, response.into())?;
        Ok(SendReceipt { message_id })
    }

    async fn close(&self) -> Result<(), TransportError> {
        let guard = self
            .guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(guard);
        Ok(())
    }

    fn destination(&self) -> &str {
        &self.destination
    }
}
