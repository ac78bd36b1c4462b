//! Test doubles for publishers, resolvers and error sinks

use crate::descriptor::ConnectionDescriptor;
use crate::error::{PublishContext, Result, RpcError, TransportError};
use crate::error_sink::{ErrorSink, FaultContext, FaultStage};
use crate::message::{OutboundResponse, SendReceipt};
use crate::publisher::ResponsePublisher;
use crate::resolver::ConnectionResolver;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publisher that keeps every reply in memory
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<OutboundResponse>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies published so far, in order
    pub fn published(&self) -> Vec<OutboundResponse> {
        lock(&self.published).clone()
    }

    /// Replies carrying the given correlation id
    pub fn replies_to(&self, correlation_id: &str) -> usize {
        lock(&self.published)
            .iter()
            .filter(|r| r.correlation_id == correlation_id)
            .count()
    }

    fn record(&self, destination: &str, body: &str, correlation_id: &str) -> SendReceipt {
        lock(&self.published).push(OutboundResponse::new(destination, body, correlation_id));
        SendReceipt {
            message_id: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl ResponsePublisher for RecordingPublisher {
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        correlation_id: &str,
    ) -> Result<SendReceipt> {
        Ok(self.record(destination, body, correlation_id))
    }
}

/// Publisher that fails a set number of times, then records like
/// [`RecordingPublisher`]
#[derive(Debug)]
pub struct FailingPublisher {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
    inner: RecordingPublisher,
}

impl FailingPublisher {
    /// Fail every publish
    pub fn always() -> Self {
        Self::failing_first(u32::MAX)
    }

    /// Fail the first `count` publishes
    pub fn failing_first(count: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(count),
            attempts: AtomicU32::new(0),
            inner: RecordingPublisher::new(),
        }
    }

    /// Publish calls, successful or not
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<OutboundResponse> {
        self.inner.published()
    }
}

#[async_trait]
impl ResponsePublisher for FailingPublisher {
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        correlation_id: &str,
    ) -> Result<SendReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RpcError::publish_failed(
                TransportError::ConnectionLost("simulated publish failure".to_string()),
                PublishContext::new(destination, correlation_id, body.len()),
            ));
        }
        Ok(self.inner.record(destination, body, correlation_id))
    }
}

/// Publisher that takes a fixed time per call and tracks overlap
#[derive(Debug)]
pub struct SlowPublisher {
    delay: Duration,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    spans: Mutex<Vec<(Instant, Instant)>>,
    inner: RecordingPublisher,
}

impl SlowPublisher {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            spans: Mutex::new(Vec::new()),
            inner: RecordingPublisher::new(),
        }
    }

    /// Highest number of publishes that were in progress at once
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Whether any two publish calls overlapped in time
    pub fn any_overlap(&self) -> bool {
        let mut spans = lock(&self.spans).clone();
        spans.sort_by_key(|(start, _)| *start);
        spans.windows(2).any(|pair| pair[1].0 < pair[0].1)
    }

    pub fn published(&self) -> Vec<OutboundResponse> {
        self.inner.published()
    }
}

#[async_trait]
impl ResponsePublisher for SlowPublisher {
    async fn publish(
        &self,
        destination: &str,
        body: &str,
        correlation_id: &str,
    ) -> Result<SendReceipt> {
        let start = Instant::now();
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        let receipt = self.inner.record(destination, body, correlation_id);

        self.current.fetch_sub(1, Ordering::SeqCst);
        lock(&self.spans).push((start, Instant::now()));
        Ok(receipt)
    }
}

/// Resolver that counts lookups
#[derive(Debug)]
pub struct CountingResolver {
    descriptor: ConnectionDescriptor,
    delay: Option<Duration>,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl CountingResolver {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            descriptor,
            delay: None,
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `count` lookups with `SecretUnavailable`
    pub fn failing_first(self, count: u32) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionResolver for CountingResolver {
    async fn resolve(&self, vault_name: &str) -> Result<ConnectionDescriptor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RpcError::secret_unavailable(vault_name, "simulated outage"));
        }
        Ok(self.descriptor.clone())
    }
}

/// Error sink that keeps every fault
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    faults: Mutex<Vec<FaultContext>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Vec<FaultContext> {
        lock(&self.faults).clone()
    }

    pub fn stages(&self) -> Vec<FaultStage> {
        lock(&self.faults).iter().map(|f| f.stage).collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.faults).len()
    }

    /// Wait until at least `count` faults arrived
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count() >= count
    }
}

impl ErrorSink for RecordingErrorSink {
    fn on_error(&self, context: &FaultContext) {
        lock(&self.faults).push(context.clone());
    }
}

/// Error sink that panics on every fault
#[derive(Debug, Default, Clone, Copy)]
pub struct PanickingErrorSink;

impl ErrorSink for PanickingErrorSink {
    fn on_error(&self, context: &FaultContext) {
        panic!("sink failure on {}", context.stage);
    }
}
