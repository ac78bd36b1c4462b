//! # Out-of-band Fault Reporting
//!
//! Transport faults are pushed onto an unbounded channel by a cloneable
//! [`FaultReporter`] and drained by a dedicated task that calls the
//! configured [`ErrorSink`]. Reporting never blocks the processor loop and a
//! panicking sink is contained on the sink task.

use crate::error::RpcError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Pipeline stage a fault was raised from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultStage {
    Receive,
    ProcessMessage,
    Publish,
    Acknowledge,
    Connection,
}

impl FaultStage {
    /// Stage a handler failure belongs to
    pub fn for_handler_error(error: &RpcError) -> Self {
        match error {
            RpcError::PublishFailed { .. } => FaultStage::Publish,
            RpcError::TransportFault(_) => FaultStage::Acknowledge,
            _ => FaultStage::ProcessMessage,
        }
    }
}

impl fmt::Display for FaultStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultStage::Receive => "Receive",
            FaultStage::ProcessMessage => "ProcessMessage",
            FaultStage::Publish => "Publish",
            FaultStage::Acknowledge => "Acknowledge",
            FaultStage::Connection => "Connection",
        };
        f.write_str(name)
    }
}

/// Everything known about a fault at the point it was raised
#[derive(Debug, Clone)]
pub struct FaultContext {
    /// Fully qualified namespace of the bus
    pub namespace: String,
    /// Queue or topic the fault relates to
    pub entity_path: String,
    pub stage: FaultStage,
    pub cause: RpcError,
}

impl FaultContext {
    pub fn new(
        namespace: impl Into<String>,
        entity_path: impl Into<String>,
        stage: FaultStage,
        cause: RpcError,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            entity_path: entity_path.into(),
            stage,
            cause,
        }
    }
}

/// Receives faults out of band from message processing
///
/// Implementations must not take recovery actions. They run on the sink
/// task, so a slow sink delays other faults but never message handling.
pub trait ErrorSink: Send + Sync {
    fn on_error(&self, context: &FaultContext);
}

/// Default sink: one structured `error!` event per fault
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn on_error(&self, context: &FaultContext) {
        error!(
            namespace = %context.namespace,
            entity_path = %context.entity_path,
            stage = %context.stage,
            "Transport fault: {}",
            context.cause
        );
    }
}

/// Cloneable handle for raising faults
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<FaultContext>,
    reported: Arc<AtomicU64>,
}

impl FaultReporter {
    /// Queue a fault for the sink. Never fails: if the sink task is gone the
    /// fault is logged here instead.
    pub fn report(&self, context: FaultContext) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(context)) = self.tx.send(context) {
            warn!(
                "Error sink stopped, dropping {} fault on {}: {}",
                context.stage, context.entity_path, context.cause
            );
        }
    }

    /// Faults reported through this handle and its clones
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

/// Start the sink task
///
/// The task ends once every [`FaultReporter`] clone is dropped; its handle
/// yields the number of faults delivered to the sink.
pub fn spawn_error_sink(sink: Arc<dyn ErrorSink>) -> (FaultReporter, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<FaultContext>();
    let reporter = FaultReporter {
        tx,
        reported: Arc::new(AtomicU64::new(0)),
    };

    let handle = tokio::spawn(async move {
        let mut delivered = 0u64;
        while let Some(context) = rx.recv().await {
            let outcome = catch_unwind(AssertUnwindSafe(|| sink.on_error(&context)));
            if outcome.is_err() {
                error!(
                    "Error sink panicked while handling {} fault on {}",
                    context.stage, context.entity_path
                );
            }
            delivered += 1;
        }
        debug!("Error sink task finished after {} faults", delivered);
        delivered
    });

    (reporter, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::test_utils::{PanickingErrorSink, RecordingErrorSink};
    use std::time::Duration;

    fn fault(stage: FaultStage) -> FaultContext {
        FaultContext::new(
            "local",
            "sim_requests",
            stage,
            TransportError::ConnectionLost("reset".into()).into(),
        )
    }

    #[test]
    fn test_stage_for_handler_errors() {
        assert_eq!(
            FaultStage::for_handler_error(&RpcError::malformed("m1", "no reply-to")),
            FaultStage::ProcessMessage
        );
        assert_eq!(
            FaultStage::for_handler_error(&RpcError::TransportFault(TransportError::LockLost(
                "t".into()
            ))),
            FaultStage::Acknowledge
        );
    }

    #[tokio::test]
    async fn test_faults_reach_sink() {
        let sink = Arc::new(RecordingErrorSink::new());
        let (reporter, handle) = spawn_error_sink(sink.clone());

        reporter.report(fault(FaultStage::Receive));
        reporter.clone().report(fault(FaultStage::Publish));
        assert_eq!(reporter.reported(), 2);

        drop(reporter);
        assert_eq!(handle.await.unwrap(), 2);
        assert_eq!(
            sink.stages(),
            vec![FaultStage::Receive, FaultStage::Publish]
        );
        assert_eq!(sink.faults()[0].entity_path, "sim_requests");
    }

    #[tokio::test]
    async fn test_panicking_sink_is_contained() {
        let (reporter, handle) = spawn_error_sink(Arc::new(PanickingErrorSink));

        reporter.report(fault(FaultStage::Receive));
        reporter.report(fault(FaultStage::Connection));
        drop(reporter);

        let delivered = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn test_report_after_sink_stopped_does_not_fail() {
        let sink = Arc::new(RecordingErrorSink::new());
        let (reporter, handle) = spawn_error_sink(sink);
        handle.abort();
        let _ = handle.await;

        reporter.report(fault(FaultStage::Receive));
        assert_eq!(reporter.reported(), 1);
    }
}
