//! Shared harness for end-to-end responder tests
#![allow(dead_code)]

use rpc_core::test_utils::RecordingErrorSink;
use rpc_core::{
    spawn_error_sink, ErrorSink, InboundRequest, MemoryBroker, MemoryBrokerConfig,
    ProcessorConfig, ProcessorLoop, ProcessorStats, RequestHandler, ResponsePublisher,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const REQUESTS: &str = "sim_requests";
pub const RESPONSES: &str = "resp-q";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn broker() -> MemoryBroker {
    MemoryBroker::with_queues(MemoryBrokerConfig::default(), [REQUESTS, RESPONSES])
}

pub fn request(id: &str, body: &str) -> InboundRequest {
    InboundRequest::new(id, body).with_reply_to(RESPONSES)
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// A processor loop running on its own task
pub struct Harness {
    pub broker: MemoryBroker,
    pub sink: Arc<RecordingErrorSink>,
    pub handler: Arc<RequestHandler>,
    pub processor: Arc<ProcessorLoop>,
    shutdown: broadcast::Sender<()>,
    run: JoinHandle<rpc_core::Result<ProcessorStats>>,
}

impl Harness {
    pub fn start(
        broker: &MemoryBroker,
        publisher: Arc<dyn ResponsePublisher>,
        config: ProcessorConfig,
    ) -> Self {
        let sink = Arc::new(RecordingErrorSink::new());
        Self::start_with_sink(broker, publisher, sink.clone(), sink, config)
    }

    pub fn start_with_sink(
        broker: &MemoryBroker,
        publisher: Arc<dyn ResponsePublisher>,
        recording: Arc<RecordingErrorSink>,
        sink: Arc<dyn ErrorSink>,
        config: ProcessorConfig,
    ) -> Self {
        init_tracing();
        let (reporter, _sink_task) = spawn_error_sink(sink);
        let handler = Arc::new(RequestHandler::new(publisher));
        let processor = Arc::new(
            ProcessorLoop::new(
                Arc::new(broker.clone()),
                Arc::new(broker.descriptor()),
                Arc::clone(&handler),
                reporter,
                config,
            )
            .unwrap(),
        );

        let (shutdown, rx) = broadcast::channel(1);
        let runner = Arc::clone(&processor);
        let run = tokio::spawn(async move { runner.run(REQUESTS, rx).await });

        Self {
            broker: broker.clone(),
            sink: recording,
            handler,
            processor,
            shutdown,
            run,
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    /// Signal shutdown and wait for the loop to drain
    pub async fn stop(self) -> ProcessorStats {
        let _ = self.shutdown.send(());
        Self::join(self.run).await
    }

    /// Wait for the loop to stop on its own
    pub async fn finished(self) -> ProcessorStats {
        Self::join(self.run).await
    }

    async fn join(run: JoinHandle<rpc_core::Result<ProcessorStats>>) -> ProcessorStats {
        tokio::time::timeout(WAIT, run)
            .await
            .expect("processor did not stop in time")
            .expect("processor task panicked")
            .expect("processor returned an error")
    }
}
