//! End-to-end request/reply flows over the in-memory broker

mod common;

use common::{broker, request, wait_until, Harness, REQUESTS, RESPONSES, WAIT};
use rpc_core::test_utils::{
    FailingPublisher, PanickingErrorSink, RecordingErrorSink, RecordingPublisher, SlowPublisher,
};
use rpc_core::{
    BusPublisher, FaultStage, FinalMessagePolicy, InboundRequest, MemoryBroker, ProcessorConfig,
    PublisherConfig, RpcError, SenderMode, SessionEvent, StopReason, TransportError,
    DEFAULT_MAX_DELIVERY_COUNT,
};
use std::sync::Arc;
use std::time::Duration;

fn bus_publisher(broker: &MemoryBroker, mode: SenderMode) -> Arc<BusPublisher> {
    Arc::new(BusPublisher::new(
        Arc::new(broker.clone()),
        Arc::new(broker.descriptor()),
        PublisherConfig {
            mode,
            ..Default::default()
        },
    ))
}

#[tokio::test]
async fn test_request_is_answered_and_acknowledged() {
    let broker = broker();
    let harness = Harness::start(
        &broker,
        bus_publisher(&broker, SenderMode::PerCall),
        ProcessorConfig::default(),
    );

    broker
        .send_request(REQUESTS, request("m1", "hello").with_final_flag(false))
        .unwrap();
    assert!(broker.wait_for_completed(REQUESTS, 1, WAIT).await);

    let replies = broker.messages(RESPONSES);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body, "hello");
    assert_eq!(replies[0].correlation_id.as_deref(), Some("m1"));
    assert!(!replies[0].message_id.is_empty());

    let stats = harness.stop().await;
    assert_eq!(stats.received, 1);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.failed, 0);
    assert!(broker.messages(REQUESTS).is_empty());
    assert!(broker.dead_letters(REQUESTS).is_empty());
    assert_eq!(broker.completed_count(REQUESTS), 1);

    // Per-call replies leave nothing open
    assert!(broker.connection_stats().is_balanced());
    assert!(broker.sender_stats().is_balanced());
    assert_eq!(broker.unclosed_resources(), 0);
}

#[tokio::test]
async fn test_final_message_signals_and_keeps_listening() {
    let broker = broker();
    let publisher = Arc::new(RecordingPublisher::new());
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());
    let mut events = harness.handler.subscribe();

    broker
        .send_request(REQUESTS, request("m2", "bye").with_final_flag(true))
        .unwrap();
    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        SessionEvent::FinalMessage {
            message_id: "m2".to_string()
        }
    );

    // Subscription stays active after the final message
    broker.send_request(REQUESTS, request("m3", "more")).unwrap();
    assert!(broker.wait_for_completed(REQUESTS, 2, WAIT).await);

    let stats = harness.stop().await;
    assert_eq!(stats.stopped_by, Some(StopReason::Shutdown));
    assert_eq!(stats.acknowledged, 2);
    let published = publisher.published();
    assert_eq!(published[0].body, "bye");
    assert_eq!(published[0].correlation_id, "m2");
    assert_eq!(published[1].correlation_id, "m3");
}

#[tokio::test]
async fn test_reply_correlates_on_message_id_not_caller_hint() {
    let broker = broker();
    let harness = Harness::start(
        &broker,
        bus_publisher(&broker, SenderMode::PerCall),
        ProcessorConfig::default(),
    );

    broker
        .send_request(REQUESTS, request("m1", "hello").with_correlation_hint("caller-7"))
        .unwrap();
    assert!(broker.wait_for_messages(RESPONSES, 1, WAIT).await);
    harness.stop().await;

    let replies = broker.messages(RESPONSES);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].correlation_id.as_deref(), Some("m1"));
    assert_eq!(replies[0].body, "hello");
    assert_eq!(broker.completed_count(REQUESTS), 1);
}

#[tokio::test]
async fn test_stop_policy_drains_after_final_message() {
    let broker = broker();
    for (id, is_final) in [("m1", false), ("m2", true), ("m3", false)] {
        broker
            .send_request(REQUESTS, request(id, "payload").with_final_flag(is_final))
            .unwrap();
    }

    let harness = Harness::start(
        &broker,
        bus_publisher(&broker, SenderMode::PerCall),
        ProcessorConfig {
            final_message_policy: FinalMessagePolicy::Stop,
            ..Default::default()
        },
    );

    let stats = harness.finished().await;
    assert_eq!(stats.stopped_by, Some(StopReason::FinalMessage));
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(broker.completed_count(REQUESTS), 2);
    assert_eq!(broker.messages(RESPONSES).len(), 2);

    let remaining = broker.messages(REQUESTS);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message_id, "m3");
}

#[tokio::test]
async fn test_blank_reply_to_is_never_answered() {
    let broker = broker();
    let publisher = Arc::new(RecordingPublisher::new());
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());

    broker
        .send_request(REQUESTS, InboundRequest::new("m4", "hello").with_reply_to(""))
        .unwrap();

    // Redelivered until the broker parks it
    assert!(wait_until(|| broker.dead_letters(REQUESTS).len() == 1, WAIT).await);
    let stats = harness.stop().await;

    assert!(publisher.published().is_empty());
    assert_eq!(broker.completed_count(REQUESTS), 0);
    assert_eq!(stats.acknowledged, 0);
    assert_eq!(stats.failed, u64::from(DEFAULT_MAX_DELIVERY_COUNT));

    let dead = broker.dead_letters(REQUESTS);
    assert_eq!(dead[0].message_id, "m4");
    assert_eq!(dead[0].delivery_count, DEFAULT_MAX_DELIVERY_COUNT);

    assert_eq!(stats.faults, u64::from(DEFAULT_MAX_DELIVERY_COUNT));
}

#[tokio::test]
async fn test_malformed_requests_reach_error_sink() {
    let broker = broker();
    let harness = Harness::start(
        &broker,
        Arc::new(RecordingPublisher::new()),
        ProcessorConfig::default(),
    );
    let sink = Arc::clone(&harness.sink);

    broker
        .send_request(REQUESTS, InboundRequest::new("m5", "no reply"))
        .unwrap();
    assert!(sink.wait_for(1, WAIT).await);
    harness.stop().await;

    let fault = &sink.faults()[0];
    assert_eq!(fault.stage, FaultStage::ProcessMessage);
    assert_eq!(fault.entity_path, REQUESTS);
    assert_eq!(fault.namespace, broker.namespace());
    assert!(matches!(fault.cause, RpcError::MalformedRequest { ref message_id, .. } if message_id == "m5"));
}

#[tokio::test]
async fn test_publish_failure_is_redelivered_then_answered() {
    let broker = broker();
    let publisher = Arc::new(FailingPublisher::failing_first(1));
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());
    let sink = Arc::clone(&harness.sink);

    broker.send_request(REQUESTS, request("m6", "retry me")).unwrap();
    assert!(broker.wait_for_completed(REQUESTS, 1, WAIT).await);
    let stats = harness.stop().await;

    assert_eq!(publisher.attempts(), 2);
    assert_eq!(publisher.published().len(), 1);
    assert_eq!(stats.received, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.acknowledged, 1);
    assert!(sink.wait_for(1, WAIT).await);
    assert_eq!(sink.stages(), vec![FaultStage::Publish]);
}

#[tokio::test]
async fn test_persistent_publish_failure_dead_letters() {
    let broker = broker();
    let publisher = Arc::new(FailingPublisher::always());
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());

    broker.send_request(REQUESTS, request("m7", "doomed")).unwrap();
    assert!(wait_until(|| broker.dead_letters(REQUESTS).len() == 1, WAIT).await);
    let stats = harness.stop().await;

    assert_eq!(publisher.attempts(), DEFAULT_MAX_DELIVERY_COUNT);
    assert_eq!(broker.completed_count(REQUESTS), 0);
    assert_eq!(stats.acknowledged, 0);
}

#[tokio::test]
async fn test_missing_reply_queue_leaves_request_unacknowledged() {
    let broker = broker();
    let harness = Harness::start(
        &broker,
        bus_publisher(&broker, SenderMode::PerCall),
        ProcessorConfig::default(),
    );
    let sink = Arc::clone(&harness.sink);

    broker
        .send_request(
            REQUESTS,
            InboundRequest::new("m8", "hello").with_reply_to("nowhere"),
        )
        .unwrap();
    assert!(sink.wait_for(1, WAIT).await);
    harness.stop().await;

    assert_eq!(broker.completed_count(REQUESTS), 0);
    let fault = &sink.faults()[0];
    assert_eq!(fault.stage, FaultStage::Publish);
    assert!(matches!(
        fault.cause,
        RpcError::PublishFailed {
            error: TransportError::EntityNotFound(_),
            ..
        }
    ));
    assert!(broker.connection_stats().is_balanced());
    assert!(broker.sender_stats().is_balanced());
}

#[tokio::test]
async fn test_ack_failure_is_reported_and_reply_repeats() {
    let broker = broker();
    let publisher = Arc::new(RecordingPublisher::new());
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());
    let sink = Arc::clone(&harness.sink);
    broker.fail_next_completes(1);

    broker.send_request(REQUESTS, request("m9", "twice")).unwrap();
    assert!(broker.wait_for_completed(REQUESTS, 1, WAIT).await);
    harness.stop().await;

    // At-least-once: the reply went out on both deliveries
    assert_eq!(publisher.replies_to("m9"), 2);
    assert!(sink.wait_for(1, WAIT).await);
    assert_eq!(sink.stages(), vec![FaultStage::Acknowledge]);
}

#[tokio::test]
async fn test_sequential_handlers_never_overlap() {
    let broker = broker();
    let publisher = Arc::new(SlowPublisher::new(Duration::from_millis(20)));
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());

    for i in 0..5 {
        broker
            .send_request(REQUESTS, request(&format!("s{i}"), "x"))
            .unwrap();
    }
    assert!(broker.wait_for_completed(REQUESTS, 5, WAIT).await);
    let stats = harness.stop().await;

    assert_eq!(stats.peak_in_flight, 1);
    assert_eq!(publisher.max_concurrent(), 1);
    assert!(!publisher.any_overlap());

    // Order follows the queue
    let ids: Vec<_> = publisher
        .published()
        .into_iter()
        .map(|r| r.correlation_id)
        .collect();
    assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4"]);
}

#[tokio::test]
async fn test_concurrency_limit_caps_handlers() {
    let broker = broker();
    let publisher = Arc::new(SlowPublisher::new(Duration::from_millis(50)));
    let harness = Harness::start(
        &broker,
        publisher.clone(),
        ProcessorConfig {
            concurrency_limit: 3,
            ..Default::default()
        },
    );

    assert_eq!(harness.processor.config().concurrency_limit, 3);

    for i in 0..9 {
        broker
            .send_request(REQUESTS, request(&format!("c{i}"), "x"))
            .unwrap();
    }
    assert!(broker.wait_for_completed(REQUESTS, 9, WAIT).await);
    let stats = harness.stop().await;

    assert!(stats.peak_in_flight <= 3);
    assert!(publisher.max_concurrent() <= 3);
    assert!(publisher.max_concurrent() > 1);
    // Permits are taken before dequeue: never more locked than handlers
    assert_eq!(broker.locked_count(REQUESTS), 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handler() {
    let broker = broker();
    let publisher = Arc::new(SlowPublisher::new(Duration::from_millis(200)));
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());

    broker.send_request(REQUESTS, request("g1", "slow")).unwrap();
    let processor = Arc::clone(&harness.processor);
    assert!(wait_until(|| processor.stats().in_flight == 1, WAIT).await);

    let stats = harness.stop().await;
    assert_eq!(stats.stopped_by, Some(StopReason::Shutdown));
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(publisher.published().len(), 1);
    assert_eq!(broker.completed_count(REQUESTS), 1);
}

#[tokio::test]
async fn test_unprocessed_messages_survive_shutdown() {
    let broker = broker();
    let publisher = Arc::new(SlowPublisher::new(Duration::from_millis(100)));
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());

    for id in ["u1", "u2", "u3"] {
        broker.send_request(REQUESTS, request(id, "x")).unwrap();
    }
    let processor = Arc::clone(&harness.processor);
    assert!(wait_until(|| processor.stats().in_flight == 1, WAIT).await);
    harness.stop().await;

    // One handled, the rest still queued and never locked
    assert_eq!(broker.completed_count(REQUESTS), 1);
    assert_eq!(broker.messages(REQUESTS).len(), 2);
    assert_eq!(broker.locked_count(REQUESTS), 0);
}

#[tokio::test]
async fn test_panicking_error_sink_does_not_stall_processing() {
    let broker = broker();
    let publisher = Arc::new(RecordingPublisher::new());
    let harness = Harness::start_with_sink(
        &broker,
        publisher.clone(),
        Arc::new(RecordingErrorSink::new()),
        Arc::new(PanickingErrorSink),
        ProcessorConfig {
            receive_backoff: Duration::from_millis(10),
            ..Default::default()
        },
    );

    broker.inject_receive_fault(REQUESTS, TransportError::Other("boom".into()));
    broker
        .send_request(REQUESTS, InboundRequest::new("bad", "x"))
        .unwrap();
    broker.send_request(REQUESTS, request("good", "ok")).unwrap();

    assert!(broker.wait_for_completed(REQUESTS, 1, WAIT).await);
    assert!(wait_until(|| broker.dead_letters(REQUESTS).len() == 1, WAIT).await);
    let stats = harness.stop().await;

    assert_eq!(stats.acknowledged, 1);
    assert_eq!(publisher.replies_to("good"), 1);
    assert!(stats.faults > u64::from(DEFAULT_MAX_DELIVERY_COUNT));
}

#[tokio::test]
async fn test_pooled_publisher_end_to_end() {
    let broker = broker();
    let publisher = bus_publisher(&broker, SenderMode::Pooled);
    let harness = Harness::start(&broker, publisher.clone(), ProcessorConfig::default());

    for i in 0..4 {
        broker
            .send_request(REQUESTS, request(&format!("p{i}"), "pooled"))
            .unwrap();
    }
    assert!(broker.wait_for_completed(REQUESTS, 4, WAIT).await);
    harness.stop().await;

    assert_eq!(broker.messages(RESPONSES).len(), 4);
    // One connection for the receiver, one shared by every reply
    assert_eq!(broker.connection_stats().total_opened, 2);
    assert_eq!(broker.sender_stats().total_opened, 1);

    publisher.close().await;
    assert!(broker.connection_stats().is_balanced());
    assert!(broker.sender_stats().is_balanced());
    assert_eq!(broker.unclosed_resources(), 0);
}

#[tokio::test]
async fn test_burst_from_concurrent_producers_is_fully_answered() {
    let broker = broker();
    let publisher = Arc::new(RecordingPublisher::new());
    let harness = Harness::start(
        &broker,
        publisher.clone(),
        ProcessorConfig {
            concurrency_limit: 4,
            ..Default::default()
        },
    );

    let producers = (0..4).map(|p| {
        let broker = broker.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                broker
                    .send_request(REQUESTS, request(&format!("b{p}-{i}"), "burst"))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    });
    for result in futures::future::join_all(producers).await {
        result.unwrap();
    }

    assert!(broker.wait_for_completed(REQUESTS, 20, WAIT).await);
    let stats = harness.stop().await;

    let correlation_ids: std::collections::HashSet<_> = publisher
        .published()
        .into_iter()
        .map(|reply| reply.correlation_id)
        .collect();
    assert_eq!(correlation_ids.len(), 20);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["received"], 20);
    assert_eq!(json["acknowledged"], 20);
    assert_eq!(json["failed"], 0);
    assert_eq!(json["stopped_by"], "shutdown");
}
