use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::time::Instant;

use super::*;
use crate::broker::MemoryBroker;
use crate::channel::DeliveryOptions;

#[derive(Clone)]
struct RecordedCall {
    url: String,
    headers: Vec<(String, String)>,
    payload: Bytes,
    at: Instant,
}

/// Transport that replays a scripted sequence of responses and records
/// every call with its (tokio) timestamp.
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, DeliveryError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<TransportResponse, DeliveryError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn post(
        &self,
        url: &str,
        payload: Bytes,
        headers: &[(&str, String)],
        _timeout: Duration,
    ) -> Result<TransportResponse, DeliveryError> {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            payload,
            at: Instant::now(),
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok(200))
    }
}

fn ok(status: u16) -> Result<TransportResponse, DeliveryError> {
    Ok(TransportResponse {
        status,
        body: Bytes::new(),
    })
}

fn ok_with_body(body: &'static [u8]) -> Result<TransportResponse, DeliveryError> {
    Ok(TransportResponse {
        status: 200,
        body: Bytes::from_static(body),
    })
}

fn retryable(status: u16) -> Result<TransportResponse, DeliveryError> {
    Err(DeliveryError::Retryable {
        status: Some(status),
        reason: format!("HTTP {}", status),
    })
}

fn permanent(status: u16) -> Result<TransportResponse, DeliveryError> {
    Err(DeliveryError::Permanent {
        status: Some(status),
        reason: format!("HTTP {}", status),
    })
}

fn message() -> BrokerMessage {
    BrokerMessage {
        subject: "natschan.default.orders".to_string(),
        payload: Bytes::from_static(b"event-payload"),
        correlation_id: "corr-1".to_string(),
    }
}

fn forwarder(transport: Arc<ScriptedTransport>, broker: Arc<MemoryBroker>) -> Forwarder {
    Forwarder::new(transport, broker, Duration::from_secs(30))
}

#[tokio::test]
async fn test_delivered_without_reply() {
    let transport = ScriptedTransport::new(vec![ok(200)]);
    let fwd = forwarder(transport.clone(), Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com");

    let outcome = fwd.deliver(&message(), &spec).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Delivered {
            reply: ReplyOutcome::None
        }
    );
    assert!(outcome.should_ack());
    assert!(outcome.failure_reason().is_none());

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "http://sink.example.com");
    assert_eq!(calls[0].payload, Bytes::from_static(b"event-payload"));
    assert!(calls[0]
        .headers
        .contains(&(CORRELATION_HEADER.to_string(), "corr-1".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_retried_then_delivered() {
    let transport = ScriptedTransport::new(vec![retryable(503), ok(200)]);
    let fwd = forwarder(transport.clone(), Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com");

    let outcome = fwd.deliver(&message(), &spec).await;

    assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    // Default options: 200ms base delay before the first retry.
    assert_eq!(calls[1].at - calls[0].at, Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_strictly_increase() {
    let transport = ScriptedTransport::new(vec![
        retryable(503),
        retryable(503),
        retryable(503),
        retryable(503),
    ]);
    let fwd = forwarder(transport.clone(), Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com");

    let outcome = fwd.deliver(&message(), &spec).await;

    // retries = 3 by default: one initial attempt plus three retries.
    assert_eq!(
        outcome,
        DispatchOutcome::Failed {
            attempts: 4,
            reason: "Retryable delivery failure: HTTP 503".to_string()
        }
    );
    assert!(!outcome.should_ack());

    let calls = transport.calls();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_capped() {
    let transport = ScriptedTransport::new(vec![
        retryable(503),
        retryable(503),
        retryable(503),
        retryable(503),
    ]);
    let fwd = Forwarder::new(
        transport.clone(),
        Arc::new(MemoryBroker::new()),
        Duration::from_millis(300),
    );
    let spec = SubscriberSpec::new("http://sink.example.com");

    fwd.deliver(&message(), &spec).await;

    let calls = transport.calls();
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(200),
            Duration::from_millis(300),
            Duration::from_millis(300),
        ]
    );
}

#[tokio::test]
async fn test_permanent_failure_short_circuits() {
    let transport = ScriptedTransport::new(vec![permanent(400)]);
    let fwd = forwarder(transport.clone(), Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com");

    let outcome = fwd.deliver(&message(), &spec).await;

    assert!(matches!(
        outcome,
        DispatchOutcome::Failed { attempts: 1, .. }
    ));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_route_to_http_dead_letter() {
    let transport = ScriptedTransport::new(vec![retryable(503), retryable(503), ok(202)]);
    let fwd = forwarder(transport.clone(), Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com")
        .with_dead_letter(ForwardTarget::Http("http://dlq.example.com".to_string()))
        .with_options(DeliveryOptions {
            retries: 1,
            ..Default::default()
        });

    let outcome = fwd.deliver(&message(), &spec).await;

    assert!(matches!(
        outcome,
        DispatchOutcome::DeadLettered { attempts: 2, .. }
    ));
    assert!(outcome.should_ack());

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].url, "http://dlq.example.com");
    assert_eq!(calls[2].payload, Bytes::from_static(b"event-payload"));
    assert!(calls[2]
        .headers
        .contains(&(ATTEMPTS_HEADER.to_string(), "2".to_string())));
    assert!(calls[2]
        .headers
        .iter()
        .any(|(k, v)| k == ERROR_HEADER && v.contains("503")));
}

#[tokio::test]
async fn test_dead_letter_subject_publishes_through_broker() {
    let transport = ScriptedTransport::new(vec![permanent(404)]);
    let broker = Arc::new(MemoryBroker::new());
    let fwd = forwarder(transport, broker.clone());
    let spec = SubscriberSpec::new("http://sink.example.com")
        .with_dead_letter(ForwardTarget::Subject("natschan.dlq.orders".to_string()));

    let outcome = fwd.deliver(&message(), &spec).await;

    assert!(matches!(outcome, DispatchOutcome::DeadLettered { .. }));
    assert_eq!(
        broker.published_to("natschan.dlq.orders").await,
        vec![Bytes::from_static(b"event-payload")]
    );
}

#[tokio::test]
async fn test_dead_letter_failure_leaves_message_unacked() {
    let transport = ScriptedTransport::new(vec![permanent(400), retryable(500)]);
    let fwd = forwarder(transport.clone(), Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com")
        .with_dead_letter(ForwardTarget::Http("http://dlq.example.com".to_string()));

    let outcome = fwd.deliver(&message(), &spec).await;

    match outcome {
        DispatchOutcome::Failed { reason, .. } => {
            assert!(reason.contains("dead letter failed"), "reason: {}", reason)
        }
        other => panic!("Expected Failed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reply_body_forwarded_to_http_target() {
    let transport = ScriptedTransport::new(vec![ok_with_body(b"response-body"), ok(202)]);
    let fwd = forwarder(transport.clone(), Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com")
        .with_reply(ForwardTarget::Http("http://reply.example.com".to_string()));

    let outcome = fwd.deliver(&message(), &spec).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Delivered {
            reply: ReplyOutcome::Forwarded
        }
    );

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].url, "http://reply.example.com");
    assert_eq!(calls[1].payload, Bytes::from_static(b"response-body"));
}

#[tokio::test]
async fn test_reply_body_published_to_subject_target() {
    let transport = ScriptedTransport::new(vec![ok_with_body(b"response-body")]);
    let broker = Arc::new(MemoryBroker::new());
    let fwd = forwarder(transport, broker.clone());
    let spec = SubscriberSpec::new("http://sink.example.com")
        .with_reply(ForwardTarget::Subject("natschan.default.replies".to_string()));

    fwd.deliver(&message(), &spec).await;

    assert_eq!(
        broker.published_to("natschan.default.replies").await,
        vec![Bytes::from_static(b"response-body")]
    );
}

#[tokio::test]
async fn test_empty_reply_body_not_forwarded() {
    let transport = ScriptedTransport::new(vec![ok(200)]);
    let fwd = forwarder(transport.clone(), Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com")
        .with_reply(ForwardTarget::Http("http://reply.example.com".to_string()));

    let outcome = fwd.deliver(&message(), &spec).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Delivered {
            reply: ReplyOutcome::None
        }
    );
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn test_reply_failure_does_not_block_ack() {
    let transport = ScriptedTransport::new(vec![ok_with_body(b"response-body"), retryable(500)]);
    let fwd = forwarder(transport, Arc::new(MemoryBroker::new()));
    let spec = SubscriberSpec::new("http://sink.example.com")
        .with_reply(ForwardTarget::Http("http://reply.example.com".to_string()));

    let outcome = fwd.deliver(&message(), &spec).await;

    match &outcome {
        DispatchOutcome::Delivered {
            reply: ReplyOutcome::Failed(_),
        } => {}
        other => panic!("Expected Delivered with failed reply, got {:?}", other),
    }
    assert!(outcome.should_ack());
}
