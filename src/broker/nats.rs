//! NATS JetStream broker implementation.
//!
//! Each channel subject gets its own stream; subscribers consume through
//! durable pull consumers with explicit acks, so delivery resumes from the
//! last acknowledged position after restarts and reconnects. Consumer
//! loops re-establish themselves with exponential backoff and jitter on
//! stream errors; the underlying client handles connection-level
//! reconnection.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    Broker, BrokerError, BrokerMessage, Disposition, MessageHandler, Result, SubscriptionHandle,
};
use crate::config::BrokerConfig;

struct ConsumerTask {
    task: JoinHandle<()>,
    stream_name: String,
    durable_name: String,
}

/// NATS JetStream broker.
pub struct NatsBroker {
    jetstream: jetstream::Context,
    tasks: RwLock<HashMap<Uuid, ConsumerTask>>,
}

impl NatsBroker {
    /// Connect to the broker, failing if it is unreachable within the
    /// configured timeout.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let connect = async_nats::connect(config.url.as_str());
        let client = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| {
                BrokerError::Connection(format!("Timed out connecting to {}", config.url))
            })?
            .map_err(|e| {
                BrokerError::Connection(format!("Failed to connect to {}: {}", config.url, e))
            })?;

        info!(url = %config.url, "Connected to NATS");

        Ok(Self {
            jetstream: jetstream::new(client),
            tasks: RwLock::new(HashMap::new()),
        })
    }

    /// Abort every consumer task without touching broker-side durable
    /// state, so a restarted dispatcher resumes where it left off.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.write().await;
        for (_, entry) in tasks.drain() {
            entry.task.abort();
            debug!(durable = %entry.durable_name, "Consumer task stopped");
        }
        info!("NATS broker shut down");
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        durable_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle> {
        let stream_name = stream_name_for(subject);

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.clone(),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| {
                BrokerError::Subscribe(format!("Failed to ensure stream {}: {}", stream_name, e))
            })?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                BrokerError::Subscribe(format!(
                    "Failed to create durable {}: {}",
                    durable_name, e
                ))
            })?;

        let handle = SubscriptionHandle::new(durable_name);
        // Take the registry lock before spawning: no await may sit between
        // the spawn and the insert, or a cancelled subscribe would strand a
        // consumer task nothing can abort.
        let mut tasks = self.tasks.write().await;
        let task = tokio::spawn(consume_loop(consumer, durable_name.to_string(), handler));
        tasks.insert(
            handle.id(),
            ConsumerTask {
                task,
                stream_name,
                durable_name: durable_name.to_string(),
            },
        );
        drop(tasks);

        info!(subject, queue_group, durable = durable_name, "Subscription opened");
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle, forget_durable: bool) -> Result<()> {
        let entry = self.tasks.write().await.remove(&handle.id());
        let Some(entry) = entry else {
            debug!(durable = handle.durable_name(), "Unsubscribe on closed handle");
            return Ok(());
        };

        entry.task.abort();

        if forget_durable {
            let stream = self
                .jetstream
                .get_stream(&entry.stream_name)
                .await
                .map_err(|e| {
                    BrokerError::Unsubscribe(format!(
                        "Failed to look up stream {}: {}",
                        entry.stream_name, e
                    ))
                })?;
            stream
                .delete_consumer(&entry.durable_name)
                .await
                .map_err(|e| {
                    BrokerError::Unsubscribe(format!(
                        "Failed to delete durable {}: {}",
                        entry.durable_name, e
                    ))
                })?;
        }

        info!(durable = %entry.durable_name, forget_durable, "Subscription closed");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish to {}: {}", subject, e)))?;

        ack.await.map_err(|e| {
            BrokerError::Publish(format!("Publish to {} unconfirmed: {}", subject, e))
        })?;

        debug!(subject, "Published message");
        Ok(())
    }
}

/// Stream name backing a subject. Stream names cannot contain dots or
/// wildcard tokens.
fn stream_name_for(subject: &str) -> String {
    subject.replace(['.', '*', '>'], "-")
}

/// Consumer loop with automatic re-establishment and exponential backoff
/// with jitter.
async fn consume_loop(
    consumer: jetstream::consumer::Consumer<pull::Config>,
    durable_name: String,
    handler: Arc<dyn MessageHandler>,
) {
    let backoff_builder = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter();

    let mut backoff = backoff_builder.build();

    loop {
        match consumer.messages().await {
            Ok(mut messages) => {
                info!(durable = %durable_name, "Consumer attached, processing messages");
                // Reset backoff on successful attach.
                backoff = backoff_builder.build();

                while let Some(message) = messages.next().await {
                    match message {
                        Ok(message) => process_message(message, &handler).await,
                        Err(e) => {
                            error!(durable = %durable_name, error = %e, "Consumer delivery error, re-attaching");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!(durable = %durable_name, error = %e, "Failed to attach consumer, retrying after backoff");
            }
        }

        let delay = backoff.next().unwrap_or(Duration::from_secs(30));
        tokio::time::sleep(delay).await;
    }
}

/// Run one message through the handler and ack per its disposition.
async fn process_message(message: jetstream::Message, handler: &Arc<dyn MessageHandler>) {
    let correlation_id = message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(async_nats::header::NATS_MESSAGE_ID))
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let broker_message = BrokerMessage {
        subject: message.subject.to_string(),
        payload: message.payload.clone(),
        correlation_id,
    };

    match handler.handle(broker_message).await {
        Disposition::Ack => {
            if let Err(e) = message.ack().await {
                error!(error = %e, "Failed to ack message");
            }
        }
        Disposition::Redeliver => {
            if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
                error!(error = %e, "Failed to nak message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_strips_wildcard_tokens() {
        let subject = crate::channel::ChannelRef::new("default", "orders").subject("natschan");
        assert_eq!(stream_name_for(&subject), "natschan-default-orders");
        assert_eq!(stream_name_for("foo.*.>"), "foo----");
    }
}

/// Integration tests requiring a running NATS server with JetStream.
///
/// Run with: NATS_URL=nats://localhost:4222 cargo test --features nats nats_integration -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn nats_url() -> String {
        std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    struct CountingHandler {
        count: Arc<AtomicUsize>,
        tx: mpsc::Sender<BrokerMessage>,
    }

    impl MessageHandler for CountingHandler {
        fn handle(&self, message: BrokerMessage) -> BoxFuture<'static, Disposition> {
            let count = self.count.clone();
            let tx = self.tx.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(message).await;
                Disposition::Ack
            })
        }
    }

    #[tokio::test]
    #[ignore = "Requires NATS with JetStream"]
    async fn test_publish_and_consume() {
        init_logging();
        let config = BrokerConfig {
            url: nats_url(),
            ..Default::default()
        };
        let broker = NatsBroker::connect(config)
            .await
            .expect("Failed to connect");

        let subject = format!("natschan.it.{}", Uuid::new_v4().simple());
        let durable = format!("it-{}", Uuid::new_v4().simple());

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(10);
        let handle = broker
            .subscribe(
                &subject,
                &durable,
                &durable,
                Arc::new(CountingHandler {
                    count: count.clone(),
                    tx,
                }),
            )
            .await
            .expect("Failed to subscribe");

        broker
            .publish(&subject, Bytes::from_static(b"hello"))
            .await
            .expect("Failed to publish");

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed");

        assert_eq!(received.payload, Bytes::from_static(b"hello"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        broker.unsubscribe(&handle, true).await.unwrap();
    }
}
