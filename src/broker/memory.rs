//! In-memory broker for standalone mode and tests.
//!
//! Delivers inline on the publisher's task, which keeps tests
//! deterministic. Handlers returning [`Disposition::Redeliver`] are
//! retried immediately up to a redelivery cap, mirroring broker
//! redelivery without real timers. Failure injection hooks simulate a
//! broker that rejects subscriptions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Broker, BrokerError, BrokerMessage, Disposition, MessageHandler, Result, SubscriptionHandle,
};

/// Redeliveries attempted per message before giving up.
const DEFAULT_REDELIVERY_CAP: usize = 5;

struct ActiveSub {
    subject: String,
    queue_group: String,
    durable_name: String,
    handler: Arc<dyn MessageHandler>,
}

/// Subscribe-failure injection: any subscribe whose durable name contains
/// `needle` fails with `error`.
struct FailSubscribe {
    needle: String,
    error: BrokerError,
}

/// In-memory broker implementation.
pub struct MemoryBroker {
    subs: RwLock<HashMap<Uuid, ActiveSub>>,
    published: RwLock<Vec<(String, Bytes)>>,
    forgotten_durables: RwLock<Vec<String>>,
    fail_subscribe: RwLock<Option<FailSubscribe>>,
    subscribe_delay: RwLock<Option<std::time::Duration>>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    acked: AtomicUsize,
    redelivered: AtomicUsize,
    redelivery_cap: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
            published: RwLock::new(Vec::new()),
            forgotten_durables: RwLock::new(Vec::new()),
            fail_subscribe: RwLock::new(None),
            subscribe_delay: RwLock::new(None),
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
            redelivered: AtomicUsize::new(0),
            redelivery_cap: DEFAULT_REDELIVERY_CAP,
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject subscribe failures: any subscribe whose durable name contains
    /// `needle` fails with `error`. An empty needle matches everything.
    pub async fn fail_subscribes_matching(&self, needle: impl Into<String>, error: BrokerError) {
        *self.fail_subscribe.write().await = Some(FailSubscribe {
            needle: needle.into(),
            error,
        });
    }

    pub async fn clear_fail_subscribe(&self) {
        *self.fail_subscribe.write().await = None;
    }

    /// Delay every subscribe call, for exercising reconcile deadlines.
    pub async fn set_subscribe_delay(&self, delay: Option<std::time::Duration>) {
        *self.subscribe_delay.write().await = delay;
    }

    pub async fn subscription_count(&self) -> usize {
        self.subs.read().await.len()
    }

    /// Durable names of currently live subscriptions, sorted.
    pub async fn live_durables(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .subs
            .read()
            .await
            .values()
            .map(|s| s.durable_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Everything published through this broker, in order.
    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.published.read().await.clone()
    }

    pub async fn published_to(&self, subject: &str) -> Vec<Bytes> {
        self.published
            .read()
            .await
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Durables deleted via `unsubscribe(.., forget_durable: true)`.
    pub async fn forgotten_durables(&self) -> Vec<String> {
        self.forgotten_durables.read().await.clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn redelivered(&self) -> usize {
        self.redelivered.load(Ordering::SeqCst)
    }

    /// Deliver to every matching subscription, one per queue group, driving
    /// each to a terminal disposition.
    async fn deliver(&self, subject: &str, payload: &Bytes) {
        // Snapshot matching handlers so delivery runs off the map lock.
        let targets: Vec<(String, Arc<dyn MessageHandler>)> = {
            let subs = self.subs.read().await;
            // One delivery per queue group; pick deterministically by durable name.
            let mut by_group: BTreeMap<String, (&String, &ActiveSub)> = BTreeMap::new();
            for sub in subs.values().filter(|s| s.subject == subject) {
                let entry = by_group
                    .entry(sub.queue_group.clone())
                    .or_insert((&sub.durable_name, sub));
                if sub.durable_name < *entry.0 {
                    *entry = (&sub.durable_name, sub);
                }
            }
            by_group
                .into_values()
                .map(|(durable, sub)| (durable.clone(), sub.handler.clone()))
                .collect()
        };

        for (durable, handler) in targets {
            let mut redeliveries = 0;
            loop {
                let message = BrokerMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    correlation_id: Uuid::new_v4().to_string(),
                };
                match handler.handle(message).await {
                    Disposition::Ack => {
                        self.acked.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    Disposition::Redeliver => {
                        self.redelivered.fetch_add(1, Ordering::SeqCst);
                        redeliveries += 1;
                        if redeliveries >= self.redelivery_cap {
                            debug!(durable = %durable, "Redelivery cap reached, parking message");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        durable_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = *self.subscribe_delay.read().await {
            tokio::time::sleep(delay).await;
        }

        if let Some(fail) = self.fail_subscribe.read().await.as_ref() {
            if durable_name.contains(&fail.needle) {
                return Err(fail.error.clone());
            }
        }

        let handle = SubscriptionHandle::new(durable_name);
        self.subs.write().await.insert(
            handle.id(),
            ActiveSub {
                subject: subject.to_string(),
                queue_group: queue_group.to_string(),
                durable_name: durable_name.to_string(),
                handler,
            },
        );
        info!(subject, durable = durable_name, "Memory subscription opened");
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle, forget_durable: bool) -> Result<()> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);

        let removed = self.subs.write().await.remove(&handle.id());
        if removed.is_none() {
            debug!(durable = handle.durable_name(), "Unsubscribe on closed handle");
            return Ok(());
        }
        if forget_durable {
            self.forgotten_durables
                .write()
                .await
                .push(handle.durable_name().to_string());
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.published
            .write()
            .await
            .push((subject.to_string(), payload.clone()));
        self.deliver(subject, &payload).await;
        Ok(())
    }
}
