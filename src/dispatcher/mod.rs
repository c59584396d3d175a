//! Subscription-set reconciliation.
//!
//! The [`Dispatcher`] owns one broker connection and, per channel, the set
//! of live subscriptions. Callers declare the desired subscriber set for a
//! channel; the dispatcher diffs it against the live set, opens and closes
//! durable subscriptions to converge, and reports per-subscriber readiness.
//! A failure on one subscriber never blocks reconciliation of its siblings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broker::{
    Broker, BrokerError, BrokerMessage, Disposition, MessageHandler, SubscriptionHandle,
};
use crate::channel::{
    durable_name, ChannelRef, SubscriberHealth, SubscriberSpec, SubscriberStatus,
};
use crate::config::Config;
use crate::forwarder::{DeliveryTransport, Forwarder};

/// Errors surfaced by dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The reconcile deadline elapsed. The live set may be partially
    /// converged; the call is safe to retry.
    #[error("Reconciliation timed out for channel {channel}")]
    Timeout { channel: ChannelRef },
}

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatcherError>;

/// One live subscription: the declared spec it was opened from, the broker
/// handle, and the health cell the delivery path writes into.
struct LiveSubscription {
    spec: SubscriberSpec,
    handle: SubscriptionHandle,
    health: Arc<RwLock<SubscriberHealth>>,
}

#[derive(Default)]
struct ChannelState {
    /// Live subscriptions keyed by subscriber identity.
    subscriptions: HashMap<String, LiveSubscription>,
    /// Set under the state lock when the channel is torn down. A caller
    /// that acquired this state's lock afterwards must start over on a
    /// fresh entry instead of reviving this one.
    removed: bool,
}

/// Delivery callback bound to one subscription.
///
/// Runs the forwarder for each message, records the observed health, and
/// acks only on a terminal outcome.
struct DeliveryHandler {
    forwarder: Arc<Forwarder>,
    spec: Arc<SubscriberSpec>,
    health: Arc<RwLock<SubscriberHealth>>,
}

impl MessageHandler for DeliveryHandler {
    fn handle(&self, message: BrokerMessage) -> BoxFuture<'static, Disposition> {
        let forwarder = self.forwarder.clone();
        let spec = self.spec.clone();
        let health = self.health.clone();
        Box::pin(async move {
            let outcome = forwarder.deliver(&message, &spec).await;
            let observed = match outcome.failure_reason() {
                None => SubscriberHealth::Ready,
                Some(reason) => SubscriberHealth::NotReady(reason.to_string()),
            };
            *health.write().await = observed;
            if outcome.should_ack() {
                Disposition::Ack
            } else {
                Disposition::Redeliver
            }
        })
    }
}

/// Bridges channel declarations to live broker subscriptions.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    forwarder: Arc<Forwarder>,
    subject_prefix: String,
    reconcile_timeout: Duration,
    channels: RwLock<HashMap<ChannelRef, Arc<Mutex<ChannelState>>>>,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        transport: Arc<dyn DeliveryTransport>,
        config: &Config,
    ) -> Self {
        let forwarder = Arc::new(Forwarder::new(
            transport,
            broker.clone(),
            config.dispatcher.max_backoff(),
        ));
        Self {
            broker,
            forwarder,
            subject_prefix: config.broker.subject_prefix.clone(),
            reconcile_timeout: config.dispatcher.reconcile_timeout(),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Converge the channel's live subscriptions onto `desired` and report
    /// per-subscriber readiness.
    ///
    /// Subscribe failures are isolated: the affected subscriber is reported
    /// not ready while its siblings reconcile normally. Only a broker
    /// connection failure or the reconcile deadline aborts the call; both
    /// leave the live set in a consistent, retryable state.
    pub async fn update_subscriptions(
        &self,
        channel: &ChannelRef,
        desired: &[SubscriberSpec],
    ) -> Result<HashMap<String, SubscriberStatus>> {
        let reconcile = async {
            loop {
                let state = {
                    let mut channels = self.channels.write().await;
                    channels
                        .entry(channel.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(ChannelState::default())))
                        .clone()
                };
                let mut guard = state.lock().await;
                // A removal may have torn this state down while we waited
                // for its lock. Evict the stale entry if it is still
                // indexed (a removal cut short by its deadline leaves it
                // behind) and start over on a fresh one.
                if guard.removed {
                    let mut channels = self.channels.write().await;
                    if channels
                        .get(channel)
                        .is_some_and(|current| Arc::ptr_eq(current, &state))
                    {
                        channels.remove(channel);
                    }
                    continue;
                }
                break self.reconcile(channel, &mut guard, desired).await;
            }
        };
        match tokio::time::timeout(self.reconcile_timeout, reconcile).await {
            Ok(result) => result,
            Err(_) => Err(DispatcherError::Timeout {
                channel: channel.clone(),
            }),
        }
    }

    /// Tear down every subscription for a channel and delete the
    /// broker-side durable state.
    ///
    /// Idempotent: removing an untracked channel is a no-op. On timeout the
    /// remaining subscriptions stay tracked so a retry finishes the job.
    pub async fn remove_channel(&self, channel: &ChannelRef) -> Result<()> {
        let Some(state) = self.channels.read().await.get(channel).cloned() else {
            debug!(channel = %channel, "Remove for untracked channel");
            return Ok(());
        };

        let close_all = async {
            let mut guard = state.lock().await;
            let identities: Vec<String> = guard.subscriptions.keys().cloned().collect();
            for identity in identities {
                if let Some(live) = guard.subscriptions.remove(&identity) {
                    if let Err(e) = self.broker.unsubscribe(&live.handle, true).await {
                        warn!(
                            channel = %channel,
                            identity = %identity,
                            error = %e,
                            "Failed to close subscription during channel removal"
                        );
                    }
                }
            }
            guard.removed = true;
            // Delete the map entry while the state lock is still held, so
            // an update queued behind this removal lands on fresh state
            // rather than the one being torn down.
            let mut channels = self.channels.write().await;
            if channels
                .get(channel)
                .is_some_and(|current| Arc::ptr_eq(current, &state))
            {
                channels.remove(channel);
            }
        };
        if tokio::time::timeout(self.reconcile_timeout, close_all)
            .await
            .is_err()
        {
            return Err(DispatcherError::Timeout {
                channel: channel.clone(),
            });
        }

        info!(channel = %channel, "Channel removed");
        Ok(())
    }

    /// Close every subscription without deleting broker-side durable state,
    /// so a restarted dispatcher resumes delivery where it left off.
    pub async fn shutdown(&self) {
        let states: Vec<_> = self.channels.write().await.drain().collect();
        for (channel, state) in states {
            let mut state = state.lock().await;
            state.removed = true;
            for (identity, live) in state.subscriptions.drain() {
                if let Err(e) = self.broker.unsubscribe(&live.handle, false).await {
                    warn!(
                        channel = %channel,
                        identity = %identity,
                        error = %e,
                        "Failed to close subscription during shutdown"
                    );
                }
            }
        }
        info!("Dispatcher shut down");
    }

    async fn reconcile(
        &self,
        channel: &ChannelRef,
        state: &mut ChannelState,
        desired: &[SubscriberSpec],
    ) -> Result<HashMap<String, SubscriberStatus>> {
        let mut desired_map: HashMap<String, SubscriberSpec> = HashMap::new();
        for spec in desired {
            if desired_map
                .insert(spec.identity().to_string(), spec.clone())
                .is_some()
            {
                warn!(
                    channel = %channel,
                    identity = spec.identity(),
                    "Duplicate subscriber identity, keeping the last declaration"
                );
            }
        }

        // Close subscriptions that are no longer declared. Their durable
        // state goes with them: a re-added subscriber starts fresh rather
        // than replaying everything since it was removed.
        let removed: Vec<String> = state
            .subscriptions
            .keys()
            .filter(|identity| !desired_map.contains_key(*identity))
            .cloned()
            .collect();
        for identity in removed {
            if let Some(live) = state.subscriptions.remove(&identity) {
                info!(channel = %channel, identity = %identity, "Closing subscription");
                if let Err(e) = self.broker.unsubscribe(&live.handle, true).await {
                    warn!(
                        channel = %channel,
                        identity = %identity,
                        error = %e,
                        "Failed to close subscription"
                    );
                }
            }
        }

        let mut failures: HashMap<String, String> = HashMap::new();
        for (identity, spec) in &desired_map {
            match state.subscriptions.get(identity) {
                Some(live) if live.spec == *spec => {
                    debug!(channel = %channel, identity = %identity, "Subscription unchanged");
                }
                Some(_) => {
                    // Spec changed: open the replacement before closing the
                    // old subscription so delivery never drops to zero. The
                    // durable name is unchanged, so the delivery position
                    // carries over.
                    match self.open(channel, spec).await {
                        Ok(new_live) => {
                            if let Some(old) = state.subscriptions.insert(identity.clone(), new_live)
                            {
                                if let Err(e) = self.broker.unsubscribe(&old.handle, false).await {
                                    warn!(
                                        channel = %channel,
                                        identity = %identity,
                                        error = %e,
                                        "Failed to close replaced subscription"
                                    );
                                }
                            }
                            info!(channel = %channel, identity = %identity, "Subscription replaced");
                        }
                        Err(e @ BrokerError::Connection(_)) => return Err(e.into()),
                        Err(e) => {
                            warn!(
                                channel = %channel,
                                identity = %identity,
                                error = %e,
                                "Failed to replace subscription, keeping the previous one"
                            );
                            failures.insert(identity.clone(), e.to_string());
                        }
                    }
                }
                None => match self.open(channel, spec).await {
                    Ok(live) => {
                        state.subscriptions.insert(identity.clone(), live);
                        info!(channel = %channel, identity = %identity, "Subscription opened");
                    }
                    Err(e @ BrokerError::Connection(_)) => return Err(e.into()),
                    Err(e) => {
                        warn!(
                            channel = %channel,
                            identity = %identity,
                            error = %e,
                            "Failed to open subscription"
                        );
                        failures.insert(identity.clone(), e.to_string());
                    }
                },
            }
        }

        let mut statuses = HashMap::new();
        for identity in desired_map.keys() {
            let status = if let Some(reason) = failures.get(identity) {
                SubscriberStatus::not_ready(reason.clone())
            } else if let Some(live) = state.subscriptions.get(identity) {
                match &*live.health.read().await {
                    SubscriberHealth::Ready => SubscriberStatus::ready(),
                    SubscriberHealth::NotReady(reason) => SubscriberStatus::not_ready(reason.clone()),
                }
            } else {
                SubscriberStatus::not_ready("Subscription not established")
            };
            statuses.insert(identity.clone(), status);
        }
        Ok(statuses)
    }

    /// Open one durable subscription for a subscriber.
    ///
    /// Each subscriber gets its own queue group, so every subscriber
    /// receives every channel message, while replicas of one dispatcher
    /// share the work within the group.
    async fn open(
        &self,
        channel: &ChannelRef,
        spec: &SubscriberSpec,
    ) -> std::result::Result<LiveSubscription, BrokerError> {
        let subject = channel.subject(&self.subject_prefix);
        let durable = durable_name(channel, spec.identity());
        let health = Arc::new(RwLock::new(SubscriberHealth::Ready));
        let handler = Arc::new(DeliveryHandler {
            forwarder: self.forwarder.clone(),
            spec: Arc::new(spec.clone()),
            health: health.clone(),
        });

        let handle = self
            .broker
            .subscribe(&subject, &durable, &durable, handler)
            .await?;

        Ok(LiveSubscription {
            spec: spec.clone(),
            handle,
            health,
        })
    }
}
