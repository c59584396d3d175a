//! Channel and subscriber domain types.
//!
//! A channel is a logical message topic backed by exactly one broker
//! subject. Subscribers are HTTP endpoints declared on a channel, each with
//! its own delivery tuning and optional reply / dead-letter routing.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifies one logical channel: a namespace/name pair.
///
/// Maps 1:1 to a broker subject. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub namespace: String,
    pub name: String,
}

impl ChannelRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Broker subject for this channel.
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.{}.{}", prefix, self.namespace, self.name)
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Backoff policy between redelivery attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Base delay doubling per attempt.
    #[default]
    Exponential,
    /// Base delay multiplied by the attempt number.
    Linear,
}

/// Delivery tuning for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryOptions {
    /// Redelivery attempts after the first failure.
    pub retries: u32,
    /// Backoff policy between attempts.
    pub backoff_policy: BackoffPolicy,
    /// Base backoff delay in milliseconds.
    pub backoff_delay_ms: u64,
    /// Per-attempt request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_policy: BackoffPolicy::Exponential,
            backoff_delay_ms: 200,
            timeout_ms: 10_000,
        }
    }
}

impl DeliveryOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_delay_ms)
    }

    /// Delay before the given retry (1-based attempt number), capped at `cap`.
    ///
    /// Strictly increasing until the cap is reached, for both policies.
    pub fn delay_for(&self, attempt: u32, cap: Duration) -> Duration {
        let attempt = attempt.max(1);
        let base = self.backoff_delay();
        let delay = match self.backoff_policy {
            // Shift capped well below u32::BITS; the cap bounds the result anyway.
            BackoffPolicy::Exponential => base.saturating_mul(1u32 << (attempt - 1).min(16)),
            BackoffPolicy::Linear => base.saturating_mul(attempt),
        };
        delay.min(cap)
    }
}

/// Destination for reply or dead-letter forwarding.
///
/// Replies and dead letters can target either an HTTP endpoint (POSTed via
/// the delivery transport) or a broker subject (published through the
/// broker connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardTarget {
    Http(String),
    Subject(String),
}

/// One declared subscription on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberSpec {
    /// HTTP delivery endpoint.
    pub subscriber: String,
    /// Disambiguating UID supplied by the control plane.
    #[serde(default)]
    pub uid: Option<String>,
    /// Where 2xx response bodies are forwarded.
    #[serde(default)]
    pub reply: Option<ForwardTarget>,
    /// Where permanently failed messages are routed.
    #[serde(default)]
    pub dead_letter: Option<ForwardTarget>,
    #[serde(default)]
    pub options: DeliveryOptions,
}

impl SubscriberSpec {
    pub fn new(subscriber: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            uid: None,
            reply: None,
            dead_letter: None,
            options: DeliveryOptions::default(),
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_reply(mut self, reply: ForwardTarget) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: ForwardTarget) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Identity of this subscriber within its channel.
    ///
    /// The UID when supplied, else the endpoint. Two specs with the same
    /// identity but different options are a replace, not an add + remove.
    pub fn identity(&self) -> &str {
        self.uid.as_deref().unwrap_or(&self.subscriber)
    }
}

/// Durable consumer name for a (channel, subscriber identity) pair.
///
/// Deterministic so broker-side delivery position survives process
/// restarts and redeploys resume rather than duplicate or drop messages.
pub fn durable_name(channel: &ChannelRef, identity: &str) -> String {
    format!(
        "{}-{}-{}",
        sanitize(&channel.namespace),
        sanitize(&channel.name),
        sanitize(identity)
    )
}

/// Replace anything outside the broker's durable-name alphabet.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Health of one live subscription as observed by the delivery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberHealth {
    Ready,
    NotReady(String),
}

/// Per-subscriber readiness reported back to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberStatus {
    pub ready: bool,
    /// Human-readable reason when not ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SubscriberStatus {
    pub fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
        }
    }

    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
        }
    }
}
