//! Message forwarding to subscriber endpoints.
//!
//! The [`Forwarder`] drives a received message to a terminal outcome:
//! delivered (with optional reply forwarding), dead-lettered, or failed.
//! Acknowledgment to the broker is decided only from that terminal
//! outcome, so a crash mid-retry leaves the message unacked and the
//! broker redelivers it (at-least-once).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerMessage};
use crate::channel::{ForwardTarget, SubscriberSpec};

pub mod http;

pub use http::HttpTransport;

/// Correlation header propagated on every delivery.
pub const CORRELATION_HEADER: &str = "Natschan-Correlation-Id";
/// Failure detail header attached to dead-lettered messages.
pub const ERROR_HEADER: &str = "Natschan-Error";
/// Attempt count header attached to dead-lettered messages.
pub const ATTEMPTS_HEADER: &str = "Natschan-Attempts";

/// Errors from one delivery attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// Transient: connect errors, timeouts, 429, 5xx. Drives the retry loop.
    #[error("Retryable delivery failure: {reason}")]
    Retryable {
        status: Option<u16>,
        reason: String,
    },

    /// Permanent: other non-2xx statuses, malformed endpoints. Short-circuits
    /// to dead-letter or final failure.
    #[error("Permanent delivery failure: {reason}")]
    Permanent {
        status: Option<u16>,
        reason: String,
    },
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Response observed by a delivery transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Polymorphic delivery capability.
///
/// HTTP is the one implemented transport; the reconciliation algorithm
/// never touches this seam, so alternate transports slot in without
/// changing it. Implementations return `Ok` only for success statuses and
/// classify everything else as retryable or permanent.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        payload: Bytes,
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> Result<TransportResponse, DeliveryError>;
}

/// How reply forwarding went for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// No reply target configured, or the response body was empty.
    None,
    Forwarded,
    /// Reply forwarding failed. Does not affect acknowledgment of the
    /// original message.
    Failed(String),
}

/// Terminal result of delivering one message to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered {
        reply: ReplyOutcome,
    },
    DeadLettered {
        attempts: u32,
        reason: String,
    },
    Failed {
        attempts: u32,
        reason: String,
    },
}

impl DispatchOutcome {
    /// Whether the original message should be acknowledged to the broker.
    ///
    /// `Failed` leaves the message unacked so the broker redelivers it;
    /// never acknowledge before the outcome is terminal.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Failure reason for status reporting, if any.
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Delivered { .. } => None,
            Self::DeadLettered { reason, .. } | Self::Failed { reason, .. } => Some(reason),
        }
    }
}

/// Forwards messages to subscriber endpoints with retry, reply routing and
/// dead-letter routing.
pub struct Forwarder {
    transport: Arc<dyn DeliveryTransport>,
    broker: Arc<dyn Broker>,
    max_backoff: Duration,
}

impl Forwarder {
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        broker: Arc<dyn Broker>,
        max_backoff: Duration,
    ) -> Self {
        Self {
            transport,
            broker,
            max_backoff,
        }
    }

    /// Deliver a message to a subscriber, driving it to a terminal outcome.
    ///
    /// Retryable failures are retried up to the spec's configured count
    /// with increasing backoff; exhausted retries and permanent failures
    /// route to the dead-letter target when one is configured. Tolerates
    /// duplicate invocations for the same message.
    pub async fn deliver(&self, message: &BrokerMessage, spec: &SubscriberSpec) -> DispatchOutcome {
        let options = &spec.options;
        let mut attempt = 0u32;

        let final_error = loop {
            attempt += 1;
            match self.attempt(message, spec).await {
                Ok(response) => {
                    debug!(
                        subscriber = %spec.subscriber,
                        status = response.status,
                        attempt,
                        "Message delivered"
                    );
                    let reply = self.forward_reply(message, spec, response.body).await;
                    return DispatchOutcome::Delivered { reply };
                }
                Err(err) if err.is_retryable() && attempt <= options.retries => {
                    let delay = options.delay_for(attempt, self.max_backoff);
                    warn!(
                        subscriber = %spec.subscriber,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Delivery failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break err,
            }
        };

        self.finalize_failure(message, spec, attempt, final_error)
            .await
    }

    async fn attempt(
        &self,
        message: &BrokerMessage,
        spec: &SubscriberSpec,
    ) -> Result<TransportResponse, DeliveryError> {
        let headers = [(CORRELATION_HEADER, message.correlation_id.clone())];
        self.transport
            .post(
                &spec.subscriber,
                message.payload.clone(),
                &headers,
                spec.options.timeout(),
            )
            .await
    }

    /// Forward a non-empty response body to the reply target, if any.
    async fn forward_reply(
        &self,
        message: &BrokerMessage,
        spec: &SubscriberSpec,
        body: Bytes,
    ) -> ReplyOutcome {
        let Some(target) = &spec.reply else {
            return ReplyOutcome::None;
        };
        if body.is_empty() {
            return ReplyOutcome::None;
        }

        let headers = [(CORRELATION_HEADER, message.correlation_id.clone())];
        match self
            .forward(target, body, &headers, spec.options.timeout())
            .await
        {
            Ok(()) => {
                debug!(subscriber = %spec.subscriber, "Reply forwarded");
                ReplyOutcome::Forwarded
            }
            Err(reason) => {
                warn!(
                    subscriber = %spec.subscriber,
                    error = %reason,
                    "Reply forwarding failed"
                );
                ReplyOutcome::Failed(reason)
            }
        }
    }

    /// Route an exhausted or permanent failure to the dead-letter target,
    /// or surface a final failure.
    async fn finalize_failure(
        &self,
        message: &BrokerMessage,
        spec: &SubscriberSpec,
        attempts: u32,
        error: DeliveryError,
    ) -> DispatchOutcome {
        let reason = error.to_string();

        let Some(target) = &spec.dead_letter else {
            error!(
                subscriber = %spec.subscriber,
                attempts,
                error = %reason,
                "Delivery failed, no dead-letter target"
            );
            return DispatchOutcome::Failed { attempts, reason };
        };

        let headers = [
            (CORRELATION_HEADER, message.correlation_id.clone()),
            (ERROR_HEADER, reason.clone()),
            (ATTEMPTS_HEADER, attempts.to_string()),
        ];
        match self
            .forward(target, message.payload.clone(), &headers, spec.options.timeout())
            .await
        {
            Ok(()) => {
                warn!(
                    subscriber = %spec.subscriber,
                    attempts,
                    error = %reason,
                    "Message routed to dead letter"
                );
                DispatchOutcome::DeadLettered { attempts, reason }
            }
            Err(dl_error) => {
                error!(
                    subscriber = %spec.subscriber,
                    attempts,
                    error = %dl_error,
                    "Dead-letter forwarding failed"
                );
                DispatchOutcome::Failed {
                    attempts,
                    reason: format!("{} (dead letter failed: {})", reason, dl_error),
                }
            }
        }
    }

    /// Forward a payload to an HTTP or subject target. Subject targets go
    /// through the broker and cannot carry headers.
    async fn forward(
        &self,
        target: &ForwardTarget,
        payload: Bytes,
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> Result<(), String> {
        match target {
            ForwardTarget::Http(url) => self
                .transport
                .post(url, payload, headers, timeout)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            ForwardTarget::Subject(subject) => self
                .broker
                .publish(subject, payload)
                .await
                .map_err(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests;
