//! HTTP delivery transport backed by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};

use super::{DeliveryError, DeliveryTransport, TransportResponse};

/// Content type for forwarded payloads; the dispatcher treats them as
/// opaque bytes.
const CONTENT_TYPE: &str = "application/octet-stream";

/// HTTP transport.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> reqwest::Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
        })
    }
}

/// Retry 429 (rate limit) and 5xx (server errors).
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Retry timeouts and connection errors; everything else (including
/// malformed endpoints) is permanent.
fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        payload: Bytes,
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> Result<TransportResponse, DeliveryError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", CONTENT_TYPE)
            .timeout(timeout)
            .body(payload);

        for (key, value) in headers {
            request = request.header(*key, value);
        }

        let response = request.send().await.map_err(|e| {
            if is_retryable_error(&e) {
                DeliveryError::Retryable {
                    status: None,
                    reason: e.to_string(),
                }
            } else {
                DeliveryError::Permanent {
                    status: None,
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Ok(TransportResponse {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.unwrap_or_default();
        let reason = format!(
            "HTTP {} - {}",
            status,
            body.chars().take(200).collect::<String>()
        );
        if is_retryable_status(status) {
            Err(DeliveryError::Retryable {
                status: Some(status.as_u16()),
                reason,
            })
        } else {
            Err(DeliveryError::Permanent {
                status: Some(status.as_u16()),
                reason,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status_codes() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));

        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::GONE));
    }
}
