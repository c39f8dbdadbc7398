//! HTTP delivery client for webhook attempts.
//!
//! Thin wrapper over a shared reqwest client. Each attempt posts a signed
//! JSON body with tracing headers and an overall per-request timeout taken
//! from the target's configuration. The client reports what the wire did;
//! classifying a response as success or failure is the dispatcher's job.

use std::time::{Duration, Instant};

use relay_core::{DeliveryId, EventId, EventType};

use crate::error::{DeliveryError, Result};

/// Bytes of response body captured for diagnostics.
const MAX_CAPTURED_BODY_BYTES: usize = 64 * 1024;

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// User-Agent header sent with every request.
    pub user_agent: String,
    /// Connect-phase timeout, separate from the per-request total.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("relay-webhooks/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A single outbound attempt, fully resolved before any I/O happens.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,
    /// Event being forwarded.
    pub event_id: EventId,
    /// Event type, echoed in a header for cheap receiver-side routing.
    pub event_type: EventType,
    /// 1-based attempt number.
    pub attempt_number: i32,
    /// Destination URL.
    pub url: String,
    /// Serialized envelope body.
    pub body: String,
    /// Unix-seconds timestamp the signature was computed over.
    pub timestamp: i64,
    /// Signature header value.
    pub signature: String,
    /// Total request timeout for this attempt.
    pub timeout: Duration,
}

/// What the target endpoint sent back.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, capped at capture.
    pub body: String,
    /// Wall-clock duration of the round trip.
    pub duration: Duration,
}

/// Shared HTTP client for webhook dispatch.
///
/// Cheap to clone; all clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
}

impl DeliveryClient {
    /// Builds a client from configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::configuration(format!("http client build: {e}")))?;
        Ok(Self { http })
    }

    /// Performs one delivery attempt.
    ///
    /// Returns `Ok` whenever the target produced an HTTP response,
    /// whatever the status code. `Err` means the request never completed:
    /// connection failure, TLS failure, or timeout.
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse> {
        let started = Instant::now();
        let response = self
            .http
            .post(&request.url)
            .timeout(request.timeout)
            .header("Content-Type", "application/json")
            .header("X-Event-Id", request.event_id.to_string())
            .header("X-Event-Type", request.event_type.as_str())
            .header("X-Delivery-Id", request.delivery_id.to_string())
            .header("X-Attempt", request.attempt_number.to_string())
            .header("X-Timestamp", request.timestamp.to_string())
            .header("X-Signature", request.signature.clone())
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| Self::classify_send_error(e, request.timeout))?;

        let status_code = response.status().as_u16();
        let body = Self::capture_body(response).await;

        Ok(DeliveryResponse {
            status_code,
            body,
            duration: started.elapsed(),
        })
    }

    fn classify_send_error(err: reqwest::Error, timeout: Duration) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::timeout(timeout.as_millis() as u64)
        } else if err.is_connect() {
            DeliveryError::network(format!("connection failed: {err}"))
        } else {
            DeliveryError::network(err.to_string())
        }
    }

    async fn capture_body(response: reqwest::Response) -> String {
        match response.bytes().await {
            Ok(bytes) => {
                let slice = &bytes[..bytes.len().min(MAX_CAPTURED_BODY_BYTES)];
                String::from_utf8_lossy(slice).into_owned()
            }
            // The status line already arrived; a failed body read should
            // not turn the attempt into a network error.
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_identifies_the_product() {
        let config = ClientConfig::default();
        assert!(config.user_agent.starts_with("relay-webhooks/"));
    }
}
